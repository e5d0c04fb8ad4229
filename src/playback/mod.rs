//! # Playback
//!
//! Server audio arrives as MP3 fragments of arbitrary size and timing. The
//! [`Aggregator`] coalesces fragments that arrive close together into one playable unit
//! and plays units strictly one after another through an [`AudioRenderer`].
//!
//! ## Components:
//! - [`aggregator`]: quiet-window coalescing and the FIFO playback queue
//! - [`renderer`]: the renderer seam and its rodio implementation

pub mod aggregator;
pub mod renderer;

pub use aggregator::{Aggregator, PlaybackEvent};
pub use renderer::{AudioRenderer, RodioRenderer};

/// MPEG-1 Layer III frame sync, as sent by the server (`FF FB` or `FF F3`).
pub fn looks_like_mp3(bytes: &[u8]) -> bool {
    matches!(bytes, [0xFF, 0xFB, ..] | [0xFF, 0xF3, ..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mp3_sync_detection() {
        assert!(looks_like_mp3(&[0xFF, 0xFB, 0x90, 0x00]));
        assert!(looks_like_mp3(&[0xFF, 0xF3]));
        assert!(!looks_like_mp3(b"ID3"));
        assert!(!looks_like_mp3(&[0xFF]));
        assert!(!looks_like_mp3(&[]));
    }
}
