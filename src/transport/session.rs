//! # Session Lifecycle
//!
//! A [`Session`] owns at most one live connection at a time and survives across several
//! underlying connections.
//!
//! ## Connection States:
//! - **Disconnected**: no socket; sends return `false`
//! - **Connecting**: an open (explicit or reconnect) is in flight
//! - **Open**: frames flow, the heartbeat is running
//! - **Closing**: an operator disconnect is being announced to subscribers
//!
//! ## Supervisor Task:
//! Each successful `connect()` spawns one supervisor that reads inbound frames, sends the
//! `PING` heartbeat and, when the connection drops without an operator disconnect,
//! reconnects after a fixed delay until the attempt ceiling is reached. Every explicit
//! `connect()`/`disconnect()` starts a new generation; work belonging to an older
//! generation stops at its next checkpoint.

use super::connector::{Connection, Connector};
use super::message::{classify, ControlCommand, Envelope, Frame, Inbound, Message, Origin, Payload};
use super::SessionConfig;
use crate::error::{ChannelError, ChannelResult};
use crate::observer::{Observers, Subscription};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Connection notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened,
    /// `by_operator` is `true` for `disconnect()`, `false` for an unexpected drop
    Closed { by_operator: bool },
}

/// Transport session handle. Clones share the same connection and subscribers.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    connector: Arc<dyn Connector>,
    config: Mutex<SessionConfig>,
    link: Mutex<Link>,
    messages: Observers<Message>,
    connection: Observers<ConnectionEvent>,
    errors: Observers<ChannelError>,
}

struct Link {
    state: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    manual_close: bool,
    reconnect_attempts: u32,
    generation: u64,
    supervisor: Option<JoinHandle<()>>,
    last_pong: Option<DateTime<Utc>>,
}

impl Link {
    fn release(&mut self) {
        self.outbound = None;
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && !self.manual_close
    }
}

impl Session {
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                connector,
                config: Mutex::new(config),
                link: Mutex::new(Link {
                    state: ConnectionState::Disconnected,
                    outbound: None,
                    manual_close: false,
                    reconnect_attempts: 0,
                    generation: 0,
                    supervisor: None,
                    last_pong: None,
                }),
                messages: Observers::new("session.messages"),
                connection: Observers::new("session.connection"),
                errors: Observers::new("session.errors"),
            }),
        }
    }

    /// Open the connection. Resolves once the socket is ready, rejects on immediate
    /// failure. A failed explicit connect does not schedule reconnects.
    pub async fn connect(&self) -> ChannelResult<()> {
        let url = self.inner.config().endpoint_url()?;

        let generation = {
            let mut link = self.inner.link();
            if link.state == ConnectionState::Open {
                debug!("Session already connected");
                return Ok(());
            }
            link.release();
            link.generation += 1;
            link.manual_close = false;
            link.state = ConnectionState::Connecting;
            link.generation
        };

        info!("Connecting to {}", url);
        let connection = match self.inner.connector.open(&url).await {
            Ok(connection) => connection,
            Err(e) => {
                let mut link = self.inner.link();
                if link.generation == generation {
                    link.state = ConnectionState::Disconnected;
                }
                error!("Connection to {} failed: {}", url, e);
                return Err(e);
            }
        };

        {
            let mut link = self.inner.link();
            if link.generation != generation {
                return Err(ChannelError::Connectivity(
                    "Connection attempt superseded".to_string(),
                ));
            }
            link.state = ConnectionState::Open;
            link.outbound = Some(connection.outbound.clone());
            link.reconnect_attempts = 0;
            link.supervisor = Some(tokio::spawn(supervise(
                Arc::downgrade(&self.inner),
                generation,
                connection,
            )));
        }

        info!("Session connected");
        self.inner.connection.notify(&ConnectionEvent::Opened);
        Ok(())
    }

    /// Close the connection and suppress reconnection. Idempotent.
    pub fn disconnect(&self) {
        let (was_live, generation) = {
            let mut link = self.inner.link();
            link.manual_close = true;
            link.generation += 1;
            let was_live = link.state != ConnectionState::Disconnected;
            link.release();
            link.state = if was_live {
                ConnectionState::Closing
            } else {
                ConnectionState::Disconnected
            };
            (was_live, link.generation)
        };

        if !was_live {
            return;
        }

        info!("Session disconnected");
        self.inner
            .connection
            .notify(&ConnectionEvent::Closed { by_operator: true });

        let mut link = self.inner.link();
        if link.generation == generation {
            link.state = ConnectionState::Disconnected;
        }
    }

    /// Send a text message. With `raw` the payload goes out verbatim; otherwise it is
    /// wrapped in a TEXT envelope and echoed to message subscribers.
    pub fn send_text(&self, payload: &str, raw: bool) -> bool {
        if raw {
            return self.send_frame(Frame::Text(payload.to_string()));
        }
        self.send_message(Message::new(Payload::Text(payload.to_string()), Origin::User))
    }

    /// Send an IMAGES envelope and echo it to message subscribers.
    pub fn send_images(&self, urls: Vec<String>) -> bool {
        self.send_message(Message::new(Payload::Images(urls), Origin::User))
    }

    /// Send raw audio as a binary frame. No envelope, no echo.
    pub fn send_audio(&self, bytes: Vec<u8>) -> bool {
        self.send_frame(Frame::Binary(bytes))
    }

    pub fn send_control(&self, command: ControlCommand) -> bool {
        let json = match Envelope::control(&command).to_json() {
            Ok(json) => json,
            Err(e) => {
                self.inner.errors.notify(&e);
                return false;
            }
        };

        let sent = self.send_frame(Frame::Text(json));
        if sent {
            debug!("Control sent: {}", command);
        }
        sent
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.link().state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.link().reconnect_attempts
    }

    /// When the server last answered a heartbeat.
    pub fn last_pong(&self) -> Option<DateTime<Utc>> {
        self.inner.link().last_pong
    }

    pub fn config(&self) -> SessionConfig {
        self.inner.config().clone()
    }

    /// Replace the endpoint settings. Applies from the next connect or reconnect.
    pub fn update_config(&self, config: SessionConfig) {
        *self.inner.config() = config;
    }

    pub fn on_message<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.inner.messages.subscribe(callback)
    }

    pub fn on_connection<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.connection.subscribe(callback)
    }

    pub fn on_error<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChannelError) + Send + Sync + 'static,
    {
        self.inner.errors.subscribe(callback)
    }

    fn send_message(&self, mut message: Message) -> bool {
        if !self.is_connected() {
            debug!("Dropping {:?} message, session not connected", message.kind());
            return false;
        }

        let json = match Envelope::from_message(&message).map(|envelope| envelope.to_json()) {
            Some(Ok(json)) => json,
            Some(Err(e)) => {
                self.inner.errors.notify(&e);
                return false;
            }
            None => return false,
        };

        if !self.send_frame(Frame::Text(json)) {
            return false;
        }
        message.local = true;
        self.inner.messages.notify(&message);
        true
    }

    fn send_frame(&self, frame: Frame) -> bool {
        let sent = {
            let link = self.inner.link();
            match (&link.state, &link.outbound) {
                (ConnectionState::Open, Some(outbound)) => outbound.send(frame).is_ok(),
                _ => {
                    debug!("Frame dropped, session not connected");
                    return false;
                }
            }
        };

        if !sent {
            warn!("Socket closed while sending");
        }
        sent
    }
}

impl SessionInner {
    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn config(&self) -> MutexGuard<'_, SessionConfig> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, frame: Frame) {
        match classify(frame) {
            Ok(Inbound::Message(message)) => self.messages.notify(&message),
            Ok(Inbound::Pong) => {
                self.link().last_pong = Some(Utc::now());
                debug!("Heartbeat acknowledged");
            }
            Ok(Inbound::Ping) => debug!("Server heartbeat received"),
            Err(e) => {
                warn!("Discarding inbound frame: {}", e);
                self.errors.notify(&e);
            }
        }
    }

    /// Record an unexpected drop. Returns `false` when the generation is stale or the
    /// operator already closed the session.
    fn connection_lost(&self, generation: u64) -> bool {
        {
            let mut link = self.link();
            if !link.is_current(generation) {
                return false;
            }
            link.state = ConnectionState::Disconnected;
            link.outbound = None;
        }

        warn!("Connection lost");
        self.connection
            .notify(&ConnectionEvent::Closed { by_operator: false });
        true
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let link = self.link.get_mut().unwrap_or_else(PoisonError::into_inner);
        link.release();
    }
}

async fn supervise(session: Weak<SessionInner>, generation: u64, mut connection: Connection) {
    loop {
        let Some(inner) = session.upgrade() else {
            return;
        };
        let heartbeat = inner.config().heartbeat_interval;
        drop(inner);

        pump(&session, &mut connection, heartbeat).await;
        drop(connection);

        let Some(inner) = session.upgrade() else {
            return;
        };
        if !inner.connection_lost(generation) {
            return;
        }
        drop(inner);

        connection = match reconnect(&session, generation).await {
            Some(connection) => connection,
            None => return,
        };
    }
}

/// Read frames and send heartbeats until the connection closes.
async fn pump(session: &Weak<SessionInner>, connection: &mut Connection, heartbeat: Duration) {
    let mut ticker = time::interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = connection.inbound.recv() => {
                let Some(frame) = frame else {
                    return;
                };
                let Some(inner) = session.upgrade() else {
                    return;
                };
                inner.dispatch(frame);
            }
            _ = ticker.tick() => {
                if session.strong_count() == 0 {
                    return;
                }
                if let Ok(ping) = Envelope::ping().to_json() {
                    if connection.outbound.send(Frame::Text(ping)).is_err() {
                        return;
                    }
                    debug!("Heartbeat sent");
                }
            }
        }
    }
}

/// Retry with a fixed delay until a connection opens, the generation goes stale or the
/// attempt ceiling is reached.
async fn reconnect(session: &Weak<SessionInner>, generation: u64) -> Option<Connection> {
    loop {
        let (connector, delay, attempt, max_attempts) = {
            let inner = session.upgrade()?;
            let config = inner.config().clone();
            let mut link = inner.link();
            if !link.is_current(generation) {
                return None;
            }
            if link.reconnect_attempts >= config.max_reconnect_attempts {
                let attempts = link.reconnect_attempts;
                drop(link);
                error!("Giving up after {} reconnect attempts", attempts);
                inner
                    .errors
                    .notify(&ChannelError::ReconnectExhausted { attempts });
                return None;
            }
            link.reconnect_attempts += 1;
            (
                Arc::clone(&inner.connector),
                config.reconnect_delay,
                link.reconnect_attempts,
                config.max_reconnect_attempts,
            )
        };

        info!("Reconnecting in {:?} (attempt {}/{})", delay, attempt, max_attempts);
        time::sleep(delay).await;

        let url = {
            let inner = session.upgrade()?;
            let url = inner.config().endpoint_url();
            let mut link = inner.link();
            if !link.is_current(generation) {
                return None;
            }
            link.state = ConnectionState::Connecting;
            url
        };

        let result = match url {
            Ok(url) => connector.open(&url).await,
            Err(e) => Err(e),
        };

        let inner = session.upgrade()?;
        match result {
            Ok(connection) => {
                {
                    let mut link = inner.link();
                    if !link.is_current(generation) {
                        return None;
                    }
                    link.state = ConnectionState::Open;
                    link.outbound = Some(connection.outbound.clone());
                    link.reconnect_attempts = 0;
                }
                info!("Reconnected after {} attempt(s)", attempt);
                inner.connection.notify(&ConnectionEvent::Opened);
                return Some(connection);
            }
            Err(e) => {
                let mut link = inner.link();
                if link.is_current(generation) {
                    link.state = ConnectionState::Disconnected;
                }
                warn!("Reconnect attempt {} failed: {}", attempt, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Server side of an in-memory connection.
    struct ServerEnd {
        to_client: mpsc::UnboundedSender<Frame>,
        from_client: mpsc::UnboundedReceiver<Frame>,
    }

    /// Accepts the first `accept` opens and refuses the rest.
    struct FakeConnector {
        accept: usize,
        opens: AtomicUsize,
        servers: mpsc::UnboundedSender<ServerEnd>,
    }

    impl Connector for FakeConnector {
        fn open(&self, _url: &str) -> BoxFuture<'static, ChannelResult<Connection>> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            let servers = self.servers.clone();
            let accept = n < self.accept;
            Box::pin(async move {
                if !accept {
                    return Err(ChannelError::Connectivity("refused".to_string()));
                }
                let (to_client, inbound) = mpsc::unbounded_channel();
                let (outbound, from_client) = mpsc::unbounded_channel();
                let _ = servers.send(ServerEnd { to_client, from_client });
                Ok(Connection { outbound, inbound })
            })
        }
    }

    fn session(accept: usize) -> (Session, Arc<FakeConnector>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (servers, server_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(FakeConnector {
            accept,
            opens: AtomicUsize::new(0),
            servers,
        });
        let session = Session::new(ClientConfig::default().session_config(), connector.clone());
        (session, connector, server_rx)
    }

    fn collect<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |value: &T| sink.lock().unwrap().push(value.clone()))
    }

    async fn settle() {
        time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_send() {
        let (session, _connector, mut servers) = session(1);
        let (messages, on_message) = collect::<Message>();
        let _sub = session.on_message(on_message);

        assert!(!session.send_text("too early", false));

        session.connect().await.unwrap();
        assert!(session.is_connected());
        let mut server = servers.recv().await.unwrap();

        assert!(session.send_text("hello", false));
        let Some(Frame::Text(json)) = server.from_client.recv().await else {
            panic!("expected a text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "TEXT");
        assert_eq!(value["content"], "hello");
        assert_eq!(value["sender"], "user");

        // Local echo
        assert_eq!(messages.lock().unwrap().len(), 1);
        assert_eq!(messages.lock().unwrap()[0].sender, Origin::User);
        assert!(messages.lock().unwrap()[0].local);

        assert!(session.send_text("verbatim", true));
        assert_eq!(server.from_client.recv().await, Some(Frame::Text("verbatim".to_string())));

        assert!(session.send_audio(vec![1, 2, 3]));
        assert_eq!(server.from_client.recv().await, Some(Frame::Binary(vec![1, 2, 3])));

        assert!(session.send_control(ControlCommand::Interrupt));
        assert_eq!(
            server.from_client.recv().await,
            Some(Frame::Text(r#"{"type":"CONTROL","content":"interrupt","sender":"user"}"#.to_string()))
        );

        // Raw, audio and control sends are not echoed
        assert_eq!(messages.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_classification() {
        let (session, _connector, mut servers) = session(1);
        let (messages, on_message) = collect::<Message>();
        let (errors, on_error) = collect::<ChannelError>();
        let _m = session.on_message(on_message);
        let _e = session.on_error(on_error);

        session.connect().await.unwrap();
        let server = servers.recv().await.unwrap();

        server.to_client.send(Frame::Binary(vec![0xFF, 0xFB])).unwrap();
        server.to_client.send(Frame::Text("ai:hi".to_string())).unwrap();
        server.to_client.send(Frame::Text(r#"{"type":"PONG"}"#.to_string())).unwrap();
        server.to_client.send(Frame::Text(r#"{"type":"NOPE"}"#.to_string())).unwrap();
        server
            .to_client
            .send(Frame::Text(r#"{"type":"CONTROL","content":"stop_recording"}"#.to_string()))
            .unwrap();
        settle().await;

        let messages = messages.lock().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].payload, Payload::Audio(vec![0xFF, 0xFB]));
        assert_eq!(messages[1].payload, Payload::Text("ai:hi".to_string()));
        assert_eq!(messages[2].payload, Payload::Control(ControlCommand::StopRecording));

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], ChannelError::Protocol(_)));

        assert!(session.last_pong().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_while_connected() {
        let (session, _connector, mut servers) = session(1);
        session.connect().await.unwrap();
        let mut server = servers.recv().await.unwrap();

        time::sleep(Duration::from_millis(29_000)).await;
        assert!(server.from_client.try_recv().is_err());

        time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(
            server.from_client.try_recv().ok(),
            Some(Frame::Text(r#"{"type":"PING"}"#.to_string()))
        );

        session.disconnect();
        time::sleep(Duration::from_secs(60)).await;
        // Heartbeat stopped and the socket was released
        assert!(server.from_client.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_drop_until_ceiling() {
        let (session, connector, mut servers) = session(1);
        let (events, on_connection) = collect::<ConnectionEvent>();
        let (errors, on_error) = collect::<ChannelError>();
        let _c = session.on_connection(on_connection);
        let _e = session.on_error(on_error);

        session.connect().await.unwrap();
        let server = servers.recv().await.unwrap();
        drop(server);
        settle().await;

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(
            events.lock().unwrap().last(),
            Some(&ConnectionEvent::Closed { by_operator: false })
        );

        time::sleep(Duration::from_millis(2_900)).await;
        assert_eq!(connector.opens.load(Ordering::SeqCst), 1);
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(connector.opens.load(Ordering::SeqCst), 2);

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.opens.load(Ordering::SeqCst), 6);
        assert_eq!(session.reconnect_attempts(), 5);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(
            *errors.lock().unwrap(),
            vec![ChannelError::ReconnectExhausted { attempts: 5 }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_restores_session() {
        let (session, connector, mut servers) = session(2);
        let (events, on_connection) = collect::<ConnectionEvent>();
        let _c = session.on_connection(on_connection);

        session.connect().await.unwrap();
        drop(servers.recv().await.unwrap());
        time::sleep(Duration::from_millis(3_100)).await;

        assert_eq!(connector.opens.load(Ordering::SeqCst), 2);
        assert!(session.is_connected());
        assert_eq!(session.reconnect_attempts(), 0);
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                ConnectionEvent::Opened,
                ConnectionEvent::Closed { by_operator: false },
                ConnectionEvent::Opened,
            ]
        );

        let mut server = servers.recv().await.unwrap();
        assert!(session.send_audio(vec![9]));
        assert_eq!(server.from_client.recv().await, Some(Frame::Binary(vec![9])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent_and_suppresses_reconnect() {
        let (session, connector, mut servers) = session(5);
        let (events, on_connection) = collect::<ConnectionEvent>();
        let _c = session.on_connection(on_connection);

        session.connect().await.unwrap();
        let _server = servers.recv().await.unwrap();

        session.disconnect();
        session.disconnect();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!session.send_audio(vec![1]));

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.opens.load(Ordering::SeqCst), 1);
        assert_eq!(
            *events.lock().unwrap(),
            vec![ConnectionEvent::Opened, ConnectionEvent::Closed { by_operator: true }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_rejects_without_retry() {
        let (session, connector, _servers) = session(0);

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, ChannelError::Connectivity(_)));
        assert_eq!(session.state(), ConnectionState::Disconnected);

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.opens.load(Ordering::SeqCst), 1);
    }
}
