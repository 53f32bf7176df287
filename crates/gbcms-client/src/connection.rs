use crate::store::Store;
use crate::transport::{Link, LinkEvent, Transport};
use gbcms_core::validation::validate_chat_message;
use gbcms_core::wire::{decode_inbound_message, encode_chat_frame};
use gbcms_core::{ClientConfig, ClientError, Message, Sender};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type SubscriberId = u64;
type Subscriber = Arc<dyn Fn(&Message) + Send + Sync>;

#[derive(Default)]
struct Shared {
    generation: u64,
    running: bool,
    outbound: Option<mpsc::Sender<String>>,
    stop: Option<oneshot::Sender<()>>,
    subscribers: Vec<(SubscriberId, Subscriber)>,
    next_subscriber: SubscriberId,
    last_error: Option<ClientError>,
}

/// A link that closes before delivering a frame or staying up this long
/// counts as a failed attempt.
const STABLE_LINK: Duration = Duration::from_secs(30);

enum PumpEnd {
    Stopped,
    Closed { reason: String, stable: bool },
}

/// Owns the single real-time connection.
///
/// `connect` spawns a loop that opens the transport, pumps inbound frames
/// into the store and subscribers, and reconnects with capped exponential
/// backoff until `disconnect` or until `max_reconnect_attempts` consecutive
/// attempts fail. A link that drops before it delivered anything or stayed
/// up for `STABLE_LINK` is one of those failures.
#[derive(Clone)]
pub struct ConnectionManager {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
    store: Store,
    shared: Arc<Mutex<Shared>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>, store: Store) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config: Arc::new(config),
            transport,
            store,
            shared: Arc::new(Mutex::new(Shared::default())),
            state_tx: Arc::new(state_tx),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn last_error(&self) -> Option<ClientError> {
        self.lock().last_error.clone()
    }

    /// No-op while a connection loop is already running.
    pub fn connect(&self) {
        let (generation, stop_rx) = {
            let mut shared = self.lock();
            if shared.running {
                debug!(state = %self.state(), "ws_connect_ignored");
                return;
            }
            shared.generation += 1;
            shared.running = true;
            shared.last_error = None;
            let (stop_tx, stop_rx) = oneshot::channel();
            shared.stop = Some(stop_tx);
            self.state_tx.send_replace(ConnectionState::Connecting);
            (shared.generation, stop_rx)
        };
        self.store.chat_connecting();
        info!(url = %self.config.ws_url, "ws_connecting");

        let manager = self.clone();
        tokio::spawn(async move {
            manager.run(generation, stop_rx).await;
        });
    }

    pub fn disconnect(&self) {
        {
            let mut shared = self.lock();
            if !shared.running {
                return;
            }
            shared.generation += 1;
            shared.running = false;
            shared.outbound = None;
            if let Some(stop) = shared.stop.take() {
                let _ = stop.send(());
            }
            self.state_tx.send_replace(ConnectionState::Disconnected);
        }
        self.store.chat_closed();
        info!("ws_disconnected");
    }

    /// Sends one `{"message": ...}` frame. Fails with `NotConnected` unless
    /// the connection is up; the connection state is left untouched.
    pub async fn send(&self, text: &str) -> Result<(), ClientError> {
        let outbound = {
            let shared = self.lock();
            if self.state() != ConnectionState::Connected {
                return Err(ClientError::NotConnected);
            }
            shared.outbound.clone().ok_or(ClientError::NotConnected)?
        };
        let frame = encode_chat_frame(text, self.config.max_frame_bytes)?;
        match tokio::time::timeout(self.config.send_timeout, outbound.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ClientError::Transport("connection closed while sending".to_string())),
            Err(_) => Err(ClientError::Timeout(format!(
                "send exceeded {}s",
                self.config.send_timeout.as_secs()
            ))),
        }
    }

    /// Validates, sends and records a message typed by the user.
    pub async fn send_chat(&self, text: &str) -> Result<Message, ClientError> {
        validate_chat_message(text)?;
        if let Err(err) = self.send(text).await {
            warn!("chat_send_failed: {err}");
            return Err(err);
        }
        let message = Message::new(text, Sender::User);
        self.store.append_message(message.clone());
        Ok(message)
    }

    pub fn on_inbound_message<F>(&self, handler: F) -> SubscriberId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let mut shared = self.lock();
        shared.next_subscriber += 1;
        let id = shared.next_subscriber;
        shared.subscribers.push((id, Arc::new(handler)));
        id
    }

    pub fn remove_subscriber(&self, id: SubscriberId) -> bool {
        let mut shared = self.lock();
        let before = shared.subscribers.len();
        shared.subscribers.retain(|(existing, _)| *existing != id);
        shared.subscribers.len() != before
    }

    async fn run(self, generation: u64, mut stop_rx: oneshot::Receiver<()>) {
        let mut backoff = self.config.initial_backoff;
        let mut failures: u32 = 0;
        loop {
            let attempt = tokio::time::timeout(
                self.config.connect_timeout,
                self.transport.open(&self.config.ws_url),
            );
            let opened = tokio::select! {
                _ = &mut stop_rx => return,
                result = attempt => match result {
                    Ok(result) => result,
                    Err(_) => Err(ClientError::Timeout(format!(
                        "connect exceeded {}s",
                        self.config.connect_timeout.as_secs()
                    ))),
                },
            };

            match opened {
                Ok(link) => match self.pump(generation, link, &mut stop_rx).await {
                    PumpEnd::Stopped => return,
                    PumpEnd::Closed { reason, stable } => {
                        warn!(stable, "ws_closed: {reason}");
                        self.record_error(generation, ClientError::Transport(reason));
                        if stable {
                            failures = 0;
                            backoff = self.config.initial_backoff;
                        } else {
                            failures += 1;
                        }
                    }
                },
                Err(err) => {
                    warn!("ws_connect_error: {err}");
                    failures += 1;
                    self.record_error(generation, err);
                }
            }

            if failures >= self.config.max_reconnect_attempts.max(1) {
                self.give_up(generation, failures);
                return;
            }
            if !self.transition(generation, ConnectionState::Reconnecting) {
                return;
            }
            self.store.chat_connecting();

            tokio::select! {
                _ = &mut stop_rx => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = next_backoff(backoff, self.config.max_backoff);
        }
    }

    async fn pump(
        &self,
        generation: u64,
        link: Link,
        stop_rx: &mut oneshot::Receiver<()>,
    ) -> PumpEnd {
        let Link {
            outbound,
            mut inbound,
        } = link;
        {
            let mut shared = self.lock();
            if shared.generation != generation {
                return PumpEnd::Stopped;
            }
            shared.outbound = Some(outbound);
            shared.last_error = None;
            self.state_tx.send_replace(ConnectionState::Connected);
        }
        self.store.chat_connected();
        info!("ws_connected");

        let opened_at = Instant::now();
        let mut delivered = false;
        let reason = loop {
            tokio::select! {
                _ = &mut *stop_rx => return PumpEnd::Stopped,
                event = inbound.recv() => match event {
                    Some(LinkEvent::Text(text)) => {
                        delivered = true;
                        self.deliver(&text);
                    }
                    Some(LinkEvent::Closed(reason)) => {
                        break reason.unwrap_or_else(|| "connection closed".to_string());
                    }
                    None => break "transport dropped".to_string(),
                },
            }
        };

        let mut shared = self.lock();
        if shared.generation == generation {
            shared.outbound = None;
        }
        PumpEnd::Closed {
            reason,
            stable: delivered || opened_at.elapsed() >= STABLE_LINK,
        }
    }

    fn deliver(&self, text: &str) {
        let message = match decode_inbound_message(text, self.config.max_frame_bytes) {
            Ok(message) => message,
            Err(err) => {
                warn!("ws_decode_error: {err}");
                return;
            }
        };
        if !self.store.append_message(message.clone()) {
            debug!(id = %message.id, "ws_duplicate_message");
            return;
        }
        let subscribers: Vec<Subscriber> = self
            .lock()
            .subscribers
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in subscribers {
            handler(&message);
        }
    }

    fn transition(&self, generation: u64, next: ConnectionState) -> bool {
        let shared = self.lock();
        if shared.generation != generation {
            return false;
        }
        self.state_tx.send_replace(next);
        true
    }

    fn record_error(&self, generation: u64, err: ClientError) {
        let mut shared = self.lock();
        if shared.generation == generation {
            shared.last_error = Some(err);
        }
    }

    fn give_up(&self, generation: u64, failures: u32) {
        let last_error = {
            let mut shared = self.lock();
            if shared.generation != generation {
                return;
            }
            shared.running = false;
            shared.outbound = None;
            shared.stop = None;
            self.state_tx.send_replace(ConnectionState::Disconnected);
            shared
                .last_error
                .clone()
                .unwrap_or_else(|| ClientError::Transport("connection lost".to_string()))
        };
        error!("ws_reconnect_exhausted: attempts={failures} last_error={last_error}");
        self.store.chat_failed(last_error.to_resource_error());
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current + current;
    if next > max {
        max
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelTransport, LINK_BUFFER};
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use gbcms_core::{ErrorKind, ResourceKind, ResourceStatus};
    use url::Url;

    /// Transport whose handshake never completes.
    struct Unanswered;

    impl Transport for Unanswered {
        fn open(&self, _url: &Url) -> BoxFuture<'static, Result<Link, ClientError>> {
            futures_util::future::pending().boxed()
        }
    }

    fn config(max_reconnects: u32) -> ClientConfig {
        let mut config =
            ClientConfig::new("http://127.0.0.1:8000", "ws://127.0.0.1:3000/ws").expect("config");
        config.max_reconnect_attempts = max_reconnects;
        config
    }

    async fn wait_for_state(manager: &ConnectionManager, target: ConnectionState) {
        let mut rx = manager.watch_state();
        while *rx.borrow_and_update() != target {
            rx.changed().await.expect("state channel open");
        }
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let cap = Duration::from_secs(10);
        let mut delay = Duration::from_secs(1);
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(delay.as_secs());
            delay = next_backoff(delay, cap);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 10, 10]);
    }

    #[tokio::test]
    async fn send_while_disconnected_is_rejected_without_state_change() {
        let (transport, _accept_rx) = ChannelTransport::new();
        let manager = ConnectionManager::new(config(3), Arc::new(transport), Store::new());
        let err = manager.send("hello").await.expect_err("not connected");
        assert_eq!(err, ClientError::NotConnected);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn blank_chat_message_never_reaches_transport() {
        let (transport, _accept_rx) = ChannelTransport::new();
        let store = Store::new();
        let manager = ConnectionManager::new(config(3), Arc::new(transport), store.clone());
        let err = manager.send_chat("   ").await.expect_err("validation");
        assert!(matches!(err, ClientError::Validation(_)));
        assert!(store.messages().is_empty());
    }

    #[tokio::test]
    async fn connect_is_idempotent_and_frames_are_sent() {
        let (transport, mut accept_rx) = ChannelTransport::new();
        let store = Store::new();
        let manager = ConnectionManager::new(config(3), Arc::new(transport), store.clone());

        manager.connect();
        manager.connect();
        let mut remote = accept_rx.recv().await.expect("one session");
        wait_for_state(&manager, ConnectionState::Connected).await;
        assert!(accept_rx.try_recv().is_err());

        let sent = manager.send_chat("hello").await.expect("send");
        assert_eq!(sent.sender, Sender::User);
        assert_eq!(remote.next_sent().await.as_deref(), Some(r#"{"message":"hello"}"#));
        assert_eq!(store.messages(), vec![sent]);
        assert_eq!(store.status(ResourceKind::Chat), ResourceStatus::Succeeded);

        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(remote.next_sent().await, None);
        assert_eq!(store.status(ResourceKind::Chat), ResourceStatus::Idle);
    }

    #[tokio::test]
    async fn inbound_messages_reach_store_and_subscribers_in_order() {
        let (transport, mut accept_rx) = ChannelTransport::new();
        let store = Store::new();
        let manager = ConnectionManager::new(config(3), Arc::new(transport), store.clone());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        manager.on_inbound_message(move |message| {
            let _ = seen_tx.send(message.content.clone());
        });

        manager.connect();
        let remote = accept_rx.recv().await.expect("session");
        remote.push(r#"{"id":"a","content":"one","sender":"agent"}"#).await;
        remote.push("not json at all").await;
        remote.push(r#"{"id":"b","content":"two","sender":"agent"}"#).await;

        assert_eq!(seen_rx.recv().await.as_deref(), Some("one"));
        assert_eq!(seen_rx.recv().await.as_deref(), Some("not json at all"));
        assert_eq!(seen_rx.recv().await.as_deref(), Some("two"));
        let contents: Vec<String> = store.messages().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["one", "not json at all", "two"]);
    }

    #[tokio::test]
    async fn removed_subscribers_stop_receiving() {
        let (transport, mut accept_rx) = ChannelTransport::new();
        let store = Store::new();
        let manager = ConnectionManager::new(config(3), Arc::new(transport), store.clone());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();
        let id = manager.on_inbound_message(move |message| {
            let _ = seen_tx.send(message.id.clone());
        });
        assert!(manager.remove_subscriber(id));
        assert!(!manager.remove_subscriber(id));

        manager.connect();
        let remote = accept_rx.recv().await.expect("session");
        remote.push(r#"{"id":"x","content":"quiet"}"#).await;
        manager.disconnect();
        assert!(seen_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bounded_attempts() {
        let (transport, _accept_rx) = ChannelTransport::new();
        transport.refuse_next(u32::MAX);
        let store = Store::new();
        let manager = ConnectionManager::new(config(3), Arc::new(transport), store.clone());

        let mut states = manager.watch_state();
        manager.connect();
        let mut saw_reconnecting = false;
        loop {
            states.changed().await.expect("state channel open");
            match *states.borrow_and_update() {
                ConnectionState::Reconnecting => saw_reconnecting = true,
                ConnectionState::Disconnected => break,
                _ => {}
            }
        }
        assert!(saw_reconnecting);
        assert!(matches!(manager.last_error(), Some(ClientError::Transport(_))));
        let chat = store.read::<crate::store::Chat>();
        assert_eq!(chat.status, ResourceStatus::Failed);
        assert_eq!(chat.error.map(|e| e.kind), Some(ErrorKind::Transport));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_reconnecting() {
        let (transport, _accept_rx) = ChannelTransport::new();
        transport.refuse_next(u32::MAX);
        let manager = ConnectionManager::new(config(50), Arc::new(transport), Store::new());
        manager.connect();
        wait_for_state(&manager, ConnectionState::Reconnecting).await;
        manager.disconnect();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.last_error().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn links_that_drop_immediately_count_toward_the_limit() {
        let (transport, mut accept_rx) = ChannelTransport::new();
        let store = Store::new();
        let manager = ConnectionManager::new(config(3), Arc::new(transport), store.clone());

        let mut states = manager.watch_state();
        manager.connect();
        let mut sessions = 0;
        loop {
            tokio::select! {
                remote = accept_rx.recv() => {
                    let remote = remote.expect("transport alive");
                    sessions += 1;
                    remote.close("going away").await;
                }
                changed = states.changed() => {
                    changed.expect("state channel open");
                    if *states.borrow_and_update() == ConnectionState::Disconnected {
                        break;
                    }
                }
            }
        }
        assert_eq!(sessions, 3);
        assert!(matches!(manager.last_error(), Some(ClientError::Transport(_))));
        assert_eq!(store.status(ResourceKind::Chat), ResourceStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_past_connect_timeout_is_a_timeout_failure() {
        let store = Store::new();
        let manager = ConnectionManager::new(config(2), Arc::new(Unanswered), store.clone());

        manager.connect();
        let mut states = manager.watch_state();
        while *states.borrow_and_update() != ConnectionState::Disconnected {
            states.changed().await.expect("state channel open");
        }
        assert!(matches!(manager.last_error(), Some(ClientError::Timeout(_))));
        let chat = store.read::<crate::store::Chat>();
        assert_eq!(chat.status, ResourceStatus::Failed);
        assert_eq!(chat.error.map(|e| e.kind), Some(ErrorKind::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn send_that_is_never_accepted_times_out() {
        let (transport, mut accept_rx) = ChannelTransport::new();
        let manager = ConnectionManager::new(config(3), Arc::new(transport), Store::new());
        manager.connect();
        let _remote = accept_rx.recv().await.expect("session");
        wait_for_state(&manager, ConnectionState::Connected).await;

        for n in 0..LINK_BUFFER {
            manager.send(&format!("frame {n}")).await.expect("buffered");
        }
        let err = manager.send("one too many").await.expect_err("buffer full");
        assert!(matches!(err, ClientError::Timeout(_)));
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_while_reconnecting_is_ignored() {
        let (transport, mut accept_rx) = ChannelTransport::new();
        let manager = ConnectionManager::new(config(3), Arc::new(transport), Store::new());
        manager.connect();
        let first = accept_rx.recv().await.expect("first session");
        first.close("restart").await;
        wait_for_state(&manager, ConnectionState::Reconnecting).await;

        manager.connect();
        let _second = accept_rx.recv().await.expect("second session");
        wait_for_state(&manager, ConnectionState::Connected).await;
        assert!(accept_rx.try_recv().is_err());
    }
}
