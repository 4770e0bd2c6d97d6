//! The hub connection: lifecycle, typed subscriptions, remote invocation.
//!
//! One [`HubLink`] owns one logical connection. A single driver task per
//! link serializes everything that touches shared state — frame decode,
//! handler dispatch, and reconnection — so event delivery is ordered within
//! a connection epoch and reconnect attempts never race in-flight events.
//!
//! The legacy string broadcast channel is decoded here, once, into the same
//! typed events as the native wire (see [`GridBroadcast`]); subscribers
//! never see the raw `GRID_*` strings.
//!
//! No call is ever queued while disconnected: `invoke` fails fast and the
//! caller decides what to log. Mid-session drops reconnect silently with
//! capped exponential backoff; registered handlers survive untouched, so a
//! rejoin needs no re-subscription (and re-subscribing anyway replaces
//! rather than stacks).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use quilt_core::config::Endpoint;

use crate::protocol::{ClientCall, CollabError, EventKind, GridBroadcast, HubEvent};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Reader = futures_util::stream::SplitStream<Socket>;

/// Connection state of a [`HubLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Local lifecycle notifications, delivered alongside hub events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLifecycle {
    /// The session dropped mid-flight; silent retries are running.
    Reconnecting,
    /// A retry succeeded; the hub will push a fresh identity and snapshot.
    Reconnected,
    /// Retries exhausted (or the link was never reconnectable); the link
    /// is down until the owner calls `connect` again.
    Closed,
}

type EventHandler = Arc<dyn Fn(&HubEvent) + Send + Sync>;
type LifecycleHandler = Arc<dyn Fn(LinkLifecycle) + Send + Sync>;

/// Retry schedule for transparent mid-session reconnects.
///
/// Initial connects never retry — failures there surface to the caller.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Handler table keyed by `(event kind, caller token)`.
///
/// At most one handler per pair: registering the same token again replaces
/// the previous handler instead of stacking a duplicate, which is what
/// keeps re-subscription after a reconnect single-delivery.
#[derive(Default)]
pub(crate) struct Registry {
    events: HashMap<EventKind, Vec<(String, EventHandler)>>,
    lifecycle: Vec<(String, LifecycleHandler)>,
}

impl Registry {
    pub(crate) fn subscribe(&mut self, kind: EventKind, token: String, handler: EventHandler) {
        let slot = self.events.entry(kind).or_default();
        if let Some(existing) = slot.iter_mut().find(|(t, _)| *t == token) {
            existing.1 = handler;
        } else {
            slot.push((token, handler));
        }
    }

    pub(crate) fn unsubscribe(&mut self, kind: EventKind, token: Option<&str>) {
        match token {
            Some(token) => {
                if let Some(slot) = self.events.get_mut(&kind) {
                    slot.retain(|(t, _)| t != token);
                }
            }
            None => {
                self.events.remove(&kind);
            }
        }
    }

    pub(crate) fn on_lifecycle(&mut self, token: String, handler: LifecycleHandler) {
        if let Some(existing) = self.lifecycle.iter_mut().find(|(t, _)| *t == token) {
            existing.1 = handler;
        } else {
            self.lifecycle.push((token, handler));
        }
    }

    fn event_handlers(&self, kind: EventKind) -> Vec<EventHandler> {
        self.events
            .get(&kind)
            .map(|slot| slot.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    fn lifecycle_handlers(&self) -> Vec<LifecycleHandler> {
        self.lifecycle.iter().map(|(_, h)| h.clone()).collect()
    }
}

struct LinkShared {
    state: RwLock<LinkState>,
    registry: Mutex<Registry>,
    /// Sender into the current epoch's writer task. `None` while down.
    outgoing: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl LinkShared {
    fn set_state(&self, state: LinkState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn clear_outgoing(&self) {
        *self.outgoing.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn set_outgoing(&self, tx: mpsc::Sender<Vec<u8>>) {
        *self.outgoing.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
    }
}

/// One logical connection to the hub.
///
/// Explicitly constructed and explicitly owned — typically handed to a
/// `GridPresence`, whose owner controls the connect/disconnect lifecycle.
pub struct HubLink {
    endpoint: Endpoint,
    policy: ReconnectPolicy,
    shared: Arc<LinkShared>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl HubLink {
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_policy(endpoint, ReconnectPolicy::default())
    }

    pub fn with_policy(endpoint: Endpoint, policy: ReconnectPolicy) -> Self {
        Self {
            endpoint,
            policy,
            shared: Arc::new(LinkShared {
                state: RwLock::new(LinkState::Disconnected),
                registry: Mutex::new(Registry::default()),
                outgoing: Mutex::new(None),
            }),
            shutdown: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Current connection state.
    pub fn state(&self) -> LinkState {
        *self.shared.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Establish the connection. Idempotent: a no-op when already
    /// connecting, connected, or silently reconnecting.
    ///
    /// An initial handshake failure is surfaced to the caller and not
    /// retried. Once up, mid-session drops reconnect transparently and all
    /// registered handlers keep receiving events without re-registration.
    pub async fn connect(&self) -> Result<(), CollabError> {
        {
            let mut state = self.shared.state.write().unwrap_or_else(|e| e.into_inner());
            match *state {
                LinkState::Connecting | LinkState::Connected | LinkState::Reconnecting => {
                    return Ok(())
                }
                LinkState::Disconnected => *state = LinkState::Connecting,
            }
        }

        let socket = match tokio_tungstenite::connect_async(self.endpoint.url()).await {
            Ok((socket, _)) => socket,
            Err(e) => {
                self.shared.set_state(LinkState::Disconnected);
                return Err(CollabError::Connection(e.to_string()));
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock().unwrap_or_else(|e| e.into_inner()) = Some(shutdown_tx);

        let reader = spawn_epoch(&self.shared, socket);
        self.shared.set_state(LinkState::Connected);

        let shared = self.shared.clone();
        let endpoint = self.endpoint.clone();
        let policy = self.policy.clone();
        tokio::spawn(drive(shared, endpoint, policy, reader, shutdown_rx));

        log::info!("connected to hub at {}", self.endpoint.url());
        Ok(())
    }

    /// Release the connection. Idempotent. Handlers stay registered but
    /// are detached from the (now gone) channel; a later `connect` picks
    /// them back up.
    pub async fn disconnect(&self) {
        let shutdown = self.shutdown.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = shutdown {
            let _ = tx.send(true);
        }
        self.shared.clear_outgoing();
        self.shared.set_state(LinkState::Disconnected);
        log::info!("disconnected from hub");
    }

    /// Register a handler for one event kind under a caller-chosen token.
    /// One handler per `(kind, token)` — repeats replace, never stack.
    pub fn subscribe<F>(&self, kind: EventKind, token: impl Into<String>, handler: F)
    where
        F: Fn(&HubEvent) + Send + Sync + 'static,
    {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subscribe(kind, token.into(), Arc::new(handler));
    }

    /// Remove one handler (by token) or every handler for a kind.
    pub fn unsubscribe(&self, kind: EventKind, token: Option<&str>) {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unsubscribe(kind, token);
    }

    /// Register a lifecycle handler (reconnecting / reconnected / closed)
    /// under a caller-chosen token, with the same replace semantics.
    pub fn on_lifecycle<F>(&self, token: impl Into<String>, handler: F)
    where
        F: Fn(LinkLifecycle) + Send + Sync + 'static,
    {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_lifecycle(token.into(), Arc::new(handler));
    }

    /// Send a remote call. Fails fast when not connected — calls are
    /// dropped, never queued for later.
    pub async fn invoke(&self, call: ClientCall) -> Result<(), CollabError> {
        if self.state() != LinkState::Connected {
            return Err(CollabError::Invocation(format!(
                "not connected (state {:?})",
                self.state()
            )));
        }

        let tx = self
            .shared
            .outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(tx) = tx else {
            return Err(CollabError::Invocation("no active channel".into()));
        };

        let bytes = call.encode()?;
        tx.send(bytes)
            .await
            .map_err(|_| CollabError::Invocation("channel closed mid-send".into()))
    }
}

/// Split a fresh socket into writer task + reader, wiring the outgoing
/// channel for this epoch. Returns the read half for the driver.
fn spawn_epoch(shared: &Arc<LinkShared>, socket: Socket) -> Reader {
    let (mut writer, reader) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
    shared.set_outgoing(out_tx);

    tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if writer.send(Message::Binary(data.into())).await.is_err() {
                break;
            }
        }
    });

    reader
}

/// Per-link driver: decode + dispatch frames in order, and on a drop run
/// the silent reconnect schedule. Everything shared-state-touching happens
/// here, serialized.
async fn drive(
    shared: Arc<LinkShared>,
    endpoint: Endpoint,
    policy: ReconnectPolicy,
    mut reader: Reader,
    mut shutdown: watch::Receiver<bool>,
) {
    'epochs: loop {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break 'epochs,
                frame = reader.next() => match frame {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        match HubEvent::decode(&bytes) {
                            Ok(event) => dispatch(&shared, &event),
                            Err(e) => log::warn!("dropping undecodable frame: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::warn!("socket error: {e}");
                        break;
                    }
                    _ => {}
                },
            }
        }

        // The epoch dropped out from under us.
        shared.clear_outgoing();
        if *shutdown.borrow() {
            break;
        }

        let drop_err = CollabError::TransientDrop("hub connection lost".into());
        log::warn!("{drop_err}; reconnecting");
        shared.set_state(LinkState::Reconnecting);
        fire_lifecycle(&shared, LinkLifecycle::Reconnecting);

        let mut delay = policy.base_delay;
        let mut next_reader = None;
        for attempt in 1..=policy.max_attempts {
            tokio::select! {
                _ = shutdown.changed() => break 'epochs,
                _ = tokio::time::sleep(delay) => {}
            }
            match tokio_tungstenite::connect_async(endpoint.url()).await {
                Ok((socket, _)) => {
                    next_reader = Some(spawn_epoch(&shared, socket));
                    break;
                }
                Err(e) => {
                    log::warn!(
                        "reconnect attempt {attempt}/{} failed: {e}",
                        policy.max_attempts
                    );
                    delay = (delay * 2).min(policy.max_delay);
                }
            }
        }

        match next_reader {
            Some(r) => {
                reader = r;
                shared.set_state(LinkState::Connected);
                fire_lifecycle(&shared, LinkLifecycle::Reconnected);
                log::info!("reconnected to hub at {}", endpoint.url());
            }
            None => {
                shared.set_state(LinkState::Disconnected);
                fire_lifecycle(&shared, LinkLifecycle::Closed);
                log::warn!("reconnect attempts exhausted; link closed");
                break;
            }
        }
    }
}

/// Dispatch one inbound event, translating the legacy string channel into
/// typed events at this boundary only.
fn dispatch(shared: &Arc<LinkShared>, event: &HubEvent) {
    if let HubEvent::Broadcast(payload) = event {
        match GridBroadcast::parse(payload) {
            Ok(Some(grid)) => {
                deliver(shared, &grid.into_event());
                return;
            }
            Ok(None) => {} // plain broadcast traffic — deliver as-is below
            Err(e) => {
                log::warn!("ignoring malformed grid broadcast: {e}");
                return;
            }
        }
    }
    deliver(shared, event);
}

fn deliver(shared: &Arc<LinkShared>, event: &HubEvent) {
    // Handlers are cloned out before invocation so a handler may
    // re-subscribe without deadlocking the registry.
    let handlers = shared
        .registry
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .event_handlers(event.kind());
    for handler in handlers {
        handler(event);
    }
}

fn fire_lifecycle(shared: &Arc<LinkShared>, lifecycle: LinkLifecycle) {
    let handlers = shared
        .registry
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .lifecycle_handlers();
    for handler in handlers {
        handler(lifecycle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quilt_core::CellId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> EventHandler {
        Arc::new(move |_event: &HubEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_registry_replaces_same_token() {
        let mut reg = Registry::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        reg.subscribe(EventKind::CellSelected, "sync".into(), counting_handler(first.clone()));
        reg.subscribe(EventKind::CellSelected, "sync".into(), counting_handler(second.clone()));

        let handlers = reg.event_handlers(EventKind::CellSelected);
        assert_eq!(handlers.len(), 1);

        let event = HubEvent::CellDeselected(CellId::at(0, 0));
        for h in handlers {
            h(&event);
        }
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registry_distinct_tokens_stack() {
        let mut reg = Registry::default();
        let count = Arc::new(AtomicUsize::new(0));

        reg.subscribe(EventKind::Broadcast, "a".into(), counting_handler(count.clone()));
        reg.subscribe(EventKind::Broadcast, "b".into(), counting_handler(count.clone()));

        assert_eq!(reg.event_handlers(EventKind::Broadcast).len(), 2);
    }

    #[test]
    fn test_registry_unsubscribe_one() {
        let mut reg = Registry::default();
        let count = Arc::new(AtomicUsize::new(0));

        reg.subscribe(EventKind::UserJoined, "a".into(), counting_handler(count.clone()));
        reg.subscribe(EventKind::UserJoined, "b".into(), counting_handler(count.clone()));
        reg.unsubscribe(EventKind::UserJoined, Some("a"));

        assert_eq!(reg.event_handlers(EventKind::UserJoined).len(), 1);
    }

    #[test]
    fn test_registry_unsubscribe_all() {
        let mut reg = Registry::default();
        let count = Arc::new(AtomicUsize::new(0));

        reg.subscribe(EventKind::UserJoined, "a".into(), counting_handler(count.clone()));
        reg.subscribe(EventKind::UserJoined, "b".into(), counting_handler(count.clone()));
        reg.unsubscribe(EventKind::UserJoined, None);

        assert!(reg.event_handlers(EventKind::UserJoined).is_empty());
    }

    #[test]
    fn test_link_initial_state() {
        let link = HubLink::new(Endpoint::development());
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_refused_surfaces_error() {
        // Nothing listens on this port; initial connect must fail without
        // retrying and leave the link disconnected.
        let link = HubLink::new(Endpoint::new("ws://127.0.0.1:9"));
        let err = link.connect().await.unwrap_err();
        assert!(matches!(err, CollabError::Connection(_)));
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_invoke_while_disconnected_is_dropped() {
        let link = HubLink::new(Endpoint::development());
        let err = link
            .invoke(ClientCall::SelectCell(CellId::at(0, 0)))
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::Invocation(_)));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let link = HubLink::new(Endpoint::development());
        link.disconnect().await;
        link.disconnect().await;
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_dispatch_translates_fallback_select() {
        let shared = Arc::new(LinkShared {
            state: RwLock::new(LinkState::Connected),
            registry: Mutex::new(Registry::default()),
            outgoing: Mutex::new(None),
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            shared.registry.lock().unwrap().subscribe(
                EventKind::CellSelected,
                "test".into(),
                Arc::new(move |event: &HubEvent| {
                    seen.lock().unwrap().push(event.clone());
                }),
            );
        }

        dispatch(
            &shared,
            &HubEvent::Broadcast("GRID_SELECT:7:user-x:#00ff00".into()),
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        match &seen[0] {
            HubEvent::CellSelected(occ) => assert_eq!(occ.cell, CellId::from("7")),
            other => panic!("expected CellSelected, got {other:?}"),
        }
    }

    #[test]
    fn test_dispatch_drops_malformed_fallback() {
        let shared = Arc::new(LinkShared {
            state: RwLock::new(LinkState::Connected),
            registry: Mutex::new(Registry::default()),
            outgoing: Mutex::new(None),
        });

        let count = Arc::new(AtomicUsize::new(0));
        for kind in EventKind::ALL {
            shared.registry.lock().unwrap().subscribe(
                kind,
                "test".into(),
                counting_handler(count.clone()),
            );
        }

        dispatch(&shared, &HubEvent::Broadcast("GRID_SELECT:7".into()));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Plain traffic still flows to broadcast subscribers.
        dispatch(&shared, &HubEvent::Broadcast("hello".into()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reconnect_policy_default() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(10));
    }
}
