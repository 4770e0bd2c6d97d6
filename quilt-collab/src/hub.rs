//! The grid hub: accepts client connections, owns the authoritative
//! occupancy table, and fans every change out to all connected peers.
//!
//! ```text
//! Client A ──┐
//!             ├── GridHub ── HubCore (occupancy + roster) ── fan-out
//! Client B ──┘                                                │
//!                                              ┌──────────────┤
//!                                              ▼              ▼
//!                                          Client A        Client B
//! ```
//!
//! On accept, a connection gets a fresh identity (id, display name, color)
//! and a private push of `UserInfo`, the `GridState` snapshot, and
//! `ConnectedUsers`; everything else is broadcast. One cell per occupant is
//! enforced here: a select implicitly releases the caller's previous cell.
//! Per-cell conflicts are last-writer-wins — no error, the later select
//! simply displaces the record. Nothing survives a process restart.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use quilt_core::{CellId, ConnectionId, Occupancy, UserRecord};

use crate::protocol::{ClientCall, CollabError, HubEvent};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Fan-out channel capacity per peer before lagging peers drop frames.
    pub broadcast_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_calls: u64,
    pub total_bytes: u64,
}

/// Authoritative grid state. Pure — every mutation returns the events to
/// broadcast, the socket shell around it does the I/O.
#[derive(Default)]
struct HubCore {
    occupancy: HashMap<CellId, Occupancy>,
    roster: HashMap<ConnectionId, UserRecord>,
    /// Reverse index: which cell each occupant holds.
    cell_by_occupant: HashMap<ConnectionId, CellId>,
}

impl HubCore {
    fn join(&mut self, user: UserRecord) {
        self.roster.insert(user.connection_id, user);
    }

    /// Full occupancy snapshot, cell-ordered for deterministic frames.
    fn snapshot(&self) -> Vec<Occupancy> {
        let mut records: Vec<_> = self.occupancy.values().cloned().collect();
        records.sort_by(|a, b| a.cell.cmp(&b.cell));
        records
    }

    fn users(&self) -> Vec<UserRecord> {
        let mut users: Vec<_> = self.roster.values().cloned().collect();
        users.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        users
    }

    /// Claim a cell for `user`, releasing their previous cell first.
    /// A cell held by someone else is displaced without ceremony.
    fn select(&mut self, user: &UserRecord, cell: CellId) -> Vec<HubEvent> {
        let mut events = Vec::with_capacity(2);

        if let Some(prev) = self.cell_by_occupant.get(&user.connection_id).cloned() {
            if prev != cell {
                self.cell_by_occupant.remove(&user.connection_id);
                self.occupancy.remove(&prev);
                events.push(HubEvent::CellDeselected(prev));
            }
        }

        // Last writer wins: clean the displaced occupant's reverse index,
        // the upsert below overwrites their record.
        if let Some(existing) = self.occupancy.get(&cell) {
            if existing.occupant != user.connection_id {
                self.cell_by_occupant.remove(&existing.occupant);
            }
        }

        let occ = Occupancy::new(cell.clone(), user);
        self.occupancy.insert(cell.clone(), occ.clone());
        self.cell_by_occupant.insert(user.connection_id, cell);
        events.push(HubEvent::CellSelected(occ));
        events
    }

    /// Release the caller's own selection, if any.
    fn deselect(&mut self, id: ConnectionId) -> Vec<HubEvent> {
        let Some(cell) = self.cell_by_occupant.remove(&id) else {
            return Vec::new();
        };
        // Only drop the record if it is still ours (a displacement may
        // have raced ahead).
        if self
            .occupancy
            .get(&cell)
            .is_some_and(|occ| occ.occupant == id)
        {
            self.occupancy.remove(&cell);
        }
        vec![HubEvent::CellDeselected(cell)]
    }

    /// A connection went away: release its cell, drop it from the roster.
    fn depart(&mut self, id: ConnectionId) -> Vec<HubEvent> {
        let mut events = self.deselect(id);
        if let Some(user) = self.roster.remove(&id) {
            events.push(HubEvent::UserLeft(user));
        }
        events
    }
}

type ServerSink = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>;
type ServerSource = futures_util::stream::SplitStream<WebSocketStream<TcpStream>>;

/// The hub server.
pub struct GridHub {
    config: HubConfig,
    core: Arc<RwLock<HubCore>>,
    fanout: broadcast::Sender<Arc<Vec<u8>>>,
    stats: Arc<RwLock<HubStats>>,
}

impl GridHub {
    pub fn new(config: HubConfig) -> Self {
        let (fanout, _) = broadcast::channel(config.broadcast_capacity);
        Self {
            config,
            core: Arc::new(RwLock::new(HubCore::default())),
            fanout,
            stats: Arc::new(RwLock::new(HubStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(HubConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> HubStats {
        self.stats.read().await.clone()
    }

    /// Accept connections forever. Call from an async runtime.
    pub async fn run(&self) -> Result<(), CollabError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| CollabError::Connection(e.to_string()))?;
        log::info!("grid hub listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| CollabError::Connection(e.to_string()))?;
            log::debug!("new tcp connection from {addr}");

            let core = self.core.clone();
            let stats = self.stats.clone();
            let fanout = self.fanout.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, core, fanout, stats).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// Encode once, fan out to every connected peer.
fn fan_out(fanout: &broadcast::Sender<Arc<Vec<u8>>>, event: &HubEvent) {
    match event.encode() {
        Ok(bytes) => {
            // A send error just means no one is subscribed yet.
            let _ = fanout.send(Arc::new(bytes));
        }
        Err(e) => log::error!("failed to encode event for fan-out: {e}"),
    }
}

async fn send_event(sink: &mut ServerSink, event: &HubEvent) -> Result<(), CollabError> {
    let bytes = event.encode()?;
    sink.send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| CollabError::Connection(e.to_string()))
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    core: Arc<RwLock<HubCore>>,
    fanout: broadcast::Sender<Arc<Vec<u8>>>,
    stats: Arc<RwLock<HubStats>>,
) -> Result<(), CollabError> {
    let socket = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| CollabError::Connection(e.to_string()))?;
    let (mut sink, mut source) = socket.split();

    let user = UserRecord::assigned(ConnectionId::assign());
    log::info!(
        "{} ({}) connected from {addr}",
        user.display_name,
        user.connection_id
    );

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    // Subscribe before the snapshot so nothing slips between them; a
    // duplicate event after the snapshot is a harmless re-upsert.
    let rx = fanout.subscribe();

    let result = serve_peer(&mut sink, &mut source, rx, &user, addr, &core, &fanout, &stats).await;

    // Departure cleanup runs no matter how the connection ended: release
    // the cell, drop from the roster, tell everyone.
    let events = {
        let mut c = core.write().await;
        c.depart(user.connection_id)
    };
    for event in &events {
        fan_out(&fanout, event);
    }

    let mut s = stats.write().await;
    s.active_connections -= 1;

    result
}

async fn serve_peer(
    sink: &mut ServerSink,
    source: &mut ServerSource,
    mut rx: broadcast::Receiver<Arc<Vec<u8>>>,
    user: &UserRecord,
    addr: SocketAddr,
    core: &Arc<RwLock<HubCore>>,
    fanout: &broadcast::Sender<Arc<Vec<u8>>>,
    stats: &Arc<RwLock<HubStats>>,
) -> Result<(), CollabError> {
    let (snapshot, users) = {
        let mut c = core.write().await;
        c.join(user.clone());
        (c.snapshot(), c.users())
    };

    send_event(sink, &HubEvent::UserInfo(user.clone())).await?;
    send_event(sink, &HubEvent::GridState(snapshot)).await?;
    send_event(sink, &HubEvent::ConnectedUsers(users)).await?;
    fan_out(fanout, &HubEvent::UserJoined(user.clone()));

    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    {
                        let mut s = stats.write().await;
                        s.total_calls += 1;
                        s.total_bytes += bytes.len() as u64;
                    }
                    match ClientCall::decode(&bytes) {
                        Ok(call) => {
                            let events = {
                                let mut c = core.write().await;
                                match call {
                                    ClientCall::SelectCell(cell) => c.select(user, cell),
                                    ClientCall::DeselectCell => c.deselect(user.connection_id),
                                    ClientCall::Broadcast(payload) => {
                                        vec![HubEvent::Broadcast(payload)]
                                    }
                                }
                            };
                            for event in &events {
                                fan_out(fanout, event);
                            }
                        }
                        Err(e) => log::warn!("undecodable call from {addr}: {e}"),
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    sink.send(Message::Pong(payload))
                        .await
                        .map_err(|e| CollabError::Connection(e.to_string()))?;
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("connection closed from {addr}");
                    return Ok(());
                }
                Some(Err(e)) => {
                    log::warn!("socket error from {addr}: {e}");
                    return Ok(());
                }
                _ => {}
            },

            frame = rx.recv() => match frame {
                Ok(bytes) => {
                    sink.send(Message::Binary(bytes.to_vec().into()))
                        .await
                        .map_err(|e| CollabError::Connection(e.to_string()))?;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("{} lagged by {n} frames", user.display_name);
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}
