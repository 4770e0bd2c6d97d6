//! Presence synchronization: who holds which cell, from this client's view.
//!
//! The occupancy table is an eventually-consistent replica of the hub's
//! authoritative state: rebuilt wholesale from the snapshot on every
//! (re)join, patched incrementally by select/deselect/left events in
//! between, last-writer-wins per cell. The pure state core
//! ([`PresenceState`]) is separated from the networked shell
//! ([`GridPresence`]) so every transition is testable without a socket.
//!
//! ```text
//! HubLink events ──► PresenceState::apply()     (table + roster + phase)
//! local intents  ──► GridPresence::select_cell() ──► HubLink::invoke()
//! ```
//!
//! Outbound failures are logged and the view left as-is — there is no
//! rollback protocol; the next authoritative snapshot or event reconciles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use quilt_core::{CellId, ConnectionId, Occupancy, UserRecord};

use crate::connection::{HubLink, LinkLifecycle, LinkState};
use crate::protocol::{ClientCall, CollabError, EventKind, GridBroadcast, HubEvent};

/// Registration token for this synchronizer's handlers. A fixed token
/// means a repeated `join` replaces the previous registrations instead of
/// stacking duplicates.
const HANDLER_TOKEN: &str = "presence-sync";

/// Join lifecycle of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPhase {
    Unjoined,
    /// Connect issued; waiting for the first snapshot.
    Joining,
    /// Snapshot applied; table is live.
    Joined,
    /// Mid-session drop; a fresh snapshot will replace the table.
    Rejoining,
    Left,
}

/// The synchronizer's replicated view: occupancy table, roster, own
/// identity, and join phase. Pure — mutated only through [`apply`] and the
/// local intent methods.
///
/// [`apply`]: PresenceState::apply
#[derive(Debug)]
pub struct PresenceState {
    phase: JoinPhase,
    occupancy: HashMap<CellId, Occupancy>,
    roster: HashMap<ConnectionId, UserRecord>,
    me: Option<UserRecord>,
    /// The cell this client last asked for — optimistic intent, never
    /// authority. Authoritative ownership comes from the table.
    intent: Option<CellId>,
}

impl Default for PresenceState {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceState {
    pub fn new() -> Self {
        Self {
            phase: JoinPhase::Unjoined,
            occupancy: HashMap::new(),
            roster: HashMap::new(),
            me: None,
            intent: None,
        }
    }

    pub fn phase(&self) -> JoinPhase {
        self.phase
    }

    /// Apply one inbound event to the replica.
    pub fn apply(&mut self, event: &HubEvent) {
        match event {
            HubEvent::UserInfo(user) => {
                log::debug!("identity assigned: {}", user.display_name);
                self.me = Some(user.clone());
            }
            HubEvent::GridState(records) => {
                // The only wholesale replacement; entering Joined happens
                // here, on first join and on rejoin alike.
                self.occupancy = records
                    .iter()
                    .map(|occ| (occ.cell.clone(), occ.clone()))
                    .collect();
                self.phase = JoinPhase::Joined;
            }
            HubEvent::CellSelected(occ) => {
                // Upsert: a prior record for this cell is replaced even if
                // it belonged to someone else. Last writer wins.
                self.occupancy.insert(occ.cell.clone(), occ.clone());
            }
            HubEvent::CellDeselected(cell) => {
                self.occupancy.remove(cell);
            }
            HubEvent::ConnectedUsers(users) => {
                self.roster = users
                    .iter()
                    .map(|u| (u.connection_id, u.clone()))
                    .collect();
            }
            HubEvent::UserJoined(user) => {
                self.roster.insert(user.connection_id, user.clone());
            }
            HubEvent::UserLeft(user) => {
                self.roster.remove(&user.connection_id);
                self.occupancy
                    .retain(|_, occ| occ.occupant != user.connection_id);
            }
            // Grid traffic on the string channel was already translated at
            // the link boundary; anything left here is plain broadcast.
            HubEvent::Broadcast(_) => {}
        }
    }

    pub fn begin_join(&mut self) {
        self.phase = JoinPhase::Joining;
    }

    /// A mid-session drop: stale assumptions die with the epoch, the next
    /// snapshot is authoritative.
    pub fn begin_rejoin(&mut self) {
        if matches!(
            self.phase,
            JoinPhase::Joining | JoinPhase::Joined | JoinPhase::Rejoining
        ) {
            self.phase = JoinPhase::Rejoining;
        }
    }

    pub fn mark_left(&mut self) {
        self.phase = JoinPhase::Left;
        self.me = None;
        self.intent = None;
    }

    /// The cell this client authoritatively holds, per its own view.
    pub fn own_cell(&self) -> Option<&CellId> {
        let me = self.me.as_ref()?;
        self.occupancy
            .values()
            .find(|occ| occ.occupant == me.connection_id)
            .map(|occ| &occ.cell)
    }

    /// Optimistic local intent (last select asked for, if any).
    pub fn intent(&self) -> Option<&CellId> {
        self.intent.as_ref()
    }

    pub fn set_intent(&mut self, cell: Option<CellId>) {
        self.intent = cell;
    }

    pub fn me(&self) -> Option<&UserRecord> {
        self.me.as_ref()
    }

    pub fn occupant_of(&self, cell: &CellId) -> Option<&Occupancy> {
        self.occupancy.get(cell)
    }

    pub fn occupancy(&self) -> impl Iterator<Item = &Occupancy> {
        self.occupancy.values()
    }

    pub fn occupancy_len(&self) -> usize {
        self.occupancy.len()
    }

    pub fn roster(&self) -> impl Iterator<Item = &UserRecord> {
        self.roster.values()
    }

    pub fn roster_len(&self) -> usize {
        self.roster.len()
    }
}

/// The networked synchronizer: owns the link, keeps the replica current,
/// turns local gestures into remote calls.
pub struct GridPresence {
    link: HubLink,
    state: Arc<Mutex<PresenceState>>,
}

impl GridPresence {
    /// Take ownership of a link. The link's lifecycle stays under the
    /// owner's control through [`join`]/[`leave`].
    ///
    /// [`join`]: GridPresence::join
    /// [`leave`]: GridPresence::leave
    pub fn new(link: HubLink) -> Self {
        Self {
            link,
            state: Arc::new(Mutex::new(PresenceState::new())),
        }
    }

    /// Connect and start synchronizing. Safe to call again after a failed
    /// join or a leave; handler registrations replace their predecessors.
    /// A no-op on an already-live link.
    pub async fn join(&self) -> Result<(), CollabError> {
        if self.link.state() == LinkState::Connected {
            return Ok(());
        }

        self.install_handlers();
        self.lock().begin_join();

        match self.link.connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.lock().phase = JoinPhase::Unjoined;
                Err(e)
            }
        }
    }

    /// Disconnect and stop synchronizing.
    pub async fn leave(&self) {
        self.lock().mark_left();
        self.link.disconnect().await;
    }

    /// Claim a cell. If this client already holds a different cell, a
    /// deselect goes out first — one cell per client, always.
    ///
    /// Failures are logged, not surfaced: the replica stays as-is and the
    /// next authoritative event reconciles. The deselect/select pair is
    /// not atomic; a failed second call can leave this client holding
    /// nothing, which the hub view will confirm.
    pub async fn select_cell(&self, cell: CellId) {
        let held = {
            let state = self.lock();
            state.own_cell().cloned().or_else(|| state.intent().cloned())
        };

        if let Some(prev) = held {
            if prev != cell {
                if let Err(e) = self.link.invoke(ClientCall::DeselectCell).await {
                    log::warn!("deselect of {prev} before selecting {cell} failed: {e}");
                }
            }
        }

        if let Err(e) = self.link.invoke(ClientCall::SelectCell(cell.clone())).await {
            log::warn!("select of {cell} failed: {e}");
            return;
        }
        self.lock().set_intent(Some(cell));
    }

    /// Release this client's own selection, whichever cell that is.
    pub async fn deselect_cell(&self) {
        if let Err(e) = self.link.invoke(ClientCall::DeselectCell).await {
            log::warn!("deselect failed: {e}");
            return;
        }
        self.lock().set_intent(None);
    }

    /// Send a grid event over the legacy string channel — the fallback for
    /// peers without typed event support.
    pub async fn broadcast_grid(&self, event: GridBroadcast) {
        let payload = event.encode();
        if let Err(e) = self.link.invoke(ClientCall::Broadcast(payload)).await {
            log::warn!("grid broadcast failed: {e}");
        }
    }

    /// Run a closure against the current replica state.
    pub fn with_state<R>(&self, f: impl FnOnce(&PresenceState) -> R) -> R {
        f(&self.lock())
    }

    pub fn phase(&self) -> JoinPhase {
        self.lock().phase()
    }

    pub fn me(&self) -> Option<UserRecord> {
        self.lock().me().cloned()
    }

    pub fn own_cell(&self) -> Option<CellId> {
        self.lock().own_cell().cloned()
    }

    /// Current occupancy records, cloned out.
    pub fn occupancy(&self) -> Vec<Occupancy> {
        self.lock().occupancy().cloned().collect()
    }

    pub fn link(&self) -> &HubLink {
        &self.link
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PresenceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn install_handlers(&self) {
        for kind in [
            EventKind::UserInfo,
            EventKind::GridState,
            EventKind::CellSelected,
            EventKind::CellDeselected,
            EventKind::ConnectedUsers,
            EventKind::UserJoined,
            EventKind::UserLeft,
        ] {
            let state = Arc::clone(&self.state);
            self.link.subscribe(kind, HANDLER_TOKEN, move |event| {
                state.lock().unwrap_or_else(|e| e.into_inner()).apply(event);
            });
        }

        let state = Arc::clone(&self.state);
        self.link.on_lifecycle(HANDLER_TOKEN, move |lifecycle| {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            match lifecycle {
                LinkLifecycle::Reconnecting => state.begin_rejoin(),
                // The hub re-pushes identity + snapshot on the new epoch;
                // Joined is re-entered when that snapshot lands.
                LinkLifecycle::Reconnected => {}
                LinkLifecycle::Closed => state.mark_left(),
            }
        });
    }
}
