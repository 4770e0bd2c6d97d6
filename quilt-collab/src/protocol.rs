//! Typed wire protocol between grid clients and the hub.
//!
//! Every message is a closed enum, bincode-encoded. The legacy string
//! broadcast channel (`"GRID_SELECT:…"` / `"GRID_DESELECT:…"`) is decoded
//! exactly once, at the connection boundary, into the same typed events —
//! nothing downstream ever splits strings.

use quilt_core::{CellId, ConnectionId, Occupancy, UserRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy for the collaboration layer.
///
/// Nothing here is fatal to the process: the worst case is a temporarily
/// stale view that heals on the next full snapshot.
#[derive(Error, Debug)]
pub enum CollabError {
    /// Handshake or transport failure on an explicit connect.
    /// Surfaced to the caller; not retried.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Mid-session drop. Retried automatically and silently by the link
    /// up to its reconnect policy.
    #[error("connection dropped: {0}")]
    TransientDrop(String),

    /// A remote call rejected or attempted while disconnected.
    /// Logged where it happens; the call is dropped, never queued.
    #[error("invocation failed: {0}")]
    Invocation(String),

    /// A payload that does not match its expected encoding.
    /// The single event is dropped.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("codec error: {0}")]
    Codec(String),
}

/// Remote calls a client can make on the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientCall {
    /// Claim a cell. The hub implicitly releases the caller's previous
    /// cell; a cell held by someone else is taken over, last writer wins.
    SelectCell(CellId),
    /// Release the caller's own selection, whichever cell that is.
    DeselectCell,
    /// Free-form string fan-out — the legacy channel grid events ride on
    /// where typed events are unavailable.
    Broadcast(String),
}

impl ClientCall {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, CollabError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CollabError::Codec(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, CollabError> {
        let (call, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CollabError::Codec(e.to_string()))?;
        Ok(call)
    }
}

/// Events the hub pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HubEvent {
    /// The receiving client's own identity record. Sent once per
    /// connection epoch, before the snapshot.
    UserInfo(UserRecord),
    /// Full occupancy snapshot. The only wholesale table replacement;
    /// everything after it is an incremental patch.
    GridState(Vec<Occupancy>),
    /// A cell was claimed (upsert — may displace another occupant).
    CellSelected(Occupancy),
    /// A cell was released.
    CellDeselected(CellId),
    /// Full roster snapshot for the receiving client.
    ConnectedUsers(Vec<UserRecord>),
    UserJoined(UserRecord),
    UserLeft(UserRecord),
    /// Free-form string fan-out (legacy channel).
    Broadcast(String),
}

impl HubEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            HubEvent::UserInfo(_) => EventKind::UserInfo,
            HubEvent::GridState(_) => EventKind::GridState,
            HubEvent::CellSelected(_) => EventKind::CellSelected,
            HubEvent::CellDeselected(_) => EventKind::CellDeselected,
            HubEvent::ConnectedUsers(_) => EventKind::ConnectedUsers,
            HubEvent::UserJoined(_) => EventKind::UserJoined,
            HubEvent::UserLeft(_) => EventKind::UserLeft,
            HubEvent::Broadcast(_) => EventKind::Broadcast,
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, CollabError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CollabError::Codec(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, CollabError> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CollabError::Codec(e.to_string()))?;
        Ok(event)
    }
}

/// Closed enumeration of the subscribable hub event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    UserInfo,
    GridState,
    CellSelected,
    CellDeselected,
    ConnectedUsers,
    UserJoined,
    UserLeft,
    Broadcast,
}

impl EventKind {
    /// Every subscribable kind, in wire order.
    pub const ALL: [EventKind; 8] = [
        EventKind::UserInfo,
        EventKind::GridState,
        EventKind::CellSelected,
        EventKind::CellDeselected,
        EventKind::ConnectedUsers,
        EventKind::UserJoined,
        EventKind::UserLeft,
        EventKind::Broadcast,
    ];
}

const SELECT_TAG: &str = "GRID_SELECT:";
const DESELECT_TAG: &str = "GRID_DESELECT:";

/// Typed form of the legacy string-encoded grid events.
///
/// `"GRID_SELECT:<cell>:<name>:<color>"` and `"GRID_DESELECT:<cell>"`.
#[derive(Debug, Clone, PartialEq)]
pub enum GridBroadcast {
    Select {
        cell: CellId,
        display_name: String,
        color: String,
    },
    Deselect {
        cell: CellId,
    },
}

impl GridBroadcast {
    /// Render to the legacy string encoding.
    pub fn encode(&self) -> String {
        match self {
            GridBroadcast::Select {
                cell,
                display_name,
                color,
            } => format!("{SELECT_TAG}{cell}:{display_name}:{color}"),
            GridBroadcast::Deselect { cell } => format!("{DESELECT_TAG}{cell}"),
        }
    }

    /// Try to parse a broadcast payload as a grid event.
    ///
    /// `Ok(None)` means the payload is not a grid event at all (plain
    /// broadcast traffic passes through untouched). `Err` means it claimed
    /// to be one but does not match the encoding — the caller drops it.
    pub fn parse(payload: &str) -> Result<Option<Self>, CollabError> {
        if let Some(rest) = payload.strip_prefix(SELECT_TAG) {
            let mut parts = rest.splitn(3, ':');
            let cell = parts.next().unwrap_or_default();
            let name = parts.next();
            let color = parts.next();
            match (cell, name, color) {
                (cell, Some(name), Some(color)) if !cell.is_empty() => {
                    Ok(Some(GridBroadcast::Select {
                        cell: CellId::from(cell),
                        display_name: name.to_string(),
                        color: color.to_string(),
                    }))
                }
                _ => Err(CollabError::MalformedEvent(payload.to_string())),
            }
        } else if let Some(cell) = payload.strip_prefix(DESELECT_TAG) {
            if cell.is_empty() {
                return Err(CollabError::MalformedEvent(payload.to_string()));
            }
            Ok(Some(GridBroadcast::Deselect {
                cell: CellId::from(cell),
            }))
        } else {
            Ok(None)
        }
    }

    /// Lift into the typed event stream.
    ///
    /// The string channel carries no sender identity, so selects are
    /// attributed to the relayed sentinel; per-cell last-writer-wins makes
    /// that safe.
    pub fn into_event(self) -> HubEvent {
        match self {
            GridBroadcast::Select {
                cell,
                display_name,
                color,
            } => HubEvent::CellSelected(Occupancy {
                cell,
                occupant: ConnectionId::relayed(),
                display_name,
                color,
            }),
            GridBroadcast::Deselect { cell } => HubEvent::CellDeselected(cell),
        }
    }
}
