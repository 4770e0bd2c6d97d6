//! # quilt-collab — real-time presence layer for the shared grid
//!
//! Multiple clients share one grid of cells through a central hub: each
//! cell is held by at most one client at a time, selections broadcast to
//! every peer live, and each client keeps an eventually-consistent replica
//! reconciled by full snapshots on (re)join and incremental events in
//! between.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      WebSocket       ┌─────────────┐
//! │ HubLink      │ ◄──────────────────► │ GridHub     │
//! │ (per client) │     Binary Proto     │ (central)   │
//! └──────┬───────┘                      └──────┬──────┘
//!        │ typed events                        │
//!        ▼                                     ▼
//! ┌──────────────┐                      ┌─────────────┐
//! │ GridPresence │                      │ HubCore     │
//! │ (replica)    │                      │ (authority) │
//! └──────────────┘                      └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire protocol (bincode-encoded calls/events)
//!   and the typed decode of the legacy string channel
//! - [`connection`] — the hub connection: lifecycle, subscriptions,
//!   invocation, silent reconnects
//! - [`presence`] — the occupancy replica and outbound intents
//! - [`hub`] — the central hub server

pub mod connection;
pub mod hub;
pub mod presence;
pub mod protocol;

// Re-exports for convenience
pub use connection::{HubLink, LinkLifecycle, LinkState, ReconnectPolicy};
pub use hub::{GridHub, HubConfig, HubStats};
pub use presence::{GridPresence, JoinPhase, PresenceState};
pub use protocol::{ClientCall, CollabError, EventKind, GridBroadcast, HubEvent};
