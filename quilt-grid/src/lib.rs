//! Session glue between the merge-layout engine and the presence layer.
//!
//! A [`GridSession`] owns one local [`MergeGrid`] and one [`GridPresence`]
//! and wires gestures to the network:
//!
//! ```text
//! gesture end ──► MergeGrid::commit() ──► GridPresence::select_cell()
//! tap          ──────────────────────────► select / deselect toggle
//! remote events ──► GridPresence replica ──► occupancy_overlay()
//! ```
//!
//! The merge grid piggybacks selection on its item ids: item `"7"` is cell
//! `"7"` on the wire. Rendering stays outside; this type only exposes the
//! derived views a renderer needs.

use quilt_collab::presence::GridPresence;
use quilt_collab::protocol::CollabError;
use quilt_core::{CellId, GridRect, ItemId, Occupancy};
use quilt_layout::{Commit, LayoutError, MergeGrid};

/// One client's interactive merge-grid session.
pub struct GridSession {
    grid: MergeGrid,
    presence: GridPresence,
}

impl GridSession {
    /// Build a session over a fresh `cols × rows` grid. The presence
    /// synchronizer (and the link it owns) is passed in; its lifecycle
    /// stays with this session via [`join`]/[`leave`].
    ///
    /// [`join`]: GridSession::join
    /// [`leave`]: GridSession::leave
    pub fn new(presence: GridPresence, cols: u32, rows: u32) -> Self {
        Self {
            grid: MergeGrid::new(cols, rows),
            presence,
        }
    }

    pub async fn join(&self) -> Result<(), CollabError> {
        self.presence.join().await
    }

    pub async fn leave(&self) {
        self.presence.leave().await;
    }

    /// A drag/resize gesture ended: run the merge pipeline locally, then
    /// claim the moved item's cell so peers see who is holding it.
    ///
    /// The layout commit is local-first; a failed network call leaves the
    /// local layout in place and the selection to reconcile on the next
    /// authoritative event.
    pub async fn commit_gesture(
        &mut self,
        item: &ItemId,
        proposed: GridRect,
    ) -> Result<Commit, LayoutError> {
        let commit = self.grid.commit(item, proposed)?;
        self.presence.select_cell(item.clone().into()).await;
        Ok(commit)
    }

    /// A tap on an item: toggle this client's selection.
    pub async fn tap_item(&self, item: &ItemId) {
        let cell: CellId = item.clone().into();
        if self.presence.own_cell() == Some(cell.clone()) {
            log::debug!("tap on held item {item}: releasing");
            self.presence.deselect_cell().await;
        } else {
            log::debug!("tap on item {item}: claiming");
            self.presence.select_cell(cell).await;
        }
    }

    /// Clear this client's selection (tap outside the grid).
    pub async fn clear_selection(&self) {
        self.presence.deselect_cell().await;
    }

    /// Visible items with their display numbers, render-ready.
    pub fn numbered_items(&self) -> Vec<(u32, quilt_core::GridItem)> {
        self.grid
            .labels()
            .into_iter()
            .filter_map(|(id, n)| self.grid.item(&id).map(|item| (n, item.clone())))
            .collect()
    }

    /// Remote occupancy projected onto visible items: which item is held
    /// by whom, from this client's replica.
    pub fn occupancy_overlay(&self) -> Vec<(ItemId, Occupancy)> {
        self.grid
            .visible()
            .into_iter()
            .filter_map(|item| {
                let cell: CellId = item.id.clone().into();
                self.presence
                    .with_state(|s| s.occupant_of(&cell).cloned())
                    .map(|occ| (item.id.clone(), occ))
            })
            .collect()
    }

    pub fn grid(&self) -> &MergeGrid {
        &self.grid
    }

    pub fn presence(&self) -> &GridPresence {
        &self.presence
    }
}
