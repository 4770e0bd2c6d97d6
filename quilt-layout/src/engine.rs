//! The merge-grid item arena and the gesture-commit pipeline.
//!
//! Items live in a flat id-keyed map. `hidden_by` back-references are ids,
//! never direct references, so a commit can reassign the arena atomically.
//! One [`MergeGrid::commit`] call covers a whole gesture end: overlap set,
//! absorption, revelation, bounding-box merge, and canvas clamp — an item
//! landing on several previously separate absorbed groups merges them all
//! in that single call.

use quilt_core::{GridItem, GridRect, ItemContent, ItemId};
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::geom::{bounding_box, clamp_to_canvas, overlaps};

#[derive(Error, Debug, PartialEq)]
pub enum LayoutError {
    #[error("unknown item: {0}")]
    UnknownItem(ItemId),
    #[error("degenerate rectangle {w}x{h}")]
    DegenerateRect { w: i32, h: i32 },
}

/// Outcome of one committed gesture.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub moved: ItemId,
    /// The mover's final rectangle, after merge and clamp.
    pub rect: GridRect,
    /// Items newly hidden by this commit.
    pub absorbed: Vec<ItemId>,
    /// Items newly revealed by this commit.
    pub revealed: Vec<ItemId>,
}

/// Fixed-size integer grid of mergeable items.
///
/// The id set is fixed at construction. Between commits the visible items
/// never overlap; hidden items keep their pre-absorption geometry so a
/// later revelation restores them in place.
pub struct MergeGrid {
    cols: i32,
    rows: i32,
    items: FxHashMap<ItemId, GridItem>,
}

impl MergeGrid {
    /// Build a `cols × rows` grid of visible unit items, ids `"1"..`
    /// row-major.
    pub fn new(cols: u32, rows: u32) -> Self {
        assert!(cols > 0 && rows > 0, "grid must have at least one cell");
        let mut items = FxHashMap::default();
        let mut n = 1u32;
        for y in 0..rows {
            for x in 0..cols {
                let id = ItemId::new(n.to_string());
                items.insert(id.clone(), GridItem::unit(id, x as i32, y as i32));
                n += 1;
            }
        }
        Self {
            cols: cols as i32,
            rows: rows as i32,
            items,
        }
    }

    pub fn cols(&self) -> i32 {
        self.cols
    }

    pub fn rows(&self) -> i32 {
        self.rows
    }

    /// Total item count, hidden items included.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn item(&self, id: &ItemId) -> Option<&GridItem> {
        self.items.get(id)
    }

    pub fn items(&self) -> impl Iterator<Item = &GridItem> {
        self.items.values()
    }

    /// Attach render content to an item.
    pub fn set_content(&mut self, id: &ItemId, content: ItemContent) -> Result<(), LayoutError> {
        let item = self
            .items
            .get_mut(id)
            .ok_or_else(|| LayoutError::UnknownItem(id.clone()))?;
        item.content = content;
        Ok(())
    }

    /// Items eligible for layout and interaction.
    pub fn visible(&self) -> Vec<&GridItem> {
        self.items.values().filter(|i| !i.hidden).collect()
    }

    /// Display numbering for the visible set: sort by `(y, x)` ascending,
    /// number from 1. Derived on every call, never stored.
    pub fn labels(&self) -> Vec<(ItemId, u32)> {
        let mut ordered = self.visible();
        ordered.sort_by_key(|i| (i.rect.y, i.rect.x));
        ordered
            .into_iter()
            .zip(1..)
            .map(|(item, n)| (item.id.clone(), n))
            .collect()
    }

    /// Commit a gesture: apply the proposed rectangle to the moved item,
    /// absorb everything it overlaps, reveal what it no longer covers,
    /// grow to the group's bounding box, and clamp to the canvas.
    ///
    /// The overlap set is computed before clamping and is not revisited
    /// afterwards; a clamped rectangle that still touches a once-overlapped
    /// item is accepted.
    pub fn commit(&mut self, id: &ItemId, proposed: GridRect) -> Result<Commit, LayoutError> {
        if proposed.w < 1 || proposed.h < 1 {
            return Err(LayoutError::DegenerateRect {
                w: proposed.w,
                h: proposed.h,
            });
        }
        if !self.items.contains_key(id) {
            return Err(LayoutError::UnknownItem(id.clone()));
        }

        // Overlap set: every other item intersecting the proposed rectangle,
        // skipping items currently absorbed by someone else.
        let overlap: Vec<ItemId> = self
            .items
            .values()
            .filter(|other| {
                other.id != *id
                    && !(other.hidden && other.hidden_by.as_ref().is_some_and(|by| by != id))
                    && overlaps(&proposed, &other.rect)
            })
            .map(|other| other.id.clone())
            .collect();

        let mut absorbed = Vec::new();
        let mut revealed = Vec::new();
        for item in self.items.values_mut() {
            if overlap.contains(&item.id) {
                if !item.hidden {
                    absorbed.push(item.id.clone());
                }
                item.hidden = true;
                item.hidden_by = Some(id.clone());
            } else if item.hidden_by.as_ref() == Some(id) && !overlaps(&proposed, &item.rect) {
                item.hidden = false;
                item.hidden_by = None;
                revealed.push(item.id.clone());
            }
        }

        // Merge: the mover becomes the bounding box of itself plus its
        // overlap set, then the box is clamped to the canvas.
        let group = std::iter::once(proposed)
            .chain(overlap.iter().map(|oid| self.items[oid].rect))
            .collect::<Vec<_>>();
        let merged = bounding_box(group.iter()).unwrap_or(proposed);
        let rect = clamp_to_canvas(merged, self.cols, self.rows);

        if let Some(me) = self.items.get_mut(id) {
            me.rect = rect;
        }

        absorbed.sort();
        revealed.sort();
        log::debug!(
            "commit {id}: rect {rect:?}, absorbed {}, revealed {}",
            absorbed.len(),
            revealed.len()
        );

        Ok(Commit {
            moved: id.clone(),
            rect,
            absorbed,
            revealed,
        })
    }
}
