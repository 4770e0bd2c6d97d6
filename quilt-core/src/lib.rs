//! Shared model types for the quilt collaborative grid.
//!
//! Everything here is plain data: identifiers, roster records, occupancy
//! records, and the integer rectangles the merge grid is made of. The
//! networked half lives in `quilt-collab`, the geometry in `quilt-layout`.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod config;

/// Opaque token naming one grid position.
///
/// Stable for the grid's lifetime. The flat presence grid uses `"row-col"`
/// tokens; the merge grid reuses its item ids.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId(String);

impl CellId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Canonical token for a flat-grid position.
    pub fn at(row: u32, col: u32) -> Self {
        Self(format!("{row}-{col}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CellId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<ItemId> for CellId {
    fn from(id: ItemId) -> Self {
        Self(id.0)
    }
}

/// Identifier of one merge-grid item.
///
/// The id set is fixed at grid construction; items are repositioned,
/// resized, hidden, or revealed but never created or destroyed mid-session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-session identity assigned by the hub.
///
/// Lifetime equals the underlying connection's lifetime; a reconnect gets
/// a fresh identity. Also the deterministic seed for the user's color.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Mint a fresh identity (hub side).
    pub fn assign() -> Self {
        Self(Uuid::new_v4())
    }

    /// Sentinel identity for events arriving over the string fallback
    /// channel, which carries no sender identity.
    pub fn relayed() -> Self {
        Self(Uuid::nil())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Short hex form used in hub-assigned display names.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Roster entry for one connected user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub connection_id: ConnectionId,
    pub display_name: String,
    /// Opaque `#rrggbb` token, derived deterministically from the identity.
    pub color: String,
}

impl UserRecord {
    /// Build the hub-assigned record for a fresh connection: short-hex
    /// display name and a stable color seeded by the identity.
    pub fn assigned(connection_id: ConnectionId) -> Self {
        Self {
            display_name: format!("user-{}", connection_id.short()),
            color: derive_color(connection_id),
            connection_id,
        }
    }
}

/// One cell held by one occupant, from a single observer's point of view.
///
/// At most one record exists per cell at any instant. Created when a select
/// is accepted, destroyed on deselect or on the occupant's departure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Occupancy {
    pub cell: CellId,
    pub occupant: ConnectionId,
    pub display_name: String,
    pub color: String,
}

impl Occupancy {
    pub fn new(cell: CellId, user: &UserRecord) -> Self {
        Self {
            cell,
            occupant: user.connection_id,
            display_name: user.display_name.clone(),
            color: user.color.clone(),
        }
    }
}

/// Stable, visually distinct color token for an identity.
///
/// Hue comes from the identity hash; saturation and lightness are fixed
/// high so adjacent users stay tellable apart.
pub fn derive_color(id: ConnectionId) -> String {
    let hash = id.as_uuid().as_u128();
    let hue = ((hash % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0) as u8,
        (g * 255.0) as u8,
        (b * 255.0) as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    let r = hue_to_rgb(p, q, h + 1.0 / 3.0);
    let g = hue_to_rgb(p, q, h);
    let b = hue_to_rgb(p, q, h - 1.0 / 3.0);

    (r, g, b)
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Axis-aligned integer rectangle on the `[0, cols) × [0, rows)` canvas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridRect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl GridRect {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    /// Far edge on the horizontal axis (exclusive).
    #[inline]
    pub fn right(&self) -> i32 {
        self.x + self.w
    }

    /// Far edge on the vertical axis (exclusive).
    #[inline]
    pub fn bottom(&self) -> i32 {
        self.y + self.h
    }
}

/// Payload a grid item carries for its rendering collaborator.
///
/// Opaque to the layout engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub enum ItemContent {
    #[default]
    Empty,
    Card {
        title: String,
        subtitle: String,
        discount: String,
        price: String,
        sale_price: String,
    },
}

/// One merge-grid item.
///
/// `hidden_by` is an id back-reference to the absorbing item — a relation,
/// not ownership. It is set exactly while the absorption lasts and cleared
/// on revelation. A hidden item keeps its pre-absorption rectangle so a
/// later revelation restores it in place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridItem {
    pub id: ItemId,
    pub rect: GridRect,
    pub hidden: bool,
    pub hidden_by: Option<ItemId>,
    pub content: ItemContent,
}

impl GridItem {
    /// A visible 1×1 item at the given position.
    pub fn unit(id: ItemId, x: i32, y: i32) -> Self {
        Self {
            id,
            rect: GridRect::new(x, y, 1, 1),
            hidden: false,
            hidden_by: None,
            content: ItemContent::Empty,
        }
    }

    pub fn with_content(mut self, content: ItemContent) -> Self {
        self.content = content;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_id_at() {
        assert_eq!(CellId::at(2, 3).as_str(), "2-3");
    }

    #[test]
    fn test_cell_id_from_item_id() {
        let item = ItemId::new("7");
        let cell: CellId = item.into();
        assert_eq!(cell.as_str(), "7");
    }

    #[test]
    fn test_connection_id_short_len() {
        let id = ConnectionId::assign();
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn test_relayed_identity_is_stable() {
        assert_eq!(ConnectionId::relayed(), ConnectionId::relayed());
    }

    #[test]
    fn test_derive_color_stable() {
        let id = ConnectionId::assign();
        assert_eq!(derive_color(id), derive_color(id));
    }

    #[test]
    fn test_derive_color_format() {
        let color = derive_color(ConnectionId::assign());
        assert_eq!(color.len(), 7);
        assert!(color.starts_with('#'));
    }

    #[test]
    fn test_assigned_record() {
        let id = ConnectionId::assign();
        let user = UserRecord::assigned(id);
        assert_eq!(user.connection_id, id);
        assert!(user.display_name.starts_with("user-"));
        assert_eq!(user.color, derive_color(id));
    }

    #[test]
    fn test_occupancy_copies_user_fields() {
        let user = UserRecord::assigned(ConnectionId::assign());
        let occ = Occupancy::new(CellId::at(0, 0), &user);
        assert_eq!(occ.occupant, user.connection_id);
        assert_eq!(occ.display_name, user.display_name);
        assert_eq!(occ.color, user.color);
    }

    #[test]
    fn test_rect_far_edges() {
        let r = GridRect::new(1, 2, 3, 4);
        assert_eq!(r.right(), 4);
        assert_eq!(r.bottom(), 6);
    }

    #[test]
    fn test_unit_item() {
        let item = GridItem::unit(ItemId::new("1"), 2, 3);
        assert_eq!(item.rect, GridRect::new(2, 3, 1, 1));
        assert!(!item.hidden);
        assert!(item.hidden_by.is_none());
        assert_eq!(item.content, ItemContent::Empty);
    }
}
