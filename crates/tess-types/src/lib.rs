use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Canvas-wide change sequence number. `0` means "nothing committed yet".
pub type Seq = u64;

/// Opaque, stable user identity supplied by the identity layer in front of
/// the service. The core never authenticates it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        UserId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        UserId(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        UserId(s)
    }
}

/// A cell position. Always in range once constructed through [`Coord::checked`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Coord {
    pub x: u32,
    pub y: u32,
}

impl Coord {
    pub const fn new(x: u32, y: u32) -> Self {
        Coord { x, y }
    }

    /// Validate raw (possibly negative) coordinates against a canvas of side `size`.
    pub fn checked(x: i64, y: i64, size: u32) -> Result<Coord, TessError> {
        let side = i64::from(size);
        if x < 0 || y < 0 || x >= side || y >= side {
            return Err(TessError::OutOfRange { x, y, size });
        }
        Ok(Coord { x: x as u32, y: y as u32 })
    }

    /// Row-major index into a `size × size` grid.
    pub fn index(self, size: u32) -> usize {
        self.y as usize * size as usize + self.x as usize
    }

    pub fn from_index(index: usize, size: u32) -> Coord {
        let side = size as usize;
        Coord { x: (index % side) as u32, y: (index / side) as u32 }
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// 24-bit RGB color, `0xRRGGBB`. Text form is `#RRGGBB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Color(u32);

impl Color {
    pub const WHITE: Color = Color(0xFF_FF_FF);
    pub const BLACK: Color = Color(0x00_00_00);

    /// Color of a cell nobody has painted.
    pub const BLANK: Color = Color::WHITE;

    pub const fn from_rgb(r: u8, g: u8, b: u8) -> Self {
        Color(((r as u32) << 16) | ((g as u32) << 8) | b as u32)
    }

    /// Build from the low 24 bits of `raw`; higher bits are rejected.
    pub fn from_u32(raw: u32) -> Result<Self, TessError> {
        if raw > 0xFF_FF_FF {
            return Err(TessError::InvalidColor(format!("{raw:#x} exceeds 24 bits")));
        }
        Ok(Color(raw))
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    /// Fixed-width wire encoding.
    pub const fn to_bytes(self) -> [u8; 3] {
        [(self.0 >> 16) as u8, (self.0 >> 8) as u8, self.0 as u8]
    }

    pub const fn from_bytes(b: [u8; 3]) -> Self {
        Color::from_rgb(b[0], b[1], b[2])
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::BLANK
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:06X}", self.0)
    }
}

impl FromStr for Color {
    type Err = TessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix('#')
            .ok_or_else(|| TessError::InvalidColor(format!("'{s}' must start with '#'")))?;
        if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TessError::InvalidColor(format!("'{s}' is not #RRGGBB")));
        }
        u32::from_str_radix(hex, 16)
            .map(Color)
            .map_err(|e| TessError::InvalidColor(e.to_string()))
    }
}

/// Current state of one canvas position.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Cell {
    pub coord: Coord,
    pub color: Color,
    /// `None` until the cell is painted for the first time.
    pub last_writer: Option<UserId>,
    pub last_write_ns: i64,
    /// Sequence number of the change that produced this state (0 = never written).
    pub seq: Seq,
}

impl Cell {
    pub fn blank(coord: Coord) -> Self {
        Cell { coord, color: Color::BLANK, last_writer: None, last_write_ns: 0, seq: 0 }
    }
}

impl From<&ChangeRecord> for Cell {
    fn from(rec: &ChangeRecord) -> Self {
        Cell {
            coord: rec.coord,
            color: rec.color,
            last_writer: Some(rec.writer.clone()),
            last_write_ns: rec.commit_ns,
            seq: rec.seq,
        }
    }
}

/// Immutable, sequence-numbered fact describing one committed cell update.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChangeRecord {
    pub seq: Seq,
    pub coord: Coord,
    pub color: Color,
    pub writer: UserId,
    pub commit_ns: i64,
}

/// A change that has passed admission but has not been sequenced yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeDraft {
    pub coord: Coord,
    pub color: Color,
    pub writer: UserId,
}

impl ChangeDraft {
    pub fn sequence(self, seq: Seq, commit_ns: i64) -> ChangeRecord {
        ChangeRecord { seq, coord: self.coord, color: self.color, writer: self.writer, commit_ns }
    }
}

/// Point-in-time view of every cell together with the feed position it
/// corresponds to.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CanvasSnapshot {
    pub size: u32,
    /// Feed head at the instant the snapshot was taken.
    pub seq: Seq,
    /// Row-major, exactly `size * size` entries.
    pub cells: Vec<Cell>,
}

impl CanvasSnapshot {
    pub fn cell(&self, coord: Coord) -> Option<&Cell> {
        self.cells.get(coord.index(self.size))
    }

    /// Packed RGB, 3 bytes per cell, row-major.
    pub fn packed_rgb(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.cells.len() * 3);
        for cell in &self.cells {
            buf.extend_from_slice(&cell.color.to_bytes());
        }
        buf
    }
}

/// Observer-side replica of the canvas colors, driven by a snapshot plus the
/// change records that follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanvasView {
    size: u32,
    last_seq: Seq,
    colors: Vec<Color>,
}

impl CanvasView {
    pub fn blank(size: u32) -> Self {
        CanvasView {
            size,
            last_seq: 0,
            colors: vec![Color::BLANK; size as usize * size as usize],
        }
    }

    pub fn from_snapshot(snapshot: &CanvasSnapshot) -> Self {
        CanvasView {
            size: snapshot.size,
            last_seq: snapshot.seq,
            colors: snapshot.cells.iter().map(|c| c.color).collect(),
        }
    }

    /// Rebuild from packed RGB bytes as sent on the wire.
    pub fn from_packed(size: u32, seq: Seq, pixels: &[u8]) -> Result<Self, TessError> {
        let expected = (size as usize)
            .checked_mul(size as usize)
            .and_then(|cells| cells.checked_mul(3))
            .ok_or_else(|| TessError::InvalidArgument(format!("canvas size {size} is too large")))?;
        if pixels.len() != expected {
            return Err(TessError::InvalidArgument(format!(
                "packed canvas has {} bytes, expected {expected}",
                pixels.len()
            )));
        }
        let colors = pixels
            .chunks_exact(3)
            .map(|c| Color::from_bytes([c[0], c[1], c[2]]))
            .collect();
        Ok(CanvasView { size, last_seq: seq, colors })
    }

    /// Apply one change. Returns `false` (and changes nothing) when the
    /// record is not newer than what the view already reflects.
    pub fn apply(&mut self, record: &ChangeRecord) -> bool {
        if record.seq <= self.last_seq {
            return false;
        }
        if let Some(slot) = self.colors.get_mut(record.coord.index(self.size)) {
            *slot = record.color;
        }
        self.last_seq = record.seq;
        true
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn last_seq(&self) -> Seq {
        self.last_seq
    }

    pub fn color(&self, coord: Coord) -> Option<Color> {
        self.colors.get(coord.index(self.size)).copied()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TessError {
    #[error("coordinate ({x}, {y}) outside canvas of size {size}")]
    OutOfRange { x: i64, y: i64, size: u32 },
    #[error("invalid color: {0}")]
    InvalidColor(String),
    #[error("cooldown active, retry after {retry_after:?}")]
    CooldownActive { retry_after: Duration },
    #[error("history truncated: requested changes after {requested}, earliest resumable is {earliest}")]
    HistoryTruncated { requested: Seq, earliest: Seq },
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("transport closed")]
    TransportClosed,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl TessError {
    /// Whole seconds to wait, rounded up, for a cooldown denial.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            TessError::CooldownActive { retry_after } => Some(ceil_secs(*retry_after)),
            _ => None,
        }
    }
}

pub fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_parses_and_formats() {
        let c: Color = "#ff7f00".parse().unwrap();
        assert_eq!(c, Color::from_rgb(0xFF, 0x7F, 0x00));
        assert_eq!(c.to_string(), "#FF7F00");
        assert_eq!(Color::from_bytes(c.to_bytes()), c);
    }

    #[test]
    fn color_rejects_malformed_text() {
        for bad in ["FF0000", "#FF00", "#GG0000", "#FF00000", ""] {
            assert!(matches!(bad.parse::<Color>(), Err(TessError::InvalidColor(_))), "{bad}");
        }
        assert!(Color::from_u32(0x01_00_00_00).is_err());
    }

    #[test]
    fn coord_range_checks() {
        assert_eq!(Coord::checked(49, 0, 50).unwrap(), Coord::new(49, 0));
        assert!(matches!(
            Coord::checked(50, 0, 50),
            Err(TessError::OutOfRange { x: 50, y: 0, size: 50 })
        ));
        assert!(Coord::checked(-1, 3, 50).is_err());
        assert!(Coord::checked(3, -1, 50).is_err());
    }

    #[test]
    fn coord_index_is_row_major() {
        let c = Coord::new(3, 2);
        assert_eq!(c.index(10), 23);
        assert_eq!(Coord::from_index(23, 10), c);
    }

    #[test]
    fn view_ignores_stale_records() {
        let mut view = CanvasView::blank(4);
        let red = Color::from_rgb(0xFF, 0, 0);
        let rec = ChangeRecord {
            seq: 1,
            coord: Coord::new(1, 1),
            color: red,
            writer: "a".into(),
            commit_ns: 0,
        };
        assert!(view.apply(&rec));
        assert!(!view.apply(&rec));
        assert_eq!(view.color(Coord::new(1, 1)), Some(red));
        assert_eq!(view.last_seq(), 1);
    }

    #[test]
    fn packed_snapshot_rebuilds_view() {
        let mut cells: Vec<Cell> = (0..4).map(|i| Cell::blank(Coord::from_index(i, 2))).collect();
        cells[3].color = Color::BLACK;
        let snap = CanvasSnapshot { size: 2, seq: 9, cells };
        let packed = snap.packed_rgb();
        assert_eq!(packed.len(), 12);

        let view = CanvasView::from_packed(2, 9, &packed).unwrap();
        assert_eq!(view, CanvasView::from_snapshot(&snap));
        assert!(CanvasView::from_packed(2, 9, &packed[..9]).is_err());
    }

    #[test]
    fn oversized_packed_canvas_is_rejected() {
        assert!(matches!(
            CanvasView::from_packed(u32::MAX, 0, &[0; 3]),
            Err(TessError::InvalidArgument(_))
        ));
    }

    #[test]
    fn retry_after_rounds_up() {
        let err = TessError::CooldownActive { retry_after: Duration::from_millis(54_001) };
        assert_eq!(err.retry_after_secs(), Some(55));
        let err = TessError::CooldownActive { retry_after: Duration::from_secs(55) };
        assert_eq!(err.retry_after_secs(), Some(55));
    }
}
