use tess_types::{Coord, Seq};

/// `cells` keyspace: `y(4) ++ x(4)`, big-endian, so a full scan yields cells
/// in row-major order.
pub fn cell_key(coord: Coord) -> [u8; 8] {
    let mut key = [0u8; 8];
    key[..4].copy_from_slice(&coord.y.to_be_bytes());
    key[4..].copy_from_slice(&coord.x.to_be_bytes());
    key
}

/// `change_log` keyspace: `seq(8)` big-endian → lexicographic order = numeric order.
pub fn log_key(seq: Seq) -> [u8; 8] {
    seq.to_be_bytes()
}

/// Decode a `change_log` key back into its sequence number.
pub fn seq_from_log_key(key: &[u8]) -> Option<Seq> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(Seq::from_be_bytes(bytes))
}

/// `meta` keyspace labels.
pub const META_LAST_SEQ: &str = "last_seq";
pub const META_LAST_PURGED: &str = "last_purged";

pub fn meta_key(label: &str) -> Vec<u8> {
    label.as_bytes().to_vec()
}
