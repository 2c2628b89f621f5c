//! 48-byte fixed-width index record for the external sort.
//!
//! One record per feature. The record is the unit of sort; geometry stays
//! in side files and is only ever addressed through `geom_start..geom_end`.
//!
//! ## Wire layout (48 bytes, little-endian)
//!
//! ```text
//! morton:   u64   [0..8]     space-filling-curve key
//! start:    u64   [8..16]    blob start in the owning geometry file
//! end:      u64   [16..24]   blob end (exclusive); end > start always
//! seq:      u64   [24..32]   absolute input order (offset-seeded)
//! segment:  u16   [32..34]   producing lane
//! kind:     u8    [34]       geometry type
//! minzoom:  u8    [35]       lowest zoom the feature is kept at
//! _pad:     [u8;12][36..48]  reserved
//! ```
//!
//! Before the sort, `(segment, start, end)` identifies the feature in its
//! lane's geometry file; after the sort, `start/end` refer to the merged
//! geometry file.

use std::cmp::Ordering;

/// Wire format size of a single IndexRecord, in bytes.
pub const RECORD_WIRE_SIZE: usize = 48;

/// Geometry type of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GeomType {
    Point = 1,
    Line = 2,
    Polygon = 3,
}

impl GeomType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Point),
            2 => Some(Self::Line),
            3 => Some(Self::Polygon),
            _ => None,
        }
    }
}

/// Fixed-width record for the external sort.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct IndexRecord {
    /// Morton key of the feature's representative point.
    pub morton: u64,
    /// Blob start offset in the owning geometry file.
    pub start: u64,
    /// Blob end offset (exclusive).
    pub end: u64,
    /// Input-order sequence number, seeded from the absolute byte offset of
    /// the producing chunk so the union across lanes is order-preserving.
    pub seq: u64,
    /// Lane that produced the record.
    pub segment: u16,
    /// Geometry type discriminant (see [`GeomType`]).
    pub kind: u8,
    /// Feature minzoom; 0 until the drop stamper runs.
    pub minzoom: u8,
}

impl IndexRecord {
    /// Serialize to [`RECORD_WIRE_SIZE`] bytes, little-endian.
    pub fn write_le(&self, buf: &mut [u8; RECORD_WIRE_SIZE]) {
        buf[0..8].copy_from_slice(&self.morton.to_le_bytes());
        buf[8..16].copy_from_slice(&self.start.to_le_bytes());
        buf[16..24].copy_from_slice(&self.end.to_le_bytes());
        buf[24..32].copy_from_slice(&self.seq.to_le_bytes());
        buf[32..34].copy_from_slice(&self.segment.to_le_bytes());
        buf[34] = self.kind;
        buf[35] = self.minzoom;
        buf[36..48].fill(0); // reserved
    }

    /// Deserialize from [`RECORD_WIRE_SIZE`] bytes, little-endian.
    pub fn read_le(buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= RECORD_WIRE_SIZE);
        Self {
            morton: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            start: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            end: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            seq: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            segment: u16::from_le_bytes(buf[32..34].try_into().unwrap()),
            kind: buf[34],
            minzoom: buf[35],
        }
    }

    /// Blob length in bytes, including the reserved trailing minzoom byte.
    #[inline]
    pub fn blob_len(&self) -> u64 {
        self.end - self.start
    }
}

/// Sort comparator: lexicographic on `(morton, seq)`.
///
/// The sequence tie-break makes the order deterministic across runs:
/// features with identical keys keep their input order.
#[inline]
pub fn cmp_key(a: &IndexRecord, b: &IndexRecord) -> Ordering {
    a.morton.cmp(&b.morton).then(a.seq.cmp(&b.seq))
}
