//! Lane writer: per-worker serialization of features into side files.
//!
//! Each parser lane owns three append-only temporary files — a geometry
//! blob stream, a fixed-width index record stream, and a variable-length
//! attribute meta stream — plus an in-memory deduplicating string pool.
//! All four stay lane-local until the merge-to-global and sort stages take
//! them over.
//!
//! Lane temp files are unlinked at creation (the handle is the only name),
//! so closing one reclaims its disk immediately.

use crate::error::Result;
use crate::morton::{self, GridBbox, EMPTY_BBOX};
use crate::pool::StringPool;
use crate::record::{GeomType, IndexRecord, RECORD_WIRE_SIZE};
use crate::resources::Resources;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Attribute value type tag, as stored in the meta stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AttrType {
    String = 1,
    Number = 2,
    Bool = 3,
}

/// One feature attribute. Key and value both pass through the lane pool.
#[derive(Debug, Clone)]
pub struct Attr {
    pub key: String,
    pub value: String,
    pub vtype: AttrType,
}

/// A parsed feature, as handed to [`LaneWriter::write_feature`] by the
/// caller's chunk parser.
///
/// `blob` is opaque to the pipeline except for its final byte, which is
/// reserved for the feature minzoom and must be present (initially 0).
#[derive(Debug, Clone)]
pub struct Feature {
    pub kind: GeomType,
    /// Self-delimiting geometry encoding, reserved minzoom byte included.
    pub blob: Vec<u8>,
    /// Representative point on the 32-bit-per-axis grid.
    pub point: (u32, u32),
    /// Feature bounds on the grid: `[min_x, min_y, max_x, max_y]`.
    pub bbox: GridBbox,
    pub attrs: Vec<Attr>,
}

/// Descriptors a live lane holds open (geom + index + meta).
pub const LANE_FDS: u64 = 3;

const WRITE_BUF: usize = 256 * 1024; // 256 KB

/// Per-lane serializer. One per parser worker; never shared.
pub struct LaneWriter {
    segment: u16,
    geom: BufWriter<File>,
    geom_pos: u64,
    index: BufWriter<File>,
    index_pos: u64,
    meta: BufWriter<File>,
    meta_pos: u64,
    pool: StringPool,
    bbox: GridBbox,
    sequence: u64,
    record_count: u64,
}

impl LaneWriter {
    /// Create a lane with unlinked temp files under `tmp_dir`.
    pub fn new(tmp_dir: &Path, segment: u16, res: &Resources) -> Result<Self> {
        res.acquire_files(LANE_FDS)?;
        let geom = tempfile::tempfile_in(tmp_dir)?;
        let index = tempfile::tempfile_in(tmp_dir)?;
        let meta = tempfile::tempfile_in(tmp_dir)?;
        Ok(Self {
            segment,
            geom: BufWriter::with_capacity(WRITE_BUF, geom),
            geom_pos: 0,
            index: BufWriter::with_capacity(WRITE_BUF, index),
            index_pos: 0,
            meta: BufWriter::with_capacity(WRITE_BUF, meta),
            meta_pos: 0,
            pool: StringPool::new(),
            bbox: EMPTY_BBOX,
            sequence: 0,
            record_count: 0,
        })
    }

    /// Seed the sequence counter with the absolute byte offset of the chunk
    /// this lane is about to parse, so sequences stay globally unique and
    /// order-preserving with the input stream.
    pub fn set_initial_sequence(&mut self, seq: u64) {
        self.sequence = seq;
    }

    /// Lane identifier (the `segment` field of every record it writes).
    pub fn segment(&self) -> u16 {
        self.segment
    }

    /// Serialize one feature: blob to the geometry stream, attributes to the
    /// meta stream (strings through the pool), and a fully populated index
    /// record (minzoom 0) to the index stream.
    pub fn write_feature(&mut self, f: &Feature) -> io::Result<IndexRecord> {
        if f.blob.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "geometry blob must include its reserved minzoom byte",
            ));
        }

        let start = self.geom_pos;
        self.geom.write_all(&f.blob)?;
        self.geom_pos += f.blob.len() as u64;

        self.write_attr_row(&f.attrs)?;

        morton::fold_bbox(&mut self.bbox, &f.bbox);

        let record = IndexRecord {
            morton: morton::encode(f.point.0, f.point.1),
            start,
            end: self.geom_pos,
            seq: self.sequence,
            segment: self.segment,
            kind: f.kind.as_u8(),
            minzoom: 0,
        };
        let mut buf = [0u8; RECORD_WIRE_SIZE];
        record.write_le(&mut buf);
        self.index.write_all(&buf)?;
        self.index_pos += RECORD_WIRE_SIZE as u64;

        self.sequence += 1;
        self.record_count += 1;
        Ok(record)
    }

    /// Meta row: `count u32`, then `vtype u8, key_off u64, value_off u64`
    /// per attribute, offsets lane-local.
    fn write_attr_row(&mut self, attrs: &[Attr]) -> io::Result<()> {
        self.meta.write_all(&(attrs.len() as u32).to_le_bytes())?;
        self.meta_pos += 4;
        for attr in attrs {
            let key_off = self.pool.intern(attr.key.as_bytes());
            let val_off = self.pool.intern(attr.value.as_bytes());
            self.meta.write_all(&[attr.vtype as u8])?;
            self.meta.write_all(&key_off.to_le_bytes())?;
            self.meta.write_all(&val_off.to_le_bytes())?;
            self.meta_pos += 1 + 8 + 8;
        }
        Ok(())
    }

    /// Bytes this lane has committed to the temp filesystem. Geometry and
    /// index count twice because the sort duplicates them.
    pub fn committed_bytes(&self) -> u64 {
        self.meta_pos + 2 * self.geom_pos + 2 * self.index_pos + self.pool.len()
    }

    /// Records written so far.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Flush and hand over the side files.
    pub fn finish(self) -> io::Result<LaneFiles> {
        let geom = self.geom.into_inner().map_err(|e| e.into_error())?;
        let index = self.index.into_inner().map_err(|e| e.into_error())?;
        let meta = self.meta.into_inner().map_err(|e| e.into_error())?;
        Ok(LaneFiles {
            segment: self.segment,
            geom,
            geom_len: self.geom_pos,
            index,
            index_len: self.index_pos,
            meta,
            meta_len: self.meta_pos,
            pool: self.pool,
            bbox: self.bbox,
            record_count: self.record_count,
        })
    }
}

impl std::fmt::Debug for LaneWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaneWriter")
            .field("segment", &self.segment)
            .field("records", &self.record_count)
            .field("geom_pos", &self.geom_pos)
            .finish()
    }
}

/// A finished lane's side files, ready for the merge and sort stages.
///
/// Still holds [`LANE_FDS`] descriptors: the consumers of each file release
/// them as they close (meta at merge-to-global, geom/index at the sort).
#[derive(Debug)]
pub struct LaneFiles {
    pub segment: u16,
    pub geom: File,
    pub geom_len: u64,
    pub index: File,
    pub index_len: u64,
    pub meta: File,
    pub meta_len: u64,
    pub pool: StringPool,
    pub bbox: GridBbox,
    pub record_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::record::cmp_key;

    fn test_resources() -> Resources {
        Resources::detect(&PipelineConfig::default().with_workers(1).with_fd_budget(64))
    }

    fn point_feature(x: u32, y: u32, payload: &[u8]) -> Feature {
        let mut blob = payload.to_vec();
        blob.push(0); // reserved minzoom byte
        Feature {
            kind: GeomType::Point,
            blob,
            point: (x, y),
            bbox: [x, y, x, y],
            attrs: vec![],
        }
    }

    #[test]
    fn test_write_feature_populates_record() {
        let dir = tempfile::tempdir().unwrap();
        let res = test_resources();
        let mut lane = LaneWriter::new(dir.path(), 3, &res).unwrap();
        lane.set_initial_sequence(1000);

        let rec = lane.write_feature(&point_feature(7, 9, b"blob")).unwrap();
        assert_eq!(rec.morton, morton::encode(7, 9));
        assert_eq!(rec.start, 0);
        assert_eq!(rec.end, 5); // payload + reserved byte
        assert_eq!(rec.seq, 1000);
        assert_eq!(rec.segment, 3);
        assert_eq!(rec.minzoom, 0);

        let rec2 = lane.write_feature(&point_feature(7, 9, b"next")).unwrap();
        assert_eq!(rec2.seq, 1001);
        assert_eq!(rec2.start, 5);
        assert_eq!(rec2.end, 10);
    }

    #[test]
    fn test_empty_blob_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let res = test_resources();
        let mut lane = LaneWriter::new(dir.path(), 0, &res).unwrap();
        let f = Feature {
            kind: GeomType::Point,
            blob: vec![],
            point: (0, 0),
            bbox: [0, 0, 0, 0],
            attrs: vec![],
        };
        assert!(lane.write_feature(&f).is_err());
    }

    #[test]
    fn test_bbox_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let res = test_resources();
        let mut lane = LaneWriter::new(dir.path(), 0, &res).unwrap();
        lane.write_feature(&point_feature(100, 900, b"a")).unwrap();
        lane.write_feature(&point_feature(50, 1000, b"b")).unwrap();
        let files = lane.finish().unwrap();
        assert_eq!(files.bbox, [50, 900, 100, 1000]);
        res.release_files(LANE_FDS);
    }

    #[test]
    fn test_attrs_share_pool_entries() {
        let dir = tempfile::tempdir().unwrap();
        let res = test_resources();
        let mut lane = LaneWriter::new(dir.path(), 0, &res).unwrap();

        let mut f = point_feature(1, 1, b"x");
        f.attrs = vec![
            Attr {
                key: "kind".into(),
                value: "fountain".into(),
                vtype: AttrType::String,
            },
            Attr {
                key: "kind".into(),
                value: "fountain".into(),
                vtype: AttrType::String,
            },
        ];
        lane.write_feature(&f).unwrap();
        let files = lane.finish().unwrap();

        // "kind" + "fountain" stored once each.
        assert_eq!(files.pool.entry_count(), 2);
        // row header + two (vtype, key_off, val_off) entries
        assert_eq!(files.meta_len, 4 + 2 * 17);
        res.release_files(LANE_FDS);
    }

    #[test]
    fn test_records_sortable_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let res = test_resources();
        let mut lane = LaneWriter::new(dir.path(), 0, &res).unwrap();
        lane.set_initial_sequence(0);

        let mut records = Vec::new();
        for &(x, y) in &[(90u32, 90u32), (10, 10), (10, 10), (50, 50)] {
            records.push(lane.write_feature(&point_feature(x, y, b"p")).unwrap());
        }
        records.sort_unstable_by(cmp_key);
        // Duplicate points keep input order through the seq tie-break.
        assert_eq!(records[0].seq, 1);
        assert_eq!(records[1].seq, 2);
        assert!(records[0].morton <= records[2].morton);
        let files = lane.finish().unwrap();
        assert_eq!(files.record_count, 4);
        res.release_files(LANE_FDS);
    }
}
