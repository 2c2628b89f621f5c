//! Merge-to-global: combine per-lane attribute streams after ingestion.
//!
//! Lane meta rows and pool entries hold lane-local offsets. Rather than
//! rewrite every row, the lanes' files are concatenated and the base offset
//! of each lane recorded, so `(segment, offset)` still locates any row or
//! string through the offset tables. Geometry and index files are not
//! touched here — they go to the sort next.

use crate::error::Result;
use crate::lane::LaneFiles;
use crate::resources::Resources;
use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Remaining sort input from one lane after the sidecars are merged away.
#[derive(Debug)]
pub struct SortInput {
    pub segment: u16,
    pub geom: File,
    pub geom_len: u64,
    pub index: File,
    pub index_len: u64,
    pub record_count: u64,
}

/// The merged attribute files plus per-lane base-offset tables.
#[derive(Debug)]
pub struct GlobalSidecars {
    pub meta_path: PathBuf,
    pub pool_path: PathBuf,
    /// `meta_off[lane]` = bytes of merged meta preceding that lane's rows.
    pub meta_off: Vec<u64>,
    /// `pool_off[lane]` = bytes of merged pool preceding that lane's entries.
    pub pool_off: Vec<u64>,
    pub meta_len: u64,
    pub pool_len: u64,
}

const COPY_BUF: usize = 256 * 1024;

/// Create a named, kept output file under `tmp_dir`.
fn named_output(tmp_dir: &Path, prefix: &str) -> io::Result<(File, PathBuf)> {
    let named = tempfile::Builder::new()
        .prefix(prefix)
        .tempfile_in(tmp_dir)?;
    named.keep().map_err(|e| e.error)
}

/// Concatenate lane meta files and pools, consuming those halves of the
/// lane state and returning the geometry/index pairs for the sort.
pub(crate) fn merge_sidecars(
    lanes: Vec<LaneFiles>,
    tmp_dir: &Path,
    res: &Resources,
) -> Result<(Vec<SortInput>, GlobalSidecars)> {
    res.acquire_files(2)?;
    let (meta_file, meta_path) = named_output(tmp_dir, "meta.")?;
    let (pool_file, pool_path) = named_output(tmp_dir, "pool.")?;
    let mut meta_out = BufWriter::with_capacity(COPY_BUF, meta_file);
    let mut pool_out = BufWriter::with_capacity(COPY_BUF, pool_file);

    let mut meta_off = Vec::with_capacity(lanes.len());
    let mut pool_off = Vec::with_capacity(lanes.len());
    let mut meta_pos = 0u64;
    let mut pool_pos = 0u64;
    let mut inputs = Vec::with_capacity(lanes.len());

    for lane in lanes {
        let LaneFiles {
            segment,
            geom,
            geom_len,
            index,
            index_len,
            mut meta,
            meta_len,
            pool,
            bbox: _,
            record_count,
        } = lane;

        meta_off.push(meta_pos);
        if meta_len > 0 {
            meta.seek(SeekFrom::Start(0))?;
            let copied = io::copy(&mut meta, &mut meta_out)?;
            if copied != meta_len {
                return Err(crate::error::PipelineError::InvariantViolation(format!(
                    "lane {} meta stream: copied {} of {} bytes",
                    segment, copied, meta_len
                )));
            }
        }
        meta_pos += meta_len;
        drop(meta);
        res.release_files(1);

        pool_off.push(pool_pos);
        pool.write_to(&mut pool_out)?;
        pool_pos += pool.len();

        inputs.push(SortInput {
            segment,
            geom,
            geom_len,
            index,
            index_len,
            record_count,
        });
    }

    meta_out.into_inner().map_err(|e| e.into_error())?.flush()?;
    pool_out.into_inner().map_err(|e| e.into_error())?.flush()?;
    res.release_files(2);

    debug!(
        meta_bytes = meta_pos,
        pool_bytes = pool_pos,
        lanes = inputs.len(),
        "merged lane sidecars"
    );

    Ok((
        inputs,
        GlobalSidecars {
            meta_path,
            pool_path,
            meta_off,
            pool_off,
            meta_len: meta_pos,
            pool_len: pool_pos,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::lane::{Attr, AttrType, Feature, LaneWriter};
    use crate::record::GeomType;

    fn feature_with_attr(x: u32, key: &str, value: &str) -> Feature {
        Feature {
            kind: GeomType::Point,
            blob: vec![1, 2, 0],
            point: (x, x),
            bbox: [x, x, x, x],
            attrs: vec![Attr {
                key: key.into(),
                value: value.into(),
                vtype: AttrType::String,
            }],
        }
    }

    #[test]
    fn test_merge_records_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let res = Resources::detect(
            &PipelineConfig::default().with_workers(2).with_fd_budget(64),
        );

        let mut lanes = Vec::new();
        for seg in 0..2u16 {
            let mut lane = LaneWriter::new(dir.path(), seg, &res).unwrap();
            lane.write_feature(&feature_with_attr(seg as u32, "name", "a")).unwrap();
            lane.write_feature(&feature_with_attr(seg as u32 + 1, "name", "b")).unwrap();
            lanes.push(lane.finish().unwrap());
        }
        let lane0_meta = lanes[0].meta_len;
        let lane0_pool = lanes[0].pool.len();

        let (inputs, sidecars) = merge_sidecars(lanes, dir.path(), &res).unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(sidecars.meta_off, vec![0, lane0_meta]);
        assert_eq!(sidecars.pool_off, vec![0, lane0_pool]);

        let meta_bytes = std::fs::metadata(&sidecars.meta_path).unwrap().len();
        assert_eq!(meta_bytes, sidecars.meta_len);
        let pool_bytes = std::fs::metadata(&sidecars.pool_path).unwrap().len();
        assert_eq!(pool_bytes, sidecars.pool_len);

        // Pool content survives the copy: first entry of lane 0 is "name".
        let pool = std::fs::read(&sidecars.pool_path).unwrap();
        let len = u32::from_le_bytes(pool[0..4].try_into().unwrap()) as usize;
        assert_eq!(&pool[4..4 + len], b"name");

        // Only geom+index descriptors remain held.
        for input in inputs {
            drop(input.geom);
            drop(input.index);
            res.release_files(2);
        }
        assert!(res.check_file_accounting().is_ok());
    }
}
