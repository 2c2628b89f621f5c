//! Pipeline orchestration: ingest → merge-to-global → sort → stamp.
//!
//! Wires the stages together for one run: detects resource budgets, builds
//! the worker lanes, feeds every input source through the fan-out, merges
//! the attribute sidecars, runs the external sort with first-pass minzoom
//! stamping, resolves any "auto" zoom parameters from the sorted index,
//! and re-stamps when they changed. Returns the paths and offset tables
//! the downstream tiler needs.

use crate::config::{BasezoomSpec, DroprateSpec, MaxzoomSpec, PipelineConfig};
use crate::drop::{self, DropPolicy};
use crate::error::{PipelineError, Result};
use crate::gather;
use crate::ingest::{self, ChunkParser};
use crate::lane::{LaneWriter, LANE_FDS};
use crate::mapping::{advise, Advice};
use crate::morton::{self, GridBbox, EMPTY_BBOX};
use crate::resources::Resources;
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const WRITE_BUF: usize = 256 * 1024;

/// One input source for a run.
pub enum Input {
    /// A file; memory-mapped when it is a regular file, streamed otherwise.
    Path(PathBuf),
    /// An already-open byte stream, spooled through temp files.
    Reader(Box<dyn Read>),
}

impl std::fmt::Debug for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Input::Path(p) => f.debug_tuple("Path").field(p).finish(),
            Input::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

/// Everything the downstream tiler needs from the core.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Globally sorted geometry blob stream.
    pub geometry_path: PathBuf,
    /// Globally sorted 48-byte index records referencing `geometry_path`.
    pub index_path: PathBuf,
    /// Concatenated attribute meta rows.
    pub meta_path: PathBuf,
    /// Concatenated attribute string pool.
    pub pool_path: PathBuf,
    /// Per-lane base offsets into `meta_path`.
    pub meta_off: Vec<u64>,
    /// Per-lane base offsets into `pool_path`.
    pub pool_off: Vec<u64>,
    /// Final (possibly inferred) zoom parameters.
    pub maxzoom: u8,
    pub minzoom: u8,
    pub basezoom: u8,
    pub droprate: f64,
    /// Records in the sorted index.
    pub features: u64,
    /// Length of the merged geometry stream.
    pub geometry_bytes: u64,
    /// Folded feature bounds on the 32-bit grid.
    pub bbox: GridBbox,
    /// Lowest tile that covers the whole (buffered) bbox at or below
    /// minzoom.
    pub first_tile: (u8, u32, u32),
}

/// Run the core pipeline over `inputs`, parsing with `parser`.
pub fn run<P: ChunkParser>(
    config: &PipelineConfig,
    inputs: Vec<Input>,
    parser: &P,
) -> Result<PipelineOutput> {
    config.validate()?;
    ignore_sigpipe();
    let res = Resources::detect(config);
    info!(
        workers = res.cpus,
        mem_budget = res.mem_budget,
        "starting pipeline"
    );

    // Randomized dropping needs the rate and base known while reading; with
    // either unresolved, fall back to evenly distributed dropping.
    let mut gamma = config.gamma;
    let basezoom_unresolved = matches!(config.basezoom, BasezoomSpec::Guess)
        || (matches!(config.basezoom, BasezoomSpec::FollowMaxzoom)
            && matches!(config.maxzoom, MaxzoomSpec::Guess));
    if gamma < 0.0 && (basezoom_unresolved || matches!(config.droprate, DroprateSpec::Guess)) {
        warn!("forcing gamma 0 since basezoom or droprate is not known yet");
        gamma = 0.0;
    }
    let policy = DropPolicy {
        gamma,
        drop_lines: config.drop_lines,
        drop_polygons: config.drop_polygons,
    };

    // ---- C2/C1: ingest every source through the worker lanes ----

    let mut lanes: Vec<LaneWriter> = (0..res.cpus)
        .map(|i| LaneWriter::new(&config.tmp_dir, i as u16, &res))
        .collect::<Result<_>>()?;

    let mut overall_offset = 0u64;
    for input in inputs {
        match input {
            Input::Path(path) => {
                let file = File::open(&path)?;
                let meta = file.metadata()?;
                if meta.is_file() {
                    overall_offset += ingest::ingest_mapped(
                        &file,
                        overall_offset,
                        &mut lanes,
                        parser,
                        config.separator,
                    )?;
                } else {
                    let (returned, consumed) = ingest::ingest_stream(
                        file,
                        overall_offset,
                        lanes,
                        parser,
                        config.separator,
                        &config.tmp_dir,
                        &res,
                    )?;
                    lanes = returned;
                    overall_offset += consumed;
                }
            }
            Input::Reader(reader) => {
                let (returned, consumed) = ingest::ingest_stream(
                    reader,
                    overall_offset,
                    lanes,
                    parser,
                    config.separator,
                    &config.tmp_dir,
                    &res,
                )?;
                lanes = returned;
                overall_offset += consumed;
            }
        }
        let committed: u64 = lanes.iter().map(|l| l.committed_bytes()).sum();
        res.check_disk(committed);
    }

    let mut bbox = EMPTY_BBOX;
    let mut features_in = 0u64;
    let mut finished = Vec::with_capacity(lanes.len());
    for lane in lanes {
        let files = lane.finish()?;
        morton::fold_bbox(&mut bbox, &files.bbox);
        features_in += files.record_count;
        finished.push(files);
    }

    if features_in == 0 {
        for files in finished {
            drop(files);
            res.release_files(LANE_FDS);
        }
        res.check_file_accounting()?;
        return Err(PipelineError::NoGeometries);
    }

    // ---- C3: merge the attribute sidecars ----

    let (sort_inputs, sidecars) = gather::merge_sidecars(finished, &config.tmp_dir, &res)?;

    // ---- C4 + first-pass C5 ----

    let mut maxzoom = config.provisional_maxzoom();
    let mut basezoom = match config.basezoom {
        BasezoomSpec::Value(z) => z,
        BasezoomSpec::FollowMaxzoom | BasezoomSpec::Guess => maxzoom,
    };
    let mut droprate = match config.droprate {
        DroprateSpec::Value(r) => r,
        DroprateSpec::Guess => 2.5,
    };
    let fix_dropping = matches!(config.maxzoom, MaxzoomSpec::Guess)
        || matches!(config.basezoom, BasezoomSpec::Guess)
        || matches!(config.droprate, DroprateSpec::Guess);

    res.acquire_files(2)?;
    let (geom_file, geometry_path) = named_output(&config.tmp_dir, "geom.")?;
    let (index_file, index_path) = named_output(&config.tmp_dir, "index.")?;
    let mut out_geom = BufWriter::with_capacity(WRITE_BUF, geom_file);
    let mut out_index = BufWriter::with_capacity(WRITE_BUF, index_file);

    let mut states = drop::prep_drop_states(maxzoom, basezoom, droprate);
    let (features, geometry_bytes) = crate::sort::radix_sort(
        sort_inputs,
        &mut out_geom,
        &mut out_index,
        &config.tmp_dir,
        &res,
        res.cpus,
        maxzoom,
        &policy,
        &mut states,
    )?;

    let mut geom_file = out_geom.into_inner().map_err(|e| e.into_error())?;
    geom_file.flush()?;
    let mut index_file = out_index.into_inner().map_err(|e| e.into_error())?;
    index_file.flush()?;

    info!(
        features,
        geometry_bytes,
        meta_bytes = sidecars.meta_len,
        pool_bytes = sidecars.pool_len,
        "sorted feature stream"
    );

    if features != features_in {
        return Err(PipelineError::InvariantViolation(format!(
            "sort emitted {} records for {} input features",
            features, features_in
        )));
    }

    // ---- C5: resolve auto zoom parameters against the sorted index ----

    if fix_dropping {
        let index_map = unsafe { Mmap::map(&index_file)? };
        advise(&index_map, Advice::Sequential);
        advise(&index_map, Advice::WillNeed);

        if matches!(config.maxzoom, MaxzoomSpec::Guess) {
            maxzoom = drop::guess_maxzoom(&index_map)?;
            if maxzoom < config.minzoom {
                warn!(
                    maxzoom,
                    minzoom = config.minzoom,
                    "guessed maxzoom below minzoom, raising it"
                );
                maxzoom = config.minzoom;
            }
            if matches!(
                config.basezoom,
                BasezoomSpec::FollowMaxzoom | BasezoomSpec::Guess
            ) {
                basezoom = maxzoom;
            }
        }

        if matches!(config.basezoom, BasezoomSpec::Guess)
            || matches!(config.droprate, DroprateSpec::Guess)
        {
            let choice = drop::choose_basezoom_droprate(
                &index_map,
                maxzoom,
                config.basezoom,
                config.droprate,
                gamma,
                config.basezoom_marker_width,
            );
            basezoom = choice.basezoom;
            droprate = choice.droprate;
        }

        advise(&index_map, Advice::DontNeed);
    }

    if fix_dropping {
        // Now that the base zoom and drop rate are really known, fix up the
        // per-feature minzooms over the sorted stream.
        drop::restamp(&index_file, &geom_file, maxzoom, basezoom, droprate, &policy)?;
    }

    drop(geom_file);
    drop(index_file);
    res.release_files(2);

    res.check_file_accounting()?;

    let first_tile = morton::first_common_tile(&bbox, config.minzoom, config.buffer);
    info!(
        maxzoom,
        basezoom, droprate, "pipeline complete"
    );

    Ok(PipelineOutput {
        geometry_path,
        index_path,
        meta_path: sidecars.meta_path,
        pool_path: sidecars.pool_path,
        meta_off: sidecars.meta_off,
        pool_off: sidecars.pool_off,
        maxzoom,
        minzoom: config.minzoom,
        basezoom,
        droprate,
        features,
        geometry_bytes,
        bbox,
        first_tile,
    })
}

/// Create a named, kept output file under `tmp_dir`.
fn named_output(tmp_dir: &Path, prefix: &str) -> Result<(File, PathBuf)> {
    let named = tempfile::Builder::new()
        .prefix(prefix)
        .tempfile_in(tmp_dir)?;
    named.keep().map_err(|e| PipelineError::Io(e.error))
}

/// Broken downstream consumers must surface as write errors, not kill the
/// process.
fn ignore_sigpipe() {
    #[cfg(unix)]
    {
        static ONCE: std::sync::Once = std::sync::Once::new();
        ONCE.call_once(|| unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        });
    }
}
