//! Ingestion fan-out: split a byte stream at separator boundaries and parse
//! the chunks on N worker lanes.
//!
//! Two modes:
//!
//! - **Mapped**: the whole input is memory-mapped, cut into N roughly equal
//!   chunks advanced to the next separator, and parsed by N scoped worker
//!   threads, each driving its own [`LaneWriter`].
//! - **Stream**: the input is spooled serially into an unlinked temp file.
//!   Once the spill passes a low water mark *and* ends on a separator, it is
//!   handed to a single background helper that maps it and runs the same
//!   N-way parse, while the reader keeps spooling into a fresh file. The
//!   helper owns the lanes while it runs and returns them on join, so the
//!   reader can never race a parser. A hard cap bounds how far the reader
//!   gets ahead: past it, the reader blocks on the in-flight helper instead
//!   of continuing to stream.
//!
//! Worker sequence numbers are seeded from absolute input byte offsets, so
//! the global input order of features stays recoverable by sorting on
//! `sequence` even though chunks parse in parallel.

use crate::config::{SEPARATOR_NEWLINE, SEPARATOR_RS};
use crate::error::{PipelineError, Result};
use crate::lane::LaneWriter;
use crate::mapping::{advise, Advice};
use crate::resources::Resources;
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use tracing::debug;

/// Parses raw feature bytes and drives a lane writer.
///
/// Implementations skip malformed features (reporting them with a warning
/// and the byte offset) and return `Err` only for fatal conditions — any
/// I/O error from [`LaneWriter::write_feature`] aborts the whole run.
pub trait ChunkParser: Sync {
    fn parse_chunk(&self, chunk: &[u8], lane: &mut LaneWriter) -> Result<()>;
}

/// Pick the separator: RS streams announce themselves with their first byte.
pub fn sniff_separator(first_byte: Option<u8>) -> u8 {
    match first_byte {
        Some(SEPARATOR_RS) => SEPARATOR_RS,
        _ => SEPARATOR_NEWLINE,
    }
}

/// Spill thresholds for stream mode. Split out so tests can shrink them.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SpillLimits {
    /// Low water mark: don't bother dispatching smaller spills.
    pub min: u64,
    /// Hard cap: past this, block on the in-flight parser.
    pub max: u64,
}

impl Default for SpillLimits {
    fn default() -> Self {
        Self {
            min: 10_000_000,
            max: 1 << 30, // 1 GiB
        }
    }
}

const READ_BUF: usize = 64 * 1024;
const SPILL_BUF: usize = 256 * 1024;

/// `n + 1` chunk boundaries: `len * i / n` advanced to the next separator.
/// Boundaries are forced monotone so every chunk is a valid slice.
pub(crate) fn split_points(map: &[u8], n: usize, separator: u8) -> Vec<usize> {
    let len = map.len();
    let mut segs = vec![0usize; n + 1];
    segs[n] = len;
    for i in 1..n {
        let mut s = len * i / n;
        while s < len && map[s] != separator {
            s += 1;
        }
        segs[i] = s.max(segs[i - 1]);
    }
    segs
}

/// Parse `map` on all lanes at once. Each lane's sequence is seeded with
/// `initial_offset` plus its chunk's offset into the map.
pub(crate) fn parse_parallel<P: ChunkParser>(
    map: &[u8],
    initial_offset: u64,
    lanes: &mut [LaneWriter],
    parser: &P,
    separator: u8,
) -> Result<()> {
    let segs = split_points(map, lanes.len(), separator);

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(lanes.len());
        for (i, lane) in lanes.iter_mut().enumerate() {
            let chunk = &map[segs[i]..segs[i + 1]];
            lane.set_initial_sequence(initial_offset + segs[i] as u64);
            handles.push(scope.spawn(move || parser.parse_chunk(chunk, lane)));
        }
        for handle in handles {
            handle
                .join()
                .map_err(|_| PipelineError::InvariantViolation("parser worker panicked".into()))??;
        }
        Ok(())
    })
}

/// Mapped mode: mmap `file` and run the N-way parse over it.
///
/// Returns the number of input bytes consumed (the file length).
pub(crate) fn ingest_mapped<P: ChunkParser>(
    file: &File,
    initial_offset: u64,
    lanes: &mut [LaneWriter],
    parser: &P,
    separator: Option<u8>,
) -> Result<u64> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(0);
    }
    let map = unsafe { Mmap::map(file)? };
    // Sequential access, but from several pointers at once.
    advise(&map, Advice::Random);

    let separator = separator.unwrap_or_else(|| sniff_separator(map.first().copied()));
    parse_parallel(&map, initial_offset, lanes, parser, separator)?;

    advise(&map, Advice::DontNeed);
    drop(map);
    Ok(len)
}

/// Map a finished spill file and run the N-way parse, consuming and
/// returning the lanes. Runs on the background helper thread.
fn parse_spill<P: ChunkParser>(
    spill: File,
    len: u64,
    initial_offset: u64,
    mut lanes: Vec<LaneWriter>,
    parser: &P,
    separator: u8,
    res: &Resources,
) -> Result<Vec<LaneWriter>> {
    let actual = spill.metadata()?.len();
    if actual != len {
        return Err(PipelineError::InvariantViolation(format!(
            "wrong number of bytes in spill: expected {}, file has {}",
            len, actual
        )));
    }

    let map = unsafe { Mmap::map(&spill)? };
    advise(&map, Advice::Random);
    let result = parse_parallel(&map, initial_offset, &mut lanes, parser, separator);
    advise(&map, Advice::DontNeed);
    drop(map);
    drop(spill);
    res.release_files(1);
    result.map(|()| lanes)
}

/// Stream mode: spool `input`, overlapping reading with parsing.
///
/// Takes ownership of the lanes (the helper thread holds them while it
/// runs) and returns them with the number of bytes consumed.
pub(crate) fn ingest_stream<R: Read, P: ChunkParser>(
    input: R,
    start_offset: u64,
    lanes: Vec<LaneWriter>,
    parser: &P,
    separator: Option<u8>,
    tmp_dir: &Path,
    res: &Resources,
) -> Result<(Vec<LaneWriter>, u64)> {
    ingest_stream_with_limits(
        input,
        start_offset,
        lanes,
        parser,
        separator,
        tmp_dir,
        res,
        SpillLimits::default(),
    )
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn ingest_stream_with_limits<R: Read, P: ChunkParser>(
    mut input: R,
    start_offset: u64,
    lanes: Vec<LaneWriter>,
    parser: &P,
    separator: Option<u8>,
    tmp_dir: &Path,
    res: &Resources,
    limits: SpillLimits,
) -> Result<(Vec<LaneWriter>, u64)> {
    let new_spill = |res: &Resources| -> Result<BufWriter<File>> {
        res.acquire_files(1)?;
        Ok(BufWriter::with_capacity(
            SPILL_BUF,
            tempfile::tempfile_in(tmp_dir)?,
        ))
    };

    let mut spill = new_spill(res)?;
    let mut ahead: u64 = 0;
    let mut initial_offset = start_offset;
    let mut overall_offset = start_offset;
    let mut separator = separator;

    let lanes = std::thread::scope(|scope| -> Result<Vec<LaneWriter>> {
        let mut lanes_slot = Some(lanes);
        let mut pending: Option<std::thread::ScopedJoinHandle<'_, Result<Vec<LaneWriter>>>> = None;
        let mut buf = [0u8; READ_BUF];

        loop {
            let n = match input.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if separator.is_none() {
                separator = Some(sniff_separator(Some(buf[0])));
            }
            let sep = separator.unwrap_or(SEPARATOR_NEWLINE);

            spill.write_all(&buf[..n])?;
            ahead += n as u64;

            if buf[n - 1] == sep && ahead > limits.min {
                // Don't let the streaming reader get too far ahead of the
                // parsers: if the buffered input passes the hard cap, wait
                // for the helper instead of continuing to stream.
                let idle = pending.as_ref().map_or(true, |h| h.is_finished());
                if idle || ahead >= limits.max {
                    if let Some(handle) = pending.take() {
                        lanes_slot = Some(join_spill_helper(handle)?);
                    }

                    let full = std::mem::replace(&mut spill, new_spill(res)?);
                    let file = full.into_inner().map_err(|e| e.into_error())?;
                    let worker_lanes = lanes_slot.take().ok_or_else(|| {
                        PipelineError::InvariantViolation("lanes missing at spill dispatch".into())
                    })?;
                    let len = ahead;
                    let off = initial_offset;
                    debug!(bytes = len, offset = off, "dispatching spill to parser");
                    pending = Some(scope.spawn(move || {
                        parse_spill(file, len, off, worker_lanes, parser, sep, res)
                    }));

                    initial_offset += ahead;
                    overall_offset += ahead;
                    ahead = 0;
                }
            }
        }

        if let Some(handle) = pending.take() {
            lanes_slot = Some(join_spill_helper(handle)?);
        }
        let mut lanes = lanes_slot.ok_or_else(|| {
            PipelineError::InvariantViolation("lanes missing at end of stream".into())
        })?;

        // Whatever is left in the final spill parses inline.
        let file = spill.into_inner().map_err(|e| e.into_error())?;
        if ahead > 0 {
            let sep = separator.unwrap_or(SEPARATOR_NEWLINE);
            let map = unsafe { Mmap::map(&file)? };
            advise(&map, Advice::Random);
            parse_parallel(&map, initial_offset, &mut lanes, parser, sep)?;
            advise(&map, Advice::DontNeed);
            drop(map);
            overall_offset += ahead;
        }
        drop(file);
        res.release_files(1);

        Ok(lanes)
    })?;

    Ok((lanes, overall_offset - start_offset))
}

fn join_spill_helper(
    handle: std::thread::ScopedJoinHandle<'_, Result<Vec<LaneWriter>>>,
) -> Result<Vec<LaneWriter>> {
    handle
        .join()
        .map_err(|_| PipelineError::InvariantViolation("spill parser panicked".into()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::lane::Feature;
    use crate::record::GeomType;

    /// Lines of `x y` grid coordinates; anything else is malformed and
    /// skipped.
    struct PointParser;

    impl ChunkParser for PointParser {
        fn parse_chunk(&self, chunk: &[u8], lane: &mut LaneWriter) -> Result<()> {
            for line in chunk.split(|&b| b == SEPARATOR_NEWLINE) {
                if line.is_empty() {
                    continue;
                }
                let text = std::str::from_utf8(line).unwrap_or("");
                let mut parts = text.split_whitespace();
                let (x, y) = match (
                    parts.next().and_then(|v| v.parse::<u32>().ok()),
                    parts.next().and_then(|v| v.parse::<u32>().ok()),
                ) {
                    (Some(x), Some(y)) => (x, y),
                    _ => continue, // malformed: skip
                };
                let mut blob = line.to_vec();
                blob.push(0);
                lane.write_feature(&Feature {
                    kind: GeomType::Point,
                    blob,
                    point: (x, y),
                    bbox: [x, y, x, y],
                    attrs: vec![],
                })?;
            }
            Ok(())
        }
    }

    fn test_resources(workers: usize) -> Resources {
        Resources::detect(
            &PipelineConfig::default()
                .with_workers(workers)
                .with_fd_budget(128),
        )
    }

    fn make_lanes(dir: &Path, n: usize, res: &Resources) -> Vec<LaneWriter> {
        (0..n)
            .map(|i| LaneWriter::new(dir, i as u16, res).unwrap())
            .collect()
    }

    fn release_lanes(lanes: Vec<LaneWriter>, res: &Resources) {
        for lane in lanes {
            lane.finish().unwrap();
            res.release_files(crate::lane::LANE_FDS);
        }
    }

    #[test]
    fn test_split_points_land_on_separators() {
        let data = b"aa\nbbbb\ncc\ndddd\nee\n".to_vec();
        let segs = split_points(&data, 4, b'\n');
        assert_eq!(segs.len(), 5);
        assert_eq!(segs[0], 0);
        assert_eq!(segs[4], data.len());
        for i in 1..4 {
            assert!(segs[i] == data.len() || data[segs[i]] == b'\n');
            assert!(segs[i] >= segs[i - 1]);
        }
    }

    #[test]
    fn test_split_points_no_separator() {
        let data = vec![b'x'; 100];
        let segs = split_points(&data, 4, b'\n');
        // Everything collapses into the final chunk.
        assert_eq!(segs, vec![0, 100, 100, 100, 100]);
    }

    #[test]
    fn test_sniff_separator() {
        assert_eq!(sniff_separator(Some(0x1E)), SEPARATOR_RS);
        assert_eq!(sniff_separator(Some(b'{')), SEPARATOR_NEWLINE);
        assert_eq!(sniff_separator(None), SEPARATOR_NEWLINE);
    }

    #[test]
    fn test_parse_parallel_preserves_order_via_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let res = test_resources(4);
        let mut lanes = make_lanes(dir.path(), 4, &res);

        let mut data = Vec::new();
        for i in 0..100u32 {
            data.extend_from_slice(format!("{} {}\n", i, i).as_bytes());
        }
        parse_parallel(&data, 0, &mut lanes, &PointParser, b'\n').unwrap();

        let total: u64 = lanes.iter().map(|l| l.record_count()).sum();
        assert_eq!(total, 100);
        // More than one lane did real work on 100 lines.
        assert!(lanes.iter().filter(|l| l.record_count() > 0).count() > 1);
        release_lanes(lanes, &res);
    }

    #[test]
    fn test_parse_parallel_skips_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let res = test_resources(2);
        let mut lanes = make_lanes(dir.path(), 2, &res);

        let data = b"1 2\nnot a point\n3 4\n".to_vec();
        parse_parallel(&data, 0, &mut lanes, &PointParser, b'\n').unwrap();
        let total: u64 = lanes.iter().map(|l| l.record_count()).sum();
        assert_eq!(total, 2);
        release_lanes(lanes, &res);
    }

    #[test]
    fn test_ingest_stream_dispatches_spills() {
        let dir = tempfile::tempdir().unwrap();
        let res = test_resources(2);
        let lanes = make_lanes(dir.path(), 2, &res);

        let mut data = Vec::new();
        let count = 5000u32;
        for i in 0..count {
            data.extend_from_slice(format!("{} {}\n", i * 7, i * 11).as_bytes());
        }
        let limits = SpillLimits { min: 4096, max: 64 * 1024 };
        let (lanes, consumed) = ingest_stream_with_limits(
            std::io::Cursor::new(&data),
            0,
            lanes,
            &PointParser,
            Some(b'\n'),
            dir.path(),
            &res,
            limits,
        )
        .unwrap();

        assert_eq!(consumed, data.len() as u64);
        let total: u64 = lanes.iter().map(|l| l.record_count()).sum();
        assert_eq!(total, count as u64);
        release_lanes(lanes, &res);
        assert!(res.check_file_accounting().is_ok());
    }

    #[test]
    fn test_ingest_stream_small_input_single_flush() {
        let dir = tempfile::tempdir().unwrap();
        let res = test_resources(2);
        let lanes = make_lanes(dir.path(), 2, &res);

        let data = b"5 6\n7 8\n".to_vec();
        let (lanes, consumed) = ingest_stream(
            std::io::Cursor::new(&data),
            1000,
            lanes,
            &PointParser,
            None,
            dir.path(),
            &res,
        )
        .unwrap();
        assert_eq!(consumed, data.len() as u64);
        let total: u64 = lanes.iter().map(|l| l.record_count()).sum();
        assert_eq!(total, 2);
        release_lanes(lanes, &res);
        assert!(res.check_file_accounting().is_ok());
    }
}
