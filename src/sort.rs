//! External radix sort of index records by Morton key.
//!
//! Run through the index and geometry for each lane, splitting the contents
//! out by the high bits of the Morton key into as many partition files as
//! the descriptor budget allows. Then sort each partition — recursively on
//! deeper key bits if it is too big to fit in memory — and append each
//! sorted partition to the single output pair. Partition files are unlinked
//! at creation, so closing one reclaims its disk immediately.
//!
//! A partition that fits in memory is sorted by N scoped workers over
//! page- and record-aligned segments of its index file, then the segments
//! are k-way merged with a manual min-heap. The merge is where each
//! feature's geometry reaches its final position and where the drop
//! stamper assigns `feature_minzoom`.
//!
//! Guarantee: the output index holds every input record exactly once, in
//! `(morton, sequence)` order, with offsets into the merged geometry file;
//! byte-identical across runs for identical inputs, lane count, and
//! budgets.

use crate::drop::{feature_minzoom, DropPolicy, DropState};
use crate::error::{PipelineError, Result};
use crate::gather::SortInput;
use crate::mapping::{advise, advise_mut, Advice};
use crate::record::{cmp_key, IndexRecord, RECORD_WIRE_SIZE};
use crate::resources::Resources;
use memmap2::{Mmap, MmapOptions};
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

const WRITE_BUF: usize = 256 * 1024;

/// Segment alignment for the parallel in-memory sort: the least common
/// multiple of the page size and the record size, so segment boundaries
/// satisfy both mmap offset alignment and record stride.
const SEGMENT_ALIGN: u64 = 12_288; // lcm(4096, 48)

/// Don't sort more than 2 GiB in one segment (rounded down to alignment).
const MAX_SEGMENT: u64 = (2 * 1024 * 1024 * 1024 / SEGMENT_ALIGN) * SEGMENT_ALIGN;

/// A temporary (geometry, index) pair holding one radix bucket.
#[derive(Debug)]
struct Partition {
    geom: File,
    geom_len: u64,
    index: File,
    index_len: u64,
}

/// Shared read-only context for one sort run.
struct SortCtx<'a> {
    tmp_dir: &'a Path,
    res: &'a Resources,
    cpus: usize,
    mem: u64,
    maxzoom: u8,
    policy: &'a DropPolicy,
}

/// The single output pair plus the mutable stamping state.
struct Emit<'a> {
    geom: &'a mut BufWriter<File>,
    geom_pos: u64,
    index: &'a mut BufWriter<File>,
    states: &'a mut [DropState],
    records_out: u64,
}

/// Sort all lane pairs into `out_geom`/`out_index`, stamping minzooms as
/// records are emitted. Returns (records emitted, final geometry length).
#[allow(clippy::too_many_arguments)]
pub(crate) fn radix_sort(
    inputs: Vec<SortInput>,
    out_geom: &mut BufWriter<File>,
    out_index: &mut BufWriter<File>,
    tmp_dir: &Path,
    res: &Resources,
    cpus: usize,
    maxzoom: u8,
    policy: &DropPolicy,
    states: &mut [DropState],
) -> Result<(u64, u64)> {
    let n_inputs = inputs.len() as i64;
    let avail_before = res.available_files();

    let splits = res.available_files() / 4;
    if splits < 2 {
        return Err(PipelineError::ResourceExhausted(format!(
            "cannot open a useful number of partition files: {} descriptors available",
            res.available_files()
        )));
    }

    let ctx = SortCtx {
        tmp_dir,
        res,
        cpus,
        mem: res.mem_budget,
        maxzoom,
        policy,
    };
    let mut emit = Emit {
        geom: out_geom,
        geom_pos: 0,
        index: out_index,
        states,
        records_out: 0,
    };

    let partitions = inputs
        .into_iter()
        .map(|input| Partition {
            geom: input.geom,
            geom_len: input.geom_len,
            index: input.index,
            index_len: input.index_len,
        })
        .collect();
    radix_level(partitions, 0, splits, &ctx, &mut emit)?;

    // Closing the lane inputs freed two descriptors each; everything the
    // sort itself opened must be back.
    let expected = avail_before + 2 * n_inputs;
    if res.available_files() != expected {
        return Err(PipelineError::InvariantViolation(format!(
            "miscounted descriptors in sort: {} available, expected {}",
            res.available_files(),
            expected
        )));
    }

    Ok((emit.records_out, emit.geom_pos))
}

/// One level of radix partitioning. `splits` is the caller's descriptor
/// allowance divided by the four-per-partition cost; it is rounded down to
/// a power of two so a still-huge bucket can subdivide on the next bits.
fn radix_level(
    inputs: Vec<Partition>,
    prefix: u32,
    splits: i64,
    ctx: &SortCtx<'_>,
    emit: &mut Emit<'_>,
) -> Result<()> {
    let splitbits = (splits.max(2) as u64).ilog2();
    let splits = 1usize << splitbits;

    debug!(prefix, splitbits, inputs = inputs.len(), "radix level");

    let mut geoms = Vec::with_capacity(splits);
    let mut indexes = Vec::with_capacity(splits);
    let mut sub_geompos = vec![0u64; splits];
    let mut key_bounds: Vec<Option<(u64, u64)>> = vec![None; splits];
    for _ in 0..splits {
        ctx.res.acquire_files(2)?;
        geoms.push(BufWriter::with_capacity(
            WRITE_BUF,
            tempfile::tempfile_in(ctx.tmp_dir)?,
        ));
        indexes.push(BufWriter::with_capacity(
            WRITE_BUF,
            tempfile::tempfile_in(ctx.tmp_dir)?,
        ));
    }

    for input in inputs {
        if input.index_len > 0 {
            let index_map = unsafe { Mmap::map(&input.index)? };
            advise(&index_map, Advice::Sequential);
            advise(&index_map, Advice::WillNeed);
            let geom_map = unsafe { Mmap::map(&input.geom)? };
            advise(&geom_map, Advice::Sequential);
            advise(&geom_map, Advice::WillNeed);

            for chunk in index_map.chunks_exact(RECORD_WIRE_SIZE) {
                let mut record = IndexRecord::read_le(chunk);
                let bucket = ((record.morton << prefix) >> (64 - splitbits)) as usize;

                key_bounds[bucket] = Some(match key_bounds[bucket] {
                    Some((lo, hi)) => (lo.min(record.morton), hi.max(record.morton)),
                    None => (record.morton, record.morton),
                });

                let blob = &geom_map[record.start as usize..record.end as usize];
                geoms[bucket].write_all(blob)?;

                record.start = sub_geompos[bucket];
                sub_geompos[bucket] += blob.len() as u64;
                record.end = sub_geompos[bucket];

                let mut buf = [0u8; RECORD_WIRE_SIZE];
                record.write_le(&mut buf);
                indexes[bucket].write_all(&buf)?;
            }

            advise(&index_map, Advice::DontNeed);
            advise(&geom_map, Advice::DontNeed);
        }
        drop(input.geom);
        drop(input.index);
        ctx.res.release_files(2);
    }

    let mut partitions = Vec::with_capacity(splits);
    for (i, (geom, index)) in geoms.into_iter().zip(indexes).enumerate() {
        let geom = geom.into_inner().map_err(|e| e.into_error())?;
        let index = index.into_inner().map_err(|e| e.into_error())?;
        let geom_len = geom.metadata()?.len();
        let index_len = index.metadata()?.len();
        partitions.push((
            Partition {
                geom,
                geom_len,
                index,
                index_len,
            },
            key_bounds[i],
        ));
    }

    for (partition, bounds) in partitions {
        if partition.index_len == 0 {
            drop(partition);
            ctx.res.release_files(2);
            continue;
        }

        let uniform = matches!(bounds, Some((lo, hi)) if lo == hi);
        if partition.index_len + partition.geom_len < ctx.mem {
            sort_and_merge(&partition, ctx, emit)?;
        } else if partition.index_len == RECORD_WIRE_SIZE as u64
            || prefix + splitbits >= 64
            || uniform
        {
            // Nothing more to partition on: a lone record, an exhausted
            // prefix, or a bucket whose records all share one key, which
            // deeper bits could never separate. Stream it through; only
            // the sequence tie-break is left to settle.
            emit_sorted_runs(&partition, ctx, emit)?;
        } else {
            let deeper_splits = ctx.res.available_files() / 4;
            radix_level(
                vec![partition],
                prefix + splitbits,
                deeper_splits,
                ctx,
                emit,
            )?;
            continue; // recursion closed the partition
        }

        ctx.res.release_files(2);
    }

    Ok(())
}

// ============================================================================
// In-memory partition sort + k-way merge
// ============================================================================

/// Page/record-aligned segment length for `index_len` across `cpus` workers.
fn segment_unit(index_len: u64, cpus: usize) -> u64 {
    let per_cpu = index_len / cpus as u64 + 1;
    let aligned = per_cpu.div_ceil(SEGMENT_ALIGN) * SEGMENT_ALIGN;
    aligned.clamp(SEGMENT_ALIGN, MAX_SEGMENT)
}

/// Sort a partition whose (index + geometry) fits the memory budget:
/// parallel per-segment sort through a shared map of the index file, then a
/// k-way merge of the segments into the output.
fn sort_and_merge(partition: &Partition, ctx: &SortCtx<'_>, emit: &mut Emit<'_>) -> Result<()> {
    let index_len = partition.index_len;
    let unit = segment_unit(index_len, ctx.cpus);

    let mut index_map = unsafe { MmapOptions::new().map_mut(&partition.index)? };
    advise_mut(&index_map, Advice::Random);
    advise_mut(&index_map, Advice::WillNeed);

    // Carve the map into aligned segments and deal them round-robin.
    {
        let mut segments: Vec<&mut [u8]> = Vec::new();
        let mut rest = &mut index_map[..];
        while rest.len() as u64 > unit {
            let (seg, tail) = rest.split_at_mut(unit as usize);
            segments.push(seg);
            rest = tail;
        }
        if !rest.is_empty() {
            segments.push(rest);
        }

        let mut queues: Vec<Vec<&mut [u8]>> = (0..ctx.cpus).map(|_| Vec::new()).collect();
        for (i, seg) in segments.into_iter().enumerate() {
            queues[i % ctx.cpus].push(seg);
        }

        std::thread::scope(|scope| {
            let handles: Vec<_> = queues
                .into_iter()
                .map(|queue| {
                    scope.spawn(move || {
                        for seg in queue {
                            sort_segment(seg);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().map_err(|_| {
                    PipelineError::InvariantViolation("sort worker panicked".into())
                })?;
            }
            Ok::<(), PipelineError>(())
        })?;
    }
    index_map.flush()?;

    let geom_map = unsafe { Mmap::map(&partition.geom)? };
    advise(&geom_map, Advice::Random);
    advise(&geom_map, Advice::WillNeed);

    // Merge the sorted segments.
    let mut cursors = Vec::new();
    let mut start = 0u64;
    while start < index_len {
        let end = (start + unit).min(index_len);
        cursors.push(SegmentCursor {
            data: &index_map,
            pos: start as usize,
            end: end as usize,
        });
        start = end;
    }
    let mut merge = KWayMerge::new(cursors);
    while let Some(record) = merge.next_record() {
        emit_record(&record, &geom_map, ctx, emit)?;
    }

    advise(&geom_map, Advice::DontNeed);
    drop(geom_map);
    advise_mut(&index_map, Advice::DontNeed);
    drop(index_map);
    Ok(())
}

/// Decode, sort, and write back one aligned segment.
fn sort_segment(seg: &mut [u8]) {
    let mut records: Vec<IndexRecord> = seg
        .chunks_exact(RECORD_WIRE_SIZE)
        .map(IndexRecord::read_le)
        .collect();
    records.sort_unstable_by(cmp_key);
    for (chunk, record) in seg.chunks_exact_mut(RECORD_WIRE_SIZE).zip(&records) {
        let mut buf = [0u8; RECORD_WIRE_SIZE];
        record.write_le(&mut buf);
        chunk.copy_from_slice(&buf);
    }
}

/// Emit a partition that cannot usefully be subdivided: a lone record, or
/// records sharing a single Morton key. Such a partition can be far larger
/// than the memory budget, so it is never buffered; the index is streamed
/// straight off its mapping.
///
/// Every lane wrote its records in ascending sequence order and each
/// partitioning pass preserves per-lane relative order, so the partition
/// index is a concatenation of at most one ascending run per lane. Merging
/// those runs settles the `(morton, sequence)` order with memory
/// proportional to the run count, not the partition size.
fn emit_sorted_runs(partition: &Partition, ctx: &SortCtx<'_>, emit: &mut Emit<'_>) -> Result<()> {
    let index_map = unsafe { Mmap::map(&partition.index)? };
    advise(&index_map, Advice::Sequential);
    advise(&index_map, Advice::WillNeed);
    let geom_map = unsafe { Mmap::map(&partition.geom)? };
    advise(&geom_map, Advice::Random);
    advise(&geom_map, Advice::WillNeed);

    let runs = ascending_runs(&index_map);
    let cursors = runs
        .iter()
        .map(|&(start, end)| SegmentCursor {
            data: &index_map,
            pos: start,
            end,
        })
        .collect();
    let mut merge = KWayMerge::new(cursors);
    while let Some(record) = merge.next_record() {
        emit_record(&record, &geom_map, ctx, emit)?;
    }

    advise(&index_map, Advice::DontNeed);
    advise(&geom_map, Advice::DontNeed);
    Ok(())
}

/// Byte ranges of the maximal ascending runs in a record stream. An
/// already-sorted file comes back as a single run covering the whole map.
fn ascending_runs(index_map: &[u8]) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut run_start = 0usize;
    let mut prev: Option<IndexRecord> = None;
    let mut pos = 0usize;
    for chunk in index_map.chunks_exact(RECORD_WIRE_SIZE) {
        let record = IndexRecord::read_le(chunk);
        if let Some(p) = &prev {
            if cmp_key(p, &record) == Ordering::Greater {
                runs.push((run_start, pos));
                run_start = pos;
            }
        }
        prev = Some(record);
        pos += RECORD_WIRE_SIZE;
    }
    if pos > run_start {
        runs.push((run_start, pos));
    }
    runs
}

/// Copy one record's geometry to its final position, stamp its minzoom
/// into the blob's reserved last byte, and write the rewritten record.
fn emit_record(
    record: &IndexRecord,
    geom_map: &[u8],
    ctx: &SortCtx<'_>,
    emit: &mut Emit<'_>,
) -> Result<()> {
    let blob = &geom_map[record.start as usize..record.end as usize];
    let pos = emit.geom_pos;

    let mz = feature_minzoom(record, emit.states, ctx.maxzoom, ctx.policy);
    emit.geom.write_all(&blob[..blob.len() - 1])?;
    emit.geom.write_all(&[mz])?;
    emit.geom_pos += blob.len() as u64;

    let out = IndexRecord {
        start: pos,
        end: emit.geom_pos,
        minzoom: mz,
        ..*record
    };
    let mut buf = [0u8; RECORD_WIRE_SIZE];
    out.write_le(&mut buf);
    emit.index.write_all(&buf)?;
    emit.records_out += 1;
    Ok(())
}

// ============================================================================
// K-way merge — manual min-heap over sorted index segments
// ============================================================================

struct SegmentCursor<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
}

impl SegmentCursor<'_> {
    fn peek(&self) -> Option<IndexRecord> {
        if self.pos < self.end {
            Some(IndexRecord::read_le(&self.data[self.pos..self.pos + RECORD_WIRE_SIZE]))
        } else {
            None
        }
    }

    fn advance(&mut self) {
        self.pos += RECORD_WIRE_SIZE;
    }
}

/// Entry in the min-heap: a record + which segment it came from.
struct HeapEntry {
    record: IndexRecord,
    stream_idx: usize,
}

/// K-way merge over sorted segment cursors with a manual min-heap.
/// Ties (impossible for distinct `(morton, seq)` pairs, but kept for
/// strictness) break on the segment index.
struct KWayMerge<'a> {
    heap: Vec<HeapEntry>,
    streams: Vec<SegmentCursor<'a>>,
}

impl<'a> KWayMerge<'a> {
    fn new(streams: Vec<SegmentCursor<'a>>) -> Self {
        let mut heap = Vec::with_capacity(streams.len());
        for (idx, stream) in streams.iter().enumerate() {
            if let Some(record) = stream.peek() {
                heap.push(HeapEntry {
                    record,
                    stream_idx: idx,
                });
            }
        }
        let mut merge = Self { heap, streams };
        if merge.heap.len() > 1 {
            let last_internal = (merge.heap.len() / 2).saturating_sub(1);
            for i in (0..=last_internal).rev() {
                merge.sift_down(i);
            }
        }
        merge
    }

    #[inline]
    fn heap_less(&self, i: usize, j: usize) -> bool {
        match cmp_key(&self.heap[i].record, &self.heap[j].record) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => self.heap[i].stream_idx < self.heap[j].stream_idx,
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < len && self.heap_less(right, left) {
                smallest = right;
            }
            if !self.heap_less(smallest, pos) {
                break;
            }
            self.heap.swap(pos, smallest);
            pos = smallest;
        }
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.heap_less(pos, parent) {
                break;
            }
            self.heap.swap(pos, parent);
            pos = parent;
        }
    }

    /// Pop the next record in merge order.
    fn next_record(&mut self) -> Option<IndexRecord> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let entry = self.heap.pop().expect("heap non-empty");
        if !self.heap.is_empty() {
            self.sift_down(0);
        }

        let idx = entry.stream_idx;
        self.streams[idx].advance();
        if let Some(record) = self.streams[idx].peek() {
            self.heap.push(HeapEntry {
                record,
                stream_idx: idx,
            });
            let pos = self.heap.len() - 1;
            self.sift_up(pos);
        }

        Some(entry.record)
    }
}
