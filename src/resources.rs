//! Run-wide resource budgets: CPUs, memory, file descriptors, disk.
//!
//! Detected once at pipeline start and passed explicitly to every stage.
//! The descriptor counter is the only mutable piece; stages must open and
//! close budgeted files through [`Resources::acquire_files`] /
//! [`Resources::release_files`] so the end-of-run accounting invariant can
//! be checked.

use crate::config::{PipelineConfig, DEFAULT_FD_BUDGET};
use crate::error::{PipelineError, Result};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// Environment override for the worker count, checked before the
/// power-of-two clamp.
pub const MAX_THREADS_ENV: &str = "TILESPOOL_MAX_THREADS";

/// Sort memory budget substituted when `prefer_radix_sort` is set; small
/// enough that any realistic input recurses.
const RADIX_STRESS_MEM: u64 = 8192;

/// Fallback physical-memory assumption when detection reports zero
/// (sandboxes, containers without /proc).
const MEM_FALLBACK_BYTES: u64 = 16 * 1024 * 1024 * 1024;

/// Detected budgets plus the live descriptor counter for one run.
#[derive(Debug)]
pub struct Resources {
    /// Worker lane count: a power of two, >= 1, <= 32767 (the `segment`
    /// field is 16 bits).
    pub cpus: usize,
    /// Sort memory budget in bytes (already halved from physical RAM).
    pub mem_budget: u64,
    /// Total descriptor budget this run started with.
    fd_budget: i64,
    avail_files: Mutex<i64>,
    /// Free bytes on the temp filesystem at startup.
    disk_free: u64,
    disk_warned: AtomicBool,
}

impl Resources {
    /// Detect budgets for `config`, probing free space under its temp dir.
    pub fn detect(config: &PipelineConfig) -> Self {
        let cpus = match config.workers {
            Some(w) => w,
            None => detect_workers(),
        };

        let mem_budget = if config.prefer_radix_sort {
            RADIX_STRESS_MEM
        } else {
            match config.mem_budget_bytes {
                Some(b) => b,
                // Conservative: the whole point of the budget is to keep
                // sort partitions from thrashing.
                None => detect_physical_memory() / 2,
            }
        };

        let fd_budget = config.fd_budget.unwrap_or(DEFAULT_FD_BUDGET) as i64;
        let disk_free = detect_disk_free(&config.tmp_dir);

        Self {
            cpus,
            mem_budget,
            fd_budget,
            avail_files: Mutex::new(fd_budget),
            disk_free,
            disk_warned: AtomicBool::new(false),
        }
    }

    /// Claim `n` descriptors from the budget.
    pub fn acquire_files(&self, n: u64) -> Result<()> {
        let mut avail = self.avail_files.lock();
        if *avail < n as i64 {
            return Err(PipelineError::ResourceExhausted(format!(
                "file descriptor budget exhausted: need {}, {} of {} available",
                n, *avail, self.fd_budget
            )));
        }
        *avail -= n as i64;
        Ok(())
    }

    /// Return `n` descriptors to the budget.
    pub fn release_files(&self, n: u64) {
        *self.avail_files.lock() += n as i64;
    }

    /// Descriptors currently available.
    pub fn available_files(&self) -> i64 {
        *self.avail_files.lock()
    }

    /// Verify every acquired descriptor was released.
    pub fn check_file_accounting(&self) -> Result<()> {
        let avail = *self.avail_files.lock();
        if avail != self.fd_budget {
            return Err(PipelineError::InvariantViolation(format!(
                "miscounted file descriptors: {} available at end of run, {} at start",
                avail, self.fd_budget
            )));
        }
        Ok(())
    }

    /// One-shot warning when committed temp usage approaches free space.
    ///
    /// Geometry and index are counted twice: both are duplicated while
    /// sorting. Does not abort — the user may have planned for it.
    pub fn check_disk(&self, committed: u64) {
        if self.disk_free > 0
            && committed as f64 > self.disk_free as f64 * 0.9
            && !self.disk_warned.swap(true, Ordering::Relaxed)
        {
            warn!(
                committed_bytes = committed,
                free_bytes = self.disk_free,
                "you will probably run out of disk space"
            );
        }
    }
}

/// Worker count: env override or detected cores, floored to 1, capped at
/// 32767, rounded down to a power of two.
fn detect_workers() -> usize {
    let mut cpus = std::env::var(MAX_THREADS_ENV)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
    if cpus < 1 {
        cpus = 1;
    }
    if cpus > 32767 {
        cpus = 32767;
    }
    // Round down to a power of 2
    1 << (usize::BITS - 1 - cpus.leading_zeros())
}

/// Total physical memory in bytes, with a 16 GB fallback when detection
/// reports zero.
fn detect_physical_memory() -> u64 {
    use sysinfo::{MemoryRefreshKind, System};

    let mut sys = System::new();
    sys.refresh_memory_specifics(MemoryRefreshKind::everything());
    let total = sys.total_memory();
    if total == 0 {
        warn!("could not detect physical memory, assuming 16 GB");
        MEM_FALLBACK_BYTES
    } else {
        total
    }
}

/// Free bytes on the filesystem holding `dir` (0 when undeterminable).
fn detect_disk_free(dir: &Path) -> u64 {
    use sysinfo::Disks;

    let disks = Disks::new_with_refreshed_list();
    let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());

    // Longest mount-point prefix wins.
    disks
        .iter()
        .filter(|d| dir.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_resources(fds: u64) -> Resources {
        let config = PipelineConfig::default().with_fd_budget(fds).with_workers(2);
        Resources::detect(&config)
    }

    #[test]
    fn test_fd_accounting_round_trip() {
        let res = test_resources(10);
        assert_eq!(res.available_files(), 10);
        res.acquire_files(4).unwrap();
        assert_eq!(res.available_files(), 6);
        res.release_files(4);
        assert!(res.check_file_accounting().is_ok());
    }

    #[test]
    fn test_fd_exhaustion() {
        let res = test_resources(3);
        assert!(res.acquire_files(4).is_err());
        res.acquire_files(3).unwrap();
        assert!(res.acquire_files(1).is_err());
    }

    #[test]
    fn test_leak_detected() {
        let res = test_resources(8);
        res.acquire_files(2).unwrap();
        assert!(res.check_file_accounting().is_err());
        res.release_files(2);
        assert!(res.check_file_accounting().is_ok());
    }

    #[test]
    fn test_prefer_radix_sort_shrinks_budget() {
        let mut config = PipelineConfig::default().with_workers(1);
        config.prefer_radix_sort = true;
        let res = Resources::detect(&config);
        assert_eq!(res.mem_budget, RADIX_STRESS_MEM);
    }

    #[test]
    fn test_worker_clamp_is_power_of_two() {
        for n in [1usize, 2, 3, 5, 8, 12, 48] {
            let floored = 1usize << (usize::BITS - 1 - n.leading_zeros());
            assert!(floored.is_power_of_two());
            assert!(floored <= n && n < floored * 2);
        }
    }
}
