//! Pipeline configuration.
//!
//! An immutable struct handed to every stage. There are no process-wide
//! mutable knobs; per-run mutable state (fd counter, disk warning) lives in
//! [`crate::resources::Resources`].

use crate::error::{PipelineError, Result};
use std::path::PathBuf;

/// Highest zoom level the pipeline will consider.
pub const MAX_ZOOM: u8 = 28;

/// Geometry detail bits assumed at the maximum zoom when guessing maxzoom.
pub const FULL_DETAIL: u8 = 12;

/// Maximum zoom: a fixed level, or inferred from feature spacing after sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxzoomSpec {
    /// Use this zoom.
    Value(u8),
    /// Infer from the geometric mean of Morton-key deltas.
    Guess,
}

/// Base zoom: fixed, following maxzoom, or chosen from tile-density stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasezoomSpec {
    /// Use this zoom.
    Value(u8),
    /// Use whatever maxzoom ends up being.
    FollowMaxzoom,
    /// Choose the lowest zoom whose fullest tile stays under the feature cap.
    Guess,
}

/// Drop rate: fixed, or derived from tile-density stats.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DroprateSpec {
    /// Features per zoom shrink by this factor below basezoom.
    Value(f64),
    /// Derive from the ratio of tile counts across zooms.
    Guess,
}

/// Configuration for a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Worker lane count. `None` = detected cores, clamped to a power of two.
    pub workers: Option<usize>,
    /// Directory for temporary and output files.
    pub tmp_dir: PathBuf,
    /// Memory budget for the external sort. `None` = half of physical RAM.
    pub mem_budget_bytes: Option<u64>,
    /// File-descriptor budget. `None` = [`DEFAULT_FD_BUDGET`].
    pub fd_budget: Option<u64>,
    /// Maximum zoom, in `[0, MAX_ZOOM]`.
    pub maxzoom: MaxzoomSpec,
    /// Minimum zoom, in `[0, maxzoom]`.
    pub minzoom: u8,
    /// Base zoom for drop-interval computation.
    pub basezoom: BasezoomSpec,
    /// Per-zoom feature drop rate.
    pub droprate: DroprateSpec,
    /// Marker width used to scale the auto-basezoom feature cap
    /// (`50_000 / width²`).
    pub basezoom_marker_width: f64,
    /// Near-duplicate gating exponent. Negative disables dropping entirely.
    pub gamma: f64,
    /// Also drop line features below basezoom.
    pub drop_lines: bool,
    /// Also drop polygon features below basezoom.
    pub drop_polygons: bool,
    /// Shrink the sort memory budget to force deep radix recursion.
    pub prefer_radix_sort: bool,
    /// Record separator byte. `None` = sniff (RS if the input starts with
    /// 0x1E, newline otherwise).
    pub separator: Option<u8>,
    /// Tile buffer, in 1/256ths of a tile, for first-common-tile selection.
    pub buffer: i64,
}

/// Default descriptor budget: the original's 2000-file cap scaled by 3/4.
pub const DEFAULT_FD_BUDGET: u64 = 1500;

/// Newline separator for line-delimited feature streams.
pub const SEPARATOR_NEWLINE: u8 = b'\n';

/// RS (0x1E) separator for record-separated feature streams.
pub const SEPARATOR_RS: u8 = 0x1E;

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: None,
            tmp_dir: std::env::temp_dir(),
            mem_budget_bytes: None,
            fd_budget: None,
            maxzoom: MaxzoomSpec::Value(14),
            minzoom: 0,
            basezoom: BasezoomSpec::FollowMaxzoom,
            droprate: DroprateSpec::Value(2.5),
            basezoom_marker_width: 1.0,
            gamma: 0.0,
            drop_lines: false,
            drop_polygons: false,
            prefer_radix_sort: false,
            separator: None,
            buffer: 5,
        }
    }
}

impl PipelineConfig {
    /// Builder method to set the temp directory.
    pub fn with_tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = dir.into();
        self
    }

    /// Builder method to set the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Builder method to set the sort memory budget.
    pub fn with_mem_budget_bytes(mut self, bytes: u64) -> Self {
        self.mem_budget_bytes = Some(bytes);
        self
    }

    /// Builder method to set the descriptor budget.
    pub fn with_fd_budget(mut self, fds: u64) -> Self {
        self.fd_budget = Some(fds);
        self
    }

    /// Builder method to set a fixed maxzoom.
    pub fn with_maxzoom(mut self, z: u8) -> Self {
        self.maxzoom = MaxzoomSpec::Value(z);
        self
    }

    /// Builder method to set a fixed basezoom.
    pub fn with_basezoom(mut self, z: u8) -> Self {
        self.basezoom = BasezoomSpec::Value(z);
        self
    }

    /// Builder method to set a fixed droprate.
    pub fn with_droprate(mut self, rate: f64) -> Self {
        self.droprate = DroprateSpec::Value(rate);
        self
    }

    /// Builder method to set gamma.
    pub fn with_gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma;
        self
    }

    /// The configured maxzoom, or the provisional value used before a guess
    /// resolves.
    pub fn provisional_maxzoom(&self) -> u8 {
        match self.maxzoom {
            MaxzoomSpec::Value(z) => z,
            MaxzoomSpec::Guess => MAX_ZOOM,
        }
    }

    /// Validate ranges and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.minzoom > MAX_ZOOM {
            return Err(PipelineError::InvalidConfig(format!(
                "minzoom {} exceeds highest supported zoom {}",
                self.minzoom, MAX_ZOOM
            )));
        }
        if let MaxzoomSpec::Value(z) = self.maxzoom {
            if z > MAX_ZOOM {
                return Err(PipelineError::InvalidConfig(format!(
                    "maxzoom {} exceeds highest supported zoom {}",
                    z, MAX_ZOOM
                )));
            }
            if self.minzoom > z {
                return Err(PipelineError::InvalidConfig(format!(
                    "minzoom {} cannot be greater than maxzoom {}",
                    self.minzoom, z
                )));
            }
        }
        if let BasezoomSpec::Value(z) = self.basezoom {
            if z > MAX_ZOOM {
                return Err(PipelineError::InvalidConfig(format!(
                    "basezoom {} exceeds highest supported zoom {}",
                    z, MAX_ZOOM
                )));
            }
        }
        if let DroprateSpec::Value(r) = self.droprate {
            if !(r > 0.0) {
                return Err(PipelineError::InvalidConfig(format!(
                    "droprate must be positive, got {}",
                    r
                )));
            }
        }
        if !(self.basezoom_marker_width > 0.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "basezoom marker width must be positive, got {}",
                self.basezoom_marker_width
            )));
        }
        if let Some(w) = self.workers {
            if w == 0 || !w.is_power_of_two() {
                return Err(PipelineError::InvalidConfig(format!(
                    "worker count must be a nonzero power of two, got {}",
                    w
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.maxzoom, MaxzoomSpec::Value(14));
        assert_eq!(config.minzoom, 0);
        assert_eq!(config.basezoom, BasezoomSpec::FollowMaxzoom);
        assert_eq!(config.droprate, DroprateSpec::Value(2.5));
        assert_eq!(config.gamma, 0.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = PipelineConfig::default()
            .with_maxzoom(10)
            .with_basezoom(8)
            .with_droprate(3.0)
            .with_gamma(1.0)
            .with_workers(4);
        assert_eq!(config.maxzoom, MaxzoomSpec::Value(10));
        assert_eq!(config.basezoom, BasezoomSpec::Value(8));
        assert_eq!(config.droprate, DroprateSpec::Value(3.0));
        assert_eq!(config.gamma, 1.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        assert!(PipelineConfig::default()
            .with_maxzoom(MAX_ZOOM + 1)
            .validate()
            .is_err());

        let mut config = PipelineConfig::default().with_maxzoom(4);
        config.minzoom = 5;
        assert!(config.validate().is_err());

        assert!(PipelineConfig::default()
            .with_droprate(0.0)
            .validate()
            .is_err());

        assert!(PipelineConfig::default().with_workers(3).validate().is_err());
    }

    #[test]
    fn test_provisional_maxzoom() {
        assert_eq!(
            PipelineConfig::default().with_maxzoom(9).provisional_maxzoom(),
            9
        );
        let mut config = PipelineConfig::default();
        config.maxzoom = MaxzoomSpec::Guess;
        assert_eq!(config.provisional_maxzoom(), MAX_ZOOM);
    }
}
