//! # tilespool
//!
//! Core of a vector-tile builder: ingest a delimited stream of geographic
//! features in parallel, key each feature with a Morton space-filling-curve
//! value, sort the whole set globally with a disk-backed external radix
//! sort, and stamp every feature with the minimum zoom at which it should
//! survive — all on a single machine, on inputs much larger than memory,
//! under explicit file-descriptor and RAM budgets.
//!
//! The caller supplies a [`ChunkParser`] that turns raw bytes into
//! [`Feature`]s, and consumes the sorted geometry/index pair plus the
//! attribute side files described by [`PipelineOutput`]. Tile assembly and
//! encoding live downstream; this crate treats geometry blobs as opaque
//! except for the reserved trailing minzoom byte.
//!
//! ```no_run
//! use tilespool::{run, Input, PipelineConfig};
//! # use tilespool::{ChunkParser, LaneWriter};
//! # struct MyParser;
//! # impl ChunkParser for MyParser {
//! #     fn parse_chunk(&self, _: &[u8], _: &mut LaneWriter) -> tilespool::Result<()> { Ok(()) }
//! # }
//!
//! let config = PipelineConfig::default().with_maxzoom(14);
//! let output = run(
//!     &config,
//!     vec![Input::Path("features.txt".into())],
//!     &MyParser,
//! )?;
//! println!("{} features sorted into {:?}", output.features, output.index_path);
//! # Ok::<(), tilespool::PipelineError>(())
//! ```

pub mod config;
pub mod drop;
pub mod error;
pub mod gather;
pub mod ingest;
pub mod lane;
mod mapping;
pub mod morton;
pub mod pipeline;
pub mod pool;
pub mod record;
pub mod resources;
mod sort;

pub use config::{
    BasezoomSpec, DroprateSpec, MaxzoomSpec, PipelineConfig, MAX_ZOOM, SEPARATOR_NEWLINE,
    SEPARATOR_RS,
};
pub use error::{PipelineError, Result};
pub use ingest::ChunkParser;
pub use lane::{Attr, AttrType, Feature, LaneWriter};
pub use pipeline::{run, Input, PipelineOutput};
pub use record::{GeomType, IndexRecord, RECORD_WIRE_SIZE};
pub use resources::Resources;
