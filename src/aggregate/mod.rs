//! Archive-wide reducers over per-trace results.
//!
//! Each reducer consumes per-trace outputs independently and can be merged
//! with another instance of itself, so traces may be processed in any order
//! or in parallel.

pub mod delays;
pub mod hotspots;
pub mod speeds;
pub mod utility;

pub use delays::{DelayHistogram, DelaySummary};
pub use hotspots::{Hotspot, HotspotGrid, LocationBin};
pub use speeds::{HistogramBin, SpeedDistribution, SpeedFilter, SpeedSummary};
