pub mod agg;
pub mod error;
pub mod key;
pub mod metrics;
pub mod registry;
pub mod tags;

pub use agg::{Query, RateTotals};
pub use error::{Error, Result};
pub use key::KeyId;
pub use metrics::{
    MetricHandle, MetricKind, MetricSeriesSummary, MetricValue, TREND_RELATIVE_ERROR, TrendState,
    TrendSummary,
};
pub use registry::{MetricId, Registry};
pub use tags::TagSet;
