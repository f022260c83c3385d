use crate::metrics::MetricKind;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("metric name must not be empty")]
    EmptyName,

    #[error("metric `{name}` is already registered as {existing}, cannot use it as {requested}")]
    KindMismatch {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },

    #[error("metric id does not belong to this registry")]
    UnknownMetric,
}
