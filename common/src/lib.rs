mod device;
mod metrics;
mod tracing;

pub use crate::device::{select_device, visible_devices};
pub use crate::metrics::{MetricsBuilder, MetricsHandle, MetricsLogRecorder};
pub use crate::tracing::init_tracing;
