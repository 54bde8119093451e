//! Job manager: job store, event loop thread and worker dispatch.

mod core;
mod types;

pub use core::{JobManager, ProviderHandle};
pub use types::JobManagerConfig;
pub(crate) use types::{LoopMessage, SignalHook, duration_millis};
