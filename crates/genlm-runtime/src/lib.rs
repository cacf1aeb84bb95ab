//! # genlm-runtime
//!
//! Runtime backend probing and telemetry for genlm: which kernels the host
//! can execute, and how long prefill and decode took.

pub mod backend;
pub mod telemetry;

pub use backend::{
    Backend, BackendError, BackendSelector, CapabilityProbe, HostProbe, KernelMatrix, KernelOp,
    UnsupportedHost,
};
pub use telemetry::{
    InferenceMetrics, InferenceTimer, RecordingTelemetry, TelemetryHook, TracingTelemetry,
};
