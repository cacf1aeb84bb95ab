//! Host capability probing.
//!
//! An engine asks a [`CapabilityProbe`] once, at load, which [`Backend`] the
//! host can drive and which [`KernelOp`]s that backend offers. Text
//! generation needs every op in [`KernelOp::TEXT`]; image inputs also need
//! [`KernelOp::VisionProjection`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Portable reference kernels on the host CPU.
    Cpu,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::Cpu => "cpu",
        })
    }
}

/// A kernel the forward pass calls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KernelOp {
    Embedding,
    RmsNorm,
    Rope,
    Attention,
    MlpSwiGlu,
    /// Final hidden state to vocabulary logits.
    Projection,
    /// Image patch features to soft-token embeddings.
    VisionProjection,
}

impl KernelOp {
    /// Ops a text-only forward pass touches.
    pub const TEXT: &'static [KernelOp] = &[
        KernelOp::Embedding,
        KernelOp::RmsNorm,
        KernelOp::Rope,
        KernelOp::Attention,
        KernelOp::MlpSwiGlu,
        KernelOp::Projection,
    ];

    pub const ALL: &'static [KernelOp] = &[
        KernelOp::Embedding,
        KernelOp::RmsNorm,
        KernelOp::Rope,
        KernelOp::Attention,
        KernelOp::MlpSwiGlu,
        KernelOp::Projection,
        KernelOp::VisionProjection,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            KernelOp::Embedding => "embedding",
            KernelOp::RmsNorm => "rms_norm",
            KernelOp::Rope => "rope",
            KernelOp::Attention => "attention",
            KernelOp::MlpSwiGlu => "mlp_swiglu",
            KernelOp::Projection => "projection",
            KernelOp::VisionProjection => "vision_projection",
        }
    }
}

impl fmt::Display for KernelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("no usable backend on this host: {0}")]
    NoBackend(String),
    #[error("backend {backend} lacks kernels: {}", join_ops(.missing))]
    UnsupportedOps {
        backend: Backend,
        missing: Vec<KernelOp>,
    },
}

fn join_ops(ops: &[KernelOp]) -> String {
    ops.iter().map(|op| op.as_str()).collect::<Vec<_>>().join(", ")
}

/// Kernels available per backend.
#[derive(Debug, Clone, Default)]
pub struct KernelMatrix {
    ops: HashMap<Backend, BTreeSet<KernelOp>>,
}

impl KernelMatrix {
    pub fn empty() -> Self {
        Self::default()
    }

    /// `backend` with every known op.
    pub fn full(backend: Backend) -> Self {
        Self::empty().with(backend, KernelOp::ALL.iter().copied())
    }

    pub fn with(mut self, backend: Backend, ops: impl IntoIterator<Item = KernelOp>) -> Self {
        self.ops.entry(backend).or_default().extend(ops);
        self
    }

    pub fn without(mut self, backend: Backend, op: KernelOp) -> Self {
        if let Some(ops) = self.ops.get_mut(&backend) {
            ops.remove(&op);
        }
        self
    }

    pub fn supports(&self, backend: Backend, op: KernelOp) -> bool {
        self.ops.get(&backend).is_some_and(|ops| ops.contains(&op))
    }

    /// Fails with every op of `required` that `backend` lacks.
    pub fn validate(&self, backend: Backend, required: &[KernelOp]) -> Result<(), BackendError> {
        let missing: Vec<KernelOp> = required
            .iter()
            .copied()
            .filter(|&op| !self.supports(backend, op))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(BackendError::UnsupportedOps { backend, missing })
        }
    }

    pub fn supported_ops(&self, backend: Backend) -> Vec<KernelOp> {
        self.ops
            .get(&backend)
            .map(|ops| ops.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Inspects the host. Swapped out in tests to simulate other devices.
pub trait CapabilityProbe: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Backend this host can run, or why it cannot run any.
    fn backend(&self) -> Result<Backend, BackendError>;

    fn matrix(&self) -> KernelMatrix;
}

/// The host CPU with the reference kernels. Always available.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostProbe;

impl CapabilityProbe for HostProbe {
    fn name(&self) -> &str {
        "host"
    }

    fn backend(&self) -> Result<Backend, BackendError> {
        Ok(Backend::Cpu)
    }

    fn matrix(&self) -> KernelMatrix {
        KernelMatrix::full(Backend::Cpu)
    }
}

/// A device that cannot run inference, with the reason reported to callers.
#[derive(Debug, Clone)]
pub struct UnsupportedHost {
    reason: String,
}

impl UnsupportedHost {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl CapabilityProbe for UnsupportedHost {
    fn name(&self) -> &str {
        "unsupported"
    }

    fn backend(&self) -> Result<Backend, BackendError> {
        Err(BackendError::NoBackend(self.reason.clone()))
    }

    fn matrix(&self) -> KernelMatrix {
        KernelMatrix::empty()
    }
}

/// The backend an engine runs on, checked against the text pipeline.
#[derive(Debug, Clone)]
pub struct BackendSelector {
    active: Backend,
    matrix: KernelMatrix,
}

impl BackendSelector {
    pub fn probe(probe: &dyn CapabilityProbe) -> Result<Self, BackendError> {
        let active = probe.backend()?;
        let matrix = probe.matrix();
        matrix.validate(active, KernelOp::TEXT)?;

        tracing::debug!(probe = probe.name(), backend = %active, "backend selected");
        Ok(Self { active, matrix })
    }

    pub fn active(&self) -> Backend {
        self.active
    }

    pub fn matrix(&self) -> &KernelMatrix {
        &self.matrix
    }

    pub fn supports_text(&self) -> bool {
        self.matrix.validate(self.active, KernelOp::TEXT).is_ok()
    }

    pub fn supports_vision(&self) -> bool {
        self.matrix.supports(self.active, KernelOp::VisionProjection)
    }
}
