//! Error types for pipeline assembly and rendering.

use std::path::PathBuf;

use crate::renderer::{GpuHandle, Viewport};

/// Errors raised while assembling or running a render pipeline.
///
/// Configuration errors are returned synchronously from constructors and
/// builders; a pipeline that failed to build holds no GPU resources.
/// Disposing a resource twice is never an error.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("render target size must be non-zero, got {width}x{height} with {attachments} attachment(s)")]
    InvalidTargetSize {
        width: u32,
        height: u32,
        attachments: u32,
    },

    #[error("texture of {width}x{height} needs {expected} texels, got {actual}")]
    TexelCount {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("render target with {attachments} attachments needs an explicit viewport")]
    MissingViewport { attachments: u32 },

    #[error("viewport {viewport:?} does not fit a {width}x{height} target")]
    ViewportOutOfBounds {
        viewport: Viewport,
        width: u32,
        height: u32,
    },

    #[error("render target was already disposed")]
    TargetDisposed,

    #[error("shader compilation failed: {0}")]
    ShaderCompile(String),

    #[error("uniform layout mismatch: {0}")]
    UniformLayout(String),

    #[error("{backend} cannot run {program} fragment programs")]
    UnsupportedProgram {
        backend: &'static str,
        program: &'static str,
    },

    #[error("pipeline has no stages")]
    EmptyPipeline,

    #[error("duplicate stage name '{0}'")]
    DuplicateStage(String),

    #[error("stage '{stage}' reads from unknown stage '{from}'")]
    UnknownStage { stage: String, from: String },

    #[error("stage '{stage}' reads from '{from}', which does not run before it")]
    ForwardDependency { stage: String, from: String },

    #[error("stage '{stage}' cannot read '{from}': {reason}")]
    InvalidInput {
        stage: String,
        from: String,
        reason: &'static str,
    },

    #[error("back buffer misuse: {0}")]
    BackBufferConflict(String),

    #[error("unknown GPU handle {0:?}")]
    UnknownHandle(GpuHandle),

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("surface error: {0}")]
    Surface(String),

    #[error("invalid pipeline configuration: {0}")]
    Config(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    /// Whether this error describes a configuration mistake rather than an
    /// engine failure. Configuration errors must stop pipeline assembly.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidTargetSize { .. }
                | Self::TexelCount { .. }
                | Self::MissingViewport { .. }
                | Self::ViewportOutOfBounds { .. }
                | Self::ShaderCompile(_)
                | Self::UniformLayout(_)
                | Self::UnsupportedProgram { .. }
                | Self::EmptyPipeline
                | Self::DuplicateStage(_)
                | Self::UnknownStage { .. }
                | Self::ForwardDependency { .. }
                | Self::InvalidInput { .. }
                | Self::BackBufferConflict(_)
                | Self::Config(_)
        )
    }
}

impl From<toml::de::Error> for PipelineError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}
