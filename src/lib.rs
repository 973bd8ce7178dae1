//! # Backbuffer
//!
//! **Render-target pipelines and feedback passes for wgpu.**
//!
//! Declare an ordered list of full-screen fragment stages, wire each one to
//! the output of an earlier stage or to last frame's back buffer, and tick
//! the pipeline once per frame. Targets, programs and quads are allocated
//! up front and released together.
//!
//! ## Quick Start
//!
//! ```no_run
//! use backbuffer::*;
//!
//! fn main() -> Result<(), PipelineError> {
//!     run_pipeline(WindowConfig::new().title("feedback"), || {
//!         Ok(PipelineBuilder::new()
//!             .stage(
//!                 StageDescriptor::new("trail", FragmentSource::wgsl(TRAIL))
//!                     .to_back_buffer()
//!                     .frame_uniforms()
//!                     .input("previous", InputSource::BackBuffer),
//!             )
//!             .stage(
//!                 StageDescriptor::new("show", FragmentSource::passthrough("tex"))
//!                     .input("tex", InputSource::stage("trail")),
//!             ))
//!     })
//! }
//!
//! const TRAIL: &str = "
//! fn fragment(uv: vec2<f32>) -> vec4<f32> {
//!     let glow = 0.5 + 0.5 * sin(u.time + uv.x * 6.0);
//!     let prev = textureSample(previous, previous_sampler, tex_uv(uv));
//!     return mix(vec4(glow, 0.2, 0.6, 1.0), prev, 0.9);
//! }";
//! ```
//!
//! ## Pieces
//!
//! - [`Renderer`]: the engine seam. [`WgpuRenderer`] draws on the GPU,
//!   [`SoftwareRenderer`] on the CPU for headless use and tests.
//! - [`render_into`]: draws a scene into a target and puts the renderer's
//!   target, viewport and tone mapping back afterwards, even on error.
//! - [`BackBufferSwapper`]: a ping-pong target pair for feedback effects.
//! - [`ShaderPassStage`]: one full-screen fragment program and its uniforms.
//! - [`PipelineBuilder`] / [`PipelineScheduler`]: ordered stages, run once
//!   per frame.
//! - [`SceneResourceDisposer`]: releases what a scene graph owns, once.
//! - [`Surface`] and [`run_pipeline`]: mount a pipeline on a window.
//! - [`PipelineConfig`]: the same pipelines declared in TOML.

mod back_buffer;
pub mod backend;
mod camera;
mod config;
mod dispose;
mod error;
mod frame_loop;
mod gpu;
pub mod pipeline;
mod renderer;
pub mod scene;
mod scoped;
mod shader;
mod shader_pass;
mod surface;
mod target;
mod uniforms;

pub use back_buffer::BackBufferSwapper;
pub use backend::{DrawRecord, SoftwareRenderer, WgpuRenderer};
pub use camera::Camera;
pub use config::{InputConfig, PipelineConfig, StageConfig, UniformConfig};
pub use dispose::{Disposable, DisposeStats, SceneResourceDisposer};
pub use error::PipelineError;
pub use frame_loop::{FrameLoop, WindowConfig, run_pipeline};
pub use gpu::GpuContext;
pub use pipeline::{
    Diagnostic, FrameContext, InputSource, OutputKind, PipelineBuilder, PipelineScheduler,
    PipelineStage, SkipReason, StageDescriptor, StageOutput, TickOutcome,
};
pub use renderer::{
    GeometryId, GpuHandle, ProgramId, Renderer, RendererState, TargetDescriptor, TargetId,
    TextureDescriptor, TextureId, ToneMapping, Viewport,
};
pub use scoped::{RenderOptions, StateScope, render_into};
pub use shader::{
    FragmentInput, FragmentSource, NativeFragment, TextureSampler, UniformBufferLayout,
    compose_wgsl, validate_wgsl,
};
pub use shader_pass::{ShaderPassStage, TEXTURE_OUTPUT_UNIFORM};
pub use surface::Surface;
pub use target::{FilterMode, RenderTarget, RenderTargetRegistry};
pub use uniforms::{ShaderUniformSet, TextureRef, UniformKind, UniformLayout, UniformValue};

// Re-export glam math types for convenience
pub use glam::{Mat4, Vec2, Vec3, Vec4};
