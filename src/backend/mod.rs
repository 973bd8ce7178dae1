//! Engines implementing [`Renderer`](crate::Renderer).
//!
//! - [`SoftwareRenderer`]: CPU rasteriser running native fragment programs.
//!   Headless, deterministic, and the engine every test runs on.
//! - [`WgpuRenderer`]: GPU engine running WGSL programs, presenting to a
//!   window surface.

mod software;
mod wgpu_renderer;

pub use software::{DrawRecord, SoftwareRenderer};
pub use wgpu_renderer::WgpuRenderer;
