//! The rendering engine seam.
//!
//! A [`Renderer`] is the single mutable GPU context shared by every pass of a
//! pipeline. Besides resource allocation it exposes three pieces of global
//! state: the bound render target, the viewport, and the tone mapping mode.
//! Passes never mutate that state directly; they go through
//! [`render_into`](crate::render_into), which restores it afterwards.

use glam::{Vec3, Vec4};
use serde::Deserialize;

use crate::camera::Camera;
use crate::error::PipelineError;
use crate::scene::{GeometryKind, Scene};
use crate::shader::FragmentSource;
use crate::target::FilterMode;
use crate::uniforms::UniformLayout;

/// Engine handle of an offscreen render target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub(crate) u32);

/// Engine handle of a data texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub(crate) u32);

/// Engine handle of uploaded geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeometryId(pub(crate) u32);

/// Engine handle of a compiled fragment program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramId(pub(crate) u32);

/// Any engine resource that can be released.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GpuHandle {
    Target(TargetId),
    Texture(TextureId),
    Geometry(GeometryId),
    Program(ProgramId),
}

/// A pixel rectangle inside the bound target. The origin is the top-left
/// corner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// A viewport covering a whole `width` x `height` surface.
    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether the viewport is non-empty and lies inside a `width` x
    /// `height` surface.
    pub fn fits(&self, width: u32, height: u32) -> bool {
        !self.is_empty()
            && self.x.checked_add(self.width).is_some_and(|x1| x1 <= width)
            && self.y.checked_add(self.height).is_some_and(|y1| y1 <= height)
    }
}

impl From<[u32; 4]> for Viewport {
    fn from([x, y, width, height]: [u32; 4]) -> Self {
        Self::new(x, y, width, height)
    }
}

/// Transform applied to every fragment colour written by a draw.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToneMapping {
    #[default]
    None,
    Linear,
    Reinhard,
    AcesFilmic,
}

impl ToneMapping {
    /// Maps a high-range colour into display range.
    pub fn apply(self, color: Vec3) -> Vec3 {
        match self {
            Self::None => color,
            Self::Linear => color.clamp(Vec3::ZERO, Vec3::ONE),
            Self::Reinhard => color / (Vec3::ONE + color),
            Self::AcesFilmic => {
                // Narkowicz fit of the ACES filmic curve.
                let a = 2.51;
                let b = 0.03;
                let c = 2.43;
                let d = 0.59;
                let e = 0.14;
                ((color * (a * color + b)) / (color * (c * color + d) + e))
                    .clamp(Vec3::ZERO, Vec3::ONE)
            }
        }
    }

    /// Applies the mapping to the colour channels, leaving alpha alone.
    pub fn apply_rgba(self, color: Vec4) -> Vec4 {
        self.apply(color.truncate()).extend(color.w)
    }

    /// Index used by GPU shaders to select the mapping.
    pub(crate) fn shader_index(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Linear => 1,
            Self::Reinhard => 2,
            Self::AcesFilmic => 3,
        }
    }
}

/// The global state a pass may change and must give back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RendererState {
    pub target: Option<TargetId>,
    pub viewport: Viewport,
    pub tone_mapping: ToneMapping,
}

/// Parameters for allocating a render target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub width: u32,
    pub height: u32,
    pub filter: FilterMode,
    pub attachments: u32,
}

/// Parameters for uploading a data texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDescriptor {
    pub width: u32,
    pub height: u32,
    pub filter: FilterMode,
}

/// A rendering engine with one shared, mutable GPU context.
///
/// `render` draws every mesh of `scene` into the currently bound target
/// (`None` meaning the visible canvas) inside the current viewport, applying
/// the current tone mapping.
pub trait Renderer {
    /// Short engine name used in diagnostics.
    fn name(&self) -> &'static str;

    fn render_target(&self) -> Option<TargetId>;
    fn set_render_target(&mut self, target: Option<TargetId>);
    fn viewport(&self) -> Viewport;
    fn set_viewport(&mut self, viewport: Viewport);
    fn tone_mapping(&self) -> ToneMapping;
    fn set_tone_mapping(&mut self, tone_mapping: ToneMapping);

    /// Size of the visible canvas in pixels.
    fn canvas_size(&self) -> (u32, u32);
    /// Resizes the canvas and resets the viewport to cover it.
    fn set_canvas_size(&mut self, width: u32, height: u32);

    /// Allocates a render target immediately.
    fn create_target(&mut self, desc: &TargetDescriptor) -> Result<TargetId, PipelineError>;
    /// Uploads an RGBA texture, row-major from the top-left texel.
    fn create_texture(
        &mut self,
        desc: &TextureDescriptor,
        texels: &[Vec4],
    ) -> Result<TextureId, PipelineError>;
    fn create_geometry(&mut self, kind: &GeometryKind) -> Result<GeometryId, PipelineError>;
    /// Compiles and links a fragment program against the fixed full-screen
    /// vertex stage. Failures are reported here, never at draw time.
    fn create_program(
        &mut self,
        fragment: &FragmentSource,
        layout: &UniformLayout,
    ) -> Result<ProgramId, PipelineError>;
    /// Frees an engine resource. Unknown handles are ignored.
    fn release(&mut self, handle: GpuHandle);

    fn render(&mut self, scene: &Scene, camera: &Camera) -> Result<(), PipelineError>;

    /// Shows whatever was drawn to the canvas this frame.
    fn present(&mut self) {}

    /// Snapshot of the global state triple.
    fn state(&self) -> RendererState {
        RendererState {
            target: self.render_target(),
            viewport: self.viewport(),
            tone_mapping: self.tone_mapping(),
        }
    }

    /// Puts back a previously captured state triple.
    fn restore_state(&mut self, state: RendererState) {
        self.set_render_target(state.target);
        self.set_viewport(state.viewport);
        self.set_tone_mapping(state.tone_mapping);
    }
}
