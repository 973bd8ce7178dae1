//! Rendering into a target without leaking renderer state.
//!
//! [`render_into`] is the only place where the pipeline touches the
//! renderer's global state triple. It snapshots the triple into a
//! [`StateScope`] and the guard puts it back when dropped, so every exit path
//! (including errors from the draw itself) leaves the renderer exactly as it
//! found it.

use std::ops::{Deref, DerefMut};

use crate::camera::Camera;
use crate::error::PipelineError;
use crate::renderer::{Renderer, RendererState, ToneMapping, Viewport};
use crate::scene::Scene;
use crate::target::RenderTarget;

/// Per-call overrides for [`render_into`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderOptions {
    /// Tone mapping for this draw. Defaults to whatever is current.
    pub tone_mapping: Option<ToneMapping>,
    /// Region to draw into. Defaults to the full target (or canvas).
    pub viewport: Option<Viewport>,
}

impl RenderOptions {
    pub fn with_tone_mapping(mut self, tone_mapping: ToneMapping) -> Self {
        self.tone_mapping = Some(tone_mapping);
        self
    }

    pub fn with_viewport(mut self, viewport: Viewport) -> Self {
        self.viewport = Some(viewport);
        self
    }
}

/// Guard that restores a captured [`RendererState`] when dropped.
///
/// Dereferences to the renderer, so state can be changed through the guard
/// for the duration of the scope.
pub struct StateScope<'r, R: Renderer + ?Sized> {
    renderer: &'r mut R,
    saved: RendererState,
}

impl<'r, R: Renderer + ?Sized> StateScope<'r, R> {
    pub fn new(renderer: &'r mut R) -> Self {
        let saved = renderer.state();
        Self { renderer, saved }
    }

    /// The state that will be restored.
    pub fn saved(&self) -> RendererState {
        self.saved
    }
}

impl<R: Renderer + ?Sized> Deref for StateScope<'_, R> {
    type Target = R;

    fn deref(&self) -> &R {
        self.renderer
    }
}

impl<R: Renderer + ?Sized> DerefMut for StateScope<'_, R> {
    fn deref_mut(&mut self) -> &mut R {
        self.renderer
    }
}

impl<R: Renderer + ?Sized> Drop for StateScope<'_, R> {
    fn drop(&mut self) {
        self.renderer.restore_state(self.saved);
    }
}

/// Draws `scene` into `target` (`None` for the canvas) and restores the
/// renderer's target, viewport and tone mapping afterwards.
///
/// Targets with several colour attachments need an explicit viewport, and an
/// explicit viewport must lie inside the target. These checks, like the
/// disposed-target check, happen before any state changes.
pub fn render_into<R: Renderer + ?Sized>(
    renderer: &mut R,
    target: Option<&RenderTarget>,
    scene: &Scene,
    camera: &Camera,
    options: RenderOptions,
) -> Result<(), PipelineError> {
    let viewport = match (target, options.viewport) {
        (Some(t), _) if t.is_disposed() => return Err(PipelineError::TargetDisposed),
        (Some(t), None) if t.is_multi() => {
            return Err(PipelineError::MissingViewport {
                attachments: t.attachments(),
            });
        }
        (_, Some(viewport)) => {
            let (width, height) = match target {
                Some(t) => (t.width(), t.height()),
                None => renderer.canvas_size(),
            };
            if !viewport.fits(width, height) {
                return Err(PipelineError::ViewportOutOfBounds {
                    viewport,
                    width,
                    height,
                });
            }
            viewport
        }
        (Some(t), None) => t.full_viewport(),
        (None, None) => {
            let (width, height) = renderer.canvas_size();
            Viewport::full(width, height)
        }
    };

    let mut scope = StateScope::new(renderer);
    let tone_mapping = options
        .tone_mapping
        .unwrap_or(scope.saved().tone_mapping);

    scope.set_render_target(target.map(RenderTarget::id));
    scope.set_viewport(viewport);
    scope.set_tone_mapping(tone_mapping);
    log::trace!(
        "render '{}' into {:?} at {viewport:?} with {tone_mapping:?}",
        scene.name(),
        target.map(RenderTarget::id)
    );
    scope.render(scene, camera)
}
