//! Offscreen render targets and the registry that owns them.

use std::rc::Rc;

use serde::Deserialize;

use crate::error::PipelineError;
use crate::renderer::{GpuHandle, Renderer, TargetDescriptor, TargetId, Viewport};
use crate::scene::DisposeMarker;
use crate::uniforms::TextureRef;

/// Texture filtering used when a target is sampled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

impl From<FilterMode> for wgpu::FilterMode {
    fn from(mode: FilterMode) -> Self {
        match mode {
            FilterMode::Nearest => wgpu::FilterMode::Nearest,
            FilterMode::Linear => wgpu::FilterMode::Linear,
        }
    }
}

/// An offscreen colour buffer that passes can draw into and later sample.
///
/// Render targets are allocated as soon as they are created, never lazily.
/// A target may carry several colour attachments; only the first one is
/// exposed as a texture (see [`texture`](Self::texture)).
///
/// Targets are shared as `Rc<RenderTarget>` by the component that created
/// them. Releasing goes through [`dispose`](Self::dispose), which is safe to
/// call any number of times.
#[derive(Debug)]
pub struct RenderTarget {
    id: TargetId,
    desc: TargetDescriptor,
    marker: DisposeMarker,
}

impl RenderTarget {
    /// Validates `desc` and allocates the target on `renderer`.
    pub fn new<R: Renderer + ?Sized>(
        renderer: &mut R,
        desc: TargetDescriptor,
    ) -> Result<Rc<Self>, PipelineError> {
        if desc.width == 0 || desc.height == 0 || desc.attachments == 0 {
            return Err(PipelineError::InvalidTargetSize {
                width: desc.width,
                height: desc.height,
                attachments: desc.attachments,
            });
        }
        let id = renderer.create_target(&desc)?;
        log::debug!(
            "allocated render target {id:?} ({}x{}, {:?}, {} attachment(s))",
            desc.width,
            desc.height,
            desc.filter,
            desc.attachments
        );
        Ok(Rc::new(Self {
            id,
            desc,
            marker: DisposeMarker::default(),
        }))
    }

    pub fn id(&self) -> TargetId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn filter(&self) -> FilterMode {
        self.desc.filter
    }

    pub fn attachments(&self) -> u32 {
        self.desc.attachments
    }

    pub fn descriptor(&self) -> &TargetDescriptor {
        &self.desc
    }

    /// Whether this target writes more than one colour attachment.
    pub fn is_multi(&self) -> bool {
        self.desc.attachments > 1
    }

    /// The full extent of the target.
    pub fn full_viewport(&self) -> Viewport {
        Viewport::full(self.desc.width, self.desc.height)
    }

    /// The first colour attachment, for binding as a texture uniform.
    pub fn texture(&self) -> TextureRef {
        TextureRef::Target(self.id)
    }

    pub fn is_disposed(&self) -> bool {
        self.marker.is_disposed()
    }

    /// Frees the GPU memory. Returns `false` if it was already freed.
    pub fn dispose<R: Renderer + ?Sized>(&self, renderer: &mut R) -> bool {
        if !self.marker.mark() {
            return false;
        }
        log::debug!("disposed render target {:?}", self.id);
        renderer.release(GpuHandle::Target(self.id));
        true
    }
}

/// Owns every offscreen target a pipeline allocates.
#[derive(Debug, Default)]
pub struct RenderTargetRegistry {
    targets: Vec<Rc<RenderTarget>>,
}

impl RenderTargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a single-attachment target.
    pub fn create<R: Renderer + ?Sized>(
        &mut self,
        renderer: &mut R,
        width: u32,
        height: u32,
        filter: FilterMode,
    ) -> Result<Rc<RenderTarget>, PipelineError> {
        self.create_multi(renderer, width, height, filter, 1)
    }

    /// Allocates a target with `attachments` colour attachments.
    pub fn create_multi<R: Renderer + ?Sized>(
        &mut self,
        renderer: &mut R,
        width: u32,
        height: u32,
        filter: FilterMode,
        attachments: u32,
    ) -> Result<Rc<RenderTarget>, PipelineError> {
        let target = RenderTarget::new(
            renderer,
            TargetDescriptor {
                width,
                height,
                filter,
                attachments,
            },
        )?;
        self.targets.push(Rc::clone(&target));
        Ok(target)
    }

    /// Releases `target` and forgets it. Disposing twice does nothing.
    pub fn dispose<R: Renderer + ?Sized>(&mut self, renderer: &mut R, target: &RenderTarget) {
        target.dispose(renderer);
        self.targets.retain(|t| t.id() != target.id());
    }

    /// Releases every target still owned.
    pub fn dispose_all<R: Renderer + ?Sized>(&mut self, renderer: &mut R) {
        for target in self.targets.drain(..) {
            target.dispose(renderer);
        }
    }

    /// Targets that are still allocated.
    pub fn live(&self) -> impl Iterator<Item = &Rc<RenderTarget>> {
        self.targets.iter().filter(|t| !t.is_disposed())
    }

    pub fn len(&self) -> usize {
        self.live().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SoftwareRenderer;

    #[test]
    fn zero_width_is_a_configuration_error() {
        let mut renderer = SoftwareRenderer::new(16, 16);
        let mut registry = RenderTargetRegistry::new();

        let err = registry
            .create(&mut renderer, 0, 32, FilterMode::Linear)
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidTargetSize {
                width: 0,
                height: 32,
                ..
            }
        ));
        assert!(err.is_configuration());
        assert!(registry.is_empty());
        assert_eq!(renderer.live_targets(), 0);
    }

    #[test]
    fn zero_attachments_rejected() {
        let mut renderer = SoftwareRenderer::new(16, 16);
        let mut registry = RenderTargetRegistry::new();
        assert!(
            registry
                .create_multi(&mut renderer, 8, 8, FilterMode::Nearest, 0)
                .is_err()
        );
    }

    #[test]
    fn create_allocates_immediately() {
        let mut renderer = SoftwareRenderer::new(16, 16);
        let mut registry = RenderTargetRegistry::new();
        let target = registry
            .create(&mut renderer, 32, 16, FilterMode::Nearest)
            .unwrap();

        assert_eq!(renderer.live_targets(), 1);
        assert_eq!((target.width(), target.height()), (32, 16));
        assert_eq!(target.full_viewport(), Viewport::full(32, 16));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn dispose_twice_is_a_no_op() {
        let mut renderer = SoftwareRenderer::new(16, 16);
        let mut registry = RenderTargetRegistry::new();
        let target = registry
            .create(&mut renderer, 8, 8, FilterMode::Linear)
            .unwrap();

        registry.dispose(&mut renderer, &target);
        registry.dispose(&mut renderer, &target);
        assert!(target.is_disposed());
        assert_eq!(
            renderer.release_count(GpuHandle::Target(target.id())),
            1
        );

        registry.dispose_all(&mut renderer);
        assert_eq!(
            renderer.release_count(GpuHandle::Target(target.id())),
            1
        );
    }

    #[test]
    fn dispose_all_releases_every_target() {
        let mut renderer = SoftwareRenderer::new(16, 16);
        let mut registry = RenderTargetRegistry::new();
        for _ in 0..3 {
            registry
                .create(&mut renderer, 4, 4, FilterMode::Linear)
                .unwrap();
        }
        registry.dispose_all(&mut renderer);
        assert!(registry.is_empty());
        assert_eq!(renderer.live_targets(), 0);
    }
}
