//! Ping-pong render target pair.

use std::rc::Rc;

use crate::camera::Camera;
use crate::error::PipelineError;
use crate::renderer::{Renderer, TargetDescriptor, ToneMapping};
use crate::scene::Scene;
use crate::scoped::{RenderOptions, render_into};
use crate::target::{FilterMode, RenderTarget};

/// Two equally sized targets used alternately: one is written this frame
/// while the other still holds last frame's result.
///
/// `writable()` and `readable()` always name different targets. The pair
/// starts with the first target writable.
#[derive(Debug)]
pub struct BackBufferSwapper {
    targets: [Rc<RenderTarget>; 2],
    writable: usize,
}

impl BackBufferSwapper {
    pub fn new<R: Renderer + ?Sized>(
        renderer: &mut R,
        width: u32,
        height: u32,
        filter: FilterMode,
    ) -> Result<Self, PipelineError> {
        let targets = Self::allocate(renderer, width, height, filter)?;
        log::debug!("back buffer {width}x{height} ready");
        Ok(Self {
            targets,
            writable: 0,
        })
    }

    fn allocate<R: Renderer + ?Sized>(
        renderer: &mut R,
        width: u32,
        height: u32,
        filter: FilterMode,
    ) -> Result<[Rc<RenderTarget>; 2], PipelineError> {
        let desc = TargetDescriptor {
            width,
            height,
            filter,
            attachments: 1,
        };
        let a = RenderTarget::new(renderer, desc)?;
        let b = match RenderTarget::new(renderer, desc) {
            Ok(b) => b,
            Err(e) => {
                a.dispose(renderer);
                return Err(e);
            }
        };
        Ok([a, b])
    }

    /// The target to draw into this frame.
    pub fn writable(&self) -> &Rc<RenderTarget> {
        &self.targets[self.writable]
    }

    /// Last frame's result.
    pub fn readable(&self) -> &Rc<RenderTarget> {
        &self.targets[1 - self.writable]
    }

    /// Exchanges the two roles.
    pub fn swap(&mut self) {
        self.writable = 1 - self.writable;
    }

    pub fn size(&self) -> (u32, u32) {
        let t = &self.targets[0];
        (t.width(), t.height())
    }

    /// Draws `scene` into the writable target without tone mapping, then
    /// swaps so the result becomes readable.
    pub fn render<R: Renderer + ?Sized>(
        &mut self,
        renderer: &mut R,
        scene: &Scene,
        camera: &Camera,
    ) -> Result<(), PipelineError> {
        render_into(
            renderer,
            Some(&**self.writable()),
            scene,
            camera,
            RenderOptions::default().with_tone_mapping(ToneMapping::None),
        )?;
        self.swap();
        Ok(())
    }

    /// Re-creates both targets at the new size. Contents are lost. Does
    /// nothing if the size is unchanged.
    pub fn resize<R: Renderer + ?Sized>(
        &mut self,
        renderer: &mut R,
        width: u32,
        height: u32,
    ) -> Result<(), PipelineError> {
        if self.size() == (width, height) {
            return Ok(());
        }
        let filter = self.targets[0].filter();
        let targets = Self::allocate(renderer, width, height, filter)?;
        for old in std::mem::replace(&mut self.targets, targets) {
            old.dispose(renderer);
        }
        self.writable = 0;
        log::debug!("back buffer resized to {width}x{height}");
        Ok(())
    }

    /// Releases both targets. Calling it again does nothing.
    pub fn dispose<R: Renderer + ?Sized>(&self, renderer: &mut R) {
        for target in &self.targets {
            target.dispose(renderer);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.targets.iter().all(|t| t.is_disposed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SoftwareRenderer;
    use crate::renderer::GpuHandle;
    use crate::scene::{Geometry, GeometryKind, Material, SceneNode};
    use crate::shader::FragmentSource;
    use crate::uniforms::ShaderUniformSet;
    use glam::Vec4;

    #[test]
    fn writable_and_readable_never_alias() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let mut back = BackBufferSwapper::new(&mut renderer, 4, 4, FilterMode::Linear).unwrap();
        let first = back.writable().id();

        for i in 0..5 {
            assert_ne!(back.writable().id(), back.readable().id());
            let expected_writable = i % 2 == 0;
            assert_eq!(back.writable().id() == first, expected_writable);
            back.swap();
        }
    }

    #[test]
    fn render_writes_then_swaps() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        renderer.set_tone_mapping(ToneMapping::Reinhard);
        let mut back = BackBufferSwapper::new(&mut renderer, 4, 4, FilterMode::Linear).unwrap();

        let geometry = Geometry::new(&mut renderer, GeometryKind::FULLSCREEN_QUAD).unwrap();
        let bright = Vec4::new(4.0, 0.0, 0.0, 1.0);
        let material = Material::shader(
            &mut renderer,
            "bright",
            &FragmentSource::native(move |_| bright),
            ShaderUniformSet::new(),
        )
        .unwrap();
        let mut scene = Scene::new("bb");
        scene.add(
            SceneNode::new("quad")
                .with_geometry(geometry)
                .with_material(material)
                .build(),
        );

        let written = back.writable().id();
        back.render(&mut renderer, &scene, &Camera::fullscreen()).unwrap();

        assert_eq!(back.readable().id(), written);
        // no tone mapping on the back buffer, and state restored afterwards
        assert_eq!(renderer.read_pixel(Some(written), 1, 1), Some(bright));
        assert_eq!(renderer.tone_mapping(), ToneMapping::Reinhard);
    }

    #[test]
    fn resize_recreates_pair() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let mut back = BackBufferSwapper::new(&mut renderer, 4, 4, FilterMode::Nearest).unwrap();
        let old = [back.writable().clone(), back.readable().clone()];

        back.resize(&mut renderer, 4, 4).unwrap();
        assert_eq!(back.writable().id(), old[0].id());

        back.resize(&mut renderer, 8, 2).unwrap();
        assert_eq!(back.size(), (8, 2));
        assert!(old.iter().all(|t| t.is_disposed()));
        assert_eq!(renderer.live_targets(), 2);
        assert_ne!(back.writable().id(), back.readable().id());
    }

    #[test]
    fn zero_size_fails_without_leaking() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        assert!(BackBufferSwapper::new(&mut renderer, 0, 4, FilterMode::Linear).is_err());
        assert_eq!(renderer.live_targets(), 0);
    }

    #[test]
    fn dispose_is_idempotent() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let back = BackBufferSwapper::new(&mut renderer, 4, 4, FilterMode::Linear).unwrap();
        back.dispose(&mut renderer);
        back.dispose(&mut renderer);
        assert!(back.is_disposed());
        for t in [back.writable(), back.readable()] {
            assert_eq!(renderer.release_count(GpuHandle::Target(t.id())), 1);
        }
    }
}
