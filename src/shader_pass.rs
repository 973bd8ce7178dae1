//! Full-screen fragment passes.
//!
//! A [`ShaderPassStage`] is a one-mesh scene: a 2x2 plane covering clip
//! space, a shader material and an orthographic camera over [-1, 1]². The
//! program is compiled when the stage is built, so a broken shader fails
//! construction rather than the first frame.
//!
//! # Example
//!
//! ```ignore
//! let mut pass = ShaderPassStage::new(
//!     &mut renderer,
//!     FragmentSource::native(|input| input.uv.extend(0.0).extend(1.0)),
//!     ShaderUniformSet::new(),
//! )?;
//! pass.render(&mut renderer, None, None)?;
//! ```

use std::cell::{Ref, RefCell};
use std::rc::Rc;

use crate::camera::Camera;
use crate::dispose::SceneResourceDisposer;
use crate::error::PipelineError;
use crate::renderer::{Renderer, ToneMapping, Viewport};
use crate::scene::{Geometry, GeometryKind, Material, Scene, SceneNode};
use crate::scoped::{RenderOptions, render_into};
use crate::shader::FragmentSource;
use crate::target::RenderTarget;
use crate::uniforms::{ShaderUniformSet, TextureRef, UniformValue};

/// Name of the texture uniform read by [`ShaderPassStage::texture_output`].
pub const TEXTURE_OUTPUT_UNIFORM: &str = "tex";

#[derive(Debug)]
pub struct ShaderPassStage {
    scene: Scene,
    camera: Camera,
    material: Rc<Material>,
    uniforms: Rc<RefCell<ShaderUniformSet>>,
    tone_mapping: Option<ToneMapping>,
}

impl ShaderPassStage {
    /// Compiles `fragment` against the layout of `uniforms` and builds the
    /// quad scene.
    pub fn new<R: Renderer + ?Sized>(
        renderer: &mut R,
        fragment: FragmentSource,
        uniforms: ShaderUniformSet,
    ) -> Result<Self, PipelineError> {
        let uniforms = Rc::new(RefCell::new(uniforms));
        let material =
            Material::shader_shared(renderer, "shader-pass", &fragment, Rc::clone(&uniforms))?;
        let geometry = match Geometry::new(renderer, GeometryKind::FULLSCREEN_QUAD) {
            Ok(geometry) => geometry,
            Err(e) => {
                material.dispose(renderer);
                return Err(e);
            }
        };

        let mut scene = Scene::new("shader-pass");
        scene.add(
            SceneNode::new("quad")
                .with_geometry(geometry)
                .with_material(Rc::clone(&material))
                .build(),
        );
        Ok(Self {
            scene,
            camera: Camera::fullscreen(),
            material,
            uniforms,
            tone_mapping: None,
        })
    }

    /// A pass that copies `texture` to whatever target it renders into.
    pub fn texture_output<R: Renderer + ?Sized>(
        renderer: &mut R,
        texture: TextureRef,
    ) -> Result<Self, PipelineError> {
        Self::new(
            renderer,
            FragmentSource::passthrough(TEXTURE_OUTPUT_UNIFORM),
            ShaderUniformSet::new().with(TEXTURE_OUTPUT_UNIFORM, texture),
        )
    }

    pub fn uniforms(&self) -> Ref<'_, ShaderUniformSet> {
        self.uniforms.borrow()
    }

    /// Replaces the uniform set. It must have the layout the stage was built
    /// with. Takes effect on the next render.
    pub fn set_uniforms(&self, uniforms: ShaderUniformSet) -> Result<(), PipelineError> {
        self.material.set_uniforms(uniforms)
    }

    pub fn set_uniform(
        &self,
        name: &str,
        value: impl Into<UniformValue>,
    ) -> Result<(), PipelineError> {
        self.material.set_uniform(name, value.into())
    }

    /// Points the texture uniform `name` at `texture`.
    pub fn set_texture(&self, name: &str, texture: TextureRef) -> Result<(), PipelineError> {
        self.material.set_uniform(name, UniformValue::Texture(texture))
    }

    /// Tone mapping for this pass; `None` keeps the renderer's.
    pub fn set_tone_mapping(&mut self, tone_mapping: Option<ToneMapping>) {
        self.tone_mapping = tone_mapping;
    }

    pub fn tone_mapping(&self) -> Option<ToneMapping> {
        self.tone_mapping
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    /// Draws the quad into `target` (`None` for the canvas).
    pub fn render<R: Renderer + ?Sized>(
        &self,
        renderer: &mut R,
        target: Option<&RenderTarget>,
        viewport: Option<Viewport>,
    ) -> Result<(), PipelineError> {
        render_into(
            renderer,
            target,
            &self.scene,
            &self.camera,
            RenderOptions {
                tone_mapping: self.tone_mapping,
                viewport,
            },
        )
    }

    pub fn is_disposed(&self) -> bool {
        self.material.is_disposed()
    }

    /// Releases the program and the quad. Textures bound as uniforms are not
    /// touched. Returns `false` if already disposed.
    pub fn dispose<R: Renderer + ?Sized>(&mut self, renderer: &mut R) -> bool {
        if self.is_disposed() {
            return false;
        }
        SceneResourceDisposer::new(renderer).dispose_scene_graph(&mut self.scene);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SoftwareRenderer;
    use crate::renderer::{GpuHandle, TargetDescriptor};
    use crate::target::FilterMode;
    use glam::Vec4;

    fn solid(renderer: &mut SoftwareRenderer) -> ShaderPassStage {
        ShaderPassStage::new(
            renderer,
            FragmentSource::native(|input| input.vec4("color")),
            ShaderUniformSet::new().with("color", Vec4::new(1.0, 0.0, 0.0, 1.0)),
        )
        .unwrap()
    }

    #[test]
    fn uniform_changes_apply_to_next_render() {
        let mut renderer = SoftwareRenderer::new(2, 2);
        let pass = solid(&mut renderer);

        pass.render(&mut renderer, None, None).unwrap();
        assert_eq!(
            renderer.read_pixel(None, 0, 0),
            Some(Vec4::new(1.0, 0.0, 0.0, 1.0))
        );

        pass.set_uniform("color", Vec4::new(0.0, 0.0, 1.0, 1.0)).unwrap();
        assert_eq!(
            renderer.read_pixel(None, 0, 0),
            Some(Vec4::new(1.0, 0.0, 0.0, 1.0))
        );
        pass.render(&mut renderer, None, None).unwrap();
        assert_eq!(
            renderer.read_pixel(None, 0, 0),
            Some(Vec4::new(0.0, 0.0, 1.0, 1.0))
        );
    }

    #[test]
    fn pass_and_material_share_uniform_values() {
        let mut renderer = SoftwareRenderer::new(2, 2);
        let pass = solid(&mut renderer);
        let material = Rc::clone(pass.scene().children()[0].material().unwrap());

        material.set_uniform("color", UniformValue::Vec4(Vec4::ONE)).unwrap();
        assert_eq!(pass.uniforms().vec4("color"), Some(Vec4::ONE));

        pass.set_uniforms(ShaderUniformSet::new().with("color", Vec4::ZERO)).unwrap();
        assert_eq!(material.uniforms().unwrap().vec4("color"), Some(Vec4::ZERO));
    }

    #[test]
    fn layout_change_is_rejected() {
        let mut renderer = SoftwareRenderer::new(2, 2);
        let pass = solid(&mut renderer);
        let err = pass
            .set_uniforms(ShaderUniformSet::new().with("color", 1.0))
            .unwrap_err();
        assert!(matches!(err, PipelineError::UniformLayout(_)));
        assert!(pass.set_uniform("missing", 1.0).is_err());
    }

    #[test]
    fn unsupported_program_fails_construction() {
        let mut renderer = SoftwareRenderer::new(2, 2);
        let err = ShaderPassStage::new(
            &mut renderer,
            FragmentSource::wgsl("fn fragment(uv: vec2<f32>) -> vec4<f32> { return uv; }"),
            ShaderUniformSet::new(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedProgram { .. }));
        assert_eq!(renderer.live_geometries(), 0);
    }

    #[test]
    fn texture_output_copies_its_input() {
        let mut renderer = SoftwareRenderer::new(2, 2);
        let source = RenderTarget::new(
            &mut renderer,
            TargetDescriptor {
                width: 2,
                height: 2,
                filter: FilterMode::Nearest,
                attachments: 1,
            },
        )
        .unwrap();
        let green = Vec4::new(0.0, 1.0, 0.0, 1.0);
        let fill = ShaderPassStage::new(
            &mut renderer,
            FragmentSource::native(move |_| green),
            ShaderUniformSet::new(),
        )
        .unwrap();
        fill.render(&mut renderer, Some(&*source), None).unwrap();

        let output = ShaderPassStage::texture_output(&mut renderer, source.texture()).unwrap();
        output.render(&mut renderer, None, None).unwrap();
        assert_eq!(renderer.read_pixel(None, 1, 1), Some(green));
    }

    #[test]
    fn pass_tone_mapping_overrides_renderer() {
        let mut renderer = SoftwareRenderer::new(2, 2);
        renderer.set_tone_mapping(ToneMapping::Reinhard);
        let mut pass = solid(&mut renderer);
        pass.set_tone_mapping(Some(ToneMapping::None));
        pass.render(&mut renderer, None, None).unwrap();

        assert_eq!(renderer.draws()[0].tone_mapping, ToneMapping::None);
        assert_eq!(renderer.tone_mapping(), ToneMapping::Reinhard);
    }

    #[test]
    fn dispose_keeps_uniform_textures() {
        let mut renderer = SoftwareRenderer::new(2, 2);
        let source = RenderTarget::new(
            &mut renderer,
            TargetDescriptor {
                width: 2,
                height: 2,
                filter: FilterMode::Linear,
                attachments: 1,
            },
        )
        .unwrap();
        let mut pass = ShaderPassStage::texture_output(&mut renderer, source.texture()).unwrap();
        let program = pass.material.program().unwrap();

        assert!(pass.dispose(&mut renderer));
        assert!(!pass.dispose(&mut renderer));
        assert_eq!(renderer.release_count(GpuHandle::Program(program)), 1);
        assert_eq!(renderer.live_geometries(), 0);
        assert!(!source.is_disposed());
        assert_eq!(renderer.live_targets(), 1);
    }
}
