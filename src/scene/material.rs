//! Materials and data textures.

use std::cell::{Ref, RefCell};
use std::rc::Rc;

use glam::Vec4;

use crate::error::PipelineError;
use crate::renderer::{GpuHandle, ProgramId, Renderer, TextureDescriptor, TextureId};
use crate::scene::{DisposeMarker, Ownership};
use crate::shader::FragmentSource;
use crate::target::FilterMode;
use crate::uniforms::{ShaderUniformSet, TextureRef, UniformLayout, UniformValue};

/// An RGBA texture uploaded from CPU data.
#[derive(Debug)]
pub struct Texture {
    id: TextureId,
    width: u32,
    height: u32,
    filter: FilterMode,
    no_dispose: bool,
    marker: DisposeMarker,
}

impl Texture {
    /// Uploads `texels` (row-major from the top-left) as a new texture.
    pub fn from_texels<R: Renderer + ?Sized>(
        renderer: &mut R,
        width: u32,
        height: u32,
        filter: FilterMode,
        texels: &[Vec4],
    ) -> Result<Rc<Self>, PipelineError> {
        Self::upload(renderer, width, height, filter, texels, false)
    }

    fn upload<R: Renderer + ?Sized>(
        renderer: &mut R,
        width: u32,
        height: u32,
        filter: FilterMode,
        texels: &[Vec4],
        no_dispose: bool,
    ) -> Result<Rc<Self>, PipelineError> {
        if width == 0 || height == 0 {
            return Err(PipelineError::InvalidTargetSize {
                width,
                height,
                attachments: 1,
            });
        }
        let expected = (width as usize).checked_mul(height as usize);
        if expected != Some(texels.len()) {
            return Err(PipelineError::TexelCount {
                width,
                height,
                expected: expected.unwrap_or(usize::MAX),
                actual: texels.len(),
            });
        }
        let id = renderer.create_texture(
            &TextureDescriptor {
                width,
                height,
                filter,
            },
            texels,
        )?;
        Ok(Rc::new(Self {
            id,
            width,
            height,
            filter,
            no_dispose,
            marker: DisposeMarker::default(),
        }))
    }

    /// A 1x1 texture of a single colour.
    pub fn solid<R: Renderer + ?Sized>(
        renderer: &mut R,
        color: Vec4,
    ) -> Result<Rc<Self>, PipelineError> {
        Self::from_texels(renderer, 1, 1, FilterMode::Nearest, &[color])
    }

    /// Uploads a texture that scene disposal must leave alone, such as one
    /// shared between scenes.
    pub fn shared<R: Renderer + ?Sized>(
        renderer: &mut R,
        width: u32,
        height: u32,
        filter: FilterMode,
        texels: &[Vec4],
    ) -> Result<Rc<Self>, PipelineError> {
        Self::upload(renderer, width, height, filter, texels, true)
    }

    pub fn id(&self) -> TextureId {
        self.id
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn filter(&self) -> FilterMode {
        self.filter
    }

    /// Reference suitable for a texture uniform.
    pub fn texture_ref(&self) -> TextureRef {
        TextureRef::Texture(self.id)
    }

    pub fn no_dispose(&self) -> bool {
        self.no_dispose
    }

    pub fn is_disposed(&self) -> bool {
        self.marker.is_disposed()
    }

    /// Releases the texture memory. Returns `false` if already released.
    pub fn dispose<R: Renderer + ?Sized>(&self, renderer: &mut R) -> bool {
        if !self.marker.mark() {
            return false;
        }
        renderer.release(GpuHandle::Texture(self.id));
        true
    }
}

/// How a material shades its mesh.
#[derive(Debug)]
pub enum MaterialKind {
    /// A compiled fragment program fed by a uniform set.
    Shader {
        program: ProgramId,
        layout: UniformLayout,
        /// Shared with the stage that owns the material.
        uniforms: Rc<RefCell<ShaderUniformSet>>,
    },
    /// A flat colour, optionally multiplied by a texture.
    Basic {
        color: Vec4,
        map: Option<Ownership<Rc<Texture>>>,
    },
}

/// Surface description of a mesh.
#[derive(Debug)]
pub struct Material {
    name: String,
    kind: MaterialKind,
    no_dispose: bool,
    marker: DisposeMarker,
}

impl Material {
    /// Compiles `fragment` against the layout of `uniforms`.
    pub fn shader<R: Renderer + ?Sized>(
        renderer: &mut R,
        name: impl Into<String>,
        fragment: &FragmentSource,
        uniforms: ShaderUniformSet,
    ) -> Result<Rc<Self>, PipelineError> {
        Self::shader_shared(renderer, name, fragment, Rc::new(RefCell::new(uniforms)))
    }

    /// Like [`Material::shader`], with the uniform cell supplied by the
    /// caller so it can read the values without going through the material.
    pub(crate) fn shader_shared<R: Renderer + ?Sized>(
        renderer: &mut R,
        name: impl Into<String>,
        fragment: &FragmentSource,
        uniforms: Rc<RefCell<ShaderUniformSet>>,
    ) -> Result<Rc<Self>, PipelineError> {
        let name = name.into();
        let layout = uniforms.borrow().layout();
        let program = renderer.create_program(fragment, &layout)?;
        log::debug!("compiled program {program:?} for material '{name}'");
        Ok(Rc::new(Self {
            name,
            kind: MaterialKind::Shader {
                program,
                layout,
                uniforms,
            },
            no_dispose: false,
            marker: DisposeMarker::default(),
        }))
    }

    pub fn basic(
        name: impl Into<String>,
        color: Vec4,
        map: Option<Ownership<Rc<Texture>>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            kind: MaterialKind::Basic { color, map },
            no_dispose: false,
            marker: DisposeMarker::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &MaterialKind {
        &self.kind
    }

    pub fn program(&self) -> Option<ProgramId> {
        match &self.kind {
            MaterialKind::Shader { program, .. } => Some(*program),
            MaterialKind::Basic { .. } => None,
        }
    }

    /// Current uniform values of a shader material.
    pub fn uniforms(&self) -> Option<Ref<'_, ShaderUniformSet>> {
        match &self.kind {
            MaterialKind::Shader { uniforms, .. } => Some(uniforms.borrow()),
            MaterialKind::Basic { .. } => None,
        }
    }

    /// Replaces the whole uniform set. The new set must keep the layout the
    /// program was compiled against.
    pub fn set_uniforms(&self, set: ShaderUniformSet) -> Result<(), PipelineError> {
        let (layout, uniforms) = self.shader_parts()?;
        layout.check(&set)?;
        *uniforms.borrow_mut() = set;
        Ok(())
    }

    /// Changes one existing uniform, keeping its kind.
    pub fn set_uniform(&self, name: &str, value: UniformValue) -> Result<(), PipelineError> {
        let (layout, uniforms) = self.shader_parts()?;
        match layout.slots().find(|(n, _)| *n == name) {
            Some((_, kind)) if kind == value.kind() => {
                uniforms.borrow_mut().set(name, value);
                Ok(())
            }
            Some((_, kind)) => Err(PipelineError::UniformLayout(format!(
                "uniform '{name}' is {kind:?}, got {:?}",
                value.kind()
            ))),
            None => Err(PipelineError::UniformLayout(format!(
                "material '{}' has no uniform '{name}'",
                self.name
            ))),
        }
    }

    /// Texture slots this material owns or borrows. Uniform textures are not
    /// slots: they are references only.
    pub fn texture_slots(&self) -> impl Iterator<Item = &Ownership<Rc<Texture>>> {
        let map = match &self.kind {
            MaterialKind::Basic { map, .. } => map.as_ref(),
            MaterialKind::Shader { .. } => None,
        };
        map.into_iter()
    }

    /// Marks the material as externally kept alive.
    pub fn keep_alive(mut self: Rc<Self>) -> Rc<Self> {
        if let Some(material) = Rc::get_mut(&mut self) {
            material.no_dispose = true;
        } else {
            log::warn!(
                "material '{}' is already shared; keep_alive ignored",
                self.name
            );
        }
        self
    }

    pub fn no_dispose(&self) -> bool {
        self.no_dispose
    }

    pub fn is_disposed(&self) -> bool {
        self.marker.is_disposed()
    }

    /// Releases the compiled program. Textures are released by whoever walks
    /// the owning scene. Returns `false` if already released.
    pub fn dispose<R: Renderer + ?Sized>(&self, renderer: &mut R) -> bool {
        if !self.marker.mark() {
            return false;
        }
        if let Some(program) = self.program() {
            renderer.release(GpuHandle::Program(program));
        }
        true
    }

    fn shader_parts(&self) -> Result<(&UniformLayout, &RefCell<ShaderUniformSet>), PipelineError> {
        match &self.kind {
            MaterialKind::Shader {
                layout, uniforms, ..
            } => Ok((layout, uniforms.as_ref())),
            MaterialKind::Basic { .. } => Err(PipelineError::UniformLayout(format!(
                "material '{}' has no uniforms",
                self.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SoftwareRenderer;
    use crate::shader::FragmentSource;

    fn red() -> FragmentSource {
        FragmentSource::native(|_| Vec4::new(1.0, 0.0, 0.0, 1.0))
    }

    #[test]
    fn shader_material_keeps_layout() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let material = Material::shader(
            &mut renderer,
            "m",
            &red(),
            ShaderUniformSet::new().with("gain", 1.0),
        )
        .unwrap();

        material.set_uniform("gain", UniformValue::Float(3.0)).unwrap();
        assert_eq!(material.uniforms().unwrap().float("gain"), Some(3.0));

        assert!(material
            .set_uniform("gain", UniformValue::Vec2(glam::Vec2::ONE))
            .is_err());
        assert!(material.set_uniform("other", UniformValue::Float(1.0)).is_err());
        assert!(material.set_uniforms(ShaderUniformSet::new()).is_err());
    }

    #[test]
    fn basic_material_has_no_uniforms() {
        let material = Material::basic("b", Vec4::ONE, None);
        assert!(material.uniforms().is_none());
        assert!(material.set_uniforms(ShaderUniformSet::new()).is_err());
        assert_eq!(material.texture_slots().count(), 0);
    }

    #[test]
    fn dispose_releases_program_once() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let material =
            Material::shader(&mut renderer, "m", &red(), ShaderUniformSet::new()).unwrap();
        let program = material.program().unwrap();

        assert!(material.dispose(&mut renderer));
        assert!(!material.dispose(&mut renderer));
        assert_eq!(renderer.release_count(GpuHandle::Program(program)), 1);
    }

    #[test]
    fn texture_rejects_mismatched_data() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let err = Texture::from_texels(&mut renderer, 2, 2, FilterMode::Linear, &[Vec4::ONE]);
        assert!(matches!(
            err,
            Err(PipelineError::TexelCount { expected: 4, actual: 1, .. })
        ));

        let huge = Texture::from_texels(&mut renderer, u32::MAX, u32::MAX, FilterMode::Linear, &[]);
        assert!(matches!(huge, Err(PipelineError::TexelCount { actual: 0, .. })));
        assert_eq!(renderer.live_textures(), 0);
    }

    #[test]
    fn keep_alive_marks_unshared_material() {
        let material = Material::basic("b", Vec4::ONE, None).keep_alive();
        assert!(material.no_dispose());
    }
}
