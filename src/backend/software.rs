//! CPU rasteriser.
//!
//! Draws triangle lists with perspective-correct texture coordinates, no
//! depth test and no blending. A draw first shades every covered pixel
//! against the current contents of all textures, then clears the viewport and
//! writes the results, so a pass may sample the target it is drawing into.

use std::cell::Ref;
use std::collections::HashMap;

use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::camera::Camera;
use crate::error::PipelineError;
use crate::renderer::{
    GeometryId, GpuHandle, ProgramId, Renderer, RendererState, TargetDescriptor, TargetId,
    TextureDescriptor, TextureId, ToneMapping, Viewport,
};
use crate::scene::{GeometryKind, MaterialKind, Scene, SceneNode, Vertex};
use crate::shader::{FragmentInput, FragmentSource, NativeFragment, TextureSampler};
use crate::target::FilterMode;
use crate::uniforms::{ShaderUniformSet, TextureRef, UniformLayout};

struct Image {
    width: u32,
    height: u32,
    filter: FilterMode,
    texels: Vec<Vec4>,
}

impl Image {
    fn new(width: u32, height: u32, filter: FilterMode) -> Self {
        Self {
            width,
            height,
            filter,
            texels: vec![Vec4::ZERO; width as usize * height as usize],
        }
    }

    fn texel(&self, x: i64, y: i64) -> Vec4 {
        let x = x.clamp(0, self.width as i64 - 1) as usize;
        let y = y.clamp(0, self.height as i64 - 1) as usize;
        self.texels[y * self.width as usize + x]
    }

    /// `uv` has its origin at the bottom-left; rows are stored top first.
    fn sample(&self, uv: Vec2) -> Vec4 {
        let (w, h) = (self.width as f32, self.height as f32);
        match self.filter {
            FilterMode::Nearest => self.texel(
                (uv.x * w).floor() as i64,
                ((1.0 - uv.y) * h).floor() as i64,
            ),
            FilterMode::Linear => {
                let fx = uv.x * w - 0.5;
                let fy = (1.0 - uv.y) * h - 0.5;
                let (x0, y0) = (fx.floor(), fy.floor());
                let (tx, ty) = (fx - x0, fy - y0);
                let (x0, y0) = (x0 as i64, y0 as i64);
                let top = self.texel(x0, y0).lerp(self.texel(x0 + 1, y0), tx);
                let bottom = self.texel(x0, y0 + 1).lerp(self.texel(x0 + 1, y0 + 1), tx);
                top.lerp(bottom, ty)
            }
        }
    }

    fn clear(&mut self, rect: PixelRect) {
        for y in rect.y0..rect.y1 {
            let row = (y * self.width) as usize;
            self.texels[row + rect.x0 as usize..row + rect.x1 as usize].fill(Vec4::ZERO);
        }
    }
}

/// Viewport clipped to the bound image, half-open.
#[derive(Clone, Copy)]
struct PixelRect {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

enum Program {
    Native(NativeFragment),
    Passthrough(String),
}

enum Shading<'a> {
    Program(&'a Program, Ref<'a, ShaderUniformSet>),
    Basic(Vec4, Option<TextureRef>),
}

/// One call to [`Renderer::render`], as seen by the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct DrawRecord {
    pub scene: String,
    pub target: Option<TargetId>,
    pub viewport: Viewport,
    pub tone_mapping: ToneMapping,
    /// Meshes shaded by the draw.
    pub meshes: usize,
}

/// Headless [`Renderer`] that keeps every texel in memory.
///
/// Runs [`FragmentSource::Native`] and [`FragmentSource::Passthrough`]
/// programs. Every draw and every release is recorded for inspection.
pub struct SoftwareRenderer {
    canvas: Image,
    targets: HashMap<TargetId, Vec<Image>>,
    textures: HashMap<TextureId, Image>,
    geometries: HashMap<GeometryId, Vec<Vertex>>,
    programs: HashMap<ProgramId, Program>,
    next_id: u32,
    state: RendererState,
    draws: Vec<DrawRecord>,
    released: Vec<GpuHandle>,
    presented: u64,
}

impl SoftwareRenderer {
    /// A renderer with a `width` x `height` canvas bound and no tone mapping.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            canvas: Image::new(width, height, FilterMode::Linear),
            targets: HashMap::new(),
            textures: HashMap::new(),
            geometries: HashMap::new(),
            programs: HashMap::new(),
            next_id: 0,
            state: RendererState {
                target: None,
                viewport: Viewport::full(width, height),
                tone_mapping: ToneMapping::None,
            },
            draws: Vec::new(),
            released: Vec::new(),
            presented: 0,
        }
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Reads one texel of the first attachment of `target` (or the canvas).
    /// Row 0 is the top row.
    pub fn read_pixel(&self, target: Option<TargetId>, x: u32, y: u32) -> Option<Vec4> {
        let image = match target {
            Some(id) => self.targets.get(&id)?.first()?,
            None => &self.canvas,
        };
        (x < image.width && y < image.height)
            .then(|| image.texels[(y * image.width + x) as usize])
    }

    pub fn draws(&self) -> &[DrawRecord] {
        &self.draws
    }

    pub fn clear_draws(&mut self) {
        self.draws.clear();
    }

    /// Every handle released so far, in order.
    pub fn released(&self) -> &[GpuHandle] {
        &self.released
    }

    pub fn release_count(&self, handle: GpuHandle) -> usize {
        self.released.iter().filter(|h| **h == handle).count()
    }

    pub fn live_targets(&self) -> usize {
        self.targets.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_geometries(&self) -> usize {
        self.geometries.len()
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    /// Number of [`present`](Renderer::present) calls.
    pub fn presented_frames(&self) -> u64 {
        self.presented
    }

    fn bound_image(&self) -> Result<&Image, PipelineError> {
        match self.state.target {
            Some(id) => self
                .targets
                .get(&id)
                .and_then(|a| a.first())
                .ok_or(PipelineError::UnknownHandle(GpuHandle::Target(id))),
            None => Ok(&self.canvas),
        }
    }

    fn shading<'a>(&'a self, node: &'a SceneNode) -> Result<Shading<'a>, PipelineError> {
        // for_each_mesh only yields nodes with a material
        let Some(material) = node.material() else {
            return Ok(Shading::Basic(Vec4::ZERO, None));
        };
        match material.kind() {
            MaterialKind::Shader {
                program, uniforms, ..
            } => {
                let compiled = self
                    .programs
                    .get(program)
                    .ok_or(PipelineError::UnknownHandle(GpuHandle::Program(*program)))?;
                Ok(Shading::Program(compiled, uniforms.borrow()))
            }
            MaterialKind::Basic { color, map } => Ok(Shading::Basic(
                *color,
                map.as_ref().map(|m| m.get().texture_ref()),
            )),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn shade_mesh(
        &self,
        node: &SceneNode,
        offset: Vec3,
        clip_from_world: Mat4,
        viewport: Viewport,
        rect: PixelRect,
        width: u32,
        writes: &mut Vec<(usize, Vec4)>,
    ) -> Result<(), PipelineError> {
        let Some(geometry) = node.geometry() else {
            return Ok(());
        };
        let vertices = self
            .geometries
            .get(&geometry.id())
            .ok_or(PipelineError::UnknownHandle(GpuHandle::Geometry(geometry.id())))?;
        let shading = self.shading(node)?;
        let tone_mapping = self.state.tone_mapping;

        // Clip space to pixel space, y down.
        let to_screen = |clip: Vec4| {
            let ndc = clip.truncate() / clip.w;
            Vec2::new(
                viewport.x as f32 + (ndc.x * 0.5 + 0.5) * viewport.width as f32,
                viewport.y as f32 + (0.5 - ndc.y * 0.5) * viewport.height as f32,
            )
        };

        for tri in vertices.chunks_exact(3) {
            let clip = [0, 1, 2]
                .map(|i| clip_from_world * (Vec3::from(tri[i].position) + offset).extend(1.0));
            if clip.iter().any(|c| c.w <= f32::EPSILON) {
                log::trace!("triangle behind camera in '{}' skipped", node.name());
                continue;
            }
            let screen = clip.map(to_screen);
            let inv_w = clip.map(|c| 1.0 / c.w);
            let uv = [0, 1, 2].map(|i| Vec2::from(tri[i].uv));
            let area = edge(screen[0], screen[1], screen[2]);
            if area.abs() <= f32::EPSILON {
                continue;
            }

            let min = screen[0].min(screen[1]).min(screen[2]);
            let max = screen[0].max(screen[1]).max(screen[2]);
            let x_start = (min.x.floor().max(0.0) as u32).max(rect.x0);
            let y_start = (min.y.floor().max(0.0) as u32).max(rect.y0);
            let x_end = (max.x.ceil().max(0.0) as u32).min(rect.x1);
            let y_end = (max.y.ceil().max(0.0) as u32).min(rect.y1);

            for py in y_start..y_end {
                for px in x_start..x_end {
                    let p = Vec2::new(px as f32 + 0.5, py as f32 + 0.5);
                    let b = [
                        edge(screen[1], screen[2], p) / area,
                        edge(screen[2], screen[0], p) / area,
                        edge(screen[0], screen[1], p) / area,
                    ];
                    if b.iter().any(|w| *w < 0.0) {
                        continue;
                    }
                    let weights = [b[0] * inv_w[0], b[1] * inv_w[1], b[2] * inv_w[2]];
                    let norm = weights[0] + weights[1] + weights[2];
                    let frag_uv =
                        (uv[0] * weights[0] + uv[1] * weights[1] + uv[2] * weights[2]) / norm;

                    let color = match &shading {
                        Shading::Program(program, uniforms) => {
                            let input = FragmentInput {
                                uv: frag_uv,
                                frag_coord: p,
                                uniforms: &**uniforms,
                                sampler: self,
                            };
                            match program {
                                Program::Native(f) => f.as_ref()(&input),
                                Program::Passthrough(texture) => input.sample(texture, frag_uv),
                            }
                        }
                        Shading::Basic(color, Some(texture)) => {
                            *color * TextureSampler::sample(self, *texture, frag_uv)
                        }
                        Shading::Basic(color, None) => *color,
                    };
                    writes.push((
                        (py * width + px) as usize,
                        tone_mapping.apply_rgba(color),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn edge(a: Vec2, b: Vec2, p: Vec2) -> f32 {
    (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x)
}

impl TextureSampler for SoftwareRenderer {
    fn sample(&self, texture: TextureRef, uv: Vec2) -> Vec4 {
        let image = match texture {
            TextureRef::Target(id) => self.targets.get(&id).and_then(|a| a.first()),
            TextureRef::Texture(id) => self.textures.get(&id),
        };
        image.map_or(Vec4::ZERO, |image| image.sample(uv))
    }
}

impl Renderer for SoftwareRenderer {
    fn name(&self) -> &'static str {
        "software"
    }

    fn render_target(&self) -> Option<TargetId> {
        self.state.target
    }

    fn set_render_target(&mut self, target: Option<TargetId>) {
        self.state.target = target;
    }

    fn viewport(&self) -> Viewport {
        self.state.viewport
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.state.viewport = viewport;
    }

    fn tone_mapping(&self) -> ToneMapping {
        self.state.tone_mapping
    }

    fn set_tone_mapping(&mut self, tone_mapping: ToneMapping) {
        self.state.tone_mapping = tone_mapping;
    }

    fn canvas_size(&self) -> (u32, u32) {
        (self.canvas.width, self.canvas.height)
    }

    fn set_canvas_size(&mut self, width: u32, height: u32) {
        self.canvas = Image::new(width, height, FilterMode::Linear);
        self.state.viewport = Viewport::full(width, height);
    }

    fn create_target(&mut self, desc: &TargetDescriptor) -> Result<TargetId, PipelineError> {
        let id = TargetId(self.next_id());
        log::trace!(
            "software: creating target {id:?} ({}x{})",
            desc.width,
            desc.height
        );
        let attachments = (0..desc.attachments)
            .map(|_| Image::new(desc.width, desc.height, desc.filter))
            .collect();
        self.targets.insert(id, attachments);
        Ok(id)
    }

    fn create_texture(
        &mut self,
        desc: &TextureDescriptor,
        texels: &[Vec4],
    ) -> Result<TextureId, PipelineError> {
        let id = TextureId(self.next_id());
        log::trace!(
            "software: uploading texture {id:?} ({}x{})",
            desc.width,
            desc.height
        );
        self.textures.insert(
            id,
            Image {
                width: desc.width,
                height: desc.height,
                filter: desc.filter,
                texels: texels.to_vec(),
            },
        );
        Ok(id)
    }

    fn create_geometry(&mut self, kind: &GeometryKind) -> Result<GeometryId, PipelineError> {
        let id = GeometryId(self.next_id());
        self.geometries.insert(id, kind.vertices());
        Ok(id)
    }

    fn create_program(
        &mut self,
        fragment: &FragmentSource,
        layout: &UniformLayout,
    ) -> Result<ProgramId, PipelineError> {
        let program = match fragment {
            FragmentSource::Native(f) => Program::Native(f.clone()),
            FragmentSource::Passthrough { texture } => {
                if !layout.textures().any(|t| t == texture) {
                    return Err(PipelineError::UniformLayout(format!(
                        "passthrough program needs a texture uniform '{texture}'"
                    )));
                }
                Program::Passthrough(texture.clone())
            }
            FragmentSource::Wgsl(_) => {
                return Err(PipelineError::UnsupportedProgram {
                    backend: "software",
                    program: fragment.kind_name(),
                });
            }
        };
        let id = ProgramId(self.next_id());
        self.programs.insert(id, program);
        Ok(id)
    }

    fn release(&mut self, handle: GpuHandle) {
        let removed = match handle {
            GpuHandle::Target(id) => self.targets.remove(&id).is_some(),
            GpuHandle::Texture(id) => self.textures.remove(&id).is_some(),
            GpuHandle::Geometry(id) => self.geometries.remove(&id).is_some(),
            GpuHandle::Program(id) => self.programs.remove(&id).is_some(),
        };
        if removed {
            log::trace!("software: released {handle:?}");
            self.released.push(handle);
        } else {
            log::trace!("software: ignoring release of unknown {handle:?}");
        }
    }

    fn render(&mut self, scene: &Scene, camera: &Camera) -> Result<(), PipelineError> {
        let viewport = self.state.viewport;
        let image = self.bound_image()?;
        let width = image.width;
        let rect = PixelRect {
            x0: viewport.x.min(image.width),
            y0: viewport.y.min(image.height),
            x1: viewport.x.saturating_add(viewport.width).min(image.width),
            y1: viewport.y.saturating_add(viewport.height).min(image.height),
        };
        let clip_from_world = camera.clip_from_world();

        let mut writes = Vec::new();
        let mut meshes = 0;
        let mut failure = None;
        scene.for_each_mesh(|node, offset| {
            if failure.is_some() {
                return;
            }
            match self.shade_mesh(
                node,
                offset,
                clip_from_world,
                viewport,
                rect,
                width,
                &mut writes,
            ) {
                Ok(()) => meshes += 1,
                Err(e) => failure = Some(e),
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }

        let attachments: Vec<&mut Image> = match self.state.target {
            Some(id) => match self.targets.get_mut(&id) {
                Some(images) => images.iter_mut().collect(),
                None => return Err(PipelineError::UnknownHandle(GpuHandle::Target(id))),
            },
            None => vec![&mut self.canvas],
        };
        let mut attachments = attachments.into_iter();
        if let Some(color) = attachments.next() {
            color.clear(rect);
            for (index, value) in writes {
                color.texels[index] = value;
            }
        }
        for extra in attachments {
            extra.clear(rect);
        }

        self.draws.push(DrawRecord {
            scene: scene.name().to_string(),
            target: self.state.target,
            viewport,
            tone_mapping: self.state.tone_mapping,
            meshes,
        });
        Ok(())
    }

    fn present(&mut self) {
        self.presented += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Geometry, Material, Ownership, SceneNode, Texture};
    use crate::target::RenderTarget;

    fn quad(renderer: &mut SoftwareRenderer, material: std::rc::Rc<Material>) -> Scene {
        let geometry = Geometry::new(renderer, GeometryKind::FULLSCREEN_QUAD).unwrap();
        let mut scene = Scene::new("quad");
        scene.add(
            SceneNode::new("quad")
                .with_geometry(geometry)
                .with_material(material)
                .build(),
        );
        scene
    }

    #[test]
    fn uv_origin_is_bottom_left() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let material = Material::shader(
            &mut renderer,
            "uv",
            &FragmentSource::native(|input| input.uv.extend(0.0).extend(1.0)),
            ShaderUniformSet::new(),
        )
        .unwrap();
        let scene = quad(&mut renderer, material);
        renderer.render(&scene, &Camera::fullscreen()).unwrap();

        let top_left = renderer.read_pixel(None, 0, 0).unwrap();
        let bottom_right = renderer.read_pixel(None, 3, 3).unwrap();
        assert!((top_left.x - 0.125).abs() < 1e-5);
        assert!((top_left.y - 0.875).abs() < 1e-5);
        assert!((bottom_right.x - 0.875).abs() < 1e-5);
        assert!((bottom_right.y - 0.125).abs() < 1e-5);
    }

    #[test]
    fn viewport_limits_the_draw() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let material = Material::basic("white", Vec4::ONE, None);
        let scene = quad(&mut renderer, material);
        renderer.set_viewport(Viewport::new(2, 0, 2, 2));
        renderer.render(&scene, &Camera::fullscreen()).unwrap();

        assert_eq!(renderer.read_pixel(None, 3, 1), Some(Vec4::ONE));
        assert_eq!(renderer.read_pixel(None, 1, 1), Some(Vec4::ZERO));
        assert_eq!(renderer.read_pixel(None, 3, 2), Some(Vec4::ZERO));
        assert_eq!(renderer.draws()[0].meshes, 1);
    }

    #[test]
    fn basic_material_multiplies_its_map() {
        let mut renderer = SoftwareRenderer::new(2, 2);
        let texels = [
            Vec4::new(1.0, 0.0, 0.0, 1.0),
            Vec4::new(0.0, 1.0, 0.0, 1.0),
            Vec4::new(0.0, 0.0, 1.0, 1.0),
            Vec4::ONE,
        ];
        let texture =
            Texture::from_texels(&mut renderer, 2, 2, FilterMode::Nearest, &texels).unwrap();
        let material = Material::basic(
            "mapped",
            Vec4::new(0.5, 0.5, 0.5, 1.0),
            Some(Ownership::Owned(texture)),
        );
        let scene = quad(&mut renderer, material);
        renderer.render(&scene, &Camera::fullscreen()).unwrap();

        assert_eq!(
            renderer.read_pixel(None, 1, 0),
            Some(Vec4::new(0.0, 0.5, 0.0, 1.0))
        );
        assert_eq!(
            renderer.read_pixel(None, 0, 1),
            Some(Vec4::new(0.0, 0.0, 0.5, 1.0))
        );
    }

    #[test]
    fn tone_mapping_applies_to_output() {
        let mut renderer = SoftwareRenderer::new(2, 2);
        let material = Material::basic("hdr", Vec4::new(3.0, 1.0, 0.0, 1.0), None);
        let scene = quad(&mut renderer, material);
        renderer.set_tone_mapping(ToneMapping::Reinhard);
        renderer.render(&scene, &Camera::fullscreen()).unwrap();

        let pixel = renderer.read_pixel(None, 0, 0).unwrap();
        assert!((pixel.x - 0.75).abs() < 1e-6);
        assert!((pixel.y - 0.5).abs() < 1e-6);
        assert_eq!(pixel.w, 1.0);
    }

    #[test]
    fn pass_can_read_the_target_it_writes() {
        let mut renderer = SoftwareRenderer::new(2, 2);
        let target = RenderTarget::new(
            &mut renderer,
            TargetDescriptor {
                width: 2,
                height: 2,
                filter: FilterMode::Nearest,
                attachments: 1,
            },
        )
        .unwrap();
        let material = Material::shader(
            &mut renderer,
            "accumulate",
            &FragmentSource::native(|input| input.sample("self", input.uv) + Vec4::splat(0.25)),
            ShaderUniformSet::new().with("self", target.texture()),
        )
        .unwrap();
        let scene = quad(&mut renderer, material);
        renderer.set_render_target(Some(target.id()));
        renderer.set_viewport(target.full_viewport());
        for _ in 0..3 {
            renderer.render(&scene, &Camera::fullscreen()).unwrap();
        }
        assert_eq!(
            renderer.read_pixel(Some(target.id()), 1, 1),
            Some(Vec4::splat(0.75))
        );
    }

    #[test]
    fn wgsl_programs_are_unsupported() {
        let mut renderer = SoftwareRenderer::new(2, 2);
        let err = renderer
            .create_program(&FragmentSource::wgsl("fn fragment"), &UniformLayout::default())
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::UnsupportedProgram {
                backend: "software",
                program: "wgsl"
            }
        ));
    }

    #[test]
    fn unknown_release_is_ignored() {
        let mut renderer = SoftwareRenderer::new(2, 2);
        renderer.release(GpuHandle::Texture(TextureId(99)));
        assert!(renderer.released().is_empty());
    }

    #[test]
    fn set_canvas_size_resets_viewport() {
        let mut renderer = SoftwareRenderer::new(2, 2);
        renderer.set_canvas_size(10, 6);
        assert_eq!(renderer.canvas_size(), (10, 6));
        assert_eq!(renderer.viewport(), Viewport::full(10, 6));
    }
}
