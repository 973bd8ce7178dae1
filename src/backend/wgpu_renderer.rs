//! GPU engine on top of wgpu.
//!
//! Offscreen targets are `Rgba16Float` so feedback passes keep values above
//! one; data textures are `Rgba8Unorm`. Each fragment program is compiled
//! once and linked into a render pipeline per (output format, attachment
//! count) on first use.

use std::collections::HashMap;

use glam::{Mat4, Vec3, Vec4};
use wgpu::util::DeviceExt;

use crate::camera::Camera;
use crate::error::PipelineError;
use crate::gpu::GpuContext;
use crate::renderer::{
    GeometryId, GpuHandle, ProgramId, Renderer, RendererState, TargetDescriptor, TargetId,
    TextureDescriptor, TextureId, ToneMapping, Viewport,
};
use crate::scene::{GeometryKind, MaterialKind, Scene, SceneNode, Vertex};
use crate::shader::{FragmentSource, UniformBufferLayout, compose_wgsl, validate_wgsl};
use crate::target::FilterMode;
use crate::uniforms::{ShaderUniformSet, TextureRef, UniformLayout};

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;
const DATA_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Program used for [`MaterialKind::Basic`] meshes.
const BASIC_FRAGMENT: &str = r#"
fn fragment(uv: vec2<f32>) -> vec4<f32> {
    return u.color * textureSample(map, map_sampler, tex_uv(uv));
}
"#;

/// Per-draw parameters at `@group(1) @binding(0)`.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct DrawUniforms {
    clip_from_world: [[f32; 4]; 4],
    translation: [f32; 4],
    tone_mode: u32,
    _pad: [u32; 3],
}

impl DrawUniforms {
    fn new(clip_from_world: Mat4, translation: Vec3, tone_mapping: ToneMapping) -> Self {
        Self {
            clip_from_world: clip_from_world.to_cols_array_2d(),
            translation: translation.extend(0.0).to_array(),
            tone_mode: tone_mapping.shader_index(),
            _pad: [0; 3],
        }
    }
}

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    sampler: wgpu::Sampler,
    filter: FilterMode,
    width: u32,
    height: u32,
}

impl GpuTexture {
    fn new(
        device: &wgpu::Device,
        texture: wgpu::Texture,
        filter: FilterMode,
        width: u32,
        height: u32,
    ) -> Self {
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let sampler = create_sampler(device, filter);
        Self {
            texture,
            view,
            sampler,
            filter,
            width,
            height,
        }
    }

    fn extent(&self) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: self.width,
            height: self.height,
            depth_or_array_layers: 1,
        }
    }
}

fn create_sampler(device: &wgpu::Device, filter: FilterMode) -> wgpu::Sampler {
    device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("backbuffer sampler"),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: filter.into(),
        min_filter: filter.into(),
        mipmap_filter: wgpu::FilterMode::Nearest,
        ..Default::default()
    })
}

struct GpuGeometry {
    buffer: wgpu::Buffer,
    vertex_count: u32,
}

struct GpuProgram {
    module: wgpu::ShaderModule,
    layout: UniformLayout,
    buffer_layout: UniformBufferLayout,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: ProgramId,
    format: wgpu::TextureFormat,
    attachments: u32,
}

/// A mesh resolved to engine handles, collected before encoding.
struct DrawItem {
    geometry: GeometryId,
    program: ProgramId,
    uniforms: ShaderUniformSet,
    translation: Vec3,
}

struct PreparedDraw {
    key: PipelineKey,
    geometry: GeometryId,
    values: wgpu::BindGroup,
    params: wgpu::BindGroup,
}

struct CanvasFrame {
    surface: wgpu::SurfaceTexture,
    view: wgpu::TextureView,
}

/// [`Renderer`] drawing through wgpu into offscreen textures and the window
/// surface.
///
/// Only [`FragmentSource::Wgsl`] and [`FragmentSource::Passthrough`]
/// programs are accepted. The canvas frame is acquired by the first draw
/// that targets it and shown by [`present`](Renderer::present).
pub struct WgpuRenderer {
    gpu: GpuContext,
    draw_layout: wgpu::BindGroupLayout,
    targets: HashMap<TargetId, Vec<GpuTexture>>,
    textures: HashMap<TextureId, GpuTexture>,
    geometries: HashMap<GeometryId, GpuGeometry>,
    programs: HashMap<ProgramId, GpuProgram>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    basic_program: ProgramId,
    white: TextureId,
    next_id: u32,
    state: RendererState,
    frame: Option<CanvasFrame>,
}

impl WgpuRenderer {
    pub fn new(gpu: GpuContext) -> Result<Self, PipelineError> {
        let draw_layout = gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("draw params layout"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            });

        let white = TextureId(0);
        let basic_program = ProgramId(1);
        let white_texture = upload_texture(
            &gpu,
            &TextureDescriptor {
                width: 1,
                height: 1,
                filter: FilterMode::Nearest,
            },
            &[Vec4::ONE],
        );
        let basic_layout = ShaderUniformSet::new()
            .with("color", Vec4::ONE)
            .with("map", TextureRef::Texture(white))
            .layout();
        let basic = compile_program(
            &gpu.device,
            &draw_layout,
            &FragmentSource::wgsl(BASIC_FRAGMENT),
            &basic_layout,
        )?;

        let (width, height) = (gpu.width(), gpu.height());
        Ok(Self {
            gpu,
            draw_layout,
            targets: HashMap::new(),
            textures: HashMap::from([(white, white_texture)]),
            geometries: HashMap::new(),
            programs: HashMap::from([(basic_program, basic)]),
            pipelines: HashMap::new(),
            basic_program,
            white,
            next_id: 2,
            state: RendererState {
                target: None,
                viewport: Viewport::full(width, height),
                tone_mapping: ToneMapping::None,
            },
            frame: None,
        })
    }

    pub fn gpu(&self) -> &GpuContext {
        &self.gpu
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Size, format and attachment count of the bound target.
    fn bound_output(&self) -> Result<(u32, u32, wgpu::TextureFormat, u32), PipelineError> {
        match self.state.target {
            Some(id) => {
                let attachments = self
                    .targets
                    .get(&id)
                    .ok_or(PipelineError::UnknownHandle(GpuHandle::Target(id)))?;
                let first = attachments
                    .first()
                    .ok_or(PipelineError::UnknownHandle(GpuHandle::Target(id)))?;
                Ok((
                    first.width,
                    first.height,
                    TARGET_FORMAT,
                    attachments.len() as u32,
                ))
            }
            None => Ok((self.gpu.width(), self.gpu.height(), self.gpu.format(), 1)),
        }
    }

    fn acquire_frame(&mut self) -> Result<(), PipelineError> {
        if self.frame.is_some() {
            return Ok(());
        }
        let surface = match self.gpu.surface.get_current_texture() {
            Ok(surface) => surface,
            Err(e @ (wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated)) => {
                let (width, height) = (self.gpu.width(), self.gpu.height());
                self.gpu.resize(width, height);
                return Err(PipelineError::Surface(e.to_string()));
            }
            Err(e) => return Err(PipelineError::Surface(e.to_string())),
        };
        let view = surface
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        self.frame = Some(CanvasFrame { surface, view });
        Ok(())
    }

    fn draw_item(&self, node: &SceneNode, translation: Vec3) -> Result<DrawItem, PipelineError> {
        let (Some(geometry), Some(material)) = (node.geometry(), node.material()) else {
            return Err(PipelineError::Gpu(format!(
                "node '{}' has nothing to draw",
                node.name()
            )));
        };
        if !self.geometries.contains_key(&geometry.id()) {
            return Err(PipelineError::UnknownHandle(GpuHandle::Geometry(
                geometry.id(),
            )));
        }
        let (program, uniforms) = match material.kind() {
            MaterialKind::Shader {
                program, uniforms, ..
            } => (*program, uniforms.borrow().clone()),
            MaterialKind::Basic { color, map } => {
                let map = map
                    .as_ref()
                    .map_or(TextureRef::Texture(self.white), |m| m.get().texture_ref());
                (
                    self.basic_program,
                    ShaderUniformSet::new().with("color", *color).with("map", map),
                )
            }
        };
        Ok(DrawItem {
            geometry: geometry.id(),
            program,
            uniforms,
            translation,
        })
    }

    fn ensure_pipeline(&mut self, key: PipelineKey) -> Result<(), PipelineError> {
        if self.pipelines.contains_key(&key) {
            return Ok(());
        }
        let program = self
            .programs
            .get(&key.program)
            .ok_or(PipelineError::UnknownHandle(GpuHandle::Program(key.program)))?;

        // Extra attachments are cleared by the pass but never written.
        let targets: Vec<Option<wgpu::ColorTargetState>> = (0..key.attachments)
            .map(|i| {
                Some(wgpu::ColorTargetState {
                    format: key.format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: if i == 0 {
                        wgpu::ColorWrites::ALL
                    } else {
                        wgpu::ColorWrites::empty()
                    },
                })
            })
            .collect();

        let pipeline = self
            .gpu
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("backbuffer pipeline"),
                layout: Some(&program.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &program.module,
                    entry_point: Some("vs"),
                    buffers: &[Vertex::LAYOUT],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &program.module,
                    entry_point: Some("fs"),
                    targets: &targets,
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    cull_mode: None,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            });
        log::trace!("linked {key:?}");
        self.pipelines.insert(key, pipeline);
        Ok(())
    }

    /// Copies the first attachment of `id` so a pass can sample what it is
    /// about to overwrite.
    fn snapshot(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        id: TargetId,
    ) -> Result<GpuTexture, PipelineError> {
        let source = self
            .targets
            .get(&id)
            .and_then(|a| a.first())
            .ok_or(PipelineError::UnknownHandle(GpuHandle::Target(id)))?;
        let texture = self.gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("feedback snapshot"),
            size: source.extent(),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        encoder.copy_texture_to_texture(
            source.texture.as_image_copy(),
            texture.as_image_copy(),
            source.extent(),
        );
        Ok(GpuTexture::new(
            &self.gpu.device,
            texture,
            source.filter,
            source.width,
            source.height,
        ))
    }

    fn resolve_texture<'a>(
        &'a self,
        texture: TextureRef,
        snapshot: Option<(TargetId, &'a GpuTexture)>,
    ) -> Result<&'a GpuTexture, PipelineError> {
        match texture {
            TextureRef::Target(id) => match snapshot {
                Some((bound, copy)) if bound == id => Ok(copy),
                _ => self
                    .targets
                    .get(&id)
                    .and_then(|a| a.first())
                    .ok_or(PipelineError::UnknownHandle(GpuHandle::Target(id))),
            },
            TextureRef::Texture(id) => self
                .textures
                .get(&id)
                .ok_or(PipelineError::UnknownHandle(GpuHandle::Texture(id))),
        }
    }

    fn prepare(
        &self,
        item: &DrawItem,
        key: PipelineKey,
        clip_from_world: Mat4,
        snapshot: Option<(TargetId, &GpuTexture)>,
    ) -> Result<PreparedDraw, PipelineError> {
        let device = &self.gpu.device;
        let program = self
            .programs
            .get(&item.program)
            .ok_or(PipelineError::UnknownHandle(GpuHandle::Program(item.program)))?;

        let values = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("uniform values"),
            contents: &program.buffer_layout.pack(&item.uniforms),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let mut bound = Vec::new();
        for name in program.layout.textures() {
            let texture = item.uniforms.texture(name).ok_or_else(|| {
                PipelineError::UniformLayout(format!("texture uniform '{name}' has no value"))
            })?;
            bound.push(self.resolve_texture(texture, snapshot)?);
        }

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: values.as_entire_binding(),
        }];
        for (i, texture) in bound.iter().enumerate() {
            let binding = 2 * i as u32 + 1;
            entries.push(wgpu::BindGroupEntry {
                binding,
                resource: wgpu::BindingResource::TextureView(&texture.view),
            });
            entries.push(wgpu::BindGroupEntry {
                binding: binding + 1,
                resource: wgpu::BindingResource::Sampler(&texture.sampler),
            });
        }
        let values = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("uniform bind group"),
            layout: &program.bind_group_layout,
            entries: &entries,
        });

        let draw = DrawUniforms::new(clip_from_world, item.translation, self.state.tone_mapping);
        let draw_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("draw params"),
            contents: bytemuck::bytes_of(&draw),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let params = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("draw params bind group"),
            layout: &self.draw_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: draw_buffer.as_entire_binding(),
            }],
        });

        Ok(PreparedDraw {
            key,
            geometry: item.geometry,
            values,
            params,
        })
    }
}

fn compile_program(
    device: &wgpu::Device,
    draw_layout: &wgpu::BindGroupLayout,
    fragment: &FragmentSource,
    layout: &UniformLayout,
) -> Result<GpuProgram, PipelineError> {
    let source = compose_wgsl(fragment, layout)?;
    validate_wgsl(&source)?;

    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("fragment program"),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    if let Some(e) = pollster::block_on(device.pop_error_scope()) {
        return Err(PipelineError::ShaderCompile(e.to_string()));
    }

    let mut entries = vec![wgpu::BindGroupLayoutEntry {
        binding: 0,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }];
    for i in 0..layout.textures().count() as u32 {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: 2 * i + 1,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        });
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: 2 * i + 2,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        });
    }
    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("uniform layout"),
        entries: &entries,
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("program layout"),
        bind_group_layouts: &[&bind_group_layout, draw_layout],
        push_constant_ranges: &[],
    });

    Ok(GpuProgram {
        module,
        layout: layout.clone(),
        buffer_layout: UniformBufferLayout::new(layout),
        bind_group_layout,
        pipeline_layout,
    })
}

fn upload_texture(gpu: &GpuContext, desc: &TextureDescriptor, texels: &[Vec4]) -> GpuTexture {
    let texture = gpu.device.create_texture_with_data(
        &gpu.queue,
        &wgpu::TextureDescriptor {
            label: Some("data texture"),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DATA_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        },
        wgpu::util::TextureDataOrder::LayerMajor,
        &texels_to_rgba8(texels),
    );
    GpuTexture::new(&gpu.device, texture, desc.filter, desc.width, desc.height)
}

fn texels_to_rgba8(texels: &[Vec4]) -> Vec<u8> {
    texels
        .iter()
        .flat_map(|t| {
            (t.clamp(Vec4::ZERO, Vec4::ONE) * 255.0)
                .round()
                .to_array()
                .map(|c| c as u8)
        })
        .collect()
}

/// Intersects `viewport` with a `width` x `height` attachment. `None` when
/// nothing is left to draw.
fn scissor_rect(viewport: Viewport, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let x0 = viewport.x.min(width);
    let y0 = viewport.y.min(height);
    let x1 = viewport.x.saturating_add(viewport.width).min(width);
    let y1 = viewport.y.saturating_add(viewport.height).min(height);
    (x1 > x0 && y1 > y0).then(|| (x0, y0, x1 - x0, y1 - y0))
}

impl Renderer for WgpuRenderer {
    fn name(&self) -> &'static str {
        "wgpu"
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
        (self.gpu.width(), self.gpu.height())
    }

    fn set_canvas_size(&mut self, width: u32, height: u32) {
        // a frame acquired at the old size is dropped unshown
        self.frame = None;
        self.gpu.resize(width, height);
        self.state.viewport = Viewport::full(width, height);
    }

    fn create_target(&mut self, desc: &TargetDescriptor) -> Result<TargetId, PipelineError> {
        let id = TargetId(self.next_id());
        let attachments = (0..desc.attachments)
            .map(|_| {
                let texture = self.gpu.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some("render target"),
                    size: wgpu::Extent3d {
                        width: desc.width,
                        height: desc.height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: TARGET_FORMAT,
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                        | wgpu::TextureUsages::TEXTURE_BINDING
                        | wgpu::TextureUsages::COPY_SRC,
                    view_formats: &[],
                });
                GpuTexture::new(
                    &self.gpu.device,
                    texture,
                    desc.filter,
                    desc.width,
                    desc.height,
                )
            })
            .collect();
        log::trace!(
            "wgpu: created target {id:?} ({}x{}, {} attachment(s))",
            desc.width,
            desc.height,
            desc.attachments
        );
        self.targets.insert(id, attachments);
        Ok(id)
    }

    fn create_texture(
        &mut self,
        desc: &TextureDescriptor,
        texels: &[Vec4],
    ) -> Result<TextureId, PipelineError> {
        let id = TextureId(self.next_id());
        let texture = upload_texture(&self.gpu, desc, texels);
        self.textures.insert(id, texture);
        Ok(id)
    }

    fn create_geometry(&mut self, kind: &GeometryKind) -> Result<GeometryId, PipelineError> {
        let id = GeometryId(self.next_id());
        let vertices = kind.vertices();
        let buffer = self
            .gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("geometry vertices"),
                contents: bytemuck::cast_slice(&vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });
        self.geometries.insert(
            id,
            GpuGeometry {
                buffer,
                vertex_count: vertices.len() as u32,
            },
        );
        Ok(id)
    }

    fn create_program(
        &mut self,
        fragment: &FragmentSource,
        layout: &UniformLayout,
    ) -> Result<ProgramId, PipelineError> {
        let program = compile_program(&self.gpu.device, &self.draw_layout, fragment, layout)?;
        let id = ProgramId(self.next_id());
        self.programs.insert(id, program);
        Ok(id)
    }

    fn release(&mut self, handle: GpuHandle) {
        let removed = match handle {
            GpuHandle::Target(id) => self.targets.remove(&id).is_some(),
            GpuHandle::Texture(id) if id == self.white => false,
            GpuHandle::Texture(id) => self.textures.remove(&id).is_some(),
            GpuHandle::Geometry(id) => self.geometries.remove(&id).is_some(),
            GpuHandle::Program(id) if id == self.basic_program => false,
            GpuHandle::Program(id) => {
                self.pipelines.retain(|key, _| key.program != id);
                self.programs.remove(&id).is_some()
            }
        };
        if removed {
            log::trace!("wgpu: released {handle:?}");
        }
    }

    fn render(&mut self, scene: &Scene, camera: &Camera) -> Result<(), PipelineError> {
        let (width, height, format, attachments) = self.bound_output()?;
        let viewport = self.state.viewport;
        let Some((sx, sy, sw, sh)) = scissor_rect(viewport, width, height) else {
            log::trace!("viewport {viewport:?} misses the bound target; draw skipped");
            return Ok(());
        };
        // the device rejects viewports that leave the attachment
        if !viewport.fits(width, height) {
            return Err(PipelineError::ViewportOutOfBounds {
                viewport,
                width,
                height,
            });
        }

        let mut items = Vec::new();
        let mut failure = None;
        scene.for_each_mesh(|node, offset| {
            if failure.is_none() {
                match self.draw_item(node, offset) {
                    Ok(item) => items.push(item),
                    Err(e) => failure = Some(e),
                }
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }

        for item in &items {
            self.ensure_pipeline(PipelineKey {
                program: item.program,
                format,
                attachments,
            })?;
        }
        let target = self.state.target;
        if target.is_none() {
            self.acquire_frame()?;
        }

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("backbuffer draw"),
            });

        let self_sampled = target.filter(|id| {
            items
                .iter()
                .any(|item| item.uniforms.texture_refs().any(|t| t == TextureRef::Target(*id)))
        });
        let snapshot = match self_sampled {
            Some(id) => Some((id, self.snapshot(&mut encoder, id)?)),
            None => None,
        };
        let snapshot_ref = snapshot.as_ref().map(|(id, copy)| (*id, copy));

        let clip_from_world = camera.clip_from_world();
        let prepared = items
            .iter()
            .map(|item| {
                let key = PipelineKey {
                    program: item.program,
                    format,
                    attachments,
                };
                self.prepare(item, key, clip_from_world, snapshot_ref)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let views: Vec<&wgpu::TextureView> = match target {
            Some(id) => self
                .targets
                .get(&id)
                .map(|a| a.iter().map(|t| &t.view).collect())
                .unwrap_or_default(),
            None => self.frame.iter().map(|f| &f.view).collect(),
        };
        // A partial viewport keeps the pixels around it.
        let load = if (sx, sy, sw, sh) == (0, 0, width, height) {
            wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT)
        } else {
            wgpu::LoadOp::Load
        };
        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = views
            .iter()
            .map(|&view| {
                Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })
            })
            .collect();

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("backbuffer pass"),
                color_attachments: &color_attachments,
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_viewport(
                viewport.x as f32,
                viewport.y as f32,
                viewport.width as f32,
                viewport.height as f32,
                0.0,
                1.0,
            );
            pass.set_scissor_rect(sx, sy, sw, sh);

            for draw in &prepared {
                let (Some(pipeline), Some(geometry)) = (
                    self.pipelines.get(&draw.key),
                    self.geometries.get(&draw.geometry),
                ) else {
                    continue;
                };
                pass.set_pipeline(pipeline);
                pass.set_bind_group(0, &draw.values, &[]);
                pass.set_bind_group(1, &draw.params, &[]);
                pass.set_vertex_buffer(0, geometry.buffer.slice(..));
                pass.draw(0..geometry.vertex_count, 0..1);
            }
        }

        self.gpu.queue.submit(std::iter::once(encoder.finish()));
        log::trace!(
            "wgpu: drew '{}' ({} mesh(es)) into {target:?}",
            scene.name(),
            prepared.len()
        );
        Ok(())
    }

    fn present(&mut self) {
        if let Some(frame) = self.frame.take() {
            frame.surface.present();
        }
    }
}
