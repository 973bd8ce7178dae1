//! Fragment programs for full-screen passes.
//!
//! Every pass shares one fixed vertex stage: positions are moved by the node
//! translation and projected by the camera, texture coordinates pass through
//! unchanged. Under the full-screen camera quad corners land on clip space
//! as-is. A pass only supplies the fragment half, as one of the
//! [`FragmentSource`] variants.
//!
//! # WGSL programs
//!
//! WGSL sources define a single function:
//!
//! ```wgsl
//! fn fragment(uv: vec2<f32>) -> vec4<f32> {
//!     let previous = textureSample(bb, bb_sampler, tex_uv(uv));
//!     return mix(vec4<f32>(1.0, 0.0, 0.0, 1.0), previous, u.decay);
//! }
//! ```
//!
//! The preamble prepended by [`compose_wgsl`] declares:
//!
//! - `u`: a uniform struct holding every non-texture uniform by name,
//!   at `@group(0) @binding(0)`.
//! - for each texture uniform `name`, a `texture_2d<f32>` called `name` and a
//!   sampler called `name_sampler`.
//! - `tex_uv(uv)`, which maps a quad coordinate (origin bottom-left) to a
//!   texture coordinate (origin top-left).
//!
//! The generated `fs` entry point applies the renderer's tone mapping to
//! whatever `fragment` returns.

use std::fmt;
use std::rc::Rc;

use glam::{Vec2, Vec4};

use crate::error::PipelineError;
use crate::uniforms::{ShaderUniformSet, TextureRef, UniformKind, UniformLayout, UniformValue};

/// Closure type of CPU fragment programs.
pub type NativeFragment = Rc<dyn Fn(&FragmentInput<'_>) -> Vec4>;

/// The fragment half of a full-screen pass.
#[derive(Clone)]
pub enum FragmentSource {
    /// A WGSL `fragment(uv)` function, for GPU engines.
    Wgsl(String),
    /// A Rust closure run per pixel, for CPU engines.
    Native(NativeFragment),
    /// Built-in copy of the texture uniform named `texture`. Every engine
    /// supports it.
    Passthrough { texture: String },
}

impl FragmentSource {
    pub fn wgsl(source: impl Into<String>) -> Self {
        Self::Wgsl(source.into())
    }

    pub fn native(f: impl Fn(&FragmentInput<'_>) -> Vec4 + 'static) -> Self {
        Self::Native(Rc::new(f))
    }

    pub fn passthrough(texture: impl Into<String>) -> Self {
        Self::Passthrough {
            texture: texture.into(),
        }
    }

    /// Short variant name for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Wgsl(_) => "wgsl",
            Self::Native(_) => "native",
            Self::Passthrough { .. } => "passthrough",
        }
    }
}

impl fmt::Debug for FragmentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wgsl(src) => f
                .debug_tuple("Wgsl")
                .field(&format_args!("{} bytes", src.len()))
                .finish(),
            Self::Native(_) => f.write_str("Native(..)"),
            Self::Passthrough { texture } => f
                .debug_struct("Passthrough")
                .field("texture", texture)
                .finish(),
        }
    }
}

/// Lookup of texture texels on behalf of a CPU fragment program.
pub trait TextureSampler {
    /// Samples `texture` at `uv` (origin bottom-left, clamped to the edge).
    /// Unknown or released textures sample as transparent black.
    fn sample(&self, texture: TextureRef, uv: Vec2) -> Vec4;
}

/// Everything a native fragment program sees for one pixel.
pub struct FragmentInput<'a> {
    /// Interpolated quad coordinate, (0, 0) at the bottom-left.
    pub uv: Vec2,
    /// Pixel centre in target space, origin top-left.
    pub frag_coord: Vec2,
    pub uniforms: &'a ShaderUniformSet,
    pub sampler: &'a dyn TextureSampler,
}

impl FragmentInput<'_> {
    /// A float uniform, `0.0` if absent.
    pub fn float(&self, name: &str) -> f32 {
        self.uniforms.float(name).unwrap_or(0.0)
    }

    pub fn vec2(&self, name: &str) -> Vec2 {
        self.uniforms.vec2(name).unwrap_or(Vec2::ZERO)
    }

    pub fn vec4(&self, name: &str) -> Vec4 {
        self.uniforms.vec4(name).unwrap_or(Vec4::ZERO)
    }

    /// Samples the texture uniform `name` at `uv`.
    pub fn sample(&self, name: &str, uv: Vec2) -> Vec4 {
        match self.uniforms.texture(name) {
            Some(texture) => self.sampler.sample(texture, uv),
            None => Vec4::ZERO,
        }
    }
}

/// The vertex stage and tone-mapping plumbing shared by every program.
/// Per-draw parameters live at `@group(1) @binding(0)`.
const SHARED_WGSL: &str = r#"
struct VertexOut {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

struct Draw {
    clip_from_world: mat4x4<f32>,
    translation: vec4<f32>,
    tone_mode: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

@group(1) @binding(0) var<uniform> draw: Draw;

@vertex
fn vs(@location(0) position: vec3<f32>, @location(1) uv: vec2<f32>) -> VertexOut {
    var out: VertexOut;
    out.position = draw.clip_from_world * vec4<f32>(position + draw.translation.xyz, 1.0);
    out.uv = uv;
    return out;
}

fn tex_uv(uv: vec2<f32>) -> vec2<f32> {
    return vec2<f32>(uv.x, 1.0 - uv.y);
}

fn tone_map(c: vec3<f32>) -> vec3<f32> {
    var mapped = c;
    switch draw.tone_mode {
        case 1u: {
            mapped = clamp(c, vec3<f32>(0.0), vec3<f32>(1.0));
        }
        case 2u: {
            mapped = c / (vec3<f32>(1.0) + c);
        }
        case 3u: {
            let m = (c * (2.51 * c + 0.03)) / (c * (2.43 * c + 0.59) + 0.14);
            mapped = clamp(m, vec3<f32>(0.0), vec3<f32>(1.0));
        }
        default: {}
    }
    return mapped;
}

@fragment
fn fs(in: VertexOut) -> @location(0) vec4<f32> {
    let c = fragment(in.uv);
    return vec4<f32>(tone_map(c.rgb), c.a);
}
"#;

/// Byte offsets of the non-texture uniforms inside the uniform buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UniformBufferLayout {
    fields: Vec<(String, UniformKind, usize)>,
    size: usize,
}

impl UniformBufferLayout {
    /// Lays out the value slots of `layout` with WGSL uniform alignment.
    pub fn new(layout: &UniformLayout) -> Self {
        let mut offset = 0usize;
        let mut max_align = 4usize;
        let mut fields = Vec::new();
        for (name, kind) in layout.values() {
            let Some((align, size)) = kind.wgsl_align_size() else {
                continue;
            };
            offset = offset.next_multiple_of(align);
            fields.push((name.to_string(), kind, offset));
            offset += size;
            max_align = max_align.max(align);
        }
        // uniform buffers are bound in 16-byte granules
        let size = offset.next_multiple_of(max_align).max(16).next_multiple_of(16);
        Self { fields, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn offset_of(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, _, offset)| *offset)
    }

    /// Serializes the current values of `set`. Missing values stay zero.
    pub fn pack(&self, set: &ShaderUniformSet) -> Vec<u8> {
        let mut bytes = vec![0u8; self.size];
        for (name, _, offset) in &self.fields {
            let floats: Vec<f32> = match set.get(name) {
                Some(UniformValue::Float(v)) => vec![*v],
                Some(UniformValue::Vec2(v)) => v.to_array().to_vec(),
                Some(UniformValue::Vec3(v)) => v.to_array().to_vec(),
                Some(UniformValue::Vec4(v)) => v.to_array().to_vec(),
                Some(UniformValue::Texture(_)) | None => continue,
            };
            let src: &[u8] = bytemuck::cast_slice(&floats);
            bytes[*offset..*offset + src.len()].copy_from_slice(src);
        }
        bytes
    }
}

fn check_identifier(name: &str) -> Result<(), PipelineError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && !name.starts_with("__")
    {
        Ok(())
    } else {
        Err(PipelineError::UniformLayout(format!(
            "'{name}' is not a valid shader identifier"
        )))
    }
}

/// Builds the complete WGSL module for `fragment` with bindings for `layout`.
///
/// Texture uniform `i` (in layout order) binds at `2i + 1`, its sampler at
/// `2i + 2`.
pub fn compose_wgsl(fragment: &FragmentSource, layout: &UniformLayout) -> Result<String, PipelineError> {
    let body = match fragment {
        FragmentSource::Wgsl(src) => src.clone(),
        FragmentSource::Passthrough { texture } => {
            if !layout.textures().any(|t| t == texture) {
                return Err(PipelineError::UniformLayout(format!(
                    "passthrough program needs a texture uniform '{texture}'"
                )));
            }
            format!(
                "fn fragment(uv: vec2<f32>) -> vec4<f32> {{\n    \
                 return textureSample({texture}, {texture}_sampler, tex_uv(uv));\n}}\n"
            )
        }
        FragmentSource::Native(_) => {
            return Err(PipelineError::UnsupportedProgram {
                backend: "wgpu",
                program: "native",
            });
        }
    };

    let mut out = String::from("struct Uniforms {\n");
    let mut any_value = false;
    for (name, kind) in layout.slots() {
        check_identifier(name)?;
        if kind != UniformKind::Texture {
            out.push_str(&format!("    {name}: {},\n", kind.wgsl_type()));
            any_value = true;
        }
    }
    if !any_value {
        out.push_str("    _unused: vec4<f32>,\n");
    }
    out.push_str("}\n\n@group(0) @binding(0) var<uniform> u: Uniforms;\n");
    for (i, name) in layout.textures().enumerate() {
        let binding = 2 * i + 1;
        out.push_str(&format!(
            "@group(0) @binding({binding}) var {name}: texture_2d<f32>;\n\
             @group(0) @binding({}) var {name}_sampler: sampler;\n",
            binding + 1
        ));
    }
    out.push_str(SHARED_WGSL);
    out.push('\n');
    out.push_str(&body);
    Ok(out)
}

/// Parses and validates a composed module, reporting errors with source
/// context.
pub fn validate_wgsl(source: &str) -> Result<naga::Module, PipelineError> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| PipelineError::ShaderCompile(e.emit_to_string(source)))?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    validator
        .validate(&module)
        .map_err(|e| PipelineError::ShaderCompile(format!("validation error: {e}")))?;
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::TargetId;
    use glam::Vec3;

    fn layout() -> UniformLayout {
        ShaderUniformSet::new()
            .with("bb", TextureRef::Target(TargetId(0)))
            .with("decay", 0.9)
            .with("resolution", Vec2::new(32.0, 32.0))
            .with("tint", Vec3::ONE)
            .layout()
    }

    #[test]
    fn composed_program_validates() {
        let fragment = FragmentSource::wgsl(
            "fn fragment(uv: vec2<f32>) -> vec4<f32> {\n\
             let prev = textureSample(bb, bb_sampler, tex_uv(uv));\n\
             return mix(vec4<f32>(u.tint, 1.0), prev, u.decay);\n}\n",
        );
        let src = compose_wgsl(&fragment, &layout()).unwrap();
        let module = validate_wgsl(&src).unwrap();
        assert!(module.entry_points.iter().any(|ep| ep.name == "vs"));
        assert!(module.entry_points.iter().any(|ep| ep.name == "fs"));
    }

    #[test]
    fn syntax_error_is_a_compile_error() {
        let fragment = FragmentSource::wgsl("fn fragment(uv: vec2<f32>) -> vec4<f32> { return 1.0 }");
        let src = compose_wgsl(&fragment, &UniformLayout::default()).unwrap();
        let err = validate_wgsl(&src).unwrap_err();
        assert!(matches!(err, PipelineError::ShaderCompile(_)));
        assert!(err.is_configuration());
    }

    #[test]
    fn unknown_uniform_is_a_compile_error() {
        let fragment =
            FragmentSource::wgsl("fn fragment(uv: vec2<f32>) -> vec4<f32> { return vec4<f32>(u.gain); }");
        let src = compose_wgsl(&fragment, &UniformLayout::default()).unwrap();
        assert!(validate_wgsl(&src).is_err());
    }

    #[test]
    fn passthrough_needs_its_texture() {
        let missing = compose_wgsl(&FragmentSource::passthrough("tex"), &UniformLayout::default());
        assert!(missing.is_err());

        let layout = ShaderUniformSet::new()
            .with("tex", TextureRef::Target(TargetId(1)))
            .layout();
        let src = compose_wgsl(&FragmentSource::passthrough("tex"), &layout).unwrap();
        validate_wgsl(&src).unwrap();
    }

    #[test]
    fn native_programs_do_not_compose() {
        let err = compose_wgsl(&FragmentSource::native(|_| Vec4::ONE), &UniformLayout::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedProgram { .. }));
    }

    #[test]
    fn bad_identifier_rejected() {
        let layout = ShaderUniformSet::new().with("my gain", 1.0).layout();
        let err = compose_wgsl(&FragmentSource::wgsl(""), &layout).unwrap_err();
        assert!(matches!(err, PipelineError::UniformLayout(_)));
    }

    #[test]
    fn buffer_layout_follows_wgsl_alignment() {
        let buffer = UniformBufferLayout::new(&layout());
        // decay: f32 @0, resolution: vec2 @8, tint: vec3 @16
        assert_eq!(buffer.offset_of("decay"), Some(0));
        assert_eq!(buffer.offset_of("resolution"), Some(8));
        assert_eq!(buffer.offset_of("tint"), Some(16));
        assert_eq!(buffer.offset_of("bb"), None);
        assert_eq!(buffer.size(), 32);

        let set = ShaderUniformSet::new()
            .with("decay", 0.5)
            .with("resolution", Vec2::new(3.0, 4.0));
        let bytes = buffer.pack(&set);
        let floats: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(floats[0], 0.5);
        assert_eq!(&floats[2..4], &[3.0, 4.0]);
        assert_eq!(floats[4], 0.0);
    }

    #[test]
    fn empty_layout_still_has_a_buffer() {
        assert_eq!(UniformBufferLayout::new(&UniformLayout::default()).size(), 16);
    }
}
