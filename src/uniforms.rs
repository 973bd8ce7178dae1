//! Uniform values and uniform sets bound to fragment programs.
//!
//! A [`ShaderUniformSet`] is the mutable input of one stage. Texture uniforms
//! hold a [`TextureRef`], which never owns the texture it points at: whoever
//! created the texture disposes it.

use std::collections::BTreeMap;

use glam::{Vec2, Vec3, Vec4};

use crate::error::PipelineError;
use crate::renderer::{TargetId, TextureId};

/// Non-owning reference to something a shader can sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureRef {
    /// The first colour attachment of a render target.
    Target(TargetId),
    /// An uploaded data texture.
    Texture(TextureId),
}

/// A single uniform value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Texture(TextureRef),
}

impl UniformValue {
    pub fn kind(&self) -> UniformKind {
        match self {
            Self::Float(_) => UniformKind::Float,
            Self::Vec2(_) => UniformKind::Vec2,
            Self::Vec3(_) => UniformKind::Vec3,
            Self::Vec4(_) => UniformKind::Vec4,
            Self::Texture(_) => UniformKind::Texture,
        }
    }
}

impl From<f32> for UniformValue {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

/// Narrowed to `f32`; lets untyped float literals be passed directly.
impl From<f64> for UniformValue {
    fn from(v: f64) -> Self {
        Self::Float(v as f32)
    }
}

impl From<Vec2> for UniformValue {
    fn from(v: Vec2) -> Self {
        Self::Vec2(v)
    }
}

impl From<Vec3> for UniformValue {
    fn from(v: Vec3) -> Self {
        Self::Vec3(v)
    }
}

impl From<Vec4> for UniformValue {
    fn from(v: Vec4) -> Self {
        Self::Vec4(v)
    }
}

impl From<TextureRef> for UniformValue {
    fn from(v: TextureRef) -> Self {
        Self::Texture(v)
    }
}

/// Type of a uniform slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UniformKind {
    Float,
    Vec2,
    Vec3,
    Vec4,
    Texture,
}

impl UniformKind {
    /// WGSL type used when declaring the slot.
    pub(crate) fn wgsl_type(self) -> &'static str {
        match self {
            Self::Float => "f32",
            Self::Vec2 => "vec2<f32>",
            Self::Vec3 => "vec3<f32>",
            Self::Vec4 => "vec4<f32>",
            Self::Texture => "texture_2d<f32>",
        }
    }

    /// Alignment and size in a WGSL uniform-address-space struct.
    pub(crate) fn wgsl_align_size(self) -> Option<(usize, usize)> {
        match self {
            Self::Float => Some((4, 4)),
            Self::Vec2 => Some((8, 8)),
            Self::Vec3 => Some((16, 12)),
            Self::Vec4 => Some((16, 16)),
            Self::Texture => None,
        }
    }
}

/// Named uniform values, ordered by name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShaderUniformSet {
    values: BTreeMap<String, UniformValue>,
}

impl ShaderUniformSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<UniformValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<UniformValue>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&UniformValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn float(&self, name: &str) -> Option<f32> {
        match self.values.get(name) {
            Some(UniformValue::Float(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn vec2(&self, name: &str) -> Option<Vec2> {
        match self.values.get(name) {
            Some(UniformValue::Vec2(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn vec4(&self, name: &str) -> Option<Vec4> {
        match self.values.get(name) {
            Some(UniformValue::Vec4(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn texture(&self, name: &str) -> Option<TextureRef> {
        match self.values.get(name) {
            Some(UniformValue::Texture(t)) => Some(*t),
            _ => None,
        }
    }

    /// Every texture the set points at.
    pub fn texture_refs(&self) -> impl Iterator<Item = TextureRef> + '_ {
        self.values.values().filter_map(|v| match v {
            UniformValue::Texture(t) => Some(*t),
            _ => None,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &UniformValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Names and kinds of every slot, in binding order.
    pub fn layout(&self) -> UniformLayout {
        UniformLayout {
            slots: self
                .values
                .iter()
                .map(|(name, value)| (name.clone(), value.kind()))
                .collect(),
        }
    }
}

/// The shape of a uniform set: what a compiled program was linked against.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UniformLayout {
    slots: Vec<(String, UniformKind)>,
}

impl UniformLayout {
    pub fn slots(&self) -> impl Iterator<Item = (&str, UniformKind)> {
        self.slots.iter().map(|(n, k)| (n.as_str(), *k))
    }

    /// Non-texture slots, packed into the uniform buffer in this order.
    pub fn values(&self) -> impl Iterator<Item = (&str, UniformKind)> {
        self.slots().filter(|(_, k)| *k != UniformKind::Texture)
    }

    pub fn textures(&self) -> impl Iterator<Item = &str> {
        self.slots()
            .filter(|(_, k)| *k == UniformKind::Texture)
            .map(|(n, _)| n)
    }

    /// Fails unless `set` has exactly this layout.
    pub fn check(&self, set: &ShaderUniformSet) -> Result<(), PipelineError> {
        let other = set.layout();
        if other == *self {
            return Ok(());
        }
        for (name, kind) in self.slots() {
            match set.get(name) {
                None => {
                    return Err(PipelineError::UniformLayout(format!(
                        "missing uniform '{name}'"
                    )));
                }
                Some(v) if v.kind() != kind => {
                    return Err(PipelineError::UniformLayout(format!(
                        "uniform '{name}' changed from {kind:?} to {:?}",
                        v.kind()
                    )));
                }
                Some(_) => {}
            }
        }
        let extra: Vec<_> = other
            .slots()
            .filter(|(n, _)| !self.slots.iter().any(|(m, _)| m == n))
            .map(|(n, _)| n.to_string())
            .collect();
        Err(PipelineError::UniformLayout(format!(
            "unknown uniform(s) {}",
            extra.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_sorted_by_name() {
        let set = ShaderUniformSet::new()
            .with("time", 0.0)
            .with("bb", TextureRef::Texture(TextureId(3)))
            .with("resolution", Vec2::ONE);
        let names: Vec<_> = set.layout().slots().map(|(n, _)| n.to_string()).collect();
        assert_eq!(names, ["bb", "resolution", "time"]);
        assert_eq!(set.layout().textures().collect::<Vec<_>>(), ["bb"]);
        assert_eq!(set.layout().values().count(), 2);
    }

    #[test]
    fn layout_check_accepts_new_values() {
        let a = ShaderUniformSet::new().with("time", 0.0);
        let b = ShaderUniformSet::new().with("time", 4.0);
        assert!(a.layout().check(&b).is_ok());
    }

    #[test]
    fn layout_check_rejects_kind_change() {
        let a = ShaderUniformSet::new().with("time", 0.0);
        let b = ShaderUniformSet::new().with("time", Vec2::ZERO);
        let err = a.layout().check(&b).unwrap_err();
        assert!(err.to_string().contains("changed from Float to Vec2"));
    }

    #[test]
    fn layout_check_rejects_missing_and_extra() {
        let a = ShaderUniformSet::new().with("time", 0.0);
        let missing = ShaderUniformSet::new();
        assert!(a.layout().check(&missing).is_err());

        let extra = ShaderUniformSet::new().with("time", 1.0).with("gain", 2.0);
        let err = a.layout().check(&extra).unwrap_err();
        assert!(err.to_string().contains("gain"));
    }

    #[test]
    fn typed_getters() {
        let set = ShaderUniformSet::new()
            .with("gain", 2.0)
            .with("tint", Vec4::ONE);
        assert_eq!(set.float("gain"), Some(2.0));
        assert_eq!(set.vec4("tint"), Some(Vec4::ONE));
        assert_eq!(set.float("tint"), None);
        assert_eq!(set.texture("gain"), None);
    }
}
