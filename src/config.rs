//! TOML pipeline configuration.
//!
//! ```toml
//! tone_mapping = "aces_filmic"
//!
//! [[stages]]
//! name = "feedback"
//! output = "back_buffer"
//! fragment_path = "shaders/feedback.wgsl"
//! frame_uniforms = true
//! inputs = [{ uniform = "previous", from = "back_buffer" }]
//! [stages.uniforms]
//! color = [1.0, 0.2, 0.0, 1.0]
//!
//! [[stages]]
//! name = "out"
//! fragment = "fn fragment(uv: vec2<f32>) -> vec4<f32> { return textureSample(src, src_sampler, tex_uv(uv)); }"
//! inputs = [{ uniform = "src", from = "feedback" }]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use glam::{Vec2, Vec3, Vec4};
use serde::Deserialize;

use crate::error::PipelineError;
use crate::pipeline::{InputSource, OutputKind, PipelineBuilder, StageDescriptor};
use crate::renderer::{ToneMapping, Viewport};
use crate::shader::FragmentSource;
use crate::target::FilterMode;
use crate::uniforms::UniformValue;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Target resolution. Both must be set to override the canvas size.
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub filter: FilterMode,
    pub tone_mapping: Option<ToneMapping>,
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub name: String,
    /// Inline WGSL defining `fn fragment(uv: vec2<f32>) -> vec4<f32>`.
    pub fragment: Option<String>,
    /// WGSL file, relative to the config file when loaded with
    /// [`PipelineConfig::load`].
    pub fragment_path: Option<PathBuf>,
    #[serde(default)]
    pub output: OutputKind,
    #[serde(default = "default_attachments")]
    pub attachments: u32,
    /// `[x, y, width, height]` in pixels.
    pub viewport: Option<[u32; 4]>,
    pub tone_mapping: Option<ToneMapping>,
    #[serde(default)]
    pub frame_uniforms: bool,
    #[serde(default)]
    pub uniforms: BTreeMap<String, UniformConfig>,
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
}

fn default_attachments() -> u32 {
    1
}

/// A number, or an array of 2 to 4 numbers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum UniformConfig {
    Float(f32),
    Vector(Vec<f32>),
}

impl UniformConfig {
    fn to_value(&self, name: &str) -> Result<UniformValue, PipelineError> {
        Ok(match self {
            Self::Float(v) => UniformValue::Float(*v),
            Self::Vector(v) => match v.as_slice() {
                [x, y] => Vec2::new(*x, *y).into(),
                [x, y, z] => Vec3::new(*x, *y, *z).into(),
                [x, y, z, w] => Vec4::new(*x, *y, *z, *w).into(),
                _ => {
                    return Err(PipelineError::Config(format!(
                        "uniform '{name}' has {} components; expected 2 to 4",
                        v.len()
                    )));
                }
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    pub uniform: String,
    /// A stage name or `back_buffer`.
    pub from: String,
}

impl PipelineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, PipelineError> {
        Ok(toml::from_str(source)?)
    }

    /// Reads a config file. Relative `fragment_path`s are resolved against
    /// the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&source)?;
        if let Some(dir) = path.parent() {
            for stage in &mut config.stages {
                if let Some(file) = stage.fragment_path.as_mut()
                    && file.is_relative()
                {
                    *file = dir.join(&*file);
                }
            }
        }
        log::debug!(
            "loaded pipeline config {} ({} stage(s))",
            path.display(),
            config.stages.len()
        );
        Ok(config)
    }

    /// Turns the config into a builder, reading any fragment files.
    pub fn into_builder(self) -> Result<PipelineBuilder, PipelineError> {
        let mut builder = PipelineBuilder::new().filter(self.filter);
        match (self.width, self.height) {
            (Some(width), Some(height)) => builder = builder.resolution(width, height),
            (None, None) => {}
            _ => {
                return Err(PipelineError::Config(
                    "width and height must be given together".to_string(),
                ));
            }
        }
        if let Some(tone_mapping) = self.tone_mapping {
            builder = builder.tone_mapping(tone_mapping);
        }
        for stage in self.stages {
            builder = builder.stage(stage.into_descriptor()?);
        }
        Ok(builder)
    }
}

impl StageConfig {
    fn fragment_source(&self) -> Result<FragmentSource, PipelineError> {
        match (&self.fragment, &self.fragment_path) {
            (Some(source), None) => Ok(FragmentSource::wgsl(source.clone())),
            (None, Some(path)) => {
                let source =
                    std::fs::read_to_string(path).map_err(|source| PipelineError::Io {
                        path: path.clone(),
                        source,
                    })?;
                Ok(FragmentSource::wgsl(source))
            }
            (Some(_), Some(_)) => Err(PipelineError::Config(format!(
                "stage '{}' sets both fragment and fragment_path",
                self.name
            ))),
            (None, None) => Err(PipelineError::Config(format!(
                "stage '{}' needs fragment or fragment_path",
                self.name
            ))),
        }
    }

    pub fn into_descriptor(self) -> Result<StageDescriptor, PipelineError> {
        let mut desc = StageDescriptor::new(self.name.clone(), self.fragment_source()?)
            .output_kind(self.output)
            .attachments(self.attachments);
        for (name, value) in &self.uniforms {
            desc = desc.uniform(name.clone(), value.to_value(name)?);
        }
        for input in self.inputs {
            desc = desc.input(input.uniform, InputSource::parse(&input.from));
        }
        if let Some(viewport) = self.viewport {
            desc = desc.viewport(Viewport::from(viewport));
        }
        if let Some(tone_mapping) = self.tone_mapping {
            desc = desc.tone_mapping(tone_mapping);
        }
        if self.frame_uniforms {
            desc = desc.frame_uniforms();
        }
        Ok(desc)
    }
}
