use std::rc::Rc;

use serde::Deserialize;

use crate::error::PipelineError;
use crate::pipeline::FrameContext;
use crate::renderer::{ToneMapping, Viewport};
use crate::shader::FragmentSource;
use crate::shader_pass::ShaderPassStage;
use crate::target::RenderTarget;
use crate::uniforms::{ShaderUniformSet, TextureRef, UniformValue};

/// Per-frame hook run right before a stage draws.
pub type UpdateFn = Box<dyn FnMut(&FrameContext, &mut ShaderPassStage) -> Result<(), PipelineError>>;

/// Where a stage draws, as declared.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    #[default]
    Canvas,
    Offscreen,
    BackBuffer,
}

/// Where a stage draws, once allocated.
#[derive(Clone, Debug)]
pub enum StageOutput {
    Canvas,
    Offscreen(Rc<RenderTarget>),
    BackBuffer,
}

impl StageOutput {
    pub fn kind(&self) -> OutputKind {
        match self {
            Self::Canvas => OutputKind::Canvas,
            Self::Offscreen(_) => OutputKind::Offscreen,
            Self::BackBuffer => OutputKind::BackBuffer,
        }
    }
}

/// The texture feeding an input uniform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputSource {
    /// What the named earlier stage drew this frame.
    Stage(String),
    /// Last frame's back buffer.
    BackBuffer,
}

impl InputSource {
    pub fn stage(name: impl Into<String>) -> Self {
        Self::Stage(name.into())
    }

    /// Parses a config reference: `back_buffer` or a stage name.
    pub fn parse(from: &str) -> Self {
        match from {
            "back_buffer" => Self::BackBuffer,
            name => Self::Stage(name.to_string()),
        }
    }

    pub(crate) fn label(&self) -> &str {
        match self {
            Self::Stage(name) => name,
            Self::BackBuffer => "back_buffer",
        }
    }
}

/// Declaration of one stage, consumed by
/// [`PipelineBuilder::stage`](crate::PipelineBuilder::stage).
pub struct StageDescriptor {
    pub(crate) name: String,
    pub(crate) fragment: FragmentSource,
    pub(crate) uniforms: ShaderUniformSet,
    pub(crate) output: OutputKind,
    pub(crate) attachments: u32,
    pub(crate) viewport: Option<Viewport>,
    pub(crate) tone_mapping: Option<ToneMapping>,
    pub(crate) frame_uniforms: bool,
    pub(crate) inputs: Vec<(String, InputSource)>,
    pub(crate) update: Option<UpdateFn>,
}

impl StageDescriptor {
    /// A stage drawing `fragment` to the canvas.
    pub fn new(name: impl Into<String>, fragment: FragmentSource) -> Self {
        Self {
            name: name.into(),
            fragment,
            uniforms: ShaderUniformSet::new(),
            output: OutputKind::Canvas,
            attachments: 1,
            viewport: None,
            tone_mapping: None,
            frame_uniforms: false,
            inputs: Vec::new(),
            update: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output(&self) -> OutputKind {
        self.output
    }

    pub fn to_canvas(mut self) -> Self {
        self.output = OutputKind::Canvas;
        self
    }

    pub fn offscreen(mut self) -> Self {
        self.output = OutputKind::Offscreen;
        self
    }

    /// Offscreen target with several colour attachments. Needs a viewport.
    pub fn offscreen_multi(mut self, attachments: u32) -> Self {
        self.output = OutputKind::Offscreen;
        self.attachments = attachments;
        self
    }

    pub fn to_back_buffer(mut self) -> Self {
        self.output = OutputKind::BackBuffer;
        self
    }

    pub fn output_kind(mut self, output: OutputKind) -> Self {
        self.output = output;
        self
    }

    pub fn attachments(mut self, attachments: u32) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn uniforms(mut self, uniforms: ShaderUniformSet) -> Self {
        self.uniforms = uniforms;
        self
    }

    pub fn uniform(mut self, name: impl Into<String>, value: impl Into<UniformValue>) -> Self {
        self.uniforms.set(name, value);
        self
    }

    /// Binds the texture of `from` to the uniform `uniform` every frame.
    pub fn input(mut self, uniform: impl Into<String>, from: InputSource) -> Self {
        self.inputs.push((uniform.into(), from));
        self
    }

    pub fn viewport(mut self, viewport: Viewport) -> Self {
        self.viewport = Some(viewport);
        self
    }

    pub fn tone_mapping(mut self, tone_mapping: ToneMapping) -> Self {
        self.tone_mapping = Some(tone_mapping);
        self
    }

    /// Fills `time`, `resolution` and `ratio` before every draw.
    pub fn frame_uniforms(mut self) -> Self {
        self.frame_uniforms = true;
        self
    }

    pub fn on_update(
        mut self,
        update: impl FnMut(&FrameContext, &mut ShaderPassStage) -> Result<(), PipelineError> + 'static,
    ) -> Self {
        self.update = Some(Box::new(update));
        self
    }
}

/// Index of an input's source among the pipeline's stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ResolvedInput {
    Stage(usize),
    BackBuffer,
}

/// A built stage owned by a [`PipelineScheduler`](crate::PipelineScheduler).
pub struct PipelineStage {
    pub(crate) name: String,
    pub(crate) pass: ShaderPassStage,
    pub(crate) output: StageOutput,
    pub(crate) inputs: Vec<(String, ResolvedInput)>,
    pub(crate) viewport: Option<Viewport>,
    pub(crate) frame_uniforms: bool,
    pub(crate) update: Option<UpdateFn>,
}

impl PipelineStage {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pass(&self) -> &ShaderPassStage {
        &self.pass
    }

    pub fn pass_mut(&mut self) -> &mut ShaderPassStage {
        &mut self.pass
    }

    pub fn output(&self) -> &StageOutput {
        &self.output
    }

    /// The offscreen target this stage draws into, if it has its own.
    pub fn target(&self) -> Option<&Rc<RenderTarget>> {
        match &self.output {
            StageOutput::Offscreen(target) => Some(target),
            _ => None,
        }
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.viewport
    }

    /// Texture of this stage's own target, if it has one.
    pub fn texture(&self) -> Option<TextureRef> {
        self.target().map(|t| t.texture())
    }
}
