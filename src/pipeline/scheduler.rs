use std::collections::HashSet;
use std::time::Instant;

use glam::Vec2;

use crate::back_buffer::BackBufferSwapper;
use crate::error::PipelineError;
use crate::pipeline::stage::{
    InputSource, OutputKind, PipelineStage, ResolvedInput, StageDescriptor, StageOutput,
};
use crate::renderer::{Renderer, ToneMapping};
use crate::shader_pass::ShaderPassStage;
use crate::target::{FilterMode, RenderTargetRegistry};
use crate::uniforms::{TextureRef, UniformKind, UniformValue};

/// What every stage sees for the frame being drawn.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameContext {
    /// Zero for the first tick.
    pub frame: u64,
    /// Seconds since the pipeline was built.
    pub time: f32,
    /// Seconds since the previous tick.
    pub delta: f32,
    pub width: u32,
    pub height: u32,
}

impl FrameContext {
    pub fn resolution(&self) -> Vec2 {
        Vec2::new(self.width as f32, self.height as f32)
    }

    pub fn ratio(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The canvas has no pixels, e.g. a minimised window.
    ZeroSizedCanvas,
    Disposed,
    /// No pipeline is mounted, or its frame loop was stopped.
    Unmounted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Rendered { frame: u64 },
    Skipped(SkipReason),
}

/// A non-fatal problem found while assembling a pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub stage: String,
    pub message: String,
}

/// Collects stage declarations and builds a [`PipelineScheduler`].
///
/// Offscreen targets and the back buffer are allocated at `resolution`, or
/// at the canvas size when no resolution is given.
pub struct PipelineBuilder {
    resolution: Option<(u32, u32)>,
    filter: FilterMode,
    tone_mapping: Option<ToneMapping>,
    stages: Vec<StageDescriptor>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            resolution: None,
            filter: FilterMode::Linear,
            tone_mapping: None,
            stages: Vec::new(),
        }
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some((width, height));
        self
    }

    /// Filtering of every target the pipeline allocates.
    pub fn filter(mut self, filter: FilterMode) -> Self {
        self.filter = filter;
        self
    }

    /// Tone mapping for stages that do not set their own. Back-buffer
    /// stages always default to none.
    pub fn tone_mapping(mut self, tone_mapping: ToneMapping) -> Self {
        self.tone_mapping = Some(tone_mapping);
        self
    }

    pub fn stage(mut self, stage: StageDescriptor) -> Self {
        self.stages.push(stage);
        self
    }

    /// Whether targets get a fixed size rather than following the canvas.
    pub(crate) fn has_resolution(&self) -> bool {
        self.resolution.is_some()
    }

    /// Checks the stage wiring without allocating anything.
    pub(crate) fn validate(&self) -> Result<Vec<Vec<ResolvedInput>>, PipelineError> {
        if self.stages.is_empty() {
            return Err(PipelineError::EmptyPipeline);
        }

        let mut names = HashSet::new();
        for stage in &self.stages {
            if !names.insert(stage.name.as_str()) {
                return Err(PipelineError::DuplicateStage(stage.name.clone()));
            }
        }

        let mut writers = self
            .stages
            .iter()
            .filter(|s| s.output == OutputKind::BackBuffer);
        let has_writer = writers.next().is_some();
        if let Some(second) = writers.next() {
            return Err(PipelineError::BackBufferConflict(second.name.clone()));
        }

        let mut resolved = Vec::with_capacity(self.stages.len());
        for (index, stage) in self.stages.iter().enumerate() {
            let mut inputs = Vec::with_capacity(stage.inputs.len());
            for (uniform, from) in &stage.inputs {
                let invalid = |reason| PipelineError::InvalidInput {
                    stage: stage.name.clone(),
                    from: from.label().to_string(),
                    reason,
                };
                if stage
                    .uniforms
                    .get(uniform)
                    .is_some_and(|v| v.kind() != UniformKind::Texture)
                {
                    return Err(invalid("the uniform is not a texture"));
                }
                let input = match from {
                    InputSource::BackBuffer if !has_writer => {
                        return Err(invalid("no stage writes the back buffer"));
                    }
                    InputSource::BackBuffer => ResolvedInput::BackBuffer,
                    InputSource::Stage(name) => {
                        let Some(source) = self.stages.iter().position(|s| s.name == *name)
                        else {
                            return Err(PipelineError::UnknownStage {
                                stage: stage.name.clone(),
                                from: name.clone(),
                            });
                        };
                        if source == index {
                            return Err(invalid("a stage cannot read its own output"));
                        }
                        if source > index {
                            return Err(PipelineError::ForwardDependency {
                                stage: stage.name.clone(),
                                from: name.clone(),
                            });
                        }
                        if self.stages[source].output == OutputKind::Canvas {
                            return Err(invalid("the canvas cannot be sampled"));
                        }
                        ResolvedInput::Stage(source)
                    }
                };
                inputs.push(input);
            }
            resolved.push(inputs);
        }
        Ok(resolved)
    }

    /// Validates the wiring, allocates every target and compiles every
    /// stage. On failure nothing stays allocated.
    pub fn build<R: Renderer + ?Sized>(
        self,
        renderer: &mut R,
    ) -> Result<PipelineScheduler, PipelineError> {
        let resolved = self.validate()?;
        let (width, height) = self.resolution.unwrap_or_else(|| renderer.canvas_size());

        let mut pipeline = PipelineScheduler {
            stages: Vec::with_capacity(self.stages.len()),
            registry: RenderTargetRegistry::new(),
            back_buffer: None,
            diagnostics: Vec::new(),
            follows_canvas: self.resolution.is_none(),
            started: Instant::now(),
            last_time: 0.0,
            frame_index: 0,
            disposed: false,
        };

        let tone_mapping = self.tone_mapping;
        let filter = self.filter;
        // Readers may run before the writer, so the pair must exist first.
        if self.stages.iter().any(|s| s.output == OutputKind::BackBuffer) {
            pipeline.back_buffer = Some(BackBufferSwapper::new(renderer, width, height, filter)?);
        }
        for (desc, inputs) in self.stages.into_iter().zip(resolved) {
            if let Err(e) =
                pipeline.add_stage(renderer, desc, inputs, width, height, filter, tone_mapping)
            {
                pipeline.dispose(renderer);
                return Err(e);
            }
        }

        if let Some(last) = pipeline.stages.last()
            && last.output.kind() != OutputKind::Canvas
        {
            let diagnostic = Diagnostic {
                stage: last.name.clone(),
                message: format!(
                    "final stage '{}' draws offscreen; nothing reaches the canvas",
                    last.name
                ),
            };
            log::warn!("{}", diagnostic.message);
            pipeline.diagnostics.push(diagnostic);
        }

        log::debug!(
            "pipeline built: {} stage(s) at {width}x{height}",
            pipeline.stages.len()
        );
        Ok(pipeline)
    }
}

/// Runs a fixed list of stages once per frame.
pub struct PipelineScheduler {
    stages: Vec<PipelineStage>,
    registry: RenderTargetRegistry,
    back_buffer: Option<BackBufferSwapper>,
    diagnostics: Vec<Diagnostic>,
    follows_canvas: bool,
    started: Instant,
    last_time: f32,
    frame_index: u64,
    disposed: bool,
}

impl PipelineScheduler {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    #[allow(clippy::too_many_arguments)]
    fn add_stage<R: Renderer + ?Sized>(
        &mut self,
        renderer: &mut R,
        desc: StageDescriptor,
        inputs: Vec<ResolvedInput>,
        width: u32,
        height: u32,
        filter: FilterMode,
        default_tone_mapping: Option<ToneMapping>,
    ) -> Result<(), PipelineError> {
        let output = match desc.output {
            OutputKind::Canvas => StageOutput::Canvas,
            OutputKind::Offscreen => StageOutput::Offscreen(self.registry.create_multi(
                renderer,
                width,
                height,
                filter,
                desc.attachments,
            )?),
            OutputKind::BackBuffer => StageOutput::BackBuffer,
        };

        // Input and frame uniforms are part of the program's layout, so they
        // need a value before compiling.
        let mut uniforms = desc.uniforms;
        for ((uniform, _), input) in desc.inputs.iter().zip(&inputs) {
            let texture = self.input_texture(*input).ok_or_else(|| PipelineError::InvalidInput {
                stage: desc.name.clone(),
                from: "back_buffer".to_string(),
                reason: "no stage writes the back buffer",
            })?;
            uniforms.set(uniform.clone(), texture);
        }
        if desc.frame_uniforms {
            uniforms.set("time", 0.0f32);
            uniforms.set("resolution", Vec2::new(width as f32, height as f32));
            uniforms.set("ratio", width as f32 / height.max(1) as f32);
        }

        let mut pass = ShaderPassStage::new(renderer, desc.fragment, uniforms)?;
        let tone_mapping = match (desc.tone_mapping, desc.output) {
            (Some(explicit), _) => Some(explicit),
            (None, OutputKind::BackBuffer) => Some(ToneMapping::None),
            (None, _) => default_tone_mapping,
        };
        pass.set_tone_mapping(tone_mapping);

        log::debug!(
            "stage '{}' -> {:?} with {} input(s)",
            desc.name,
            output.kind(),
            inputs.len()
        );
        self.stages.push(PipelineStage {
            name: desc.name,
            pass,
            output,
            inputs: desc
                .inputs
                .into_iter()
                .map(|(uniform, _)| uniform)
                .zip(inputs)
                .collect(),
            viewport: desc.viewport,
            frame_uniforms: desc.frame_uniforms,
            update: desc.update,
        });
        Ok(())
    }

    /// Texture an input reads right now. Stage sources must already exist.
    fn input_texture(&self, input: ResolvedInput) -> Option<TextureRef> {
        Self::resolve_input(&self.stages, self.back_buffer.as_ref(), input)
    }

    fn resolve_input(
        stages: &[PipelineStage],
        back_buffer: Option<&BackBufferSwapper>,
        input: ResolvedInput,
    ) -> Option<TextureRef> {
        match input {
            ResolvedInput::BackBuffer => back_buffer.map(|b| b.readable().texture()),
            ResolvedInput::Stage(index) => match &stages.get(index)?.output {
                StageOutput::Offscreen(target) => Some(target.texture()),
                // swapped right after drawing, so the fresh frame is readable
                StageOutput::BackBuffer => back_buffer.map(|b| b.readable().texture()),
                StageOutput::Canvas => None,
            },
        }
    }

    /// Runs every stage with the wall-clock time since the pipeline was
    /// built.
    pub fn tick<R: Renderer + ?Sized>(
        &mut self,
        renderer: &mut R,
    ) -> Result<TickOutcome, PipelineError> {
        let time = self.started.elapsed().as_secs_f32();
        self.tick_at(renderer, time)
    }

    /// Runs every stage in order with `time` as the frame time, then
    /// presents.
    pub fn tick_at<R: Renderer + ?Sized>(
        &mut self,
        renderer: &mut R,
        time: f32,
    ) -> Result<TickOutcome, PipelineError> {
        if self.disposed {
            return Ok(TickOutcome::Skipped(SkipReason::Disposed));
        }
        let (width, height) = renderer.canvas_size();
        if width == 0 || height == 0 {
            log::trace!("canvas is {width}x{height}; frame skipped");
            return Ok(TickOutcome::Skipped(SkipReason::ZeroSizedCanvas));
        }

        let ctx = FrameContext {
            frame: self.frame_index,
            time,
            delta: time - self.last_time,
            width,
            height,
        };

        for index in 0..self.stages.len() {
            let (earlier, rest) = self.stages.split_at_mut(index);
            let stage = &mut rest[0];

            for (uniform, input) in &stage.inputs {
                let texture = Self::resolve_input(earlier, self.back_buffer.as_ref(), *input)
                    .ok_or_else(|| PipelineError::InvalidInput {
                        stage: stage.name.clone(),
                        from: uniform.clone(),
                        reason: "the source has no texture",
                    })?;
                stage.pass.set_texture(uniform, texture)?;
            }
            if stage.frame_uniforms {
                stage.pass.set_uniform("time", UniformValue::Float(ctx.time))?;
                stage
                    .pass
                    .set_uniform("resolution", UniformValue::Vec2(ctx.resolution()))?;
                stage.pass.set_uniform("ratio", UniformValue::Float(ctx.ratio()))?;
            }
            if let Some(update) = stage.update.as_mut() {
                update(&ctx, &mut stage.pass)?;
            }

            match &stage.output {
                StageOutput::Canvas => stage.pass.render(renderer, None, stage.viewport)?,
                StageOutput::Offscreen(target) => {
                    stage.pass.render(renderer, Some(&**target), stage.viewport)?
                }
                StageOutput::BackBuffer => {
                    let Some(back) = self.back_buffer.as_mut() else {
                        return Err(PipelineError::BackBufferConflict(stage.name.clone()));
                    };
                    stage
                        .pass
                        .render(renderer, Some(&**back.writable()), stage.viewport)?;
                    back.swap();
                }
            }
        }

        renderer.present();
        let frame = self.frame_index;
        self.frame_index += 1;
        self.last_time = time;
        Ok(TickOutcome::Rendered { frame })
    }

    /// Follows a canvas resize. Pipelines built with an explicit resolution
    /// keep their targets; others re-create them at the new size.
    pub fn resize<R: Renderer + ?Sized>(
        &mut self,
        renderer: &mut R,
        width: u32,
        height: u32,
    ) -> Result<(), PipelineError> {
        if !self.follows_canvas || self.disposed || width == 0 || height == 0 {
            return Ok(());
        }
        if let Some(back) = self.back_buffer.as_mut() {
            back.resize(renderer, width, height)?;
        }
        for stage in &mut self.stages {
            let StageOutput::Offscreen(old) = &stage.output else {
                continue;
            };
            if (old.width(), old.height()) == (width, height) {
                continue;
            }
            let resized = self.registry.create_multi(
                renderer,
                width,
                height,
                old.filter(),
                old.attachments(),
            )?;
            let old = std::mem::replace(&mut stage.output, StageOutput::Offscreen(resized));
            if let StageOutput::Offscreen(old) = old {
                self.registry.dispose(renderer, &old);
            }
        }
        log::debug!("pipeline resized to {width}x{height}");
        Ok(())
    }

    /// Releases every stage, target and the back buffer. Safe to call more
    /// than once.
    pub fn dispose<R: Renderer + ?Sized>(&mut self, renderer: &mut R) {
        if self.disposed {
            return;
        }
        for stage in &mut self.stages {
            stage.pass.dispose(renderer);
        }
        self.registry.dispose_all(renderer);
        if let Some(back) = &self.back_buffer {
            back.dispose(renderer);
        }
        self.disposed = true;
        log::debug!("pipeline disposed after {} frame(s)", self.frame_index);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Number of frames rendered so far.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&PipelineStage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stage_mut(&mut self, name: &str) -> Option<&mut PipelineStage> {
        self.stages.iter_mut().find(|s| s.name == name)
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn back_buffer(&self) -> Option<&BackBufferSwapper> {
        self.back_buffer.as_ref()
    }
}
