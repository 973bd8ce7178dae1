//! Ordered multi-stage render pipelines.
//!
//! A pipeline is a list of [`ShaderPassStage`](crate::ShaderPassStage)s run
//! in declaration order once per frame. Each stage draws to the canvas, to
//! its own offscreen target, or to the shared back buffer, and may read the
//! output of any *earlier* stage (or last frame's back buffer) through a
//! texture uniform.
//!
//! ```text
//! stage "red"   -> offscreen A
//! stage "green" -> offscreen B     reads A as `prev`
//! stage "blue"  -> canvas          reads B as `prev`
//! ```
//!
//! Pipelines are assembled with [`PipelineBuilder`], which checks the wiring
//! and allocates every target before the first frame.
//!
//! # Example
//!
//! ```ignore
//! let mut pipeline = PipelineBuilder::new()
//!     .stage(StageDescriptor::new("feedback", feedback_fs).to_back_buffer()
//!         .input("previous", InputSource::BackBuffer))
//!     .stage(StageDescriptor::new("show", show_fs)
//!         .input("image", InputSource::stage("feedback")))
//!     .build(&mut renderer)?;
//!
//! pipeline.tick(&mut renderer)?;
//! ```

mod scheduler;
mod stage;

pub use scheduler::{
    Diagnostic, FrameContext, PipelineBuilder, PipelineScheduler, SkipReason, TickOutcome,
};
pub use stage::{InputSource, OutputKind, PipelineStage, StageDescriptor, StageOutput, UpdateFn};
