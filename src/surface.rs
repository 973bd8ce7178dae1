//! A mountable drawing surface.
//!
//! [`Surface`] ties a pipeline's lifetime to a canvas: mounting builds the
//! pipeline at the canvas size and starts the frame loop, resizing follows
//! the canvas, and unmounting stops the loop and releases every GPU
//! resource the pipeline holds.
//!
//! A canvas without pixels (a window that starts minimised) cannot hold
//! canvas-sized targets. Mounting then validates the assembled pipeline but
//! defers the build to the first resize that gives the canvas a size.

use crate::error::PipelineError;
use crate::frame_loop::FrameLoop;
use crate::pipeline::{PipelineBuilder, PipelineScheduler, SkipReason, TickOutcome};
use crate::renderer::Renderer;

type AssembleFn = Box<dyn FnMut() -> Result<PipelineBuilder, PipelineError>>;

pub struct Surface {
    assemble: AssembleFn,
    pipeline: Option<PipelineScheduler>,
    /// Assembled and validated, waiting for a non-empty canvas.
    pending: Option<PipelineBuilder>,
    frame_loop: FrameLoop,
}

impl Surface {
    /// `assemble` declares the pipeline. It runs on every mount.
    pub fn new(
        assemble: impl FnMut() -> Result<PipelineBuilder, PipelineError> + 'static,
    ) -> Self {
        Self {
            assemble: Box::new(assemble),
            pipeline: None,
            pending: None,
            frame_loop: FrameLoop::new(),
        }
    }

    /// Sizes the canvas, builds the pipeline and starts the frame loop.
    /// Mounting an already mounted surface remounts it.
    pub fn on_mount<R: Renderer + ?Sized>(
        &mut self,
        renderer: &mut R,
        width: u32,
        height: u32,
    ) -> Result<(), PipelineError> {
        if self.is_mounted() {
            log::debug!("surface remounted");
            self.on_unmount(renderer);
        }
        renderer.set_canvas_size(width, height);
        let builder = (self.assemble)()?;
        if (width == 0 || height == 0) && !builder.has_resolution() {
            builder.validate()?;
            log::debug!("canvas is {width}x{height}; pipeline build deferred");
            self.pending = Some(builder);
        } else {
            self.install(renderer, builder)?;
        }
        self.frame_loop.start();
        Ok(())
    }

    fn install<R: Renderer + ?Sized>(
        &mut self,
        renderer: &mut R,
        builder: PipelineBuilder,
    ) -> Result<(), PipelineError> {
        let pipeline = builder.build(renderer)?;
        let (width, height) = renderer.canvas_size();
        log::debug!(
            "surface mounted at {width}x{height} on {} with {} stage(s)",
            renderer.name(),
            pipeline.stages().len()
        );
        self.pipeline = Some(pipeline);
        Ok(())
    }

    pub fn on_resize<R: Renderer + ?Sized>(
        &mut self,
        renderer: &mut R,
        width: u32,
        height: u32,
    ) -> Result<(), PipelineError> {
        renderer.set_canvas_size(width, height);
        if let Some(pipeline) = self.pipeline.as_mut() {
            return pipeline.resize(renderer, width, height);
        }
        if width > 0
            && height > 0
            && let Some(builder) = self.pending.take()
        {
            self.install(renderer, builder)?;
        }
        Ok(())
    }

    /// Stops the frame loop and disposes the pipeline.
    pub fn on_unmount<R: Renderer + ?Sized>(&mut self, renderer: &mut R) {
        self.frame_loop.stop();
        self.pending = None;
        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.dispose(renderer);
            log::debug!("surface unmounted");
        }
    }

    /// Draws one frame, unless unmounted, stopped or still waiting for a
    /// canvas size.
    pub fn frame<R: Renderer + ?Sized>(
        &mut self,
        renderer: &mut R,
    ) -> Result<TickOutcome, PipelineError> {
        if !self.frame_loop.is_running() {
            return Ok(TickOutcome::Skipped(SkipReason::Unmounted));
        }
        match self.pipeline.as_mut() {
            Some(pipeline) => pipeline.tick(renderer),
            None if self.pending.is_some() => {
                Ok(TickOutcome::Skipped(SkipReason::ZeroSizedCanvas))
            }
            None => Ok(TickOutcome::Skipped(SkipReason::Unmounted)),
        }
    }

    /// Handle to the stop flag of this surface's loop.
    pub fn frame_loop(&self) -> FrameLoop {
        self.frame_loop.clone()
    }

    /// Mounted, whether or not the pipeline is built yet.
    pub fn is_mounted(&self) -> bool {
        self.pipeline.is_some() || self.pending.is_some()
    }

    pub fn pipeline(&self) -> Option<&PipelineScheduler> {
        self.pipeline.as_ref()
    }

    pub fn pipeline_mut(&mut self) -> Option<&mut PipelineScheduler> {
        self.pipeline.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SoftwareRenderer;
    use crate::pipeline::StageDescriptor;
    use crate::shader::FragmentSource;
    use glam::Vec4;

    fn surface() -> Surface {
        Surface::new(|| {
            Ok(PipelineBuilder::new()
                .stage(StageDescriptor::new("fill", FragmentSource::native(|_| Vec4::ONE)).offscreen())
                .stage(StageDescriptor::new("out", FragmentSource::passthrough("tex")).input(
                    "tex",
                    crate::pipeline::InputSource::stage("fill"),
                )))
        })
    }

    #[test]
    fn frames_skip_until_mounted() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let mut surface = surface();
        assert_eq!(
            surface.frame(&mut renderer).unwrap(),
            TickOutcome::Skipped(SkipReason::Unmounted)
        );

        surface.on_mount(&mut renderer, 8, 6).unwrap();
        assert_eq!(renderer.canvas_size(), (8, 6));
        assert_eq!(
            surface.frame(&mut renderer).unwrap(),
            TickOutcome::Rendered { frame: 0 }
        );
        assert_eq!(renderer.read_pixel(None, 7, 5), Some(Vec4::ONE));
    }

    #[test]
    fn stopping_the_loop_skips_frames() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let mut surface = surface();
        surface.on_mount(&mut renderer, 4, 4).unwrap();

        surface.frame_loop().stop();
        assert_eq!(
            surface.frame(&mut renderer).unwrap(),
            TickOutcome::Skipped(SkipReason::Unmounted)
        );
        assert_eq!(renderer.presented_frames(), 0);
    }

    #[test]
    fn unmount_releases_everything() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let mut surface = surface();
        surface.on_mount(&mut renderer, 4, 4).unwrap();
        surface.frame(&mut renderer).unwrap();

        surface.on_unmount(&mut renderer);
        surface.on_unmount(&mut renderer);
        assert!(!surface.is_mounted());
        assert!(!surface.frame_loop().is_running());
        assert_eq!(renderer.live_targets(), 0);
        assert_eq!(renderer.live_programs(), 0);
        assert_eq!(renderer.live_geometries(), 0);
    }

    #[test]
    fn remount_rebuilds_the_pipeline() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let mut surface = surface();
        surface.on_mount(&mut renderer, 4, 4).unwrap();
        surface.on_mount(&mut renderer, 2, 2).unwrap();

        assert_eq!(renderer.live_targets(), 1);
        let target = surface.pipeline().unwrap().stage("fill").unwrap().target().unwrap();
        assert_eq!((target.width(), target.height()), (2, 2));
    }

    #[test]
    fn mounting_without_pixels_defers_the_build() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let mut surface = surface();
        surface.on_mount(&mut renderer, 0, 0).unwrap();

        assert!(surface.is_mounted());
        assert!(surface.pipeline().is_none());
        assert_eq!(renderer.live_targets(), 0);
        assert_eq!(
            surface.frame(&mut renderer).unwrap(),
            TickOutcome::Skipped(SkipReason::ZeroSizedCanvas)
        );

        surface.on_resize(&mut renderer, 0, 5).unwrap();
        assert!(surface.pipeline().is_none());

        surface.on_resize(&mut renderer, 6, 5).unwrap();
        assert_eq!(
            surface.frame(&mut renderer).unwrap(),
            TickOutcome::Rendered { frame: 0 }
        );
        let target = surface.pipeline().unwrap().stage("fill").unwrap().target().unwrap();
        assert_eq!((target.width(), target.height()), (6, 5));
        assert_eq!(renderer.read_pixel(None, 5, 4), Some(Vec4::ONE));
    }

    #[test]
    fn deferred_mount_still_rejects_bad_wiring() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let mut surface = Surface::new(|| {
            Ok(PipelineBuilder::new().stage(
                StageDescriptor::new("out", FragmentSource::passthrough("tex"))
                    .input("tex", crate::pipeline::InputSource::stage("missing")),
            ))
        });
        let err = surface.on_mount(&mut renderer, 0, 0).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownStage { .. }));
        assert!(!surface.is_mounted());
    }

    #[test]
    fn unmount_drops_a_deferred_build() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let mut surface = surface();
        surface.on_mount(&mut renderer, 0, 0).unwrap();
        surface.on_unmount(&mut renderer);
        surface.on_resize(&mut renderer, 4, 4).unwrap();

        assert!(!surface.is_mounted());
        assert_eq!(renderer.live_targets(), 0);
        assert_eq!(
            surface.frame(&mut renderer).unwrap(),
            TickOutcome::Skipped(SkipReason::Unmounted)
        );
    }

    #[test]
    fn resize_follows_the_canvas() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let mut surface = surface();
        surface.on_mount(&mut renderer, 4, 4).unwrap();
        surface.on_resize(&mut renderer, 10, 3).unwrap();

        assert_eq!(renderer.canvas_size(), (10, 3));
        let target = surface.pipeline().unwrap().stage("fill").unwrap().target().unwrap();
        assert_eq!((target.width(), target.height()), (10, 3));
    }
}
