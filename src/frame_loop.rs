//! Frame pacing and the windowed runner.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowAttributes, WindowId};

use crate::backend::WgpuRenderer;
use crate::error::PipelineError;
use crate::gpu::GpuContext;
use crate::pipeline::{PipelineBuilder, TickOutcome};
use crate::surface::Surface;

/// Shared stop flag of a cooperative frame loop.
///
/// The flag is read before the next frame is requested, so a frame that is
/// already running always completes. Clones share the same flag.
#[derive(Clone, Debug, Default)]
pub struct FrameLoop {
    running: Rc<Cell<bool>>,
}

impl FrameLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn start(&self) {
        self.running.set(true);
    }

    /// Stops scheduling frames after the current one.
    pub fn stop(&self) {
        if self.running.replace(false) {
            log::debug!("frame loop stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }
}

/// Window settings for [`run_pipeline`].
#[derive(Clone, Debug)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "backbuffer".to_string(),
            width: 800,
            height: 600,
        }
    }
}

impl WindowConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

/// Opens a window and runs the pipeline returned by `assemble` until the
/// window is closed.
///
/// `assemble` runs on every mount, so it must be able to build the pipeline
/// more than once.
///
/// # Example
/// ```ignore
/// backbuffer::run_pipeline(WindowConfig::new().title("feedback"), || {
///     PipelineConfig::load("feedback.toml")?.into_builder()
/// })?;
/// ```
pub fn run_pipeline<A>(config: WindowConfig, assemble: A) -> Result<(), PipelineError>
where
    A: FnMut() -> Result<PipelineBuilder, PipelineError> + 'static,
{
    let event_loop = EventLoop::new().map_err(|e| PipelineError::Surface(e.to_string()))?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = PipelineApp::Pending {
        config,
        surface: Some(Surface::new(assemble)),
    };
    event_loop
        .run_app(&mut app)
        .map_err(|e| PipelineError::Surface(e.to_string()))?;

    match app {
        PipelineApp::Failed(e) => Err(e),
        _ => Ok(()),
    }
}

enum PipelineApp {
    Pending {
        config: WindowConfig,
        surface: Option<Surface>,
    },
    Running {
        window: Arc<Window>,
        renderer: WgpuRenderer,
        surface: Surface,
    },
    Failed(PipelineError),
    Closed,
}

impl PipelineApp {
    fn start(
        event_loop: &ActiveEventLoop,
        config: &WindowConfig,
        mut surface: Surface,
    ) -> Result<Self, PipelineError> {
        let attrs = WindowAttributes::default()
            .with_title(&config.title)
            .with_inner_size(winit::dpi::LogicalSize::new(config.width, config.height));
        let window = Arc::new(
            event_loop
                .create_window(attrs)
                .map_err(|e| PipelineError::Surface(e.to_string()))?,
        );
        let gpu = GpuContext::new(window.clone())?;
        let mut renderer = WgpuRenderer::new(gpu)?;

        let size = window.inner_size();
        surface.on_mount(&mut renderer, size.width, size.height)?;
        window.request_redraw();
        Ok(Self::Running {
            window,
            renderer,
            surface,
        })
    }
}

impl ApplicationHandler for PipelineApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        let PipelineApp::Pending { config, surface } = self else {
            return;
        };
        let Some(surface) = surface.take() else {
            return;
        };
        *self = match Self::start(event_loop, config, surface) {
            Ok(running) => running,
            Err(e) => {
                log::error!("failed to start pipeline: {e}");
                event_loop.exit();
                PipelineApp::Failed(e)
            }
        };
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let PipelineApp::Running {
            window,
            renderer,
            surface,
        } = self
        else {
            return;
        };

        match event {
            WindowEvent::CloseRequested => {
                surface.on_unmount(renderer);
                *self = PipelineApp::Closed;
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Err(e) = surface.on_resize(renderer, size.width, size.height) {
                    log::error!("resize to {}x{} failed: {e}", size.width, size.height);
                }
                window.request_redraw();
            }
            WindowEvent::RedrawRequested => {
                match surface.frame(renderer) {
                    Ok(TickOutcome::Rendered { .. }) => {}
                    Ok(TickOutcome::Skipped(reason)) => log::trace!("frame skipped: {reason:?}"),
                    Err(e) => log::error!("frame dropped: {e}"),
                }
                if surface.frame_loop().is_running() {
                    window.request_redraw();
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_is_shared_between_clones() {
        let frames = FrameLoop::new();
        assert!(!frames.is_running());
        frames.start();

        let handle = frames.clone();
        handle.stop();
        assert!(!frames.is_running());
        handle.stop();
        assert!(!handle.is_running());
    }

    #[test]
    fn window_config_builder() {
        let config = WindowConfig::new().title("feedback").size(320, 240);
        assert_eq!(config.title, "feedback");
        assert_eq!((config.width, config.height), (320, 240));
    }
}
