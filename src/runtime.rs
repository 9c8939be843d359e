//! The per-frame driver tying the compiler, the pass table, the image cache
//! and the context store together.

use std::collections::HashSet;

use image::RgbaImage;

use crate::compiler::ScriptCompiler;
use crate::config::RuntimeConfig;
use crate::context::ContextStore;
use crate::errors::{CompileError, EvaluationError, GpuError, LoadError, ScriptError};
use crate::gpu::GpuBackend;
use crate::inbox::ScriptInbox;
use crate::protocol::{ContextInput, Extent, ImageRequest, Vec2};
use crate::renderer::executor::{FrameOutcome, FrameReport, composite, execute_invocations};
use crate::renderer::pass_compiler::PassTable;
use crate::renderer::present::{PRESENT_PASS, present_pass_desc};
use crate::renderer::resource_cache::{DISPLAY_IMAGE_ID, ResourceCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// No script has fully loaded yet.
    Idle,
    Ready,
}

pub struct Runtime<B: GpuBackend, C: ScriptCompiler> {
    backend: B,
    compiler: C,
    config: RuntimeConfig,
    state: RuntimeState,
    passes: PassTable,
    present: PassTable,
    cache: ResourceCache,
    context: ContextStore,
    pending_inputs: Vec<ContextInput>,
    last_surface_size: Option<Extent>,
    inbox: Option<ScriptInbox>,
    thumbnail: Option<RgbaImage>,
}

impl<B: GpuBackend, C: ScriptCompiler> Runtime<B, C> {
    pub fn new(backend: B, compiler: C, config: RuntimeConfig) -> Result<Self, CompileError> {
        let mut backend = backend;
        let mut present = PassTable::new();
        present.compile_pass(&mut backend, &present_pass_desc(), &[])?;
        Ok(Self {
            backend,
            compiler,
            config,
            state: RuntimeState::Idle,
            passes: PassTable::new(),
            present,
            cache: ResourceCache::new(),
            context: ContextStore::new(),
            pending_inputs: Vec::new(),
            last_surface_size: None,
            inbox: None,
            thumbnail: None,
        })
    }

    /// Pick up edited scripts from `inbox` on every [`Self::tick`].
    pub fn attach_inbox(&mut self, inbox: ScriptInbox) {
        self.inbox = Some(inbox);
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn compiler(&self) -> &C {
        &self.compiler
    }

    pub fn passes(&self) -> &PassTable {
        &self.passes
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    pub fn context(&self) -> &ContextStore {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ContextStore {
        &mut self.context
    }

    /// Compile `script` and rebuild changed passes.
    ///
    /// A compiler error leaves everything as it was. Otherwise passes the new
    /// script no longer declares are released and every descriptor is built;
    /// the runtime becomes ready only when all of them compiled.
    pub fn load_script(&mut self, script: &str) -> Result<(), ScriptError> {
        let result = self.compiler.load(script);
        if let Some(diagnostic) = result.error {
            let err = LoadError::from(diagnostic);
            log::error!("{err}");
            return Err(err.into());
        }

        let keep: HashSet<&str> = result.shader_descs.iter().map(|d| d.name.as_str()).collect();
        self.passes.retain_named(&mut self.backend, &keep);

        let errors =
            self.passes
                .compile_all(&mut self.backend, &result.shader_descs, &result.declarations);
        if !errors.is_empty() {
            return Err(ScriptError::Compile(errors));
        }
        log::info!("loaded script with {} pass(es)", result.shader_descs.len());
        self.state = RuntimeState::Ready;
        Ok(())
    }

    /// Load the newest script from the attached inbox, then run a frame.
    ///
    /// A failed load is reported in [`FrameReport::load`] while the last good
    /// passes keep running. A successful one refreshes [`Self::thumbnail`]
    /// when the config asks for it.
    pub fn tick(&mut self, surface_size: Extent, time: f32) -> FrameReport {
        let script = self.inbox.as_ref().and_then(ScriptInbox::take_latest);
        let load = script.map(|script| self.load_script(&script));
        if matches!(load, Some(Ok(()))) && self.config.thumbnail_on_load {
            match self.capture_default_thumbnail(time) {
                Ok(image) => self.thumbnail = Some(image),
                Err(e) => log::warn!("thumbnail capture failed: {e}"),
            }
        }
        let mut report = self.run_frame(surface_size, time);
        report.load = load;
        report
    }

    /// Surface captured after the latest script picked up by [`Self::tick`].
    pub fn thumbnail(&self) -> Option<&RgbaImage> {
        self.thumbnail.as_ref()
    }

    pub fn run_frame(&mut self, surface_size: Extent, time: f32) -> FrameReport {
        if self.state == RuntimeState::Idle {
            return FrameReport::new(FrameOutcome::Idle);
        }

        let size = surface_size.at_least_one();
        if self.last_surface_size != Some(size) {
            match self.backend.resize_surface(size) {
                Ok(()) => self.last_surface_size = Some(size),
                Err(e) => log::error!("failed to resize surface to {size}: {e}"),
            }
        }

        self.backend.bind_framebuffer(None);
        self.backend.clear(self.config.clear_color);

        let carried = std::mem::take(&mut self.pending_inputs);
        let mut inputs = carried.clone();
        inputs.push(ContextInput::UVec2 {
            name: self.config.swapchain_size_input.clone(),
            value: Vec2 {
                x: size.width,
                y: size.height,
            },
        });
        inputs.push(ContextInput::Float {
            name: self.config.time_input.clone(),
            value: time,
        });

        let frame = self.compiler.frame(&inputs);
        if let Some(diagnostic) = frame.error {
            let err = EvaluationError::from(diagnostic);
            log::warn!("skipping frame: {err}");
            self.pending_inputs = carried;
            self.present_display();
            self.backend.end_frame();
            return FrameReport::new(FrameOutcome::EvaluationFailed(err));
        }

        let mut report = FrameReport::new(FrameOutcome::Rendered);
        self.context.begin_frame();
        self.cache.start_frame();
        let display = ImageRequest::cached(DISPLAY_IMAGE_ID, self.config.display_format, size);
        if let Err(e) = self.cache.process_request(&mut self.backend, &display) {
            report.record(e);
        }
        for request in &frame.context_requests {
            if let Some(image) = request.image_request() {
                if let Err(e) = self.cache.process_request(&mut self.backend, &image) {
                    report.record(e);
                }
            } else if let Some(input) = self.context.resolve(request) {
                self.pending_inputs.push(input);
            }
        }

        execute_invocations(
            &mut self.backend,
            &self.passes,
            &self.cache,
            &frame.shader_invocations,
            &mut report,
        );

        self.present_display();
        self.backend.end_frame();
        report
    }

    /// Render one frame at `size` and read it back, then put the surface
    /// back to the size it had before.
    pub fn capture_thumbnail(&mut self, size: Extent, time: f32) -> Result<RgbaImage, GpuError> {
        let previous = self.last_surface_size;
        self.run_frame(size, time);
        let image = self.backend.read_surface();
        if let Some(previous) = previous {
            if self.last_surface_size != Some(previous) {
                match self.backend.resize_surface(previous) {
                    Ok(()) => self.last_surface_size = Some(previous),
                    Err(e) => log::error!("failed to restore surface size {previous}: {e}"),
                }
            }
        }
        image
    }

    /// [`Self::capture_thumbnail`] at the configured thumbnail size.
    pub fn capture_default_thumbnail(&mut self, time: f32) -> Result<RgbaImage, GpuError> {
        let size = self.config.thumbnail_size;
        self.capture_thumbnail(size, time)
    }

    /// Destroy every pass, the composite program and all cached images.
    pub fn release(&mut self) {
        self.passes.release_all(&mut self.backend);
        self.present.release_all(&mut self.backend);
        self.cache.release_all(&mut self.backend);
        self.state = RuntimeState::Idle;
        self.last_surface_size = None;
    }

    pub fn into_backend(mut self) -> B {
        self.release();
        self.backend
    }

    fn present_display(&mut self) {
        let Some(display) = self.cache.get_image(DISPLAY_IMAGE_ID) else {
            log::warn!("no display image to present");
            return;
        };
        let Some(present) = self.present.get(PRESENT_PASS) else {
            return;
        };
        if let Err(e) = composite(&mut self.backend, present, display) {
            log::error!("composite failed: {e}");
        }
    }
}
