//! Runs one frame's invocation list against compiled passes and cached images.

use crate::errors::{EvaluationError, GpuError, ResourceError, ScriptError};
use crate::gpu::{GpuBackend, TextureHandle};
use crate::protocol::{Extent, ShaderInvocation, UniformValue};
use crate::renderer::blend::blend_state_for;
use crate::renderer::pass_compiler::{Pass, PassTable};
use crate::renderer::resource_cache::ResourceCache;

#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// No script has loaded successfully yet; nothing was drawn.
    Idle,
    Rendered,
    /// The script failed to evaluate; the previous display image was presented.
    EvaluationFailed(EvaluationError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub outcome: FrameOutcome,
    pub executed: usize,
    pub skipped: usize,
    pub resource_errors: Vec<ResourceError>,
    /// Result of applying a script picked up by `Runtime::tick` before this
    /// frame; `None` when no new script arrived.
    pub load: Option<Result<(), ScriptError>>,
}

impl FrameReport {
    pub fn new(outcome: FrameOutcome) -> Self {
        Self {
            outcome,
            executed: 0,
            skipped: 0,
            resource_errors: Vec::new(),
            load: None,
        }
    }

    pub fn record(&mut self, error: ResourceError) {
        log::error!("{error}");
        self.resource_errors.push(error);
    }
}

/// Execute `invocations` in order. Failures only ever affect the invocation
/// they occur in.
pub fn execute_invocations<B: GpuBackend + ?Sized>(
    backend: &mut B,
    passes: &PassTable,
    cache: &ResourceCache,
    invocations: &[ShaderInvocation],
    report: &mut FrameReport,
) {
    for invocation in invocations {
        match execute_invocation(backend, passes, cache, invocation, report) {
            Ok(()) => report.executed += 1,
            Err(e) => {
                report.skipped += 1;
                report.record(e);
            }
        }
    }
}

fn execute_invocation<B: GpuBackend + ?Sized>(
    backend: &mut B,
    passes: &PassTable,
    cache: &ResourceCache,
    invocation: &ShaderInvocation,
    report: &mut FrameReport,
) -> Result<(), ResourceError> {
    let name = &invocation.shader_name;
    let pass = passes.get(name).ok_or_else(|| ResourceError::UnknownPass {
        pass: name.clone(),
    })?;
    let draw_failed = |e: GpuError| ResourceError::DrawFailed {
        pass: name.clone(),
        reason: e.to_string(),
    };

    if invocation.color_attachments.is_empty() {
        return Err(ResourceError::NoAttachments { pass: name.clone() });
    }
    let declared = pass.output_slots.len();
    let bound = invocation.color_attachments.len();
    if declared != bound {
        // Best effort: draw into the slots both sides agree on.
        report.record(ResourceError::AttachmentCountMismatch {
            pass: name.clone(),
            declared,
            bound,
        });
    }

    let mut targets: Vec<(u32, TextureHandle)> = Vec::new();
    let mut size: Option<Extent> = None;
    for (index, (slot, binding)) in pass
        .output_slots
        .iter()
        .zip(&invocation.color_attachments)
        .enumerate()
    {
        let image = cache
            .get(binding.id)
            .ok_or_else(|| ResourceError::MissingAttachmentImage {
                pass: name.clone(),
                index,
                id: binding.id,
            })?;
        match size {
            None => size = Some(image.size),
            Some(expected) if expected != image.size => {
                return Err(ResourceError::AttachmentSizeMismatch {
                    pass: name.clone(),
                    expected,
                    found: image.size,
                });
            }
            Some(_) => {}
        }
        targets.push((*slot, image.texture));
    }
    let Some(size) = size else {
        return Err(ResourceError::NoAttachments { pass: name.clone() });
    };

    backend.use_program(pass.program).map_err(draw_failed)?;
    set_uniforms(backend, pass, &invocation.uniforms);
    bind_samplers(backend, pass, cache, invocation, report);

    for (slot, texture) in &targets {
        backend
            .attach_color(pass.framebuffer, *slot, Some(*texture))
            .map_err(draw_failed)?;
    }
    for slot in pass.output_slots.iter().skip(targets.len()) {
        backend
            .attach_color(pass.framebuffer, *slot, None)
            .map_err(draw_failed)?;
    }
    let slots: Vec<u32> = targets.iter().map(|(slot, _)| *slot).collect();
    backend
        .set_draw_buffers(pass.framebuffer, &slots)
        .map_err(draw_failed)?;

    backend.bind_framebuffer(Some(pass.framebuffer));
    backend.set_viewport(size);
    backend.set_blend(blend_state_for(pass.blend_mode));
    let drawn = backend.draw_fullscreen();
    backend.bind_framebuffer(None);
    drawn.map_err(draw_failed)
}

fn set_uniforms<B: GpuBackend + ?Sized>(
    backend: &mut B,
    pass: &Pass,
    values: &[Option<UniformValue>],
) {
    for (index, location) in pass.uniform_locations.iter().enumerate() {
        let (Some(location), Some(Some(value))) = (location, values.get(index)) else {
            continue;
        };
        if let Err(e) = backend.set_uniform(*location, value) {
            log::warn!("pass `{}` uniform {index}: {e}", pass.name);
        }
    }
}

fn bind_samplers<B: GpuBackend + ?Sized>(
    backend: &mut B,
    pass: &Pass,
    cache: &ResourceCache,
    invocation: &ShaderInvocation,
    report: &mut FrameReport,
) {
    for (index, location) in pass.sampler_locations.iter().enumerate() {
        let unit = index as u32;
        if let Some(location) = location {
            if let Err(e) = backend.set_uniform(*location, &UniformValue::Int(unit as i32)) {
                log::warn!("pass `{}` sampler {index}: {e}", pass.name);
            }
        }
        let texture = match invocation.image_sampler_bindings.get(index) {
            Some(binding) => {
                let texture = cache.get_image(binding.id);
                if texture.is_none() {
                    report.record(ResourceError::MissingSamplerImage {
                        pass: pass.name.clone(),
                        index,
                        id: binding.id,
                    });
                }
                texture
            }
            None => {
                log::warn!("pass `{}` sampler {index} has no image bound", pass.name);
                None
            }
        };
        backend.bind_texture(unit, texture);
    }
}

/// Draw the display image onto the output surface.
pub fn composite<B: GpuBackend + ?Sized>(
    backend: &mut B,
    present: &Pass,
    display: TextureHandle,
) -> Result<(), GpuError> {
    backend.bind_framebuffer(None);
    backend.use_program(present.program)?;
    if let Some(Some(location)) = present.sampler_locations.first() {
        backend.set_uniform(*location, &UniformValue::Int(0))?;
    }
    backend.bind_texture(0, Some(display));
    let surface = backend.surface_size();
    backend.set_viewport(surface);
    backend.set_blend(blend_state_for(present.blend_mode));
    backend.draw_fullscreen()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::RecordingBackend;
    use crate::protocol::{
        BlendMode, ImageBinding, ImageRequest, NamedType, PixelFormat, ShaderDesc, SourceText,
    };

    fn two_output_desc() -> ShaderDesc {
        ShaderDesc {
            name: "split".to_string(),
            includes: vec![],
            uniforms: vec![],
            samplers: vec![NamedType::new("src", "sampler2D")],
            outs: vec![
                NamedType::new("out_a", "vec4"),
                NamedType::new("out_b", "vec4"),
            ],
            body: SourceText {
                text: "vec4 c = texelFetch(src, ivec2(0), 0);\nout_a = c;\nout_b = c * 0.5;"
                    .to_string(),
                start: 1,
            },
            blend_mode: BlendMode::Additive,
        }
    }

    fn invocation(attachments: &[u32], samplers: &[u32]) -> ShaderInvocation {
        ShaderInvocation {
            shader_name: "split".to_string(),
            uniforms: vec![],
            image_sampler_bindings: samplers.iter().map(|&id| ImageBinding { id }).collect(),
            color_attachments: attachments.iter().map(|&id| ImageBinding { id }).collect(),
        }
    }

    fn setup() -> (RecordingBackend, PassTable, ResourceCache) {
        let mut gpu = RecordingBackend::new();
        let mut passes = PassTable::new();
        assert!(
            passes
                .compile_all(&mut gpu, &[two_output_desc()], &[])
                .is_empty()
        );
        let mut cache = ResourceCache::new();
        cache.start_frame();
        for (id, w) in [(1, 16), (2, 16), (3, 8), (4, 16)] {
            cache
                .process_request(
                    &mut gpu,
                    &ImageRequest::cached(id, PixelFormat::Rgba16f, Extent::new(w, w)),
                )
                .unwrap();
        }
        (gpu, passes, cache)
    }

    #[test]
    fn size_mismatch_skips_only_that_invocation() {
        let (mut gpu, passes, cache) = setup();
        let mut report = FrameReport::new(FrameOutcome::Rendered);
        execute_invocations(
            &mut gpu,
            &passes,
            &cache,
            &[
                invocation(&[1, 2], &[4]),
                invocation(&[1, 3], &[4]),
                invocation(&[2, 1], &[4]),
            ],
            &mut report,
        );
        assert_eq!(report.executed, 2);
        assert_eq!(report.skipped, 1);
        assert!(matches!(
            report.resource_errors.as_slice(),
            [ResourceError::AttachmentSizeMismatch { .. }]
        ));
        assert_eq!(gpu.draws().count(), 2);
        let last = gpu.draws().last().unwrap();
        assert_eq!(last.viewport, Extent::new(16, 16));
        assert_eq!(last.blend, blend_state_for(BlendMode::Additive));
        assert_eq!(last.samplers, vec![cache.get_image(4)]);
    }

    #[test]
    fn attachment_count_mismatch_draws_the_overlap() {
        let (mut gpu, passes, cache) = setup();
        let mut report = FrameReport::new(FrameOutcome::Rendered);
        execute_invocations(&mut gpu, &passes, &cache, &[invocation(&[1], &[4])], &mut report);
        assert_eq!(report.executed, 1);
        assert!(matches!(
            report.resource_errors.as_slice(),
            [ResourceError::AttachmentCountMismatch {
                declared: 2,
                bound: 1,
                ..
            }]
        ));
        let draw = gpu.draws().next().unwrap();
        assert_eq!(draw.attachments, vec![(0, cache.get_image(1).unwrap())]);
    }

    #[test]
    fn missing_sampler_image_binds_nothing_but_still_draws() {
        let (mut gpu, passes, cache) = setup();
        let mut report = FrameReport::new(FrameOutcome::Rendered);
        execute_invocations(&mut gpu, &passes, &cache, &[invocation(&[1, 2], &[99])], &mut report);
        assert_eq!(report.executed, 1);
        assert!(matches!(
            report.resource_errors.as_slice(),
            [ResourceError::MissingSamplerImage { id: 99, .. }]
        ));
        assert_eq!(gpu.draws().next().unwrap().samplers, vec![None]);
    }

    #[test]
    fn unknown_pass_and_missing_attachments_are_skipped() {
        let (mut gpu, passes, cache) = setup();
        let mut report = FrameReport::new(FrameOutcome::Rendered);
        let mut unknown = invocation(&[1, 2], &[]);
        unknown.shader_name = "nope".to_string();
        execute_invocations(
            &mut gpu,
            &passes,
            &cache,
            &[unknown, invocation(&[], &[4]), invocation(&[1, 42], &[4])],
            &mut report,
        );
        assert_eq!(report.executed, 0);
        assert_eq!(report.skipped, 3);
        assert!(matches!(
            report.resource_errors.as_slice(),
            [
                ResourceError::UnknownPass { .. },
                ResourceError::NoAttachments { .. },
                ResourceError::MissingAttachmentImage { index: 1, id: 42, .. }
            ]
        ));
        assert_eq!(gpu.draws().count(), 0);
    }
}
