//! Compiled passes keyed by name, rebuilt only when their source changes.

use std::collections::{BTreeMap, HashSet};

use crate::errors::CompileError;
use crate::gpu::{FramebufferHandle, GpuBackend, ProgramHandle, UniformLocation};
use crate::protocol::{BlendMode, ShaderDeclaration, ShaderDesc};
use crate::renderer::glsl_dialect::assemble_pass;

#[derive(Debug, Clone, PartialEq)]
pub struct Pass {
    pub name: String,
    /// Assembled text the current program was built from.
    pub source: String,
    pub program: ProgramHandle,
    pub framebuffer: FramebufferHandle,
    /// One entry per declared uniform, in declaration order. `None` when the
    /// backend optimized the uniform away.
    pub uniform_locations: Vec<Option<UniformLocation>>,
    pub sampler_locations: Vec<Option<UniformLocation>>,
    /// Color attachment slot per declared output.
    pub output_slots: Vec<u32>,
    pub blend_mode: BlendMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileOutcome {
    /// Source unchanged, no backend work.
    Unchanged,
    Created,
    Recompiled,
}

#[derive(Debug, Default)]
pub struct PassTable {
    passes: BTreeMap<String, Pass>,
}

impl PassTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Pass> {
        self.passes.get(name)
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Build every descriptor, continuing past failures.
    pub fn compile_all<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        descs: &[ShaderDesc],
        declarations: &[ShaderDeclaration],
    ) -> Vec<CompileError> {
        let mut errors = Vec::new();
        for desc in descs {
            match self.compile_pass(backend, desc, declarations) {
                Ok(outcome) => log::debug!("pass `{}`: {outcome:?}", desc.name),
                Err(e) => {
                    log::error!("{e}");
                    errors.push(e);
                }
            }
        }
        errors
    }

    pub fn compile_pass<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        desc: &ShaderDesc,
        declarations: &[ShaderDeclaration],
    ) -> Result<CompileOutcome, CompileError> {
        let asm = assemble_pass(desc, declarations);
        let output_slots: Vec<u32> = (0..desc.outs.len() as u32).collect();

        if let Some(existing) = self.passes.get_mut(&desc.name) {
            if existing.source == asm.result_text() {
                // Blend mode and outputs aren't part of the text.
                existing.blend_mode = desc.blend_mode;
                existing.output_slots = output_slots;
                return Ok(CompileOutcome::Unchanged);
            }
        }

        let program = backend.compile_program(asm.result_text()).map_err(|e| {
            let line = e.line.and_then(|l| asm.source_line(l)).unwrap_or(0);
            CompileError {
                pass: desc.name.clone(),
                line,
                message: e.message,
            }
        })?;

        let uniform_locations = desc
            .uniforms
            .iter()
            .map(|u| backend.uniform_location(program, &u.name))
            .collect();
        let sampler_locations = desc
            .samplers
            .iter()
            .map(|s| backend.uniform_location(program, &s.name))
            .collect();

        let (framebuffer, old_program) = match self.passes.get(&desc.name) {
            Some(old) => (old.framebuffer, Some(old.program)),
            None => match backend.create_framebuffer() {
                Ok(fb) => (fb, None),
                Err(e) => {
                    backend.delete_program(program);
                    return Err(CompileError {
                        pass: desc.name.clone(),
                        line: 0,
                        message: e.to_string(),
                    });
                }
            },
        };

        self.passes.insert(
            desc.name.clone(),
            Pass {
                name: desc.name.clone(),
                source: asm.into_text(),
                program,
                framebuffer,
                uniform_locations,
                sampler_locations,
                output_slots,
                blend_mode: desc.blend_mode,
            },
        );

        Ok(match old_program {
            Some(old) => {
                backend.delete_program(old);
                CompileOutcome::Recompiled
            }
            None => CompileOutcome::Created,
        })
    }

    /// Release passes whose names are not in `keep`.
    pub fn retain_named<B: GpuBackend + ?Sized>(&mut self, backend: &mut B, keep: &HashSet<&str>) {
        let stale: Vec<String> = self
            .passes
            .keys()
            .filter(|name| !keep.contains(name.as_str()))
            .cloned()
            .collect();
        for name in stale {
            if let Some(pass) = self.passes.remove(&name) {
                log::debug!("releasing pass `{name}`");
                release(backend, pass);
            }
        }
    }

    pub fn release_all<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        for (_, pass) in std::mem::take(&mut self.passes) {
            release(backend, pass);
        }
    }
}

fn release<B: GpuBackend + ?Sized>(backend: &mut B, pass: Pass) {
    backend.delete_program(pass.program);
    backend.destroy_framebuffer(pass.framebuffer);
}
