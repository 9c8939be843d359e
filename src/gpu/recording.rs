//! In-memory backend that records what the executor asks for.
//!
//! Programs go through the same naga front end as the wgpu backend, so
//! compile failures and uniform locations are real. Nothing is rasterized:
//! draws are captured as [`DrawCall`]s with the full binding state.

use std::collections::{BTreeMap, HashMap};

use image::{Rgba, RgbaImage};

use crate::errors::{GpuError, ShaderCompileError};
use crate::gpu::{FramebufferHandle, GpuBackend, ProgramHandle, TextureHandle, UniformLocation};
use crate::protocol::{Extent, PixelFormat, UniformValue};
use crate::renderer::validation::{ProgramLayout, SlotRef, compile_fragment_glsl};

#[derive(Debug, Clone, PartialEq)]
pub struct DrawCall {
    pub program: ProgramHandle,
    /// `None` for the output surface.
    pub framebuffer: Option<FramebufferHandle>,
    /// `(slot, texture)` for every drawn-to color slot.
    pub attachments: Vec<(u32, TextureHandle)>,
    pub viewport: Extent,
    pub blend: wgpu::BlendState,
    /// Texture read by each sampler of the program, in declaration order.
    pub samplers: Vec<Option<TextureHandle>>,
    pub uniforms: BTreeMap<u32, UniformValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CreateTexture {
        texture: TextureHandle,
        format: PixelFormat,
        size: Extent,
    },
    DestroyTexture(TextureHandle),
    CreateFramebuffer(FramebufferHandle),
    DestroyFramebuffer(FramebufferHandle),
    CompileProgram(ProgramHandle),
    DeleteProgram(ProgramHandle),
    Clear {
        framebuffer: Option<FramebufferHandle>,
        color: [f32; 4],
    },
    Draw(DrawCall),
    ResizeSurface(Extent),
    EndFrame,
}

#[derive(Debug, Default)]
struct FramebufferState {
    attachments: BTreeMap<u32, TextureHandle>,
    draw_buffers: Vec<u32>,
}

#[derive(Debug)]
struct ProgramState {
    layout: ProgramLayout,
    uniforms: BTreeMap<u32, UniformValue>,
}

#[derive(Debug)]
pub struct RecordingBackend {
    /// Textures wider or taller than this fail to allocate.
    pub max_texture_dimension: u32,
    next_id: u32,
    textures: HashMap<TextureHandle, (PixelFormat, Extent)>,
    framebuffers: HashMap<FramebufferHandle, FramebufferState>,
    programs: HashMap<ProgramHandle, ProgramState>,
    compile_count: usize,
    current_program: Option<ProgramHandle>,
    bound_framebuffer: Option<FramebufferHandle>,
    texture_units: BTreeMap<u32, TextureHandle>,
    viewport: Extent,
    blend: wgpu::BlendState,
    surface_size: Extent,
    surface_color: [f32; 4],
    commands: Vec<Command>,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            max_texture_dimension: 16384,
            next_id: 1,
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            compile_count: 0,
            current_program: None,
            bound_framebuffer: None,
            texture_units: BTreeMap::new(),
            viewport: Extent::new(1, 1),
            blend: wgpu::BlendState::REPLACE,
            surface_size: Extent::new(1, 1),
            surface_color: [0.0, 0.0, 0.0, 0.0],
            commands: Vec::new(),
        }
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    pub fn draws(&self) -> impl Iterator<Item = &DrawCall> {
        self.commands.iter().filter_map(|c| match c {
            Command::Draw(d) => Some(d),
            _ => None,
        })
    }

    /// Number of successful `compile_program` calls so far.
    pub fn compile_count(&self) -> usize {
        self.compile_count
    }

    pub fn live_texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn is_live_program(&self, program: ProgramHandle) -> bool {
        self.programs.contains_key(&program)
    }

    pub fn is_live_framebuffer(&self, framebuffer: FramebufferHandle) -> bool {
        self.framebuffers.contains_key(&framebuffer)
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl GpuBackend for RecordingBackend {
    fn create_texture(
        &mut self,
        format: PixelFormat,
        size: Extent,
    ) -> Result<TextureHandle, GpuError> {
        if size.is_empty()
            || size.width > self.max_texture_dimension
            || size.height > self.max_texture_dimension
        {
            return Err(GpuError::Allocation(format!(
                "{size} exceeds the {} limit or is empty",
                self.max_texture_dimension
            )));
        }
        let texture = TextureHandle(self.next_id());
        self.textures.insert(texture, (format, size));
        self.commands.push(Command::CreateTexture {
            texture,
            format,
            size,
        });
        Ok(texture)
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if self.textures.remove(&texture).is_some() {
            self.commands.push(Command::DestroyTexture(texture));
        }
    }

    fn create_framebuffer(&mut self) -> Result<FramebufferHandle, GpuError> {
        let fb = FramebufferHandle(self.next_id());
        self.framebuffers.insert(fb, FramebufferState::default());
        self.commands.push(Command::CreateFramebuffer(fb));
        Ok(fb)
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if self.framebuffers.remove(&framebuffer).is_some() {
            self.commands.push(Command::DestroyFramebuffer(framebuffer));
        }
        if self.bound_framebuffer == Some(framebuffer) {
            self.bound_framebuffer = None;
        }
    }

    fn attach_color(
        &mut self,
        framebuffer: FramebufferHandle,
        slot: u32,
        texture: Option<TextureHandle>,
    ) -> Result<(), GpuError> {
        if let Some(t) = texture {
            if !self.textures.contains_key(&t) {
                return Err(GpuError::InvalidHandle {
                    kind: "texture",
                    id: t.0,
                });
            }
        }
        let fb = self
            .framebuffers
            .get_mut(&framebuffer)
            .ok_or(GpuError::InvalidHandle {
                kind: "framebuffer",
                id: framebuffer.0,
            })?;
        match texture {
            Some(t) => {
                fb.attachments.insert(slot, t);
            }
            None => {
                fb.attachments.remove(&slot);
            }
        }
        Ok(())
    }

    fn set_draw_buffers(
        &mut self,
        framebuffer: FramebufferHandle,
        slots: &[u32],
    ) -> Result<(), GpuError> {
        let fb = self
            .framebuffers
            .get_mut(&framebuffer)
            .ok_or(GpuError::InvalidHandle {
                kind: "framebuffer",
                id: framebuffer.0,
            })?;
        fb.draw_buffers = slots.to_vec();
        Ok(())
    }

    fn compile_program(&mut self, source: &str) -> Result<ProgramHandle, ShaderCompileError> {
        let compiled = compile_fragment_glsl(source)?;
        let program = ProgramHandle(self.next_id());
        self.programs.insert(
            program,
            ProgramState {
                layout: compiled.layout,
                uniforms: BTreeMap::new(),
            },
        );
        self.compile_count += 1;
        self.commands.push(Command::CompileProgram(program));
        Ok(program)
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        if self.programs.remove(&program).is_some() {
            self.commands.push(Command::DeleteProgram(program));
        }
        if self.current_program == Some(program) {
            self.current_program = None;
        }
    }

    fn uniform_location(&self, program: ProgramHandle, name: &str) -> Option<UniformLocation> {
        self.programs.get(&program)?.layout.location_of(name)
    }

    fn use_program(&mut self, program: ProgramHandle) -> Result<(), GpuError> {
        if !self.programs.contains_key(&program) {
            return Err(GpuError::InvalidHandle {
                kind: "program",
                id: program.0,
            });
        }
        self.current_program = Some(program);
        Ok(())
    }

    fn set_uniform(
        &mut self,
        location: UniformLocation,
        value: &UniformValue,
    ) -> Result<(), GpuError> {
        let program = self
            .current_program
            .ok_or_else(|| GpuError::Draw("no program in use".to_string()))?;
        let state = self
            .programs
            .get_mut(&program)
            .ok_or(GpuError::InvalidHandle {
                kind: "program",
                id: program.0,
            })?;
        match state.layout.slot(location) {
            Some(SlotRef::Sampler(..)) if !matches!(value, UniformValue::Int(_)) => {
                return Err(GpuError::Draw(format!(
                    "sampler at location {} takes a texture unit",
                    location.0
                )));
            }
            Some(_) => {}
            None => {
                return Err(GpuError::InvalidHandle {
                    kind: "uniform location",
                    id: location.0,
                });
            }
        }
        state.uniforms.insert(location.0, *value);
        Ok(())
    }

    fn bind_texture(&mut self, unit: u32, texture: Option<TextureHandle>) {
        match texture {
            Some(t) => {
                self.texture_units.insert(unit, t);
            }
            None => {
                self.texture_units.remove(&unit);
            }
        }
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferHandle>) {
        self.bound_framebuffer = framebuffer;
    }

    fn set_viewport(&mut self, size: Extent) {
        self.viewport = size;
    }

    fn set_blend(&mut self, blend: wgpu::BlendState) {
        self.blend = blend;
    }

    fn draw_fullscreen(&mut self) -> Result<(), GpuError> {
        let program = self
            .current_program
            .ok_or_else(|| GpuError::Draw("no program in use".to_string()))?;
        let state = self.programs.get(&program).ok_or(GpuError::InvalidHandle {
            kind: "program",
            id: program.0,
        })?;

        let attachments = match self.bound_framebuffer {
            Some(fb) => {
                let fb_state = self.framebuffers.get(&fb).ok_or(GpuError::InvalidHandle {
                    kind: "framebuffer",
                    id: fb.0,
                })?;
                let attachments: Vec<(u32, TextureHandle)> = fb_state
                    .draw_buffers
                    .iter()
                    .filter_map(|slot| fb_state.attachments.get(slot).map(|t| (*slot, *t)))
                    .collect();
                if attachments.is_empty() {
                    return Err(GpuError::Draw("framebuffer has no color attachments".to_string()));
                }
                attachments
            }
            None => Vec::new(),
        };

        let uniform_count = state.layout.uniforms.len() as u32;
        let samplers = (0..state.layout.samplers.len() as u32)
            .map(|i| {
                let unit = match state.uniforms.get(&(uniform_count + i)) {
                    Some(UniformValue::Int(unit)) => *unit as u32,
                    _ => 0,
                };
                self.texture_units.get(&unit).copied()
            })
            .collect();

        let draw = DrawCall {
            program,
            framebuffer: self.bound_framebuffer,
            attachments,
            viewport: self.viewport,
            blend: self.blend,
            samplers,
            uniforms: state.uniforms.clone(),
        };
        self.commands.push(Command::Draw(draw));
        Ok(())
    }

    fn clear(&mut self, color: [f32; 4]) {
        if self.bound_framebuffer.is_none() {
            self.surface_color = color;
        }
        self.commands.push(Command::Clear {
            framebuffer: self.bound_framebuffer,
            color,
        });
    }

    fn surface_size(&self) -> Extent {
        self.surface_size
    }

    fn resize_surface(&mut self, size: Extent) -> Result<(), GpuError> {
        self.surface_size = size.at_least_one();
        self.commands.push(Command::ResizeSurface(self.surface_size));
        Ok(())
    }

    /// The surface as last cleared; draws are not rasterized.
    fn read_surface(&mut self) -> Result<RgbaImage, GpuError> {
        let px = self.surface_color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
        Ok(RgbaImage::from_pixel(
            self.surface_size.width,
            self.surface_size.height,
            Rgba(px),
        ))
    }

    fn end_frame(&mut self) {
        self.commands.push(Command::EndFrame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "#version 450
layout(location = 0) out vec4 out_color;
layout(set = 0, binding = 0, std140) uniform PassUniforms {
    vec4 color;
};
void main() {
    out_color = color;
}
";

    #[test]
    fn draw_captures_bound_state() {
        let mut gpu = RecordingBackend::new();
        let tex = gpu.create_texture(PixelFormat::Rgba8, Extent::new(4, 4)).unwrap();
        let fb = gpu.create_framebuffer().unwrap();
        gpu.attach_color(fb, 0, Some(tex)).unwrap();
        gpu.set_draw_buffers(fb, &[0]).unwrap();
        let program = gpu.compile_program(SOURCE).unwrap();
        let loc = gpu.uniform_location(program, "color").unwrap();

        gpu.use_program(program).unwrap();
        let value = UniformValue::Vec4(crate::protocol::Vec4 {
            x: 1.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        });
        gpu.set_uniform(loc, &value).unwrap();
        gpu.bind_framebuffer(Some(fb));
        gpu.set_viewport(Extent::new(4, 4));
        gpu.draw_fullscreen().unwrap();

        let draw = gpu.draws().next().unwrap();
        assert_eq!(draw.attachments, vec![(0, tex)]);
        assert_eq!(draw.uniforms.get(&loc.0), Some(&value));
        assert_eq!(draw.viewport, Extent::new(4, 4));
    }

    #[test]
    fn drawing_into_an_empty_framebuffer_fails() {
        let mut gpu = RecordingBackend::new();
        let fb = gpu.create_framebuffer().unwrap();
        let program = gpu.compile_program(SOURCE).unwrap();
        gpu.use_program(program).unwrap();
        gpu.bind_framebuffer(Some(fb));
        assert!(matches!(gpu.draw_fullscreen(), Err(GpuError::Draw(_))));
    }

    #[test]
    fn oversized_textures_fail_to_allocate() {
        let mut gpu = RecordingBackend::new();
        gpu.max_texture_dimension = 8;
        assert!(gpu.create_texture(PixelFormat::Rgba8, Extent::new(9, 1)).is_err());
        assert!(gpu.create_texture(PixelFormat::Rgba8, Extent::new(0, 4)).is_err());
        assert_eq!(gpu.live_texture_count(), 0);
    }
}
