//! The GPU capability surface the frame executor drives.
//!
//! The interface is immediate-mode: bind a framebuffer, pick a
//! program, set uniforms, draw. [`WgpuBackend`] records that state and turns
//! each draw into a render pass; [`RecordingBackend`] keeps it as a command
//! log for tests.

pub mod fullscreen;
pub mod recording;
pub mod wgpu_backend;

use image::RgbaImage;

use crate::errors::{GpuError, ShaderCompileError};
use crate::protocol::{Extent, PixelFormat, UniformValue};

pub use recording::{Command, DrawCall, RecordingBackend};
pub use wgpu_backend::WgpuBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FramebufferHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramHandle(pub u32);

/// Index of a uniform or sampler within one program's slot list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniformLocation(pub u32);

pub trait GpuBackend {
    fn create_texture(&mut self, format: PixelFormat, size: Extent)
    -> Result<TextureHandle, GpuError>;
    fn destroy_texture(&mut self, texture: TextureHandle);

    fn create_framebuffer(&mut self) -> Result<FramebufferHandle, GpuError>;
    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle);
    /// Attach (or detach, with `None`) a texture at a color slot.
    fn attach_color(
        &mut self,
        framebuffer: FramebufferHandle,
        slot: u32,
        texture: Option<TextureHandle>,
    ) -> Result<(), GpuError>;
    /// Color slots written by subsequent draws into `framebuffer`.
    fn set_draw_buffers(&mut self, framebuffer: FramebufferHandle, slots: &[u32])
    -> Result<(), GpuError>;

    /// Build a fragment program from assembled source.
    fn compile_program(&mut self, source: &str) -> Result<ProgramHandle, ShaderCompileError>;
    fn delete_program(&mut self, program: ProgramHandle);
    /// Location of a uniform or sampler by name, `None` if the program has none.
    fn uniform_location(&self, program: ProgramHandle, name: &str) -> Option<UniformLocation>;

    fn use_program(&mut self, program: ProgramHandle) -> Result<(), GpuError>;
    /// Set a uniform on the current program. Samplers take the texture unit
    /// they read from as an `Int`.
    fn set_uniform(&mut self, location: UniformLocation, value: &UniformValue)
    -> Result<(), GpuError>;
    fn bind_texture(&mut self, unit: u32, texture: Option<TextureHandle>);
    /// `None` targets the output surface.
    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferHandle>);
    fn set_viewport(&mut self, size: Extent);
    fn set_blend(&mut self, blend: wgpu::BlendState);

    /// One triangle covering the viewport.
    fn draw_fullscreen(&mut self) -> Result<(), GpuError>;
    /// Clear every color target of the bound framebuffer.
    fn clear(&mut self, color: [f32; 4]);

    fn surface_size(&self) -> Extent;
    fn resize_surface(&mut self, size: Extent) -> Result<(), GpuError>;
    fn read_surface(&mut self) -> Result<RgbaImage, GpuError>;

    /// Flush everything recorded this frame.
    fn end_frame(&mut self);
}
