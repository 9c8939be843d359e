//! Offscreen wgpu implementation of [`GpuBackend`].
//!
//! Pass programs are GLSL run through naga to WGSL and paired with a shared
//! fullscreen vertex stage. The output surface is an offscreen `Rgba8Unorm`
//! texture the host reads back or presents. Every draw and clear is encoded
//! and submitted on its own inside a validation error scope, so a bad
//! invocation surfaces as an error on that call instead of poisoning the
//! frame.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result, anyhow};
use image::RgbaImage;
use wgpu::util::DeviceExt;

use crate::errors::{GpuError, ShaderCompileError};
use crate::gpu::fullscreen::{FRAGMENT_ENTRY, FULLSCREEN_VERTEX_ENTRY, FULLSCREEN_VERTEX_WGSL};
use crate::gpu::{FramebufferHandle, GpuBackend, ProgramHandle, TextureHandle, UniformLocation};
use crate::protocol::{Extent, PixelFormat, UniformValue};
use crate::renderer::validation::{ProgramLayout, SlotRef, compile_fragment_glsl};

pub fn texture_format(format: PixelFormat) -> wgpu::TextureFormat {
    match format {
        PixelFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        PixelFormat::Rgba16f => wgpu::TextureFormat::Rgba16Float,
        PixelFormat::Rgba32f => wgpu::TextureFormat::Rgba32Float,
        PixelFormat::R16f => wgpu::TextureFormat::R16Float,
        PixelFormat::R32f => wgpu::TextureFormat::R32Float,
        PixelFormat::Rg16f => wgpu::TextureFormat::Rg16Float,
        PixelFormat::Rg32f => wgpu::TextureFormat::Rg32Float,
    }
}

struct TextureEntry {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    format: PixelFormat,
    size: Extent,
}

#[derive(Default)]
struct FramebufferState {
    attachments: BTreeMap<u32, TextureHandle>,
    draw_buffers: Vec<u32>,
}

/// Color targets of a draw, indexed by location.
type PipelineKey = Vec<Option<(wgpu::TextureFormat, Option<wgpu::BlendState>)>>;

struct ProgramEntry {
    module: wgpu::ShaderModule,
    layout: ProgramLayout,
    uniform_data: Vec<u8>,
    sampler_units: Vec<u32>,
    uniform_group: wgpu::BindGroupLayout,
    sampler_group: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
}

enum Target {
    Surface,
    Texture(TextureHandle),
}

pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    vertex_module: wgpu::ShaderModule,
    sampler: wgpu::Sampler,
    placeholder: wgpu::TextureView,
    surface: TextureEntry,
    next_id: u32,
    textures: HashMap<TextureHandle, TextureEntry>,
    framebuffers: HashMap<FramebufferHandle, FramebufferState>,
    programs: HashMap<ProgramHandle, ProgramEntry>,
    current_program: Option<ProgramHandle>,
    bound_framebuffer: Option<FramebufferHandle>,
    texture_units: BTreeMap<u32, TextureHandle>,
    viewport: Extent,
    blend: wgpu::BlendState,
    warned_unblendable: bool,
}

impl WgpuBackend {
    /// Bring up a headless device on the default adapter.
    pub fn new() -> Result<Self> {
        pollster::block_on(Self::new_async())
    }

    pub async fn new_async() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| anyhow!("no suitable GPU adapter: {e}"))?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("shader-script-runtime"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                ..Default::default()
            })
            .await
            .context("failed to create wgpu device")?;

        Ok(Self::with_device(device, queue))
    }

    /// Wrap an existing device, e.g. one shared with a windowing layer.
    pub fn with_device(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let vertex_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("fullscreen vertex"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(FULLSCREEN_VERTEX_WGSL)),
        });
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("pass sampler"),
            ..Default::default()
        });
        let placeholder = create_texture_entry(
            &device,
            PixelFormat::Rgba8,
            Extent::new(1, 1),
            "placeholder",
        );
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &placeholder.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &[0, 0, 0, 0],
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4),
                rows_per_image: Some(1),
            },
            extent3d(Extent::new(1, 1)),
        );
        let surface = create_surface_entry(&device, Extent::new(1, 1));

        Self {
            device,
            queue,
            vertex_module,
            sampler,
            placeholder: placeholder.view,
            surface,
            next_id: 1,
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            current_program: None,
            bound_framebuffer: None,
            texture_units: BTreeMap::new(),
            viewport: Extent::new(1, 1),
            blend: wgpu::BlendState::REPLACE,
            warned_unblendable: false,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// The offscreen surface, for hosts that present it themselves.
    pub fn surface_texture(&self) -> &wgpu::Texture {
        &self.surface.texture
    }

    /// Read an image back as linear RGBA floats, row-major from the top.
    /// Missing channels read as 0, missing alpha as 1.
    pub fn read_texture(&mut self, texture: TextureHandle) -> Result<Vec<[f32; 4]>, GpuError> {
        let entry = self.textures.get(&texture).ok_or(GpuError::InvalidHandle {
            kind: "texture",
            id: texture.0,
        })?;
        let format = entry.format;
        let bytes = read_back(&self.device, &self.queue, &entry.texture, entry.size, format)?;
        let bpp = format.bytes_per_pixel() as usize;
        Ok(bytes.chunks_exact(bpp).map(|px| decode_pixel(format, px)).collect())
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn with_error_scope<T>(&self, f: impl FnOnce() -> T) -> Result<T, String> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        match validation.or(oom) {
            Some(e) => Err(e.to_string()),
            None => Ok(value),
        }
    }

    /// Color targets for the bound framebuffer, restricted to locations the
    /// program writes.
    fn resolve_targets(&self, layout: &ProgramLayout) -> Result<Vec<(u32, Target)>, GpuError> {
        let targets: Vec<(u32, Target)> = match self.bound_framebuffer {
            Some(fb) => {
                let state = self.framebuffers.get(&fb).ok_or(GpuError::InvalidHandle {
                    kind: "framebuffer",
                    id: fb.0,
                })?;
                state
                    .draw_buffers
                    .iter()
                    .filter(|slot| layout.outputs.contains(slot))
                    .filter_map(|slot| {
                        state
                            .attachments
                            .get(slot)
                            .map(|t| (*slot, Target::Texture(*t)))
                    })
                    .collect()
            }
            None if layout.outputs.contains(&0) => vec![(0, Target::Surface)],
            None => Vec::new(),
        };
        if targets.is_empty() {
            return Err(GpuError::Draw(
                "no color attachment matches an output of the program".to_string(),
            ));
        }
        Ok(targets)
    }

    fn target_entry(&self, target: &Target) -> Result<&TextureEntry, GpuError> {
        match target {
            Target::Surface => Ok(&self.surface),
            Target::Texture(t) => self.textures.get(t).ok_or(GpuError::InvalidHandle {
                kind: "texture",
                id: t.0,
            }),
        }
    }

    fn target_blend(&mut self, format: PixelFormat) -> Option<wgpu::BlendState> {
        if self.blend == wgpu::BlendState::REPLACE {
            return None;
        }
        if format.is_float32() {
            if !self.warned_unblendable {
                log::warn!("32-bit float targets aren't blendable; drawing them opaque");
                self.warned_unblendable = true;
            }
            return None;
        }
        Some(self.blend)
    }
}

fn extent3d(size: Extent) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: size.width,
        height: size.height,
        depth_or_array_layers: 1,
    }
}

fn create_texture_entry(
    device: &wgpu::Device,
    format: PixelFormat,
    size: Extent,
    label: &str,
) -> TextureEntry {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: extent3d(size),
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: texture_format(format),
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT
            | wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    TextureEntry {
        texture,
        view,
        format,
        size,
    }
}

fn create_surface_entry(device: &wgpu::Device, size: Extent) -> TextureEntry {
    create_texture_entry(device, PixelFormat::Rgba8, size, "output surface")
}

fn bytes_per_row_padded(width: u32, bpp: u32) -> u32 {
    let unpadded = width * bpp;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

fn read_back(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
    size: Extent,
    format: PixelFormat,
) -> Result<Vec<u8>, GpuError> {
    let bpp = format.bytes_per_pixel();
    let padded = bytes_per_row_padded(size.width, bpp);
    let buffer_size = u64::from(padded) * u64::from(size.height);
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("readback"),
        size: buffer_size,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("readback"),
    });
    encoder.copy_texture_to_buffer(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::TexelCopyBufferInfo {
            buffer: &buffer,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded),
                rows_per_image: Some(size.height),
            },
        },
        extent3d(size),
    );
    queue.submit(Some(encoder.finish()));

    let slice = buffer.slice(0..buffer_size);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });

    let mut mapped = None;
    for _ in 0..2000 {
        let _ = device.poll(wgpu::PollType::Poll);
        if let Ok(result) = rx.try_recv() {
            mapped = Some(result);
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    match mapped {
        Some(Ok(())) => {}
        Some(Err(e)) => return Err(GpuError::Readback(e.to_string())),
        None => {
            buffer.unmap();
            return Err(GpuError::Readback("timed out mapping buffer".to_string()));
        }
    }

    let row_bytes = (size.width * bpp) as usize;
    let data = slice.get_mapped_range();
    let mut bytes = Vec::with_capacity(row_bytes * size.height as usize);
    for row in data.chunks_exact(padded as usize) {
        bytes.extend_from_slice(&row[..row_bytes]);
    }
    drop(data);
    buffer.unmap();
    Ok(bytes)
}

fn decode_pixel(format: PixelFormat, px: &[u8]) -> [f32; 4] {
    let f16_at = |i: usize| half::f16::from_le_bytes([px[2 * i], px[2 * i + 1]]).to_f32();
    let f32_at =
        |i: usize| f32::from_le_bytes([px[4 * i], px[4 * i + 1], px[4 * i + 2], px[4 * i + 3]]);
    match format {
        PixelFormat::Rgba8 => px_u8(px),
        PixelFormat::Rgba16f => [f16_at(0), f16_at(1), f16_at(2), f16_at(3)],
        PixelFormat::Rgba32f => [f32_at(0), f32_at(1), f32_at(2), f32_at(3)],
        PixelFormat::R16f => [f16_at(0), 0.0, 0.0, 1.0],
        PixelFormat::R32f => [f32_at(0), 0.0, 0.0, 1.0],
        PixelFormat::Rg16f => [f16_at(0), f16_at(1), 0.0, 1.0],
        PixelFormat::Rg32f => [f32_at(0), f32_at(1), 0.0, 1.0],
    }
}

fn px_u8(px: &[u8]) -> [f32; 4] {
    [
        f32::from(px[0]) / 255.0,
        f32::from(px[1]) / 255.0,
        f32::from(px[2]) / 255.0,
        f32::from(px[3]) / 255.0,
    ]
}

fn build_pipeline(
    device: &wgpu::Device,
    vertex_module: &wgpu::ShaderModule,
    program: &ProgramEntry,
    key: &PipelineKey,
) -> wgpu::RenderPipeline {
    let targets: Vec<Option<wgpu::ColorTargetState>> = key
        .iter()
        .map(|t| {
            t.map(|(format, blend)| wgpu::ColorTargetState {
                format,
                blend,
                write_mask: wgpu::ColorWrites::ALL,
            })
        })
        .collect();
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("pass pipeline"),
        layout: Some(&program.pipeline_layout),
        vertex: wgpu::VertexState {
            module: vertex_module,
            entry_point: Some(FULLSCREEN_VERTEX_ENTRY),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            buffers: &[],
        },
        primitive: wgpu::PrimitiveState::default(),
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        fragment: Some(wgpu::FragmentState {
            module: &program.module,
            entry_point: Some(FRAGMENT_ENTRY),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            targets: &targets,
        }),
        multiview: None,
        cache: None,
    })
}

impl GpuBackend for WgpuBackend {
    fn create_texture(
        &mut self,
        format: PixelFormat,
        size: Extent,
    ) -> Result<TextureHandle, GpuError> {
        let max = self.device.limits().max_texture_dimension_2d;
        if size.is_empty() || size.width > max || size.height > max {
            return Err(GpuError::Allocation(format!(
                "{size} is empty or exceeds the {max} texture limit"
            )));
        }
        let entry = self
            .with_error_scope(|| create_texture_entry(&self.device, format, size, "cached image"))
            .map_err(GpuError::Allocation)?;
        let handle = TextureHandle(self.next_id());
        self.textures.insert(handle, entry);
        Ok(handle)
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(entry) = self.textures.remove(&texture) {
            entry.texture.destroy();
        }
    }

    fn create_framebuffer(&mut self) -> Result<FramebufferHandle, GpuError> {
        let handle = FramebufferHandle(self.next_id());
        self.framebuffers.insert(handle, FramebufferState::default());
        Ok(handle)
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(&framebuffer);
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
        let state = self
            .framebuffers
            .get_mut(&framebuffer)
            .ok_or(GpuError::InvalidHandle {
                kind: "framebuffer",
                id: framebuffer.0,
            })?;
        match texture {
            Some(t) => state.attachments.insert(slot, t),
            None => state.attachments.remove(&slot),
        };
        Ok(())
    }

    fn set_draw_buffers(
        &mut self,
        framebuffer: FramebufferHandle,
        slots: &[u32],
    ) -> Result<(), GpuError> {
        let state = self
            .framebuffers
            .get_mut(&framebuffer)
            .ok_or(GpuError::InvalidHandle {
                kind: "framebuffer",
                id: framebuffer.0,
            })?;
        state.draw_buffers = slots.to_vec();
        Ok(())
    }

    fn compile_program(&mut self, source: &str) -> Result<ProgramHandle, ShaderCompileError> {
        let compiled = compile_fragment_glsl(source)?;
        let wgsl = compiled.to_wgsl().map_err(|e| ShaderCompileError {
            line: None,
            message: format!("{e:#}"),
        })?;
        let layout = compiled.layout;

        let created = self.with_error_scope(|| {
            let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("pass fragment"),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(wgsl)),
            });

            let uniform_entries: Vec<wgpu::BindGroupLayoutEntry> = if layout.block_size > 0 {
                vec![wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }]
            } else {
                Vec::new()
            };
            let sampler_entries: Vec<wgpu::BindGroupLayoutEntry> = layout
                .samplers
                .iter()
                .flat_map(|s| {
                    [
                        wgpu::BindGroupLayoutEntry {
                            binding: s.texture_binding,
                            visibility: wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Texture {
                                sample_type: wgpu::TextureSampleType::Float { filterable: false },
                                view_dimension: wgpu::TextureViewDimension::D2,
                                multisampled: false,
                            },
                            count: None,
                        },
                        wgpu::BindGroupLayoutEntry {
                            binding: s.sampler_binding,
                            visibility: wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
                            count: None,
                        },
                    ]
                })
                .collect();

            let uniform_group = self
                .device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("pass uniforms"),
                    entries: &uniform_entries,
                });
            let sampler_group = self
                .device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("pass samplers"),
                    entries: &sampler_entries,
                });
            let pipeline_layout =
                self.device
                    .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                        label: Some("pass layout"),
                        bind_group_layouts: &[&uniform_group, &sampler_group],
                        push_constant_ranges: &[],
                    });
            (module, uniform_group, sampler_group, pipeline_layout)
        });
        let (module, uniform_group, sampler_group, pipeline_layout) =
            created.map_err(|message| ShaderCompileError {
                line: None,
                message,
            })?;

        // Uniform buffers are bound whole; keep them 16-byte sized.
        let data_len = (layout.block_size.max(16)).div_ceil(16) * 16;
        let handle = ProgramHandle(self.next_id());
        self.programs.insert(
            handle,
            ProgramEntry {
                module,
                uniform_data: vec![0; data_len as usize],
                sampler_units: vec![0; layout.samplers.len()],
                layout,
                uniform_group,
                sampler_group,
                pipeline_layout,
                pipelines: HashMap::new(),
            },
        );
        Ok(handle)
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        self.programs.remove(&program);
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
        let handle = self
            .current_program
            .ok_or_else(|| GpuError::Draw("no program in use".to_string()))?;
        let program = self
            .programs
            .get_mut(&handle)
            .ok_or(GpuError::InvalidHandle {
                kind: "program",
                id: handle.0,
            })?;
        let target = match program.layout.slot(location) {
            Some(SlotRef::Uniform(u)) => Some(u.offset as usize),
            Some(SlotRef::Sampler(index, _)) => match value {
                UniformValue::Int(unit) => {
                    program.sampler_units[index] = (*unit).max(0) as u32;
                    None
                }
                _ => {
                    return Err(GpuError::Draw(format!(
                        "sampler at location {} takes a texture unit",
                        location.0
                    )));
                }
            },
            None => {
                return Err(GpuError::InvalidHandle {
                    kind: "uniform location",
                    id: location.0,
                });
            }
        };
        if let Some(offset) = target {
            let bytes = value.to_bytes();
            let end = offset + bytes.len();
            if end > program.uniform_data.len() {
                return Err(GpuError::Draw(format!(
                    "uniform at location {} overruns the uniform block",
                    location.0
                )));
            }
            program.uniform_data[offset..end].copy_from_slice(&bytes);
        }
        Ok(())
    }

    fn bind_texture(&mut self, unit: u32, texture: Option<TextureHandle>) {
        match texture {
            Some(t) => self.texture_units.insert(unit, t),
            None => self.texture_units.remove(&unit),
        };
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
        let handle = self
            .current_program
            .ok_or_else(|| GpuError::Draw("no program in use".to_string()))?;
        let layout = self
            .programs
            .get(&handle)
            .map(|p| p.layout.clone())
            .ok_or(GpuError::InvalidHandle {
                kind: "program",
                id: handle.0,
            })?;

        let targets = self.resolve_targets(&layout)?;
        let mut key: PipelineKey = Vec::new();
        let mut target_size = None;
        for (slot, target) in &targets {
            let (format, size) = {
                let entry = self.target_entry(target)?;
                (entry.format, entry.size)
            };
            let blend = self.target_blend(format);
            let idx = *slot as usize;
            if key.len() <= idx {
                key.resize(idx + 1, None);
            }
            key[idx] = Some((texture_format(format), blend));
            target_size.get_or_insert(size);
        }
        let target_size = target_size.unwrap_or(self.viewport);

        let program = self.programs.get(&handle).ok_or(GpuError::InvalidHandle {
            kind: "program",
            id: handle.0,
        })?;
        let sampled: Vec<Option<TextureHandle>> = program
            .sampler_units
            .iter()
            .map(|unit| self.texture_units.get(unit).copied())
            .collect();
        for (_, target) in &targets {
            if let Target::Texture(t) = target {
                if sampled.contains(&Some(*t)) {
                    return Err(GpuError::Draw(format!(
                        "texture {} is both sampled and rendered to",
                        t.0
                    )));
                }
            }
        }

        if !program.pipelines.contains_key(&key) {
            let pipeline = self
                .with_error_scope(|| build_pipeline(&self.device, &self.vertex_module, program, &key))
                .map_err(GpuError::Draw)?;
            if let Some(p) = self.programs.get_mut(&handle) {
                p.pipelines.insert(key.clone(), pipeline);
            }
        }

        let program = self.programs.get(&handle).ok_or(GpuError::InvalidHandle {
            kind: "program",
            id: handle.0,
        })?;
        let pipeline = program
            .pipelines
            .get(&key)
            .ok_or_else(|| GpuError::Draw("pipeline missing after creation".to_string()))?;

        let mut views: Vec<Option<&wgpu::TextureView>> = vec![None; key.len()];
        for (slot, target) in &targets {
            views[*slot as usize] = Some(&self.target_entry(target)?.view);
        }
        let mut sampler_views = Vec::with_capacity(sampled.len());
        for texture in &sampled {
            let view = match texture.and_then(|t| self.textures.get(&t)) {
                Some(entry) => &entry.view,
                None => &self.placeholder,
            };
            sampler_views.push(view);
        }

        let viewport = Extent::new(
            self.viewport.width.min(target_size.width),
            self.viewport.height.min(target_size.height),
        )
        .at_least_one();

        self.with_error_scope(|| {
            let uniform_buffer = self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("pass uniforms"),
                    contents: &program.uniform_data,
                    usage: wgpu::BufferUsages::UNIFORM,
                });
            let uniform_entries: Vec<wgpu::BindGroupEntry> = if program.layout.block_size > 0 {
                vec![wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform_buffer.as_entire_binding(),
                }]
            } else {
                Vec::new()
            };
            let uniform_bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("pass uniforms"),
                layout: &program.uniform_group,
                entries: &uniform_entries,
            });

            let mut sampler_entries = Vec::with_capacity(sampler_views.len() * 2);
            for (slot, view) in program.layout.samplers.iter().zip(sampler_views.iter().copied()) {
                sampler_entries.push(wgpu::BindGroupEntry {
                    binding: slot.texture_binding,
                    resource: wgpu::BindingResource::TextureView(view),
                });
                sampler_entries.push(wgpu::BindGroupEntry {
                    binding: slot.sampler_binding,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                });
            }
            let sampler_bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("pass samplers"),
                layout: &program.sampler_group,
                entries: &sampler_entries,
            });

            let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = views
                .iter()
                .map(|view| {
                    view.map(|view| wgpu::RenderPassColorAttachment {
                        view,
                        depth_slice: None,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        },
                    })
                })
                .collect();

            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("pass draw"),
                });
            {
                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("pass draw"),
                    color_attachments: &color_attachments,
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                pass.set_pipeline(pipeline);
                pass.set_bind_group(0, &uniform_bind_group, &[]);
                pass.set_bind_group(1, &sampler_bind_group, &[]);
                pass.set_viewport(
                    0.0,
                    0.0,
                    viewport.width as f32,
                    viewport.height as f32,
                    0.0,
                    1.0,
                );
                pass.draw(0..3, 0..1);
            }
            self.queue.submit(Some(encoder.finish()));
        })
        .map_err(GpuError::Draw)
    }

    fn clear(&mut self, color: [f32; 4]) {
        let targets: Vec<Target> = match self.bound_framebuffer {
            Some(fb) => match self.framebuffers.get(&fb) {
                Some(state) => state
                    .draw_buffers
                    .iter()
                    .filter_map(|slot| state.attachments.get(slot))
                    .map(|t| Target::Texture(*t))
                    .collect(),
                None => Vec::new(),
            },
            None => vec![Target::Surface],
        };
        let views: Vec<&wgpu::TextureView> = targets
            .iter()
            .filter_map(|t| self.target_entry(t).ok())
            .map(|entry| &entry.view)
            .collect();
        if views.is_empty() {
            return;
        }

        let result = self.with_error_scope(|| {
            let [r, g, b, a] = color.map(f64::from);
            let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = views
                .iter()
                .copied()
                .map(|view| {
                    Some(wgpu::RenderPassColorAttachment {
                        view,
                        depth_slice: None,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                            store: wgpu::StoreOp::Store,
                        },
                    })
                })
                .collect();
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("clear"),
                });
            encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("clear"),
                color_attachments: &color_attachments,
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            self.queue.submit(Some(encoder.finish()));
        });
        if let Err(e) = result {
            log::error!("clear failed: {e}");
        }
    }

    fn surface_size(&self) -> Extent {
        self.surface.size
    }

    fn resize_surface(&mut self, size: Extent) -> Result<(), GpuError> {
        let size = size.at_least_one();
        if size == self.surface.size {
            return Ok(());
        }
        let entry = self
            .with_error_scope(|| create_surface_entry(&self.device, size))
            .map_err(GpuError::Allocation)?;
        let old = std::mem::replace(&mut self.surface, entry);
        old.texture.destroy();
        Ok(())
    }

    fn read_surface(&mut self) -> Result<RgbaImage, GpuError> {
        let size = self.surface.size;
        let bytes = read_back(
            &self.device,
            &self.queue,
            &self.surface.texture,
            size,
            PixelFormat::Rgba8,
        )?;
        RgbaImage::from_raw(size.width, size.height, bytes)
            .ok_or_else(|| GpuError::Readback("surface size doesn't match read-back".to_string()))
    }

    fn end_frame(&mut self) {
        // Work is submitted per draw; this just lets callbacks run.
        let _ = self.device.poll(wgpu::PollType::Poll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_pad_to_copy_alignment() {
        assert_eq!(bytes_per_row_padded(64, 4), 256);
        assert_eq!(bytes_per_row_padded(65, 4), 512);
        assert_eq!(bytes_per_row_padded(32, 8), 256);
    }

    #[test]
    fn half_float_pixels_decode() {
        let one = half::f16::from_f32(1.0).to_le_bytes();
        let quarter = half::f16::from_f32(0.25).to_le_bytes();
        let px = [one, quarter, one, one].concat();
        assert_eq!(decode_pixel(PixelFormat::Rgba16f, &px), [1.0, 0.25, 1.0, 1.0]);
        assert_eq!(decode_pixel(PixelFormat::R16f, &px[..2]), [1.0, 0.0, 0.0, 1.0]);
    }
}
