//! Records exchanged with the script compiler.
//!
//! Field names follow the compiler's JSON shape (`shader_descs`, `def_val`,
//! `color_attachments`, ...), so these types deserialize straight from what
//! the compiler emits and serialize back into what it reads.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Two dimensional size in pixels. Serialized as `{x, y}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Extent {
    #[serde(rename = "x")]
    pub width: u32,
    #[serde(rename = "y")]
    pub height: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Zero-sized surfaces are not renderable; bump each axis to at least one pixel.
    pub fn at_least_one(self) -> Self {
        Self {
            width: self.width.max(1),
            height: self.height.max(1),
        }
    }

    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgba8,
    Rgba16f,
    Rgba32f,
    R16f,
    R32f,
    Rg16f,
    Rg32f,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::Rgba16f => 8,
            PixelFormat::Rgba32f => 16,
            PixelFormat::R16f => 2,
            PixelFormat::R32f => 4,
            PixelFormat::Rg16f => 4,
            PixelFormat::Rg32f => 8,
        }
    }

    /// 32-bit float targets can't take part in blending on the wgpu backend.
    pub fn is_float32(self) -> bool {
        matches!(
            self,
            PixelFormat::Rgba32f | PixelFormat::R32f | PixelFormat::Rg32f
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlendMode {
    #[default]
    Opaque,
    Alphablend,
    Additive,
    Multiplicative,
}

/// A chunk of user-authored text and the script line it starts on.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceText {
    pub text: String,
    #[serde(default)]
    pub start: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderDeclaration {
    pub name: String,
    pub body: SourceText,
}

/// `{name, type}` pair used for uniforms, samplers and outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedType {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

impl NamedType {
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderDesc {
    pub name: String,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub uniforms: Vec<NamedType>,
    #[serde(default)]
    pub samplers: Vec<NamedType>,
    #[serde(default)]
    pub outs: Vec<NamedType>,
    pub body: SourceText,
    #[serde(default)]
    pub blend_mode: BlendMode,
}

/// Error location reported by the compiler.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScriptDiagnostic {
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub column: u32,
    #[serde(rename = "desc", alias = "description", default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoadResult {
    #[serde(default)]
    pub declarations: Vec<ShaderDeclaration>,
    #[serde(default)]
    pub shader_descs: Vec<ShaderDesc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ScriptDiagnostic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ImageKind {
    #[default]
    Cached,
    Loaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRequest {
    pub id: u32,
    pub pixel_format: PixelFormat,
    pub size: Extent,
    #[serde(skip)]
    pub kind: ImageKind,
}

impl ImageRequest {
    pub fn cached(id: u32, pixel_format: PixelFormat, size: Extent) -> Self {
        Self {
            id,
            pixel_format,
            size,
            kind: ImageKind::Cached,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatRequest {
    pub name: String,
    pub def_val: f32,
    #[serde(default)]
    pub min_val: f32,
    #[serde(default = "default_float_max")]
    pub max_val: f32,
}

fn default_float_max() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntRequest {
    pub name: String,
    pub def_val: i32,
    #[serde(default)]
    pub min_val: i32,
    #[serde(default = "default_int_max")]
    pub max_val: i32,
}

fn default_int_max() -> i32 {
    100
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoolRequest {
    pub name: String,
    #[serde(default)]
    pub def_val: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRequest {
    pub name: String,
    #[serde(default)]
    pub def_val: String,
}

/// One need declared by the evaluated script for the current frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContextRequest {
    #[serde(rename = "CachedImageRequest")]
    CachedImage(ImageRequest),
    #[serde(rename = "LoadedImageRequest")]
    LoadedImage(ImageRequest),
    #[serde(rename = "FloatRequest")]
    Float(FloatRequest),
    #[serde(rename = "IntRequest")]
    Int(IntRequest),
    #[serde(rename = "BoolRequest")]
    Bool(BoolRequest),
    #[serde(rename = "TextRequest")]
    Text(TextRequest),
}

impl ContextRequest {
    /// The image request with its `kind` filled in from the variant.
    pub fn image_request(&self) -> Option<ImageRequest> {
        match self {
            ContextRequest::CachedImage(r) => Some(ImageRequest {
                kind: ImageKind::Cached,
                ..*r
            }),
            ContextRequest::LoadedImage(r) => Some(ImageRequest {
                kind: ImageKind::Loaded,
                ..*r
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Vec2<T> {
    pub x: T,
    pub y: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Vec3<T> {
    pub x: T,
    pub y: T,
    pub z: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Vec4<T> {
    pub x: T,
    pub y: T,
    pub z: T,
    pub w: T,
}

/// Invocation-time uniform value. The compiler only ever emits this closed set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum UniformValue {
    Float(f32),
    Vec2(Vec2<f32>),
    Vec3(Vec3<f32>),
    Vec4(Vec4<f32>),
    Int(i32),
    IVec2(Vec2<i32>),
    IVec3(Vec3<i32>),
    IVec4(Vec4<i32>),
    UInt(u32),
    UVec2(Vec2<u32>),
    UVec3(Vec3<u32>),
    UVec4(Vec4<u32>),
}

impl UniformValue {
    /// Little-endian bytes of the components, tightly packed.
    pub fn to_bytes(&self) -> Vec<u8> {
        match *self {
            UniformValue::Float(v) => bytemuck::bytes_of(&v).to_vec(),
            UniformValue::Vec2(v) => bytemuck::cast_slice(&[v.x, v.y]).to_vec(),
            UniformValue::Vec3(v) => bytemuck::cast_slice(&[v.x, v.y, v.z]).to_vec(),
            UniformValue::Vec4(v) => bytemuck::cast_slice(&[v.x, v.y, v.z, v.w]).to_vec(),
            UniformValue::Int(v) => bytemuck::bytes_of(&v).to_vec(),
            UniformValue::IVec2(v) => bytemuck::cast_slice(&[v.x, v.y]).to_vec(),
            UniformValue::IVec3(v) => bytemuck::cast_slice(&[v.x, v.y, v.z]).to_vec(),
            UniformValue::IVec4(v) => bytemuck::cast_slice(&[v.x, v.y, v.z, v.w]).to_vec(),
            UniformValue::UInt(v) => bytemuck::bytes_of(&v).to_vec(),
            UniformValue::UVec2(v) => bytemuck::cast_slice(&[v.x, v.y]).to_vec(),
            UniformValue::UVec3(v) => bytemuck::cast_slice(&[v.x, v.y, v.z]).to_vec(),
            UniformValue::UVec4(v) => bytemuck::cast_slice(&[v.x, v.y, v.z, v.w]).to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageBinding {
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShaderInvocation {
    pub shader_name: String,
    #[serde(default)]
    pub uniforms: Vec<Option<UniformValue>>,
    #[serde(default)]
    pub image_sampler_bindings: Vec<ImageBinding>,
    #[serde(default)]
    pub color_attachments: Vec<ImageBinding>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameResult {
    #[serde(default)]
    pub context_requests: Vec<ContextRequest>,
    #[serde(default)]
    pub shader_invocations: Vec<ShaderInvocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ScriptDiagnostic>,
}

/// A resolved input fed to the next frame evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContextInput {
    Float { name: String, value: f32 },
    Int { name: String, value: i32 },
    UVec2 { name: String, value: Vec2<u32> },
}
