//! Pass program validation and reflection using naga.
//!
//! Both backends run assembled pass sources through the same GLSL front end,
//! so error lines and uniform locations agree whichever backend is in use.

use anyhow::{Result, anyhow};
use naga::{AddressSpace, Binding, ShaderStage, TypeInner};

use crate::errors::ShaderCompileError;
use crate::gpu::UniformLocation;

/// Bind group holding the uniform block.
pub const UNIFORM_GROUP: u32 = 0;
/// Bind group holding sampler textures and their samplers.
pub const SAMPLER_GROUP: u32 = 1;

pub const TEXTURE_SUFFIX: &str = "_texture";
pub const SAMPLER_SUFFIX: &str = "_sampler";

/// Parse WGSL, used for the hand-written vertex stage.
pub fn validate_wgsl(source: &str) -> Result<naga::Module> {
    naga::front::wgsl::parse_str(source)
        .map_err(|e| anyhow!("WGSL validation failed:\n  {e}\n{}", numbered(source)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformSlot {
    pub name: String,
    /// Byte offset inside the uniform block.
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerSlot {
    pub name: String,
    pub texture_binding: u32,
    pub sampler_binding: u32,
}

/// Resource interface of a compiled pass program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramLayout {
    pub uniforms: Vec<UniformSlot>,
    pub block_size: u32,
    pub samplers: Vec<SamplerSlot>,
    /// Color locations the fragment stage writes, ascending.
    pub outputs: Vec<u32>,
}

/// What a [`UniformLocation`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRef<'a> {
    Uniform(&'a UniformSlot),
    Sampler(usize, &'a SamplerSlot),
}

impl ProgramLayout {
    pub fn reflect(module: &naga::Module) -> Self {
        let mut layout = ProgramLayout::default();

        for (_, global) in module.global_variables.iter() {
            let Some(binding) = &global.binding else {
                continue;
            };
            let inner = &module.types[global.ty].inner;
            match (global.space, inner) {
                (AddressSpace::Uniform, TypeInner::Struct { members, span })
                    if binding.group == UNIFORM_GROUP =>
                {
                    layout.block_size = *span;
                    layout.uniforms = members
                        .iter()
                        .filter_map(|m| {
                            Some(UniformSlot {
                                name: m.name.clone()?,
                                offset: m.offset,
                            })
                        })
                        .collect();
                }
                (AddressSpace::Handle, TypeInner::Image { .. })
                    if binding.group == SAMPLER_GROUP =>
                {
                    let Some(name) = global
                        .name
                        .as_deref()
                        .and_then(|n| n.strip_suffix(TEXTURE_SUFFIX))
                    else {
                        continue;
                    };
                    layout.samplers.push(SamplerSlot {
                        name: name.to_string(),
                        texture_binding: binding.binding,
                        sampler_binding: binding.binding + 1,
                    });
                }
                _ => {}
            }
        }
        layout.samplers.sort_by_key(|s| s.texture_binding);

        for ep in module
            .entry_points
            .iter()
            .filter(|ep| ep.stage == ShaderStage::Fragment)
        {
            let Some(result) = &ep.function.result else {
                continue;
            };
            if let Some(Binding::Location { location, .. }) = &result.binding {
                layout.outputs.push(*location);
            } else if let TypeInner::Struct { members, .. } = &module.types[result.ty].inner {
                for m in members {
                    if let Some(Binding::Location { location, .. }) = &m.binding {
                        layout.outputs.push(*location);
                    }
                }
            }
        }
        layout.outputs.sort_unstable();
        layout.outputs.dedup();
        layout
    }

    /// Uniforms come first, then samplers, each in declaration order.
    pub fn location_of(&self, name: &str) -> Option<UniformLocation> {
        if let Some(i) = self.uniforms.iter().position(|u| u.name == name) {
            return Some(UniformLocation(i as u32));
        }
        self.samplers
            .iter()
            .position(|s| s.name == name)
            .map(|i| UniformLocation((self.uniforms.len() + i) as u32))
    }

    pub fn slot(&self, location: UniformLocation) -> Option<SlotRef<'_>> {
        let idx = location.0 as usize;
        if let Some(u) = self.uniforms.get(idx) {
            return Some(SlotRef::Uniform(u));
        }
        let sampler_idx = idx - self.uniforms.len();
        self.samplers
            .get(sampler_idx)
            .map(|s| SlotRef::Sampler(sampler_idx, s))
    }
}

/// A pass program that made it through the front end and the validator.
#[derive(Debug)]
pub struct CompiledFragment {
    pub module: naga::Module,
    pub info: naga::valid::ModuleInfo,
    pub layout: ProgramLayout,
}

impl CompiledFragment {
    /// WGSL for the wgpu backend, entry point `main`.
    pub fn to_wgsl(&self) -> Result<String> {
        naga::back::wgsl::write_string(
            &self.module,
            &self.info,
            naga::back::wgsl::WriterFlags::EXPLICIT_TYPES,
        )
        .map_err(|e| anyhow!("WGSL writer failed: {e:?}"))
    }
}

/// Parse and validate an assembled fragment program. Reported lines are
/// 1-based lines of `source`.
pub fn compile_fragment_glsl(source: &str) -> Result<CompiledFragment, ShaderCompileError> {
    let mut frontend = naga::front::glsl::Frontend::default();
    let options = naga::front::glsl::Options {
        stage: ShaderStage::Fragment,
        defines: Default::default(),
    };

    let module = frontend.parse(&options, source).map_err(|e| {
        let line = e
            .errors
            .iter()
            .find(|err| err.meta.is_defined())
            .map(|err| err.meta.location(source).line_number);
        let message = e
            .errors
            .iter()
            .map(|err| err.kind.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        ShaderCompileError { line, message }
    })?;

    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| ShaderCompileError {
        line: e.location(source).map(|loc| loc.line_number),
        message: e.as_inner().to_string(),
    })?;

    let layout = ProgramLayout::reflect(&module);
    Ok(CompiledFragment {
        module,
        info,
        layout,
    })
}

fn numbered(source: &str) -> String {
    let mut output = String::from("---\n");
    for (line_num, line) in source.lines().enumerate() {
        output.push_str(&format!("{:4} | {}\n", line_num + 1, line));
    }
    output.push_str("---\n");
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASS: &str = "#version 450
layout(location = 0) out vec4 out_color;
layout(location = 1) out vec4 out_mask;
layout(set = 0, binding = 0, std140) uniform PassUniforms {
    float gain;
    vec3 tint;
    int mode;
};
layout(set = 1, binding = 0) uniform texture2D src_texture;
layout(set = 1, binding = 1) uniform sampler src_sampler;
#define src sampler2D(src_texture, src_sampler)
void main() {
    vec4 c = texelFetch(src, ivec2(gl_FragCoord.xy), 0);
    out_color = vec4(c.rgb * tint * gain, 1.0);
    out_mask = vec4(float(mode));
}
";

    #[test]
    fn reflects_uniform_offsets_samplers_and_outputs() {
        let compiled = compile_fragment_glsl(PASS).unwrap();
        let layout = &compiled.layout;
        let names: Vec<_> = layout.uniforms.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, ["gain", "tint", "mode"]);
        assert_eq!(layout.uniforms[0].offset, 0);
        // std140: vec3 aligns to 16, the int packs into its tail.
        assert_eq!(layout.uniforms[1].offset, 16);
        assert_eq!(layout.uniforms[2].offset, 28);
        assert_eq!(layout.samplers.len(), 1);
        assert_eq!(layout.samplers[0].name, "src");
        assert_eq!(layout.outputs, [0, 1]);

        assert_eq!(layout.location_of("tint"), Some(UniformLocation(1)));
        assert_eq!(layout.location_of("src"), Some(UniformLocation(3)));
        assert_eq!(layout.location_of("nope"), None);
        assert!(matches!(
            layout.slot(UniformLocation(3)),
            Some(SlotRef::Sampler(0, _))
        ));
    }

    #[test]
    fn compiled_pass_converts_to_wgsl() {
        let compiled = compile_fragment_glsl(PASS).unwrap();
        let wgsl = compiled.to_wgsl().unwrap();
        assert!(wgsl.contains("@fragment"));
        assert!(validate_wgsl(&wgsl).is_ok());
    }

    #[test]
    fn parse_errors_report_the_offending_line() {
        let source = "#version 450\nlayout(location = 0) out vec4 out_color;\nvoid main() {\n    out_color = undefined_thing;\n}\n";
        let err = compile_fragment_glsl(source).unwrap_err();
        assert_eq!(err.line, Some(4));
        assert!(!err.message.is_empty());
    }

    #[test]
    fn invalid_wgsl_is_rejected() {
        let err = validate_wgsl("fn broken() -> { }").unwrap_err();
        assert!(format!("{err:#}").contains("   1 | fn broken"));
    }
}
