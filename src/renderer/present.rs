//! Composite of the display image onto the output surface.

use crate::protocol::{BlendMode, NamedType, ShaderDesc, SourceText};

pub const PRESENT_PASS: &str = "@present";

const PRESENT_BODY: &str = "out_color = vec4(pow(clamp(texelFetch(tex, ivec2(gl_FragCoord.xy), 0).rgb, vec3(0.0), vec3(1.0)), vec3(1.0 / 2.2)), 1.0);";

/// Gamma-encodes the linear display image, alpha forced to one.
pub fn present_pass_desc() -> ShaderDesc {
    ShaderDesc {
        name: PRESENT_PASS.to_string(),
        includes: Vec::new(),
        uniforms: Vec::new(),
        samplers: vec![NamedType::new("tex", "sampler2D")],
        outs: vec![NamedType::new("out_color", "vec4")],
        body: SourceText {
            text: PRESENT_BODY.to_string(),
            start: 0,
        },
        blend_mode: BlendMode::Opaque,
    }
}

/// CPU counterpart of the composite, for checking read-backs.
pub fn gamma_encode(linear: f32) -> f32 {
    linear.clamp(0.0, 1.0).powf(1.0 / 2.2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::glsl_dialect::assemble_pass;
    use crate::renderer::validation::compile_fragment_glsl;

    #[test]
    fn present_pass_compiles() {
        let asm = assemble_pass(&present_pass_desc(), &[]);
        let compiled = compile_fragment_glsl(asm.result_text()).unwrap();
        assert_eq!(compiled.layout.samplers[0].name, "tex");
        assert_eq!(compiled.layout.outputs, [0]);
    }

    #[test]
    fn gamma_clamps_and_encodes() {
        assert_eq!(gamma_encode(2.0), 1.0);
        assert_eq!(gamma_encode(-1.0), 0.0);
        assert!((gamma_encode(0.5) - 0.7297).abs() < 1e-3);
    }
}
