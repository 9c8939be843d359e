//! Assembles a [`ShaderDesc`] into a complete GLSL 450 fragment program.

use std::fmt::Write;

use crate::protocol::{NamedType, ShaderDeclaration, ShaderDesc};
use crate::renderer::source_assembler::SourceAssembler;
use crate::renderer::validation::{SAMPLER_GROUP, SAMPLER_SUFFIX, TEXTURE_SUFFIX, UNIFORM_GROUP};

pub const PREAMBLE: &str = "#version 450\n";

/// `sampler2D` -> `texture2D`, `usampler3D` -> `utexture3D`.
pub fn texture_type_for(sampler_type: &str) -> String {
    sampler_type.replacen("sampler", "texture", 1)
}

fn outputs_block(outs: &[NamedType]) -> String {
    let mut s = String::new();
    for (i, out) in outs.iter().enumerate() {
        let _ = writeln!(s, "layout(location = {i}) out {} {};", out.ty, out.name);
    }
    s
}

fn uniforms_block(uniforms: &[NamedType]) -> String {
    if uniforms.is_empty() {
        return String::new();
    }
    let mut s = format!(
        "layout(set = {UNIFORM_GROUP}, binding = 0, std140) uniform PassUniforms {{\n"
    );
    for u in uniforms {
        let _ = writeln!(s, "    {} {};", u.ty, u.name);
    }
    s.push_str("};\n");
    s
}

fn samplers_block(samplers: &[NamedType]) -> String {
    let mut s = String::new();
    for (i, sampler) in samplers.iter().enumerate() {
        let name = &sampler.name;
        let texture_binding = 2 * i;
        let _ = writeln!(
            s,
            "layout(set = {SAMPLER_GROUP}, binding = {texture_binding}) uniform {} {name}{TEXTURE_SUFFIX};",
            texture_type_for(&sampler.ty)
        );
        let _ = writeln!(
            s,
            "layout(set = {SAMPLER_GROUP}, binding = {}) uniform sampler {name}{SAMPLER_SUFFIX};",
            texture_binding + 1
        );
        let _ = writeln!(
            s,
            "#define {name} {}({name}{TEXTURE_SUFFIX}, {name}{SAMPLER_SUFFIX})",
            sampler.ty
        );
    }
    s
}

/// Lay out the full program for `desc`, pulling include bodies out of
/// `declarations`. Includes with no matching declaration are left out; the
/// front end reports whatever then goes unresolved.
pub fn assemble_pass(desc: &ShaderDesc, declarations: &[ShaderDeclaration]) -> SourceAssembler {
    let mut asm = SourceAssembler::new();
    asm.add_non_source_block(PREAMBLE);

    for include in &desc.includes {
        match declarations.iter().find(|d| &d.name == include) {
            Some(decl) => asm.add_source_block(&decl.body.text, decl.body.start),
            None => log::warn!(
                "pass `{}` includes unknown declaration `{include}`",
                desc.name
            ),
        }
    }

    asm.add_non_source_block(&outputs_block(&desc.outs));
    asm.add_non_source_block(&uniforms_block(&desc.uniforms));
    asm.add_non_source_block(&samplers_block(&desc.samplers));
    asm.add_non_source_block("void main() {\n");
    asm.add_source_block(&desc.body.text, desc.body.start);
    asm.add_non_source_block("}\n");
    asm
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BlendMode, SourceText};
    use crate::renderer::validation::compile_fragment_glsl;

    fn desc() -> ShaderDesc {
        ShaderDesc {
            name: "tint".to_string(),
            includes: vec!["helpers".to_string()],
            uniforms: vec![NamedType::new("amount", "float")],
            samplers: vec![NamedType::new("src", "sampler2D")],
            outs: vec![NamedType::new("out_color", "vec4")],
            body: SourceText {
                text: "out_color = shade(texelFetch(src, ivec2(gl_FragCoord.xy), 0), amount);"
                    .to_string(),
                start: 12,
            },
            blend_mode: BlendMode::Opaque,
        }
    }

    fn helpers() -> Vec<ShaderDeclaration> {
        vec![
            ShaderDeclaration {
                name: "helpers".to_string(),
                body: SourceText {
                    text: "vec4 shade(vec4 c, float k) {\n    return c * k;\n}".to_string(),
                    start: 3,
                },
            },
            ShaderDeclaration {
                name: "helpers".to_string(),
                body: SourceText {
                    text: "this would not compile".to_string(),
                    start: 40,
                },
            },
        ]
    }

    #[test]
    fn sampler_types_map_to_texture_types() {
        assert_eq!(texture_type_for("sampler2D"), "texture2D");
        assert_eq!(texture_type_for("isampler2D"), "itexture2D");
        assert_eq!(texture_type_for("usampler3D"), "utexture3D");
    }

    #[test]
    fn assembled_pass_compiles_and_maps_lines() {
        let asm = assemble_pass(&desc(), &helpers());
        let text = asm.result_text();
        assert!(text.starts_with(PREAMBLE));
        // First declaration with the name wins.
        assert!(!text.contains("this would not compile"));
        assert!(text.contains("#define src sampler2D(src_texture, src_sampler)"));

        assert_eq!(asm.source_line(2), Some(3));
        let body_line = text
            .lines()
            .position(|l| l.starts_with("out_color = shade"))
            .unwrap() as u32
            + 1;
        assert_eq!(asm.source_line(body_line), Some(12));

        let compiled = compile_fragment_glsl(text).unwrap();
        assert_eq!(compiled.layout.uniforms.len(), 1);
        assert_eq!(compiled.layout.samplers[0].name, "src");
        assert_eq!(compiled.layout.outputs, [0]);
    }

    #[test]
    fn pass_without_uniforms_or_samplers_still_compiles() {
        let mut d = desc();
        d.includes.clear();
        d.uniforms.clear();
        d.samplers.clear();
        d.body.text = "out_color = vec4(1.0, 0.5, 0.25, 1.0);".to_string();
        let asm = assemble_pass(&d, &[]);
        let compiled = compile_fragment_glsl(asm.result_text()).unwrap();
        assert!(compiled.layout.uniforms.is_empty());
        assert_eq!(compiled.layout.block_size, 0);
    }
}
