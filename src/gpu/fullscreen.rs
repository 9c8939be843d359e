/// Vertex stage shared by every pass pipeline: one oversized triangle from
/// `vertex_index`, no vertex buffers.
pub const FULLSCREEN_VERTEX_WGSL: &str = r#"
@vertex
fn vs_main(@builtin(vertex_index) vertex_index: u32) -> @builtin(position) vec4<f32> {
    let x = f32((vertex_index << 1u) & 2u) * 2.0 - 1.0;
    let y = f32(vertex_index & 2u) * 2.0 - 1.0;
    return vec4<f32>(x, y, 0.0, 1.0);
}
"#;

pub const FULLSCREEN_VERTEX_ENTRY: &str = "vs_main";
pub const FRAGMENT_ENTRY: &str = "main";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::validation::validate_wgsl;

    #[test]
    fn vertex_stage_parses() {
        let module = validate_wgsl(FULLSCREEN_VERTEX_WGSL).unwrap();
        assert!(
            module
                .entry_points
                .iter()
                .any(|ep| ep.name == FULLSCREEN_VERTEX_ENTRY)
        );
    }
}
