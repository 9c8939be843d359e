use wgpu::{BlendComponent, BlendFactor, BlendOperation, BlendState};

use crate::protocol::BlendMode;

const fn add(src_factor: BlendFactor, dst_factor: BlendFactor) -> BlendComponent {
    BlendComponent {
        src_factor,
        dst_factor,
        operation: BlendOperation::Add,
    }
}

/// Fixed-function state for a pass blend mode. Alpha blending is straight
/// (non-premultiplied) on color and "over" on alpha.
pub fn blend_state_for(mode: BlendMode) -> BlendState {
    match mode {
        BlendMode::Opaque => BlendState {
            color: add(BlendFactor::One, BlendFactor::Zero),
            alpha: add(BlendFactor::One, BlendFactor::Zero),
        },
        BlendMode::Alphablend => BlendState {
            color: add(BlendFactor::SrcAlpha, BlendFactor::OneMinusSrcAlpha),
            alpha: add(BlendFactor::One, BlendFactor::OneMinusSrcAlpha),
        },
        BlendMode::Additive => BlendState {
            color: add(BlendFactor::One, BlendFactor::One),
            alpha: add(BlendFactor::One, BlendFactor::One),
        },
        BlendMode::Multiplicative => BlendState {
            color: add(BlendFactor::Dst, BlendFactor::Zero),
            alpha: add(BlendFactor::DstAlpha, BlendFactor::Zero),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_is_replace() {
        assert_eq!(blend_state_for(BlendMode::Opaque), BlendState::REPLACE);
    }

    #[test]
    fn factor_pairs_match_modes() {
        let alpha = blend_state_for(BlendMode::Alphablend);
        assert_eq!(alpha.color.src_factor, BlendFactor::SrcAlpha);
        assert_eq!(alpha.color.dst_factor, BlendFactor::OneMinusSrcAlpha);
        assert_eq!(alpha.alpha.src_factor, BlendFactor::One);
        assert_eq!(alpha.alpha.dst_factor, BlendFactor::OneMinusSrcAlpha);

        let mul = blend_state_for(BlendMode::Multiplicative);
        assert_eq!(mul.color.src_factor, BlendFactor::Dst);
        assert_eq!(mul.alpha.src_factor, BlendFactor::DstAlpha);
        assert_eq!(mul.alpha.dst_factor, BlendFactor::Zero);

        let additive = blend_state_for(BlendMode::Additive);
        assert_eq!(additive.color, add(BlendFactor::One, BlendFactor::One));
        assert_eq!(additive.alpha.operation, BlendOperation::Add);
    }
}
