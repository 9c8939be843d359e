use serde::{Deserialize, Serialize};

use crate::protocol::{Extent, PixelFormat};

pub const SWAPCHAIN_SIZE_INPUT: &str = "@swapchain_size";
pub const TIME_INPUT: &str = "@time";

/// Knobs for a [`crate::runtime::Runtime`]. Every field has a default, so a
/// partial JSON object (or `{}`) is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Format of the id 0 display image the script renders into.
    pub display_format: PixelFormat,
    /// Color the output surface is cleared to before compositing.
    pub clear_color: [f32; 4],
    pub swapchain_size_input: String,
    pub time_input: String,
    pub thumbnail_size: Extent,
    /// Capture a thumbnail whenever `tick` applies a new script.
    pub thumbnail_on_load: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            display_format: PixelFormat::Rgba16f,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            swapchain_size_input: SWAPCHAIN_SIZE_INPUT.to_string(),
            time_input: TIME_INPUT.to_string(),
            thumbnail_size: Extent::new(32, 32),
            thumbnail_on_load: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: RuntimeConfig =
            serde_json::from_str(r#"{"display_format": "rgba32f"}"#).unwrap();
        assert_eq!(cfg.display_format, PixelFormat::Rgba32f);
        assert_eq!(cfg.time_input, "@time");
        assert_eq!(cfg.thumbnail_size, Extent::new(32, 32));
        assert!(cfg.thumbnail_on_load);
    }
}
