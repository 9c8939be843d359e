//! The boundary to the external script compiler.
//!
//! The runtime never parses script text itself: it hands the text to a
//! [`ScriptCompiler`] on load and asks it to evaluate every frame. Compilers
//! that live behind a string interface (a wasm module, a child process) plug
//! in through [`JsonBridge`]; recorded compiler output replays through
//! [`ReplayCompiler`].

use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::protocol::{ContextInput, FrameResult, LoadResult, ScriptDiagnostic};

pub trait ScriptCompiler {
    /// Compile script text into declarations and pass descriptors.
    fn load(&mut self, script: &str) -> LoadResult;

    /// Evaluate the loaded script with the inputs resolved last frame.
    fn frame(&mut self, inputs: &[ContextInput]) -> FrameResult;
}

/// A compiler that speaks serialized JSON in both directions.
pub trait JsonBridge {
    fn load_json(&mut self, script: &str) -> String;
    fn frame_json(&mut self, inputs_json: &str) -> String;
}

/// Adapts a [`JsonBridge`] into a [`ScriptCompiler`]. Output that doesn't parse
/// is reported through the record's `error` field like any other failure.
pub struct JsonCompiler<B> {
    bridge: B,
}

impl<B: JsonBridge> JsonCompiler<B> {
    pub fn new(bridge: B) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> &B {
        &self.bridge
    }
}

fn malformed(what: &str, e: impl std::fmt::Display) -> ScriptDiagnostic {
    ScriptDiagnostic {
        line: 0,
        column: 0,
        description: format!("malformed {what} from compiler: {e}"),
    }
}

/// Records are JSON objects; serde would otherwise read `[]` as an empty
/// struct in sequence form.
fn parse_record<T: DeserializeOwned>(raw: &str, what: &str) -> Result<T, ScriptDiagnostic> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| malformed(what, e))?;
    if !value.is_object() {
        return Err(malformed(what, "expected a JSON object"));
    }
    serde_json::from_value(value).map_err(|e| malformed(what, e))
}

impl<B: JsonBridge> ScriptCompiler for JsonCompiler<B> {
    fn load(&mut self, script: &str) -> LoadResult {
        let raw = self.bridge.load_json(script);
        parse_record(&raw, "load result").unwrap_or_else(|error| LoadResult {
            error: Some(error),
            ..Default::default()
        })
    }

    fn frame(&mut self, inputs: &[ContextInput]) -> FrameResult {
        let inputs_json = match serde_json::to_string(inputs) {
            Ok(s) => s,
            Err(e) => {
                return FrameResult {
                    error: Some(malformed("frame inputs", e)),
                    ..Default::default()
                };
            }
        };
        let raw = self.bridge.frame_json(&inputs_json);
        parse_record(&raw, "frame result").unwrap_or_else(|error| FrameResult {
            error: Some(error),
            ..Default::default()
        })
    }
}

/// Pre-recorded compiler output: one load result and a cycle of frames.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayBundle {
    #[serde(default)]
    pub script: String,
    pub load: LoadResult,
    #[serde(default)]
    pub frames: Vec<FrameResult>,
}

impl ReplayBundle {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read replay bundle {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("invalid replay bundle json in {}", path.display()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReplayCompiler {
    bundle: ReplayBundle,
    next_frame: usize,
    received_inputs: Vec<Vec<ContextInput>>,
}

impl ReplayCompiler {
    pub fn new(bundle: ReplayBundle) -> Self {
        Self {
            bundle,
            next_frame: 0,
            received_inputs: Vec::new(),
        }
    }

    pub fn script(&self) -> &str {
        &self.bundle.script
    }

    /// Inputs passed to each `frame` call so far, oldest first.
    pub fn received_inputs(&self) -> &[Vec<ContextInput>] {
        &self.received_inputs
    }
}

impl ScriptCompiler for ReplayCompiler {
    fn load(&mut self, _script: &str) -> LoadResult {
        self.next_frame = 0;
        self.bundle.load.clone()
    }

    fn frame(&mut self, inputs: &[ContextInput]) -> FrameResult {
        self.received_inputs.push(inputs.to_vec());
        if self.bundle.frames.is_empty() {
            return FrameResult {
                error: Some(ScriptDiagnostic {
                    line: 0,
                    column: 0,
                    description: "replay bundle has no recorded frames".to_string(),
                }),
                ..Default::default()
            };
        }
        let frame = self.bundle.frames[self.next_frame % self.bundle.frames.len()].clone();
        self.next_frame += 1;
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Vec2;

    struct EchoBridge {
        load: String,
        frame: String,
        last_inputs: Option<String>,
    }

    impl JsonBridge for EchoBridge {
        fn load_json(&mut self, _script: &str) -> String {
            self.load.clone()
        }

        fn frame_json(&mut self, inputs_json: &str) -> String {
            self.last_inputs = Some(inputs_json.to_string());
            self.frame.clone()
        }
    }

    #[test]
    fn json_compiler_reports_malformed_output_as_error() {
        let mut compiler = JsonCompiler::new(EchoBridge {
            load: "{not json".to_string(),
            frame: "[]".to_string(),
            last_inputs: None,
        });
        let load = compiler.load("void main() {}");
        let err = load.error.expect("malformed load must carry an error");
        assert!(err.description.contains("malformed load result"));

        let frame = compiler.frame(&[]);
        assert!(frame.error.is_some());
    }

    #[test]
    fn json_compiler_rejects_non_object_records() {
        let mut compiler = JsonCompiler::new(EchoBridge {
            load: "[]".to_string(),
            frame: "null".to_string(),
            last_inputs: None,
        });
        let load = compiler.load("");
        let err = load.error.expect("array load result must be rejected");
        assert!(err.description.contains("expected a JSON object"));
        assert!(load.shader_descs.is_empty());

        let frame = compiler.frame(&[]);
        assert!(frame.error.is_some());
    }

    #[test]
    fn json_compiler_forwards_inputs_as_json() {
        let mut compiler = JsonCompiler::new(EchoBridge {
            load: r#"{"declarations": [], "shader_descs": []}"#.to_string(),
            frame: r#"{"context_requests": [], "shader_invocations": []}"#.to_string(),
            last_inputs: None,
        });
        assert!(compiler.load("").error.is_none());
        let frame = compiler.frame(&[ContextInput::UVec2 {
            name: "@swapchain_size".to_string(),
            value: Vec2 { x: 8, y: 8 },
        }]);
        assert!(frame.error.is_none());
        let sent = compiler.bridge().last_inputs.clone().unwrap();
        assert!(sent.contains("@swapchain_size"));
        assert!(sent.contains("uvec2"));
    }

    #[test]
    fn replay_cycles_recorded_frames() {
        let mut frames = vec![FrameResult::default(), FrameResult::default()];
        frames[1].error = Some(ScriptDiagnostic {
            line: 1,
            column: 1,
            description: "second".to_string(),
        });
        let mut compiler = ReplayCompiler::new(ReplayBundle {
            script: "x".to_string(),
            load: LoadResult::default(),
            frames,
        });
        compiler.load("x");
        assert!(compiler.frame(&[]).error.is_none());
        assert!(compiler.frame(&[]).error.is_some());
        assert!(compiler.frame(&[]).error.is_none());
        assert_eq!(compiler.received_inputs().len(), 3);
    }
}
