pub mod compiler;
pub mod config;
pub mod context;
pub mod errors;
pub mod gpu;
pub mod inbox;
pub mod protocol;
pub mod renderer;
pub mod runtime;

pub use compiler::{JsonBridge, JsonCompiler, ReplayBundle, ReplayCompiler, ScriptCompiler};
pub use config::RuntimeConfig;
pub use gpu::{GpuBackend, RecordingBackend, WgpuBackend};
pub use runtime::{Runtime, RuntimeState};
