//! Error types.
//!
//! Nothing in here is fatal to the frame loop. Load and compile failures keep
//! the last good passes running, resource failures degrade one invocation,
//! and evaluation failures skip one frame.

use thiserror::Error;

use crate::protocol::{Extent, PixelFormat, ScriptDiagnostic};

/// The compiler rejected the script text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("script error at {line}:{column}: {description}")]
pub struct LoadError {
    pub line: u32,
    pub column: u32,
    pub description: String,
}

impl From<ScriptDiagnostic> for LoadError {
    fn from(d: ScriptDiagnostic) -> Self {
        Self {
            line: d.line,
            column: d.column,
            description: d.description,
        }
    }
}

/// A pass's assembled source failed to build. `line` is a script line, or 0
/// when the backend's line falls inside synthesized code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("pass `{pass}` failed to compile (line {line}): {message}")]
pub struct CompileError {
    pub pass: String,
    pub line: u32,
    pub message: String,
}

/// Per-frame evaluation failed; the frame is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("frame evaluation failed at {line}:{column}: {description}")]
pub struct EvaluationError {
    pub line: u32,
    pub column: u32,
    pub description: String,
}

impl From<ScriptDiagnostic> for EvaluationError {
    fn from(d: ScriptDiagnostic) -> Self {
        Self {
            line: d.line,
            column: d.column,
            description: d.description,
        }
    }
}

/// Locally contained failures while resolving images or running an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("failed to allocate image {id} ({format:?} {size}): {reason}")]
    AllocationFailed {
        id: u32,
        format: PixelFormat,
        size: Extent,
        reason: String,
    },
    #[error("invocation of `{pass}` references unknown pass")]
    UnknownPass { pass: String },
    #[error("missing image {id} for sampler {index} of `{pass}`")]
    MissingSamplerImage { pass: String, index: usize, id: u32 },
    #[error("missing image {id} for attachment {index} of `{pass}`")]
    MissingAttachmentImage { pass: String, index: usize, id: u32 },
    #[error("invocation of `{pass}` binds {bound} attachments, pass declares {declared}")]
    AttachmentCountMismatch {
        pass: String,
        declared: usize,
        bound: usize,
    },
    #[error("attachments of `{pass}` can't be of different size ({expected} vs {found})")]
    AttachmentSizeMismatch {
        pass: String,
        expected: Extent,
        found: Extent,
    },
    #[error("invocation of `{pass}` binds no attachments")]
    NoAttachments { pass: String },
    #[error("draw of `{pass}` failed: {reason}")]
    DrawFailed { pass: String, reason: String },
}

/// Failures reported by a [`crate::gpu::GpuBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GpuError {
    #[error("texture allocation failed: {0}")]
    Allocation(String),
    #[error("unknown {kind} handle {id}")]
    InvalidHandle { kind: &'static str, id: u32 },
    #[error("draw rejected: {0}")]
    Draw(String),
    #[error("read-back failed: {0}")]
    Readback(String),
}

/// A backend rejected a program. `line` is 1-based in the assembled text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ShaderCompileError {
    pub line: Option<u32>,
    pub message: String,
}

/// What `Runtime::load_script` reports when a script can't be fully applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("{} pass(es) failed to compile; first: {}", .0.len(), first_compile_error(.0))]
    Compile(Vec<CompileError>),
}

fn first_compile_error(errors: &[CompileError]) -> String {
    errors
        .first()
        .map(ToString::to_string)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_summary_names_first_failure() {
        let err = ScriptError::Compile(vec![
            CompileError {
                pass: "blur".to_string(),
                line: 12,
                message: "unknown identifier".to_string(),
            },
            CompileError {
                pass: "tonemap".to_string(),
                line: 0,
                message: "bad output".to_string(),
            },
        ]);
        let text = err.to_string();
        assert!(text.starts_with("2 pass(es) failed"));
        assert!(text.contains("`blur`"));
        assert!(text.contains("line 12"));
    }

    #[test]
    fn diagnostics_convert_into_load_errors() {
        let err: LoadError = ScriptDiagnostic {
            line: 4,
            column: 2,
            description: "expected `;`".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "script error at 4:2: expected `;`");
    }
}
