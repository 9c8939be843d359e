//! Frame-graph core: source assembly, pass compilation, the image cache and
//! the per-frame executor.
//!
//! - `source_assembler`: concatenation with generated-to-script line mapping
//! - `glsl_dialect`: lays a pass descriptor out as a GLSL 450 fragment program
//! - `validation`: naga parsing, validation and resource reflection
//! - `pass_compiler`: the name-keyed pass table with skip-if-unchanged rebuilds
//! - `resource_cache`: logical image ids to backing textures
//! - `blend`: fixed-function blend states per blend mode
//! - `executor`: invocation execution and the display composite
//! - `present`: the composite pass itself

pub mod blend;
pub mod executor;
pub mod glsl_dialect;
pub mod pass_compiler;
pub mod present;
pub mod resource_cache;
pub mod source_assembler;
pub mod validation;

pub use executor::{FrameOutcome, FrameReport};
pub use pass_compiler::{CompileOutcome, Pass, PassTable};
pub use resource_cache::{AllocatedImage, DISPLAY_IMAGE_ID, ResourceCache};
pub use source_assembler::SourceAssembler;
