//! Build-output streaming, diagnostics parsing and the build validator.

pub mod detect;
pub mod diagnostics;
pub mod streamer;
pub mod validator;

pub use detect::BuildSystem;
pub use diagnostics::{parse_build_output, summarize};
pub use streamer::StreamOutcome;
pub use validator::CommandValidator;
