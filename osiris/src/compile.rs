//! The compiler: turns a validated OML document plus profile/parameters
//! into an immutable, fingerprinted artifact set.

pub mod compiler;
pub mod emit;
pub mod manifest;

pub use compiler::{compile, CompileError, CompileMeta, CompileRequest, CompileResult};
pub use emit::{emit, EmitError};
pub use manifest::{
    FingerprintBlock, Manifest, ManifestMeta, ManifestStep, PipelineBlock, Toolchain,
    MANIFEST_VERSION,
};
