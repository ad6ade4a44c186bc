//! # Osiris core library
//!
//! Osiris compiles declarative pipeline documents (OML) into deterministic,
//! fingerprinted manifests and executes them through pluggable drivers. The
//! same compiled manifest produces identical observable behavior whether the
//! steps run in-process ([`run::local`]) or inside an isolated sandbox
//! reached through a line-oriented command protocol ([`run::proxy`] and the
//! `osiris-worker` binary).
//!
//! The different binaries generated by this project consume this library.

pub mod canon;
pub mod compile;
pub mod components;
pub mod connections;
pub mod drivers;
pub mod oml;
pub mod run;
pub mod secrets;
pub mod session;
pub mod utils;
