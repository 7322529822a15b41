//! Generated protobuf modules
//!
//! The code generated from `proto/ServerSideExtension.proto` is checked in under src/generated/
//! and only regenerated when `PROTO_CODE_GEN=1` is set for the build script.

/// Server-side extension protocol (`qlik.sse`) definitions
#[path = "generated/qlik.sse.rs"]
#[rustfmt::skip]
pub mod sse;
