//! Wire types for the pluggable state-store contract spoken between the
//! sidecar and pgstate.
//!
//! The protobuf source of truth is `proto/statestore/v1/statestore.proto` at
//! the repository root. The generated module is checked in (regenerate with
//! `tonic-build` on proto changes) so that building the workspace does not
//! require a `protoc` toolchain.

#[path = "statestore.v1.rs"]
pub mod v1;
