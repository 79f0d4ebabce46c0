//! wd-protocol: Shared types for the warden sandbox pipeline.
//!
//! This crate defines the capturable operation vocabulary and the
//! line-delimited JSON protocol spoken between the sandbox controller and
//! the sandboxed interpreter.

pub mod operation;
pub mod wire;

pub use operation::{
    display_argv, normalize_path, preview, Endpoint, Operation, OperationKind, StagedContent,
    Target, PREVIEW_LIMIT,
};
pub use wire::{
    Encoding, Errno, ExecOutput, ProtocolError, Reply, Request, Stream, MAX_REQUEST_BYTES,
    PROTOCOL_VERSION,
};
