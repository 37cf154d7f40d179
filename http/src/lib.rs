//! Embeddable asynchronous http/1.1 server engine.
//!
//! The crate provides the per-connection machinery a host application builds a
//! service upon: request parsing with online limit enforcement, synchronous
//! handler dispatch with a response builder, pipelined response ordering, a
//! write-group output engine with gather writes and file transfers, and a
//! coalesced tick timer subsystem. Listening/accepting lives in `quay-server`
//! and websocket framing in `quay-ws`.

#![forbid(unsafe_code)]

pub mod buffer;
pub mod config;
pub mod coordinator;
pub mod date;
pub mod error;
pub mod h1;
pub mod output;
pub mod request;
pub mod response;
pub mod timer;

/// re-export bytes crate as module.
pub use bytes;

pub use self::buffer::{FileTransfer, Notificator, WritableItem, WriteError, WriteGroup};
pub use self::config::ServerConfig;
pub use self::coordinator::{ConnectionAttr, ResponseCoordinator, ResponseFlags, ResponseParts};
pub use self::error::Error;
pub use self::request::{ChunkExt, ChunkInfo, ChunkedInput, Request};
pub use self::response::{HandleResult, Handler, OutputMode, ResponseBuilder};
