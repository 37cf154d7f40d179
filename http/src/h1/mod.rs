//! http/1 specific module for types and protocol utilities.

pub mod codec;
pub mod dispatcher;

mod context;
mod decode;
mod error;

pub(crate) mod encode;

pub use self::codec::{BodyCoding, BodySink, DecodeState};
pub use self::dispatcher::{Completion, Upgraded};
pub use self::error::ProtoError;

pub(crate) use self::decode::RequestHead;
