// src/core/protocol/mod.rs

pub mod frame;
pub mod value;

pub use frame::{Frame, FrameCodec, Verb, PROTOCOL_VERSION};
pub use value::Value;
