//! Wire codecs

pub mod json_frame;

pub use json_frame::{JsonFrameCodec, HEADER_LEN};
