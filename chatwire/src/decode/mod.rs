//! Response decoding: wire payloads into ordered delta events.

mod line;
mod stream;

pub use stream::{decode_body, DecodeEvent, StreamDecoder, WireShape};
