//! Wire and sample codecs
//!
//! `frame` and `handshake` cover the socket protocol, `pcm` converts
//! between the capture formats and the 16-bit samples the effects use.

pub mod frame;
pub mod handshake;
pub mod pcm;

pub use frame::{decode_message, encode_message, FrameReader, FrameWriter};
pub use handshake::{accept_handshake, initiate_handshake};
