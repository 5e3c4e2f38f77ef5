//! Text post-processing for streamed generation: byte reassembly and stop
//! string detection.

mod stop;
mod utf8;

pub use stop::{StopMatch, StopMatcher};
pub use utf8::Utf8Reassembler;
