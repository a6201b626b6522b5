//! sr-engine: The ScreamRouter audio routing and mixing pipeline
//!
//! Dataflow: UDP receivers validate Scream/RTP framing and feed the
//! timeshift manager; per-source processors pull released packets, run the
//! DSP chain and fan out fixed-size chunks; per-sink mixers aggregate
//! chunks under a grace period and emit Scream or RTP frames over UDP,
//! optionally teeing the mix into a streaming MP3 encoder. An optional
//! global clock keeps multiple sinks dispatching in lockstep.
//!
//! The [`AudioManager`] owns every component and is the only place edges
//! are created, destroyed or re-wired.

mod error;
mod manager;
mod mixer;
mod mp3;
mod source;
mod sync;
mod thread_util;
mod timeshift;

pub use error::*;
pub use manager::*;
pub use mixer::*;
pub use mp3::*;
pub use source::*;
pub use sync::*;
pub use timeshift::*;
