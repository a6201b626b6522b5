//! sr-net: Wire formats and UDP receivers for the ScreamRouter audio engine
//!
//! Covers the three ingress variants (RTP-Scream, raw Scream, per-process
//! Scream) and the header codecs shared with the egress path.

mod error;
mod receiver;
mod rtp;
mod scream;

pub use error::*;
pub use receiver::*;
pub use rtp::*;
pub use scream::*;
