//! sr-core: Shared types for the ScreamRouter audio engine
//!
//! This crate provides the foundational types used across all engine crates:
//! audio formats, packet and chunk records, speaker layouts and channel
//! masks, configuration bundles, control commands, and the bounded queues
//! every pipeline stage communicates through.

mod command;
mod config;
mod error;
mod format;
mod layout;
mod packet;
mod queue;

pub use command::*;
pub use config::*;
pub use error::*;
pub use format::*;
pub use layout::*;
pub use packet::*;
pub use queue::*;

/// PCM payload size of every Scream frame, in bytes.
pub const CHUNK_SIZE_BYTES: usize = 1152;

/// Samples in one processed chunk: 1152 bytes at the nominal 16-bit output,
/// so downscaling a chunk yields exactly one network payload.
pub const OUTPUT_CHUNK_SAMPLES: usize = 576;

/// Mixing accumulator length, matches [`OUTPUT_CHUNK_SAMPLES`].
pub const SINK_MIXING_BUFFER_SAMPLES: usize = 576;

/// Raw Scream header size in bytes.
pub const SCREAM_HEADER_SIZE: usize = 5;

/// RTP header size in bytes (no extensions, no CSRC).
pub const RTP_HEADER_SIZE: usize = 12;

/// RTP payload type carrying Scream PCM.
pub const RTP_PAYLOAD_TYPE: u8 = 127;

/// Process-tag prefix length of the per-process Scream variant.
pub const PROCESS_TAG_SIZE: usize = 30;

/// Maximum channels the mix matrix addresses.
pub const MAX_CHANNELS: usize = 8;

/// Number of graphic EQ bands.
pub const EQ_BANDS: usize = 18;

/// Maximum CSRC entries an RTP header can carry.
pub const MAX_CSRC: usize = 15;

/// Flat EQ (all bands at unity gain).
pub const EQ_FLAT: [f32; EQ_BANDS] = [1.0; EQ_BANDS];
