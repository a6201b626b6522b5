//! Control commands and inter-component notifications.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::{EQ_BANDS, SpeakerLayout};

/// Per-source control command, drained non-blocking by the processor thread
/// each iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    SetVolume(f32),
    SetEq([f32; EQ_BANDS]),
    SetDelay(u32),
    SetTimeshift(f32),
    /// Replace the layout for one input-channel-count key.
    SetSpeakerMix {
        input_channel_key: u8,
        layout: SpeakerLayout,
    },
    /// Replace the whole layout map in one step.
    SetSpeakerLayouts(HashMap<u8, SpeakerLayout>),
}

/// Published by a receiver the first time it sees a source tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSourceNotification {
    pub source_tag: String,
}

/// Timing feedback a sink coordinator sends to the global clock after each
/// dispatch.
#[derive(Debug, Clone)]
pub struct SinkTimingReport {
    pub samples_output: u64,
    pub rtp_timestamp_output: u32,
    pub dispatch_time: Instant,
    pub had_underrun: bool,
    pub buffer_fill_percentage: f32,
}
