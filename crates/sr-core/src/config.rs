//! Immutable configuration bundles.
//!
//! Configs identify an instance by a unique string ID and carry its target
//! format plus initial DSP state. Mutable per-instance state changes flow
//! through [`crate::ControlCommand`] afterwards.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::{AudioFormat, EQ_BANDS, EQ_FLAT, SpeakerLayout};

fn default_volume() -> f32 {
    1.0
}

fn flat_eq() -> [f32; EQ_BANDS] {
    EQ_FLAT
}

/// Wire protocol a sink emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkProtocol {
    Scream,
    Rtp,
}

/// Engine-wide settings fixed at initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retention window of the timeshift buffer.
    pub timeshift_buffer_duration_sec: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeshift_buffer_duration_sec: 300.0,
        }
    }
}

/// User-facing description of a source routing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source tag to subscribe to (sender IP, or `ip:process`).
    pub source_tag: String,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default = "flat_eq")]
    pub eq: [f32; EQ_BANDS],
    /// Extra per-source delay in milliseconds.
    #[serde(default)]
    pub delay_ms: u32,
    /// Timeshift in seconds; negative values play into the past.
    #[serde(default)]
    pub timeshift_sec: f32,
    /// Speaker mix layouts keyed by input channel count.
    #[serde(default)]
    pub speaker_layouts: HashMap<u8, SpeakerLayout>,
}

impl SourceConfig {
    pub fn new(source_tag: impl Into<String>) -> Self {
        Self {
            source_tag: source_tag.into(),
            volume: 1.0,
            eq: EQ_FLAT,
            delay_ms: 0,
            timeshift_sec: 0.0,
            speaker_layouts: HashMap::new(),
        }
    }
}

/// Full per-instance bundle for one source processor: the user config plus
/// the instance identity and the target output format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceProcessorConfig {
    /// Unique instance ID assigned by the manager.
    pub instance_id: String,
    pub source_tag: String,
    /// Output format every emitted chunk is converted to.
    pub output_format: AudioFormat,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default = "flat_eq")]
    pub eq: [f32; EQ_BANDS],
    #[serde(default)]
    pub delay_ms: u32,
    #[serde(default)]
    pub timeshift_sec: f32,
    #[serde(default)]
    pub speaker_layouts: HashMap<u8, SpeakerLayout>,
}

impl SourceProcessorConfig {
    pub fn from_source(instance_id: impl Into<String>, src: &SourceConfig, output_format: AudioFormat) -> Self {
        Self {
            instance_id: instance_id.into(),
            source_tag: src.source_tag.clone(),
            output_format,
            volume: src.volume,
            eq: src.eq,
            delay_ms: src.delay_ms,
            timeshift_sec: src.timeshift_sec,
            speaker_layouts: src.speaker_layouts.clone(),
        }
    }
}

/// User-facing description of an output sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Unique sink ID.
    pub sink_id: String,
    /// UDP destination for outbound frames.
    pub destination: SocketAddr,
    pub protocol: SinkProtocol,
    pub output_format: AudioFormat,
    /// SSRC stamped on outbound RTP frames.
    #[serde(default)]
    pub ssrc: u32,
    /// Enable the MP3 tee for this sink.
    #[serde(default)]
    pub enable_mp3: bool,
    /// CBR bitrate of the MP3 tee.
    #[serde(default = "default_mp3_bitrate")]
    pub mp3_bitrate_kbps: u32,
    /// Participate in multi-sink synchronization.
    #[serde(default)]
    pub sync_enabled: bool,
}

fn default_mp3_bitrate() -> u32 {
    192
}

impl SinkConfig {
    pub fn new(sink_id: impl Into<String>, destination: SocketAddr, protocol: SinkProtocol) -> Self {
        Self {
            sink_id: sink_id.into(),
            destination,
            protocol,
            output_format: AudioFormat::default(),
            ssrc: 0,
            enable_mp3: false,
            mp3_bitrate_kbps: 192,
            sync_enabled: false,
        }
    }
}

/// Full per-instance bundle for one sink mixer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkMixerConfig {
    pub sink_id: String,
    pub destination: SocketAddr,
    pub protocol: SinkProtocol,
    pub output_format: AudioFormat,
    pub ssrc: u32,
    /// How long a gather cycle waits for stragglers before mixing silence
    /// in their place.
    pub grace_period_ms: u64,
    pub enable_mp3: bool,
    pub mp3_bitrate_kbps: u32,
    pub sync_enabled: bool,
    /// Barrier wait bound when synchronization is on.
    pub barrier_timeout_ms: u64,
}

impl SinkMixerConfig {
    pub fn from_sink(sink: &SinkConfig) -> Self {
        Self {
            sink_id: sink.sink_id.clone(),
            destination: sink.destination,
            protocol: sink.protocol,
            output_format: sink.output_format,
            ssrc: sink.ssrc,
            grace_period_ms: 45,
            enable_mp3: sink.enable_mp3,
            mp3_bitrate_kbps: sink.mp3_bitrate_kbps,
            sync_enabled: sink.sync_enabled,
            barrier_timeout_ms: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_config_json_roundtrip() {
        let mut cfg = SourceConfig::new("192.168.1.10");
        cfg.speaker_layouts.insert(2, SpeakerLayout::identity());
        let json = serde_json::to_string(&cfg).unwrap();
        let back: SourceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.source_tag, cfg.source_tag);
        assert_eq!(back.speaker_layouts.len(), 1);
    }

    #[test]
    fn sink_defaults() {
        let sink = SinkConfig::new("office", "127.0.0.1:4010".parse().unwrap(), SinkProtocol::Scream);
        let mixer = SinkMixerConfig::from_sink(&sink);
        assert_eq!(mixer.grace_period_ms, 45);
        assert_eq!(mixer.barrier_timeout_ms, 10);
        assert!(!mixer.sync_enabled);
    }
}
