//! Packet and chunk records exchanged between pipeline stages.

use std::time::Instant;

use smallvec::SmallVec;

use crate::{AudioFormat, CHUNK_SIZE_BYTES, CoreError, CoreResult, OUTPUT_CHUNK_SAMPLES};

/// Inline capacity for SSRC/CSRC lists; most streams carry one entry.
pub type SsrcList = SmallVec<[u32; 4]>;

/// One raw inbound frame, tagged with its origin.
#[derive(Debug, Clone)]
pub struct TaggedAudioPacket {
    /// Sender identity, typically the source IP (or `ip:process` for the
    /// per-process variant).
    pub source_tag: String,
    /// Always exactly 1152 bytes of PCM.
    pub payload: Vec<u8>,
    /// Monotonic reception timestamp.
    pub received: Instant,
    /// RTP timestamp, when the frame arrived over RTP.
    pub rtp_timestamp: Option<u32>,
    /// SSRC plus any contributing sources.
    pub ssrcs: SsrcList,
    /// Declared PCM format of the payload.
    pub format: AudioFormat,
}

impl TaggedAudioPacket {
    pub fn new(source_tag: impl Into<String>, payload: Vec<u8>, format: AudioFormat) -> Self {
        Self {
            source_tag: source_tag.into(),
            payload,
            received: Instant::now(),
            rtp_timestamp: None,
            ssrcs: SsrcList::new(),
            format,
        }
    }

    /// Check the payload-size and format invariants.
    pub fn validate(&self) -> CoreResult<()> {
        if self.payload.len() != CHUNK_SIZE_BYTES {
            return Err(CoreError::InvalidPayloadSize {
                expected: CHUNK_SIZE_BYTES,
                got: self.payload.len(),
            });
        }
        self.format.validate()
    }
}

/// Output of a source processor: one fixed-length block of interleaved
/// 32-bit samples, one block per originating network frame.
#[derive(Debug, Clone)]
pub struct ProcessedAudioChunk {
    /// Exactly [`OUTPUT_CHUNK_SAMPLES`] interleaved samples.
    pub samples: Vec<i32>,
    /// SSRC/CSRC list carried forward from the source packet.
    pub ssrcs: SsrcList,
}

impl ProcessedAudioChunk {
    pub fn new(samples: Vec<i32>, ssrcs: SsrcList) -> Self {
        debug_assert_eq!(samples.len(), OUTPUT_CHUNK_SAMPLES);
        Self { samples, ssrcs }
    }

    /// A chunk of silence.
    pub fn silence() -> Self {
        Self {
            samples: vec![0; OUTPUT_CHUNK_SAMPLES],
            ssrcs: SsrcList::new(),
        }
    }
}

/// Opaque MP3 frame data produced by the sink encoder.
#[derive(Debug, Clone)]
pub struct EncodedMp3Data {
    pub bytes: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_validation() {
        let p = TaggedAudioPacket::new("10.0.0.1", vec![0u8; CHUNK_SIZE_BYTES], AudioFormat::default());
        assert!(p.validate().is_ok());

        let short = TaggedAudioPacket::new("10.0.0.1", vec![0u8; 100], AudioFormat::default());
        assert!(short.validate().is_err());
    }

    #[test]
    fn silence_chunk_len() {
        assert_eq!(ProcessedAudioChunk::silence().samples.len(), OUTPUT_CHUNK_SAMPLES);
    }
}
