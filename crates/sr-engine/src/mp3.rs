//! MP3 tee for sink mixers
//!
//! The mixed payload runs through an independent preprocessor chain pinned
//! to 48 kHz/16-bit/stereo and then into a streaming LAME encoder. Encoded
//! frames land on the sink's MP3 queue for external polling. Any encoder
//! failure permanently disables the tee for that sink; the UDP path is
//! unaffected.

use std::mem::MaybeUninit;

use mp3lame_encoder::{Bitrate, Builder, Encoder, FlushNoGap, InterleavedPcm, Quality};
use sr_core::{AudioFormat, EQ_FLAT, EncodedMp3Data, PacketQueue};
use sr_dsp::DspChain;

use crate::{EngineError, EngineResult};

/// Fixed preprocessor output everything is encoded at.
fn mp3_format() -> AudioFormat {
    AudioFormat::new(48_000, 16, 2)
}

/// Map a CBR kbps figure onto the LAME bitrate ladder.
fn select_bitrate(bitrate_kbps: u32) -> Bitrate {
    match bitrate_kbps {
        0..=96 => Bitrate::Kbps96,
        97..=112 => Bitrate::Kbps112,
        113..=128 => Bitrate::Kbps128,
        129..=160 => Bitrate::Kbps160,
        161..=192 => Bitrate::Kbps192,
        193..=224 => Bitrate::Kbps224,
        225..=256 => Bitrate::Kbps256,
        _ => Bitrate::Kbps320,
    }
}

/// Streaming MP3 encoder plus its preprocessor chain, owned by one mixer
/// thread.
pub struct Mp3Pipeline {
    chain: DspChain,
    encoder: Encoder,
    queue: PacketQueue<EncodedMp3Data>,
    pcm: Vec<i32>,
    interleaved: Vec<i16>,
    mp3_buffer: Vec<MaybeUninit<u8>>,
}

impl Mp3Pipeline {
    pub fn new(
        sink_format: AudioFormat,
        bitrate_kbps: u32,
        queue: PacketQueue<EncodedMp3Data>,
    ) -> EngineResult<Self> {
        let chain = DspChain::new(sink_format, mp3_format(), 1.0, EQ_FLAT, Default::default())?;

        let mut builder =
            Builder::new().ok_or_else(|| EngineError::Mp3Encoder("failed to create LAME builder".into()))?;
        builder
            .set_sample_rate(mp3_format().sample_rate)
            .map_err(|e| EngineError::Mp3Encoder(format!("invalid sample rate: {e:?}")))?;
        builder
            .set_num_channels(mp3_format().channels)
            .map_err(|e| EngineError::Mp3Encoder(format!("invalid channel count: {e:?}")))?;
        builder
            .set_brate(select_bitrate(bitrate_kbps))
            .map_err(|e| EngineError::Mp3Encoder(format!("invalid bitrate: {e:?}")))?;
        builder
            .set_quality(Quality::Best)
            .map_err(|e| EngineError::Mp3Encoder(format!("failed to set quality: {e:?}")))?;
        let encoder = builder
            .build()
            .map_err(|e| EngineError::Mp3Encoder(format!("failed to build encoder: {e:?}")))?;

        Ok(Self {
            chain,
            encoder,
            queue,
            pcm: Vec::new(),
            interleaved: Vec::new(),
            mp3_buffer: Vec::new(),
        })
    }

    /// Run one mixed payload through the preprocessor and encoder.
    pub fn encode_payload(&mut self, payload: &[u8]) -> EngineResult<()> {
        self.pcm.clear();
        self.chain.process_packet(payload, &mut self.pcm)?;
        if self.pcm.is_empty() {
            return Ok(());
        }

        self.interleaved.clear();
        self.interleaved.extend(self.pcm.iter().map(|&s| (s >> 16) as i16));

        // MP3 worst case: 1.25x the sample count plus 7200 bytes.
        let max_output = self.interleaved.len() * 5 / 4 + 7200;
        self.mp3_buffer.clear();
        self.mp3_buffer.resize(max_output, MaybeUninit::uninit());

        let encoded = self
            .encoder
            .encode(InterleavedPcm(&self.interleaved), &mut self.mp3_buffer)
            .map_err(|e| EngineError::Mp3Encoder(format!("encode failed: {e:?}")))?;

        if encoded > 0 {
            let bytes: Vec<u8> = self.mp3_buffer[..encoded]
                .iter()
                .map(|m| unsafe { m.assume_init() })
                .collect();
            self.queue.push(EncodedMp3Data { bytes });
        }
        Ok(())
    }

    /// Drain the encoder's tail into a final frame.
    pub fn finish(&mut self) {
        self.mp3_buffer.clear();
        self.mp3_buffer.resize(7200, MaybeUninit::uninit());
        match self.encoder.flush::<FlushNoGap>(&mut self.mp3_buffer) {
            Ok(flushed) if flushed > 0 => {
                let bytes: Vec<u8> = self.mp3_buffer[..flushed]
                    .iter()
                    .map(|m| unsafe { m.assume_init() })
                    .collect();
                self.queue.push(EncodedMp3Data { bytes });
            }
            Ok(_) => {}
            Err(e) => log::warn!("mp3 flush failed: {e:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sr_core::CHUNK_SIZE_BYTES;

    #[test]
    fn encodes_sine_payloads_into_frames() {
        let queue = PacketQueue::new("mp3", 64);
        let mut pipeline = match Mp3Pipeline::new(AudioFormat::default(), 192, queue.clone()) {
            Ok(p) => p,
            // LAME may be unavailable in minimal build environments; the
            // engine treats that as a disabled tee.
            Err(e) => {
                eprintln!("skipping: {e}");
                return;
            }
        };

        // Feed about half a second of a 440 Hz tone.
        let mut sent = 0usize;
        for packet in 0..80 {
            let mut payload = Vec::with_capacity(CHUNK_SIZE_BYTES);
            for n in 0..288 {
                let t = (packet * 288 + n) as f64 / 48_000.0;
                let v = (2.0 * std::f64::consts::PI * 440.0 * t).sin();
                let s = (v * 20_000.0) as i16;
                payload.extend_from_slice(&s.to_le_bytes());
                payload.extend_from_slice(&s.to_le_bytes());
            }
            pipeline.encode_payload(&payload).unwrap();
            sent += 1;
        }
        pipeline.finish();
        assert_eq!(sent, 80);

        let mut total_bytes = 0usize;
        while let Some(frame) = queue.try_pop() {
            total_bytes += frame.bytes.len();
        }
        assert!(total_bytes > 1000, "expected MP3 output, got {total_bytes} bytes");
    }

    #[test]
    fn bitrate_ladder_selection() {
        assert!(matches!(select_bitrate(64), Bitrate::Kbps96));
        assert!(matches!(select_bitrate(192), Bitrate::Kbps192));
        assert!(matches!(select_bitrate(999), Bitrate::Kbps320));
    }
}
