//! Source input processor
//!
//! One thread per configured source instance. Each iteration drains the
//! command queue non-blocking, pops released packets from the timeshift
//! subscription queue, reconfigures the DSP chain when the inbound format
//! changes, and fans out fixed-size chunks to every connected sink queue.
//! Partial chunks are never emitted; residual samples wait for the next
//! packet.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use sr_core::{
    ControlCommand, OUTPUT_CHUNK_SAMPLES, PacketQueue, ProcessedAudioChunk,
    SourceProcessorConfig, SsrcList, TaggedAudioPacket,
};
use sr_dsp::DspChain;

use crate::thread_util::join_with_timeout;
use crate::timeshift::{TimeshiftCommand, TimeshiftHandle};
use crate::{EngineError, EngineResult};

/// Input pop deadline; bounds stop latency without burning cycles.
const INPUT_POP_TIMEOUT: Duration = Duration::from_millis(20);

/// Capacity of the per-instance packet queue (a little under a second).
const INPUT_QUEUE_CAPACITY: usize = 128;

/// Capacity of the per-instance command queue.
const COMMAND_QUEUE_CAPACITY: usize = 64;

type OutputMap = HashMap<String, PacketQueue<ProcessedAudioChunk>>;

/// One source instance: a DSP path from a source tag to an output format.
pub struct SourceInputProcessor {
    config: SourceProcessorConfig,
    commands: PacketQueue<ControlCommand>,
    input: PacketQueue<TaggedAudioPacket>,
    outputs: Arc<Mutex<OutputMap>>,
    timeshift: TimeshiftHandle,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SourceInputProcessor {
    pub fn new(config: SourceProcessorConfig, timeshift: TimeshiftHandle) -> Self {
        let instance = &config.instance_id;
        Self {
            commands: PacketQueue::new(format!("cmd-{instance}"), COMMAND_QUEUE_CAPACITY),
            input: PacketQueue::new(format!("in-{instance}"), INPUT_QUEUE_CAPACITY),
            outputs: Arc::new(Mutex::new(HashMap::new())),
            timeshift,
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
            config,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn source_tag(&self) -> &str {
        &self.config.source_tag
    }

    /// Queue the timeshift manager releases packets into. Also the target
    /// for direct plugin injection.
    pub fn input_queue(&self) -> PacketQueue<TaggedAudioPacket> {
        self.input.clone()
    }

    /// Enqueue a control command; applied by the processing thread.
    pub fn send_command(&self, command: ControlCommand) {
        self.commands.push(command);
    }

    /// Attach one sink's input queue to this instance's fan-out set.
    pub fn add_output_queue(&self, sink_id: &str, queue: PacketQueue<ProcessedAudioChunk>) {
        self.outputs.lock().insert(sink_id.to_string(), queue);
    }

    pub fn remove_output_queue(&self, sink_id: &str) {
        self.outputs.lock().remove(sink_id);
    }

    /// Subscribe to the timeshift buffer and spawn the processing thread.
    pub fn start(&mut self) -> EngineResult<()> {
        if self.thread.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        let chain = DspChain::new(
            // Until the first packet arrives the input format is assumed to
            // match the output; the first packet reconfigures as needed.
            self.config.output_format,
            self.config.output_format,
            self.config.volume,
            self.config.eq,
            self.config.speaker_layouts.clone(),
        )?;

        self.timeshift.send(TimeshiftCommand::Subscribe {
            instance_id: self.config.instance_id.clone(),
            source_tag: self.config.source_tag.clone(),
            queue: self.input.clone(),
            timeshift_sec: self.config.timeshift_sec,
            delay_ms: self.config.delay_ms,
        })?;

        self.stop.store(false, Ordering::Release);
        let worker = ProcessorWorker {
            instance_id: self.config.instance_id.clone(),
            chain,
            commands: self.commands.clone(),
            input: self.input.clone(),
            outputs: Arc::clone(&self.outputs),
            timeshift: self.timeshift.clone(),
            process_buffer: Vec::with_capacity(OUTPUT_CHUNK_SAMPLES * 4),
            current_ssrcs: SsrcList::new(),
        };
        let stop = Arc::clone(&self.stop);

        let handle = thread::Builder::new()
            .name(format!("src-{}", self.config.instance_id))
            .spawn(move || worker.run(stop))
            .map_err(EngineError::Spawn)?;
        self.thread = Some(handle);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn join(&mut self, timeout: Duration) -> bool {
        match self.thread.take() {
            Some(handle) => {
                join_with_timeout(handle, timeout, &format!("src-{}", self.config.instance_id))
            }
            None => true,
        }
    }
}

struct ProcessorWorker {
    instance_id: String,
    chain: DspChain,
    commands: PacketQueue<ControlCommand>,
    input: PacketQueue<TaggedAudioPacket>,
    outputs: Arc<Mutex<OutputMap>>,
    timeshift: TimeshiftHandle,
    /// Accumulated interleaved output samples not yet chunked.
    process_buffer: Vec<i32>,
    current_ssrcs: SsrcList,
}

impl ProcessorWorker {
    fn run(mut self, stop: Arc<AtomicBool>) {
        loop {
            if stop.load(Ordering::Acquire) {
                break;
            }

            while let Some(command) = self.commands.try_pop() {
                self.apply_command(command);
            }

            if let Some(packet) = self.input.pop_timeout(INPUT_POP_TIMEOUT) {
                self.handle_packet(packet);
            }
        }
        log::debug!("source '{}' loop exited", self.instance_id);
    }

    fn apply_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::SetVolume(volume) => self.chain.set_volume(volume),
            ControlCommand::SetEq(gains) => self.chain.set_eq_gains(gains),
            ControlCommand::SetDelay(delay_ms) => {
                let _ = self.timeshift.send(TimeshiftCommand::SetDelay {
                    instance_id: self.instance_id.clone(),
                    delay_ms,
                });
            }
            ControlCommand::SetTimeshift(seconds) => {
                let _ = self.timeshift.send(TimeshiftCommand::SetTimeshift {
                    instance_id: self.instance_id.clone(),
                    seconds,
                });
            }
            ControlCommand::SetSpeakerMix {
                input_channel_key,
                layout,
            } => self.chain.set_layout_for_key(input_channel_key, layout),
            ControlCommand::SetSpeakerLayouts(layouts) => self.chain.set_layouts_map(layouts),
        }
    }

    /// Swap the DSP input path when the inbound format changes. A rebuild
    /// failure keeps the previous configuration.
    fn check_format_and_reconfigure(&mut self, packet: &TaggedAudioPacket) -> bool {
        if packet.format == self.chain.input_format() {
            return true;
        }
        match self.chain.reconfigure_input(packet.format) {
            Ok(()) => {
                log::info!(
                    "source '{}': input format now {}ch/{}Hz/{}bit",
                    self.instance_id,
                    packet.format.channels,
                    packet.format.sample_rate,
                    packet.format.bit_depth
                );
                true
            }
            Err(e) => {
                log::error!(
                    "source '{}': reconfigure failed ({e}), keeping previous format",
                    self.instance_id
                );
                false
            }
        }
    }

    fn handle_packet(&mut self, packet: TaggedAudioPacket) {
        if let Err(e) = packet.validate() {
            log::warn!("source '{}': dropped packet: {e}", self.instance_id);
            return;
        }
        if !self.check_format_and_reconfigure(&packet) {
            return;
        }

        self.current_ssrcs = packet.ssrcs.clone();
        if let Err(e) = self.chain.process_packet(&packet.payload, &mut self.process_buffer) {
            log::warn!("source '{}': processing failed: {e}", self.instance_id);
            return;
        }

        while self.process_buffer.len() >= OUTPUT_CHUNK_SAMPLES {
            let samples: Vec<i32> = self.process_buffer.drain(..OUTPUT_CHUNK_SAMPLES).collect();
            let chunk = ProcessedAudioChunk::new(samples, self.current_ssrcs.clone());
            let outputs = self.outputs.lock();
            for queue in outputs.values() {
                queue.push(chunk.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeshift::TimeshiftManager;
    use sr_core::{AudioFormat, CHUNK_SIZE_BYTES, EQ_FLAT, SpeakerLayout};

    fn processor_config(instance: &str) -> SourceProcessorConfig {
        SourceProcessorConfig {
            instance_id: instance.into(),
            source_tag: "10.0.0.9".into(),
            output_format: AudioFormat::default(),
            volume: 1.0,
            eq: EQ_FLAT,
            delay_ms: 0,
            timeshift_sec: 0.0,
            speaker_layouts: HashMap::new(),
        }
    }

    fn start_stack() -> (TimeshiftManager, SourceInputProcessor, PacketQueue<ProcessedAudioChunk>) {
        let mut timeshift = TimeshiftManager::new(Duration::from_secs(300));
        timeshift.start().unwrap();

        let mut processor = SourceInputProcessor::new(processor_config("inst-1"), timeshift.handle());
        let sink_queue = PacketQueue::new("sink-in", 64);
        processor.add_output_queue("sink-1", sink_queue.clone());
        processor.start().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        (timeshift, processor, sink_queue)
    }

    fn payload_with_value(value: i16) -> Vec<u8> {
        let mut payload = Vec::with_capacity(CHUNK_SIZE_BYTES);
        for _ in 0..CHUNK_SIZE_BYTES / 2 {
            payload.extend_from_slice(&value.to_le_bytes());
        }
        payload
    }

    #[test]
    fn passthrough_packet_becomes_one_chunk() {
        let (mut timeshift, mut processor, sink_queue) = start_stack();

        let packet = TaggedAudioPacket::new(
            "10.0.0.9",
            payload_with_value(1000),
            AudioFormat::default(),
        );
        timeshift.handle().add_packet(packet);

        let chunk = sink_queue
            .pop_timeout(Duration::from_secs(2))
            .expect("chunk should arrive");
        assert_eq!(chunk.samples.len(), OUTPUT_CHUNK_SAMPLES);
        assert!(chunk.samples.iter().all(|&s| s == 1000 << 16));

        processor.stop();
        assert!(processor.join(Duration::from_secs(1)));
        timeshift.stop();
        timeshift.join(Duration::from_secs(1));
    }

    #[test]
    fn format_change_reconfigures_and_resamples() {
        let (mut timeshift, mut processor, sink_queue) = start_stack();

        // 44.1kHz input against the 48kHz output: 100 packets of 288
        // frames become about 31350 output frames.
        let fmt_44k = AudioFormat::new(44_100, 16, 2);
        for _ in 0..100 {
            let packet =
                TaggedAudioPacket::new("10.0.0.9", payload_with_value(2000), fmt_44k);
            timeshift.handle().add_packet(packet);
        }

        let mut chunks = 0;
        while sink_queue.pop_timeout(Duration::from_millis(400)).is_some() {
            chunks += 1;
        }
        // 28800 input frames * 48/44.1 = 31347 frames = 62694 samples,
        // minus residual and resampler latency: 108 full chunks.
        assert!(
            (105..=109).contains(&chunks),
            "expected about 108 chunks, got {chunks}"
        );

        processor.stop();
        processor.join(Duration::from_secs(1));
        timeshift.stop();
        timeshift.join(Duration::from_secs(1));
    }

    #[test]
    fn volume_command_applies() {
        let (mut timeshift, mut processor, sink_queue) = start_stack();

        processor.send_command(ControlCommand::SetVolume(0.5));
        std::thread::sleep(Duration::from_millis(50));

        let packet = TaggedAudioPacket::new(
            "10.0.0.9",
            payload_with_value(10_000),
            AudioFormat::default(),
        );
        timeshift.handle().add_packet(packet);

        let chunk = sink_queue
            .pop_timeout(Duration::from_secs(2))
            .expect("chunk should arrive");
        let expected = (10_000i64 << 16) / 2;
        for &s in &chunk.samples {
            assert!(
                ((s as i64) - expected).abs() <= 2 * 65_536,
                "sample {s} not near half volume"
            );
        }

        processor.stop();
        processor.join(Duration::from_secs(1));
        timeshift.stop();
        timeshift.join(Duration::from_secs(1));
    }

    #[test]
    fn speaker_layouts_map_command_applies() {
        let (mut timeshift, mut processor, sink_queue) = start_stack();

        // Swap left and right through a whole-map replacement.
        let mut matrix = [[0.0f32; 8]; 8];
        matrix[0][1] = 1.0;
        matrix[1][0] = 1.0;
        let mut layouts = HashMap::new();
        layouts.insert(2, SpeakerLayout::with_matrix(matrix));
        processor.send_command(ControlCommand::SetSpeakerLayouts(layouts));
        std::thread::sleep(Duration::from_millis(50));

        // Distinct constant values per channel so the swap is visible.
        let mut payload = Vec::with_capacity(CHUNK_SIZE_BYTES);
        for _ in 0..288 {
            payload.extend_from_slice(&1000i16.to_le_bytes());
            payload.extend_from_slice(&2000i16.to_le_bytes());
        }
        timeshift.handle().add_packet(TaggedAudioPacket::new(
            "10.0.0.9",
            payload,
            AudioFormat::default(),
        ));

        let chunk = sink_queue
            .pop_timeout(Duration::from_secs(2))
            .expect("chunk should arrive");
        // Only the first frame is checked; the remix path also engages the
        // DC highpass, which decays constants over the chunk.
        let left = chunk.samples[0] as i64;
        let right = chunk.samples[1] as i64;
        let want_left = 2000i64 << 16;
        let want_right = 1000i64 << 16;
        assert!(
            (left - want_left).abs() < want_left / 8,
            "left {left} should carry the right input"
        );
        assert!(
            (right - want_right).abs() < want_right / 8,
            "right {right} should carry the left input"
        );

        processor.stop();
        processor.join(Duration::from_secs(1));
        timeshift.stop();
        timeshift.join(Duration::from_secs(1));
    }

    #[test]
    fn malformed_packet_dropped_without_failure() {
        let (mut timeshift, mut processor, sink_queue) = start_stack();

        let bad = TaggedAudioPacket::new("10.0.0.9", vec![0u8; 64], AudioFormat::default());
        timeshift.handle().add_packet(bad);
        assert!(sink_queue.pop_timeout(Duration::from_millis(200)).is_none());

        // Processor still alive and processing.
        let good = TaggedAudioPacket::new(
            "10.0.0.9",
            payload_with_value(7),
            AudioFormat::default(),
        );
        timeshift.handle().add_packet(good);
        assert!(sink_queue.pop_timeout(Duration::from_secs(2)).is_some());

        processor.stop();
        processor.join(Duration::from_secs(1));
        timeshift.stop();
        timeshift.join(Duration::from_secs(1));
    }
}
