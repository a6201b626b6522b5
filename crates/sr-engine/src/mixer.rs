//! Sink audio mixer
//!
//! One thread per sink. Each cycle gathers the latest chunk from every
//! registered source instance (waiting out a per-sink grace period in 1 ms
//! sub-polls; stragglers contribute silence for that cycle only), sums the
//! active chunks into a saturating 32-bit accumulator, packs the mix at the
//! sink's bit depth, frames it as raw Scream or RTP, and sends it over UDP.
//! An optional MP3 tee re-processes the same payload for external polling.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smallvec::SmallVec;
use sr_core::{
    CHUNK_SIZE_BYTES, EncodedMp3Data, MAX_CSRC, PacketQueue, ProcessedAudioChunk,
    RTP_PAYLOAD_TYPE, SINK_MIXING_BUFFER_SAMPLES, SinkMixerConfig, SinkProtocol, SsrcList,
};
use sr_dsp::convert::pack_from_i32;
use sr_net::{encode_scream_header, write_rtp_header};

use crate::mp3::Mp3Pipeline;
use crate::sync::SinkSyncCoordinator;
use crate::thread_util::join_with_timeout;
use crate::{EngineError, EngineResult};

/// Sub-poll interval inside the gather phase.
const SUB_POLL: Duration = Duration::from_millis(1);

/// Idle sleep while no source is registered.
const IDLE_SLEEP: Duration = Duration::from_millis(20);

/// Capacity of the MP3 output queue.
const MP3_QUEUE_CAPACITY: usize = 256;

type InputMap = HashMap<String, PacketQueue<ProcessedAudioChunk>>;

/// One output sink: mixes registered sources and emits UDP frames.
pub struct SinkAudioMixer {
    config: SinkMixerConfig,
    inputs: Arc<Mutex<InputMap>>,
    mp3_queue: Option<PacketQueue<EncodedMp3Data>>,
    underruns: Arc<AtomicU64>,
    frames_sent: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SinkAudioMixer {
    pub fn new(config: SinkMixerConfig) -> Self {
        let mp3_queue = config
            .enable_mp3
            .then(|| PacketQueue::new(format!("mp3-{}", config.sink_id), MP3_QUEUE_CAPACITY));
        Self {
            inputs: Arc::new(Mutex::new(HashMap::new())),
            mp3_queue,
            underruns: Arc::new(AtomicU64::new(0)),
            frames_sent: Arc::new(AtomicU64::new(0)),
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
            config,
        }
    }

    pub fn sink_id(&self) -> &str {
        &self.config.sink_id
    }

    /// MP3 frames for external polling, when the tee is enabled.
    pub fn mp3_queue(&self) -> Option<PacketQueue<EncodedMp3Data>> {
        self.mp3_queue.clone()
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Register a source instance's chunk queue.
    pub fn add_input_queue(&self, instance_id: &str, queue: PacketQueue<ProcessedAudioChunk>) {
        self.inputs.lock().insert(instance_id.to_string(), queue);
    }

    /// Remove a source instance; a removal during the grace period makes
    /// the gather skip it immediately.
    pub fn remove_input_queue(&self, instance_id: &str) {
        self.inputs.lock().remove(instance_id);
    }

    pub fn start(&mut self, coordinator: SinkSyncCoordinator) -> EngineResult<()> {
        if self.thread.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        let socket = UdpSocket::bind("0.0.0.0:0").map_err(sr_net::NetError::Socket)?;

        self.stop.store(false, Ordering::Release);
        let worker = MixerWorker {
            config: self.config.clone(),
            inputs: Arc::clone(&self.inputs),
            mp3_queue: self.mp3_queue.clone(),
            underruns: Arc::clone(&self.underruns),
            frames_sent: Arc::clone(&self.frames_sent),
            socket,
            coordinator,
            sequence: 0,
            rtp_timestamp: 0,
            mix: vec![0i32; SINK_MIXING_BUFFER_SAMPLES],
            packed: Vec::new(),
            pending: Vec::new(),
            frame: Vec::new(),
        };
        let stop = Arc::clone(&self.stop);

        let handle = thread::Builder::new()
            .name(format!("sink-{}", self.config.sink_id))
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
                join_with_timeout(handle, timeout, &format!("sink-{}", self.config.sink_id))
            }
            None => true,
        }
    }
}

struct MixerWorker {
    config: SinkMixerConfig,
    inputs: Arc<Mutex<InputMap>>,
    mp3_queue: Option<PacketQueue<EncodedMp3Data>>,
    underruns: Arc<AtomicU64>,
    frames_sent: Arc<AtomicU64>,
    socket: UdpSocket,
    coordinator: SinkSyncCoordinator,
    sequence: u16,
    rtp_timestamp: u32,
    mix: Vec<i32>,
    packed: Vec<u8>,
    /// Packed bytes not yet grouped into a 1152-byte payload.
    pending: Vec<u8>,
    frame: Vec<u8>,
}

struct GatherResult {
    chunks: Vec<ProcessedAudioChunk>,
    missing: usize,
    avg_fill: f32,
}

impl MixerWorker {
    fn run(mut self, stop: Arc<AtomicBool>) {
        // The encoder is built inside the thread that uses it; a failure
        // disables the tee permanently but leaves the UDP path alive.
        let mut mp3 = match &self.mp3_queue {
            Some(queue) => {
                match Mp3Pipeline::new(
                    self.config.output_format,
                    self.config.mp3_bitrate_kbps,
                    queue.clone(),
                ) {
                    Ok(pipeline) => Some(pipeline),
                    Err(e) => {
                        log::error!(
                            "sink '{}': MP3 tee disabled: {e}",
                            self.config.sink_id
                        );
                        None
                    }
                }
            }
            None => None,
        };

        loop {
            if stop.load(Ordering::Acquire) {
                break;
            }

            let Some(gathered) = self.gather(&stop) else {
                continue;
            };

            self.mix_chunks(&gathered.chunks);
            if gathered.missing > 0 {
                self.underruns.fetch_add(1, Ordering::Relaxed);
            }

            let csrcs = union_csrcs(&gathered.chunks);

            // Sync hook: the result flags underruns but never suppresses
            // the send.
            let _healthy = self
                .coordinator
                .coordinate_dispatch(gathered.avg_fill, gathered.missing > 0);

            if let Err(e) = self.dispatch(&csrcs, &mut mp3) {
                log::warn!("sink '{}': send failed: {e}", self.config.sink_id);
            }
        }

        if let Some(pipeline) = mp3.as_mut() {
            pipeline.finish();
        }
        log::debug!("sink '{}' loop exited", self.config.sink_id);
    }

    /// Gather phase: wait for the first chunk of the cycle, then give the
    /// remaining sources up to the grace period before they are counted
    /// silent. Returns `None` when there is nothing to mix.
    fn gather(&mut self, stop: &AtomicBool) -> Option<GatherResult> {
        let mut slots: HashMap<String, ProcessedAudioChunk> = HashMap::new();

        // Wait for the cycle-opening chunk.
        loop {
            if stop.load(Ordering::Acquire) {
                return None;
            }
            let inputs = self.inputs.lock();
            if inputs.is_empty() {
                drop(inputs);
                thread::sleep(IDLE_SLEEP);
                return None;
            }
            for (id, queue) in inputs.iter() {
                if let Some(chunk) = queue.try_pop() {
                    slots.insert(id.clone(), chunk);
                }
            }
            drop(inputs);
            if !slots.is_empty() {
                break;
            }
            thread::sleep(SUB_POLL);
        }

        // Grace period for stragglers; membership is re-read every
        // sub-poll so a concurrent removal is skipped immediately.
        let deadline = Instant::now() + Duration::from_millis(self.config.grace_period_ms);
        let (missing, avg_fill) = loop {
            let inputs = self.inputs.lock();
            let missing = inputs.keys().filter(|id| !slots.contains_key(*id)).count();
            if missing == 0 || Instant::now() >= deadline {
                let avg_fill = if inputs.is_empty() {
                    0.0
                } else {
                    inputs.values().map(PacketQueue::fill_percentage).sum::<f32>()
                        / inputs.len() as f32
                };
                slots.retain(|id, _| inputs.contains_key(id));
                break (missing, avg_fill);
            }
            for (id, queue) in inputs.iter() {
                if !slots.contains_key(id)
                    && let Some(chunk) = queue.try_pop()
                {
                    slots.insert(id.clone(), chunk);
                }
            }
            drop(inputs);
            thread::sleep(SUB_POLL);
        };

        if slots.is_empty() {
            return None;
        }
        Some(GatherResult {
            chunks: slots.into_values().collect(),
            missing,
            avg_fill,
        })
    }

    fn mix_chunks(&mut self, chunks: &[ProcessedAudioChunk]) {
        self.mix.fill(0);
        for chunk in chunks {
            for (acc, &s) in self.mix.iter_mut().zip(chunk.samples.iter()) {
                *acc = acc.saturating_add(s);
            }
        }
    }

    /// Pack the mix, emit every complete 1152-byte payload.
    fn dispatch(&mut self, csrcs: &SsrcList, mp3: &mut Option<Mp3Pipeline>) -> EngineResult<()> {
        pack_from_i32(&self.mix, self.config.output_format.bit_depth, &mut self.packed)?;
        self.pending.extend_from_slice(&self.packed);

        while self.pending.len() >= CHUNK_SIZE_BYTES {
            let payload: Vec<u8> = self.pending.drain(..CHUNK_SIZE_BYTES).collect();
            self.send_payload(&payload, csrcs)?;

            if let Some(pipeline) = mp3.as_mut()
                && let Err(e) = pipeline.encode_payload(&payload)
            {
                log::error!(
                    "sink '{}': MP3 tee disabled after encoder failure: {e}",
                    self.config.sink_id
                );
                *mp3 = None;
            }
        }
        Ok(())
    }

    fn send_payload(&mut self, payload: &[u8], csrcs: &SsrcList) -> EngineResult<()> {
        self.frame.clear();
        match self.config.protocol {
            SinkProtocol::Scream => {
                let header = encode_scream_header(&self.config.output_format)?;
                self.frame.extend_from_slice(&header);
            }
            SinkProtocol::Rtp => {
                write_rtp_header(
                    &mut self.frame,
                    RTP_PAYLOAD_TYPE,
                    self.sequence,
                    self.rtp_timestamp,
                    self.config.ssrc,
                    csrcs,
                );
                self.sequence = self.sequence.wrapping_add(1);
                self.rtp_timestamp = self
                    .rtp_timestamp
                    .wrapping_add(self.config.output_format.frames_per_chunk() as u32);
            }
        }
        self.frame.extend_from_slice(payload);

        self.socket
            .send_to(&self.frame, self.config.destination)
            .map_err(sr_net::NetError::Socket)?;
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Union of the gathered chunks' CSRC lists, capped for the RTP header.
fn union_csrcs(chunks: &[ProcessedAudioChunk]) -> SsrcList {
    let mut union: SsrcList = SmallVec::new();
    for chunk in chunks {
        for &ssrc in &chunk.ssrcs {
            if !union.contains(&ssrc) && union.len() < MAX_CSRC {
                union.push(ssrc);
            }
        }
    }
    union
}

#[cfg(test)]
mod tests {
    use super::*;
    use sr_core::AudioFormat;
    use std::net::SocketAddr;

    fn recv_socket() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    fn mixer_config(dest: SocketAddr, protocol: SinkProtocol) -> SinkMixerConfig {
        SinkMixerConfig {
            sink_id: "test-sink".into(),
            destination: dest,
            protocol,
            output_format: AudioFormat::default(),
            ssrc: 0xABCD,
            grace_period_ms: 45,
            enable_mp3: false,
            mp3_bitrate_kbps: 192,
            sync_enabled: false,
            barrier_timeout_ms: 10,
        }
    }

    fn null_coordinator() -> SinkSyncCoordinator {
        SinkSyncCoordinator::new("test-sink", None, Duration::from_millis(10), 288, 48_000, None)
    }

    fn value_chunk(value: i32) -> ProcessedAudioChunk {
        ProcessedAudioChunk::new(vec![value; SINK_MIXING_BUFFER_SAMPLES], SsrcList::new())
    }

    #[test]
    fn single_source_passthrough_scream() {
        let (receiver, dest) = recv_socket();
        let mut mixer = SinkAudioMixer::new(mixer_config(dest, SinkProtocol::Scream));
        let queue = PacketQueue::new("q", 16);
        mixer.add_input_queue("src-1", queue.clone());
        mixer.start(null_coordinator()).unwrap();

        queue.push(value_chunk(1000 << 16));

        let mut buf = [0u8; 2048];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(len, 5 + CHUNK_SIZE_BYTES);

        let format = sr_net::decode_scream_header(&buf[..5]).unwrap();
        assert_eq!(format, AudioFormat::default());
        for pair in buf[5..len].chunks_exact(2) {
            assert_eq!(i16::from_le_bytes([pair[0], pair[1]]), 1000);
        }

        mixer.stop();
        assert!(mixer.join(Duration::from_secs(1)));
    }

    #[test]
    fn two_sources_sum() {
        let (receiver, dest) = recv_socket();
        let mut mixer = SinkAudioMixer::new(mixer_config(dest, SinkProtocol::Scream));
        let a = PacketQueue::new("a", 16);
        let b = PacketQueue::new("b", 16);
        mixer.add_input_queue("src-a", a.clone());
        mixer.add_input_queue("src-b", b.clone());
        mixer.start(null_coordinator()).unwrap();

        a.push(value_chunk(500 << 16));
        b.push(value_chunk(250 << 16));

        let mut buf = [0u8; 2048];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        for pair in buf[5..len].chunks_exact(2) {
            assert_eq!(i16::from_le_bytes([pair[0], pair[1]]), 750);
        }

        mixer.stop();
        mixer.join(Duration::from_secs(1));
    }

    #[test]
    fn silent_source_fills_with_silence_after_grace() {
        let (receiver, dest) = recv_socket();
        let mut config = mixer_config(dest, SinkProtocol::Scream);
        config.grace_period_ms = 30;
        let mut mixer = SinkAudioMixer::new(config);
        let live = PacketQueue::new("live", 16);
        let silent = PacketQueue::new("silent", 16);
        mixer.add_input_queue("src-live", live.clone());
        mixer.add_input_queue("src-silent", silent);
        mixer.start(null_coordinator()).unwrap();

        // Only the live source produces; frames must still flow.
        for _ in 0..3 {
            live.push(value_chunk(100 << 16));
        }
        let mut buf = [0u8; 2048];
        for _ in 0..3 {
            let (len, _) = receiver.recv_from(&mut buf).unwrap();
            assert_eq!(len, 5 + CHUNK_SIZE_BYTES);
            for pair in buf[5..len].chunks_exact(2) {
                assert_eq!(i16::from_le_bytes([pair[0], pair[1]]), 100);
            }
        }
        assert!(mixer.underruns() >= 3);

        mixer.stop();
        mixer.join(Duration::from_secs(1));
    }

    #[test]
    fn rtp_sequence_and_timestamp_advance() {
        let (receiver, dest) = recv_socket();
        let mut mixer = SinkAudioMixer::new(mixer_config(dest, SinkProtocol::Rtp));
        let queue = PacketQueue::new("q", 32);
        mixer.add_input_queue("src-1", queue.clone());
        mixer.start(null_coordinator()).unwrap();

        for _ in 0..5 {
            queue.push(value_chunk(1 << 16));
        }

        let mut buf = [0u8; 2048];
        let mut last_seq: Option<u16> = None;
        let mut last_ts: Option<u32> = None;
        for _ in 0..5 {
            let (len, _) = receiver.recv_from(&mut buf).unwrap();
            assert_eq!(len, 12 + CHUNK_SIZE_BYTES);
            let (header, _, _) = sr_net::parse_rtp_header(&buf[..len]).unwrap();
            assert_eq!(header.payload_type(), RTP_PAYLOAD_TYPE);
            assert_eq!(header.ssrc, 0xABCD);
            if let Some(seq) = last_seq {
                assert_eq!(header.sequence, seq.wrapping_add(1));
            }
            if let Some(ts) = last_ts {
                assert_eq!(header.timestamp, ts.wrapping_add(288));
            }
            last_seq = Some(header.sequence);
            last_ts = Some(header.timestamp);
        }

        mixer.stop();
        mixer.join(Duration::from_secs(1));
    }

    #[test]
    fn saturating_mix_clamps() {
        let (receiver, dest) = recv_socket();
        let mut mixer = SinkAudioMixer::new(mixer_config(dest, SinkProtocol::Scream));
        let a = PacketQueue::new("a", 16);
        let b = PacketQueue::new("b", 16);
        mixer.add_input_queue("src-a", a.clone());
        mixer.add_input_queue("src-b", b.clone());
        mixer.start(null_coordinator()).unwrap();

        a.push(value_chunk(i32::MAX));
        b.push(value_chunk(i32::MAX));

        let mut buf = [0u8; 2048];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        for pair in buf[5..len].chunks_exact(2) {
            assert_eq!(i16::from_le_bytes([pair[0], pair[1]]), i16::MAX);
        }

        mixer.stop();
        mixer.join(Duration::from_secs(1));
    }
}
