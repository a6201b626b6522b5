//! Audio manager
//!
//! Owns every component lifecycle and all wiring: receivers feed the
//! timeshift buffer, source processors subscribe to tags, connect calls
//! create the per-(source, sink) chunk queues, and sinks register with the
//! global sync clock. The internal maps sit behind one coarse mutex held
//! only across map operations; components are stopped and joined outside
//! it. Shutdown order: receivers, timeshift manager, source processors,
//! sink mixers, sync clock.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use sr_core::{
    AudioFormat, ControlCommand, EQ_BANDS, EncodedMp3Data, EngineConfig, NewSourceNotification,
    PacketQueue, ProcessedAudioChunk, SinkConfig, SinkMixerConfig, SourceConfig,
    SourceProcessorConfig, SpeakerLayout, TaggedAudioPacket,
};
use sr_net::{ReceiverKind, UdpReceiver};

use crate::mixer::SinkAudioMixer;
use crate::source::SourceInputProcessor;
use crate::sync::{GlobalSyncClock, SinkSyncCoordinator, SyncStats};
use crate::thread_util::join_with_timeout;
use crate::timeshift::{TimeshiftCommand, TimeshiftManager, TimeshiftStats};
use crate::{EngineError, EngineResult};

/// Bound on every stop/join during shutdown.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Capacity of each (source, sink) chunk queue.
const CHUNK_QUEUE_CAPACITY: usize = 64;

/// Capacity of the new-source notification queue.
const NOTIFICATION_QUEUE_CAPACITY: usize = 256;

type NotificationHandler = Box<dyn Fn(&NewSourceNotification) + Send + Sync>;

struct SinkEntry {
    mixer: SinkAudioMixer,
    destination_ip: IpAddr,
    /// Instance ids feeding this sink, shared with its coordinator.
    sources: Arc<Mutex<Vec<String>>>,
}

#[derive(Default)]
struct ManagerState {
    receivers: HashMap<u16, UdpReceiver>,
    sources: HashMap<String, SourceInputProcessor>,
    sinks: HashMap<String, SinkEntry>,
}

/// Aggregate engine snapshot for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub timeshift: TimeshiftStats,
    pub sync: SyncStats,
    pub sinks: HashMap<String, SinkStats>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SinkStats {
    pub frames_sent: u64,
    pub underruns: u64,
}

/// The engine facade exposed to the host runtime.
pub struct AudioManager {
    config: EngineConfig,
    state: Mutex<ManagerState>,
    timeshift: Mutex<TimeshiftManager>,
    clock: GlobalSyncClock,
    notifications: PacketQueue<NewSourceNotification>,
    notification_handler: Arc<Mutex<Option<NotificationHandler>>>,
    discovered: Arc<Mutex<Vec<String>>>,
    notify_stop: Arc<AtomicBool>,
    notify_thread: Mutex<Option<JoinHandle<()>>>,
    instance_counter: AtomicU64,
    initialized: AtomicBool,
}

impl AudioManager {
    pub fn new(config: EngineConfig) -> Self {
        let retention = Duration::from_secs_f64(config.timeshift_buffer_duration_sec.max(1.0));
        Self {
            config,
            state: Mutex::new(ManagerState::default()),
            timeshift: Mutex::new(TimeshiftManager::new(retention)),
            clock: GlobalSyncClock::new(),
            notifications: PacketQueue::new("new-source", NOTIFICATION_QUEUE_CAPACITY),
            notification_handler: Arc::new(Mutex::new(None)),
            discovered: Arc::new(Mutex::new(Vec::new())),
            notify_stop: Arc::new(AtomicBool::new(false)),
            notify_thread: Mutex::new(None),
            instance_counter: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sync_clock(&self) -> &GlobalSyncClock {
        &self.clock
    }

    /// Start the timeshift manager and the notification dispatcher, and
    /// bind the primary RTP receiver when a port is given.
    pub fn initialize(&self, rtp_listen_port: Option<u16>) -> EngineResult<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyRunning);
        }

        self.timeshift.lock().start()?;

        self.notify_stop.store(false, Ordering::Release);
        let queue = self.notifications.clone();
        let stop = Arc::clone(&self.notify_stop);
        let handler = Arc::clone(&self.notification_handler);
        let discovered = Arc::clone(&self.discovered);
        let handle = thread::Builder::new()
            .name("notify".into())
            .spawn(move || {
                loop {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    let Some(notification) = queue.pop_timeout(Duration::from_millis(100)) else {
                        continue;
                    };
                    log::info!("new source discovered: '{}'", notification.source_tag);
                    discovered.lock().push(notification.source_tag.clone());
                    if let Some(callback) = handler.lock().as_ref() {
                        callback(&notification);
                    }
                }
            })
            .map_err(EngineError::Spawn)?;
        *self.notify_thread.lock() = Some(handle);

        if let Some(port) = rtp_listen_port {
            self.add_receiver(ReceiverKind::RtpScream, port)?;
        }
        Ok(())
    }

    /// Stop everything in dependency order and join with bounded waits.
    pub fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        log::info!("engine shutting down");

        let (mut receivers, mut sources, mut sinks) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.receivers),
                std::mem::take(&mut state.sources),
                std::mem::take(&mut state.sinks),
            )
        };

        for receiver in receivers.values_mut() {
            receiver.stop();
        }
        for receiver in receivers.values_mut() {
            receiver.join(JOIN_TIMEOUT);
        }

        {
            let mut timeshift = self.timeshift.lock();
            timeshift.stop();
            timeshift.join(JOIN_TIMEOUT);
        }

        for source in sources.values_mut() {
            source.stop();
        }
        for source in sources.values_mut() {
            source.join(JOIN_TIMEOUT);
        }

        for entry in sinks.values_mut() {
            entry.mixer.stop();
        }
        for entry in sinks.values_mut() {
            entry.mixer.join(JOIN_TIMEOUT);
        }

        self.clock.set_enabled(false);

        self.notify_stop.store(true, Ordering::Release);
        if let Some(handle) = self.notify_thread.lock().take() {
            join_with_timeout(handle, JOIN_TIMEOUT, "notify");
        }
    }

    /// Callback invoked by the dispatch thread for every new source tag.
    pub fn set_notification_handler(
        &self,
        handler: impl Fn(&NewSourceNotification) + Send + Sync + 'static,
    ) {
        *self.notification_handler.lock() = Some(Box::new(handler));
    }

    /// Source tags announced since startup, in discovery order.
    pub fn discovered_sources(&self) -> Vec<String> {
        self.discovered.lock().clone()
    }

    // ── Receivers ──────────────────────────────────────────────────────

    /// Bind and start a receiver. A bind failure leaves nothing
    /// registered.
    pub fn add_receiver(&self, kind: ReceiverKind, port: u16) -> EngineResult<()> {
        self.ensure_initialized()?;
        if self.state.lock().receivers.contains_key(&port) {
            return Err(EngineError::DuplicateId(format!("receiver port {port}")));
        }

        let ingest = self.timeshift.lock().handle().ingest_queue();
        let mut receiver = UdpReceiver::new(kind, port);
        receiver.start(ingest, self.notifications.clone())?;

        self.state.lock().receivers.insert(port, receiver);
        Ok(())
    }

    pub fn remove_receiver(&self, port: u16) -> EngineResult<()> {
        let mut receiver = self
            .state
            .lock()
            .receivers
            .remove(&port)
            .ok_or(EngineError::UnknownReceiver(port))?;
        receiver.stop();
        receiver.join(JOIN_TIMEOUT);
        Ok(())
    }

    /// Seen source tags per receiver port.
    pub fn seen_tags(&self) -> HashMap<u16, Vec<String>> {
        self.state
            .lock()
            .receivers
            .iter()
            .map(|(&port, receiver)| (port, receiver.seen_tags()))
            .collect()
    }

    // ── Sources ────────────────────────────────────────────────────────

    /// Create, subscribe and start a source instance. Returns its unique
    /// instance id.
    pub fn configure_source(
        &self,
        config: &SourceConfig,
        output_format: AudioFormat,
    ) -> EngineResult<String> {
        self.ensure_initialized()?;
        output_format.validate().map_err(EngineError::Core)?;

        let ordinal = self.instance_counter.fetch_add(1, Ordering::Relaxed);
        let instance_id = format!("src-{ordinal}");

        let processor_config =
            SourceProcessorConfig::from_source(&instance_id, config, output_format);
        let mut processor =
            SourceInputProcessor::new(processor_config, self.timeshift.lock().handle());
        processor.start()?;

        self.state
            .lock()
            .sources
            .insert(instance_id.clone(), processor);
        Ok(instance_id)
    }

    pub fn remove_source(&self, instance_id: &str) -> EngineResult<()> {
        let mut processor = {
            let mut state = self.state.lock();
            let processor = state
                .sources
                .remove(instance_id)
                .ok_or_else(|| EngineError::UnknownSource(instance_id.to_string()))?;
            for entry in state.sinks.values() {
                entry.mixer.remove_input_queue(instance_id);
                entry.sources.lock().retain(|id| id != instance_id);
            }
            processor
        };

        let _ = self
            .timeshift
            .lock()
            .handle()
            .send(TimeshiftCommand::Unsubscribe {
                instance_id: instance_id.to_string(),
            });
        processor.stop();
        processor.join(JOIN_TIMEOUT);
        Ok(())
    }

    // ── Sinks ──────────────────────────────────────────────────────────

    pub fn add_sink(&self, config: &SinkConfig) -> EngineResult<()> {
        self.ensure_initialized()?;
        if self.state.lock().sinks.contains_key(&config.sink_id) {
            return Err(EngineError::DuplicateId(config.sink_id.clone()));
        }

        let mixer_config = SinkMixerConfig::from_sink(config);
        let clock = mixer_config.sync_enabled.then(|| self.clock.clone());
        let coordinator = SinkSyncCoordinator::new(
            &mixer_config.sink_id,
            clock,
            Duration::from_millis(mixer_config.barrier_timeout_ms),
            mixer_config.output_format.frames_per_chunk() as u32,
            mixer_config.output_format.sample_rate,
            mixer_config
                .sync_enabled
                .then(|| self.timeshift.lock().handle()),
        );
        let sources = coordinator.sources_handle();

        let mut mixer = SinkAudioMixer::new(mixer_config);
        mixer.start(coordinator)?;

        self.state.lock().sinks.insert(
            config.sink_id.clone(),
            SinkEntry {
                mixer,
                destination_ip: config.destination.ip(),
                sources,
            },
        );
        Ok(())
    }

    pub fn remove_sink(&self, sink_id: &str) -> EngineResult<()> {
        let mut entry = {
            let mut state = self.state.lock();
            let entry = state
                .sinks
                .remove(sink_id)
                .ok_or_else(|| EngineError::UnknownSink(sink_id.to_string()))?;
            for processor in state.sources.values() {
                processor.remove_output_queue(sink_id);
            }
            entry
        };
        entry.mixer.stop();
        entry.mixer.join(JOIN_TIMEOUT);
        Ok(())
    }

    // ── Wiring ─────────────────────────────────────────────────────────

    /// Create the (source, sink) chunk queue and register both ends.
    pub fn connect(&self, instance_id: &str, sink_id: &str) -> EngineResult<()> {
        let state = self.state.lock();
        let processor = state
            .sources
            .get(instance_id)
            .ok_or_else(|| EngineError::UnknownSource(instance_id.to_string()))?;
        let entry = state
            .sinks
            .get(sink_id)
            .ok_or_else(|| EngineError::UnknownSink(sink_id.to_string()))?;

        let queue: PacketQueue<ProcessedAudioChunk> =
            PacketQueue::new(format!("{instance_id}->{sink_id}"), CHUNK_QUEUE_CAPACITY);
        processor.add_output_queue(sink_id, queue.clone());
        entry.mixer.add_input_queue(instance_id, queue);
        entry.sources.lock().push(instance_id.to_string());
        Ok(())
    }

    pub fn disconnect(&self, instance_id: &str, sink_id: &str) -> EngineResult<()> {
        let state = self.state.lock();
        let processor = state
            .sources
            .get(instance_id)
            .ok_or_else(|| EngineError::UnknownSource(instance_id.to_string()))?;
        let entry = state
            .sinks
            .get(sink_id)
            .ok_or_else(|| EngineError::UnknownSink(sink_id.to_string()))?;

        processor.remove_output_queue(sink_id);
        entry.mixer.remove_input_queue(instance_id);
        entry.sources.lock().retain(|id| id != instance_id);
        Ok(())
    }

    // ── Per-source control ─────────────────────────────────────────────

    pub fn set_volume(&self, instance_id: &str, volume: f32) -> EngineResult<()> {
        self.send_command(instance_id, ControlCommand::SetVolume(volume))
    }

    pub fn set_eq(&self, instance_id: &str, gains: [f32; EQ_BANDS]) -> EngineResult<()> {
        self.send_command(instance_id, ControlCommand::SetEq(gains))
    }

    pub fn set_delay(&self, instance_id: &str, delay_ms: u32) -> EngineResult<()> {
        self.send_command(instance_id, ControlCommand::SetDelay(delay_ms))
    }

    pub fn set_timeshift(&self, instance_id: &str, seconds: f32) -> EngineResult<()> {
        self.send_command(instance_id, ControlCommand::SetTimeshift(seconds))
    }

    pub fn set_speaker_layout(
        &self,
        instance_id: &str,
        input_channel_key: u8,
        layout: SpeakerLayout,
    ) -> EngineResult<()> {
        self.send_command(
            instance_id,
            ControlCommand::SetSpeakerMix {
                input_channel_key,
                layout,
            },
        )
    }

    /// Replace every layout key of one instance in a single step.
    pub fn set_speaker_layouts_map(
        &self,
        instance_id: &str,
        layouts: HashMap<u8, SpeakerLayout>,
    ) -> EngineResult<()> {
        self.send_command(instance_id, ControlCommand::SetSpeakerLayouts(layouts))
    }

    fn send_command(&self, instance_id: &str, command: ControlCommand) -> EngineResult<()> {
        let state = self.state.lock();
        let processor = state
            .sources
            .get(instance_id)
            .ok_or_else(|| EngineError::UnknownSource(instance_id.to_string()))?;
        processor.send_command(command);
        Ok(())
    }

    // ── MP3 polling ────────────────────────────────────────────────────

    pub fn poll_mp3_by_sink(&self, sink_id: &str) -> EngineResult<Option<EncodedMp3Data>> {
        let state = self.state.lock();
        let entry = state
            .sinks
            .get(sink_id)
            .ok_or_else(|| EngineError::UnknownSink(sink_id.to_string()))?;
        Ok(entry.mixer.mp3_queue().and_then(|queue| queue.try_pop()))
    }

    pub fn poll_mp3_by_ip(&self, ip: IpAddr) -> Option<EncodedMp3Data> {
        let state = self.state.lock();
        state
            .sinks
            .values()
            .filter(|entry| entry.destination_ip == ip)
            .find_map(|entry| entry.mixer.mp3_queue().and_then(|queue| queue.try_pop()))
    }

    // ── Injection & stats ──────────────────────────────────────────────

    /// Push a pre-formed packet into one instance's input queue, or into
    /// the shared timeshift buffer when no instance is named.
    pub fn inject_packet(
        &self,
        instance_id: Option<&str>,
        packet: TaggedAudioPacket,
    ) -> EngineResult<()> {
        match instance_id {
            Some(id) => {
                let state = self.state.lock();
                let processor = state
                    .sources
                    .get(id)
                    .ok_or_else(|| EngineError::UnknownSource(id.to_string()))?;
                processor.input_queue().push(packet);
                Ok(())
            }
            None => {
                self.timeshift.lock().handle().add_packet(packet);
                Ok(())
            }
        }
    }

    pub fn stats(&self) -> EngineStats {
        let state = self.state.lock();
        EngineStats {
            timeshift: self.timeshift.lock().stats(),
            sync: self.clock.get_stats(),
            sinks: state
                .sinks
                .iter()
                .map(|(id, entry)| {
                    (
                        id.clone(),
                        SinkStats {
                            frames_sent: entry.mixer.frames_sent(),
                            underruns: entry.mixer.underruns(),
                        },
                    )
                })
                .collect(),
        }
    }

    fn ensure_initialized(&self) -> EngineResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(EngineError::NotInitialized)
        }
    }
}

impl Drop for AudioManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_calls_reject_unknown_ids() {
        let manager = AudioManager::new(EngineConfig::default());
        manager.initialize(None).unwrap();

        assert!(matches!(
            manager.set_volume("missing", 0.5),
            Err(EngineError::UnknownSource(_))
        ));
        assert!(matches!(
            manager.remove_sink("missing"),
            Err(EngineError::UnknownSink(_))
        ));
        assert!(matches!(
            manager.remove_receiver(12345),
            Err(EngineError::UnknownReceiver(_))
        ));

        manager.shutdown();
    }

    #[test]
    fn requires_initialize_before_use() {
        let manager = AudioManager::new(EngineConfig::default());
        let config = SourceConfig::new("10.0.0.1");
        assert!(matches!(
            manager.configure_source(&config, AudioFormat::default()),
            Err(EngineError::NotInitialized)
        ));
    }

    #[test]
    fn duplicate_sink_rejected() {
        let manager = AudioManager::new(EngineConfig::default());
        manager.initialize(None).unwrap();

        let sink = SinkConfig::new(
            "office",
            "127.0.0.1:55001".parse().unwrap(),
            sr_core::SinkProtocol::Scream,
        );
        manager.add_sink(&sink).unwrap();
        assert!(matches!(
            manager.add_sink(&sink),
            Err(EngineError::DuplicateId(_))
        ));

        manager.shutdown();
    }

    #[test]
    fn notification_dispatch_records_discoveries() {
        let manager = AudioManager::new(EngineConfig::default());
        manager.initialize(None).unwrap();

        manager.notifications.push(NewSourceNotification {
            source_tag: "10.1.1.1".into(),
        });
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(manager.discovered_sources(), vec!["10.1.1.1".to_string()]);

        manager.shutdown();
    }
}
