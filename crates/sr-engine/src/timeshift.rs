//! Timeshift manager
//!
//! One process-wide buffer of tagged packets per source tag, time-ordered
//! by reception and bounded by a retention window. Each subscribed source
//! processor has a playback cursor (backshift, delay, sync trim); packets
//! are released into the subscriber's queue once
//! `received + backshift + delay + trim <= now`, in received order. The
//! same packet may be released to many subscribers of one tag; buffer
//! trimming happens only when the retention window expires so a backward
//! cursor jump can replay recent history.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::Serialize;
use sr_core::{PacketQueue, TaggedAudioPacket};

use crate::thread_util::join_with_timeout;
use crate::{EngineError, EngineResult};

/// Idle wake interval of the release loop.
const TICK: Duration = Duration::from_millis(1);

/// How many loop iterations pass between retention sweeps.
const TRIM_INTERVAL: u32 = 256;

/// Largest accumulated sync trim, in seconds either way.
const MAX_TRIM_SEC: f64 = 0.5;

/// Commands applied by the manager thread.
pub enum TimeshiftCommand {
    Subscribe {
        instance_id: String,
        source_tag: String,
        queue: PacketQueue<TaggedAudioPacket>,
        timeshift_sec: f32,
        delay_ms: u32,
    },
    Unsubscribe {
        instance_id: String,
    },
    SetTimeshift {
        instance_id: String,
        seconds: f32,
    },
    SetDelay {
        instance_id: String,
        delay_ms: u32,
    },
    /// Sync feedback: nudge a subscriber's effective release offset.
    AdjustTrim {
        instance_id: String,
        delta_sec: f64,
    },
}

/// Cloneable handle used by receivers, processors and the manager.
#[derive(Clone)]
pub struct TimeshiftHandle {
    commands: Sender<TimeshiftCommand>,
    ingest: PacketQueue<TaggedAudioPacket>,
}

impl TimeshiftHandle {
    /// Queue receivers push raw packets into.
    pub fn ingest_queue(&self) -> PacketQueue<TaggedAudioPacket> {
        self.ingest.clone()
    }

    /// Feed one packet into the buffer (receivers, plugin injection).
    pub fn add_packet(&self, packet: TaggedAudioPacket) {
        self.ingest.push(packet);
    }

    pub fn send(&self, command: TimeshiftCommand) -> EngineResult<()> {
        self.commands
            .send(command)
            .map_err(|_| EngineError::Core(sr_core::CoreError::QueueClosed))
    }
}

/// Occupancy snapshot for introspection.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TimeshiftStats {
    pub source_tags: usize,
    pub buffered_packets: usize,
    pub subscribers: usize,
}

struct Subscriber {
    source_tag: String,
    queue: PacketQueue<TaggedAudioPacket>,
    /// Seconds of playback delay; `set_timeshift(-2.0)` stores 2.0.
    backshift_sec: f64,
    delay_ms: u32,
    /// Accumulated sync-feedback trim.
    trim_sec: f64,
    /// Index of the next buffer entry to evaluate.
    next_index: usize,
}

impl Subscriber {
    fn release_offset(&self) -> f64 {
        self.backshift_sec + self.delay_ms as f64 / 1000.0 + self.trim_sec
    }

    fn is_due(&self, packet: &TaggedAudioPacket, now: Instant) -> bool {
        let offset = self.release_offset();
        if offset <= 0.0 {
            return true;
        }
        packet.received + Duration::from_secs_f64(offset) <= now
    }
}

/// The process-wide timeshift buffer and its release thread.
pub struct TimeshiftManager {
    handle: TimeshiftHandle,
    command_rx: Option<Receiver<TimeshiftCommand>>,
    retention: Duration,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    buffered: Arc<AtomicUsize>,
    tags: Arc<AtomicUsize>,
    subscriber_count: Arc<AtomicUsize>,
}

impl TimeshiftManager {
    pub fn new(retention: Duration) -> Self {
        let (tx, rx) = unbounded();
        let ingest = PacketQueue::new("timeshift-ingest", 4096);
        Self {
            handle: TimeshiftHandle {
                commands: tx,
                ingest,
            },
            command_rx: Some(rx),
            retention,
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
            buffered: Arc::new(AtomicUsize::new(0)),
            tags: Arc::new(AtomicUsize::new(0)),
            subscriber_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn handle(&self) -> TimeshiftHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> TimeshiftStats {
        TimeshiftStats {
            source_tags: self.tags.load(Ordering::Relaxed),
            buffered_packets: self.buffered.load(Ordering::Relaxed),
            subscribers: self.subscriber_count.load(Ordering::Relaxed),
        }
    }

    pub fn start(&mut self) -> EngineResult<()> {
        let Some(commands) = self.command_rx.take() else {
            return Err(EngineError::AlreadyRunning);
        };

        let stop = Arc::clone(&self.stop);
        let ingest = self.handle.ingest.clone();
        let retention = self.retention;
        let buffered = Arc::clone(&self.buffered);
        let tags = Arc::clone(&self.tags);
        let subscriber_count = Arc::clone(&self.subscriber_count);

        let handle = thread::Builder::new()
            .name("timeshift".into())
            .spawn(move || {
                let mut worker = Worker {
                    buffers: HashMap::new(),
                    subscribers: HashMap::new(),
                    retention,
                    buffered,
                    tags,
                    subscriber_count,
                };
                worker.run(stop, commands, ingest);
            })
            .map_err(EngineError::Spawn)?;

        self.thread = Some(handle);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn join(&mut self, timeout: Duration) -> bool {
        match self.thread.take() {
            Some(handle) => join_with_timeout(handle, timeout, "timeshift"),
            None => true,
        }
    }
}

struct Worker {
    buffers: HashMap<String, VecDeque<TaggedAudioPacket>>,
    subscribers: HashMap<String, Subscriber>,
    retention: Duration,
    buffered: Arc<AtomicUsize>,
    tags: Arc<AtomicUsize>,
    subscriber_count: Arc<AtomicUsize>,
}

impl Worker {
    fn run(
        &mut self,
        stop: Arc<AtomicBool>,
        commands: Receiver<TimeshiftCommand>,
        ingest: PacketQueue<TaggedAudioPacket>,
    ) {
        let mut tick: u32 = 0;
        loop {
            if stop.load(Ordering::Acquire) {
                break;
            }

            while let Ok(command) = commands.try_recv() {
                self.apply(command);
            }

            // Block briefly on ingest so pushes wake the loop, then drain
            // whatever else arrived.
            if let Some(packet) = ingest.pop_timeout(TICK) {
                self.add_packet(packet);
                while let Some(more) = ingest.try_pop() {
                    self.add_packet(more);
                }
            }

            self.release_due(Instant::now());

            tick = tick.wrapping_add(1);
            if tick % TRIM_INTERVAL == 0 {
                self.trim_expired(Instant::now());
                self.publish_stats();
            }
        }
        log::debug!("timeshift loop exited");
    }

    fn apply(&mut self, command: TimeshiftCommand) {
        match command {
            TimeshiftCommand::Subscribe {
                instance_id,
                source_tag,
                queue,
                timeshift_sec,
                delay_ms,
            } => {
                log::info!("timeshift: subscribe '{instance_id}' to tag '{source_tag}'");
                let mut subscriber = Subscriber {
                    source_tag,
                    queue,
                    backshift_sec: backshift_from_timeshift(timeshift_sec),
                    delay_ms,
                    trim_sec: 0.0,
                    next_index: 0,
                };
                self.seek_cursor(&mut subscriber, Instant::now());
                self.subscribers.insert(instance_id, subscriber);
            }
            TimeshiftCommand::Unsubscribe { instance_id } => {
                if self.subscribers.remove(&instance_id).is_none() {
                    log::warn!("timeshift: unsubscribe for unknown instance '{instance_id}'");
                }
            }
            TimeshiftCommand::SetTimeshift {
                instance_id,
                seconds,
            } => {
                let now = Instant::now();
                if let Some(mut subscriber) = self.subscribers.remove(&instance_id) {
                    subscriber.backshift_sec = backshift_from_timeshift(seconds);
                    self.seek_cursor(&mut subscriber, now);
                    self.subscribers.insert(instance_id, subscriber);
                } else {
                    log::warn!("timeshift: set_timeshift for unknown instance '{instance_id}'");
                }
            }
            TimeshiftCommand::SetDelay {
                instance_id,
                delay_ms,
            } => {
                let now = Instant::now();
                if let Some(mut subscriber) = self.subscribers.remove(&instance_id) {
                    subscriber.delay_ms = delay_ms;
                    self.seek_cursor(&mut subscriber, now);
                    self.subscribers.insert(instance_id, subscriber);
                } else {
                    log::warn!("timeshift: set_delay for unknown instance '{instance_id}'");
                }
            }
            TimeshiftCommand::AdjustTrim {
                instance_id,
                delta_sec,
            } => {
                if let Some(subscriber) = self.subscribers.get_mut(&instance_id) {
                    subscriber.trim_sec =
                        (subscriber.trim_sec + delta_sec).clamp(-MAX_TRIM_SEC, MAX_TRIM_SEC);
                }
            }
        }
    }

    /// Re-aim a subscriber's cursor after its release offset changed: the
    /// next packet is the oldest one received after the new playback point,
    /// replaying retained history on a backward jump.
    fn seek_cursor(&self, subscriber: &mut Subscriber, now: Instant) {
        let Some(buffer) = self.buffers.get(&subscriber.source_tag) else {
            subscriber.next_index = 0;
            return;
        };
        let offset = subscriber.release_offset().max(0.0);
        let playback_point = now.checked_sub(Duration::from_secs_f64(offset));
        subscriber.next_index = match playback_point {
            Some(point) => buffer.partition_point(|p| p.received <= point),
            // The playback point predates the process; replay everything.
            None => 0,
        };
    }

    fn add_packet(&mut self, packet: TaggedAudioPacket) {
        if let Err(e) = packet.validate() {
            log::warn!("timeshift: dropped invalid packet from '{}': {e}", packet.source_tag);
            return;
        }
        self.buffers
            .entry(packet.source_tag.clone())
            .or_default()
            .push_back(packet);
    }

    fn release_due(&mut self, now: Instant) {
        for subscriber in self.subscribers.values_mut() {
            let Some(buffer) = self.buffers.get(&subscriber.source_tag) else {
                continue;
            };
            while subscriber.next_index < buffer.len() {
                let packet = &buffer[subscriber.next_index];
                if !subscriber.is_due(packet, now) {
                    break;
                }
                subscriber.queue.push(packet.clone());
                subscriber.next_index += 1;
            }
        }
    }

    fn trim_expired(&mut self, now: Instant) {
        let Some(horizon) = now.checked_sub(self.retention) else {
            return;
        };
        for (tag, buffer) in self.buffers.iter_mut() {
            let expired = buffer.partition_point(|p| p.received < horizon);
            if expired == 0 {
                continue;
            }
            buffer.drain(..expired);
            for subscriber in self.subscribers.values_mut() {
                if subscriber.source_tag == *tag {
                    subscriber.next_index = subscriber.next_index.saturating_sub(expired);
                }
            }
        }
        self.buffers.retain(|_, buffer| !buffer.is_empty());
    }

    fn publish_stats(&self) {
        self.tags.store(self.buffers.len(), Ordering::Relaxed);
        self.buffered.store(
            self.buffers.values().map(VecDeque::len).sum(),
            Ordering::Relaxed,
        );
        self.subscriber_count
            .store(self.subscribers.len(), Ordering::Relaxed);
    }
}

/// Map the user-facing timeshift value (negative = into the past) onto the
/// non-negative cursor backshift.
fn backshift_from_timeshift(seconds: f32) -> f64 {
    (-seconds).max(0.0) as f64
}
