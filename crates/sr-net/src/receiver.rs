//! UDP receivers
//!
//! Three ingress variants share one driver: bind a port, poll the socket
//! with a 100 ms timeout so the stop flag is observed promptly, validate
//! the variant's framing, announce unseen source tags, and push packets
//! toward the timeshift buffer. Invalid frames are logged and dropped; the
//! socket is never closed on a bad frame.

use std::collections::HashSet;
use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smallvec::smallvec;
use sr_core::{
    AudioFormat, CHUNK_SIZE_BYTES, NewSourceNotification, PROCESS_TAG_SIZE, PacketQueue,
    RTP_HEADER_SIZE, RTP_PAYLOAD_TYPE, SCREAM_HEADER_SIZE, TaggedAudioPacket,
};

use crate::{NetError, NetResult, decode_scream_header, parse_rtp_header};

/// Socket poll timeout; bounds how long stop() waits.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Receive buffer size, comfortably above the largest variant frame.
const RECV_BUFFER_SIZE: usize = 2048;

/// The three ingress framing variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverKind {
    /// 12-byte RTP header + 1152-byte payload, format implied.
    RtpScream,
    /// 5-byte Scream header + 1152-byte payload.
    RawScream,
    /// 30-byte process tag + 5-byte Scream header + 1152-byte payload.
    PerProcessScream,
}

impl ReceiverKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RtpScream => "rtp",
            Self::RawScream => "scream",
            Self::PerProcessScream => "per-process",
        }
    }

    /// Exact datagram length this variant accepts.
    pub fn expected_len(&self) -> usize {
        match self {
            Self::RtpScream => RTP_HEADER_SIZE + CHUNK_SIZE_BYTES,
            Self::RawScream => SCREAM_HEADER_SIZE + CHUNK_SIZE_BYTES,
            Self::PerProcessScream => PROCESS_TAG_SIZE + SCREAM_HEADER_SIZE + CHUNK_SIZE_BYTES,
        }
    }

    /// Quick structural check before the full parse.
    pub fn is_valid_packet_structure(&self, data: &[u8]) -> bool {
        data.len() == self.expected_len()
    }

    /// Validate framing and build a packet. `None` means the frame is
    /// malformed for this variant.
    fn process_and_validate(&self, data: &[u8], peer: IpAddr) -> Option<TaggedAudioPacket> {
        if !self.is_valid_packet_structure(data) {
            return None;
        }
        match self {
            Self::RtpScream => {
                let (header, _, offset) = parse_rtp_header(data)?;
                if header.payload_type() != RTP_PAYLOAD_TYPE || offset != RTP_HEADER_SIZE {
                    return None;
                }
                // RTP-Scream carries no in-band format.
                let mut packet = TaggedAudioPacket::new(
                    peer.to_string(),
                    data[offset..].to_vec(),
                    AudioFormat::default(),
                );
                packet.rtp_timestamp = Some(header.timestamp);
                packet.ssrcs = smallvec![header.ssrc];
                Some(packet)
            }
            Self::RawScream => {
                let format = decode_scream_header(&data[..SCREAM_HEADER_SIZE]).ok()?;
                Some(TaggedAudioPacket::new(
                    peer.to_string(),
                    data[SCREAM_HEADER_SIZE..].to_vec(),
                    format,
                ))
            }
            Self::PerProcessScream => {
                let tag_bytes = &data[..PROCESS_TAG_SIZE];
                let end = tag_bytes.iter().position(|&b| b == 0).unwrap_or(PROCESS_TAG_SIZE);
                let process_tag = String::from_utf8_lossy(&tag_bytes[..end]).into_owned();
                let format = decode_scream_header(
                    &data[PROCESS_TAG_SIZE..PROCESS_TAG_SIZE + SCREAM_HEADER_SIZE],
                )
                .ok()?;
                Some(TaggedAudioPacket::new(
                    format!("{peer}:{process_tag}"),
                    data[PROCESS_TAG_SIZE + SCREAM_HEADER_SIZE..].to_vec(),
                    format,
                ))
            }
        }
    }
}

/// Counters shared with introspection callers.
#[derive(Debug, Default)]
pub struct ReceiverStats {
    packets_received: AtomicU64,
    packets_invalid: AtomicU64,
}

impl ReceiverStats {
    pub fn received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn invalid(&self) -> u64 {
        self.packets_invalid.load(Ordering::Relaxed)
    }
}

/// One receiver instance: a bound socket and its polling thread.
pub struct UdpReceiver {
    kind: ReceiverKind,
    port: u16,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    seen: Arc<Mutex<HashSet<String>>>,
    stats: Arc<ReceiverStats>,
}

impl UdpReceiver {
    pub fn new(kind: ReceiverKind, port: u16) -> Self {
        Self {
            kind,
            port,
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
            seen: Arc::new(Mutex::new(HashSet::new())),
            stats: Arc::new(ReceiverStats::default()),
        }
    }

    pub fn kind(&self) -> ReceiverKind {
        self.kind
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    /// Source tags observed since start, in no particular order.
    pub fn seen_tags(&self) -> Vec<String> {
        self.seen.lock().iter().cloned().collect()
    }

    /// Bind the port and spawn the polling thread.
    ///
    /// A bind failure is fatal to this receiver; the caller must not
    /// register it.
    pub fn start(
        &mut self,
        packets: PacketQueue<TaggedAudioPacket>,
        notifications: PacketQueue<NewSourceNotification>,
    ) -> NetResult<()> {
        if self.thread.is_some() {
            return Err(NetError::AlreadyRunning);
        }

        let socket = UdpSocket::bind(("0.0.0.0", self.port)).map_err(|source| NetError::Bind {
            port: self.port,
            source,
        })?;
        socket.set_read_timeout(Some(POLL_TIMEOUT))?;

        self.stop.store(false, Ordering::Release);
        let kind = self.kind;
        let port = self.port;
        let stop = Arc::clone(&self.stop);
        let seen = Arc::clone(&self.seen);
        let stats = Arc::clone(&self.stats);

        let handle = thread::Builder::new()
            .name(format!("recv-{}-{}", kind.name(), port))
            .spawn(move || {
                receiver_loop(kind, socket, stop, seen, stats, packets, notifications);
            })?;

        self.thread = Some(handle);
        log::info!("{} receiver listening on port {}", self.kind.name(), self.port);
        Ok(())
    }

    /// Signal the thread to exit; it observes the flag within one poll
    /// timeout.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Wait for the thread to exit. Returns false (and detaches) when the
    /// timeout elapses first.
    pub fn join(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.thread.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                log::error!(
                    "{} receiver on port {} did not stop in time, detaching",
                    self.kind.name(),
                    self.port
                );
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        handle.join().is_ok()
    }
}

impl Drop for UdpReceiver {
    fn drop(&mut self) {
        self.stop();
        self.join(Duration::from_millis(500));
    }
}

fn receiver_loop(
    kind: ReceiverKind,
    socket: UdpSocket,
    stop: Arc<AtomicBool>,
    seen: Arc<Mutex<HashSet<String>>>,
    stats: Arc<ReceiverStats>,
    packets: PacketQueue<TaggedAudioPacket>,
    notifications: PacketQueue<NewSourceNotification>,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }

        let (len, addr) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                log::warn!("{} receiver recv error: {e}", kind.name());
                continue;
            }
        };

        stats.packets_received.fetch_add(1, Ordering::Relaxed);

        let Some(packet) = kind.process_and_validate(&buf[..len], addr.ip()) else {
            stats.packets_invalid.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "{} receiver dropped malformed {len}-byte frame from {addr}",
                kind.name()
            );
            continue;
        };

        if let Err(e) = packet.validate() {
            stats.packets_invalid.fetch_add(1, Ordering::Relaxed);
            log::debug!("{} receiver dropped frame from {addr}: {e}", kind.name());
            continue;
        }

        if seen.lock().insert(packet.source_tag.clone()) {
            log::info!("new source '{}' on {} receiver", packet.source_tag, kind.name());
            notifications.push(NewSourceNotification {
                source_tag: packet.source_tag.clone(),
            });
        }

        packets.push(packet);
    }

    log::debug!("{} receiver loop exited", kind.name());
}
