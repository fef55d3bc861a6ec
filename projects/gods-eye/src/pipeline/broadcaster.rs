// Fan-out of composited frames to `/video_feed` subscribers
//
// A tokio broadcast channel carries one shared packet per publish. Publishing
// never waits on a subscriber: a receiver that falls more than a queue length
// behind loses the oldest frames and resumes from the oldest one retained.

use crate::pipeline::types::Frame;
use async_stream::stream;
use axum::body::Bytes;
use futures::Stream;
use image::codecs::jpeg::JpegEncoder;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};

pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 4;
pub const DEFAULT_JPEG_QUALITY: u8 = 80;
pub const MULTIPART_BOUNDARY: &str = "frame";

type PacketSender = broadcast::Sender<Arc<FramePacket>>;

/// A composited frame encoded once for all subscribers.
#[derive(Debug, Clone)]
pub struct FramePacket {
    pub seq: u64,
    pub jpeg: Bytes,
}

impl FramePacket {
    /// One multipart part, boundary first.
    pub fn multipart_chunk(&self) -> Bytes {
        let header = format!(
            "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nX-Sequence: {}\r\n\r\n",
            MULTIPART_BOUNDARY,
            self.jpeg.len(),
            self.seq
        );
        let mut payload = Vec::with_capacity(header.len() + self.jpeg.len() + 2);
        payload.extend_from_slice(header.as_bytes());
        payload.extend_from_slice(&self.jpeg);
        payload.extend_from_slice(b"\r\n");
        Bytes::from(payload)
    }
}

pub struct Broadcaster {
    jpeg_quality: u8,
    latest: RwLock<Option<Arc<FramePacket>>>,
    /// `None` once closed; dropping the sender ends every receiver.
    sender: Mutex<Option<PacketSender>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    /// `queue_capacity` frames are buffered per subscriber. Tokio rounds the
    /// channel up to a power of two.
    pub fn new(queue_capacity: usize, jpeg_quality: u8) -> Self {
        let (sender, _) = broadcast::channel(queue_capacity.max(1));
        Self {
            jpeg_quality: jpeg_quality.clamp(1, 100),
            latest: RwLock::new(None),
            sender: Mutex::new(Some(sender)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Encode `frame` and make it the current frame for every subscriber.
    ///
    /// Called only by the pipeline loop. Never blocks on subscriber I/O.
    pub fn publish(&self, frame: &Frame) {
        let mut jpeg = Vec::new();
        let encoded = JpegEncoder::new_with_quality(&mut jpeg, self.jpeg_quality)
            .encode_image(frame.image());
        if let Err(e) = encoded {
            tracing::warn!("JPEG encode failed for frame {}: {}", frame.seq(), e);
            return;
        }
        self.publish_packet(FramePacket {
            seq: frame.seq(),
            jpeg: Bytes::from(jpeg),
        });
    }

    /// Fan out an already encoded packet.
    pub fn publish_packet(&self, packet: FramePacket) {
        let packet = Arc::new(packet);
        match self.latest.write() {
            Ok(mut guard) => *guard = Some(packet.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(packet.clone()),
        }

        if let Some(sender) = self.lock_sender().as_ref() {
            // Err only means nobody is watching.
            let _ = sender.send(packet);
        }
    }

    /// The most recently published packet, if any.
    pub fn latest(&self) -> Option<Arc<FramePacket>> {
        match self.latest.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Attach a new subscriber. It sees only packets published from now on.
    pub fn subscribe(&self) -> Subscription {
        let receiver = match self.lock_sender().as_ref() {
            Some(sender) => sender.subscribe(),
            // Closed: hand out a receiver whose sender is already gone.
            None => broadcast::channel(1).1,
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Stream subscriber {} attached", id);
        Subscription {
            id,
            receiver,
            dropped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_sender()
            .as_ref()
            .map_or(0, |sender| sender.receiver_count())
    }

    /// End every open subscription once it drains; later subscriptions end
    /// immediately.
    pub fn close(&self) {
        if self.lock_sender().take().is_some() {
            tracing::debug!("Broadcaster closed");
        }
    }

    fn lock_sender(&self) -> MutexGuard<'_, Option<PacketSender>> {
        match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// One subscriber's view of the broadcast. Dropping it detaches the subscriber.
pub struct Subscription {
    id: u64,
    receiver: broadcast::Receiver<Arc<FramePacket>>,
    dropped: u64,
}

impl Subscription {
    /// Next packet in publish order, or `None` once the broadcaster is closed
    /// and the queue is drained. Lagged packets are skipped and counted.
    pub async fn recv(&mut self) -> Option<Arc<FramePacket>> {
        loop {
            match self.receiver.recv().await {
                Ok(packet) => return Some(packet),
                Err(RecvError::Lagged(skipped)) => self.dropped += skipped,
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Packets lost to the drop-oldest policy so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Multipart body stream: one chunk per received packet.
    pub fn into_multipart_stream(mut self) -> impl Stream<Item = Result<Bytes, Infallible>> {
        stream! {
            let mut reported = 0;
            while let Some(packet) = self.recv().await {
                let dropped = self.dropped();
                if dropped > reported {
                    tracing::debug!(
                        "Stream subscriber {} is slow; {} frame(s) dropped so far",
                        self.id,
                        dropped
                    );
                    reported = dropped;
                }
                yield Ok(packet.multipart_chunk());
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        tracing::debug!("Stream subscriber {} detached", self.id);
    }
}
