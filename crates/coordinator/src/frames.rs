use std::{future, sync::Arc, time::Duration};

use axum::body::Bytes;
use futures::{Stream, StreamExt};
use tokio::{sync::watch, time::MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;

pub const FRAME_BOUNDARY: &str = "frame";
pub const FRAME_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Latest JPEG frame from the vehicle camera. Readers never block the writer
/// and always see the newest complete frame.
#[derive(Clone)]
pub struct FrameSlot {
    tx: Arc<watch::Sender<Option<Bytes>>>,
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSlot {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Replaces the current frame. Empty payloads are dropped; returns
    /// whether the frame was stored.
    pub fn publish(&self, frame: Bytes) -> bool {
        if frame.is_empty() {
            return false;
        }
        self.tx.send_replace(Some(frame));
        true
    }

    pub fn latest(&self) -> Option<Bytes> {
        self.tx.borrow().clone()
    }
}

/// Multipart parts for a `multipart/x-mixed-replace` response: one per tick
/// of `interval` once a frame exists, repeating the last frame until a newer
/// one arrives. Never ends.
pub fn frame_stream(slot: FrameSlot, interval: Duration) -> impl Stream<Item = Bytes> + Send {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    IntervalStream::new(ticker)
        .filter_map(move |_| future::ready(slot.latest().map(|frame| encode_part(&frame))))
}

pub fn encode_part(frame: &[u8]) -> Bytes {
    let header = format!(
        "--{FRAME_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        frame.len()
    );
    let mut part = Vec::with_capacity(header.len() + frame.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(frame);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}
