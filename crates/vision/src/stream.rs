//! MJPEG publishing: each consumer gets its own paced sequence of multipart
//! chunks read from the frame store.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_stream::stream;
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::Stream;
use metrics::{counter, gauge};
use tokio::time::MissedTickBehavior;
use tracing::{Span, debug, info_span, warn};

use crate::{
    config::StreamOptions,
    data::AnnotatedFrame,
    encoding::FrameEncoder,
    store::{FrameStore, LatestFrame},
};

pub const BOUNDARY: &str = "frame";
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

static NEXT_CONSUMER: AtomicU64 = AtomicU64::new(1);

/// Frame one encoded image as a multipart part.
pub fn multipart_chunk(body: &[u8], content_type: &str, sequence: u64) -> Bytes {
    let mut chunk = BytesMut::with_capacity(body.len() + 96);
    chunk.put_slice(b"--");
    chunk.put_slice(BOUNDARY.as_bytes());
    chunk.put_slice(b"\r\n");
    chunk.put_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
    chunk.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    chunk.put_slice(format!("X-Sequence: {sequence}\r\n\r\n").as_bytes());
    chunk.put_slice(body);
    chunk.put_slice(b"\r\n");
    chunk.freeze()
}

/// Encode the latest frame, or the placeholder when that fails.
///
/// Returns the frame actually encoded alongside its bytes, or `None` when
/// the placeholder could not be encoded either.
pub fn encode_with_fallback(
    latest: &LatestFrame,
    placeholder: &Arc<AnnotatedFrame>,
    encoder: &dyn FrameEncoder,
) -> Option<(Arc<AnnotatedFrame>, Vec<u8>)> {
    match encoder.encode(&latest.frame.image) {
        Ok(body) => return Some((latest.frame.clone(), body)),
        Err(err) if latest.is_placeholder => {
            warn!("placeholder encoding failed: {err}");
            return None;
        }
        Err(err) => {
            warn!(frame = latest.frame.frame_number, "{err}; serving placeholder");
            counter!("ppe_stream_encode_fallbacks_total").increment(1);
        }
    }

    match encoder.encode(&placeholder.image) {
        Ok(body) => Some((placeholder.clone(), body)),
        Err(err) => {
            warn!("placeholder encoding failed: {err}");
            None
        }
    }
}

/// [`encode_with_fallback`] framed as a multipart chunk.
pub fn encode_emission(
    latest: &LatestFrame,
    placeholder: &Arc<AnnotatedFrame>,
    encoder: &dyn FrameEncoder,
) -> Option<(Arc<AnnotatedFrame>, Bytes)> {
    encode_with_fallback(latest, placeholder, encoder).map(|(frame, body)| {
        let chunk = multipart_chunk(&body, encoder.content_type(), frame.frame_number);
        (frame, chunk)
    })
}

/// An endless chunk sequence for one consumer. Dropping it ends the
/// consumer; nothing else is affected.
pub fn mjpeg_stream(
    store: Arc<FrameStore>,
    encoder: Arc<dyn FrameEncoder>,
    options: StreamOptions,
) -> impl Stream<Item = Bytes> + Send + 'static {
    let consumer = ConsumerGuard::register();
    stream! {
        let consumer = consumer;
        let placeholder = store.placeholder();
        let mut interval = tokio::time::interval(options.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last: Option<(Arc<AnnotatedFrame>, Bytes)> = None;

        loop {
            interval.tick().await;
            let latest = store.latest_frame();

            if let Some((frame, chunk)) = last.as_ref() {
                if Arc::ptr_eq(frame, &latest.frame) {
                    yield chunk.clone();
                    continue;
                }
            }

            let emission = {
                let _entered = consumer.span.enter();
                encode_emission(&latest, &placeholder, encoder.as_ref())
            };
            match emission {
                Some((frame, chunk)) => {
                    last = Some((frame, chunk.clone()));
                    counter!("ppe_stream_frames_sent_total").increment(1);
                    yield chunk;
                }
                None => {
                    counter!("ppe_stream_frames_skipped_total").increment(1);
                    tokio::time::sleep(options.retry_pause).await;
                }
            }
        }
    }
}

struct ConsumerGuard {
    span: Span,
}

impl ConsumerGuard {
    fn register() -> Self {
        let id = NEXT_CONSUMER.fetch_add(1, Ordering::Relaxed);
        let span = info_span!("stream.consumer", consumer = id);
        gauge!("ppe_stream_consumers").increment(1.0);
        span.in_scope(|| debug!("stream consumer connected"));
        Self { span }
    }
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        gauge!("ppe_stream_consumers").decrement(1.0);
        self.span.in_scope(|| debug!("stream consumer disconnected"));
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicUsize,
        time::Duration,
    };

    use chrono::Utc;
    use futures_util::StreamExt;
    use image::RgbImage;
    use ml_core::FrameResult;

    use super::*;
    use crate::{
        annotation::placeholder_frame,
        counters::Counters,
        encoding::JpegFrameEncoder,
        error::EncodeError,
    };

    /// Encodes an image as its width byte; fails for one width.
    struct WidthEncoder {
        fail_width: Option<u32>,
        calls: AtomicUsize,
    }

    impl WidthEncoder {
        fn failing_on(width: Option<u32>) -> Self {
            Self {
                fail_width: width,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl FrameEncoder for WidthEncoder {
        fn encode(&self, image: &RgbImage) -> Result<Vec<u8>, EncodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_width {
                Some(width) if width == image.width() || width == 0 => {
                    Err(EncodeError("refused".into()))
                }
                _ => Ok(vec![image.width() as u8]),
            }
        }

        fn content_type(&self) -> &'static str {
            "image/test"
        }
    }

    fn store() -> Arc<FrameStore> {
        Arc::new(FrameStore::new(5, placeholder_frame(16, 16, "wait")))
    }

    fn publish(store: &FrameStore, width: u32, frame_number: u64) {
        let frame = AnnotatedFrame {
            image: RgbImage::new(width, 8),
            frame_number,
            timestamp_ms: 0,
            fps: 0.0,
        };
        store.publish(
            frame,
            FrameResult::empty(frame_number, Utc::now()),
            Counters::default(),
        );
    }

    fn options() -> StreamOptions {
        StreamOptions {
            interval: Duration::from_millis(10),
            retry_pause: Duration::from_millis(20),
            ..StreamOptions::default()
        }
    }

    fn body(chunk: &Bytes) -> &[u8] {
        let split = chunk
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("header terminator");
        &chunk[split + 4..chunk.len() - 2]
    }

    #[test]
    fn chunk_framing() {
        let chunk = multipart_chunk(b"abc", "image/jpeg", 7);
        assert_eq!(
            &chunk[..],
            b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 3\r\nX-Sequence: 7\r\n\r\nabc\r\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn serves_placeholder_before_first_publish() {
        let encoder: Arc<dyn FrameEncoder> = Arc::new(JpegFrameEncoder::default());
        let mut stream = Box::pin(mjpeg_stream(store(), encoder, options()));
        let chunk = stream.next().await.unwrap();
        assert!(chunk.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n"));
        assert_eq!(&body(&chunk)[..2], &[0xFF_u8, 0xD8]);
    }

    #[tokio::test(start_paused = true)]
    async fn follows_new_publishes() {
        let store = store();
        let encoder: Arc<dyn FrameEncoder> = Arc::new(WidthEncoder::failing_on(None));
        let mut stream = Box::pin(mjpeg_stream(store.clone(), encoder, options()));

        assert_eq!(body(&stream.next().await.unwrap()), &[16u8]);
        publish(&store, 32, 1);
        assert_eq!(body(&stream.next().await.unwrap()), &[32u8]);
        assert_eq!(body(&stream.next().await.unwrap()), &[32u8]);
    }

    #[tokio::test(start_paused = true)]
    async fn encode_failure_falls_back_to_placeholder() {
        let store = store();
        publish(&store, 32, 1);
        let encoder: Arc<dyn FrameEncoder> = Arc::new(WidthEncoder::failing_on(Some(32)));
        let mut stream = Box::pin(mjpeg_stream(store, encoder, options()));

        let chunk = stream.next().await.unwrap();
        assert_eq!(body(&chunk), &[16u8]);
        assert!(chunk.windows(13).any(|w| w == b"X-Sequence: 0"));
    }

    #[tokio::test(start_paused = true)]
    async fn double_failure_skips_without_ending_the_stream() {
        let store = store();
        publish(&store, 32, 1);
        let encoder = Arc::new(WidthEncoder::failing_on(Some(0)));
        let shared: Arc<dyn FrameEncoder> = encoder.clone();
        let mut stream = Box::pin(mjpeg_stream(store, shared, options()));

        let waited = tokio::time::timeout(Duration::from_millis(200), stream.next()).await;
        assert!(waited.is_err(), "no chunk should be produced");
        assert!(encoder.calls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn consumers_are_independent() {
        let store = store();
        publish(&store, 40, 3);
        let encoder: Arc<dyn FrameEncoder> = Arc::new(WidthEncoder::failing_on(None));
        let mut first = Box::pin(mjpeg_stream(store.clone(), encoder.clone(), options()));
        let mut second = Box::pin(mjpeg_stream(store.clone(), encoder, options()));

        assert_eq!(body(&first.next().await.unwrap()), &[40u8]);
        drop(first);
        assert_eq!(body(&second.next().await.unwrap()), &[40u8]);
    }
}
