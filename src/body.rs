//! Body adapters used on the proxied data path

use bytes::{Bytes, BytesMut};
use hyper::body::{Body, Frame, SizeHint};
use hyper::HeaderMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Sleep;

/// Buffered bytes that force a flush regardless of the interval
pub const MAX_BUFFERED_BYTES: usize = 32 * 1024;

/// Response body that coalesces small data frames.
///
/// Buffered bytes are released when [`MAX_BUFFERED_BYTES`] accumulate, when
/// the flush interval has passed since the first byte was buffered, or when
/// the inner body ends. A zero interval forwards every frame as it arrives.
pub struct FlushIntervalBody<B: Body> {
    inner: B,
    interval: Duration,
    buffer: BytesMut,
    deadline: Option<Pin<Box<Sleep>>>,
    trailers: Option<HeaderMap>,
    /// Inner error, reported after the bytes buffered before it
    error: Option<B::Error>,
    finished: bool,
}

impl<B: Body> FlushIntervalBody<B> {
    pub fn new(inner: B, interval: Duration) -> Self {
        Self {
            inner,
            interval,
            buffer: BytesMut::new(),
            deadline: None,
            trailers: None,
            error: None,
            finished: false,
        }
    }

    fn take_buffered(&mut self) -> Frame<Bytes> {
        self.deadline = None;
        Frame::data(self.buffer.split().freeze())
    }
}

impl<B> Body for FlushIntervalBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, B::Error>>> {
        let this = self.get_mut();

        if this.interval.is_zero() {
            return Pin::new(&mut this.inner).poll_frame(cx);
        }

        loop {
            if this.finished {
                if !this.buffer.is_empty() {
                    return Poll::Ready(Some(Ok(this.take_buffered())));
                }
                if let Some(e) = this.error.take() {
                    return Poll::Ready(Some(Err(e)));
                }
                return Poll::Ready(this.trailers.take().map(|t| Ok(Frame::trailers(t))));
            }

            match Pin::new(&mut this.inner).poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                    Ok(data) => {
                        if data.is_empty() {
                            continue;
                        }
                        if this.buffer.is_empty() && data.len() >= MAX_BUFFERED_BYTES {
                            return Poll::Ready(Some(Ok(Frame::data(data))));
                        }
                        this.buffer.extend_from_slice(&data);
                        if this.buffer.len() >= MAX_BUFFERED_BYTES {
                            return Poll::Ready(Some(Ok(this.take_buffered())));
                        }
                        if this.deadline.is_none() {
                            this.deadline = Some(Box::pin(tokio::time::sleep(this.interval)));
                        }
                    }
                    Err(frame) => {
                        // Trailers end the stream; buffered data goes out first
                        this.finished = true;
                        this.trailers = frame.into_trailers().ok();
                    }
                },
                Poll::Ready(Some(Err(e))) => {
                    this.finished = true;
                    this.error = Some(e);
                }
                Poll::Ready(None) => {
                    this.finished = true;
                }
                Poll::Pending => {
                    if let Some(deadline) = this.deadline.as_mut() {
                        if deadline.as_mut().poll(cx).is_ready() {
                            return Poll::Ready(Some(Ok(this.take_buffered())));
                        }
                    }
                    return Poll::Pending;
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        if self.interval.is_zero() {
            return self.inner.is_end_stream();
        }
        (self.finished || self.inner.is_end_stream())
            && self.buffer.is_empty()
            && self.trailers.is_none()
            && self.error.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        let buffered = self.buffer.len() as u64;
        if self.finished {
            return SizeHint::with_exact(buffered);
        }

        let inner = self.inner.size_hint();
        let mut hint = SizeHint::new();
        hint.set_lower(inner.lower() + buffered);
        if let Some(upper) = inner.upper() {
            hint.set_upper(upper + buffered);
        }
        hint
    }
}

/// Request body held back until the app asks for it.
///
/// Used for `Expect: 100-continue` requests: the app sees the request head
/// first and the body is released as soon as its `100 Continue` arrives
/// through the paired [`ContinueSignal`], or when the hold timeout expires.
/// An app that answers with a final status first never receives the body.
pub struct ExpectContinueBody<B> {
    inner: B,
    hold: Option<Hold>,
}

struct Hold {
    continued: oneshot::Receiver<()>,
    deadline: Pin<Box<Sleep>>,
}

/// Releases the body of an [`ExpectContinueBody`]. Dropping it unused also
/// releases the body.
pub struct ContinueSignal {
    tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ContinueSignal {
    pub fn release(&self) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

impl<B> ExpectContinueBody<B> {
    pub fn new(inner: B, timeout: Duration) -> (Self, ContinueSignal) {
        let (tx, rx) = oneshot::channel();
        let body = Self {
            inner,
            hold: Some(Hold {
                continued: rx,
                deadline: Box::pin(tokio::time::sleep(timeout)),
            }),
        };
        let signal = ContinueSignal {
            tx: Mutex::new(Some(tx)),
        };
        (body, signal)
    }
}

impl<B> Body for ExpectContinueBody<B>
where
    B: Body + Unpin,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<B::Data>, B::Error>>> {
        let this = self.get_mut();
        if let Some(hold) = this.hold.as_mut() {
            // Released or dropped signal both end the hold
            if Pin::new(&mut hold.continued).poll(cx).is_pending() {
                ready!(hold.deadline.as_mut().poll(cx));
            }
            this.hold = None;
        }
        Pin::new(&mut this.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};
    use std::convert::Infallible;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    /// Body fed frame by frame from the test
    struct ChannelFrames {
        rx: mpsc::UnboundedReceiver<Frame<Bytes>>,
    }

    impl Body for ChannelFrames {
        type Data = Bytes;
        type Error = Infallible;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
            self.rx.poll_recv(cx).map(|frame| frame.map(Ok))
        }
    }

    fn channel_body() -> (mpsc::UnboundedSender<Frame<Bytes>>, ChannelFrames) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, ChannelFrames { rx })
    }

    #[tokio::test]
    async fn test_zero_interval_passes_frames_through() {
        let (tx, body) = channel_body();
        let mut body = FlushIntervalBody::new(body, Duration::ZERO);

        tx.send(Frame::data(Bytes::from_static(b"a"))).unwrap();
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"a"));

        tx.send(Frame::data(Bytes::from_static(b"b"))).unwrap();
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn test_small_frames_are_coalesced_until_interval() {
        let (tx, body) = channel_body();
        let mut body = FlushIntervalBody::new(body, Duration::from_millis(100));

        tx.send(Frame::data(Bytes::from_static(b"data: 1\n"))).unwrap();
        tx.send(Frame::data(Bytes::from_static(b"data: 2\n"))).unwrap();

        let start = Instant::now();
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(
            frame.into_data().unwrap(),
            Bytes::from_static(b"data: 1\ndata: 2\n")
        );
        assert!(start.elapsed() >= Duration::from_millis(90));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_end_of_stream_flushes_immediately() {
        let (tx, body) = channel_body();
        let mut body = FlushIntervalBody::new(body, Duration::from_secs(60));

        tx.send(Frame::data(Bytes::from_static(b"tail"))).unwrap();
        drop(tx);

        let frame = tokio::time::timeout(Duration::from_secs(1), body.frame())
            .await
            .expect("buffered bytes flushed at end of stream")
            .unwrap()
            .unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"tail"));
        assert!(body.frame().await.is_none());
        assert!(body.is_end_stream());
    }

    #[tokio::test]
    async fn test_large_buffer_flushes_without_waiting() {
        let (tx, body) = channel_body();
        let mut body = FlushIntervalBody::new(body, Duration::from_secs(60));

        let chunk = Bytes::from(vec![b'x'; MAX_BUFFERED_BYTES / 2]);
        tx.send(Frame::data(chunk.clone())).unwrap();
        tx.send(Frame::data(chunk)).unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), body.frame())
            .await
            .expect("full buffer flushed")
            .unwrap()
            .unwrap();
        assert_eq!(frame.into_data().unwrap().len(), MAX_BUFFERED_BYTES);
    }

    #[tokio::test]
    async fn test_trailers_follow_buffered_data() {
        let (tx, body) = channel_body();
        let mut body = FlushIntervalBody::new(body, Duration::from_secs(60));

        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", "0".parse().unwrap());
        tx.send(Frame::data(Bytes::from_static(b"payload"))).unwrap();
        tx.send(Frame::trailers(trailers)).unwrap();

        let data = body.frame().await.unwrap().unwrap();
        assert_eq!(data.into_data().unwrap(), Bytes::from_static(b"payload"));

        let trailers = body.frame().await.unwrap().unwrap().into_trailers().unwrap();
        assert_eq!(trailers.get("grpc-status").unwrap(), "0");
        assert!(body.frame().await.is_none());
    }

    /// Body replaying a fixed list of frames and errors, then ending
    struct Scripted(std::collections::VecDeque<Result<Frame<Bytes>, &'static str>>);

    impl Body for Scripted {
        type Data = Bytes;
        type Error = &'static str;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, &'static str>>> {
            Poll::Ready(self.0.pop_front())
        }
    }

    #[tokio::test]
    async fn test_buffered_bytes_delivered_before_error() {
        let script = Scripted(
            vec![
                Ok(Frame::data(Bytes::from_static(b"partial "))),
                Ok(Frame::data(Bytes::from_static(b"page"))),
                Err("app reset the connection"),
            ]
            .into(),
        );
        let mut body = FlushIntervalBody::new(script, Duration::from_secs(60));

        let frame = tokio::time::timeout(Duration::from_secs(1), body.frame())
            .await
            .expect("buffered bytes flushed on error")
            .unwrap()
            .unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"partial page"));

        let err = body.frame().await.unwrap().unwrap_err();
        assert_eq!(err, "app reset the connection");
        assert!(body.frame().await.is_none());
    }

    #[tokio::test]
    async fn test_full_body_collects_unchanged() {
        let body = FlushIntervalBody::new(Full::new(Bytes::from_static(b"hello")), Duration::from_secs(1));
        assert_eq!(body.size_hint().exact(), Some(5));
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_expect_continue_body_holds_until_timeout() {
        let (body, _signal) = ExpectContinueBody::new(
            Full::new(Bytes::from_static(b"upload")),
            Duration::from_millis(80),
        );
        assert_eq!(body.size_hint().exact(), Some(6));

        let start = Instant::now();
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"upload"));
        assert!(start.elapsed() >= Duration::from_millis(70));
    }

    #[tokio::test]
    async fn test_expect_continue_body_released_by_signal() {
        let (body, signal) = ExpectContinueBody::new(
            Full::new(Bytes::from_static(b"upload")),
            Duration::from_secs(60),
        );

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            signal.release();
            // A second 100 is harmless
            signal.release();
        });

        let collected = tokio::time::timeout(Duration::from_secs(1), body.collect())
            .await
            .expect("body released by continue signal")
            .unwrap()
            .to_bytes();
        assert_eq!(collected, Bytes::from_static(b"upload"));
    }

    #[tokio::test]
    async fn test_expect_continue_body_released_when_signal_dropped() {
        let (body, signal) = ExpectContinueBody::new(
            Full::new(Bytes::from_static(b"upload")),
            Duration::from_secs(60),
        );
        drop(signal);

        let collected = tokio::time::timeout(Duration::from_secs(1), body.collect())
            .await
            .expect("body released when signal dropped")
            .unwrap()
            .to_bytes();
        assert_eq!(collected, Bytes::from_static(b"upload"));
    }
}
