use std::fmt::Debug;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use delegate::delegate;
use tcpshaper_common::ShaperError;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use super::context::WaitContext;
use super::limiter::LimiterNode;

type WaitFuture = Pin<Box<dyn Future<Output = Result<(), ShaperError>> + Send>>;

/// Admission state of one direction. It outlives the read or write call
/// that started it, so the admitted byte count travels with it.
enum PendingWait {
    Empty,
    Waiting(WaitFuture, usize),
    Ready(usize),
}

fn admission(limiter: &Arc<LimiterNode>, context: &WaitContext, bytes: usize) -> PendingWait {
    let limiter = limiter.clone();
    let context = context.clone();
    PendingWait::Waiting(
        Box::pin(async move { limiter.admit(bytes as u64, &context).await }),
        bytes,
    )
}

/// Wraps a byte stream so that every read and write first waits for
/// bandwidth on the corresponding [LimiterNode].
///
/// The whole buffer passed to a single read or write is admitted up front,
/// so it must not be larger than the limiter's burst; see
/// [ThrottledStream::read_chunk_limit]. A failed admission never reaches
/// the inner stream, and no call moves more bytes than were admitted for it.
pub struct ThrottledStream<T> {
    inner: T,
    read_limiter: Arc<LimiterNode>,
    write_limiter: Arc<LimiterNode>,
    context: WaitContext,
    read_wait: PendingWait,
    write_wait: PendingWait,
}

impl<T> ThrottledStream<T> {
    pub fn new(
        inner: T,
        read_limiter: Arc<LimiterNode>,
        write_limiter: Arc<LimiterNode>,
        context: WaitContext,
    ) -> Self {
        Self {
            inner,
            read_limiter,
            write_limiter,
            context,
            read_wait: PendingWait::Empty,
            write_wait: PendingWait::Empty,
        }
    }

    pub fn read_limiter(&self) -> &Arc<LimiterNode> {
        &self.read_limiter
    }

    pub fn write_limiter(&self) -> &Arc<LimiterNode> {
        &self.write_limiter
    }

    pub fn context(&self) -> &WaitContext {
        &self.context
    }

    /// Largest buffer a single read can currently ask for
    pub fn read_chunk_limit(&self) -> usize {
        usize::try_from(self.read_limiter.max_admissible()).unwrap_or(usize::MAX)
    }

    /// Largest buffer a single write can currently pass in
    pub fn write_chunk_limit(&self) -> usize {
        usize::try_from(self.write_limiter.max_admissible()).unwrap_or(usize::MAX)
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Debug> Debug for ThrottledStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottledStream")
            .field("inner", &self.inner)
            .field("read_limiter", &self.read_limiter)
            .field("write_limiter", &self.write_limiter)
            .finish_non_exhaustive()
    }
}

impl ThrottledStream<TcpStream> {
    delegate! {
        to self.inner {
            pub fn local_addr(&self) -> io::Result<SocketAddr>;
            pub fn peer_addr(&self) -> io::Result<SocketAddr>;
            pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()>;
            pub fn nodelay(&self) -> io::Result<bool>;
        }
    }
}

impl<T: AsyncRead + Unpin + Send> ThrottledStream<T> {
    /// Reads at most `admitted` bytes. A call abandoned while waiting
    /// leaves its admission behind for the next one, whose buffer may be
    /// larger.
    fn poll_read_nowait(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
        admitted: usize,
    ) -> Poll<Result<(), io::Error>> {
        let ret = if buf.remaining() > admitted {
            let mut limited = ReadBuf::new(buf.initialize_unfilled_to(admitted));
            let ret = Pin::new(&mut self.inner).poll_read(cx, &mut limited);
            let n = limited.filled().len();
            buf.advance(n);
            ret
        } else {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        };
        if ret.is_ready() {
            // next read needs a fresh admission
            self.read_wait = PendingWait::Empty;
        }
        ret
    }
}

impl<T: AsyncWrite + Unpin + Send> ThrottledStream<T> {
    fn poll_write_nowait(
        &mut self,
        cx: &mut Context<'_>,
        data: &[u8],
        admitted: usize,
    ) -> Poll<Result<usize, io::Error>> {
        let data = &data[..data.len().min(admitted)];
        let ret = Pin::new(&mut self.inner).poll_write(cx, data);
        if ret.is_ready() {
            self.write_wait = PendingWait::Empty;
        }
        ret
    }
}

impl<T: AsyncRead + Unpin + Send> AsyncRead for ThrottledStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();
        let to_read = buf.remaining();
        if to_read == 0 {
            // ready check
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        loop {
            match this.read_wait {
                PendingWait::Empty => {
                    this.read_wait = admission(&this.read_limiter, &this.context, to_read);
                }
                PendingWait::Waiting(ref mut fut, admitted) => match fut.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Err(e)) => {
                        this.read_wait = PendingWait::Empty;
                        return Poll::Ready(Err(e.into()));
                    }
                    Poll::Ready(Ok(())) => {
                        this.read_wait = PendingWait::Ready(admitted);
                    }
                },
                PendingWait::Ready(admitted) => return this.poll_read_nowait(cx, buf, admitted),
            }
        }
    }
}

impl<T: AsyncWrite + Unpin + Send> AsyncWrite for ThrottledStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let this = self.get_mut();

        if data.is_empty() {
            // ready check
            return Pin::new(&mut this.inner).poll_write(cx, data);
        }

        loop {
            match this.write_wait {
                PendingWait::Empty => {
                    this.write_wait = admission(&this.write_limiter, &this.context, data.len());
                }
                PendingWait::Waiting(ref mut fut, admitted) => match fut.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Err(e)) => {
                        this.write_wait = PendingWait::Empty;
                        return Poll::Ready(Err(e.into()));
                    }
                    Poll::Ready(Ok(())) => {
                        this.write_wait = PendingWait::Ready(admitted);
                    }
                },
                PendingWait::Ready(admitted) => {
                    return this.poll_write_nowait(cx, data, admitted)
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::Instant;

    use super::*;
    use crate::rate_limiting::RateSetting;

    /// Serves `cycles` reads of `data` and counts how often it was touched
    struct MockStream {
        data: Vec<u8>,
        cycles: usize,
        reads: Arc<AtomicUsize>,
        written: Vec<u8>,
    }

    impl MockStream {
        fn new(len: usize, cycles: usize) -> Self {
            Self {
                data: (0..len).map(|i| i as u8).collect(),
                cycles,
                reads: Arc::new(AtomicUsize::new(0)),
                written: vec![],
            }
        }
    }

    impl AsyncRead for MockStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            let i = this.reads.fetch_add(1, Ordering::SeqCst);
            if i < this.cycles {
                let n = buf.remaining().min(this.data.len());
                buf.put_slice(&this.data[..n]);
            }
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for MockStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            data: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.get_mut().written.extend_from_slice(data);
            Poll::Ready(Ok(data.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn limiter(limit: i64, burst: i64) -> Arc<LimiterNode> {
        LimiterNode::root(Arc::new(RateSetting::new(limit, burst)))
    }

    fn read_limited(inner: MockStream, limit: i64, burst: i64) -> ThrottledStream<MockStream> {
        ThrottledStream::new(
            inner,
            limiter(limit, burst),
            limiter(0, 0),
            WaitContext::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_more_than_burst() {
        let inner = MockStream::new(100, 3);
        let reads = inner.reads.clone();
        let mut stream = read_limited(inner, 10, 20);

        let err = stream.read(&mut [0; 21]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timings() {
        let mut stream = read_limited(MockStream::new(100, 3), 10, 20);

        let mut gaps = vec![];
        let mut start = Instant::now();
        loop {
            let mut buf = [0; 20];
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            assert_eq!(n, 20);
            let now = Instant::now();
            gaps.push((now - start).as_secs_f64().round() as u64);
            start = now;
        }
        assert_eq!(gaps, vec![0, 2, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_write() {
        let mut stream = read_limited(MockStream::new(0, 0), 10, 20);

        let start = Instant::now();
        stream.write_all(&[7; 4096]).await.unwrap();
        stream.write_all(&[7; 4096]).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(stream.get_ref().written.len(), 8192);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_is_limited() {
        let mut stream = ThrottledStream::new(
            MockStream::new(0, 0),
            limiter(0, 0),
            limiter(10, 10),
            WaitContext::new(),
        );
        assert_eq!(stream.write_chunk_limit(), 10);
        assert_eq!(stream.read_chunk_limit(), usize::MAX);

        let start = Instant::now();
        for chunk in [0u8; 30].chunks(10) {
            stream.write_all(chunk).await.unwrap();
        }
        assert_eq!(start.elapsed().as_secs_f64().round(), 2.0);
        assert_eq!(stream.into_inner().written.len(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_read_never_touches_inner() {
        let inner = MockStream::new(100, 10);
        let reads = inner.reads.clone();
        let mut stream = read_limited(inner, 10, 20);
        let ctx = stream.context().clone();

        stream.read(&mut [0; 20]).await.unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            ctx.cancel();
        });

        let start = Instant::now();
        let err = stream.read(&mut [0; 20]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        canceller.await.unwrap();

        let cause = err
            .get_ref()
            .and_then(|e| e.downcast_ref::<ShaperError>())
            .unwrap();
        assert!(matches!(cause, ShaperError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_read_admission_caps_next_read() {
        let mut stream = read_limited(MockStream::new(100, 100), 10, 20);
        stream.read(&mut [0; 20]).await.unwrap();

        let start = Instant::now();
        let abandoned =
            tokio::time::timeout(Duration::from_millis(1), stream.read(&mut [0; 5])).await;
        assert!(abandoned.is_err());

        // finishes the 5 byte admission instead of reading 20 on its credit
        let n = stream.read(&mut [0; 20]).await.unwrap();
        assert_eq!(n, 5);
        assert!((start.elapsed().as_secs_f64() - 0.5).abs() < 0.01);

        // the next read is admitted for its own size
        let start = Instant::now();
        assert_eq!(stream.read(&mut [0; 20]).await.unwrap(), 20);
        assert!((start.elapsed().as_secs_f64() - 2.0).abs() < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_reads_do_not_exceed_rate() {
        let mut stream = read_limited(MockStream::new(100, 1000), 10, 20);

        let start = Instant::now();
        let mut total = 0;
        for _ in 0..10 {
            if let Ok(n) =
                tokio::time::timeout(Duration::from_millis(1), stream.read(&mut [0; 1])).await
            {
                total += n.unwrap();
            }
            total += stream.read(&mut [0; 20]).await.unwrap();
        }

        let allowed = 20.0 + 10.0 * start.elapsed().as_secs_f64();
        assert!(total as f64 <= allowed + 1.0, "{total} bytes, {allowed} allowed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_write_admission_caps_next_write() {
        let mut stream = ThrottledStream::new(
            MockStream::new(0, 0),
            limiter(0, 0),
            limiter(10, 20),
            WaitContext::new(),
        );
        stream.write_all(&[1; 20]).await.unwrap();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(1), stream.write(&[2; 3])).await;
        assert!(abandoned.is_err());

        assert_eq!(stream.write(&[3; 20]).await.unwrap(), 3);
        assert_eq!(stream.get_ref().written.len(), 23);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_length_read_skips_admission() {
        let inner = MockStream::new(100, 3);
        let reads = inner.reads.clone();
        let mut stream = read_limited(inner, 10, 1);

        assert_eq!(stream.read(&mut []).await.unwrap(), 0);
        assert_eq!(reads.load(Ordering::SeqCst), 1);
    }
}
