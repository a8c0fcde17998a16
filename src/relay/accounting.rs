use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use pin_project_lite::pin_project;
use tokio::io::AsyncWrite;

/// Atomic byte counters shared between a flow and its owning rule.
///
/// `add_in`/`add_out` are the only mutators; readers take a relaxed snapshot.
/// Relaxed ordering is enough here: counters are monotonic and never gate
/// another memory access, so there is nothing to synchronize-with.
#[derive(Debug, Default)]
pub struct Counters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

pin_project! {
    /// Wraps any `AsyncWrite` sink and accounts every successful write to both a
    /// flow-local and a rule-level counter in one step.
    ///
    /// The wrapper only sees the write count `poll_write` actually reports, so a
    /// short write under backpressure is accounted for what it moved, not what
    /// was requested. Write failures pass through untouched and are not rolled
    /// back into the counters.
    pub struct CountingWriter<W> {
        #[pin]
        inner: W,
        direction: Direction,
        flow: Arc<Counters>,
        rule: Arc<Counters>,
    }
}

impl<W> CountingWriter<W> {
    pub fn new(inner: W, direction: Direction, flow: Arc<Counters>, rule: Arc<Counters>) -> Self {
        Self {
            inner,
            direction,
            flow,
            rule,
        }
    }

}

impl<W: AsyncWrite> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();
        let res = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &res {
            let n = *n as u64;
            match this.direction {
                Direction::In => {
                    this.flow.add_in(n);
                    this.rule.add_in(n);
                }
                Direction::Out => {
                    this.flow.add_out(n);
                    this.rule.add_out(n);
                }
            }
        }
        res
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn counts_actual_bytes_written() {
        let flow = Arc::new(Counters::new());
        let rule = Arc::new(Counters::new());

        let mut w = CountingWriter::new(Vec::new(), Direction::In, flow.clone(), rule.clone());
        w.write_all(b"hello").await.unwrap();
        w.write_all(b" world").await.unwrap();

        assert_eq!(flow.bytes_in(), 11);
        assert_eq!(rule.bytes_in(), 11);
        assert_eq!(flow.bytes_out(), 0);
    }

    #[tokio::test]
    async fn out_direction_does_not_touch_in_counter() {
        let flow = Arc::new(Counters::new());
        let rule = Arc::new(Counters::new());

        let mut w = CountingWriter::new(Vec::new(), Direction::Out, flow.clone(), rule.clone());
        w.write_all(b"abc").await.unwrap();

        assert_eq!(flow.bytes_out(), 3);
        assert_eq!(flow.bytes_in(), 0);
        assert_eq!(rule.bytes_out(), 3);
    }
}
