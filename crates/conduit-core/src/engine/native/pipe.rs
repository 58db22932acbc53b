//! In-memory output pipe for native steps.
//!
//! The writer side is fed by the process's stdout and stderr. Each reader
//! keeps its own cursor into the retained output, so several readers can tail
//! the same step. A reader at the end of the buffer parks until more output
//! arrives or the writer closes; only a closed pipe yields end-of-stream.
//!
//! Retention is capped: once `limit` bytes are buffered, further output is
//! counted and discarded so a chatty step cannot grow memory without bound.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, ReadBuf};

struct Shared {
    buf: Vec<u8>,
    limit: usize,
    dropped: u64,
    closed: bool,
    wakers: Vec<Waker>,
}

#[derive(Clone)]
pub(crate) struct LogPipe {
    shared: Arc<Mutex<Shared>>,
}

impl LogPipe {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                buf: Vec::new(),
                limit,
                dropped: 0,
                closed: false,
                wakers: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let wakers = {
            let mut shared = self.lock();
            if shared.closed {
                return;
            }
            let room = shared.limit.saturating_sub(shared.buf.len());
            let keep = data.len().min(room);
            shared.buf.extend_from_slice(&data[..keep]);
            shared.dropped += (data.len() - keep) as u64;
            if keep == 0 {
                return;
            }
            std::mem::take(&mut shared.wakers)
        };
        wakers.into_iter().for_each(Waker::wake);
    }

    /// Close the write end; parked readers observe end-of-stream.
    pub(crate) fn close(&self) {
        let wakers = {
            let mut shared = self.lock();
            shared.closed = true;
            std::mem::take(&mut shared.wakers)
        };
        wakers.into_iter().for_each(Waker::wake);
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Bytes discarded because the retention cap was reached.
    pub(crate) fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub(crate) fn reader(&self) -> PipeReader {
        PipeReader {
            pipe: self.clone(),
            pos: 0,
        }
    }
}

pub(crate) struct PipeReader {
    pipe: LogPipe,
    pos: usize,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut shared = this.pipe.lock();
        if this.pos < shared.buf.len() {
            let n = (shared.buf.len() - this.pos).min(out.remaining());
            out.put_slice(&shared.buf[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        if shared.closed {
            return Poll::Ready(Ok(()));
        }
        if !shared.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            shared.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn reader_blocks_until_close() {
        let pipe = LogPipe::new(usize::MAX);
        let mut reader = pipe.reader();
        pipe.write(b"hello ");

        let writer = pipe.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.write(b"world");
            writer.close();
        });

        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        handle.await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn empty_open_pipe_does_not_report_eof() {
        let pipe = LogPipe::new(usize::MAX);
        let mut reader = pipe.reader();
        let mut buf = [0u8; 8];
        let res = tokio::time::timeout(Duration::from_millis(50), reader.read(&mut buf)).await;
        assert!(res.is_err(), "read on an open empty pipe must block");
    }

    #[tokio::test]
    async fn every_reader_replays_from_start() {
        let pipe = LogPipe::new(usize::MAX);
        pipe.write(b"line 1\n");
        let mut early = pipe.reader();
        pipe.write(b"line 2\n");
        pipe.close();
        let mut late = pipe.reader();

        let mut a = String::new();
        let mut b = String::new();
        early.read_to_string(&mut a).await.unwrap();
        late.read_to_string(&mut b).await.unwrap();
        assert_eq!(a, "line 1\nline 2\n");
        assert_eq!(a, b);
    }

    #[test]
    fn writes_after_close_are_dropped() {
        let pipe = LogPipe::new(usize::MAX);
        pipe.close();
        pipe.write(b"late");
        assert!(pipe.is_closed());
        assert!(pipe.lock().buf.is_empty());
    }

    #[tokio::test]
    async fn output_past_the_limit_is_discarded() {
        let pipe = LogPipe::new(10);
        let mut reader = pipe.reader();
        pipe.write(b"0123456");
        pipe.write(b"789abcdef");
        pipe.write(b"more");
        pipe.close();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"0123456789");
        assert_eq!(pipe.dropped(), 10);
        assert_eq!(pipe.lock().buf.len(), 10);
    }
}
