//! Bounded per-stream output buffer.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Default)]
struct State {
    data: VecDeque<u8>,
    /// The producer hit EOF.
    closed: bool,
    /// A drain returned the EOF flag.
    eof_delivered: bool,
    /// Nobody will read this stream any more; pushes are dropped.
    discarded: bool,
}

/// Bytes read from one child stream and not yet drained by the host.
///
/// `push` waits while the buffer is full, which stops the pump from reading
/// and eventually blocks the child on a full pipe.
#[derive(Debug)]
pub(crate) struct OutputBuffer {
    state: Mutex<State>,
    space: Notify,
    capacity: usize,
}

impl OutputBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            space: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    pub(crate) async fn push(&self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.discarded {
                    return;
                }
                let room = self.capacity.saturating_sub(state.data.len());
                if room > 0 {
                    let n = room.min(bytes.len());
                    state.data.extend(&bytes[..n]);
                    bytes = &bytes[n..];
                    continue;
                }
            }
            notified.await;
        }
    }

    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        if state.discarded {
            state.eof_delivered = true;
        }
    }

    /// Drop buffered bytes and everything the producer pushes from now on.
    ///
    /// Returns the number of bytes dropped. The stream counts as delivered
    /// once the producer closes it.
    pub(crate) fn discard(&self) -> usize {
        let dropped = {
            let mut state = self.state.lock();
            state.discarded = true;
            state.eof_delivered |= state.closed;
            let dropped = state.data.len();
            state.data = VecDeque::new();
            dropped
        };
        self.space.notify_waiters();
        dropped
    }

    /// Take up to `max` bytes. The flag is true when this call emptied a
    /// closed stream, and on every later call.
    pub(crate) fn take(&self, max: usize) -> (Vec<u8>, bool) {
        let (data, eof) = {
            let mut state = self.state.lock();
            let n = max.min(state.data.len());
            let data: Vec<u8> = state.data.drain(..n).collect();
            let eof = state.closed && state.data.is_empty();
            if eof {
                state.eof_delivered = true;
            }
            (data, eof)
        };
        if !data.is_empty() {
            self.space.notify_waiters();
        }
        (data, eof)
    }

    pub(crate) fn eof_delivered(&self) -> bool {
        self.state.lock().eof_delivered
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().data.len()
    }
}

/// Copy `reader` into `buffer` until EOF or a read error, then close it.
pub(crate) async fn pump<R>(
    mut reader: R,
    buffer: Arc<OutputBuffer>,
    pid: u32,
    stream: &'static str,
) where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buffer.push(&chunk[..n]).await,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(pid, stream, error = %e, "Output pump read failed");
                break;
            }
        }
    }
    buffer.close();
    tracing::trace!(pid, stream, "Output stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_take_sets_eof_only_when_closed_and_empty() {
        let buffer = OutputBuffer::new(16);
        buffer.push(b"hello").await;
        buffer.close();

        let (data, eof) = buffer.take(3);
        assert_eq!(data, b"hel");
        assert!(!eof);
        assert!(!buffer.eof_delivered());

        let (data, eof) = buffer.take(3);
        assert_eq!(data, b"lo");
        assert!(eof);
        assert!(buffer.eof_delivered());

        let (data, eof) = buffer.take(3);
        assert!(data.is_empty());
        assert!(eof);
    }

    #[tokio::test]
    async fn test_open_empty_stream_is_not_eof() {
        let buffer = OutputBuffer::new(4);
        let (data, eof) = buffer.take(10);
        assert!(data.is_empty());
        assert!(!eof);
    }

    #[tokio::test]
    async fn test_push_blocks_until_drained() {
        let buffer = Arc::new(OutputBuffer::new(4));
        let producer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.push(b"abcdefgh").await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());
        assert_eq!(buffer.len(), 4);

        let mut out = Vec::new();
        while out.len() < 8 {
            let (data, _) = buffer.take(3);
            out.extend(data);
            tokio::task::yield_now().await;
        }
        producer.await.unwrap();
        assert_eq!(out, b"abcdefgh");
    }

    #[tokio::test]
    async fn test_discard_unblocks_producer() {
        let buffer = Arc::new(OutputBuffer::new(4));
        let producer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.push(b"abcdefgh").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        assert_eq!(buffer.discard(), 4);
        producer.await.unwrap();
        assert_eq!(buffer.len(), 0);
        assert!(!buffer.eof_delivered());

        buffer.close();
        assert!(buffer.eof_delivered());
    }

    #[tokio::test]
    async fn test_discard_after_close_is_delivered() {
        let buffer = OutputBuffer::new(16);
        buffer.push(b"left over").await;
        buffer.close();
        assert_eq!(buffer.discard(), 9);
        assert!(buffer.eof_delivered());
    }

    #[tokio::test]
    async fn test_pump_copies_and_closes() {
        let buffer = Arc::new(OutputBuffer::new(1024));
        pump(&b"line one\nline two\n"[..], buffer.clone(), 1, "stdout").await;

        let (data, eof) = buffer.take(1024);
        assert_eq!(data, b"line one\nline two\n");
        assert!(eof);
    }
}
