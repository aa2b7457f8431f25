//! Readiness multiplexing over many child output streams.
//!
//! One bounded wait covers every open stream: all handles are polled from a
//! single future, which resolves as soon as at least one of them has data or
//! has reached end-of-stream. No task or thread is dedicated to a stream.

use std::future::poll_fn;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, ReadBuf};
use tracing::warn;

use super::execution::{ExecutionId, StreamKind};

/// An open stream handed to [`wait_readable`].
pub struct Watched<'a> {
    pub execution_id: ExecutionId,
    pub kind: StreamKind,
    pub reader: &'a mut (dyn AsyncRead + Unpin + Send),
}

/// Outcome of the single read performed on a ready stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    Data(Vec<u8>),
    /// Zero-length read: the writer side is gone.
    Eof,
}

/// A stream that became ready, with what was read from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub execution_id: ExecutionId,
    pub kind: StreamKind,
    pub event: ReadEvent,
}

/// Wait until at least one stream is readable, then read once from every
/// stream that is ready at that moment, taking at most `chunk_size` bytes
/// from each.
///
/// Gives up after `timeout` (never, if `None`) and returns an empty batch.
/// An empty `streams` slice returns immediately. A read error retires the
/// stream as if it had reached end-of-stream.
pub async fn wait_readable(
    streams: &mut [Watched<'_>],
    timeout: Option<Duration>,
    chunk_size: usize,
) -> Vec<Readiness> {
    let mut buf = vec![0u8; chunk_size.max(1)];
    wait_any(streams, timeout, |stream, cx| {
        let mut read_buf = ReadBuf::new(&mut buf);
        match Pin::new(&mut *stream.reader).poll_read(cx, &mut read_buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                let event = match result {
                    Ok(()) if read_buf.filled().is_empty() => ReadEvent::Eof,
                    Ok(()) => ReadEvent::Data(read_buf.filled().to_vec()),
                    Err(e) => {
                        warn!(
                            execution_id = stream.execution_id,
                            stream = ?stream.kind,
                            error = %e,
                            "Read failed, closing stream"
                        );
                        ReadEvent::Eof
                    }
                };
                Poll::Ready(Readiness {
                    execution_id: stream.execution_id,
                    kind: stream.kind,
                    event,
                })
            }
        }
    })
    .await
}

/// Poll every source until at least one is ready, collecting all sources
/// that are ready in that same pass.
///
/// `poll_one` must be cancel-safe: a source reporting `Pending` keeps no
/// partial progress.
pub(crate) async fn wait_any<S, R, F>(
    sources: &mut [S],
    timeout: Option<Duration>,
    mut poll_one: F,
) -> Vec<R>
where
    F: FnMut(&mut S, &mut Context<'_>) -> Poll<R>,
{
    if sources.is_empty() {
        return Vec::new();
    }
    let any_ready = poll_fn(|cx| {
        let ready: Vec<R> = sources
            .iter_mut()
            .filter_map(|source| match poll_one(source, cx) {
                Poll::Ready(result) => Some(result),
                Poll::Pending => None,
            })
            .collect();
        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(ready)
        }
    });
    match timeout {
        Some(limit) => tokio::time::timeout(limit, any_ready)
            .await
            .unwrap_or_default(),
        None => any_ready.await,
    }
}
