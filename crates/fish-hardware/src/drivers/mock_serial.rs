//! Scripted serial port for driver tests.
//!
//! `ScriptedPort` implements `AsyncRead` and `AsyncWrite`. Each write is one
//! command. It queues the next scripted reply for reading and records the
//! written bytes in a `Transcript` that the test keeps.
//!
//! When nothing is queued, reads return EOF. That way `drain_serial_buffer`
//! returns immediately, and a missing reply turns into an empty line rather
//! than a hang.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Shared record of every command written to a [`ScriptedPort`].
#[derive(Debug, Clone, Default)]
pub struct Transcript(Arc<Mutex<Vec<Vec<u8>>>>);

impl Transcript {
    /// Commands as lossy UTF-8 strings, in write order.
    pub fn commands(&self) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect()
    }

    /// Raw command frames, in write order.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.0.lock().clone()
    }
}

/// Mock device answering each write with the next scripted reply.
#[derive(Debug)]
pub struct ScriptedPort {
    replies: VecDeque<Vec<u8>>,
    pending: VecDeque<u8>,
    transcript: Transcript,
}

impl ScriptedPort {
    /// One reply per expected write; an empty reply means "no answer".
    pub fn new<I, R>(replies: I) -> (Self, Transcript)
    where
        I: IntoIterator<Item = R>,
        R: AsRef<[u8]>,
    {
        let transcript = Transcript::default();
        let port = Self {
            replies: replies.into_iter().map(|r| r.as_ref().to_vec()).collect(),
            pending: VecDeque::new(),
            transcript: transcript.clone(),
        };
        (port, transcript)
    }

    /// Port that never answers.
    pub fn silent() -> (Self, Transcript) {
        Self::new(Vec::<Vec<u8>>::new())
    }
}

impl AsyncRead for ScriptedPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let n = std::cmp::min(buf.remaining(), self.pending.len());
        let chunk: Vec<u8> = self.pending.drain(..n).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ScriptedPort {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.transcript.0.lock().push(buf.to_vec());
        if let Some(reply) = self.replies.pop_front() {
            self.pending.extend(reply);
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
