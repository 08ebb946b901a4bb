use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;

/// The one byte stream an endpoint talks to its peer over.
///
/// Tracks whether the local side has been closed so that [`close`] can be
/// called once per termination trigger without faulting. Dropping an
/// unclosed `Connection` drops the stream, which releases it as well.
///
/// [`close`]: Connection::close
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    open: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream, open: true }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Write `line` followed by exactly one newline.
    pub async fn send_line(&mut self, line: &[u8]) -> io::Result<()> {
        let mut framed = Vec::with_capacity(line.len() + 1);
        framed.extend_from_slice(line);
        framed.push(b'\n');
        self.stream.write_all(&framed).await?;
        self.stream.flush().await
    }

    pub(crate) fn poll_read_chunk(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }

    /// Shut down the write side. Only the first call touches the stream.
    pub async fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Err(error) = self.stream.shutdown().await {
            // The peer may already be gone; the handle is released either way.
            debug!(?error, "connection shutdown reported an error");
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn send_line_appends_one_newline() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut connection = Connection::new(local);

        connection.send_line(b"hello").await.expect("send");
        connection.send_line(b"").await.expect("send empty line");
        connection.close().await;

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.expect("read");
        assert_eq!(received, b"hello\n\n");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut connection = Connection::new(local);

        connection.close().await;
        connection.close().await;
        assert!(!connection.is_open());

        let mut buf = [0u8; 8];
        assert_eq!(remote.read(&mut buf).await.expect("read"), 0);
    }
}
