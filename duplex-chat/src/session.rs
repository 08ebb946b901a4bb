//! The duplex loop that drives one chat session.
//!
//! A session watches the console and the connection from a single task. Each
//! iteration rebuilds its view of which sources are ready, blocks until at
//! least one is, then services them in a fixed order: console first, then
//! the connection, then the shutdown signal. Both sources can be ready in
//! the same wake-up, so this order decides whether a locally typed line or a
//! received chunk is handled first.
//!
//! Console and connection are never serviced concurrently, so neither path
//! needs to synchronise with the other.

use std::{
    fmt,
    future::{Future, poll_fn},
    io,
    pin::Pin,
    task::Poll,
};

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf,
};
use tracing::{debug, info, warn};

use crate::connection::Connection;

/// Typing exactly this line ends the session instead of sending it.
pub const QUIT_COMMAND: &[u8] = b"quit";

/// Upper bound on the bytes taken from the connection per iteration.
pub const CHUNK_SIZE: usize = 1024;

pub const LEAVING_NOTICE: &str = "*** leaving chat";
pub const INPUT_CLOSED_NOTICE: &str = "*** input closed, leaving chat";
pub const PEER_DISCONNECTED_NOTICE: &str = "*** peer disconnected";
pub const INTERRUPTED_NOTICE: &str = "*** interrupted, leaving chat";

/// Why a session stopped.
#[derive(Debug)]
pub enum Termination {
    /// The operator typed the quit command.
    Quit,
    /// The console reached end-of-input or could not be read.
    ConsoleClosed,
    /// The peer closed its side of the connection.
    PeerClosed,
    /// Reading from the connection failed.
    ReadFailed(io::Error),
    /// Waiting for readiness failed.
    WaitFailed(io::Error),
    /// The shutdown signal fired.
    Interrupted,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Quit => f.write_str("quit command"),
            Termination::ConsoleClosed => f.write_str("console closed"),
            Termination::PeerClosed => f.write_str("peer closed the connection"),
            Termination::ReadFailed(err) => write!(f, "connection read failed: {err}"),
            Termination::WaitFailed(err) => write!(f, "readiness wait failed: {err}"),
            Termination::Interrupted => f.write_str("interrupted"),
        }
    }
}

/// What is left once a session has closed its connection.
#[derive(Debug)]
pub struct SessionSummary<O> {
    pub termination: Termination,
    pub output: O,
}

/// Sources found ready by one wait. A connection result means a chunk has
/// already been read into the session buffer.
struct Readiness {
    console: bool,
    connection: Option<io::Result<usize>>,
    interrupted: bool,
}

pub struct Session<C, S, O> {
    console: C,
    connection: Connection<S>,
    output: O,
    peer_label: String,
    line: Vec<u8>,
    chunk: Vec<u8>,
    /// Whether the last byte written to `output` was a newline.
    at_line_start: bool,
}

impl<C, S, O> Session<C, S, O>
where
    C: AsyncBufRead + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
    O: AsyncWrite + Unpin,
{
    pub fn new(
        console: C,
        connection: Connection<S>,
        output: O,
        peer_label: impl Into<String>,
    ) -> Self {
        Self {
            console,
            connection,
            output,
            peer_label: peer_label.into(),
            line: Vec::new(),
            chunk: vec![0; CHUNK_SIZE],
            at_line_start: true,
        }
    }

    /// Run until a termination condition is met or `shutdown` completes.
    ///
    /// The connection is closed exactly once before this returns, whichever
    /// path ended the session.
    pub async fn run_until<F>(mut self, shutdown: F) -> SessionSummary<O>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let termination = loop {
            let readiness = match self.wait_ready(shutdown.as_mut()).await {
                Ok(readiness) => readiness,
                Err(error) => {
                    warn!(?error, "readiness wait failed");
                    break Termination::WaitFailed(error);
                }
            };

            if let Some(termination) = self.dispatch(readiness).await {
                break termination;
            }
        };

        self.connection.close().await;
        info!(reason = %termination, "session closed");

        SessionSummary {
            termination,
            output: self.output,
        }
    }

    pub async fn run_until_ctrl_c(self) -> SessionSummary<O> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    async fn wait_ready<F>(&mut self, mut shutdown: Pin<&mut F>) -> io::Result<Readiness>
    where
        F: Future<Output = ()>,
    {
        debug_assert!(self.connection.is_open());
        let Self {
            console,
            connection,
            chunk,
            ..
        } = self;

        poll_fn(|cx| {
            let console_ready = match Pin::new(&mut *console).poll_fill_buf(cx) {
                Poll::Ready(Ok(_)) => true,
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => false,
            };

            let mut buf = ReadBuf::new(&mut chunk[..]);
            let incoming = match connection.poll_read_chunk(cx, &mut buf) {
                Poll::Ready(result) => Some(result.map(|()| buf.filled().len())),
                Poll::Pending => None,
            };

            let interrupted = shutdown.as_mut().poll(cx).is_ready();

            if console_ready || incoming.is_some() || interrupted {
                Poll::Ready(Ok(Readiness {
                    console: console_ready,
                    connection: incoming,
                    interrupted,
                }))
            } else {
                Poll::Pending
            }
        })
        .await
    }

    /// Service every ready source before reporting a termination, so a
    /// chunk read in the same wake-up as a quit is still printed.
    async fn dispatch(&mut self, readiness: Readiness) -> Option<Termination> {
        let mut termination = None;

        if readiness.console {
            termination = self.dispatch_line().await;
        }

        if let Some(result) = readiness.connection {
            let printed = self.print_chunk(result).await;
            termination = termination.or(printed);
        }

        if readiness.interrupted && termination.is_none() {
            self.notice(INTERRUPTED_NOTICE).await;
            termination = Some(Termination::Interrupted);
        }

        termination
    }

    async fn dispatch_line(&mut self) -> Option<Termination> {
        self.line.clear();
        match self.console.read_until(b'\n', &mut self.line).await {
            Ok(0) => {
                self.notice(INPUT_CLOSED_NOTICE).await;
                Some(Termination::ConsoleClosed)
            }
            Ok(_) => {
                if self.line.last() == Some(&b'\n') {
                    self.line.pop();
                }
                if self.line == QUIT_COMMAND {
                    self.notice(LEAVING_NOTICE).await;
                    return Some(Termination::Quit);
                }
                // A broken connection shows up as a disconnect on the next read.
                if let Err(error) = self.connection.send_line(&self.line).await {
                    debug!(?error, "failed to send line");
                }
                None
            }
            Err(error) => {
                warn!(?error, "failed to read console line");
                self.notice(INPUT_CLOSED_NOTICE).await;
                Some(Termination::ConsoleClosed)
            }
        }
    }

    async fn print_chunk(&mut self, result: io::Result<usize>) -> Option<Termination> {
        match result {
            Ok(0) => {
                self.notice(PEER_DISCONNECTED_NOTICE).await;
                Some(Termination::PeerClosed)
            }
            Ok(len) => {
                // Chunks are printed as received; line boundaries are not restored.
                let mut tagged = Vec::with_capacity(self.peer_label.len() + 2 + len);
                tagged.extend_from_slice(self.peer_label.as_bytes());
                tagged.extend_from_slice(b": ");
                tagged.extend_from_slice(&self.chunk[..len]);
                self.emit(&tagged).await;
                self.at_line_start = tagged.ends_with(b"\n");
                None
            }
            Err(error) => {
                warn!(?error, "failed to read from peer");
                self.notice(PEER_DISCONNECTED_NOTICE).await;
                Some(Termination::ReadFailed(error))
            }
        }
    }

    async fn notice(&mut self, text: &str) {
        // Keep notices on their own line after a chunk that ended mid-line.
        if !self.at_line_start {
            self.emit(b"\n").await;
            self.at_line_start = true;
        }
        if let Err(error) = write_notice(&mut self.output, text).await {
            warn!(?error, "failed to write output");
        }
    }

    async fn emit(&mut self, bytes: &[u8]) {
        if let Err(error) = write_flushed(&mut self.output, bytes).await {
            warn!(?error, "failed to write output");
        }
    }
}

/// Write `text` as one line to an operator-facing sink.
pub async fn write_notice<W>(writer: &mut W, text: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = String::with_capacity(text.len() + 1);
    line.push_str(text);
    line.push('\n');
    write_flushed(writer, line.as_bytes()).await
}

async fn write_flushed<W>(writer: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}
