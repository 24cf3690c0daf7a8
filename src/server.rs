//! Single-client server session.
//!
//! The server waits for exactly one peer, serves its requests one line at a
//! time until the peer goes away, then releases everything. Each reply is
//! written and flushed before the next request line is read, so replies
//! leave in request order.

use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::Config;
use crate::events::{Event, Sink};
use crate::locator;
use crate::protocol::{strip_terminator, Command, Parser, Reply};
use crate::store::{BlobStore, DirStore};

/// Initial capacity of the request line buffer
const LINE_CAPACITY: usize = 1024;

/// Lifecycle of the one session a server process runs.
///
/// Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Listening,
    Accepted,
    Streaming,
    Closing,
    Closed,
}

#[derive(Debug)]
struct Lifecycle {
    state: SessionState,
}

impl Lifecycle {
    fn new() -> Self {
        Lifecycle {
            state: SessionState::Listening,
        }
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(next > self.state, "{:?} -> {:?}", self.state, next);
        trace!(from = ?self.state, to = ?next, "Session state");
        self.state = next;
    }
}

/// Open the store, find a port and serve one client to completion.
pub async fn run(config: &Config, sink: Sink) -> Result<(), Box<dyn std::error::Error>> {
    let store = DirStore::open(&config.directory, &sink).await?;
    let (listener, port) = locator::locate_listen(&config.bind, config.ports, &sink).await?;
    debug!(port, directory = %store.root().display(), "Server ready");

    spawn(listener, Arc::new(store), sink).await?;
    Ok(())
}

/// Run [`serve_once`] on its own task.
pub fn spawn<S: BlobStore>(listener: TcpListener, store: Arc<S>, sink: Sink) -> JoinHandle<()> {
    tokio::spawn(serve_once(listener, store, sink))
}

/// Accept one peer, serve it until it disconnects, then release everything.
///
/// The listener is consumed: no second peer is ever accepted. Errors end the
/// session and are reported to `sink`; nothing is returned to the caller.
pub async fn serve_once<S: BlobStore>(listener: TcpListener, store: Arc<S>, sink: Sink) {
    let mut lifecycle = Lifecycle::new();
    if let Ok(addr) = listener.local_addr() {
        sink.post(Event::ListeningOn { port: addr.port() });
    }

    let accepted = listener.accept().await;
    drop(listener);

    let (stream, peer) = match accepted {
        Ok(pair) => pair,
        Err(e) => {
            sink.post(Event::SessionError {
                reason: e.to_string(),
            });
            lifecycle.advance(SessionState::Closing);
            sink.post(Event::SessionClosing);
            lifecycle.advance(SessionState::Closed);
            return;
        }
    };
    lifecycle.advance(SessionState::Accepted);
    sink.post(Event::ClientConnected { peer });

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    lifecycle.advance(SessionState::Streaming);
    sink.post(Event::StreamsReady);

    if let Err(e) = serve_requests(&mut reader, &mut write_half, &*store, &sink).await {
        sink.post(Event::SessionError {
            reason: e.to_string(),
        });
    }

    lifecycle.advance(SessionState::Closing);
    sink.post(Event::SessionClosing);
    if let Err(e) = write_half.shutdown().await {
        if e.kind() != io::ErrorKind::NotConnected {
            sink.post(Event::CloseFailed {
                reason: e.to_string(),
            });
        }
    }
    drop(reader);
    drop(write_half);
    lifecycle.advance(SessionState::Closed);
}

/// The request loop: read a line, act on it, reply, repeat until EOF.
///
/// Malformed lines are reported and skipped. An I/O error on either
/// direction ends the loop with that error.
pub async fn serve_requests<R, W, S>(
    reader: &mut R,
    writer: &mut W,
    store: &S,
    sink: &Sink,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    S: BlobStore,
{
    let mut line = Vec::with_capacity(LINE_CAPACITY);

    loop {
        line.clear();

        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            trace!("Connection closed by client");
            return Ok(());
        }

        let text = String::from_utf8_lossy(strip_terminator(&line)).into_owned();
        sink.post(Event::RequestReceived { line: text.clone() });

        let command = match Parser::parse(&line) {
            Ok(command) => command,
            Err(e) => {
                sink.post(Event::RequestDropped {
                    line: text,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        if let Some(reply) = execute(command, store, sink).await {
            let bytes = reply.to_line();
            writer.write_all(&bytes).await?;
            writer.flush().await?;
            sink.post(Event::ReplySent {
                line: String::from_utf8_lossy(strip_terminator(&bytes)).into_owned(),
            });
        }
    }
}

/// Apply a command to the store. `None` means no reply is sent.
async fn execute<S: BlobStore>(command: Command, store: &S, sink: &Sink) -> Option<Reply> {
    match command {
        Command::Upload { name, payload } => match store.put(&name, payload).await {
            Ok(()) => {
                sink.post(Event::Uploaded { name: name.clone() });
                Some(Reply::Uploaded { name })
            }
            Err(e) => {
                // The client is never told; it just sees no confirmation.
                sink.post(Event::StoreFailure {
                    name,
                    reason: format!("Error writing file: {}", e),
                });
                None
            }
        },

        Command::Retrieve { name } => match store.get(&name).await {
            Ok(Some(payload)) => Some(Reply::Content { name, payload }),
            Ok(None) => Some(Reply::NotFound { name }),
            Err(e) => {
                let reason = format!("Error reading file: {}", e);
                sink.post(Event::StoreFailure {
                    name: name.clone(),
                    reason: reason.clone(),
                });
                Some(Reply::Content {
                    name,
                    payload: reason.into(),
                })
            }
        },
    }
}
