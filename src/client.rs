//! Client session: one outbound connection driven by operator actions.
//!
//! The foreground writes commands on the write half; a background reader
//! task owns the read half and turns every server line into presentation
//! events. The two directions are independent byte streams, so no locking
//! is needed between them. When the reader stops, the session counts as
//! closed for the foreground too.

use bytes::BytesMut;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::events::{Event, Sink};
use crate::locator::{self, LocateError, PortRange};
use crate::protocol::{
    classify, format_retrieve, format_upload, strip_terminator, ContentNewlines, ServerMessage,
};

/// The open half of a session owned by the foreground.
struct Connection {
    writer: OwnedWriteHalf,
    open: Arc<AtomicBool>,
}

/// Client side of the protocol
pub struct Client {
    sink: Sink,
    newlines: ContentNewlines,
    connection: Option<Connection>,
}

impl Client {
    pub fn new(sink: Sink, newlines: ContentNewlines) -> Self {
        Client {
            sink,
            newlines,
            connection: None,
        }
    }

    /// Connect to the first server found in `range` and start the reader.
    ///
    /// The returned handle completes once the server closes the stream or
    /// the stream fails.
    pub async fn connect(
        &mut self,
        host: &str,
        range: PortRange,
    ) -> Result<JoinHandle<()>, LocateError> {
        self.sink.post(Event::Connecting {
            host: host.to_string(),
            range,
        });
        let (stream, port) = locator::locate_connect(host, range, &self.sink).await?;
        self.sink.post(Event::Connected {
            host: host.to_string(),
            port,
        });

        let (read_half, write_half) = stream.into_split();
        let open = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_replies(
            BufReader::new(read_half),
            self.sink.clone(),
            self.newlines,
            Arc::clone(&open),
        ));

        self.connection = Some(Connection {
            writer: write_half,
            open,
        });
        Ok(reader)
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|c| c.open.load(Ordering::SeqCst))
    }

    /// Send one command line. Never waits for the reply.
    pub async fn submit(&mut self, line: &str) {
        if !self.is_connected() {
            self.connection = None;
            self.sink.post(Event::NotConnected);
            return;
        }
        let Some(connection) = self.connection.as_mut() else {
            return;
        };

        let mut frame = BytesMut::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        frame.extend_from_slice(b"\n");

        match write_frame(&mut connection.writer, &frame).await {
            Ok(()) => self.sink.post(Event::CommandSent {
                line: line.to_string(),
            }),
            Err(e) => {
                debug!(error = %e, "Write failed, closing session");
                self.disconnect();
                self.sink.post(Event::SendFailed {
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Upload `body` under `name`; both are trimmed first.
    pub async fn upload(&mut self, name: &str, body: &str) {
        self.submit(&format_upload(name, body)).await;
    }

    /// Ask for the content stored under `name`.
    pub async fn retrieve(&mut self, name: &str) {
        self.submit(&format_retrieve(name)).await;
    }

    /// Stop sending. The reader finishes when the server closes its side.
    pub async fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.open.store(false, Ordering::SeqCst);
            if let Err(e) = connection.writer.shutdown().await {
                debug!(error = %e, "Error closing connection");
            }
        }
    }

    fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.open.store(false, Ordering::SeqCst);
        }
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Background reader: classify each server line until EOF or error.
async fn read_replies<R>(mut reader: R, sink: Sink, newlines: ContentNewlines, open: Arc<AtomicBool>)
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => {
                trace!("Server closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Read failed");
                break;
            }
        }

        let text = String::from_utf8_lossy(strip_terminator(&line)).into_owned();
        let message = classify(&text, newlines);
        sink.post(Event::ServerLine { line: text });
        match message {
            ServerMessage::Content(payload) => sink.post(Event::ShowContent { payload }),
            ServerMessage::NotFound => sink.post(Event::ClearContent),
            ServerMessage::Other => {}
        }
    }

    open.store(false, Ordering::SeqCst);
    sink.post(Event::ConnectionLost);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{collector, drain};
    use crate::server;
    use crate::store::MemoryStore;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_test::io::Builder;

    /// Wait for the next event matching `pred`, returning everything seen.
    async fn wait_for(
        rx: &mut UnboundedReceiver<Event>,
        pred: impl Fn(&Event) -> bool,
    ) -> Vec<Event> {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("sink closed");
            let done = pred(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    /// A local port with nothing listening on it, and a server on a higher one.
    async fn start_server() -> (u16, u16, JoinHandle<()>, Arc<MemoryStore>) {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let vacant = probe.local_addr().unwrap().port();
        drop(probe);

        let (sink, _rx) = collector();
        let range = PortRange {
            begin: vacant.saturating_add(1),
            end: vacant.saturating_add(9),
        };
        let (listener, port) = locator::locate_listen("127.0.0.1", range, &sink)
            .await
            .unwrap();
        let store = Arc::new(MemoryStore::default());
        let handle = server::spawn(listener, Arc::clone(&store), sink);
        (vacant, port, handle, store)
    }

    #[tokio::test]
    async fn test_reader_classifies_lines() {
        let (sink, mut rx) = collector();
        let mock = Builder::new()
            .read(b"FILE_UPLOADED a.txt\n")
            .read(b"FILE_CONTENT a.txt one\\ntwo\n")
            .read(b"FILE_NOT_FOUND b.txt\n")
            .build();
        let open = Arc::new(AtomicBool::new(true));

        read_replies(
            BufReader::new(mock),
            sink,
            ContentNewlines::Strip,
            Arc::clone(&open),
        )
        .await;

        assert!(!open.load(Ordering::SeqCst));
        assert_eq!(
            drain(&mut rx),
            vec![
                Event::ServerLine {
                    line: "FILE_UPLOADED a.txt".to_string()
                },
                Event::ServerLine {
                    line: "FILE_CONTENT a.txt one\\ntwo".to_string()
                },
                Event::ShowContent {
                    payload: "onetwo".to_string()
                },
                Event::ServerLine {
                    line: "FILE_NOT_FOUND b.txt".to_string()
                },
                Event::ClearContent,
                Event::ConnectionLost,
            ]
        );
    }

    #[tokio::test]
    async fn test_reader_decodes_when_asked() {
        let (sink, mut rx) = collector();
        let mock = Builder::new().read(b"FILE_CONTENT a.txt one\\ntwo\n").build();

        read_replies(
            BufReader::new(mock),
            sink,
            ContentNewlines::Decode,
            Arc::new(AtomicBool::new(true)),
        )
        .await;

        assert!(drain(&mut rx).contains(&Event::ShowContent {
            payload: "one\ntwo".to_string()
        }));
    }

    #[tokio::test]
    async fn test_reader_stops_on_error() {
        let (sink, mut rx) = collector();
        let mock = Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        read_replies(
            BufReader::new(mock),
            sink,
            ContentNewlines::Strip,
            Arc::new(AtomicBool::new(true)),
        )
        .await;

        assert_eq!(drain(&mut rx), vec![Event::ConnectionLost]);
    }

    #[tokio::test]
    async fn test_submit_without_session() {
        let (sink, mut rx) = collector();
        let mut client = Client::new(sink, ContentNewlines::Strip);

        client.retrieve("a.txt").await;
        assert!(!client.is_connected());
        assert_eq!(drain(&mut rx), vec![Event::NotConnected]);
    }

    #[tokio::test]
    async fn test_connect_fails_without_server() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let (sink, mut rx) = collector();
        let mut client = Client::new(sink, ContentNewlines::Strip);
        let range = PortRange {
            begin: port,
            end: port,
        };

        let err = client.connect("127.0.0.1", range).await.unwrap_err();
        assert_eq!(err, LocateError::NoServerReachable(range));
        assert!(!client.is_connected());

        let events = drain(&mut rx);
        assert_eq!(
            events[0],
            Event::Connecting {
                host: "127.0.0.1".to_string(),
                range
            }
        );
    }

    #[tokio::test]
    async fn test_session_against_server() {
        let (vacant, port, server_handle, store) = start_server().await;
        let (sink, mut rx) = collector();
        let mut client = Client::new(sink, ContentNewlines::Strip);

        let range = PortRange {
            begin: vacant,
            end: vacant.saturating_add(9),
        };
        let reader = client.connect("127.0.0.1", range).await.unwrap();
        assert!(client.is_connected());

        let events = drain(&mut rx);
        assert!(matches!(
            events[1],
            Event::PortUnavailable { port: p, .. } if p == vacant
        ));
        assert!(events.contains(&Event::Connected {
            host: "127.0.0.1".to_string(),
            port
        }));

        client.upload(" hello.txt ", "world ").await;
        client.retrieve("hello.txt").await;
        client.retrieve("absent.txt").await;

        let seen = wait_for(&mut rx, |e| *e == Event::ClearContent).await;
        let server_lines: Vec<&Event> = seen
            .iter()
            .filter(|e| matches!(e, Event::ServerLine { .. }))
            .collect();
        assert_eq!(
            server_lines,
            vec![
                &Event::ServerLine {
                    line: "FILE_UPLOADED hello.txt".to_string()
                },
                &Event::ServerLine {
                    line: "FILE_CONTENT hello.txt world".to_string()
                },
                &Event::ServerLine {
                    line: "FILE_NOT_FOUND absent.txt".to_string()
                },
            ]
        );
        assert!(seen.contains(&Event::CommandSent {
            line: "UPLOAD hello.txt world".to_string()
        }));
        assert!(seen.contains(&Event::ShowContent {
            payload: "world".to_string()
        }));
        assert_eq!(store.value("hello.txt").unwrap(), "world");

        client.close().await;
        server_handle.await.unwrap();
        reader.await.unwrap();
        assert!(drain(&mut rx).contains(&Event::ConnectionLost));

        client.retrieve("hello.txt").await;
        assert_eq!(drain(&mut rx), vec![Event::NotConnected]);
    }

    #[tokio::test]
    async fn test_server_going_away_closes_session() {
        let (_vacant, port, server_handle, _store) = start_server().await;
        let (sink, mut rx) = collector();
        let mut client = Client::new(sink, ContentNewlines::Strip);

        let range = PortRange {
            begin: port,
            end: port,
        };
        let reader = client.connect("127.0.0.1", range).await.unwrap();

        server_handle.abort();
        let _ = server_handle.await;
        reader.await.unwrap();

        assert!(!client.is_connected());
        client.upload("a.txt", "b").await;
        let events = drain(&mut rx);
        assert_eq!(events.last(), Some(&Event::NotConnected));
    }
}
