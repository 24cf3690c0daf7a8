//! Presentation events emitted by the sessions.
//!
//! The sessions never touch the operator surface directly. Every phase
//! boundary, diagnostic and piece of operator-visible content is posted as an
//! [`Event`] to a [`Sink`], which may be a log appender, a channel feeding a
//! terminal renderer, or a test collector.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::locator::{PortRange, Role};

/// Something the presentation layer may want to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    // Endpoint locator
    /// A bind or connect attempt on one port failed; the scan continues.
    PortUnavailable {
        role: Role,
        port: u16,
        reason: String,
    },
    /// The scan found a usable port.
    PortSelected { role: Role, port: u16 },
    /// Every port in the range failed.
    RangeExhausted { role: Role, range: PortRange },

    // Server session
    /// The storage directory did not exist and was created.
    StoreCreated { directory: PathBuf },
    ListeningOn { port: u16 },
    ClientConnected { peer: SocketAddr },
    StreamsReady,
    RequestReceived { line: String },
    /// A line that matched no verb, or lacked tokens, was ignored.
    RequestDropped { line: String, reason: String },
    Uploaded { name: String },
    ReplySent { line: String },
    StoreFailure { name: String, reason: String },
    SessionError { reason: String },
    SessionClosing,
    CloseFailed { reason: String },

    // Client session
    Connecting { host: String, range: PortRange },
    Connected { host: String, port: u16 },
    CommandSent { line: String },
    NotConnected,
    SendFailed { reason: String },
    ServerLine { line: String },
    ShowContent { payload: String },
    ClearContent,
    ConnectionLost,
}

/// The `post(event)` capability the sessions are parameterised by.
pub trait EventSink: Send + Sync {
    fn post(&self, event: Event);
}

/// Shared handle to a sink.
pub type Sink = Arc<dyn EventSink>;

impl EventSink for UnboundedSender<Event> {
    fn post(&self, event: Event) {
        // A closed receiver means nobody is watching any more.
        let _ = self.send(event);
    }
}

/// Renders events as log records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn post(&self, event: Event) {
        match event {
            Event::PortUnavailable { role, port, reason } => {
                warn!(%role, port, %reason, "Port unavailable, trying next")
            }
            Event::PortSelected { role, port } => info!(%role, port, "Port selected"),
            Event::RangeExhausted { role, range } => {
                error!(%role, %range, "No usable port in range")
            }
            Event::StoreCreated { directory } => {
                info!(directory = %directory.display(), "Created storage directory")
            }
            Event::ListeningOn { port } => info!(port, "Waiting for a client"),
            Event::ClientConnected { peer } => info!(%peer, "Client connected"),
            Event::StreamsReady => debug!("Streams ready"),
            Event::RequestReceived { line } => info!(%line, "Client says"),
            Event::RequestDropped { line, reason } => {
                debug!(%line, %reason, "Ignoring malformed request")
            }
            Event::Uploaded { name } => info!(%name, "Uploaded"),
            Event::ReplySent { line } => debug!(%line, "Reply sent"),
            Event::StoreFailure { name, reason } => warn!(%name, %reason, "Store failure"),
            Event::SessionError { reason } => warn!(%reason, "Session error"),
            Event::SessionClosing => info!("Terminating connection"),
            Event::CloseFailed { reason } => warn!(%reason, "Error closing connection"),
            Event::Connecting { host, range } => info!(%host, %range, "Connecting to server"),
            Event::Connected { host, port } => info!(%host, port, "Connected to server"),
            Event::CommandSent { line } => info!(%line, "CLIENT>>>"),
            Event::NotConnected => warn!("Not connected to a server"),
            Event::SendFailed { reason } => warn!(%reason, "Failed to send command"),
            Event::ServerLine { line } => info!(%line, "SERVER>>>"),
            Event::ShowContent { payload } => info!(%payload, "File content"),
            Event::ClearContent => debug!("File content cleared"),
            Event::ConnectionLost => warn!("Lost connection to server"),
        }
    }
}

/// Test collector: a sink backed by an unbounded channel.
#[cfg(test)]
pub(crate) fn collector() -> (Sink, tokio::sync::mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (Arc::new(tx), rx)
}

/// Drain everything currently queued on a collector.
#[cfg(test)]
pub(crate) fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = collector();
        sink.post(Event::StreamsReady);
        sink.post(Event::SessionClosing);
        assert_eq!(drain(&mut rx), vec![Event::StreamsReady, Event::SessionClosing]);
    }

    #[test]
    fn test_channel_sink_ignores_closed_receiver() {
        let (sink, rx) = collector();
        drop(rx);
        sink.post(Event::ConnectionLost);
    }

    #[test]
    fn test_tracing_sink_accepts_every_kind() {
        let sink = TracingSink;
        sink.post(Event::PortUnavailable {
            role: Role::Listen,
            port: 1,
            reason: "in use".to_string(),
        });
        sink.post(Event::RangeExhausted {
            role: Role::Connect,
            range: PortRange { begin: 1, end: 2 },
        });
        sink.post(Event::ShowContent {
            payload: "x".to_string(),
        });
    }
}
