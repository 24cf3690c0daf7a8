//! Terminal front end for the client.
//!
//! Stands in for a windowed operator surface: operator actions come from
//! stdin, and the three display sinks (outgoing commands, incoming server
//! lines, file content) are rendered to stdout.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::debug;

use crate::client::Client;
use crate::config::Config;
use crate::events::{Event, Sink};

const HELP: &str = "commands: upload <name> [content], retrieve <name>, help, quit";

/// An operator action typed at the prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Upload `body` under `name`
    Upload { name: String, body: String },
    /// Retrieve `name`
    Retrieve { name: String },
    Help,
    Quit,
}

/// Parse one line of operator input.
///
/// The upload body is everything after the name, taken verbatim; typing
/// `\n` in it produces a line break on the server.
pub fn parse_action(input: &str) -> Result<Action, String> {
    let input = input.trim_start();
    let (word, rest) = input.split_once(char::is_whitespace).unwrap_or((input, ""));

    match word.to_ascii_lowercase().as_str() {
        "upload" => {
            let rest = rest.trim_start();
            let (name, body) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            if name.is_empty() {
                return Err("upload needs a file name".to_string());
            }
            Ok(Action::Upload {
                name: name.to_string(),
                body: body.to_string(),
            })
        }
        "retrieve" => {
            let name = rest.trim();
            if name.is_empty() {
                return Err("retrieve needs a file name".to_string());
            }
            Ok(Action::Retrieve {
                name: name.to_string(),
            })
        }
        "help" | "?" => Ok(Action::Help),
        "quit" | "exit" => Ok(Action::Quit),
        "" => Err(HELP.to_string()),
        other => Err(format!("unknown command `{}` ({})", other, HELP)),
    }
}

/// Text for an event, or `None` for events the console does not show.
pub fn render(event: &Event) -> Option<String> {
    Some(match event {
        Event::Connecting { host, range } => format!("Trying to connect to {} on {}...", host, range),
        Event::PortUnavailable { port, reason, .. } => {
            format!("Could not connect on port {}: {}", port, reason)
        }
        Event::RangeExhausted { range, .. } => format!(
            "Unable to connect to any server between ports {} and {}.",
            range.begin, range.end
        ),
        Event::Connected { host, port } => format!("Connected to server at {}:{}", host, port),
        Event::CommandSent { line } => format!("CLIENT>>> {}", line),
        Event::NotConnected => "Not connected to a server.".to_string(),
        Event::SendFailed { reason } => format!("Could not send: {}", reason),
        Event::ServerLine { line } => format!("SERVER>>> {}", line),
        Event::ShowContent { payload } => format!("----- content -----\n{}\n-------------------", payload),
        Event::ClearContent => "----- content cleared -----".to_string(),
        Event::ConnectionLost => "Lost connection to server.".to_string(),
        _ => return None,
    })
}

/// Print rendered events until every sender is gone.
async fn present(mut events: UnboundedReceiver<Event>) {
    while let Some(event) = events.recv().await {
        if let Some(text) = render(&event) {
            println!("{}", text);
        }
    }
}

/// Connect, then relay operator input until `quit` or end of input.
pub async fn run_client(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let presenter = tokio::spawn(present(rx));
    let sink: Sink = Arc::new(tx);

    let mut client = Client::new(Arc::clone(&sink), config.content_newlines);
    let reader = match client.connect(&config.host, config.ports).await {
        Ok(reader) => Some(reader),
        // Already shown; the operator can still type and see "not connected".
        Err(e) => {
            debug!(error = %e, "No server");
            None
        }
    };

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_action(&line) {
            Ok(Action::Upload { name, body }) => client.upload(&name, &body).await,
            Ok(Action::Retrieve { name }) => client.retrieve(&name).await,
            Ok(Action::Help) => println!("{}", HELP),
            Ok(Action::Quit) => break,
            Err(message) => println!("{}", message),
        }
    }

    client.close().await;
    if let Some(reader) = reader {
        reader.await?;
    }
    drop(client);
    drop(sink);
    presenter.await?;
    Ok(())
}
