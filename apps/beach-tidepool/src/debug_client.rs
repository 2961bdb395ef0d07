use anyhow::{Context, Result};
use clap::Subcommand;
use futures_util::{SinkExt, StreamExt};
use tidepool_sync::protocol::{JOIN_VERB, STATE_VERB};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Subcommand, Debug)]
pub enum DebugCommand {
    /// Print every state frame the room broadcasts
    Tail {
        /// Exit after this many frames
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Replace the room state with a JSON value
    Push {
        /// JSON payload, e.g. '{"x":1}'
        state: String,
    },
}

pub async fn run_debug_client(
    url: String,
    token: String,
    room: String,
    command: DebugCommand,
) -> Result<()> {
    debug!("Connecting to {} for room {}", url, room);

    let (ws_stream, _) = timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
        .await
        .map_err(|_| anyhow::anyhow!("connection timeout - is the relay running?"))?
        .with_context(|| format!("failed to connect to {url}"))?;
    let (mut write, mut read) = ws_stream.split();

    write
        .send(Message::Text(format!("{JOIN_VERB} {token} {room}").into()))
        .await?;

    match command {
        DebugCommand::Tail { count } => {
            let mut seen = 0usize;
            while let Some(msg) = read.next().await {
                match msg? {
                    Message::Text(text) => {
                        println!("{}", text.as_str());
                        seen += 1;
                        if count.is_some_and(|limit| seen >= limit) {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
        DebugCommand::Push { state } => {
            let value: serde_json::Value =
                serde_json::from_str(&state).context("state must be valid JSON")?;
            write
                .send(Message::Text(format!("{STATE_VERB} {room} {value}").into()))
                .await?;
            println!("pushed state to room {room}");
        }
    }

    write.send(Message::Close(None)).await?;

    Ok(())
}
