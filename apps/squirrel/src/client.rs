use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Domain;
use crate::protocol::{Envelope, Event, IdentityPayload};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Broadcasts stdin under a fresh id, printing the link subscribers should
/// open.
pub async fn run_broadcast(domain: Domain, output: bool) -> Result<()> {
    let id = Uuid::new_v4().to_string();
    println!("ID: {id}");
    println!("Subscriber link: {}", domain.subscriber_link(&id));

    let input = BufReader::new(tokio::io::stdin());
    let echo = output.then(tokio::io::stdout);
    broadcast(&domain.websocket_url(), &id, input, echo).await
}

pub async fn run_listen(domain: Domain, peer_id: String) -> Result<()> {
    listen(&domain.websocket_url(), &peer_id, tokio::io::stdout()).await
}

/// Announces `id` as a broadcaster, waits for the first subscriber, then
/// sends every line of `input` until it ends.
pub async fn broadcast<R, W>(url: &str, id: &str, input: R, mut echo: Option<W>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let socket = connect(url).await?;
    let (mut write, mut read) = socket.split();

    let identity = Envelope::identity(id, IdentityPayload::broadcaster()).encode()?;
    write.send(Message::Text(identity.into())).await?;
    info!(id = %id, "waiting for a subscriber");

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match Envelope::decode(&text) {
                Ok(Envelope {
                    event: Event::SubscriberAck(_),
                    ..
                }) => break,
                Ok(other) => debug!(event = other.event.name(), "ignoring message while waiting"),
                Err(err) => warn!(error = %err, "undecodable message from relay"),
            },
            Some(Ok(Message::Close(_))) | None => bail!("relay closed the connection"),
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(err).context("relay connection failed"),
        }
    }
    info!(id = %id, "subscriber connected, streaming input");

    let mut lines = input.lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read input")? else {
                    break;
                };
                if let Some(out) = echo.as_mut() {
                    out.write_all(line.as_bytes()).await?;
                    out.write_all(b"\n").await?;
                    out.flush().await?;
                }
                let frame = Envelope::log_line(id, line).encode()?;
                write.send(Message::Text(frame.into())).await?;
            }
            // Reading keeps pings answered while input is quiet.
            incoming = read.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => bail!("relay closed the connection"),
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err).context("relay connection failed"),
            },
        }
    }

    debug!("input finished, closing");
    let _ = write.send(Message::Close(None)).await;
    Ok(())
}

/// Subscribes to `peer_id` and copies every relayed line to `out` until the
/// relay closes the connection.
pub async fn listen<W>(url: &str, peer_id: &str, mut out: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let socket = connect(url).await?;
    let (mut write, mut read) = socket.split();

    let identity = Envelope::identity("", IdentityPayload::subscriber(peer_id)).encode()?;
    write.send(Message::Text(identity.into())).await?;

    while let Some(message) = read.next().await {
        match message.context("relay connection failed")? {
            Message::Text(text) => {
                out.write_all(text.as_bytes()).await?;
                out.write_all(b"\n").await?;
                out.flush().await?;
            }
            Message::Close(frame) => {
                debug!(?frame, "relay closed the connection");
                break;
            }
            _ => {}
        }
    }
    info!(peer_id = %peer_id, "stream ended");
    Ok(())
}

async fn connect(url: &str) -> Result<Socket> {
    debug!(url = %url, "connecting to relay");
    match timeout(CONNECT_TIMEOUT, connect_async(url)).await {
        Ok(Ok((socket, _))) => Ok(socket),
        Ok(Err(err)) => {
            error!(url = %url, error = %err, "failed to connect");
            Err(anyhow!("connection failed: {err}"))
        }
        Err(_) => Err(anyhow!(
            "connection timeout after {}s, is the relay running?",
            CONNECT_TIMEOUT.as_secs()
        )),
    }
}
