//! Owns the persistent tunnel WebSocket: sends the auth frame on open,
//! dispatches validated inbound frames to the multiplexer, and drains
//! cooperatively on shutdown.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use porthole_protocol::{unix_timestamp_ms, Frame};

use crate::forwarder::HttpForwarder;
use crate::mux::Multiplexer;

/// Manages one tunnel connection from open to drain.
pub struct TunnelConnection {
    ws_url: String,
    tunnel_token: String,
    primary_port: u16,
    exposed_ports: BTreeMap<String, u16>,
}

impl TunnelConnection {
    pub fn new(
        ws_url: String,
        tunnel_token: String,
        primary_port: u16,
        exposed_ports: BTreeMap<String, u16>,
    ) -> Self {
        Self {
            ws_url,
            tunnel_token,
            primary_port,
            exposed_ports,
        }
    }

    /// Run the tunnel until the peer disconnects or `shutdown` fires.
    ///
    /// There is no automatic reconnect: a transport error surfaces as `Err`
    /// and ends the process.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("Connecting to {}", self.ws_url);
        let (ws, _) = connect_async(self.ws_url.as_str())
            .await
            .context("Failed to open tunnel connection")?;
        let (mut sink, mut stream) = ws.split();

        // All outbound traffic funnels through one writer task so frame
        // boundaries never interleave.
        let (tx, mut rx) = mpsc::channel::<Frame>(256);
        let write_handle = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Failed to encode frame: {}", e);
                        break;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    tracing::error!("Failed to send frame: {}", e);
                    break;
                }
            }
            // Start the close handshake once the senders are gone.
            let _ = sink.send(Message::Close(None)).await;
        });

        let forwarder = HttpForwarder::new(self.primary_port)?;
        let mux = Multiplexer::new(
            tx.clone(),
            forwarder,
            host_of(&self.ws_url).unwrap_or_else(|| self.ws_url.clone()),
            self.exposed_ports.clone(),
        );

        // Identify ourselves before anything else moves on the wire.
        tx.send(Frame::Auth {
            token: Some(self.tunnel_token.clone()),
            port: Some(self.primary_port),
            exposed_ports: Some(self.exposed_ports.clone()),
            main_subdomain: None,
            timestamp: Some(unix_timestamp_ms()),
        })
        .await
        .context("Tunnel writer closed before auth")?;

        let mut transport_error: Option<anyhow::Error> = None;
        let mut graceful = false;
        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        // Anything that fails schema validation is dropped
                        // without a reply or visible log.
                        if let Some(frame) = Frame::decode(&text) {
                            mux.handle_frame(frame).await;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if let Ok(text) = String::from_utf8(bytes) {
                            if let Some(frame) = Frame::decode(&text) {
                                mux.handle_frame(frame).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("Edge closed the tunnel");
                        break;
                    }
                    // WebSocket-level ping/pong is answered by the stack.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        transport_error = Some(anyhow::Error::new(e).context("Tunnel read error"));
                        break;
                    }
                    None => {
                        tracing::info!("Tunnel stream ended");
                        break;
                    }
                },
                _ = shutdown.cancelled() => {
                    graceful = true;
                    break;
                }
            }
        }

        let active = mux.active_exchanges();
        if active > 0 {
            tracing::info!("Cancelling {} active exchange(s)", active);
        }
        mux.shutdown();
        // The writer closes the socket once every sender is gone; the mux and
        // its cancelled exchange tasks hold the remaining clones.
        drop(mux);
        drop(tx);

        // Let the writer finish the close handshake and give the close a
        // moment to propagate before the process exits.
        let _ = tokio::time::timeout(Duration::from_secs(2), write_handle).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        if let Some(e) = transport_error {
            return Err(e);
        }
        if graceful {
            tracing::info!("Tunnel shutdown complete");
        }
        Ok(())
    }
}

/// Default WebSocket endpoint derived from the token-service URL.
pub fn derive_ws_url(server_url: &str) -> String {
    let ws = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        server_url.to_string()
    };
    format!("{}/tunnel", ws.trim_end_matches('/'))
}

/// Hostname part of a ws/wss URL, used as the public base domain when
/// printing tunnel URLs.
fn host_of(ws_url: &str) -> Option<String> {
    let rest = ws_url
        .strip_prefix("wss://")
        .or_else(|| ws_url.strip_prefix("ws://"))?;
    let host_port = rest.split('/').next()?;
    let host = host_port.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_ws_url() {
        assert_eq!(
            derive_ws_url("https://porthole.example"),
            "wss://porthole.example/tunnel"
        );
        assert_eq!(
            derive_ws_url("http://localhost:8080/"),
            "ws://localhost:8080/tunnel"
        );
    }

    #[test]
    fn test_host_of() {
        assert_eq!(
            host_of("wss://edge.porthole.example/tunnel").as_deref(),
            Some("edge.porthole.example")
        );
        assert_eq!(
            host_of("ws://127.0.0.1:9090/tunnel").as_deref(),
            Some("127.0.0.1")
        );
        assert_eq!(host_of("not-a-url"), None);
    }
}
