//! Forwards one inbound tunnel exchange to a local HTTP port and streams the
//! response back as frames.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::mpsc;

use porthole_protocol::{encode_chunk, Frame};

/// A local-call failure, split by where in the exchange it happened. The
/// `response` frame goes out exactly once per exchange, so whoever handles
/// the error needs to know whether it is already spent.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Failed before any frame went out; the exchange can still be answered
    /// with a synthesized status.
    #[error("{0:#}")]
    BeforeHeaders(anyhow::Error),
    /// Failed after the response frame (and possibly body chunks) were
    /// relayed; only the end-of-stream marker is still legal.
    #[error("{0:#}")]
    AfterHeaders(anyhow::Error),
}

/// Request metadata for one exchange, as announced by the peer.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    /// Target local port; `None` means the primary configured port.
    pub port: Option<u16>,
}

/// Hop-by-hop headers stripped before the local call so they cannot conflict
/// with the local HTTP client's own framing.
fn is_hop_by_hop(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.starts_with("proxy-")
        || matches!(
            name.as_str(),
            "host"
                | "content-length"
                | "connection"
                | "keep-alive"
                | "te"
                | "trailers"
                | "transfer-encoding"
                | "upgrade"
        )
}

/// Issues local HTTP calls on behalf of the multiplexer.
#[derive(Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
    primary_port: u16,
}

impl HttpForwarder {
    pub fn new(primary_port: u16) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .pool_max_idle_per_host(10)
                .build()?,
            primary_port,
        })
    }

    /// Execute the local call for exchange `id` and stream the result out.
    ///
    /// The `response` frame goes out as soon as headers arrive; body chunks
    /// follow one `data` frame per chunk read, ending with a `final: true`
    /// marker. The body is never buffered whole, so memory stays bounded by
    /// one in-flight chunk regardless of response size.
    pub async fn proxy(
        &self,
        id: &str,
        head: RequestHead,
        body: Vec<u8>,
        tx: mpsc::Sender<Frame>,
    ) -> Result<(), ProxyError> {
        let port = head.port.unwrap_or(self.primary_port);
        let local_url = format!("http://127.0.0.1:{}{}", port, head.path);

        tracing::debug!("Forwarding {} {} -> {}", head.method, head.path, local_url);

        let mut response = async {
            let method = reqwest::Method::from_bytes(head.method.as_bytes())?;
            let mut request = self.client.request(method, &local_url);

            for (name, value) in &head.headers {
                if is_hop_by_hop(name) {
                    continue;
                }
                request = request.header(name, value);
            }

            if !body.is_empty() {
                request = request.body(body);
            }

            Ok::<_, anyhow::Error>(request.send().await?)
        }
        .await
        .map_err(ProxyError::BeforeHeaders)?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();

        tx.send(Frame::Response {
            id: id.to_string(),
            status_code: status,
            headers,
        })
        .await
        .map_err(|_| ProxyError::BeforeHeaders(anyhow::anyhow!("Tunnel writer closed")))?;

        // From here on the response frame is spent; any failure must reach
        // the caller as `AfterHeaders`.
        let mut sent = 0usize;
        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => return Err(ProxyError::AfterHeaders(e.into())),
            };
            sent += chunk.len();
            tx.send(Frame::Data {
                id: id.to_string(),
                data: Some(encode_chunk(&chunk)),
                r#final: false,
            })
            .await
            .map_err(|_| ProxyError::AfterHeaders(anyhow::anyhow!("Tunnel writer closed")))?;
        }

        tx.send(Frame::Data {
            id: id.to_string(),
            data: None,
            r#final: true,
        })
        .await
        .map_err(|_| ProxyError::AfterHeaders(anyhow::anyhow!("Tunnel writer closed")))?;

        tracing::debug!("Response {}: {} ({} body bytes)", id, status, sent);
        Ok(())
    }
}
