//! Request multiplexer: turns the single tunnel connection into N concurrent
//! HTTP exchanges against local ports.
//!
//! All per-exchange state lives on this per-connection object, keyed by
//! exchange id: the accumulating body buffer with its request metadata, and
//! the cancellation token registry. A `close` frame cancels the token and
//! purges both, whether or not the exchange was active.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use porthole_protocol::{decode_chunk, encode_chunk, Frame};

use crate::forwarder::{HttpForwarder, ProxyError, RequestHead};

/// Body buffer and metadata for an exchange still receiving inbound chunks.
struct PendingRequest {
    head: RequestHead,
    chunks: Vec<Vec<u8>>,
}

/// Per-connection exchange multiplexer. Constructed when the tunnel opens and
/// dropped with it; nothing here outlives the connection.
pub struct Multiplexer {
    outbound: mpsc::Sender<Frame>,
    forwarder: HttpForwarder,
    public_domain: String,
    exposed_ports: BTreeMap<String, u16>,
    pending: Arc<DashMap<String, PendingRequest>>,
    cancels: Arc<DashMap<String, CancellationToken>>,
}

impl Multiplexer {
    pub fn new(
        outbound: mpsc::Sender<Frame>,
        forwarder: HttpForwarder,
        public_domain: String,
        exposed_ports: BTreeMap<String, u16>,
    ) -> Self {
        Self {
            outbound,
            forwarder,
            public_domain,
            exposed_ports,
            pending: Arc::new(DashMap::new()),
            cancels: Arc::new(DashMap::new()),
        }
    }

    /// Dispatch one already-validated frame. Callers drop anything that fails
    /// [`Frame::decode`] before reaching this point, so the hot path never
    /// sees malformed input.
    pub async fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Ping { id } => {
                let _ = self.outbound.send(Frame::Pong { id }).await;
            }

            Frame::Auth { main_subdomain: Some(subdomain), .. } => {
                self.announce(&subdomain);
            }
            // Auth without a subdomain assignment carries nothing for us.
            Frame::Auth { .. } => {}

            Frame::Request { id, method, path, headers, port } => {
                // State for an id is created by its first request frame; a
                // replayed announcement must not clobber a buffering or
                // executing exchange.
                if self.pending.contains_key(&id) || self.cancels.contains_key(&id) {
                    tracing::debug!("Duplicate request frame for exchange {}, ignoring", id);
                    return;
                }
                tracing::debug!("New exchange {}: {} {}", id, method, path);
                self.cancels.insert(id.clone(), CancellationToken::new());
                self.pending.insert(
                    id,
                    PendingRequest {
                        head: RequestHead { method, path, headers, port },
                        chunks: Vec::new(),
                    },
                );
            }

            Frame::Data { id, data, r#final } => {
                self.handle_data(id, data, r#final).await;
            }

            Frame::Close { id } => {
                tracing::debug!("Exchange {} closed by peer", id);
                self.purge(&id);
            }

            // Reserved or peer-only kinds; nothing to do on this side.
            Frame::Open { .. } | Frame::Pong { .. } | Frame::Response { .. } | Frame::Error { .. } => {}
        }
    }

    /// Accumulate one inbound body chunk; the `final` chunk triggers
    /// execution. Chunks arrive in send order on the one connection, so
    /// concatenation reconstructs the body exactly.
    async fn handle_data(&self, id: String, data: Option<String>, r#final: bool) {
        let chunk = match data {
            Some(encoded) => match decode_chunk(&encoded) {
                Some(bytes) => bytes,
                // Invalid payload encoding gets the silent-drop treatment.
                None => return,
            },
            None => Vec::new(),
        };

        if !r#final {
            if let Some(mut entry) = self.pending.get_mut(&id) {
                entry.chunks.push(chunk);
            }
            // No pending exchange (never announced, or already closed): no-op.
            return;
        }

        let Some((_, mut request)) = self.pending.remove(&id) else {
            return;
        };
        request.chunks.push(chunk);
        let body = request.chunks.concat();

        let cancel = self
            .cancels
            .get(&id)
            .map(|token| token.value().clone())
            .unwrap_or_default();
        self.spawn_exchange(id, request.head, body, cancel);
    }

    /// Run the local call as its own task so the read loop stays free to
    /// interleave other exchanges' frames.
    fn spawn_exchange(&self, id: String, head: RequestHead, body: Vec<u8>, cancel: CancellationToken) {
        let forwarder = self.forwarder.clone();
        let outbound = self.outbound.clone();
        let cancels = self.cancels.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // The peer sent close; it expects no reply for this id.
                    tracing::debug!("Exchange {} cancelled mid-flight", id);
                }
                result = forwarder.proxy(&id, head, body, outbound.clone()) => {
                    match result {
                        Ok(()) => {}
                        Err(ProxyError::BeforeHeaders(e)) => {
                            tracing::warn!("Exchange {} failed upstream: {}", id, e);
                            send_bad_gateway(&outbound, &id, &e).await;
                        }
                        Err(ProxyError::AfterHeaders(e)) => {
                            // The response frame is already spent; the only
                            // frame still legal for this id is end-of-stream.
                            tracing::warn!("Exchange {} failed mid-stream: {}", id, e);
                            let _ = outbound
                                .send(Frame::Data {
                                    id: id.clone(),
                                    data: None,
                                    r#final: true,
                                })
                                .await;
                        }
                    }
                }
            }
            cancels.remove(&id);
        });
    }

    /// Cancel and forget everything held for `id`. Idempotent.
    fn purge(&self, id: &str) {
        if let Some((_, token)) = self.cancels.remove(id) {
            token.cancel();
        }
        self.pending.remove(id);
    }

    fn announce(&self, subdomain: &str) {
        tracing::info!("Tunnel ready: https://{}.{}", subdomain, self.public_domain);
        for service in self.exposed_ports.keys() {
            tracing::info!(
                "  {}: https://{}-{}.{}",
                service,
                subdomain,
                service,
                self.public_domain
            );
        }
    }

    /// Exchanges with a live cancellation token (buffering or executing).
    pub fn active_exchanges(&self) -> usize {
        self.cancels.len()
    }

    /// Cooperative drain at connection teardown: cancel every still-active
    /// exchange and clear all per-exchange state.
    pub fn shutdown(&self) {
        for entry in self.cancels.iter() {
            entry.value().cancel();
        }
        self.cancels.clear();
        self.pending.clear();
    }

    #[cfg(test)]
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.cancels.is_empty()
    }
}

/// Relay a genuine backend failure to the original caller instead of letting
/// the public request hang. Cancellations never get here.
async fn send_bad_gateway(outbound: &mpsc::Sender<Frame>, id: &str, err: &anyhow::Error) {
    let headers = HashMap::from([(
        "content-type".to_string(),
        "application/json".to_string(),
    )]);
    if outbound
        .send(Frame::Response {
            id: id.to_string(),
            status_code: 502,
            headers,
        })
        .await
        .is_err()
    {
        return;
    }

    let body = serde_json::json!({
        "error": "Bad Gateway",
        "message": err.to_string(),
    })
    .to_string();
    let _ = outbound
        .send(Frame::Data {
            id: id.to_string(),
            data: Some(encode_chunk(body.as_bytes())),
            r#final: true,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use http_body_util::{BodyExt, Full};
    use hyper::body::{Bytes, Incoming};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;

    fn mux_with_capture(primary_port: u16) -> (Multiplexer, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(64);
        let forwarder = HttpForwarder::new(primary_port).unwrap();
        let mux = Multiplexer::new(tx, forwarder, "porthole.test".to_string(), BTreeMap::new());
        (mux, rx)
    }

    async fn recv_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timed out waiting for frame")
            .expect("Outbound channel closed")
    }

    /// Serve every request on an ephemeral port with `handler`.
    async fn spawn_local_server<F>(handler: F) -> u16
    where
        F: Fn(String, Vec<u8>) -> Response<Full<Bytes>> + Clone + Send + Sync + 'static,
    {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind local test server");
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let handler = handler.clone();
                        async move {
                            let path = req.uri().path().to_string();
                            let body = req.into_body().collect().await.unwrap().to_bytes().to_vec();
                            Ok::<_, std::convert::Infallible>(handler(path, body))
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        port
    }

    fn request_frame(id: &str, method: &str, path: &str, port: Option<u16>) -> Frame {
        Frame::Request {
            id: id.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            headers: HashMap::new(),
            port,
        }
    }

    fn data_frame(id: &str, chunk: Option<&[u8]>, r#final: bool) -> Frame {
        Frame::Data {
            id: id.to_string(),
            data: chunk.map(encode_chunk),
            r#final,
        }
    }

    #[tokio::test]
    async fn test_ping_gets_immediate_pong() {
        let (mux, mut rx) = mux_with_capture(1);
        mux.handle_frame(Frame::Ping { id: "k1".to_string() }).await;
        assert_eq!(recv_frame(&mut rx).await, Frame::Pong { id: "k1".to_string() });
    }

    #[tokio::test]
    async fn test_health_scenario() {
        let port = spawn_local_server(|path, _| {
            assert_eq!(path, "/health");
            Response::builder()
                .header("content-type", "application/json")
                .body(Full::new(Bytes::from_static(b"{\"ok\":true}")))
                .unwrap()
        })
        .await;

        let (mux, mut rx) = mux_with_capture(1);
        mux.handle_frame(request_frame("x", "GET", "/health", Some(port))).await;
        mux.handle_frame(data_frame("x", None, true)).await;

        match recv_frame(&mut rx).await {
            Frame::Response { id, status_code, headers } => {
                assert_eq!(id, "x");
                assert_eq!(status_code, 200);
                assert_eq!(
                    headers.get("content-type").map(String::as_str),
                    Some("application/json")
                );
            }
            other => panic!("Expected response frame, got {other:?}"),
        }

        match recv_frame(&mut rx).await {
            Frame::Data { id, data, r#final } => {
                assert_eq!(id, "x");
                assert!(!r#final);
                assert_eq!(decode_chunk(&data.unwrap()).unwrap(), b"{\"ok\":true}");
            }
            other => panic!("Expected body chunk, got {other:?}"),
        }

        match recv_frame(&mut rx).await {
            Frame::Data { id, r#final, .. } => {
                assert_eq!(id, "x");
                assert!(r#final);
            }
            other => panic!("Expected terminal chunk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_chunked_body_reassembles_byte_for_byte() {
        // Echo server: the response body is the request body.
        let port = spawn_local_server(|_, body| {
            Response::builder()
                .header("content-type", "application/octet-stream")
                .body(Full::new(Bytes::from(body)))
                .unwrap()
        })
        .await;

        let payload: Vec<u8> = (0u16..2048).map(|i| (i % 251) as u8).collect();

        let (mux, mut rx) = mux_with_capture(port);
        mux.handle_frame(request_frame("e1", "POST", "/echo", None)).await;
        // Arbitrary uneven splits, final chunk carries the tail.
        mux.handle_frame(data_frame("e1", Some(&payload[..1]), false)).await;
        mux.handle_frame(data_frame("e1", Some(&payload[1..700]), false)).await;
        mux.handle_frame(data_frame("e1", Some(&payload[700..700]), false)).await;
        mux.handle_frame(data_frame("e1", Some(&payload[700..]), true)).await;

        match recv_frame(&mut rx).await {
            Frame::Response { status_code, .. } => assert_eq!(status_code, 200),
            other => panic!("Expected response frame, got {other:?}"),
        }

        let mut echoed = Vec::new();
        loop {
            match recv_frame(&mut rx).await {
                Frame::Data { data, r#final, .. } => {
                    if let Some(chunk) = data {
                        echoed.extend(decode_chunk(&chunk).unwrap());
                    }
                    if r#final {
                        break;
                    }
                }
                other => panic!("Expected body chunk, got {other:?}"),
            }
        }
        assert_eq!(echoed, payload);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_before_body_purges_everything() {
        let (mux, mut rx) = mux_with_capture(1);

        mux.handle_frame(request_frame("r1", "GET", "/slow", None)).await;
        mux.handle_frame(Frame::Close { id: "r1".to_string() }).await;
        assert!(mux.is_idle());

        // A late terminal chunk finds no pending body buffer: no execution,
        // no outbound frames, ever.
        mux.handle_frame(data_frame("r1", None, true)).await;
        assert!(mux.is_idle());

        let silent = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(silent.is_err(), "No frame may be emitted for a closed exchange");
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent_for_unknown_exchange() {
        let (mux, mut rx) = mux_with_capture(1);
        mux.handle_frame(Frame::Close { id: "ghost".to_string() }).await;
        assert!(mux.is_idle());

        let silent = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(silent.is_err());
    }

    #[tokio::test]
    async fn test_upstream_failure_relays_bad_gateway() {
        // Grab a port with no listener behind it.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = listener.local_addr().unwrap().port();
        drop(listener);

        let (mux, mut rx) = mux_with_capture(dead_port);
        mux.handle_frame(request_frame("f1", "GET", "/", None)).await;
        mux.handle_frame(data_frame("f1", None, true)).await;

        match recv_frame(&mut rx).await {
            Frame::Response { id, status_code, headers } => {
                assert_eq!(id, "f1");
                assert_eq!(status_code, 502);
                assert_eq!(
                    headers.get("content-type").map(String::as_str),
                    Some("application/json")
                );
            }
            other => panic!("Expected 502 response, got {other:?}"),
        }

        match recv_frame(&mut rx).await {
            Frame::Data { data, r#final, .. } => {
                assert!(r#final);
                let body = decode_chunk(&data.unwrap()).unwrap();
                let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(parsed["error"], "Bad Gateway");
            }
            other => panic!("Expected terminal error body, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_midstream_failure_emits_one_response_then_terminal_chunk() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Promise 1000 body bytes, deliver 7, then drop the socket.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 1000\r\n\r\npartial")
                .await;
            let _ = stream.flush().await;
        });

        let (mux, mut rx) = mux_with_capture(port);
        mux.handle_frame(request_frame("m1", "GET", "/stream", None)).await;
        mux.handle_frame(data_frame("m1", None, true)).await;

        let mut statuses = Vec::new();
        loop {
            match recv_frame(&mut rx).await {
                Frame::Response { status_code, .. } => statuses.push(status_code),
                Frame::Data { r#final, .. } => {
                    if r#final {
                        break;
                    }
                }
                other => panic!("Unexpected frame {other:?}"),
            }
        }
        assert_eq!(statuses, vec![200], "Exchange must see exactly one response frame");

        // Nothing further may follow the end-of-stream marker.
        let silent = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(silent.is_err(), "Exchange must end at the terminal chunk");
    }

    #[tokio::test]
    async fn test_close_during_local_call_goes_silent() {
        // Local server that accepts the connection and then stalls forever.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let stall = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(3600)).await;
            drop(stream);
        });

        let (mux, mut rx) = mux_with_capture(port);
        mux.handle_frame(request_frame("s1", "GET", "/hang", None)).await;
        mux.handle_frame(data_frame("s1", None, true)).await;

        // Let the spawned exchange reach the local call before cancelling.
        tokio::time::sleep(Duration::from_millis(100)).await;
        mux.handle_frame(Frame::Close { id: "s1".to_string() }).await;
        assert!(mux.is_idle());

        let silent = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(silent.is_err(), "A cancelled exchange must emit nothing");
        stall.abort();
    }

    #[tokio::test]
    async fn test_duplicate_request_frame_keeps_first_exchange() {
        let port = spawn_local_server(|path, _| {
            Response::builder()
                .body(Full::new(Bytes::from(format!("hit:{path}"))))
                .unwrap()
        })
        .await;

        let (mux, mut rx) = mux_with_capture(port);
        mux.handle_frame(request_frame("d1", "GET", "/first", None)).await;
        mux.handle_frame(data_frame("d1", Some(b"x"), false)).await;
        // A replayed announcement must not reset the metadata or body buffer.
        mux.handle_frame(request_frame("d1", "GET", "/second", None)).await;
        mux.handle_frame(data_frame("d1", None, true)).await;

        match recv_frame(&mut rx).await {
            Frame::Response { status_code, .. } => assert_eq!(status_code, 200),
            other => panic!("Expected response frame, got {other:?}"),
        }

        let mut body = Vec::new();
        loop {
            match recv_frame(&mut rx).await {
                Frame::Data { data, r#final, .. } => {
                    if let Some(chunk) = data {
                        body.extend(decode_chunk(&chunk).unwrap());
                    }
                    if r#final {
                        break;
                    }
                }
                other => panic!("Expected body chunk, got {other:?}"),
            }
        }
        assert_eq!(body, b"hit:/first");
    }

    #[tokio::test]
    async fn test_interleaved_exchanges_stay_isolated() {
        let port = spawn_local_server(|path, _| {
            Response::builder()
                .body(Full::new(Bytes::from(format!("hit:{path}"))))
                .unwrap()
        })
        .await;

        let (mux, mut rx) = mux_with_capture(port);
        mux.handle_frame(request_frame("a", "GET", "/one", None)).await;
        mux.handle_frame(request_frame("b", "GET", "/two", None)).await;
        mux.handle_frame(data_frame("b", None, true)).await;
        mux.handle_frame(data_frame("a", None, true)).await;

        let mut bodies: HashMap<String, Vec<u8>> = HashMap::new();
        let mut finals = 0;
        while finals < 2 {
            match recv_frame(&mut rx).await {
                Frame::Data { id, data, r#final } => {
                    if let Some(chunk) = data {
                        bodies.entry(id).or_default().extend(decode_chunk(&chunk).unwrap());
                    }
                    if r#final {
                        finals += 1;
                    }
                }
                Frame::Response { status_code, .. } => assert_eq!(status_code, 200),
                other => panic!("Unexpected frame {other:?}"),
            }
        }

        assert_eq!(bodies["a"], b"hit:/one");
        assert_eq!(bodies["b"], b"hit:/two");
    }
}
