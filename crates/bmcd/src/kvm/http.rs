//! MJPEG-over-HTTP streaming and the stubbed VNC-WebSocket listener.
use super::KvmError;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Fixed-content body; hyper 1.x bodies are assembled from combinators.
fn full(data: impl Into<Bytes>) -> UnsyncBoxBody<Bytes, Infallible> {
    http_body_util::Full::new(data.into()).boxed_unsync()
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub listen: SocketAddr,
    pub path: String,
    /// JPEG quality, clamped to [1, 100].
    pub quality: u8,
    pub max_clients: usize,
    pub boundary: String,
    pub idle_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".parse().expect("static addr"),
            path: "/stream".into(),
            quality: 80,
            max_clients: 8,
            boundary: "frame".into(),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// An encoded JPEG frame ready for distribution.
#[derive(Debug)]
pub struct JpegFrame {
    pub data: Vec<u8>,
}

/// Registry entry for one streaming client.
#[allow(unused)]
pub struct HttpClientInfo {
    pub id: u64,
    pub remote: String,
    pub connected_at_ms: u64,
    pub last_seen_ms: Arc<AtomicU64>,
}

type Registry = Arc<Mutex<HashMap<u64, Arc<HttpClientInfo>>>>;

pub struct MjpegServer {
    config: HttpConfig,
    clients: Registry,
    next_id: Arc<AtomicU64>,
}

impl MjpegServer {
    pub fn new(config: HttpConfig) -> Self {
        Self {
            config,
            clients: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().expect("clients lock poisoned").len()
    }

    /// Accept and serve HTTP clients until `ctx` cancels.
    pub async fn run(
        &self,
        ctx: CancellationToken,
        frames: watch::Receiver<Option<Arc<JpegFrame>>>,
    ) -> Result<(), KvmError> {
        let listener = TcpListener::bind(self.config.listen)
            .await
            .map_err(KvmError::ListenFailed)?;
        tracing::info!(addr = %self.config.listen, "mjpeg server listening");

        loop {
            let accepted = tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            let (stream, remote) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "http accept failed");
                    continue;
                }
            };

            let config = self.config.clone();
            let clients = self.clients.clone();
            let next_id = self.next_id.clone();
            let frames = frames.clone();
            let conn_ctx = ctx.clone();

            tokio::spawn(async move {
                let service = service_fn(move |request| {
                    handle_request(
                        request,
                        config.clone(),
                        clients.clone(),
                        next_id.clone(),
                        frames.clone(),
                        remote,
                    )
                });
                let conn = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service);
                tokio::select! {
                    result = conn => {
                        if let Err(e) = result {
                            tracing::debug!(error = %e, "http connection ended");
                        }
                    }
                    _ = conn_ctx.cancelled() => {}
                }
            });
        }
    }
}

async fn handle_request(
    request: Request<hyper::body::Incoming>,
    config: HttpConfig,
    clients: Registry,
    next_id: Arc<AtomicU64>,
    frames: watch::Receiver<Option<Arc<JpegFrame>>>,
    remote: SocketAddr,
) -> Result<Response<UnsyncBoxBody<Bytes, Infallible>>, Infallible> {
    if request.uri().path() != config.path {
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(full("not found"))
            .expect("static response"));
    }
    if clients.lock().expect("clients lock poisoned").len() >= config.max_clients {
        return Ok(Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(full("stream busy"))
            .expect("static response"));
    }

    let id = next_id.fetch_add(1, Ordering::Relaxed);
    let info = Arc::new(HttpClientInfo {
        id,
        remote: remote.to_string(),
        connected_at_ms: crate::telemetry::unix_millis(),
        last_seen_ms: Arc::new(AtomicU64::new(crate::telemetry::unix_millis())),
    });
    clients
        .lock()
        .expect("clients lock poisoned")
        .insert(id, info.clone());
    tracing::info!(client = id, remote = %info.remote, "mjpeg client connected");

    let guard = ClientGuard {
        id,
        clients: clients.clone(),
    };
    let boundary = config.boundary.clone();
    let stream = futures::stream::unfold(
        (frames, info, boundary, guard),
        |(mut frames, info, boundary, guard)| async move {
            if frames.changed().await.is_err() {
                return None;
            }
            let frame = frames.borrow_and_update().clone()?;
            info.last_seen_ms
                .store(crate::telemetry::unix_millis(), Ordering::Relaxed);
            let part = encode_part(&boundary, &frame.data);
            Some((
                Ok::<_, Infallible>(Frame::data(Bytes::from(part))),
                (frames, info, boundary, guard),
            ))
        },
    );

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(
            hyper::header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={}", config.boundary),
        )
        .header(hyper::header::CACHE_CONTROL, "no-cache")
        .body(StreamBody::new(stream).boxed_unsync())
        .expect("static response");
    Ok(response)
}

/// One multipart body part: boundary, headers, JPEG, trailing CRLF.
fn encode_part(boundary: &str, jpeg: &[u8]) -> Vec<u8> {
    let header = format!(
        "--{boundary}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

struct ClientGuard {
    id: u64,
    clients: Registry,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.clients
            .lock()
            .expect("clients lock poisoned")
            .remove(&self.id);
        tracing::info!(client = self.id, "mjpeg client disconnected");
    }
}

/// VNC-over-WebSocket is not implemented; the listener answers 501 so
/// clients get a definite signal instead of a hang.
pub async fn run_websocket_stub(ctx: CancellationToken, listen: SocketAddr) -> Result<(), KvmError> {
    let listener = TcpListener::bind(listen).await.map_err(KvmError::ListenFailed)?;
    tracing::info!(addr = %listen, "vnc websocket stub listening");
    loop {
        let accepted = tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        let Ok((stream, _remote)) = accepted else {
            continue;
        };
        let conn_ctx = ctx.clone();
        tokio::spawn(async move {
            let service = service_fn(|_request: Request<hyper::body::Incoming>| async {
                Ok::<_, Infallible>(
                    Response::builder()
                        .status(StatusCode::NOT_IMPLEMENTED)
                        .body(full("websocket transport not implemented"))
                        .expect("static response"),
                )
            });
            let conn = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service);
            tokio::select! {
                _ = conn => {}
                _ = conn_ctx.cancelled() => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[test]
    fn part_framing_matches_contract() {
        let part = encode_part("frame", &[0xFF, 0xD8, 0xFF, 0xD9]);
        let text = String::from_utf8_lossy(&part[..47]);
        assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\n"));
        assert!(text.contains("Content-Length: 4\r\n\r\n"));
        assert_eq!(&part[part.len() - 2..], b"\r\n");
    }

    async fn drive_request(
        path: &str,
        config: HttpConfig,
        frames: watch::Receiver<Option<Arc<JpegFrame>>>,
    ) -> (tokio::io::DuplexStream, Registry) {
        let (client, server) = duplex(1024 * 1024);
        let clients: Registry = Arc::new(Mutex::new(HashMap::new()));
        let registry = clients.clone();
        let next_id = Arc::new(AtomicU64::new(1));
        let remote: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        tokio::spawn(async move {
            let service = service_fn(move |request| {
                handle_request(
                    request,
                    config.clone(),
                    clients.clone(),
                    next_id.clone(),
                    frames.clone(),
                    remote,
                )
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(server), service)
                .await;
        });
        let mut client = client;
        client
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: bmc\r\n\r\n").as_bytes())
            .await
            .unwrap();
        (client, registry)
    }

    async fn read_until(client: &mut tokio::io::DuplexStream, needle: &[u8], hits: usize) -> Vec<u8> {
        let mut collected = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let count = collected
                .windows(needle.len())
                .filter(|w| *w == needle)
                .count();
            if count >= hits {
                return collected;
            }
            let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
                .await
                .expect("read timed out")
                .unwrap();
            assert!(n > 0, "connection closed early");
            collected.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn stream_emits_multipart_jpeg_parts() {
        let (frame_tx, frame_rx) = watch::channel(None);
        let (mut client, registry) =
            drive_request("/stream", HttpConfig::default(), frame_rx).await;

        let head = read_until(&mut client, b"\r\n\r\n", 1).await;
        let head_text = String::from_utf8_lossy(&head);
        assert!(head_text.starts_with("HTTP/1.1 200"));
        assert!(head_text.contains("multipart/x-mixed-replace; boundary=frame"));

        frame_tx
            .send(Some(Arc::new(JpegFrame {
                data: vec![0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9],
            })))
            .unwrap();
        let body = read_until(&mut client, b"--frame\r\n", 1).await;
        assert!(
            String::from_utf8_lossy(&body).contains("Content-Type: image/jpeg")
        );

        frame_tx
            .send(Some(Arc::new(JpegFrame {
                data: vec![0xFF, 0xD8, 0xFF, 0xD9],
            })))
            .unwrap();
        read_until(&mut client, b"Content-Length: 4", 1).await;
        assert_eq!(registry.lock().unwrap().len(), 1);

        drop(client);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn wrong_path_is_not_found() {
        let (_frame_tx, frame_rx) = watch::channel(None);
        let (mut client, _registry) =
            drive_request("/nope", HttpConfig::default(), frame_rx).await;
        let head = read_until(&mut client, b"\r\n\r\n", 1).await;
        assert!(String::from_utf8_lossy(&head).starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn over_limit_clients_get_busy() {
        let (_frame_tx, frame_rx) = watch::channel(None);
        let config = HttpConfig {
            max_clients: 0,
            ..HttpConfig::default()
        };
        let (mut client, _registry) = drive_request("/stream", config, frame_rx).await;
        let head = read_until(&mut client, b"\r\n\r\n", 1).await;
        assert!(String::from_utf8_lossy(&head).starts_with("HTTP/1.1 503"));
    }
}
