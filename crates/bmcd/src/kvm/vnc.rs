//! Multi-client VNC server: RFB 3.8 handshake, Raw-encoded continuous
//! framebuffer updates, input forwarding to the HID injector.
use super::KvmError;
use super::input::{InputEvent, decode_pointer_mask};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

const PROTOCOL_VERSION: &[u8; 12] = b"RFB 003.008\n";
const SECURITY_NONE: u8 = 1;
const ENCODING_RAW: i32 = 0;

/// How often idle clients are swept.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
/// Drain window for clients on shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct VncConfig {
    pub listen: SocketAddr,
    pub width: u32,
    pub height: u32,
    pub desktop_name: String,
    /// Kept for configuration compatibility; the handshake offers None
    /// security regardless.
    pub password: String,
    pub max_clients: usize,
    pub idle_timeout: Duration,
    pub websocket_enabled: bool,
    pub websocket_listen: SocketAddr,
}

impl Default for VncConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5900".parse().expect("static addr"),
            width: 640,
            height: 480,
            desktop_name: "BMC KVM".into(),
            password: String::new(),
            max_clients: 8,
            idle_timeout: Duration::from_secs(300),
            websocket_enabled: false,
            websocket_listen: "0.0.0.0:5901".parse().expect("static addr"),
        }
    }
}

/// An RGBA framebuffer shared between clients.
#[derive(Debug)]
pub struct FrameBuffer {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Per-client bookkeeping for the registry.
#[allow(unused)]
pub struct ClientInfo {
    pub id: u64,
    pub remote: String,
    pub connected_at_ms: u64,
    pub last_seen_ms: Arc<AtomicU64>,
    pub protocol_version: String,
    pub encodings: Vec<i32>,
    cancel: CancellationToken,
}

pub struct VncServer {
    config: VncConfig,
    clients: Arc<Mutex<HashMap<u64, Arc<ClientInfo>>>>,
    next_id: AtomicU64,
    input: mpsc::Sender<InputEvent>,
}

impl VncServer {
    pub fn new(config: VncConfig, input: mpsc::Sender<InputEvent>) -> Self {
        Self {
            config,
            clients: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            input,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().expect("clients lock poisoned").len()
    }

    /// Accept clients until `ctx` cancels; `frames` feeds the updates.
    pub async fn run(
        &self,
        ctx: CancellationToken,
        frames: watch::Receiver<Option<Arc<FrameBuffer>>>,
    ) -> Result<(), KvmError> {
        let listener = TcpListener::bind(self.config.listen)
            .await
            .map_err(KvmError::ListenFailed)?;
        tracing::info!(addr = %self.config.listen, "vnc server listening");

        let cleaner = self.spawn_cleaner(ctx.clone());
        let mut tasks = tokio::task::JoinSet::new();

        loop {
            let accepted = tokio::select! {
                _ = ctx.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, remote) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "vnc accept failed");
                    continue;
                }
            };

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let info = Arc::new(ClientInfo {
                id,
                remote: remote.to_string(),
                connected_at_ms: crate::telemetry::unix_millis(),
                last_seen_ms: Arc::new(AtomicU64::new(crate::telemetry::unix_millis())),
                protocol_version: String::new(),
                encodings: vec![ENCODING_RAW],
                cancel: ctx.child_token(),
            });

            let busy = self.client_count() >= self.config.max_clients;
            let clients = self.clients.clone();
            let config = self.config.clone();
            let input = self.input.clone();
            let frames = frames.clone();

            if busy {
                tasks.spawn(async move {
                    let _ = refuse_client(stream).await;
                });
                continue;
            }

            clients
                .lock()
                .expect("clients lock poisoned")
                .insert(id, info.clone());
            let registry = self.clients.clone();
            tasks.spawn(async move {
                if let Err(e) = serve_client(stream, config, info.clone(), input, frames).await {
                    tracing::debug!(client = id, error = %e, "vnc client ended");
                }
                registry.lock().expect("clients lock poisoned").remove(&id);
            });
        }

        // Let in-flight clients drain, then drop them.
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        let _ = tokio::time::timeout(SHUTDOWN_DRAIN, drain).await;
        tasks.abort_all();
        let _ = cleaner.await;
        Ok(())
    }

    fn spawn_cleaner(&self, ctx: CancellationToken) -> tokio::task::JoinHandle<()> {
        let clients = self.clients.clone();
        let idle_timeout = self.config.idle_timeout;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = tick.tick() => {}
                }
                let now = crate::telemetry::unix_millis();
                let stale: Vec<Arc<ClientInfo>> = clients
                    .lock()
                    .expect("clients lock poisoned")
                    .values()
                    .filter(|info| {
                        now.saturating_sub(info.last_seen_ms.load(Ordering::Relaxed))
                            > idle_timeout.as_millis() as u64
                    })
                    .cloned()
                    .collect();
                for info in stale {
                    tracing::info!(client = info.id, remote = %info.remote, "evicting idle vnc client");
                    info.cancel.cancel();
                }
            }
        })
    }
}

/// RFB refusal: version exchange, then an empty security list plus reason.
async fn refuse_client<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S) -> Result<(), KvmError> {
    stream
        .write_all(PROTOCOL_VERSION)
        .await
        .map_err(KvmError::ClientIo)?;
    let mut version = [0u8; 12];
    stream
        .read_exact(&mut version)
        .await
        .map_err(KvmError::ClientIo)?;
    let reason = b"too many clients";
    stream.write_u8(0).await.map_err(KvmError::ClientIo)?;
    stream
        .write_u32(reason.len() as u32)
        .await
        .map_err(KvmError::ClientIo)?;
    stream.write_all(reason).await.map_err(KvmError::ClientIo)?;
    stream.flush().await.map_err(KvmError::ClientIo)?;
    Ok(())
}

/// Full client lifecycle on an established stream.
pub(super) async fn serve_client<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: S,
    config: VncConfig,
    info: Arc<ClientInfo>,
    input: mpsc::Sender<InputEvent>,
    mut frames: watch::Receiver<Option<Arc<FrameBuffer>>>,
) -> Result<(), KvmError> {
    handshake(&mut stream, &config).await?;

    let (mut reader, mut writer) = tokio::io::split(stream);
    let last_seen = info.last_seen_ms.clone();
    let cancel = info.cancel.clone();

    let read_side = async {
        loop {
            read_client_message(&mut reader, &input, &last_seen).await?;
        }
    };
    let write_side = async {
        loop {
            if frames.changed().await.is_err() {
                return Ok::<(), KvmError>(());
            }
            let frame = frames.borrow_and_update().clone();
            if let Some(frame) = frame {
                if frame.width != config.width || frame.height != config.height {
                    continue;
                }
                write_framebuffer_update(&mut writer, &frame).await?;
            }
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = read_side => result,
        result = write_side => result,
    }
}

/// RFB 3.8 handshake plus the initial framebuffer.
async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    config: &VncConfig,
) -> Result<(), KvmError> {
    stream
        .write_all(PROTOCOL_VERSION)
        .await
        .map_err(KvmError::ClientIo)?;
    let mut version = [0u8; 12];
    stream
        .read_exact(&mut version)
        .await
        .map_err(KvmError::ClientIo)?;
    if &version[..4] != b"RFB " {
        return Err(KvmError::ProtocolViolation("bad client version"));
    }

    // Security: one type, None; then the success result word.
    stream
        .write_all(&[1, SECURITY_NONE])
        .await
        .map_err(KvmError::ClientIo)?;
    let choice = stream.read_u8().await.map_err(KvmError::ClientIo)?;
    if choice != SECURITY_NONE {
        return Err(KvmError::ProtocolViolation("unsupported security type"));
    }
    stream.write_u32(0).await.map_err(KvmError::ClientIo)?;

    // ClientInit: the shared flag, accepted either way.
    let _shared = stream.read_u8().await.map_err(KvmError::ClientIo)?;

    let mut server_init = Vec::with_capacity(24 + config.desktop_name.len());
    server_init.extend_from_slice(&(config.width as u16).to_be_bytes());
    server_init.extend_from_slice(&(config.height as u16).to_be_bytes());
    server_init.extend_from_slice(&pixel_format());
    server_init.extend_from_slice(&(config.desktop_name.len() as u32).to_be_bytes());
    server_init.extend_from_slice(config.desktop_name.as_bytes());
    stream
        .write_all(&server_init)
        .await
        .map_err(KvmError::ClientIo)?;

    let initial = initial_framebuffer(config.width, config.height);
    write_framebuffer_update(
        stream,
        &FrameBuffer {
            data: initial,
            width: config.width,
            height: config.height,
        },
    )
    .await
}

/// 32 bpp true color, depth 24, shifts 16/8/0.
fn pixel_format() -> [u8; 16] {
    let mut format = [0u8; 16];
    format[0] = 32; // bits per pixel
    format[1] = 24; // depth
    format[2] = 0; // big endian
    format[3] = 1; // true color
    format[4..6].copy_from_slice(&255u16.to_be_bytes()); // red max
    format[6..8].copy_from_slice(&255u16.to_be_bytes()); // green max
    format[8..10].copy_from_slice(&255u16.to_be_bytes()); // blue max
    format[10] = 16; // red shift
    format[11] = 8; // green shift
    format[12] = 0; // blue shift
    format
}

/// Black screen with a 5-pixel white border.
fn initial_framebuffer(width: u32, height: u32) -> Vec<u8> {
    let mut data = vec![0u8; (width * height * 4) as usize];
    for y in 0..height {
        for x in 0..width {
            let border =
                x < 5 || y < 5 || x >= width.saturating_sub(5) || y >= height.saturating_sub(5);
            let offset = ((y * width + x) * 4) as usize;
            let value = if border { 255 } else { 0 };
            data[offset] = value;
            data[offset + 1] = value;
            data[offset + 2] = value;
            data[offset + 3] = 255;
        }
    }
    data
}

/// One FramebufferUpdate with a single Raw rectangle.
async fn write_framebuffer_update<S: AsyncWrite + Unpin>(
    stream: &mut S,
    frame: &FrameBuffer,
) -> Result<(), KvmError> {
    let mut header = [0u8; 16];
    header[0] = 0; // message type
    header[1] = 0; // padding
    header[2..4].copy_from_slice(&1u16.to_be_bytes()); // rectangles
    header[4..6].copy_from_slice(&0u16.to_be_bytes()); // x
    header[6..8].copy_from_slice(&0u16.to_be_bytes()); // y
    header[8..10].copy_from_slice(&(frame.width as u16).to_be_bytes());
    header[10..12].copy_from_slice(&(frame.height as u16).to_be_bytes());
    header[12..16].copy_from_slice(&ENCODING_RAW.to_be_bytes());
    stream.write_all(&header).await.map_err(KvmError::ClientIo)?;
    stream
        .write_all(&frame.data)
        .await
        .map_err(KvmError::ClientIo)?;
    stream.flush().await.map_err(KvmError::ClientIo)?;
    Ok(())
}

/// Parse one client-to-server message, forwarding input events.
async fn read_client_message<S: AsyncRead + Unpin>(
    stream: &mut S,
    input: &mpsc::Sender<InputEvent>,
    last_seen: &AtomicU64,
) -> Result<(), KvmError> {
    let message_type = stream.read_u8().await.map_err(KvmError::ClientIo)?;
    last_seen.store(crate::telemetry::unix_millis(), Ordering::Relaxed);

    match message_type {
        // SetPixelFormat: accepted and ignored, the format is fixed.
        0 => {
            let mut rest = [0u8; 19];
            stream.read_exact(&mut rest).await.map_err(KvmError::ClientIo)?;
        }
        // SetEncodings: Raw is always used.
        2 => {
            let _pad = stream.read_u8().await.map_err(KvmError::ClientIo)?;
            let count = stream.read_u16().await.map_err(KvmError::ClientIo)?;
            let mut encodings = vec![0u8; count as usize * 4];
            stream
                .read_exact(&mut encodings)
                .await
                .map_err(KvmError::ClientIo)?;
        }
        // FramebufferUpdateRequest: updates are continuous.
        3 => {
            let mut rest = [0u8; 9];
            stream.read_exact(&mut rest).await.map_err(KvmError::ClientIo)?;
        }
        // KeyEvent
        4 => {
            let down = stream.read_u8().await.map_err(KvmError::ClientIo)? != 0;
            let mut pad = [0u8; 2];
            stream.read_exact(&mut pad).await.map_err(KvmError::ClientIo)?;
            let keysym = stream.read_u32().await.map_err(KvmError::ClientIo)?;
            let _ = input.try_send(InputEvent::Key { down, keysym });
        }
        // PointerEvent
        5 => {
            let mask = stream.read_u8().await.map_err(KvmError::ClientIo)?;
            let x = stream.read_u16().await.map_err(KvmError::ClientIo)?;
            let y = stream.read_u16().await.map_err(KvmError::ClientIo)?;
            let (buttons, wheel) = decode_pointer_mask(mask);
            let _ = input.try_send(InputEvent::Pointer { buttons, x, y });
            if wheel != 0 {
                let _ = input.try_send(InputEvent::Wheel { delta: wheel });
            }
        }
        // ClientCutText: ignored.
        6 => {
            let mut pad = [0u8; 3];
            stream.read_exact(&mut pad).await.map_err(KvmError::ClientIo)?;
            let len = stream.read_u32().await.map_err(KvmError::ClientIo)?;
            let mut text = vec![0u8; len as usize];
            stream.read_exact(&mut text).await.map_err(KvmError::ClientIo)?;
        }
        _ => return Err(KvmError::ProtocolViolation("unknown client message")),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn test_config(width: u32, height: u32) -> VncConfig {
        VncConfig {
            width,
            height,
            desktop_name: "test".into(),
            ..VncConfig::default()
        }
    }

    fn test_info() -> Arc<ClientInfo> {
        Arc::new(ClientInfo {
            id: 1,
            remote: "test".into(),
            connected_at_ms: 0,
            last_seen_ms: Arc::new(AtomicU64::new(0)),
            protocol_version: String::new(),
            encodings: vec![ENCODING_RAW],
            cancel: CancellationToken::new(),
        })
    }

    async fn client_handshake<S: AsyncRead + AsyncWrite + Unpin>(
        stream: &mut S,
        expect_width: u16,
        expect_height: u16,
    ) {
        let mut version = [0u8; 12];
        stream.read_exact(&mut version).await.unwrap();
        assert_eq!(&version, PROTOCOL_VERSION);
        stream.write_all(PROTOCOL_VERSION).await.unwrap();

        let count = stream.read_u8().await.unwrap();
        assert_eq!(count, 1);
        let security = stream.read_u8().await.unwrap();
        assert_eq!(security, SECURITY_NONE);
        stream.write_u8(SECURITY_NONE).await.unwrap();
        assert_eq!(stream.read_u32().await.unwrap(), 0);

        stream.write_u8(1).await.unwrap(); // ClientInit, shared

        assert_eq!(stream.read_u16().await.unwrap(), expect_width);
        assert_eq!(stream.read_u16().await.unwrap(), expect_height);
        let mut format = [0u8; 16];
        stream.read_exact(&mut format).await.unwrap();
        assert_eq!(format[0], 32);
        assert_eq!(format[1], 24);
        assert_eq!(format[3], 1);
        assert_eq!(format[10], 16);
        let name_len = stream.read_u32().await.unwrap();
        let mut name = vec![0u8; name_len as usize];
        stream.read_exact(&mut name).await.unwrap();
        assert_eq!(name, b"test");
    }

    async fn read_update<S: AsyncRead + Unpin>(stream: &mut S, width: u16, height: u16) -> Vec<u8> {
        assert_eq!(stream.read_u8().await.unwrap(), 0);
        let _pad = stream.read_u8().await.unwrap();
        assert_eq!(stream.read_u16().await.unwrap(), 1);
        assert_eq!(stream.read_u16().await.unwrap(), 0);
        assert_eq!(stream.read_u16().await.unwrap(), 0);
        assert_eq!(stream.read_u16().await.unwrap(), width);
        assert_eq!(stream.read_u16().await.unwrap(), height);
        assert_eq!(stream.read_u32().await.unwrap() as i32, ENCODING_RAW);
        let mut pixels = vec![0u8; width as usize * height as usize * 4];
        stream.read_exact(&mut pixels).await.unwrap();
        pixels
    }

    #[tokio::test]
    async fn handshake_and_raw_update() {
        let (mut client, server) = duplex(4 * 1024 * 1024);
        let (input_tx, _input_rx) = mpsc::channel(16);
        let (frame_tx, frame_rx) = watch::channel(None);

        let server_task = tokio::spawn(serve_client(
            server,
            test_config(640, 480),
            test_info(),
            input_tx,
            frame_rx,
        ));

        client_handshake(&mut client, 640, 480).await;
        let initial = read_update(&mut client, 640, 480).await;
        assert_eq!(initial.len(), 1_228_800);
        // Border pixel white, interior black.
        assert_eq!(&initial[..4], &[255, 255, 255, 255]);
        let center = ((240 * 640 + 320) * 4) as usize;
        assert_eq!(&initial[center..center + 4], &[0, 0, 0, 255]);

        // Feed one full frame through the watch.
        frame_tx
            .send(Some(Arc::new(FrameBuffer {
                data: vec![0x55; 640 * 480 * 4],
                width: 640,
                height: 480,
            })))
            .unwrap();
        let update = read_update(&mut client, 640, 480).await;
        assert_eq!(update.len(), 640 * 480 * 4);
        assert!(update.iter().all(|b| *b == 0x55));

        drop(client);
        let _ = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn key_and_pointer_events_are_forwarded() {
        let (mut client, server) = duplex(4 * 1024 * 1024);
        let (input_tx, mut input_rx) = mpsc::channel(16);
        let (_frame_tx, frame_rx) = watch::channel(None);

        let _server_task = tokio::spawn(serve_client(
            server,
            test_config(64, 48),
            test_info(),
            input_tx,
            frame_rx,
        ));

        client_handshake(&mut client, 64, 48).await;
        let _ = read_update(&mut client, 64, 48).await;

        // KeyEvent: 'a' down.
        client.write_all(&[4, 1, 0, 0]).await.unwrap();
        client.write_u32(0x61).await.unwrap();
        assert_eq!(
            input_rx.recv().await.unwrap(),
            InputEvent::Key {
                down: true,
                keysym: 0x61
            }
        );

        // PointerEvent: left button + wheel up at (100, 200).
        client.write_all(&[5, 0b0000_1001]).await.unwrap();
        client.write_u16(100).await.unwrap();
        client.write_u16(200).await.unwrap();
        assert_eq!(
            input_rx.recv().await.unwrap(),
            InputEvent::Pointer {
                buttons: 1,
                x: 100,
                y: 200
            }
        );
        assert_eq!(input_rx.recv().await.unwrap(), InputEvent::Wheel { delta: 1 });
    }

    #[tokio::test]
    async fn refusal_sends_empty_security_list() {
        let (mut client, server) = duplex(64 * 1024);
        let task = tokio::spawn(refuse_client(server));

        let mut version = [0u8; 12];
        client.read_exact(&mut version).await.unwrap();
        client.write_all(PROTOCOL_VERSION).await.unwrap();
        assert_eq!(client.read_u8().await.unwrap(), 0);
        let len = client.read_u32().await.unwrap();
        let mut reason = vec![0u8; len as usize];
        client.read_exact(&mut reason).await.unwrap();
        assert_eq!(reason, b"too many clients");
        task.await.unwrap().unwrap();
    }
}
