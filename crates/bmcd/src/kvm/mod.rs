//! The KVM service: capture, distribution to VNC and MJPEG clients, and
//! HID input injection.
pub mod capture;
pub mod convert;
pub mod http;
pub mod input;
pub(crate) mod v4l2;
pub mod vnc;

use crate::bus::BusConnection;
use crate::service::{Service, ServiceError};
use crate::telemetry::Metrics;
use capture::{FrameSource, PixelFormat, TestPatternSource, V4l2Source, VideoConfig, VideoFrame};
use http::{HttpConfig, JpegFrame, MjpegServer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use vnc::{FrameBuffer, VncConfig, VncServer};

/// Frames buffered between capture and the distributors.
const FRAME_CHANNEL_DEPTH: usize = 10;
/// Input events buffered between VNC clients and the HID injector.
const INPUT_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum KvmError {
    #[error("Video device not found: {0}")]
    DeviceNotFound(String),

    #[error("Capture failed: {0}")]
    CaptureFailed(#[source] std::io::Error),

    #[error("Format not supported: {0}")]
    FormatNotSupported(String),

    #[error("Frame encoding failed: {0}")]
    EncodeFailed(String),

    #[error("Bad frame: expected {expected} bytes, got {got}")]
    BadFrame { expected: usize, got: usize },

    #[error("Listen failed: {0}")]
    ListenFailed(#[source] std::io::Error),

    #[error("Client io failed: {0}")]
    ClientIo(#[source] std::io::Error),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(&'static str),
}

#[derive(Debug, Clone)]
pub struct KvmConfig {
    pub video: VideoConfig,
    pub vnc: VncConfig,
    pub http: HttpConfig,
    /// Use the synthetic source instead of V4L2 hardware.
    pub test_pattern: bool,
    pub keyboard_hid: PathBuf,
    pub mouse_hid: PathBuf,
}

impl Default for KvmConfig {
    fn default() -> Self {
        Self {
            video: VideoConfig::default(),
            vnc: VncConfig::default(),
            http: HttpConfig::default(),
            test_pattern: false,
            keyboard_hid: PathBuf::from("/dev/hidg0"),
            mouse_hid: PathBuf::from("/dev/hidg1"),
        }
    }
}

pub struct KvmService {
    config: KvmConfig,
    metrics: Metrics,
}

impl KvmService {
    pub fn new(mut config: KvmConfig, metrics: Metrics) -> Self {
        // The announced framebuffer always matches the captured frames.
        config.vnc.width = config.video.width;
        config.vnc.height = config.video.height;
        Self { config, metrics }
    }

    fn open_source(&self) -> Result<FrameSource, ServiceError> {
        if self.config.test_pattern {
            return Ok(FrameSource::TestPattern(TestPatternSource::new(
                &self.config.video,
            )));
        }
        V4l2Source::open(self.config.video.clone())
            .map(FrameSource::V4l2)
            .map_err(|e| ServiceError::Failed {
                service: "kvm".into(),
                reason: e.to_string(),
            })
    }
}

impl Service for KvmService {
    fn name(&self) -> &'static str {
        "kvm"
    }

    async fn run(&self, ctx: CancellationToken, _bus: BusConnection) -> Result<(), ServiceError> {
        let source = self.open_source()?;
        let (frame_tx, _) = broadcast::channel(FRAME_CHANNEL_DEPTH);
        let (rgba_tx, rgba_rx) = watch::channel(None);
        let (jpeg_tx, jpeg_rx) = watch::channel(None);
        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_DEPTH);

        let mut tasks = tokio::task::JoinSet::new();

        let device = self.config.video.device.display().to_string();
        let errors = self
            .metrics
            .capture_errors_total
            .with_label_values(&[device.as_str()]);
        tasks.spawn(capture::capture_loop(
            ctx.clone(),
            source,
            frame_tx.clone(),
            self.config.video.frame_timeout,
            errors,
        ));

        tasks.spawn(distribute_rgba(
            ctx.clone(),
            frame_tx.subscribe(),
            rgba_tx,
        ));
        tasks.spawn(distribute_jpeg(
            ctx.clone(),
            frame_tx.subscribe(),
            jpeg_tx,
            self.config.http.quality,
        ));

        tasks.spawn(input::run_injector(
            ctx.clone(),
            input_rx,
            bmc_gadget::hid::HidWriter::with_path(&self.config.keyboard_hid),
            bmc_gadget::hid::HidWriter::with_path(&self.config.mouse_hid),
        ));

        let vnc = VncServer::new(self.config.vnc.clone(), input_tx);
        let vnc_ctx = ctx.clone();
        tasks.spawn(async move {
            if let Err(e) = vnc.run(vnc_ctx, rgba_rx).await {
                tracing::error!(error = %e, "vnc server failed");
            }
        });

        let mjpeg = MjpegServer::new(self.config.http.clone());
        let http_ctx = ctx.clone();
        tasks.spawn(async move {
            if let Err(e) = mjpeg.run(http_ctx, jpeg_rx).await {
                tracing::error!(error = %e, "mjpeg server failed");
            }
        });

        if self.config.vnc.websocket_enabled {
            let ws_ctx = ctx.clone();
            let listen = self.config.vnc.websocket_listen;
            tasks.spawn(async move {
                if let Err(e) = http::run_websocket_stub(ws_ctx, listen).await {
                    tracing::error!(error = %e, "websocket stub failed");
                }
            });
        }

        ctx.cancelled().await;
        while tasks.join_next().await.is_some() {}
        Ok(())
    }
}

/// Convert captured frames to RGBA for the VNC distributor.
async fn distribute_rgba(
    ctx: CancellationToken,
    mut frames: broadcast::Receiver<VideoFrame>,
    out: watch::Sender<Option<Arc<FrameBuffer>>>,
) {
    loop {
        let frame = tokio::select! {
            _ = ctx.cancelled() => return,
            frame = frames.recv() => frame,
        };
        match frame {
            Ok(frame) => {
                let rgba = match frame.format {
                    PixelFormat::Yuyv => {
                        convert::yuyv_to_rgba(&frame.data, frame.width, frame.height)
                    }
                    PixelFormat::Rgb24 => {
                        convert::rgb_to_rgba(&frame.data, frame.width, frame.height)
                    }
                    // Raw framebuffers need decoded input; MJPEG sources
                    // only feed the HTTP side.
                    PixelFormat::Mjpeg => continue,
                };
                match rgba {
                    Ok(data) => {
                        let _ = out.send(Some(Arc::new(FrameBuffer {
                            data,
                            width: frame.width,
                            height: frame.height,
                        })));
                    }
                    Err(e) => tracing::warn!(error = %e, "rgba conversion failed"),
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "rgba distributor lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Convert captured frames to JPEG for the MJPEG distributor.
async fn distribute_jpeg(
    ctx: CancellationToken,
    mut frames: broadcast::Receiver<VideoFrame>,
    out: watch::Sender<Option<Arc<JpegFrame>>>,
    quality: u8,
) {
    loop {
        let frame = tokio::select! {
            _ = ctx.cancelled() => return,
            frame = frames.recv() => frame,
        };
        match frame {
            Ok(frame) => {
                let jpeg = match frame.format {
                    PixelFormat::Yuyv => {
                        convert::yuyv_to_jpeg(&frame.data, frame.width, frame.height, quality)
                    }
                    PixelFormat::Rgb24 => {
                        convert::rgb_to_jpeg(&frame.data, frame.width, frame.height, quality)
                    }
                    // Already JPEG; pass through.
                    PixelFormat::Mjpeg => Ok(frame.data.as_ref().clone()),
                };
                match jpeg {
                    Ok(data) => {
                        let _ = out.send(Some(Arc::new(JpegFrame { data })));
                    }
                    Err(e) => tracing::warn!(error = %e, "jpeg conversion failed"),
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "jpeg distributor lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
