//! Video capture sources and the capture loop.
use super::v4l2;
use super::KvmError;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Pixel layout of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuyv,
    Mjpeg,
    Rgb24,
}

impl PixelFormat {
    fn fourcc(self) -> u32 {
        match self {
            PixelFormat::Yuyv => v4l2::V4L2_PIX_FMT_YUYV,
            PixelFormat::Mjpeg => v4l2::V4L2_PIX_FMT_MJPEG,
            PixelFormat::Rgb24 => v4l2::V4L2_PIX_FMT_RGB24,
        }
    }
}

/// One captured frame. The payload is shared so fan-out is cheap.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Unix milliseconds at capture.
    pub timestamp_ms: u64,
    pub sequence: u64,
}

#[derive(Debug, Clone)]
pub struct VideoConfig {
    pub device: PathBuf,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub fps: u32,
    pub buffer_count: u32,
    pub frame_timeout: Duration,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            width: 640,
            height: 480,
            format: PixelFormat::Yuyv,
            fps: 30,
            buffer_count: 4,
            frame_timeout: Duration::from_secs(5),
        }
    }
}

/// The closed set of frame sources.
pub enum FrameSource {
    V4l2(V4l2Source),
    TestPattern(TestPatternSource),
}

impl FrameSource {
    pub async fn next_frame(&mut self) -> Result<VideoFrame, KvmError> {
        match self {
            FrameSource::V4l2(source) => source.next_frame().await,
            FrameSource::TestPattern(source) => source.next_frame().await,
        }
    }
}

/// Run the capture loop: frames go into the bounded broadcast channel,
/// capture errors count but do not stop the service.
pub async fn capture_loop(
    ctx: CancellationToken,
    mut source: FrameSource,
    frames: broadcast::Sender<VideoFrame>,
    frame_timeout: Duration,
    errors: prometheus::IntCounter,
) {
    loop {
        let frame = tokio::select! {
            _ = ctx.cancelled() => return,
            frame = tokio::time::timeout(frame_timeout, source.next_frame()) => frame,
        };
        match frame {
            Ok(Ok(frame)) => {
                // Send fails only with zero receivers; that is fine.
                let _ = frames.send(frame);
            }
            Ok(Err(e)) => {
                errors.inc();
                tracing::warn!(error = %e, "frame capture failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(_) => {
                errors.inc();
                tracing::warn!("frame capture timed out");
            }
        }
    }
}

struct MmapBuffer {
    ptr: *mut libc::c_void,
    len: usize,
}

unsafe impl Send for MmapBuffer {}

impl Drop for MmapBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

/// MMAP streaming capture from a V4L2 device.
pub struct V4l2Source {
    fd: AsyncFd<OwnedFd>,
    config: VideoConfig,
    buffers: Vec<MmapBuffer>,
    sequence: u64,
    streaming: bool,
}

impl V4l2Source {
    /// Open and configure the device, queue the buffers, start streaming.
    pub fn open(config: VideoConfig) -> Result<Self, KvmError> {
        let path = &config.device;
        let fd = {
            let c_path = std::ffi::CString::new(path.display().to_string())
                .map_err(|_| KvmError::DeviceNotFound(path.display().to_string()))?;
            let raw = unsafe {
                libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC)
            };
            if raw < 0 {
                let err = std::io::Error::last_os_error();
                return Err(match err.kind() {
                    std::io::ErrorKind::NotFound => {
                        KvmError::DeviceNotFound(path.display().to_string())
                    }
                    _ => KvmError::CaptureFailed(err),
                });
            }
            unsafe { OwnedFd::from_raw_fd(raw) }
        };
        let raw = fd.as_raw_fd();

        let mut cap = v4l2::Capability::default();
        unsafe {
            v4l2::ioctl(raw, v4l2::VIDIOC_QUERYCAP, &mut cap).map_err(KvmError::CaptureFailed)?;
        }
        if cap.capabilities & v4l2::V4L2_CAP_VIDEO_CAPTURE == 0
            || cap.capabilities & v4l2::V4L2_CAP_STREAMING == 0
        {
            return Err(KvmError::FormatNotSupported(
                "device lacks streaming capture".into(),
            ));
        }

        let mut format = v4l2::Format {
            type_: v4l2::V4L2_BUF_TYPE_VIDEO_CAPTURE,
            fmt: v4l2::FormatUnion {
                pix: v4l2::PixFormat {
                    width: config.width,
                    height: config.height,
                    pixelformat: config.format.fourcc(),
                    field: v4l2::V4L2_FIELD_NONE,
                    ..Default::default()
                },
            },
        };
        unsafe {
            v4l2::ioctl(raw, v4l2::VIDIOC_S_FMT, &mut format).map_err(KvmError::CaptureFailed)?;
        }
        let accepted = unsafe { format.fmt.pix };
        if accepted.pixelformat != config.format.fourcc() {
            return Err(KvmError::FormatNotSupported(format!(
                "device substituted fourcc {:#x}",
                accepted.pixelformat
            )));
        }

        if config.fps > 0 {
            let mut parm = v4l2::StreamParm {
                type_: v4l2::V4L2_BUF_TYPE_VIDEO_CAPTURE,
                parm: v4l2::StreamParmUnion {
                    capture: v4l2::CaptureParm {
                        timeperframe: v4l2::Fract {
                            numerator: 1,
                            denominator: config.fps,
                        },
                        ..Default::default()
                    },
                },
            };
            // Not every driver honors S_PARM; failure is not fatal.
            if let Err(e) = unsafe { v4l2::ioctl(raw, v4l2::VIDIOC_S_PARM, &mut parm) } {
                tracing::debug!(error = %e, "S_PARM not honored");
            }
        }

        let mut request = v4l2::RequestBuffers {
            count: config.buffer_count.max(1),
            type_: v4l2::V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: v4l2::V4L2_MEMORY_MMAP,
            ..Default::default()
        };
        unsafe {
            v4l2::ioctl(raw, v4l2::VIDIOC_REQBUFS, &mut request).map_err(KvmError::CaptureFailed)?;
        }

        let mut buffers = Vec::with_capacity(request.count as usize);
        for index in 0..request.count {
            let mut buffer = v4l2::Buffer {
                index,
                type_: v4l2::V4L2_BUF_TYPE_VIDEO_CAPTURE,
                memory: v4l2::V4L2_MEMORY_MMAP,
                ..Default::default()
            };
            unsafe {
                v4l2::ioctl(raw, v4l2::VIDIOC_QUERYBUF, &mut buffer)
                    .map_err(KvmError::CaptureFailed)?;
            }
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    buffer.length as usize,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    raw,
                    buffer.m.offset as libc::off_t,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(KvmError::CaptureFailed(std::io::Error::last_os_error()));
            }
            buffers.push(MmapBuffer {
                ptr,
                len: buffer.length as usize,
            });

            unsafe {
                v4l2::ioctl(raw, v4l2::VIDIOC_QBUF, &mut buffer).map_err(KvmError::CaptureFailed)?;
            }
        }

        let mut buf_type = v4l2::V4L2_BUF_TYPE_VIDEO_CAPTURE;
        unsafe {
            v4l2::ioctl(raw, v4l2::VIDIOC_STREAMON, &mut buf_type)
                .map_err(KvmError::CaptureFailed)?;
        }

        let fd = AsyncFd::with_interest(fd, Interest::READABLE).map_err(KvmError::CaptureFailed)?;
        Ok(Self {
            fd,
            config,
            buffers,
            sequence: 0,
            streaming: true,
        })
    }

    async fn next_frame(&mut self) -> Result<VideoFrame, KvmError> {
        loop {
            let mut guard = self
                .fd
                .readable()
                .await
                .map_err(KvmError::CaptureFailed)?;

            match Self::dequeue(
                self.fd.get_ref().as_raw_fd(),
                &self.buffers,
                &self.config,
                &mut self.sequence,
            ) {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {
                    guard.clear_ready();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// DQBUF, copy out, requeue. `Ok(None)` when the driver would block.
    fn dequeue(
        raw: RawFd,
        buffers: &[MmapBuffer],
        config: &VideoConfig,
        sequence: &mut u64,
    ) -> Result<Option<VideoFrame>, KvmError> {
        let mut buffer = v4l2::Buffer {
            type_: v4l2::V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: v4l2::V4L2_MEMORY_MMAP,
            ..Default::default()
        };
        if let Err(e) = unsafe { v4l2::ioctl(raw, v4l2::VIDIOC_DQBUF, &mut buffer) } {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(KvmError::CaptureFailed(e));
        }

        let index = buffer.index as usize;
        let used = buffer.bytesused as usize;
        let mapped = &buffers[index];
        let data = unsafe {
            std::slice::from_raw_parts(mapped.ptr as *const u8, used.min(mapped.len)).to_vec()
        };

        unsafe {
            v4l2::ioctl(raw, v4l2::VIDIOC_QBUF, &mut buffer).map_err(KvmError::CaptureFailed)?;
        }

        *sequence += 1;
        Ok(Some(VideoFrame {
            data: Arc::new(data),
            width: config.width,
            height: config.height,
            format: config.format,
            timestamp_ms: crate::telemetry::unix_millis(),
            sequence: *sequence,
        }))
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        if self.streaming {
            let mut buf_type = v4l2::V4L2_BUF_TYPE_VIDEO_CAPTURE;
            let _ = unsafe {
                v4l2::ioctl(
                    self.fd.get_ref().as_raw_fd(),
                    v4l2::VIDIOC_STREAMOFF,
                    &mut buf_type,
                )
            };
        }
    }
}

/// Synthetic YUYV frames for tests and hardware-less bring-up: moving
/// vertical color bars with a frame counter in the chroma.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    fps: u32,
    sequence: u64,
}

impl TestPatternSource {
    pub fn new(config: &VideoConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            fps: config.fps.max(1),
            sequence: 0,
        }
    }

    async fn next_frame(&mut self) -> Result<VideoFrame, KvmError> {
        tokio::time::sleep(Duration::from_millis(1000 / self.fps as u64)).await;
        self.sequence += 1;

        let shift = (self.sequence % self.width as u64) as u32;
        let mut data = Vec::with_capacity((self.width * self.height * 2) as usize);
        for _row in 0..self.height {
            for pair in 0..self.width / 2 {
                let bar = ((pair * 2 + shift) * 8 / self.width) % 8;
                let (y, u, v) = BARS[bar as usize];
                data.extend_from_slice(&[y, u, y, v]);
            }
        }
        Ok(VideoFrame {
            data: Arc::new(data),
            width: self.width,
            height: self.height,
            format: PixelFormat::Yuyv,
            timestamp_ms: crate::telemetry::unix_millis(),
            sequence: self.sequence,
        })
    }
}

/// SMPTE-ish bars in YUV.
const BARS: [(u8, u8, u8); 8] = [
    (235, 128, 128), // white
    (210, 16, 146),  // yellow
    (170, 166, 16),  // cyan
    (145, 54, 34),   // green
    (106, 202, 222), // magenta
    (81, 90, 240),   // red
    (41, 240, 110),  // blue
    (16, 128, 128),  // black
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_fd_helper_types_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<MmapBuffer>();
        assert_send::<FrameSource>();
    }

    #[tokio::test]
    async fn test_pattern_produces_well_formed_frames() {
        let config = VideoConfig {
            width: 64,
            height: 8,
            fps: 1000,
            ..VideoConfig::default()
        };
        let mut source = TestPatternSource::new(&config);
        let a = source.next_frame().await.unwrap();
        let b = source.next_frame().await.unwrap();
        assert_eq!(a.data.len(), 64 * 8 * 2);
        assert_eq!(a.format, PixelFormat::Yuyv);
        assert_eq!(b.sequence, a.sequence + 1);
        // The pattern moves between frames.
        assert_ne!(a.data, b.data);
    }

    #[tokio::test]
    async fn capture_loop_fans_out_and_stops_on_cancel() {
        let config = VideoConfig {
            width: 16,
            height: 2,
            fps: 1000,
            ..VideoConfig::default()
        };
        let (tx, mut rx) = broadcast::channel(10);
        let ctx = CancellationToken::new();
        let errors = prometheus::IntCounter::new("capture_errors", "test").unwrap();
        let handle = tokio::spawn(capture_loop(
            ctx.clone(),
            FrameSource::TestPattern(TestPatternSource::new(&config)),
            tx,
            Duration::from_secs(1),
            errors,
        ));
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.width, 16);
        ctx.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn missing_device_reports_not_found() {
        let config = VideoConfig {
            device: PathBuf::from("/nonexistent/video9"),
            ..VideoConfig::default()
        };
        match V4l2Source::open(config) {
            Err(KvmError::DeviceNotFound(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opened a nonexistent device"),
        }
    }
}
