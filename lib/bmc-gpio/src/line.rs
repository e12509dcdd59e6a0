//! An open GPIO line and its timed/value/event operations.
use crate::error::Error;
use crate::options::{BlinkPattern, Direction, LineOptions};
use crate::uapi;
use futures::Stream;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Edge kind observed on a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Rising,
    Falling,
}

/// One edge event delivered by the kernel.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub line: u32,
    /// Nanoseconds since the monotonic epoch.
    pub timestamp_ns: u64,
    pub edge: EdgeKind,
    /// Logical value at the event, 1 for rising and 0 for falling.
    pub value: u8,
}

/// Snapshot of a line's observed value history.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineState {
    pub value: u8,
    /// Monotonic nanoseconds of the last observed change, 0 if none.
    pub last_change_ns: u64,
    pub changes: u64,
    /// Events discarded because the event buffer was full.
    pub drops: u64,
}

pub(crate) struct LineInner {
    pub(crate) chip_path: PathBuf,
    pub(crate) offset: u32,
    pub(crate) name: Option<String>,
    pub(crate) options: LineOptions,
    /// `None` once closed. Reads take the shared lock, writes and close
    /// take the exclusive lock.
    fd: RwLock<Option<Arc<OwnedFd>>>,
    state: Mutex<LineState>,
    events: Mutex<Option<mpsc::Receiver<Event>>>,
    cancel: CancellationToken,
}

/// Handle to an open line. Cheap to clone; all clones share the kernel
/// request. Dropping handles does not release the line, [`Line::close`]
/// does.
#[derive(Clone)]
pub struct Line {
    pub(crate) id: u64,
    pub(crate) inner: Arc<LineInner>,
    pub(crate) manager: Weak<crate::manager::ManagerInner>,
}

impl std::fmt::Debug for Line {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Line")
            .field("chip", &self.inner.chip_path)
            .field("offset", &self.inner.offset)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl Line {
    pub(crate) fn new(
        id: u64,
        chip_path: PathBuf,
        offset: u32,
        name: Option<String>,
        options: LineOptions,
        fd: OwnedFd,
        manager: Weak<crate::manager::ManagerInner>,
    ) -> Result<Self, Error> {
        let capacity = options.event_buffer_size.max(1) as usize;
        let (tx, rx) = mpsc::channel(capacity);
        let inner = Arc::new(LineInner {
            chip_path,
            offset,
            name,
            options,
            fd: RwLock::new(Some(Arc::new(fd))),
            state: Mutex::new(LineState::default()),
            events: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
        });

        if inner.options.has_edges() {
            spawn_event_reader(&inner, tx)?;
        }
        // With no edges requested tx drops here and the stream is empty.

        Ok(Self {
            id,
            inner,
            manager,
        })
    }

    pub fn offset(&self) -> u32 {
        self.inner.offset
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn chip_path(&self) -> &std::path::Path {
        &self.inner.chip_path
    }

    pub fn options(&self) -> &LineOptions {
        &self.inner.options
    }

    /// `(name, number, config)` of the line.
    pub fn info(&self) -> (Option<String>, u32, LineOptions) {
        (
            self.inner.name.clone(),
            self.inner.offset,
            self.inner.options.clone(),
        )
    }

    pub fn is_closed(&self) -> bool {
        self.inner.fd.read().expect("fd lock poisoned").is_none()
    }

    /// Snapshot of the observed value history.
    pub fn state(&self) -> LineState {
        *self.inner.state.lock().expect("state lock poisoned")
    }

    fn shared_fd(&self) -> Result<Arc<OwnedFd>, Error> {
        self.inner
            .fd
            .read()
            .expect("fd lock poisoned")
            .clone()
            .ok_or(Error::LineClosed)
    }

    /// Read the logical value of the line.
    pub fn get_value(&self) -> Result<u8, Error> {
        let fd = self.shared_fd()?;
        let mut values = uapi::GpioLineValues { bits: 0, mask: 1 };
        unsafe {
            uapi::ioctl(
                fd.as_raw_fd(),
                uapi::GPIO_V2_LINE_GET_VALUES_IOCTL,
                &mut values,
            )
            .map_err(Error::ReadOperation)?;
        }
        Ok((values.bits & 1) as u8)
    }

    /// Drive the line to `value`. Only valid for output lines.
    pub fn set_value(&self, value: u8) -> Result<(), Error> {
        if value > 1 {
            return Err(Error::InvalidValue(value));
        }
        if self.inner.options.direction != Direction::Output {
            return Err(Error::InvalidDirection);
        }
        let guard = self.inner.fd.write().expect("fd lock poisoned");
        let fd = guard.as_ref().ok_or(Error::LineClosed)?;
        let mut values = uapi::GpioLineValues {
            bits: u64::from(value),
            mask: 1,
        };
        unsafe {
            uapi::ioctl(
                fd.as_raw_fd(),
                uapi::GPIO_V2_LINE_SET_VALUES_IOCTL,
                &mut values,
            )
            .map_err(Error::WriteOperation)?;
        }
        drop(guard);
        self.record_change(value, monotonic_ns());
        Ok(())
    }

    fn record_change(&self, value: u8, timestamp_ns: u64) {
        let mut state = self.inner.state.lock().expect("state lock poisoned");
        if state.changes == 0 || state.value != value {
            state.value = value;
            state.last_change_ns = timestamp_ns;
            state.changes += 1;
        }
    }

    /// Set high, sleep `duration`, set low.
    pub async fn toggle(&self, duration: Duration) -> Result<(), Error> {
        self.set_value(1)
            .map_err(|e| Error::ToggleOperation(Box::new(e)))?;
        tokio::time::sleep(duration).await;
        self.set_value(0)
    }

    /// Alias for [`Line::toggle`].
    pub async fn pulse(&self, duration: Duration) -> Result<(), Error> {
        self.toggle(duration).await
    }

    /// Cancelable [`Line::toggle`]. On cancel mid-sleep the line is driven
    /// low on a best-effort basis before the error is returned.
    pub async fn pulse_ctx(&self, ctx: &CancellationToken, duration: Duration) -> Result<(), Error> {
        self.hold(ctx, duration).await
    }

    /// Drive high for `duration` or until `ctx` cancels, then drive low.
    pub async fn hold(&self, ctx: &CancellationToken, duration: Duration) -> Result<(), Error> {
        self.set_value(1)
            .map_err(|e| Error::ToggleOperation(Box::new(e)))?;
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.set_value(0),
            _ = ctx.cancelled() => {
                let _ = self.set_value(0);
                Err(Error::canceled())
            }
        }
    }

    /// Blink per `pattern` until the cycle count is exhausted or `ctx`
    /// cancels. The line is left low on every exit path.
    pub async fn blink(&self, ctx: &CancellationToken, pattern: BlinkPattern) -> Result<(), Error> {
        pattern.validate()?;
        if self.inner.options.direction != Direction::Output {
            return Err(Error::InvalidDirection);
        }

        let mut remaining = pattern.cycles;
        loop {
            if pattern.cycles != 0 {
                if remaining == 0 {
                    return Ok(());
                }
                remaining -= 1;
            }

            self.set_value(1)?;
            tokio::select! {
                _ = tokio::time::sleep(pattern.on) => {}
                _ = ctx.cancelled() => {
                    let _ = self.set_value(0);
                    return Err(Error::canceled());
                }
            }
            self.set_value(0)?;
            tokio::select! {
                _ = tokio::time::sleep(pattern.off) => {}
                _ = ctx.cancelled() => return Err(Error::canceled()),
            }
        }
    }

    /// The edge-event stream. Yields nothing unless the line was requested
    /// with an edge; may be taken once, later calls return a closed stream.
    pub fn events(&self) -> EventStream {
        EventStream {
            rx: self
                .inner
                .events
                .lock()
                .expect("events lock poisoned")
                .take(),
        }
    }

    /// Release the kernel handle and close the event stream. Idempotent;
    /// a closed line stays closed.
    pub fn close(&self) -> Result<(), Error> {
        self.inner.cancel.cancel();
        let released = self.inner.fd.write().expect("fd lock poisoned").take();
        if released.is_some()
            && let Some(manager) = self.manager.upgrade()
        {
            manager.forget_line(self.id);
        }
        Ok(())
    }
}

/// Stream of edge events for one line.
pub struct EventStream {
    rx: Option<mpsc::Receiver<Event>>,
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        match self.rx.as_mut() {
            Some(rx) => rx.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

/// Read kernel edge events into the bounded channel. Drops on overflow,
/// never blocks the kernel-facing side.
fn spawn_event_reader(inner: &Arc<LineInner>, tx: mpsc::Sender<Event>) -> Result<(), Error> {
    let fd = inner
        .fd
        .read()
        .expect("fd lock poisoned")
        .clone()
        .ok_or(Error::LineClosed)?;
    set_nonblocking(&fd).map_err(Error::ChipOperation)?;

    let cancel = inner.cancel.clone();
    let weak = Arc::downgrade(inner);
    let offset = inner.offset;

    tokio::spawn(async move {
        let afd = match AsyncFd::with_interest(fd, Interest::READABLE) {
            Ok(afd) => afd,
            Err(e) => {
                tracing::warn!(line = offset, error = %e, "gpio event registration failed");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                guard = afd.readable() => {
                    let mut guard = match guard {
                        Ok(guard) => guard,
                        Err(_) => return,
                    };
                    match drain_events(afd.get_ref().as_raw_fd(), &tx, &weak) {
                        Ok(true) => guard.clear_ready(),
                        Ok(false) => {}
                        Err(_) => return,
                    }
                }
            }
        }
    });
    Ok(())
}

/// Read all pending events from `fd`. Returns `Ok(true)` once the fd would
/// block, `Err` on EOF or a hard read error.
fn drain_events(
    fd: std::os::fd::RawFd,
    tx: &mpsc::Sender<Event>,
    line: &Weak<LineInner>,
) -> Result<bool, ()> {
    const BATCH: usize = 16;
    let mut buf = [0u8; uapi::LINE_EVENT_SIZE * BATCH];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            return match err.kind() {
                std::io::ErrorKind::WouldBlock => Ok(true),
                std::io::ErrorKind::Interrupted => continue,
                _ => Err(()),
            };
        }
        if n == 0 {
            return Err(());
        }
        for chunk in buf[..n as usize].chunks_exact(uapi::LINE_EVENT_SIZE) {
            let raw = parse_event(chunk);
            let (edge, value) = match raw.id {
                uapi::LINE_EVENT_RISING_EDGE => (EdgeKind::Rising, 1),
                uapi::LINE_EVENT_FALLING_EDGE => (EdgeKind::Falling, 0),
                _ => continue,
            };
            let event = Event {
                line: raw.offset,
                timestamp_ns: raw.timestamp_ns,
                edge,
                value,
            };
            let Some(inner) = line.upgrade() else {
                return Err(());
            };
            let mut state = inner.state.lock().expect("state lock poisoned");
            state.value = value;
            state.last_change_ns = raw.timestamp_ns;
            state.changes += 1;
            if tx.try_send(event).is_err() {
                state.drops += 1;
            }
        }
    }
}

fn parse_event(chunk: &[u8]) -> uapi::GpioLineEvent {
    let mut event = uapi::GpioLineEvent::default();
    event.timestamp_ns = u64::from_ne_bytes(chunk[0..8].try_into().unwrap());
    event.id = u32::from_ne_bytes(chunk[8..12].try_into().unwrap());
    event.offset = u32::from_ne_bytes(chunk[12..16].try_into().unwrap());
    event.seqno = u32::from_ne_bytes(chunk[16..20].try_into().unwrap());
    event.line_seqno = u32::from_ne_bytes(chunk[20..24].try_into().unwrap());
    event
}

fn set_nonblocking(fd: &OwnedFd) -> std::io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    /// A pipe read end stands in for the kernel line fd; value ioctls are
    /// never reached by the paths under test.
    fn stub_line(options: LineOptions) -> Line {
        use std::os::fd::FromRawFd;
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let fd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        unsafe { libc::close(fds[1]) };
        Line::new(
            1,
            "/dev/gpiochip0".into(),
            0,
            Some("power-btn-0".into()),
            options,
            fd,
            Weak::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn non_binary_value_rejected_before_hardware() {
        let line = stub_line(LineOptions::output(0));
        assert!(matches!(line.set_value(2), Err(Error::InvalidValue(2))));
    }

    #[tokio::test]
    async fn input_line_rejects_writes() {
        let line = stub_line(LineOptions::input());
        assert!(matches!(line.set_value(1), Err(Error::InvalidDirection)));
    }

    #[tokio::test]
    async fn close_is_terminal_and_idempotent() {
        let line = stub_line(LineOptions::output(0));
        line.close().unwrap();
        assert!(line.is_closed());
        assert!(matches!(line.set_value(0), Err(Error::LineClosed)));
        assert!(matches!(line.get_value(), Err(Error::LineClosed)));
        // A second close stays Ok.
        line.close().unwrap();
    }

    #[tokio::test]
    async fn edgeless_line_yields_no_events() {
        let line = stub_line(LineOptions::input());
        let mut events = line.events().fuse();
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn blink_rejects_input_lines_and_bad_patterns() {
        let ctx = CancellationToken::new();
        let line = stub_line(LineOptions::input());
        let pattern = BlinkPattern::new(Duration::from_millis(1), Duration::from_millis(1), 1);
        assert!(matches!(
            line.blink(&ctx, pattern).await,
            Err(Error::InvalidDirection)
        ));
        let out = stub_line(LineOptions::output(0));
        let zero = BlinkPattern::new(Duration::ZERO, Duration::from_millis(1), 1);
        assert!(matches!(
            out.blink(&ctx, zero).await,
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn info_reports_identity() {
        let line = stub_line(LineOptions::output(1));
        let (name, offset, options) = line.info();
        assert_eq!(name.as_deref(), Some("power-btn-0"));
        assert_eq!(offset, 0);
        assert_eq!(options.direction, Direction::Output);
    }

    #[test]
    fn event_parsing() {
        let mut chunk = [0u8; uapi::LINE_EVENT_SIZE];
        chunk[0..8].copy_from_slice(&123_456_789u64.to_ne_bytes());
        chunk[8..12].copy_from_slice(&uapi::LINE_EVENT_RISING_EDGE.to_ne_bytes());
        chunk[12..16].copy_from_slice(&7u32.to_ne_bytes());
        let event = parse_event(&chunk);
        assert_eq!(event.timestamp_ns, 123_456_789);
        assert_eq!(event.id, uapi::LINE_EVENT_RISING_EDGE);
        assert_eq!(event.offset, 7);
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }
}
