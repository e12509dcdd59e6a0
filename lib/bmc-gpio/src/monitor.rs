//! Edge-event monitor delivering callbacks off a line's event stream.
use crate::error::Error;
use crate::line::{Event, EventStream, Line};
use crate::options::{Direction, Edge};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

type Callback = Arc<dyn Fn(Event) + Send + Sync>;

struct MonitorInner {
    line: Line,
    callback: Callback,
    /// Stream parked here between runs so the monitor can be restarted.
    stream: Mutex<Option<EventStream>>,
    stop: Mutex<Option<CancellationToken>>,
    running: AtomicBool,
}

/// Runs a callback for every edge event on an input line.
///
/// `Stopped -> Running -> Stopped`; a stopped monitor may be started again.
#[derive(Clone)]
pub struct LineMonitor {
    inner: Arc<MonitorInner>,
}

impl LineMonitor {
    pub fn new(line: Line, callback: impl Fn(Event) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                line,
                callback: Arc::new(callback),
                stream: Mutex::new(None),
                stop: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start delivering events. Rejects lines that are not input-with-edge.
    pub fn start(&self) -> Result<(), Error> {
        let options = self.inner.line.options();
        if options.direction != Direction::Input || options.edge == Edge::None {
            return Err(Error::InvalidConfiguration(
                "monitor requires an input line with edge detection".into(),
            ));
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut stream = self
            .inner
            .stream
            .lock()
            .expect("stream lock poisoned")
            .take()
            .unwrap_or_else(|| self.inner.line.events());

        let stop = CancellationToken::new();
        *self.inner.stop.lock().expect("stop lock poisoned") = Some(stop.clone());

        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    event = stream.next() => match event {
                        Some(event) => (inner.callback)(event),
                        // Stream closed with the line; the monitor is done.
                        None => break,
                    }
                }
            }
            *inner.stream.lock().expect("stream lock poisoned") = Some(stream);
            inner.running.store(false, Ordering::SeqCst);
        });
        Ok(())
    }

    /// Stop the monitor. The stop signal fires exactly once per run.
    pub fn stop(&self) {
        if let Some(stop) = self.inner.stop.lock().expect("stop lock poisoned").take() {
            stop.cancel();
        }
        self.inner.running.store(false, Ordering::SeqCst);
    }
}
