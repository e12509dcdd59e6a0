//! Background blink driver for status and identify LEDs.
use crate::error::Error;
use crate::line::Line;
use crate::options::BlinkPattern;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Blinks a line in the background until stopped or the pattern's cycle
/// count runs out.
pub struct Flasher {
    line: Line,
    cancel: Mutex<Option<CancellationToken>>,
}

impl Flasher {
    pub fn new(line: Line) -> Self {
        Self {
            line,
            cancel: Mutex::new(None),
        }
    }

    /// Start blinking. A running flasher is restarted with the new pattern.
    pub fn start(&self, pattern: BlinkPattern) -> Result<(), Error> {
        pattern.validate()?;
        self.stop();

        let cancel = CancellationToken::new();
        *self.cancel.lock().expect("cancel lock poisoned") = Some(cancel.clone());

        let line = self.line.clone();
        tokio::spawn(async move {
            if let Err(e) = line.blink(&cancel, pattern).await
                && !matches!(e, Error::OperationCanceled(_))
            {
                tracing::warn!(line = line.offset(), error = %e, "flasher stopped");
            }
        });
        Ok(())
    }

    /// Stop blinking; the line is left low.
    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().expect("cancel lock poisoned").take() {
            cancel.cancel();
        }
    }
}

impl Drop for Flasher {
    fn drop(&mut self) {
        self.stop();
    }
}
