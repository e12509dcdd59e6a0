//! Power-control backends: GPIO button lines, I²C register writes, and a
//! mock for tests and bring-up.
use super::config::{
    BackendConfig, ComponentConfig, GpioBackendConfig, I2cBackendConfig, LineRef,
    MockBackendConfig, RegisterOp,
};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend not configured: {0}")]
    NotConfigured(&'static str),

    #[error("Backend initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Backend not supported: {0}")]
    NotSupported(&'static str),

    #[error("GPIO operation failed: {0}")]
    Gpio(#[from] bmc_gpio::Error),

    #[error("I2C operation failed: {0}")]
    I2c(#[from] bmc_i2c::Error),

    #[error("Backend operation failed: {0}")]
    OperationFailed(String),
}

#[derive(Debug, Clone, Copy)]
struct Delays {
    power_on: Duration,
    power_off: Duration,
    reset: Duration,
    force_off: Duration,
}

impl Delays {
    fn from_config(config: &ComponentConfig) -> Self {
        Self {
            power_on: config.power_on_delay,
            power_off: config.power_off_delay,
            reset: config.reset_delay,
            force_off: config.force_off_delay,
        }
    }
}

/// The closed backend set; dispatch stays monomorphic.
pub enum Backend {
    Gpio(GpioBackend),
    I2c(I2cBackend),
    Mock(MockBackend),
}

impl Backend {
    /// Build the backend a component is configured with.
    pub fn init(
        gpio: &bmc_gpio::Manager,
        config: &ComponentConfig,
    ) -> Result<Self, BackendError> {
        match &config.backend {
            BackendConfig::Gpio(backend) => {
                Ok(Backend::Gpio(GpioBackend::init(gpio, backend, config)?))
            }
            BackendConfig::I2c(backend) => Ok(Backend::I2c(I2cBackend::init(backend, config)?)),
            BackendConfig::Mock(backend) => Ok(Backend::Mock(MockBackend::new(backend.clone()))),
        }
    }

    pub async fn power_on(&self, ctx: &CancellationToken) -> Result<(), BackendError> {
        match self {
            Backend::Gpio(b) => b.power_on(ctx).await,
            Backend::I2c(b) => b.power_on().await,
            Backend::Mock(b) => b.power_on(ctx).await,
        }
    }

    pub async fn power_off(&self, ctx: &CancellationToken, force: bool) -> Result<(), BackendError> {
        match self {
            Backend::Gpio(b) => b.power_off(ctx, force).await,
            Backend::I2c(b) => b.power_off(force).await,
            Backend::Mock(b) => b.power_off(ctx, force).await,
        }
    }

    pub async fn reset(&self, ctx: &CancellationToken) -> Result<(), BackendError> {
        match self {
            Backend::Gpio(b) => b.reset(ctx).await,
            Backend::I2c(b) => b.reset().await,
            Backend::Mock(b) => b.reset(ctx).await,
        }
    }

    pub async fn get_power_status(&self) -> Result<bool, BackendError> {
        match self {
            Backend::Gpio(b) => b.get_power_status(),
            Backend::I2c(b) => b.get_power_status().await,
            Backend::Mock(b) => b.get_power_status(),
        }
    }

    /// Release hardware handles. Used on service shutdown and restart.
    pub fn close(&mut self) {
        match self {
            Backend::Gpio(b) => b.close(),
            Backend::I2c(b) => b.conn.close(),
            Backend::Mock(_) => {}
        }
    }
}

/// Drives momentary power/reset buttons and reads the power-good input.
pub struct GpioBackend {
    power_button: bmc_gpio::Line,
    reset_button: Option<bmc_gpio::Line>,
    power_status: Option<bmc_gpio::Line>,
    delays: Delays,
}

impl GpioBackend {
    fn init(
        gpio: &bmc_gpio::Manager,
        backend: &GpioBackendConfig,
        config: &ComponentConfig,
    ) -> Result<Self, BackendError> {
        let consumer = format!("powermgr-{}", config.name);

        let button_opts = bmc_gpio::LineOptions::output(0)
            .with_active(backend.power_button_active)
            .with_consumer(consumer.clone());
        let power_button = request(gpio, &backend.chip, &backend.power_button, button_opts)?;

        let reset_button = backend
            .reset_button
            .as_ref()
            .map(|line| {
                let opts = bmc_gpio::LineOptions::output(0)
                    .with_active(backend.power_button_active)
                    .with_consumer(consumer.clone());
                request(gpio, &backend.chip, line, opts)
            })
            .transpose()?;

        let power_status = backend
            .power_status
            .as_ref()
            .map(|line| {
                let opts = bmc_gpio::LineOptions::input()
                    .with_active(backend.power_status_active)
                    .with_consumer(consumer.clone());
                request(gpio, &backend.chip, line, opts)
            })
            .transpose()?;

        Ok(Self {
            power_button,
            reset_button,
            power_status,
            delays: Delays::from_config(config),
        })
    }

    async fn power_on(&self, ctx: &CancellationToken) -> Result<(), BackendError> {
        Ok(self.power_button.pulse_ctx(ctx, self.delays.power_on).await?)
    }

    async fn power_off(&self, ctx: &CancellationToken, force: bool) -> Result<(), BackendError> {
        if force {
            // Held asserted for the full delay; a canceled context still
            // releases the button.
            Ok(self.power_button.hold(ctx, self.delays.force_off).await?)
        } else {
            Ok(self.power_button.pulse_ctx(ctx, self.delays.power_off).await?)
        }
    }

    async fn reset(&self, ctx: &CancellationToken) -> Result<(), BackendError> {
        let reset = self
            .reset_button
            .as_ref()
            .ok_or(BackendError::NotConfigured("reset button line"))?;
        Ok(reset.pulse_ctx(ctx, self.delays.reset).await?)
    }

    fn get_power_status(&self) -> Result<bool, BackendError> {
        let status = self
            .power_status
            .as_ref()
            .ok_or(BackendError::NotConfigured("power status line"))?;
        Ok(status.get_value()? != 0)
    }

    fn close(&mut self) {
        let _ = self.power_button.close();
        if let Some(line) = &self.reset_button {
            let _ = line.close();
        }
        if let Some(line) = &self.power_status {
            let _ = line.close();
        }
    }
}

fn request(
    gpio: &bmc_gpio::Manager,
    chip: &str,
    line: &LineRef,
    opts: bmc_gpio::LineOptions,
) -> Result<bmc_gpio::Line, BackendError> {
    let line = match line {
        LineRef::Offset(offset) => gpio.request_line(chip, *offset, opts),
        LineRef::Name(name) => gpio.request_line_by_name(chip, name, opts),
    };
    line.map_err(|e| BackendError::InitializationFailed(e.to_string()))
}

/// Writes power-controller registers on a management slave.
pub struct I2cBackend {
    conn: bmc_i2c::Connection,
    config: I2cBackendConfig,
}

impl I2cBackend {
    fn init(backend: &I2cBackendConfig, config: &ComponentConfig) -> Result<Self, BackendError> {
        let conn = bmc_i2c::Connection::open(
            bmc_i2c::Config::new(backend.bus, backend.address)
                .with_protocol(bmc_i2c::Protocol::Smbus)
                .with_timeout(config.operation_timeout.min(Duration::from_secs(1)))
                .with_retries(2),
        )
        .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
        Ok(Self {
            conn,
            config: backend.clone(),
        })
    }

    async fn write_op(&self, op: RegisterOp) -> Result<(), BackendError> {
        Ok(self
            .conn
            .smbus_write_byte_data(op.register, op.value)
            .await?)
    }

    async fn power_on(&self) -> Result<(), BackendError> {
        self.write_op(self.config.power_on).await
    }

    async fn power_off(&self, force: bool) -> Result<(), BackendError> {
        let op = if force {
            self.config.force_off.unwrap_or(self.config.power_off)
        } else {
            self.config.power_off
        };
        self.write_op(op).await
    }

    async fn reset(&self) -> Result<(), BackendError> {
        let op = self
            .config
            .reset
            .ok_or(BackendError::NotConfigured("reset register"))?;
        self.write_op(op).await
    }

    async fn get_power_status(&self) -> Result<bool, BackendError> {
        Ok(self
            .conn
            .smbus_read_byte_data(self.config.status_register)
            .await?
            != 0)
    }
}

/// In-memory backend with configurable latency and failure injection.
pub struct MockBackend {
    config: MockBackendConfig,
    powered: Mutex<bool>,
    rng: Mutex<u64>,
}

impl MockBackend {
    pub fn new(config: MockBackendConfig) -> Self {
        let powered = config.initial_power;
        let seed = config.seed.max(1);
        Self {
            config,
            powered: Mutex::new(powered),
            rng: Mutex::new(seed),
        }
    }

    /// xorshift64*; deterministic for a fixed seed.
    fn roll(&self) -> f64 {
        let mut state = self.rng.lock().expect("rng lock poisoned");
        let mut x = *state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        *state = x;
        (x.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 11) as f64 / (1u64 << 53) as f64
    }

    async fn simulate(&self, ctx: &CancellationToken, operation: &str) -> Result<(), BackendError> {
        tokio::select! {
            _ = ctx.cancelled() => {
                return Err(BackendError::OperationFailed("canceled".into()));
            }
            _ = tokio::time::sleep(self.config.delay) => {}
        }
        if self.roll() < self.config.failure_probability {
            return Err(BackendError::OperationFailed(format!(
                "injected {operation} failure"
            )));
        }
        Ok(())
    }

    async fn power_on(&self, ctx: &CancellationToken) -> Result<(), BackendError> {
        self.simulate(ctx, "power_on").await?;
        *self.powered.lock().expect("state lock poisoned") = true;
        Ok(())
    }

    async fn power_off(&self, ctx: &CancellationToken, _force: bool) -> Result<(), BackendError> {
        self.simulate(ctx, "power_off").await?;
        *self.powered.lock().expect("state lock poisoned") = false;
        Ok(())
    }

    async fn reset(&self, ctx: &CancellationToken) -> Result<(), BackendError> {
        self.simulate(ctx, "reset").await?;
        *self.powered.lock().expect("state lock poisoned") = true;
        Ok(())
    }

    fn get_power_status(&self) -> Result<bool, BackendError> {
        Ok(*self.powered.lock().expect("state lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock(config: MockBackendConfig) -> MockBackend {
        MockBackend::new(config)
    }

    #[tokio::test]
    async fn mock_tracks_power_state() {
        let ctx = CancellationToken::new();
        let backend = mock(MockBackendConfig::default());
        assert!(!backend.get_power_status().unwrap());
        backend.power_on(&ctx).await.unwrap();
        assert!(backend.get_power_status().unwrap());
        backend.power_off(&ctx, false).await.unwrap();
        assert!(!backend.get_power_status().unwrap());
        backend.reset(&ctx).await.unwrap();
        assert!(backend.get_power_status().unwrap());
    }

    #[tokio::test]
    async fn mock_injects_failures() {
        let ctx = CancellationToken::new();
        let backend = mock(MockBackendConfig {
            failure_probability: 1.0,
            ..MockBackendConfig::default()
        });
        assert!(backend.power_on(&ctx).await.is_err());
        assert!(!backend.get_power_status().unwrap());
    }

    #[tokio::test]
    async fn mock_honors_cancellation() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let backend = mock(MockBackendConfig {
            delay: Duration::from_secs(60),
            ..MockBackendConfig::default()
        });
        let started = std::time::Instant::now();
        assert!(backend.power_on(&ctx).await.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn roll_is_deterministic_per_seed() {
        let a = mock(MockBackendConfig::default());
        let b = mock(MockBackendConfig::default());
        assert_eq!(a.roll().to_bits(), b.roll().to_bits());
    }
}
