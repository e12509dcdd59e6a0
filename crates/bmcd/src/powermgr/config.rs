//! Power-manager component configuration.
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentType {
    Host,
    Chassis,
    Bmc,
}

impl ComponentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentType::Host => "host",
            ComponentType::Chassis => "chassis",
            ComponentType::Bmc => "bmc",
        }
    }
}

/// A GPIO line referenced by offset or kernel name.
#[derive(Debug, Clone)]
pub enum LineRef {
    Offset(u32),
    Name(String),
}

#[derive(Debug, Clone)]
pub struct GpioBackendConfig {
    pub chip: String,
    pub power_button: LineRef,
    pub power_button_active: bmc_gpio::Active,
    pub reset_button: Option<LineRef>,
    pub power_status: Option<LineRef>,
    pub power_status_active: bmc_gpio::Active,
}

/// One register write on the power controller.
#[derive(Debug, Clone, Copy)]
pub struct RegisterOp {
    pub register: u8,
    pub value: u8,
}

#[derive(Debug, Clone)]
pub struct I2cBackendConfig {
    pub bus: u32,
    pub address: u16,
    pub power_on: RegisterOp,
    pub power_off: RegisterOp,
    /// Falls back to `power_off` when unset.
    pub force_off: Option<RegisterOp>,
    pub reset: Option<RegisterOp>,
    pub status_register: u8,
}

#[derive(Debug, Clone)]
pub struct MockBackendConfig {
    /// Chance in [0, 1] that an operation fails.
    pub failure_probability: f64,
    pub delay: Duration,
    pub initial_power: bool,
    pub seed: u64,
}

impl Default for MockBackendConfig {
    fn default() -> Self {
        Self {
            failure_probability: 0.0,
            delay: Duration::from_millis(1),
            initial_power: false,
            seed: 0x9E37_79B9_7F4A_7C15,
        }
    }
}

#[derive(Debug, Clone)]
pub enum BackendConfig {
    Gpio(GpioBackendConfig),
    I2c(I2cBackendConfig),
    Mock(MockBackendConfig),
}

impl BackendConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::Gpio(_) => "gpio",
            BackendConfig::I2c(_) => "i2c",
            BackendConfig::Mock(_) => "mock",
        }
    }
}

/// One managed component, e.g. `host.0`.
#[derive(Debug, Clone)]
pub struct ComponentConfig {
    pub name: String,
    pub component_type: ComponentType,
    pub enabled: bool,
    pub backend: BackendConfig,
    pub operation_timeout: Duration,
    pub power_on_delay: Duration,
    pub power_off_delay: Duration,
    pub reset_delay: Duration,
    pub force_off_delay: Duration,
}

impl ComponentConfig {
    pub fn new(
        name: impl Into<String>,
        component_type: ComponentType,
        backend: BackendConfig,
    ) -> Self {
        Self {
            name: name.into(),
            component_type,
            enabled: true,
            backend,
            operation_timeout: Duration::from_secs(30),
            power_on_delay: Duration::from_millis(200),
            power_off_delay: Duration::from_millis(200),
            reset_delay: Duration::from_millis(200),
            force_off_delay: Duration::from_secs(4),
        }
    }

    /// Numeric id from the `<kind>.<index>` name; unnumbered names get 0.
    pub fn index(&self) -> u32 {
        self.name
            .rsplit('.')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }
}

/// Thermal-emergency reaction settings.
#[derive(Debug, Clone)]
pub struct ThermalConfig {
    pub enable_emergency_shutdown: bool,
    pub shutdown_temperature_limit: f64,
    pub emergency_response_delay: Duration,
    /// Components shut down, in order.
    pub shutdown_components: Vec<String>,
    pub max_emergency_attempts: u32,
    pub emergency_attempt_interval: Duration,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            enable_emergency_shutdown: true,
            shutdown_temperature_limit: 95.0,
            emergency_response_delay: Duration::from_millis(500),
            shutdown_components: Vec::new(),
            max_emergency_attempts: 3,
            emergency_attempt_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PowerManagerConfig {
    pub components: Vec<ComponentConfig>,
    /// Prefix of the state-manager result subjects.
    pub state_prefix: String,
    pub thermal: ThermalConfig,
}

impl Default for PowerManagerConfig {
    fn default() -> Self {
        Self {
            components: Vec::new(),
            state_prefix: "statemgr".into(),
            thermal: ThermalConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_index_parses_suffix() {
        let config = ComponentConfig::new(
            "host.2",
            ComponentType::Host,
            BackendConfig::Mock(MockBackendConfig::default()),
        );
        assert_eq!(config.index(), 2);
        let config = ComponentConfig::new(
            "chassis",
            ComponentType::Chassis,
            BackendConfig::Mock(MockBackendConfig::default()),
        );
        assert_eq!(config.index(), 0);
    }

    #[test]
    fn backend_kind_tags() {
        assert_eq!(BackendConfig::Mock(MockBackendConfig::default()).kind(), "mock");
    }
}
