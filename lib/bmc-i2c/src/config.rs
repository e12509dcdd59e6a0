//! Connection configuration.
use crate::error::Error;
use std::time::Duration;

/// Protocol family spoken on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    I2c,
    I3c,
    Smbus,
    Pmbus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressMode {
    #[default]
    SevenBit,
    TenBit,
}

/// PMBus numeric format used by the telemetry helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PmbusFormat {
    #[default]
    Linear,
    Direct,
}

/// DIRECT-format coefficients from the device datasheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coefficients {
    pub m: i16,
    pub b: i16,
    pub r: i8,
}

impl Coefficients {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.m == 0 {
            return Err(Error::PmbusCoefficientsInvalid("M must be non-zero"));
        }
        if !(-15..=15).contains(&self.r) {
            return Err(Error::PmbusCoefficientsInvalid("R must be in [-15, 15]"));
        }
        Ok(())
    }
}

pub const SEVEN_BIT_MIN: u16 = 0x08;
pub const SEVEN_BIT_MAX: u16 = 0x77;
pub const TEN_BIT_MAX: u16 = 0x3FF;

/// Configuration for one slave connection.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bus index; the device path is `/dev/i2c-<bus>`.
    pub bus: u32,
    pub address: u16,
    pub protocol: Protocol,
    pub address_mode: AddressMode,
    /// Claim the address even if a kernel driver owns it.
    pub force_address: bool,
    pub timeout: Duration,
    /// Extra attempts after the first failure.
    pub retries: u32,
    pub pec: bool,
    pub pmbus_format: PmbusFormat,
    pub coefficients: Option<Coefficients>,
    /// Desired SCL frequency; 0 keeps the adapter default.
    pub clock_frequency_hz: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus: 0,
            address: 0,
            protocol: Protocol::I2c,
            address_mode: AddressMode::SevenBit,
            force_address: false,
            timeout: Duration::from_millis(100),
            retries: 0,
            pec: false,
            pmbus_format: PmbusFormat::Linear,
            coefficients: None,
            clock_frequency_hz: 0,
        }
    }
}

impl Config {
    pub fn new(bus: u32, address: u16) -> Self {
        Self {
            bus,
            address,
            ..Self::default()
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_address_mode(mut self, mode: AddressMode) -> Self {
        self.address_mode = mode;
        self
    }

    pub fn with_force_address(mut self, force: bool) -> Self {
        self.force_address = force;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_pec(mut self, pec: bool) -> Self {
        self.pec = pec;
        self
    }

    pub fn with_pmbus_format(mut self, format: PmbusFormat) -> Self {
        self.pmbus_format = format;
        self
    }

    pub fn with_coefficients(mut self, coefficients: Coefficients) -> Self {
        self.coefficients = Some(coefficients);
        self
    }

    pub fn with_clock_frequency_hz(mut self, hz: u32) -> Self {
        self.clock_frequency_hz = hz;
        self
    }

    pub fn device_path(&self) -> String {
        format!("/dev/i2c-{}", self.bus)
    }

    /// Validate an address against `mode`, honoring the force flag the way
    /// the kernel does: forcing lifts the reserved-range restriction only.
    pub fn validate_address(address: u16, mode: AddressMode, force: bool) -> Result<(), Error> {
        match mode {
            AddressMode::SevenBit => {
                if address > 0x7F {
                    return Err(Error::InvalidAddress(address));
                }
                if !force && !(SEVEN_BIT_MIN..=SEVEN_BIT_MAX).contains(&address) {
                    return Err(Error::InvalidAddress(address));
                }
            }
            AddressMode::TenBit => {
                if address > TEN_BIT_MAX {
                    return Err(Error::InvalidAddress(address));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        Self::validate_address(self.address, self.address_mode, self.force_address)?;
        if self.timeout.is_zero() {
            return Err(Error::InvalidTimeout);
        }
        if let Some(coefficients) = &self.coefficients {
            coefficients.validate()?;
        }
        if self.protocol == Protocol::Pmbus
            && self.pmbus_format == PmbusFormat::Direct
            && self.coefficients.is_none()
        {
            return Err(Error::InvalidConfiguration(
                "PMBus DIRECT format requires coefficients".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seven_bit_address_bounds() {
        for addr in [0x08, 0x77] {
            assert!(Config::validate_address(addr, AddressMode::SevenBit, false).is_ok());
        }
        for addr in [0x07, 0x78] {
            assert!(matches!(
                Config::validate_address(addr, AddressMode::SevenBit, false),
                Err(Error::InvalidAddress(_))
            ));
            // Forcing admits reserved addresses.
            assert!(Config::validate_address(addr, AddressMode::SevenBit, true).is_ok());
        }
        // Forcing never admits addresses beyond seven bits.
        assert!(Config::validate_address(0x80, AddressMode::SevenBit, true).is_err());
    }

    #[test]
    fn ten_bit_address_bounds() {
        assert!(Config::validate_address(0x3FF, AddressMode::TenBit, false).is_ok());
        assert!(Config::validate_address(0x400, AddressMode::TenBit, false).is_err());
    }

    #[test]
    fn zero_timeout_rejected() {
        let cfg = Config::new(1, 0x50).with_timeout(Duration::ZERO);
        assert!(matches!(cfg.validate(), Err(Error::InvalidTimeout)));
    }

    #[test]
    fn direct_format_requires_coefficients() {
        let cfg = Config::new(1, 0x40)
            .with_protocol(Protocol::Pmbus)
            .with_pmbus_format(PmbusFormat::Direct);
        assert!(matches!(
            cfg.validate(),
            Err(Error::InvalidConfiguration(_))
        ));
        let cfg = cfg.with_coefficients(Coefficients { m: 100, b: 0, r: -2 });
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn coefficient_bounds() {
        assert!(Coefficients { m: 0, b: 0, r: 0 }.validate().is_err());
        assert!(Coefficients { m: 1, b: 0, r: 16 }.validate().is_err());
        assert!(Coefficients { m: 1, b: 0, r: -16 }.validate().is_err());
        assert!(Coefficients { m: 1, b: -3, r: 15 }.validate().is_ok());
    }

    #[test]
    fn device_path_format() {
        assert_eq!(Config::new(4, 0x50).device_path(), "/dev/i2c-4");
    }
}
