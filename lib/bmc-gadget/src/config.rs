//! Gadget composition settings.
use crate::error::Error;
use paste::paste;

/// Used for quickly generating builder pattern setter methods
macro_rules! with {
    ($field_name:ident, bool) => {
        paste! {
            pub fn [<with_ $field_name>](mut self, $field_name: bool) -> Self {
                self.$field_name = $field_name;
                self
            }
        }
    };
    ($field_name:ident, $field_type:ty) => {
        paste! {
            pub fn [<with_ $field_name>](mut self, $field_name: impl Into<$field_type>) -> Self {
                self.$field_name = $field_name.into();
                self
            }
        }
    };
}

/// Settings for one composite gadget.
#[derive(Debug, Clone)]
pub struct GadgetConfig {
    pub name: String,
    /// Hex string, e.g. `0x1d6b`.
    pub id_vendor: String,
    /// Hex string, e.g. `0x0104`.
    pub id_product: String,
    pub serial: String,
    pub manufacturer: String,
    pub product: String,
    /// In 2 mA units; 250 = 500 mA.
    pub max_power: u16,
    pub keyboard: bool,
    pub mouse: bool,
    pub mass_storage: bool,
    pub luns: Vec<LunConfig>,
}

impl Default for GadgetConfig {
    fn default() -> Self {
        Self {
            name: "bmc".into(),
            id_vendor: "0x1d6b".into(),
            id_product: "0x0104".into(),
            serial: "0123456789".into(),
            manufacturer: "BMC".into(),
            product: "Virtual Input and Storage".into(),
            max_power: 250,
            keyboard: false,
            mouse: false,
            mass_storage: false,
            luns: Vec::new(),
        }
    }
}

impl GadgetConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    with!(id_vendor, String);
    with!(id_product, String);
    with!(serial, String);
    with!(manufacturer, String);
    with!(product, String);
    with!(keyboard, bool);
    with!(mouse, bool);
    with!(mass_storage, bool);

    pub fn with_max_power(mut self, max_power: u16) -> Self {
        self.max_power = max_power;
        self
    }

    pub fn with_lun(mut self, lun: LunConfig) -> Self {
        self.luns.push(lun);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(Error::InvalidConfiguration(format!(
                "bad gadget name {:?}",
                self.name
            )));
        }
        for id in [&self.id_vendor, &self.id_product] {
            let digits = id.strip_prefix("0x").unwrap_or(id);
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(Error::InvalidConfiguration(format!("bad usb id {id:?}")));
            }
        }
        if !self.keyboard && !self.mouse && !self.mass_storage {
            return Err(Error::InvalidConfiguration(
                "gadget has no functions enabled".into(),
            ));
        }
        Ok(())
    }
}

/// One mass-storage logical unit.
#[derive(Debug, Clone)]
pub struct LunConfig {
    pub file: String,
    pub read_only: bool,
    pub removable: bool,
    pub cdrom: bool,
    /// Raw SCSI inquiry string; the kernel pads or trims its 28-byte field.
    pub inquiry_string: String,
}

impl Default for LunConfig {
    fn default() -> Self {
        Self {
            file: String::new(),
            read_only: false,
            removable: true,
            cdrom: false,
            inquiry_string: String::new(),
        }
    }
}

impl LunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    with!(file, String);
    with!(read_only, bool);
    with!(removable, bool);
    with!(cdrom, bool);
    with!(inquiry_string, String);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_round_trip() {
        let config = GadgetConfig::new("kvm")
            .with_id_vendor("0x1d6b")
            .with_id_product("0x0104")
            .with_keyboard(true)
            .with_mouse(true)
            .with_max_power(100);
        assert_eq!(config.name, "kvm");
        assert_eq!(config.max_power, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_max_power_is_500ma() {
        assert_eq!(GadgetConfig::default().max_power, 250);
    }

    #[test]
    fn functionless_gadget_rejected() {
        assert!(GadgetConfig::new("empty").validate().is_err());
    }

    #[test]
    fn bad_usb_id_rejected() {
        let config = GadgetConfig::new("kvm")
            .with_keyboard(true)
            .with_id_vendor("0xZZZZ");
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfiguration(_))
        ));
    }
}
