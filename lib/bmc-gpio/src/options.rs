//! Line request options and defaults.
use crate::error::Error;
use crate::uapi::LineFlags;
use std::time::Duration;

pub const DEFAULT_EVENT_BUFFER_SIZE: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bias {
    #[default]
    Disabled,
    PullUp,
    PullDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Edge {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Drive {
    #[default]
    PushPull,
    OpenDrain,
    OpenSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Active {
    #[default]
    High,
    Low,
}

/// Options for one line request.
///
/// The enum fields always take effect as given; their zero variants are
/// meaningful defaults. `consumer`, `debounce` and `event_buffer_size`
/// inherit from [`Defaults`] when left unset (empty / zero).
#[derive(Debug, Clone, Default)]
pub struct LineOptions {
    pub direction: Direction,
    pub bias: Bias,
    pub edge: Edge,
    pub drive: Drive,
    pub active: Active,
    /// Initial value for outputs, 0 or 1.
    pub initial_value: u8,
    pub debounce: Duration,
    pub consumer: String,
    pub event_buffer_size: u32,
}

impl LineOptions {
    pub fn input() -> Self {
        Self::default()
    }

    pub fn output(initial_value: u8) -> Self {
        Self {
            direction: Direction::Output,
            initial_value,
            ..Self::default()
        }
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edge = edge;
        self
    }

    pub fn with_active(mut self, active: Active) -> Self {
        self.active = active;
        self
    }

    pub fn with_bias(mut self, bias: Bias) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_drive(mut self, drive: Drive) -> Self {
        self.drive = drive;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_event_buffer_size(mut self, size: u32) -> Self {
        self.event_buffer_size = size;
        self
    }

    /// Fill unset inheritable fields from the manager defaults.
    pub(crate) fn merge(mut self, defaults: &Defaults) -> Self {
        if self.consumer.is_empty() {
            self.consumer = defaults.consumer.clone();
        }
        if self.debounce.is_zero() {
            self.debounce = defaults.debounce;
        }
        if self.event_buffer_size == 0 {
            self.event_buffer_size = defaults.event_buffer_size;
        }
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.initial_value > 1 {
            return Err(Error::InvalidValue(self.initial_value));
        }
        if self.direction == Direction::Output && self.edge != Edge::None {
            return Err(Error::InvalidConfiguration(
                "edge detection requires an input line".into(),
            ));
        }
        if self.direction == Direction::Input && self.drive != Drive::PushPull {
            return Err(Error::InvalidConfiguration(
                "open-drain/open-source drive requires an output line".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn flags(&self) -> LineFlags {
        let mut flags = match self.direction {
            Direction::Input => LineFlags::INPUT,
            Direction::Output => LineFlags::OUTPUT,
        };
        match self.bias {
            Bias::Disabled => {}
            Bias::PullUp => flags |= LineFlags::BIAS_PULL_UP,
            Bias::PullDown => flags |= LineFlags::BIAS_PULL_DOWN,
        }
        match self.edge {
            Edge::None => {}
            Edge::Rising => flags |= LineFlags::EDGE_RISING,
            Edge::Falling => flags |= LineFlags::EDGE_FALLING,
            Edge::Both => flags |= LineFlags::EDGE_RISING | LineFlags::EDGE_FALLING,
        }
        match self.drive {
            Drive::PushPull => {}
            Drive::OpenDrain => flags |= LineFlags::OPEN_DRAIN,
            Drive::OpenSource => flags |= LineFlags::OPEN_SOURCE,
        }
        if self.active == Active::Low {
            flags |= LineFlags::ACTIVE_LOW;
        }
        flags
    }

    pub(crate) fn has_edges(&self) -> bool {
        self.edge != Edge::None
    }
}

/// Manager-wide fallbacks for inheritable line options.
#[derive(Debug, Clone)]
pub struct Defaults {
    pub consumer: String,
    pub debounce: Duration,
    pub event_buffer_size: u32,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            consumer: String::new(),
            debounce: Duration::ZERO,
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
        }
    }
}

/// Timing for [`crate::Line::blink`]. `cycles == 0` blinks until canceled.
#[derive(Debug, Clone, Copy)]
pub struct BlinkPattern {
    pub on: Duration,
    pub off: Duration,
    pub cycles: u32,
}

impl BlinkPattern {
    pub fn new(on: Duration, off: Duration, cycles: u32) -> Self {
        Self { on, off, cycles }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.on.is_zero() || self.off.is_zero() {
            return Err(Error::InvalidConfiguration(
                "blink durations must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_inherits_only_unset_fields() {
        let defaults = Defaults {
            consumer: "bmcd".into(),
            debounce: Duration::from_millis(5),
            event_buffer_size: 32,
        };
        let merged = LineOptions::input()
            .with_edge(Edge::Both)
            .merge(&defaults);
        assert_eq!(merged.consumer, "bmcd");
        assert_eq!(merged.debounce, Duration::from_millis(5));
        assert_eq!(merged.event_buffer_size, 32);

        let explicit = LineOptions::input()
            .with_consumer("kvm")
            .with_debounce(Duration::from_millis(1))
            .with_event_buffer_size(8)
            .merge(&defaults);
        assert_eq!(explicit.consumer, "kvm");
        assert_eq!(explicit.debounce, Duration::from_millis(1));
        assert_eq!(explicit.event_buffer_size, 8);
    }

    #[test]
    fn merge_keeps_zero_variant_enums() {
        // Bias::Disabled and Edge::None are intentional selections, not
        // unset markers, so merging must not touch them.
        let merged = LineOptions::output(0).merge(&Defaults::default());
        assert_eq!(merged.bias, Bias::Disabled);
        assert_eq!(merged.edge, Edge::None);
        assert_eq!(merged.drive, Drive::PushPull);
    }

    #[test]
    fn output_rejects_edges() {
        let opts = LineOptions::output(0).with_edge(Edge::Rising);
        assert!(matches!(
            opts.validate(),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn input_rejects_open_drain() {
        let opts = LineOptions::input().with_drive(Drive::OpenDrain);
        assert!(matches!(
            opts.validate(),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn initial_value_must_be_binary() {
        assert!(matches!(
            LineOptions::output(2).validate(),
            Err(Error::InvalidValue(2))
        ));
    }

    #[test]
    fn flags_cover_all_options() {
        let flags = LineOptions::input()
            .with_edge(Edge::Both)
            .with_bias(Bias::PullUp)
            .with_active(Active::Low)
            .flags();
        assert!(flags.contains(LineFlags::INPUT));
        assert!(flags.contains(LineFlags::EDGE_RISING | LineFlags::EDGE_FALLING));
        assert!(flags.contains(LineFlags::BIAS_PULL_UP));
        assert!(flags.contains(LineFlags::ACTIVE_LOW));

        let out = LineOptions::output(1).with_drive(Drive::OpenDrain).flags();
        assert!(out.contains(LineFlags::OUTPUT | LineFlags::OPEN_DRAIN));
    }

    #[test]
    fn blink_pattern_rejects_zero_durations() {
        let pattern = BlinkPattern::new(Duration::ZERO, Duration::from_millis(1), 1);
        assert!(pattern.validate().is_err());
    }
}
