//! GPIO character-device uAPI v2 structures and ioctls.
//!
//! Mirrors `<linux/gpio.h>`. Only the pieces the engine uses are declared.
use bitflags::bitflags;
use std::io;
use std::os::fd::RawFd;

pub const GPIO_MAX_NAME_SIZE: usize = 32;
pub const GPIO_V2_LINES_MAX: usize = 64;
pub const GPIO_V2_LINE_NUM_ATTRS_MAX: usize = 10;

pub const GPIO_GET_CHIPINFO_IOCTL: libc::c_ulong = 0x8044_B401;
pub const GPIO_V2_GET_LINEINFO_IOCTL: libc::c_ulong = 0xC100_B405;
pub const GPIO_V2_GET_LINE_IOCTL: libc::c_ulong = 0xC250_B407;
pub const GPIO_V2_LINE_SET_CONFIG_IOCTL: libc::c_ulong = 0xC110_B40D;
pub const GPIO_V2_LINE_GET_VALUES_IOCTL: libc::c_ulong = 0xC010_B40E;
pub const GPIO_V2_LINE_SET_VALUES_IOCTL: libc::c_ulong = 0xC010_B40F;

bitflags! {
    /// `gpio_v2_line_flag` values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LineFlags: u64 {
        const USED = 1 << 0;
        const ACTIVE_LOW = 1 << 1;
        const INPUT = 1 << 2;
        const OUTPUT = 1 << 3;
        const EDGE_RISING = 1 << 4;
        const EDGE_FALLING = 1 << 5;
        const OPEN_DRAIN = 1 << 6;
        const OPEN_SOURCE = 1 << 7;
        const BIAS_PULL_UP = 1 << 8;
        const BIAS_PULL_DOWN = 1 << 9;
        const BIAS_DISABLED = 1 << 10;
    }
}

/// `gpio_v2_line_attr_id` values.
pub const LINE_ATTR_ID_FLAGS: u32 = 1;
pub const LINE_ATTR_ID_OUTPUT_VALUES: u32 = 2;
pub const LINE_ATTR_ID_DEBOUNCE: u32 = 3;

/// `gpio_v2_line_event_id` values.
pub const LINE_EVENT_RISING_EDGE: u32 = 1;
pub const LINE_EVENT_FALLING_EDGE: u32 = 2;

#[repr(C)]
pub struct GpioChipInfo {
    pub name: [libc::c_char; GPIO_MAX_NAME_SIZE],
    pub label: [libc::c_char; GPIO_MAX_NAME_SIZE],
    pub lines: u32,
}

#[repr(C)]
pub union LineAttributeValue {
    pub flags: u64,
    pub values: u64,
    pub debounce_period_us: u32,
}

#[repr(C)]
pub struct GpioLineAttribute {
    pub id: u32,
    pub padding: u32,
    pub value: LineAttributeValue,
}

#[repr(C)]
pub struct GpioLineConfigAttribute {
    pub attr: GpioLineAttribute,
    /// Bitmap of request offsets the attribute applies to.
    pub mask: u64,
}

#[repr(C)]
pub struct GpioLineConfig {
    pub flags: u64,
    pub num_attrs: u32,
    pub padding: [u32; 5],
    pub attrs: [GpioLineConfigAttribute; GPIO_V2_LINE_NUM_ATTRS_MAX],
}

#[repr(C)]
pub struct GpioLineRequest {
    pub offsets: [u32; GPIO_V2_LINES_MAX],
    pub consumer: [libc::c_char; GPIO_MAX_NAME_SIZE],
    pub config: GpioLineConfig,
    pub num_lines: u32,
    pub event_buffer_size: u32,
    pub padding: [u32; 5],
    pub fd: i32,
}

#[repr(C)]
pub struct GpioLineValues {
    pub bits: u64,
    pub mask: u64,
}

#[repr(C)]
pub struct GpioLineInfo {
    pub name: [libc::c_char; GPIO_MAX_NAME_SIZE],
    pub consumer: [libc::c_char; GPIO_MAX_NAME_SIZE],
    pub offset: u32,
    pub num_attrs: u32,
    pub flags: u64,
    pub attrs: [GpioLineAttribute; GPIO_V2_LINE_NUM_ATTRS_MAX],
    pub padding: [u32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GpioLineEvent {
    pub timestamp_ns: u64,
    pub id: u32,
    pub offset: u32,
    pub seqno: u32,
    pub line_seqno: u32,
    pub padding: [u32; 6],
}

pub const LINE_EVENT_SIZE: usize = std::mem::size_of::<GpioLineEvent>();

macro_rules! zeroed_default {
    ($($ty:ty),+ $(,)?) => {$(
        impl Default for $ty {
            fn default() -> Self {
                // All-zero is a valid kernel representation for these PODs.
                unsafe { std::mem::zeroed() }
            }
        }
    )+};
}

zeroed_default!(
    GpioChipInfo,
    GpioLineAttribute,
    GpioLineConfigAttribute,
    GpioLineConfig,
    GpioLineRequest,
    GpioLineValues,
    GpioLineInfo,
);

/// Issue an ioctl on `fd`, mapping a negative return to the OS error.
pub unsafe fn ioctl<T>(fd: RawFd, request: libc::c_ulong, arg: *mut T) -> io::Result<()> {
    let rc = unsafe { libc::ioctl(fd, request, arg) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Convert a fixed-size kernel name field to a `String`.
pub fn name_to_string(raw: &[libc::c_char; GPIO_MAX_NAME_SIZE]) -> String {
    let bytes: Vec<u8> = raw
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_sizes_match_kernel_abi() {
        assert_eq!(std::mem::size_of::<GpioChipInfo>(), 68);
        assert_eq!(std::mem::size_of::<GpioLineConfig>(), 272);
        assert_eq!(std::mem::size_of::<GpioLineRequest>(), 592);
        assert_eq!(std::mem::size_of::<GpioLineValues>(), 16);
        assert_eq!(std::mem::size_of::<GpioLineInfo>(), 256);
        assert_eq!(std::mem::size_of::<GpioLineEvent>(), 48);
    }

    #[test]
    fn name_conversion_stops_at_nul() {
        let mut raw = [0 as libc::c_char; GPIO_MAX_NAME_SIZE];
        for (i, b) in b"power-btn-0".iter().enumerate() {
            raw[i] = *b as libc::c_char;
        }
        assert_eq!(name_to_string(&raw), "power-btn-0");
    }
}
