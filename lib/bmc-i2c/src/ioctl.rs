//! `i2c-dev` ioctl numbers and structures from `<linux/i2c.h>` and
//! `<linux/i2c-dev.h>`.
use bitflags::bitflags;
use std::io;
use std::os::fd::RawFd;

pub const I2C_RETRIES: libc::c_ulong = 0x0701;
pub const I2C_TIMEOUT: libc::c_ulong = 0x0702;
pub const I2C_SLAVE: libc::c_ulong = 0x0703;
pub const I2C_TENBIT: libc::c_ulong = 0x0704;
pub const I2C_FUNCS: libc::c_ulong = 0x0705;
pub const I2C_SLAVE_FORCE: libc::c_ulong = 0x0706;
pub const I2C_RDWR: libc::c_ulong = 0x0707;
pub const I2C_PEC: libc::c_ulong = 0x0708;
pub const I2C_SMBUS: libc::c_ulong = 0x0720;

pub const I2C_M_RD: u16 = 0x0001;
pub const I2C_M_TEN: u16 = 0x0010;

pub const I2C_SMBUS_READ: u8 = 1;
pub const I2C_SMBUS_WRITE: u8 = 0;

pub const I2C_SMBUS_QUICK: u32 = 0;
pub const I2C_SMBUS_BYTE: u32 = 1;
pub const I2C_SMBUS_BYTE_DATA: u32 = 2;
pub const I2C_SMBUS_WORD_DATA: u32 = 3;
pub const I2C_SMBUS_PROC_CALL: u32 = 4;
pub const I2C_SMBUS_BLOCK_DATA: u32 = 5;
pub const I2C_SMBUS_I2C_BLOCK_DATA: u32 = 8;
pub const I2C_SMBUS_BLOCK_PROC_CALL: u32 = 7;

pub const I2C_SMBUS_BLOCK_MAX: usize = 32;

bitflags! {
    /// Adapter functionality bits reported by `I2C_FUNCS`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Funcs: u64 {
        const I2C = 0x0000_0001;
        const TENBIT_ADDR = 0x0000_0002;
        const PROTOCOL_MANGLING = 0x0000_0004;
        const SMBUS_PEC = 0x0000_0008;
        const SMBUS_BLOCK_PROC_CALL = 0x0000_8000;
        const SMBUS_QUICK = 0x0001_0000;
        const SMBUS_READ_BYTE = 0x0002_0000;
        const SMBUS_WRITE_BYTE = 0x0004_0000;
        const SMBUS_READ_BYTE_DATA = 0x0008_0000;
        const SMBUS_WRITE_BYTE_DATA = 0x0010_0000;
        const SMBUS_READ_WORD_DATA = 0x0020_0000;
        const SMBUS_WRITE_WORD_DATA = 0x0040_0000;
        const SMBUS_PROC_CALL = 0x0080_0000;
        const SMBUS_READ_BLOCK_DATA = 0x0100_0000;
        const SMBUS_WRITE_BLOCK_DATA = 0x0200_0000;
        const SMBUS_READ_I2C_BLOCK = 0x0400_0000;
        const SMBUS_WRITE_I2C_BLOCK = 0x0800_0000;
        const SMBUS_HOST_NOTIFY = 0x1000_0000;
    }
}

impl Funcs {
    pub const SMBUS_ANY: Funcs = Funcs::SMBUS_QUICK
        .union(Funcs::SMBUS_READ_BYTE)
        .union(Funcs::SMBUS_WRITE_BYTE)
        .union(Funcs::SMBUS_READ_BYTE_DATA)
        .union(Funcs::SMBUS_WRITE_BYTE_DATA)
        .union(Funcs::SMBUS_READ_WORD_DATA)
        .union(Funcs::SMBUS_WRITE_WORD_DATA)
        .union(Funcs::SMBUS_PROC_CALL)
        .union(Funcs::SMBUS_READ_BLOCK_DATA)
        .union(Funcs::SMBUS_WRITE_BLOCK_DATA)
        .union(Funcs::SMBUS_READ_I2C_BLOCK)
        .union(Funcs::SMBUS_WRITE_I2C_BLOCK)
        .union(Funcs::SMBUS_BLOCK_PROC_CALL);
}

/// `union i2c_smbus_data`. `block[0]` is the byte count for block ops.
#[repr(C)]
pub union SmbusData {
    pub byte: u8,
    pub word: u16,
    pub block: [u8; I2C_SMBUS_BLOCK_MAX + 2],
}

impl Default for SmbusData {
    fn default() -> Self {
        SmbusData {
            block: [0; I2C_SMBUS_BLOCK_MAX + 2],
        }
    }
}

#[repr(C)]
pub struct SmbusIoctlData {
    pub read_write: u8,
    pub command: u8,
    pub size: u32,
    pub data: *mut SmbusData,
}

#[repr(C)]
pub struct I2cMsg {
    pub addr: u16,
    pub flags: u16,
    pub len: u16,
    pub buf: *mut u8,
}

#[repr(C)]
pub struct RdwrIoctlData {
    pub msgs: *mut I2cMsg,
    pub nmsgs: u32,
}

/// Issue an ioctl on `fd`, mapping a negative return to the OS error.
pub unsafe fn ioctl<T>(fd: RawFd, request: libc::c_ulong, arg: *mut T) -> io::Result<()> {
    let rc = unsafe { libc::ioctl(fd, request, arg) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Ioctls whose argument is a plain integer, e.g. `I2C_SLAVE`.
pub unsafe fn ioctl_int(fd: RawFd, request: libc::c_ulong, arg: libc::c_ulong) -> io::Result<()> {
    let rc = unsafe { libc::ioctl(fd, request, arg) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smbus_data_layout() {
        // The block field dominates the union: count byte + 32 data + one
        // spare the kernel uses for I2C block reads.
        assert_eq!(std::mem::size_of::<SmbusData>(), I2C_SMBUS_BLOCK_MAX + 2);
    }

    #[test]
    fn smbus_any_covers_word_ops() {
        assert!(Funcs::SMBUS_ANY.contains(Funcs::SMBUS_READ_WORD_DATA));
        assert!(!Funcs::SMBUS_ANY.contains(Funcs::SMBUS_PEC));
    }
}
