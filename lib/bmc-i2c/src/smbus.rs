//! The SMBus command set, gated on negotiated adapter capability.
use crate::config::Protocol;
use crate::conn::Connection;
use crate::error::Error;
use crate::ioctl::{self, Funcs, I2C_SMBUS_BLOCK_MAX, SmbusData, SmbusIoctlData};

impl Connection {
    /// SMBus commands require the SMBus or PMBus protocol and an adapter
    /// that reports at least one SMBus transfer type.
    fn check_smbus(&self, cap: Funcs, name: &'static str) -> Result<(), Error> {
        match self.config().protocol {
            Protocol::Smbus | Protocol::Pmbus => {}
            _ => return Err(Error::ProtocolViolation("SMBus command on non-SMBus connection")),
        }
        if !self.funcs().intersects(Funcs::SMBUS_ANY) {
            return Err(Error::SmbusNotSupported);
        }
        if !self.funcs().contains(cap) {
            return Err(Error::SmbusUnsupportedCommand(name));
        }
        Ok(())
    }

    /// One `I2C_SMBUS` ioctl, no gating, no retry. Used by the bus scan.
    pub(crate) fn smbus_quick_raw(&self, read: bool) -> Result<(), Error> {
        let rw = if read {
            ioctl::I2C_SMBUS_READ
        } else {
            ioctl::I2C_SMBUS_WRITE
        };
        self.smbus_access(rw, 0, ioctl::I2C_SMBUS_QUICK, None)
    }

    fn smbus_access(
        &self,
        read_write: u8,
        command: u8,
        size: u32,
        data: Option<&mut SmbusData>,
    ) -> Result<(), Error> {
        let mut args = SmbusIoctlData {
            read_write,
            command,
            size,
            data: data.map_or(std::ptr::null_mut(), |d| d as *mut SmbusData),
        };
        unsafe {
            ioctl::ioctl(self.fd()?, ioctl::I2C_SMBUS, &mut args)
                .map_err(Error::TransactionFailed)?;
        }
        Ok(())
    }

    pub async fn smbus_quick(&self, read: bool) -> Result<(), Error> {
        self.check_smbus(Funcs::SMBUS_QUICK, "Quick")?;
        self.with_retries(None, |conn| conn.smbus_quick_raw(read)).await
    }

    pub async fn smbus_send_byte(&self, value: u8) -> Result<(), Error> {
        self.check_smbus(Funcs::SMBUS_WRITE_BYTE, "SendByte")?;
        self.with_retries(None, |conn| {
            conn.smbus_access(ioctl::I2C_SMBUS_WRITE, value, ioctl::I2C_SMBUS_BYTE, None)
        })
        .await
    }

    pub async fn smbus_receive_byte(&self) -> Result<u8, Error> {
        self.check_smbus(Funcs::SMBUS_READ_BYTE, "ReceiveByte")?;
        self.with_retries(None, |conn| {
            let mut data = SmbusData::default();
            conn.smbus_access(ioctl::I2C_SMBUS_READ, 0, ioctl::I2C_SMBUS_BYTE, Some(&mut data))?;
            Ok(unsafe { data.byte })
        })
        .await
    }

    pub async fn smbus_write_byte_data(&self, command: u8, value: u8) -> Result<(), Error> {
        self.check_smbus(Funcs::SMBUS_WRITE_BYTE_DATA, "WriteByteData")?;
        self.with_retries(None, |conn| {
            let mut data = SmbusData { byte: value };
            conn.smbus_access(
                ioctl::I2C_SMBUS_WRITE,
                command,
                ioctl::I2C_SMBUS_BYTE_DATA,
                Some(&mut data),
            )
        })
        .await
    }

    pub async fn smbus_read_byte_data(&self, command: u8) -> Result<u8, Error> {
        self.check_smbus(Funcs::SMBUS_READ_BYTE_DATA, "ReadByteData")?;
        self.with_retries(None, |conn| {
            let mut data = SmbusData::default();
            conn.smbus_access(
                ioctl::I2C_SMBUS_READ,
                command,
                ioctl::I2C_SMBUS_BYTE_DATA,
                Some(&mut data),
            )?;
            Ok(unsafe { data.byte })
        })
        .await
    }

    pub async fn smbus_write_word_data(&self, command: u8, value: u16) -> Result<(), Error> {
        self.check_smbus(Funcs::SMBUS_WRITE_WORD_DATA, "WriteWordData")?;
        self.with_retries(None, |conn| {
            let mut data = SmbusData { word: value };
            conn.smbus_access(
                ioctl::I2C_SMBUS_WRITE,
                command,
                ioctl::I2C_SMBUS_WORD_DATA,
                Some(&mut data),
            )
        })
        .await
    }

    pub async fn smbus_read_word_data(&self, command: u8) -> Result<u16, Error> {
        self.check_smbus(Funcs::SMBUS_READ_WORD_DATA, "ReadWordData")?;
        self.with_retries(None, |conn| {
            let mut data = SmbusData::default();
            conn.smbus_access(
                ioctl::I2C_SMBUS_READ,
                command,
                ioctl::I2C_SMBUS_WORD_DATA,
                Some(&mut data),
            )?;
            Ok(unsafe { data.word })
        })
        .await
    }

    pub async fn smbus_process_call(&self, command: u8, value: u16) -> Result<u16, Error> {
        self.check_smbus(Funcs::SMBUS_PROC_CALL, "ProcessCall")?;
        self.with_retries(None, |conn| {
            let mut data = SmbusData { word: value };
            conn.smbus_access(
                ioctl::I2C_SMBUS_WRITE,
                command,
                ioctl::I2C_SMBUS_PROC_CALL,
                Some(&mut data),
            )?;
            Ok(unsafe { data.word })
        })
        .await
    }

    pub async fn smbus_write_block_data(&self, command: u8, bytes: &[u8]) -> Result<(), Error> {
        self.check_smbus(Funcs::SMBUS_WRITE_BLOCK_DATA, "WriteBlockData")?;
        check_block_len(bytes.len())?;
        self.with_retries(None, |conn| {
            let mut data = block_data(bytes);
            conn.smbus_access(
                ioctl::I2C_SMBUS_WRITE,
                command,
                ioctl::I2C_SMBUS_BLOCK_DATA,
                Some(&mut data),
            )
        })
        .await
    }

    pub async fn smbus_read_block_data(&self, command: u8) -> Result<Vec<u8>, Error> {
        self.check_smbus(Funcs::SMBUS_READ_BLOCK_DATA, "ReadBlockData")?;
        self.with_retries(None, |conn| {
            let mut data = SmbusData::default();
            conn.smbus_access(
                ioctl::I2C_SMBUS_READ,
                command,
                ioctl::I2C_SMBUS_BLOCK_DATA,
                Some(&mut data),
            )?;
            Ok(read_block(&data))
        })
        .await
    }

    /// I²C-style block write: no count byte on the wire.
    pub async fn smbus_write_i2c_block_data(&self, command: u8, bytes: &[u8]) -> Result<(), Error> {
        self.check_smbus(Funcs::SMBUS_WRITE_I2C_BLOCK, "WriteI2CBlockData")?;
        check_block_len(bytes.len())?;
        self.with_retries(None, |conn| {
            let mut data = block_data(bytes);
            conn.smbus_access(
                ioctl::I2C_SMBUS_WRITE,
                command,
                ioctl::I2C_SMBUS_I2C_BLOCK_DATA,
                Some(&mut data),
            )
        })
        .await
    }

    /// I²C-style block read of exactly `len` bytes.
    pub async fn smbus_read_i2c_block_data(&self, command: u8, len: usize) -> Result<Vec<u8>, Error> {
        self.check_smbus(Funcs::SMBUS_READ_I2C_BLOCK, "ReadI2CBlockData")?;
        check_block_len(len)?;
        self.with_retries(None, |conn| {
            let mut block = [0u8; I2C_SMBUS_BLOCK_MAX + 2];
            block[0] = len as u8;
            let mut data = SmbusData { block };
            conn.smbus_access(
                ioctl::I2C_SMBUS_READ,
                command,
                ioctl::I2C_SMBUS_I2C_BLOCK_DATA,
                Some(&mut data),
            )?;
            Ok(read_block(&data))
        })
        .await
    }

    pub async fn smbus_block_process_call(&self, command: u8, bytes: &[u8]) -> Result<Vec<u8>, Error> {
        self.check_smbus(Funcs::SMBUS_BLOCK_PROC_CALL, "BlockProcessCall")?;
        check_block_len(bytes.len())?;
        self.with_retries(None, |conn| {
            let mut data = block_data(bytes);
            conn.smbus_access(
                ioctl::I2C_SMBUS_WRITE,
                command,
                ioctl::I2C_SMBUS_BLOCK_PROC_CALL,
                Some(&mut data),
            )?;
            Ok(read_block(&data))
        })
        .await
    }
}

pub(crate) fn check_block_len(len: usize) -> Result<(), Error> {
    if len > I2C_SMBUS_BLOCK_MAX {
        return Err(Error::BufferTooLarge {
            len,
            max: I2C_SMBUS_BLOCK_MAX,
        });
    }
    Ok(())
}

fn block_data(bytes: &[u8]) -> SmbusData {
    let mut block = [0u8; I2C_SMBUS_BLOCK_MAX + 2];
    block[0] = bytes.len() as u8;
    block[1..=bytes.len()].copy_from_slice(bytes);
    SmbusData { block }
}

fn read_block(data: &SmbusData) -> Vec<u8> {
    let len = (unsafe { data.block[0] } as usize).min(I2C_SMBUS_BLOCK_MAX);
    unsafe { data.block[1..=len].to_vec() }
}
