//! An open connection to one slave device.
use crate::config::{AddressMode, Config, SEVEN_BIT_MAX, SEVEN_BIT_MIN};
use crate::error::{Error, join_attempts};
use crate::ioctl::{self, Funcs};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Delay between transfer attempts.
pub(crate) const RETRY_DELAY: Duration = Duration::from_millis(10);

/// A capability-negotiated connection to `/dev/i2c-<bus>`.
#[derive(Debug)]
pub struct Connection {
    file: Option<File>,
    config: Config,
    funcs: Funcs,
    /// The address currently programmed into the adapter, if any.
    address: Option<u16>,
}

impl Connection {
    /// Open the bus device, negotiate capabilities, and apply `config`.
    pub fn open(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let path = config.device_path();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::BusNotFound(path.clone()),
                io::ErrorKind::PermissionDenied => Error::BusAccessDenied(path.clone()),
                _ => Error::BusOpenFailed(e),
            })?;

        let mut raw_funcs: libc::c_ulong = 0;
        unsafe {
            ioctl::ioctl(file.as_raw_fd(), ioctl::I2C_FUNCS, &mut raw_funcs)
                .map_err(Error::OperationFailed)?;
        }
        let funcs = Funcs::from_bits_truncate(raw_funcs as u64);

        let mut conn = Self {
            file: Some(file),
            config,
            funcs,
            address: None,
        };
        conn.apply_config()?;
        conn.set_address(conn.config.address)?;
        Ok(conn)
    }

    fn apply_config(&mut self) -> Result<(), Error> {
        let fd = self.fd()?;

        // Kernel timeout granularity is 10 ms units.
        let ticks = (self.config.timeout.as_millis() / 10).max(1) as libc::c_ulong;
        unsafe {
            ioctl::ioctl_int(fd, ioctl::I2C_TIMEOUT, ticks).map_err(Error::OperationFailed)?;
            ioctl::ioctl_int(fd, ioctl::I2C_RETRIES, self.config.retries as libc::c_ulong)
                .map_err(Error::OperationFailed)?;
        }

        if self.config.address_mode == AddressMode::TenBit {
            if !self.funcs.contains(Funcs::TENBIT_ADDR) {
                return Err(Error::OperationFailed(io::Error::other(
                    "adapter does not support 10-bit addressing",
                )));
            }
            unsafe {
                ioctl::ioctl_int(fd, ioctl::I2C_TENBIT, 1).map_err(Error::OperationFailed)?;
            }
        }

        if self.config.pec {
            if !self.funcs.contains(Funcs::SMBUS_PEC) {
                return Err(Error::PecNotSupported);
            }
            unsafe {
                ioctl::ioctl_int(fd, ioctl::I2C_PEC, 1).map_err(Error::OperationFailed)?;
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Adapter functionality negotiated at open time.
    pub fn funcs(&self) -> Funcs {
        self.funcs
    }

    pub(crate) fn fd(&self) -> Result<std::os::fd::RawFd, Error> {
        Ok(self
            .file
            .as_ref()
            .ok_or(Error::ConnectionClosed)?
            .as_raw_fd())
    }

    pub(crate) fn slave_address(&self) -> Result<u16, Error> {
        self.address.ok_or(Error::ProtocolViolation("no slave address set"))
    }

    /// Program `address` into the adapter. A repeated set of the current
    /// address issues no ioctl.
    pub fn set_address(&mut self, address: u16) -> Result<(), Error> {
        Config::validate_address(address, self.config.address_mode, self.config.force_address)?;
        if self.address == Some(address) {
            return Ok(());
        }
        self.program_address(address)
    }

    /// Program `address` unconditionally.
    fn program_address(&mut self, address: u16) -> Result<(), Error> {
        let request = if self.config.force_address {
            ioctl::I2C_SLAVE_FORCE
        } else {
            ioctl::I2C_SLAVE
        };
        unsafe {
            ioctl::ioctl_int(self.fd()?, request, address as libc::c_ulong)
                .map_err(Error::OperationFailed)?;
        }
        self.address = Some(address);
        Ok(())
    }

    /// Run `op` up to `1 + retries` times with [`RETRY_DELAY`] between
    /// attempts. A canceled context is surfaced immediately.
    pub(crate) async fn with_retries<T>(
        &self,
        ctx: Option<&CancellationToken>,
        mut op: impl FnMut(&Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let attempts = self.config.retries as usize + 1;
        let mut errors = Vec::new();
        for attempt in 0..attempts {
            if let Some(ctx) = ctx
                && ctx.is_cancelled()
            {
                return Err(Error::ContextCanceled);
            }
            match op(self) {
                Ok(value) => return Ok(value),
                Err(e) => errors.push(e),
            }
            if attempt + 1 < attempts {
                match ctx {
                    Some(ctx) => tokio::select! {
                        _ = ctx.cancelled() => return Err(Error::ContextCanceled),
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    },
                    None => tokio::time::sleep(RETRY_DELAY).await,
                }
            }
        }
        Err(join_attempts(errors))
    }

    fn raw_read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let n = unsafe { libc::read(self.fd()?, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(Error::OperationFailed(io::Error::last_os_error()));
        }
        Ok(n as usize)
    }

    fn raw_write(&self, buf: &[u8]) -> Result<(), Error> {
        let n = unsafe { libc::write(self.fd()?, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(Error::OperationFailed(io::Error::last_os_error()));
        }
        if n as usize != buf.len() {
            return Err(Error::OperationFailed(io::Error::other("short write")));
        }
        Ok(())
    }

    /// Raw byte read from the programmed slave, with retries.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.read_ctx(None, buf).await
    }

    pub async fn read_ctx(
        &self,
        ctx: Option<&CancellationToken>,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        self.with_retries(ctx, |conn| conn.raw_read(buf)).await
    }

    /// Raw byte write to the programmed slave, with retries.
    pub async fn write(&self, buf: &[u8]) -> Result<(), Error> {
        self.write_ctx(None, buf).await
    }

    pub async fn write_ctx(&self, ctx: Option<&CancellationToken>, buf: &[u8]) -> Result<(), Error> {
        self.with_retries(ctx, |conn| conn.raw_write(buf)).await
    }

    /// Combined write-then-read executed atomically by the adapter.
    /// Either part may be empty, not both.
    pub async fn transaction(&self, write: &[u8], read: &mut [u8]) -> Result<(), Error> {
        self.transaction_ctx(None, write, read).await
    }

    pub async fn transaction_ctx(
        &self,
        ctx: Option<&CancellationToken>,
        write: &[u8],
        read: &mut [u8],
    ) -> Result<(), Error> {
        if write.is_empty() && read.is_empty() {
            return Err(Error::InvalidConfiguration(
                "transaction needs a write or a read part".into(),
            ));
        }
        let address = self.slave_address()?;
        let ten_bit = if self.config.address_mode == AddressMode::TenBit {
            ioctl::I2C_M_TEN
        } else {
            0
        };

        self.with_retries(ctx, |conn| {
            let mut msgs: [ioctl::I2cMsg; 2] = [
                ioctl::I2cMsg {
                    addr: address,
                    flags: ten_bit,
                    len: write.len() as u16,
                    buf: write.as_ptr() as *mut u8,
                },
                ioctl::I2cMsg {
                    addr: address,
                    flags: ten_bit | ioctl::I2C_M_RD,
                    len: read.len() as u16,
                    buf: read.as_mut_ptr(),
                },
            ];
            let (first, nmsgs) = match (write.is_empty(), read.is_empty()) {
                (false, false) => (0, 2),
                (false, true) => (0, 1),
                (true, false) => (1, 1),
                (true, true) => unreachable!(),
            };
            let mut data = ioctl::RdwrIoctlData {
                msgs: msgs[first..].as_mut_ptr(),
                nmsgs,
            };
            unsafe {
                ioctl::ioctl(conn.fd()?, ioctl::I2C_RDWR, &mut data)
                    .map_err(Error::TransactionFailed)?;
            }
            Ok(())
        })
        .await
    }

    /// Probe every valid 7-bit address with a quick read; addresses that
    /// ack are returned. The programmed address is restored afterwards.
    pub async fn scan_bus(&mut self) -> Result<Vec<u16>, Error> {
        if self.config.address_mode != AddressMode::SevenBit {
            return Err(Error::ProtocolViolation("bus scan requires 7-bit mode"));
        }
        let previous = self.address;
        let mut found = Vec::new();
        for address in SEVEN_BIT_MIN..=SEVEN_BIT_MAX {
            if self.program_address(address).is_err() {
                continue;
            }
            if self.smbus_quick_raw(true).is_ok() {
                found.push(address);
            }
        }
        if let Some(previous) = previous {
            self.program_address(previous)?;
        }
        Ok(found)
    }

    /// Release the device. Idempotent.
    pub fn close(&mut self) {
        self.file = None;
        self.address = None;
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_bus_maps_to_not_found() {
        let err = Connection::open(Config::new(10_000, 0x50)).unwrap_err();
        assert!(matches!(err, Error::BusNotFound(_)));
    }

    #[test]
    fn invalid_config_rejected_before_open() {
        let err = Connection::open(Config::new(0, 0x03)).unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(0x03)));
    }

    #[tokio::test]
    async fn retries_surface_joined_errors() {
        let conn = Connection {
            file: None,
            config: Config::new(0, 0x50).with_retries(2),
            funcs: Funcs::empty(),
            address: Some(0x50),
        };
        let err = conn
            .with_retries(None, |_| Err::<(), _>(Error::ConnectionClosed))
            .await
            .unwrap_err();
        match err {
            Error::RetriesExhausted { attempts, joined } => {
                assert_eq!(attempts, 3);
                assert!(joined.contains("closed"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn canceled_context_preempts_retry_delay() {
        let conn = Connection {
            file: None,
            config: Config::new(0, 0x50).with_retries(5),
            funcs: Funcs::empty(),
            address: Some(0x50),
        };
        let ctx = CancellationToken::new();
        ctx.cancel();
        let started = std::time::Instant::now();
        let err = conn
            .with_retries(Some(&ctx), |_| Err::<(), _>(Error::ConnectionClosed))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ContextCanceled));
        assert!(started.elapsed() < RETRY_DELAY);
    }

    #[tokio::test]
    async fn empty_transaction_rejected() {
        let conn = Connection {
            file: None,
            config: Config::new(0, 0x50),
            funcs: Funcs::empty(),
            address: Some(0x50),
        };
        let err = conn.transaction(&[], &mut []).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }
}
