//! A GPIO chip character device, opened once and cached by the manager.
use crate::error::Error;
use crate::options::LineOptions;
use crate::uapi;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

/// Metadata read from the chip at open time.
#[derive(Debug, Clone)]
pub struct ChipInfo {
    pub name: String,
    pub label: String,
    pub lines: u32,
}

/// Metadata for one line on a chip.
#[derive(Debug, Clone)]
pub struct LineInfo {
    pub name: String,
    pub consumer: String,
    pub offset: u32,
    pub used: bool,
}

#[derive(Debug)]
pub(crate) struct Chip {
    path: PathBuf,
    file: File,
    info: ChipInfo,
}

impl Chip {
    /// Open `/dev/gpiochip<N>` and read its metadata.
    pub(crate) fn open(path: &Path) -> Result<Self, Error> {
        let display = path.display().to_string();
        validate_path(path)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::ChipNotFound(display.clone()),
                io::ErrorKind::PermissionDenied => Error::ChipAccessDenied(display.clone()),
                _ => Error::ChipOperation(e),
            })?;

        let mut raw = uapi::GpioChipInfo::default();
        unsafe {
            uapi::ioctl(file.as_raw_fd(), uapi::GPIO_GET_CHIPINFO_IOCTL, &mut raw)
                .map_err(Error::ChipOperation)?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            info: ChipInfo {
                name: uapi::name_to_string(&raw.name),
                label: uapi::name_to_string(&raw.label),
                lines: raw.lines,
            },
        })
    }

    pub(crate) fn info(&self) -> &ChipInfo {
        &self.info
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Read kernel metadata for one line offset.
    pub(crate) fn line_info(&self, offset: u32) -> Result<LineInfo, Error> {
        if offset >= self.info.lines {
            return Err(Error::LineNotFound(format!(
                "{} line {offset}",
                self.path.display()
            )));
        }
        let mut raw = uapi::GpioLineInfo {
            offset,
            ..Default::default()
        };
        unsafe {
            uapi::ioctl(
                self.file.as_raw_fd(),
                uapi::GPIO_V2_GET_LINEINFO_IOCTL,
                &mut raw,
            )
            .map_err(Error::ChipOperation)?;
        }
        Ok(LineInfo {
            name: uapi::name_to_string(&raw.name),
            consumer: uapi::name_to_string(&raw.consumer),
            offset: raw.offset,
            used: raw.flags & uapi::LineFlags::USED.bits() != 0,
        })
    }

    /// Find a line offset by its kernel name.
    pub(crate) fn find_line(&self, name: &str) -> Result<u32, Error> {
        for offset in 0..self.info.lines {
            if self.line_info(offset)?.name == name {
                return Ok(offset);
            }
        }
        Err(Error::LineNotFound(format!(
            "{} line named {name:?}",
            self.path.display()
        )))
    }

    /// Submit a single line request and return the owned request fd.
    pub(crate) fn request_line(&self, offset: u32, opts: &LineOptions) -> Result<OwnedFd, Error> {
        let mut req = uapi::GpioLineRequest::default();
        req.offsets[0] = offset;
        req.num_lines = 1;
        req.fd = -1;

        let consumer = opts.consumer.as_bytes();
        for (i, b) in consumer
            .iter()
            .take(uapi::GPIO_MAX_NAME_SIZE - 1)
            .enumerate()
        {
            req.consumer[i] = *b as libc::c_char;
        }

        req.config.flags = opts.flags().bits();
        let mut num_attrs = 0;
        if !opts.debounce.is_zero() {
            let attr = &mut req.config.attrs[num_attrs];
            attr.attr.id = uapi::LINE_ATTR_ID_DEBOUNCE;
            attr.attr.value.debounce_period_us = opts.debounce.as_micros() as u32;
            attr.mask = 1;
            num_attrs += 1;
        }
        if opts.direction == crate::options::Direction::Output {
            let attr = &mut req.config.attrs[num_attrs];
            attr.attr.id = uapi::LINE_ATTR_ID_OUTPUT_VALUES;
            attr.attr.value.values = u64::from(opts.initial_value);
            attr.mask = 1;
            num_attrs += 1;
        }
        req.config.num_attrs = num_attrs as u32;

        if opts.has_edges() {
            req.event_buffer_size = opts.event_buffer_size;
        }

        unsafe {
            uapi::ioctl(self.file.as_raw_fd(), uapi::GPIO_V2_GET_LINE_IOCTL, &mut req)
                .map_err(Error::ChipOperation)?;
        }
        if req.fd < 0 {
            return Err(Error::ChipOperation(io::Error::other(
                "kernel returned invalid line fd",
            )));
        }
        Ok(unsafe { OwnedFd::from_raw_fd(req.fd) })
    }
}

/// Accept only `/dev/gpiochip<N>` paths.
pub(crate) fn validate_path(path: &Path) -> Result<(), Error> {
    let invalid = || Error::InvalidChipPath(path.display().to_string());
    let name = path.file_name().and_then(|n| n.to_str()).ok_or_else(invalid)?;
    if path.parent() != Some(Path::new("/dev")) {
        return Err(invalid());
    }
    let digits = name.strip_prefix("gpiochip").ok_or_else(invalid)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_validation() {
        assert!(validate_path(Path::new("/dev/gpiochip0")).is_ok());
        assert!(validate_path(Path::new("/dev/gpiochip12")).is_ok());
        assert!(validate_path(Path::new("/dev/gpiochip")).is_err());
        assert!(validate_path(Path::new("/dev/gpiochipX")).is_err());
        assert!(validate_path(Path::new("/tmp/gpiochip0")).is_err());
        assert!(validate_path(Path::new("/dev/i2c-1")).is_err());
    }

    #[test]
    fn missing_chip_maps_to_not_found() {
        let err = Chip::open(Path::new("/dev/gpiochip99")).unwrap_err();
        assert!(matches!(err, Error::ChipNotFound(_)));
    }
}
