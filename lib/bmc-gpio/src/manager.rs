//! Owner of open chips and lines.
use crate::chip::{Chip, ChipInfo, LineInfo};
use crate::error::Error;
use crate::line::Line;
use crate::options::{Defaults, LineOptions};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub(crate) struct ManagerInner {
    defaults: Defaults,
    chips: RwLock<HashMap<PathBuf, Arc<Chip>>>,
    lines: RwLock<HashMap<u64, Line>>,
    /// `(chip, offset) -> line id`, the uniqueness index for open lines.
    index: RwLock<HashMap<(PathBuf, u32), u64>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl ManagerInner {
    /// Drop bookkeeping for a closed line.
    pub(crate) fn forget_line(&self, id: u64) {
        let removed = self.lines.write().expect("lines lock poisoned").remove(&id);
        if let Some(line) = removed {
            self.index
                .write()
                .expect("index lock poisoned")
                .remove(&(line.chip_path().to_path_buf(), line.offset()));
        }
    }
}

/// Opens chips at most once and tracks every open line. Cheap to clone.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new(Defaults::default())
    }
}

impl Manager {
    pub fn new(defaults: Defaults) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                defaults,
                chips: RwLock::new(HashMap::new()),
                lines: RwLock::new(HashMap::new()),
                index: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ManagerClosed);
        }
        Ok(())
    }

    fn chip(&self, path: &Path) -> Result<Arc<Chip>, Error> {
        if let Some(chip) = self
            .inner
            .chips
            .read()
            .expect("chips lock poisoned")
            .get(path)
        {
            return Ok(chip.clone());
        }
        let mut chips = self.inner.chips.write().expect("chips lock poisoned");
        // Racing openers may both reach here; keep the first.
        if let Some(chip) = chips.get(path) {
            return Ok(chip.clone());
        }
        let chip = Arc::new(Chip::open(path)?);
        chips.insert(path.to_path_buf(), chip.clone());
        Ok(chip)
    }

    /// Metadata of a chip, opening and caching it if needed.
    pub fn chip_info(&self, chip_path: impl AsRef<Path>) -> Result<ChipInfo, Error> {
        self.ensure_open()?;
        Ok(self.chip(chip_path.as_ref())?.info().clone())
    }

    /// Kernel metadata of one line offset.
    pub fn line_info(
        &self,
        chip_path: impl AsRef<Path>,
        offset: u32,
    ) -> Result<LineInfo, Error> {
        self.ensure_open()?;
        self.chip(chip_path.as_ref())?.line_info(offset)
    }

    /// Request a line by offset.
    pub fn request_line(
        &self,
        chip_path: impl AsRef<Path>,
        offset: u32,
        options: LineOptions,
    ) -> Result<Line, Error> {
        self.request_inner(chip_path.as_ref(), LineSelector::Offset(offset), options)
    }

    /// Request a line by its kernel name.
    pub fn request_line_by_name(
        &self,
        chip_path: impl AsRef<Path>,
        name: &str,
        options: LineOptions,
    ) -> Result<Line, Error> {
        self.request_inner(chip_path.as_ref(), LineSelector::Name(name), options)
    }

    fn request_inner(
        &self,
        chip_path: &Path,
        selector: LineSelector<'_>,
        options: LineOptions,
    ) -> Result<Line, Error> {
        self.ensure_open()?;
        let chip = self.chip(chip_path)?;

        let (offset, name) = match selector {
            LineSelector::Offset(offset) => {
                if offset >= chip.info().lines {
                    return Err(Error::LineNotFound(format!(
                        "{} line {offset}",
                        chip_path.display()
                    )));
                }
                let name = chip.line_info(offset)?.name;
                (offset, (!name.is_empty()).then_some(name))
            }
            LineSelector::Name(name) => (chip.find_line(name)?, Some(name.to_string())),
        };

        let options = options.merge(&self.inner.defaults);
        options.validate()?;

        let key = (chip_path.to_path_buf(), offset);
        {
            let index = self.inner.index.read().expect("index lock poisoned");
            if index.contains_key(&key) {
                return Err(Error::LineAlreadyRequested {
                    chip: chip_path.display().to_string(),
                    line: offset,
                });
            }
        }

        let fd = chip.request_line(offset, &options)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let line = Line::new(
            id,
            chip_path.to_path_buf(),
            offset,
            name,
            options,
            fd,
            Arc::downgrade(&self.inner),
        )?;

        let mut index = self.inner.index.write().expect("index lock poisoned");
        if index.contains_key(&key) {
            // Lost the race; release what we just requested.
            let _ = line.close();
            return Err(Error::LineAlreadyRequested {
                chip: chip_path.display().to_string(),
                line: offset,
            });
        }
        index.insert(key, id);
        drop(index);
        self.inner
            .lines
            .write()
            .expect("lines lock poisoned")
            .insert(id, line.clone());
        Ok(line)
    }

    /// Look up an open line by `(chip, offset)`.
    pub fn get_line(&self, chip_path: impl AsRef<Path>, offset: u32) -> Option<Line> {
        let id = *self
            .inner
            .index
            .read()
            .expect("index lock poisoned")
            .get(&(chip_path.as_ref().to_path_buf(), offset))?;
        self.inner
            .lines
            .read()
            .expect("lines lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Every line currently open.
    pub fn get_all_lines(&self) -> Vec<Line> {
        self.inner
            .lines
            .read()
            .expect("lines lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Close a line and drop the bookkeeping for it.
    pub fn release(&self, line: &Line) -> Result<(), Error> {
        line.close()
    }

    /// Close every line and refuse further requests.
    pub fn close(&self) -> Result<(), Error> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for line in self.get_all_lines() {
            let _ = line.close();
        }
        self.inner.chips.write().expect("chips lock poisoned").clear();
        Ok(())
    }
}

enum LineSelector<'a> {
    Offset(u32),
    Name(&'a str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_manager_rejects_requests() {
        let manager = Manager::default();
        manager.close().unwrap();
        let err = manager
            .request_line("/dev/gpiochip0", 0, LineOptions::input())
            .unwrap_err();
        assert!(matches!(err, Error::ManagerClosed));
        // Closing twice is fine.
        manager.close().unwrap();
    }

    #[test]
    fn invalid_chip_path_is_rejected_before_open() {
        let manager = Manager::default();
        let err = manager
            .request_line("/sys/class/gpio", 0, LineOptions::input())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidChipPath(_)));
    }

    #[test]
    fn unknown_line_lookup_is_none() {
        let manager = Manager::default();
        assert!(manager.get_line("/dev/gpiochip0", 3).is_none());
        assert!(manager.get_all_lines().is_empty());
    }
}
