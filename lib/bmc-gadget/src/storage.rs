//! Mass-storage LUN media control.
use crate::error::Error;
use crate::gadget::GadgetManager;
use std::path::PathBuf;
use tokio::fs;

/// Attributes read back from one LUN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LunState {
    pub file: String,
    pub read_only: bool,
    pub removable: bool,
    pub cdrom: bool,
}

impl GadgetManager {
    fn lun_dir(root: &std::path::Path, lun: u32) -> PathBuf {
        root.join("functions")
            .join("mass_storage.usb0")
            .join(format!("lun.{lun}"))
    }

    /// Insert media: set the CD-ROM flag, then point the LUN at `file`.
    /// An empty `file` ejects the media.
    pub async fn set_lun_file(
        &self,
        gadget: &str,
        lun: u32,
        cdrom: bool,
        file: &str,
    ) -> Result<(), Error> {
        let root = self.existing(gadget).await?;
        let dir = Self::lun_dir(&root, lun);
        if fs::metadata(&dir).await.is_err() {
            return Err(Error::GadgetNotFound(format!("{gadget} lun.{lun}")));
        }
        write_lun_attr(&dir, "cdrom", if cdrom { "1" } else { "0" }).await?;
        write_lun_attr(&dir, "file", file).await
    }

    /// Eject the media from a LUN.
    pub async fn eject_lun(&self, gadget: &str, lun: u32) -> Result<(), Error> {
        let root = self.existing(gadget).await?;
        let dir = Self::lun_dir(&root, lun);
        write_lun_attr(&dir, "file", "").await
    }

    /// Read the LUN attributes back from configfs.
    pub async fn lun_state(&self, gadget: &str, lun: u32) -> Result<LunState, Error> {
        let root = self.existing(gadget).await?;
        let dir = Self::lun_dir(&root, lun);
        if fs::metadata(&dir).await.is_err() {
            return Err(Error::GadgetNotFound(format!("{gadget} lun.{lun}")));
        }
        Ok(LunState {
            file: read_lun_attr(&dir, "file").await?,
            read_only: read_lun_attr(&dir, "ro").await? == "1",
            removable: read_lun_attr(&dir, "removable").await? == "1",
            cdrom: read_lun_attr(&dir, "cdrom").await? == "1",
        })
    }
}

async fn write_lun_attr(dir: &std::path::Path, attr: &str, value: &str) -> Result<(), Error> {
    let path = dir.join(attr);
    fs::write(&path, value.as_bytes())
        .await
        .map_err(|e| Error::from_io(&path, e))
}

async fn read_lun_attr(dir: &std::path::Path, attr: &str) -> Result<String, Error> {
    let path = dir.join(attr);
    match fs::read_to_string(&path).await {
        Ok(s) => Ok(s.trim_end_matches('\n').to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(Error::from_io(&path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GadgetConfig, LunConfig};

    async fn media_gadget() -> (tempfile::TempDir, GadgetManager) {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("configfs/usb_gadget")).unwrap();
        std::fs::create_dir_all(tmp.path().join("udc")).unwrap();
        let manager =
            GadgetManager::with_roots(tmp.path().join("configfs"), tmp.path().join("udc"));
        let config = GadgetConfig::new("media")
            .with_mass_storage(true)
            .with_lun(LunConfig::new().with_inquiry_string("BMC Virtual Media  "));
        manager.create(&config).await.unwrap();
        (tmp, manager)
    }

    #[tokio::test]
    async fn insert_and_eject_media() {
        let (_tmp, manager) = media_gadget().await;
        manager
            .set_lun_file("media", 0, true, "/srv/install.iso")
            .await
            .unwrap();
        let state = manager.lun_state("media", 0).await.unwrap();
        assert_eq!(state.file, "/srv/install.iso");
        assert!(state.cdrom);
        assert!(state.removable);
        assert!(!state.read_only);

        manager.eject_lun("media", 0).await.unwrap();
        assert_eq!(manager.lun_state("media", 0).await.unwrap().file, "");
    }

    #[tokio::test]
    async fn inquiry_string_preserved_verbatim() {
        let (tmp, manager) = media_gadget().await;
        let _ = manager;
        // Trailing spaces survive; padding is the kernel's business.
        let raw = std::fs::read_to_string(
            tmp.path()
                .join("configfs/usb_gadget/media/functions/mass_storage.usb0/lun.0/inquiry_string"),
        )
        .unwrap();
        assert_eq!(raw, "BMC Virtual Media  ");
    }

    #[tokio::test]
    async fn missing_lun_reported() {
        let (_tmp, manager) = media_gadget().await;
        assert!(matches!(
            manager.lun_state("media", 5).await,
            Err(Error::GadgetNotFound(_))
        ));
    }
}
