//! Composite gadget lifecycle over configfs.
use crate::config::GadgetConfig;
use crate::error::Error;
use crate::hid;
use std::path::{Path, PathBuf};
use tokio::fs;

pub(crate) const ENGLISH_US: &str = "0x409";

/// Binding state read back from configfs and the UDC class device.
#[derive(Debug, Clone)]
pub struct GadgetStatus {
    pub name: String,
    pub bound: bool,
    pub udc: Option<String>,
    /// UDC `state` attribute, e.g. `configured` or `not attached`.
    pub usb_state: Option<String>,
}

/// Creates, binds and destroys composite gadgets.
///
/// The configfs and UDC class roots are injectable so tests can run the
/// full composition against a scratch tree.
pub struct GadgetManager {
    configfs_root: PathBuf,
    udc_class_root: PathBuf,
}

impl Default for GadgetManager {
    fn default() -> Self {
        Self {
            configfs_root: PathBuf::from("/sys/kernel/config"),
            udc_class_root: PathBuf::from("/sys/class/udc"),
        }
    }
}

impl GadgetManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_roots(configfs_root: impl Into<PathBuf>, udc_class_root: impl Into<PathBuf>) -> Self {
        Self {
            configfs_root: configfs_root.into(),
            udc_class_root: udc_class_root.into(),
        }
    }

    fn gadget_root(&self) -> PathBuf {
        self.configfs_root.join("usb_gadget")
    }

    fn gadget_path(&self, name: &str) -> PathBuf {
        self.gadget_root().join(name)
    }

    async fn check_configfs(&self) -> Result<(), Error> {
        if !path_exists(&self.configfs_root).await || !path_exists(&self.gadget_root()).await {
            return Err(Error::ConfigFsNotMounted(
                self.configfs_root.display().to_string(),
            ));
        }
        Ok(())
    }

    /// Compose a gadget per `config`. The gadget is left unbound.
    pub async fn create(&self, config: &GadgetConfig) -> Result<(), Error> {
        config.validate()?;
        self.check_configfs().await?;

        let root = self.gadget_path(&config.name);
        if path_exists(&root).await {
            return Err(Error::GadgetExists(config.name.clone()));
        }
        create_dir(&root).await?;

        write_attr(&root, "bcdUSB", "0x0200").await?;
        write_attr(&root, "idVendor", &config.id_vendor).await?;
        write_attr(&root, "idProduct", &config.id_product).await?;
        write_attr(&root, "bcdDevice", "0x0100").await?;

        let strings = root.join("strings").join(ENGLISH_US);
        create_dir(&strings).await?;
        write_attr(&strings, "serialnumber", &config.serial).await?;
        write_attr(&strings, "manufacturer", &config.manufacturer).await?;
        write_attr(&strings, "product", &config.product).await?;

        let config_dir = root.join("configs").join("c.1");
        create_dir(&config_dir).await?;
        write_attr(&config_dir, "MaxPower", &config.max_power.to_string()).await?;
        let config_strings = config_dir.join("strings").join(ENGLISH_US);
        create_dir(&config_strings).await?;
        write_attr(&config_strings, "configuration", "c.1").await?;

        if config.keyboard {
            self.create_hid_function(&root, "usb0", &hid::KEYBOARD).await?;
        }
        if config.mouse {
            self.create_hid_function(&root, "usb1", &hid::MOUSE).await?;
        }
        if config.mass_storage {
            self.create_mass_storage(&root, config).await?;
        }
        Ok(())
    }

    async fn create_hid_function(
        &self,
        root: &Path,
        instance: &str,
        function: &hid::HidFunction,
    ) -> Result<(), Error> {
        let dir = root.join("functions").join(format!("hid.{instance}"));
        create_dir(&dir).await?;
        write_attr(&dir, "protocol", &function.protocol.to_string()).await?;
        write_attr(&dir, "subclass", &function.subclass.to_string()).await?;
        write_attr(&dir, "report_length", &function.report_length.to_string()).await?;
        write_bytes(&dir.join("report_desc"), function.report_desc).await?;
        link_function(root, &dir).await
    }

    async fn create_mass_storage(&self, root: &Path, config: &GadgetConfig) -> Result<(), Error> {
        let dir = root.join("functions").join("mass_storage.usb0");
        create_dir(&dir).await?;
        for (index, lun) in config.luns.iter().enumerate() {
            let lun_dir = dir.join(format!("lun.{index}"));
            // lun.0 exists implicitly on real configfs; tolerate both.
            if !path_exists(&lun_dir).await {
                create_dir(&lun_dir).await?;
            }
            write_attr(&lun_dir, "cdrom", bool_attr(lun.cdrom)).await?;
            write_attr(&lun_dir, "ro", bool_attr(lun.read_only)).await?;
            write_attr(&lun_dir, "removable", bool_attr(lun.removable)).await?;
            write_attr(&lun_dir, "inquiry_string", &lun.inquiry_string).await?;
            write_attr(&lun_dir, "file", &lun.file).await?;
        }
        link_function(root, &dir).await
    }

    /// Bind the gadget to the first UDC whose state is `not attached`,
    /// or to `udc` when given.
    pub async fn bind(&self, name: &str, udc: Option<&str>) -> Result<String, Error> {
        let root = self.existing(name).await?;
        let udc_file = root.join("UDC");
        let current = read_attr(&udc_file).await?;
        if !current.is_empty() {
            return Err(Error::GadgetBound(name.to_string()));
        }
        let udc = match udc {
            Some(udc) => udc.to_string(),
            None => self.find_free_udc().await?,
        };
        write_attr(&root, "UDC", &udc).await?;
        Ok(udc)
    }

    /// Unbind the gadget from its UDC. Unbinding an unbound gadget is a
    /// no-op.
    pub async fn unbind(&self, name: &str) -> Result<(), Error> {
        let root = self.existing(name).await?;
        write_attr(&root, "UDC", "").await
    }

    /// Unbind and remove the configfs tree of the gadget.
    pub async fn destroy(&self, name: &str) -> Result<(), Error> {
        let root = self.existing(name).await?;
        let _ = self.unbind(name).await;

        // Symlinks first, then functions, then the scaffolding; configfs
        // refuses to remove populated directories.
        let config_dir = root.join("configs").join("c.1");
        if let Ok(mut entries) = fs::read_dir(&config_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if fs::symlink_metadata(&path)
                    .await
                    .map(|m| m.file_type().is_symlink())
                    .unwrap_or(false)
                {
                    fs::remove_file(&path).await.map_err(|e| Error::from_io(&path, e))?;
                }
            }
        }
        remove_dir_if_exists(&config_dir.join("strings").join(ENGLISH_US)).await?;
        remove_dir_if_exists(&config_dir).await?;

        let functions = root.join("functions");
        if let Ok(mut entries) = fs::read_dir(&functions).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if let Ok(mut luns) = fs::read_dir(&path).await {
                    while let Ok(Some(lun)) = luns.next_entry().await {
                        if lun.file_name().to_string_lossy().starts_with("lun.") {
                            // configfs keeps lun.0 alive until the function
                            // directory goes; ignore the refusal.
                            let _ = fs::remove_dir(lun.path()).await;
                        }
                    }
                }
                remove_dir_if_exists(&path).await?;
            }
        }
        remove_dir_if_exists(&functions).await?;
        remove_dir_if_exists(&root.join("strings").join(ENGLISH_US)).await?;
        remove_dir_if_exists(&root.join("strings")).await?;
        remove_dir_if_exists(&root.join("configs")).await?;
        remove_dir_if_exists(&root).await
    }

    /// Binding status of the gadget.
    pub async fn status(&self, name: &str) -> Result<GadgetStatus, Error> {
        let root = self.existing(name).await?;
        let udc = read_attr(&root.join("UDC")).await?;
        let bound = !udc.is_empty();
        let usb_state = if bound {
            let state_path = self.udc_class_root.join(&udc).join("state");
            fs::read_to_string(&state_path)
                .await
                .ok()
                .map(|s| s.trim().to_string())
        } else {
            None
        };
        Ok(GadgetStatus {
            name: name.to_string(),
            bound,
            udc: bound.then_some(udc),
            usb_state,
        })
    }

    /// Names of every UDC the kernel exposes.
    pub async fn list_udcs(&self) -> Result<Vec<String>, Error> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.udc_class_root)
            .await
            .map_err(|_| Error::UdcNotFound)?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn find_free_udc(&self) -> Result<String, Error> {
        for name in self.list_udcs().await? {
            let state = fs::read_to_string(self.udc_class_root.join(&name).join("state"))
                .await
                .unwrap_or_default();
            if state.trim() == "not attached" {
                return Ok(name);
            }
        }
        Err(Error::UdcNotFound)
    }

    pub(crate) async fn existing(&self, name: &str) -> Result<PathBuf, Error> {
        self.check_configfs().await?;
        let root = self.gadget_path(name);
        if !path_exists(&root).await {
            return Err(Error::GadgetNotFound(name.to_string()));
        }
        Ok(root)
    }
}

fn bool_attr(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

async fn path_exists(path: &Path) -> bool {
    fs::metadata(path).await.is_ok()
}

async fn create_dir(path: &Path) -> Result<(), Error> {
    fs::create_dir_all(path)
        .await
        .map_err(|e| Error::from_io(path, e))
}

async fn write_attr(dir: &Path, attr: &str, value: &str) -> Result<(), Error> {
    let path = dir.join(attr);
    fs::write(&path, value.as_bytes())
        .await
        .map_err(|e| Error::from_io(&path, e))
}

async fn write_bytes(path: &Path, bytes: &[u8]) -> Result<(), Error> {
    fs::write(path, bytes).await.map_err(|e| Error::from_io(path, e))
}

async fn read_attr(path: &Path) -> Result<String, Error> {
    match fs::read_to_string(path).await {
        Ok(s) => Ok(s.trim().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(Error::from_io(path, e)),
    }
}

async fn remove_dir_if_exists(path: &Path) -> Result<(), Error> {
    match fs::remove_dir(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        // configfs auto-drops attribute files on rmdir; regular
        // filesystems report ENOTEMPTY and need the recursive path.
        Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty => fs::remove_dir_all(path)
            .await
            .map_err(|e| Error::from_io(path, e)),
        Err(e) => Err(Error::from_io(path, e)),
    }
}

async fn link_function(root: &Path, function_dir: &Path) -> Result<(), Error> {
    let target = root
        .join("configs")
        .join("c.1")
        .join(function_dir.file_name().expect("function dir has a name"));
    fs::symlink(function_dir, &target)
        .await
        .map_err(|e| Error::from_io(&target, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LunConfig;

    fn scratch_manager() -> (tempfile::TempDir, GadgetManager) {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("configfs/usb_gadget")).unwrap();
        std::fs::create_dir_all(tmp.path().join("udc")).unwrap();
        let manager =
            GadgetManager::with_roots(tmp.path().join("configfs"), tmp.path().join("udc"));
        (tmp, manager)
    }

    fn full_config() -> GadgetConfig {
        GadgetConfig::new("kvm")
            .with_keyboard(true)
            .with_mouse(true)
            .with_mass_storage(true)
            .with_lun(
                LunConfig::new()
                    .with_file("/srv/media.iso")
                    .with_cdrom(true)
                    .with_inquiry_string("BMC Virtual Media"),
            )
    }

    #[tokio::test]
    async fn create_writes_expected_tree() {
        let (tmp, manager) = scratch_manager();
        manager.create(&full_config()).await.unwrap();

        let root = tmp.path().join("configfs/usb_gadget/kvm");
        let read = |rel: &str| std::fs::read_to_string(root.join(rel)).unwrap();
        assert_eq!(read("bcdUSB"), "0x0200");
        assert_eq!(read("idVendor"), "0x1d6b");
        assert_eq!(read("configs/c.1/MaxPower"), "250");
        assert_eq!(read("strings/0x409/manufacturer"), "BMC");
        assert_eq!(read("functions/hid.usb0/report_length"), "8");
        assert_eq!(read("functions/hid.usb1/report_length"), "6");
        assert_eq!(read("functions/mass_storage.usb0/lun.0/cdrom"), "1");
        assert_eq!(
            read("functions/mass_storage.usb0/lun.0/file"),
            "/srv/media.iso"
        );
        let desc = std::fs::read(root.join("functions/hid.usb0/report_desc")).unwrap();
        assert_eq!(desc, hid::KEYBOARD.report_desc);
        assert!(
            std::fs::symlink_metadata(root.join("configs/c.1/hid.usb0"))
                .unwrap()
                .file_type()
                .is_symlink()
        );
    }

    #[tokio::test]
    async fn create_twice_reports_exists() {
        let (_tmp, manager) = scratch_manager();
        manager.create(&full_config()).await.unwrap();
        assert!(matches!(
            manager.create(&full_config()).await,
            Err(Error::GadgetExists(_))
        ));
    }

    #[tokio::test]
    async fn bind_unbind_cycle() {
        let (tmp, manager) = scratch_manager();
        manager.create(&full_config()).await.unwrap();

        std::fs::create_dir_all(tmp.path().join("udc/dummy_udc.0")).unwrap();
        std::fs::write(tmp.path().join("udc/dummy_udc.0/state"), "not attached\n").unwrap();

        let udc = manager.bind("kvm", None).await.unwrap();
        assert_eq!(udc, "dummy_udc.0");
        assert!(matches!(
            manager.bind("kvm", None).await,
            Err(Error::GadgetBound(_))
        ));

        let status = manager.status("kvm").await.unwrap();
        assert!(status.bound);
        assert_eq!(status.udc.as_deref(), Some("dummy_udc.0"));

        manager.unbind("kvm").await.unwrap();
        // Unbinding twice stays Ok.
        manager.unbind("kvm").await.unwrap();
        assert!(!manager.status("kvm").await.unwrap().bound);
    }

    #[tokio::test]
    async fn bind_without_free_udc_fails() {
        let (tmp, manager) = scratch_manager();
        manager.create(&full_config()).await.unwrap();
        std::fs::create_dir_all(tmp.path().join("udc/busy_udc.0")).unwrap();
        std::fs::write(tmp.path().join("udc/busy_udc.0/state"), "configured\n").unwrap();
        assert!(matches!(
            manager.bind("kvm", None).await,
            Err(Error::UdcNotFound)
        ));
    }

    #[tokio::test]
    async fn destroy_removes_tree() {
        let (tmp, manager) = scratch_manager();
        manager.create(&full_config()).await.unwrap();
        manager.destroy("kvm").await.unwrap();
        assert!(!tmp.path().join("configfs/usb_gadget/kvm").exists());
        assert!(matches!(
            manager.status("kvm").await,
            Err(Error::GadgetNotFound(_))
        ));
    }

    #[tokio::test]
    async fn missing_configfs_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = GadgetManager::with_roots(tmp.path().join("nope"), tmp.path().join("udc"));
        assert!(matches!(
            manager.create(&full_config()).await,
            Err(Error::ConfigFsNotMounted(_))
        ));
    }
}
