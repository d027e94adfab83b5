//! Rebinding a VF's PCI function between kernel and userspace drivers.
//!
//! The transition must be reversible by a later, unrelated invocation, so
//! the previously bound kernel driver is captured into a [`BindRecord`]
//! before the function is handed to the poll-mode driver. The record is
//! persisted before the bind reports success; without it, release cannot
//! reconstruct the kernel driver and fails permanently for that VF.

use crate::drivers::USERSPACE_DRIVERS;
use crate::record::{BindRecord, RecordError, RecordStore};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Rebinding to the kernel driver is not synchronous on every NIC family;
/// the i40e family needs a moment before VF attributes accept writes again.
/// Workaround, not a guarantee: rapid setup/release cycles on one VF can
/// still race.
pub const REBIND_SETTLE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to determine the kernel driver of {pci_addr}")]
    DriverLookup { pci_addr: String },

    #[error("{pci_addr} is already bound to the userspace driver {driver}")]
    DriverMismatch { pci_addr: String, driver: String },

    #[error("failed to unbind {pci_addr} from {driver}: {source}")]
    Unbind {
        pci_addr: String,
        driver: String,
        source: io::Error,
    },

    #[error("failed to bind {pci_addr} to {driver}: {source}")]
    Bind {
        pci_addr: String,
        driver: String,
        source: io::Error,
    },

    #[error(transparent)]
    Record(#[from] RecordError),
}

pub type Result<T> = std::result::Result<T, BindError>;

/// Controller over the PCI bus sysfs bind/unbind attributes.
#[derive(Debug, Clone)]
pub struct DriverBinder {
    devices_root: PathBuf,
    drivers_root: PathBuf,
}

impl DriverBinder {
    pub fn host() -> Self {
        Self::with_roots("/sys/bus/pci/devices", "/sys/bus/pci/drivers")
    }

    pub fn with_roots(devices_root: impl Into<PathBuf>, drivers_root: impl Into<PathBuf>) -> Self {
        Self {
            devices_root: devices_root.into(),
            drivers_root: drivers_root.into(),
        }
    }

    /// Driver currently bound to the function, if any.
    pub fn bound_driver(&self, pci_addr: &str) -> Option<String> {
        let link = self.devices_root.join(pci_addr).join("driver");
        let resolved = fs::canonicalize(link).ok()?;
        resolved
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    /// Unbind the function from its kernel driver and hand it to the given
    /// userspace driver, persisting the reversal record before reporting
    /// success.
    ///
    /// `fallback_kernel_driver` covers functions whose driver symlink is
    /// already gone; the configured value stands in for the captured one.
    #[allow(clippy::too_many_arguments)]
    pub fn bind_userspace<S: RecordStore>(
        &self,
        store: &S,
        pci_addr: &str,
        userspace_driver: &str,
        fallback_kernel_driver: Option<&str>,
        container_id: &str,
        ifname: &str,
        vf: u32,
    ) -> Result<BindRecord> {
        let kernel_driver = match self.bound_driver(pci_addr) {
            Some(driver) => driver,
            None => fallback_kernel_driver
                .map(str::to_string)
                .ok_or_else(|| BindError::DriverLookup {
                    pci_addr: pci_addr.to_string(),
                })?,
        };
        // Recording a userspace driver as "the kernel driver to restore"
        // would make the binding unrecoverable.
        if USERSPACE_DRIVERS.contains(&kernel_driver.as_str()) {
            return Err(BindError::DriverMismatch {
                pci_addr: pci_addr.to_string(),
                driver: kernel_driver,
            });
        }

        self.unbind(pci_addr, &kernel_driver)?;
        self.bind(pci_addr, userspace_driver)?;

        let record = BindRecord {
            pci_addr: pci_addr.to_string(),
            kernel_driver: kernel_driver.clone(),
            userspace_driver: userspace_driver.to_string(),
            container_id: container_id.to_string(),
            ifname: ifname.to_string(),
            vf,
        };
        if let Err(e) = store.save(&record) {
            // No record, no recoverable binding: put the kernel driver back
            // and report the persist failure as the primary error.
            if let Err(undo) = self
                .unbind(pci_addr, userspace_driver)
                .and_then(|()| self.bind(pci_addr, &kernel_driver))
            {
                warn!(pci_addr, error = %undo, "failed to restore kernel driver after record persist failure");
            }
            return Err(e.into());
        }

        info!(pci_addr, %kernel_driver, userspace_driver, "vf bound to userspace driver");
        Ok(record)
    }

    /// Load the persisted record, rebind the function to its captured
    /// kernel driver, wait out the settle delay and drop the record.
    ///
    /// A missing record is fatal for this release: the prior kernel driver
    /// cannot be reconstructed from anywhere else.
    pub async fn unbind_userspace<S: RecordStore>(
        &self,
        store: &S,
        container_id: &str,
        ifname: &str,
    ) -> Result<BindRecord> {
        let record = store.load(container_id, ifname)?;

        self.unbind(&record.pci_addr, &record.userspace_driver)?;
        self.bind(&record.pci_addr, &record.kernel_driver)?;
        tokio::time::sleep(REBIND_SETTLE).await;

        store.delete(container_id, ifname)?;
        info!(
            pci_addr = %record.pci_addr,
            kernel_driver = %record.kernel_driver,
            "vf rebound to kernel driver"
        );
        Ok(record)
    }

    fn unbind(&self, pci_addr: &str, driver: &str) -> Result<()> {
        let attr = self.devices_root.join(pci_addr).join("driver/unbind");
        match fs::write(&attr, pci_addr) {
            Ok(()) => Ok(()),
            // Driver already detached; nothing to unbind from.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(BindError::Unbind {
                pci_addr: pci_addr.to_string(),
                driver: driver.to_string(),
                source,
            }),
        }
    }

    fn bind(&self, pci_addr: &str, driver: &str) -> Result<()> {
        self.set_override(pci_addr, driver);
        let attr = self.drivers_root.join(driver).join("bind");
        let result = fs::write(&attr, pci_addr).map_err(|source| BindError::Bind {
            pci_addr: pci_addr.to_string(),
            driver: driver.to_string(),
            source,
        });
        self.set_override(pci_addr, "");
        result
    }

    /// Steer the next probe to `driver`. The attribute is absent on older
    /// kernels; the plain bind write still works there.
    fn set_override(&self, pci_addr: &str, driver: &str) {
        let attr = self.devices_root.join(pci_addr).join("driver_override");
        if attr.exists() {
            let payload = if driver.is_empty() { "\n" } else { driver };
            let _ = fs::write(attr, payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MemoryRecordStore;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    struct FakeBus {
        root: TempDir,
    }

    impl FakeBus {
        fn new() -> Self {
            let root = TempDir::new().unwrap();
            fs::create_dir_all(root.path().join("devices")).unwrap();
            fs::create_dir_all(root.path().join("drivers")).unwrap();
            Self { root }
        }

        fn binder(&self) -> DriverBinder {
            DriverBinder::with_roots(
                self.root.path().join("devices"),
                self.root.path().join("drivers"),
            )
        }

        fn add_driver(&self, name: &str) {
            let dir = self.root.path().join("drivers").join(name);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("bind"), "").unwrap();
            fs::write(dir.join("unbind"), "").unwrap();
        }

        fn add_device(&self, pci_addr: &str, driver: Option<&str>) {
            let dir = self.root.path().join("devices").join(pci_addr);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("driver_override"), "\n").unwrap();
            if let Some(driver) = driver {
                self.add_driver(driver);
                symlink(self.root.path().join("drivers").join(driver), dir.join("driver"))
                    .unwrap();
            }
        }

        fn read(&self, rel: &str) -> String {
            fs::read_to_string(self.root.path().join(rel)).unwrap()
        }
    }

    #[test]
    fn bind_captures_kernel_driver_and_persists_record() {
        let bus = FakeBus::new();
        bus.add_device("0000:03:10.0", Some("i40evf"));
        bus.add_driver("vfio-pci");
        let store = MemoryRecordStore::new();

        let record = bus
            .binder()
            .bind_userspace(&store, "0000:03:10.0", "vfio-pci", None, "cid-1", "net1", 2)
            .unwrap();

        assert_eq!(record.kernel_driver, "i40evf");
        assert_eq!(bus.read("drivers/i40evf/unbind"), "0000:03:10.0");
        assert_eq!(bus.read("drivers/vfio-pci/bind"), "0000:03:10.0");
        assert_eq!(store.load("cid-1", "net1").unwrap(), record);
    }

    #[test]
    fn bind_without_driver_uses_fallback() {
        let bus = FakeBus::new();
        bus.add_device("0000:03:10.0", None);
        bus.add_driver("vfio-pci");
        let store = MemoryRecordStore::new();

        let record = bus
            .binder()
            .bind_userspace(
                &store,
                "0000:03:10.0",
                "vfio-pci",
                Some("i40evf"),
                "cid-1",
                "net1",
                0,
            )
            .unwrap();
        assert_eq!(record.kernel_driver, "i40evf");
    }

    #[test]
    fn bind_of_an_already_userspace_bound_vf_is_a_mismatch() {
        let bus = FakeBus::new();
        bus.add_device("0000:03:10.0", Some("vfio-pci"));
        let store = MemoryRecordStore::new();

        let err = bus
            .binder()
            .bind_userspace(&store, "0000:03:10.0", "vfio-pci", None, "cid-1", "net1", 0)
            .unwrap_err();
        assert!(matches!(err, BindError::DriverMismatch { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn bind_without_driver_or_fallback_fails() {
        let bus = FakeBus::new();
        bus.add_device("0000:03:10.0", None);
        bus.add_driver("vfio-pci");
        let store = MemoryRecordStore::new();

        let err = bus
            .binder()
            .bind_userspace(&store, "0000:03:10.0", "vfio-pci", None, "cid-1", "net1", 0)
            .unwrap_err();
        assert!(matches!(err, BindError::DriverLookup { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unbind_restores_kernel_driver_and_drops_record() {
        let bus = FakeBus::new();
        bus.add_device("0000:03:10.0", Some("i40evf"));
        bus.add_driver("vfio-pci");
        let store = MemoryRecordStore::new();
        let binder = bus.binder();
        binder
            .bind_userspace(&store, "0000:03:10.0", "vfio-pci", None, "cid-1", "net1", 2)
            .unwrap();

        let record = binder.unbind_userspace(&store, "cid-1", "net1").await.unwrap();

        assert_eq!(record.vf, 2);
        assert_eq!(bus.read("drivers/i40evf/bind"), "0000:03:10.0");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn unbind_without_record_is_fatal() {
        let bus = FakeBus::new();
        let store = MemoryRecordStore::new();
        let err = bus
            .binder()
            .unbind_userspace(&store, "cid-404", "net1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BindError::Record(RecordError::NotFound { .. })
        ));
    }
}
