//! Read-only topology queries over the network-device sysfs hierarchy.
//!
//! Everything here is idempotent and side-effect free: VF counts, VF/PCI
//! address mapping, PF backlinks, shared-PF discovery and driver
//! classification. The sysfs roots are injectable so tests can point the
//! inspector at a tempdir-built fake tree.

use crate::drivers::DriverRegistry;
use std::fs;
use std::io;
use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Topology query errors.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("failed to open the sriov_numvfs attribute of {pf}: {source}")]
    NumVfsMissing { pf: String, source: io::Error },

    #[error("sriov_numvfs attribute of {pf} is empty")]
    NumVfsEmpty { pf: String },

    #[error("failed to parse sriov_numvfs of {pf}: {source}")]
    NumVfsParse { pf: String, source: ParseIntError },

    #[error("no VF of {pf} has PCI address {pci_addr}")]
    VfNotFound { pf: String, pci_addr: String },

    #[error("virtfn{vf} of {pf} is not a symlink")]
    NotASymlink { pf: String, vf: u32 },

    #[error("failed to read virtfn{vf} of {pf}: {source}")]
    VirtfnUnreadable { pf: String, vf: u32, source: io::Error },

    #[error("no physical function found behind {pci_addr}")]
    PfNotFound { pci_addr: String },

    #[error("no shared sibling interface next to {ifname}")]
    NoSharedSibling { ifname: String },

    #[error("failed to resolve the driver of virtfn{vf} on {pf}: {source}")]
    DriverUnresolved { pf: String, vf: u32, source: io::Error },

    #[error("failed to list netdevs of virtfn{vf} on {pf}: {source}")]
    LinkNamesUnreadable { pf: String, vf: u32, source: io::Error },

    #[error("virtfn{vf} of {pf} has no netdev")]
    NoLinks { pf: String, vf: u32 },

    #[error("failed to read the hardware address of {ifname}: {source}")]
    HwAddressUnreadable { ifname: String, source: io::Error },

    #[error("hardware address attribute of {ifname} is empty")]
    HwAddressEmpty { ifname: String },

    #[error("failed to read the ifindex of {ifname}: {source}")]
    IfindexUnreadable { ifname: String, source: io::Error },

    #[error("failed to parse the ifindex of {ifname}: {source}")]
    IfindexParse { ifname: String, source: ParseIntError },
}

pub type Result<T> = std::result::Result<T, TopologyError>;

/// Inspector over the host's network-device sysfs tree.
#[derive(Debug, Clone)]
pub struct Topology {
    net_root: PathBuf,
    pci_root: PathBuf,
    registry: DriverRegistry,
}

impl Topology {
    /// Inspector over the real host sysfs.
    pub fn host(registry: DriverRegistry) -> Self {
        Self::with_roots("/sys/class/net", "/sys/bus/pci/devices", registry)
    }

    /// Inspector over arbitrary roots, used by tests with fake trees.
    pub fn with_roots(
        net_root: impl Into<PathBuf>,
        pci_root: impl Into<PathBuf>,
        registry: DriverRegistry,
    ) -> Self {
        Self {
            net_root: net_root.into(),
            pci_root: pci_root.into(),
            registry,
        }
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    fn device_dir(&self, pf: &str) -> PathBuf {
        self.net_root.join(pf).join("device")
    }

    fn virtfn_dir(&self, pf: &str, vf: u32) -> PathBuf {
        self.device_dir(pf).join(format!("virtfn{vf}"))
    }

    /// Number of VFs configured on `pf`.
    pub fn vf_count(&self, pf: &str) -> Result<u32> {
        let attr = self.device_dir(pf).join("sriov_numvfs");
        let data = fs::read_to_string(&attr).map_err(|source| TopologyError::NumVfsMissing {
            pf: pf.to_string(),
            source,
        })?;
        let data = data.trim();
        if data.is_empty() {
            return Err(TopologyError::NumVfsEmpty { pf: pf.to_string() });
        }
        data.parse().map_err(|source| TopologyError::NumVfsParse {
            pf: pf.to_string(),
            source,
        })
    }

    /// VF index on `pf` whose PCI address is `pci_addr`.
    pub fn vf_index(&self, pci_addr: &str, pf: &str) -> Result<u32> {
        let total = self.vf_count(pf)?;
        for vf in 0..total {
            let link = self.virtfn_dir(pf, vf);
            let Ok(target) = fs::read_link(&link) else {
                continue;
            };
            if target.file_name().is_some_and(|name| name == pci_addr) {
                return Ok(vf);
            }
        }
        Err(TopologyError::VfNotFound {
            pf: pf.to_string(),
            pci_addr: pci_addr.to_string(),
        })
    }

    /// PCI address of VF `vf` on `pf`.
    pub fn pci_address(&self, pf: &str, vf: u32) -> Result<String> {
        let link = self.virtfn_dir(pf, vf);
        let meta = fs::symlink_metadata(&link).map_err(|source| {
            TopologyError::VirtfnUnreadable {
                pf: pf.to_string(),
                vf,
                source,
            }
        })?;
        if !meta.file_type().is_symlink() {
            return Err(TopologyError::NotASymlink {
                pf: pf.to_string(),
                vf,
            });
        }
        let target = fs::read_link(&link).map_err(|source| TopologyError::VirtfnUnreadable {
            pf: pf.to_string(),
            vf,
            source,
        })?;
        match target.file_name() {
            Some(name) => Ok(name.to_string_lossy().into_owned()),
            None => Err(TopologyError::NotASymlink {
                pf: pf.to_string(),
                vf,
            }),
        }
    }

    /// Name of the PF netdev backing the VF with PCI address `pci_addr`.
    pub fn pf_name(&self, pci_addr: &str) -> Result<String> {
        let net_dir = self.pci_root.join(pci_addr).join("physfn").join("net");
        let mut names = list_dir(&net_dir).map_err(|_| TopologyError::PfNotFound {
            pci_addr: pci_addr.to_string(),
        })?;
        if names.is_empty() {
            return Err(TopologyError::PfNotFound {
                pci_addr: pci_addr.to_string(),
            });
        }
        Ok(names.remove(0))
    }

    /// Sibling interface of `ifname` on dual-netdev hardware.
    ///
    /// Resolves the interface's sysfs entry and returns the first other
    /// entry of the parent `net/` directory.
    pub fn shared_pf(&self, ifname: &str) -> Result<String> {
        let entry = self.net_root.join(ifname);
        let resolved = fs::canonicalize(&entry).map_err(|_| TopologyError::NoSharedSibling {
            ifname: ifname.to_string(),
        })?;
        let parent = resolved
            .parent()
            .ok_or_else(|| TopologyError::NoSharedSibling {
                ifname: ifname.to_string(),
            })?;
        let names = list_dir(parent).map_err(|_| TopologyError::NoSharedSibling {
            ifname: ifname.to_string(),
        })?;
        names
            .into_iter()
            .find(|name| name != ifname)
            .ok_or_else(|| TopologyError::NoSharedSibling {
                ifname: ifname.to_string(),
            })
    }

    /// Kernel driver currently bound to VF `vf` of `pf`.
    pub fn vf_driver(&self, pf: &str, vf: u32) -> Result<String> {
        let link = self.virtfn_dir(pf, vf).join("driver");
        let resolved =
            fs::canonicalize(&link).map_err(|source| TopologyError::DriverUnresolved {
                pf: pf.to_string(),
                vf,
                source,
            })?;
        match resolved.file_name() {
            Some(name) => Ok(name.to_string_lossy().into_owned()),
            None => Err(TopologyError::DriverUnresolved {
                pf: pf.to_string(),
                vf,
                source: io::Error::new(io::ErrorKind::InvalidData, "driver link has no name"),
            }),
        }
    }

    /// Whether VF `vf` of `pf` is expected to have a kernel netdev.
    ///
    /// False when the bound driver is a userspace poll-mode driver; such a
    /// VF has nothing to move, tag or address over netlink.
    pub fn has_netlink_representation(&self, pf: &str, vf: u32) -> Result<bool> {
        let driver = self.vf_driver(pf, vf)?;
        Ok(!self.registry.is_userspace(&driver))
    }

    /// Binding policy of the driver bound to VF `vf` of `pf`.
    pub fn driver_policy(&self, pf: &str, vf: u32) -> Result<(bool, &'static str)> {
        let driver = self.vf_driver(pf, vf)?;
        Ok(self.registry.resolve(&driver))
    }

    /// Netdev names exposed by VF `vf` of `pf`. Zero, one or two entries;
    /// two only on shared-VF hardware.
    pub fn link_names(&self, pf: &str, vf: u32) -> Result<Vec<String>> {
        let net_dir = self.virtfn_dir(pf, vf).join("net");
        list_dir(&net_dir).map_err(|source| TopologyError::LinkNamesUnreadable {
            pf: pf.to_string(),
            vf,
            source,
        })
    }

    /// VF index on `pf` whose netdev directory contains `ifname`, if any.
    pub fn vf_index_of_link(&self, pf: &str, ifname: &str) -> Result<Option<u32>> {
        let total = self.vf_count(pf)?;
        for vf in 0..total {
            let candidate = self.virtfn_dir(pf, vf).join("net").join(ifname);
            if candidate.exists() {
                return Ok(Some(vf));
            }
        }
        Ok(None)
    }

    /// Hardware address of the first netdev of VF `vf` on `pf`.
    pub fn hw_address(&self, pf: &str, vf: u32) -> Result<String> {
        let names = self.link_names(pf, vf)?;
        let Some(ifname) = names.first() else {
            return Err(TopologyError::NoLinks {
                pf: pf.to_string(),
                vf,
            });
        };
        let attr = self.net_root.join(ifname).join("address");
        let data =
            fs::read_to_string(&attr).map_err(|source| TopologyError::HwAddressUnreadable {
                ifname: ifname.clone(),
                source,
            })?;
        let data = data.trim();
        if data.is_empty() {
            return Err(TopologyError::HwAddressEmpty {
                ifname: ifname.clone(),
            });
        }
        Ok(data.to_string())
    }

    /// Kernel interface index of `ifname`, read from sysfs.
    pub fn ifindex(&self, ifname: &str) -> Result<u32> {
        let attr = self.net_root.join(ifname).join("ifindex");
        let data =
            fs::read_to_string(&attr).map_err(|source| TopologyError::IfindexUnreadable {
                ifname: ifname.to_string(),
                source,
            })?;
        data.trim()
            .parse()
            .map_err(|source| TopologyError::IfindexParse {
                ifname: ifname.to_string(),
                source,
            })
    }
}

fn list_dir(dir: &Path) -> io::Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Ok(names)
}
