//! Fake sysfs trees for tests.
//!
//! Builds the `/sys/class/net` + `/sys/bus/pci/devices` shape the topology
//! inspector walks, inside a tempdir, with the same symlink structure the
//! kernel exposes: class entries link into per-device directories, virtfn
//! entries link VF device dirs to the PF, physfn links back.

use crate::bind::DriverBinder;
use crate::drivers::DriverRegistry;
use crate::sysfs::Topology;
use std::cell::Cell;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct FakeHost {
    root: TempDir,
    next_ifindex: Cell<u32>,
}

impl FakeHost {
    pub fn new() -> Self {
        let root = TempDir::new().expect("tempdir");
        fs::create_dir_all(root.path().join("class/net")).expect("class/net");
        fs::create_dir_all(root.path().join("bus/pci/devices")).expect("bus/pci/devices");
        fs::create_dir_all(root.path().join("devices")).expect("devices");
        fs::create_dir_all(root.path().join("drivers")).expect("drivers");
        Self {
            root,
            next_ifindex: Cell::new(10),
        }
    }

    pub fn net_root(&self) -> PathBuf {
        self.root.path().join("class/net")
    }

    pub fn pci_root(&self) -> PathBuf {
        self.root.path().join("bus/pci/devices")
    }

    fn device_dir(&self, pci_addr: &str) -> PathBuf {
        self.root.path().join("devices").join(pci_addr)
    }

    pub fn topology(&self) -> Topology {
        self.topology_with(DriverRegistry::default())
    }

    pub fn topology_with(&self, registry: DriverRegistry) -> Topology {
        Topology::with_roots(self.net_root(), self.pci_root(), registry)
    }

    /// Driver binder over this fake tree's PCI bus.
    pub fn binder(&self) -> DriverBinder {
        DriverBinder::with_roots(
            self.root.path().join("devices"),
            self.root.path().join("drivers"),
        )
    }

    /// Register a driver the binder can bind to.
    pub fn add_driver(&self, name: &str) {
        fs::create_dir_all(self.root.path().join("drivers").join(name)).expect("driver dir");
    }

    /// Contents of a driver's bind/unbind attribute after a binder ran.
    pub fn read_driver_attr(&self, driver: &str, attr: &str) -> String {
        fs::read_to_string(self.root.path().join("drivers").join(driver).join(attr))
            .expect("driver attr")
    }

    fn alloc_ifindex(&self) -> u32 {
        let idx = self.next_ifindex.get();
        self.next_ifindex.set(idx + 1);
        idx
    }

    fn add_netdev(&self, device_dir: &Path, ifname: &str) -> u32 {
        let netdev = device_dir.join("net").join(ifname);
        fs::create_dir_all(&netdev).expect("netdev dir");
        let ifindex = self.alloc_ifindex();
        fs::write(netdev.join("ifindex"), format!("{ifindex}\n")).expect("ifindex");
        fs::write(
            netdev.join("address"),
            format!("aa:bb:cc:00:00:{ifindex:02x}\n"),
        )
        .expect("address");
        // class entry pointing into the device tree, plus the device backlink
        let class_entry = self.net_root().join(ifname);
        if !class_entry.exists() {
            symlink(&netdev, &class_entry).expect("class symlink");
        }
        let device_link = netdev.join("device");
        if fs::symlink_metadata(&device_link).is_err() {
            symlink(device_dir, &device_link).expect("device backlink");
        }
        ifindex
    }

    /// Create a PF netdev with a PCI device dir and a sriov_numvfs value.
    pub fn add_pf(&self, ifname: &str, pci_addr: &str, numvfs: u32) {
        let device_dir = self.device_dir(pci_addr);
        fs::create_dir_all(&device_dir).expect("pf device dir");
        self.add_netdev(&device_dir, ifname);
        fs::write(device_dir.join("sriov_numvfs"), format!("{numvfs}\n")).expect("numvfs");
        let pci_entry = self.pci_root().join(pci_addr);
        if fs::symlink_metadata(&pci_entry).is_err() {
            symlink(&device_dir, &pci_entry).expect("pci entry");
        }
    }

    /// Create VF `vf` of `pf_ifname` bound to `driver`, exposing `links`.
    pub fn add_vf(&self, pf_ifname: &str, vf: u32, pci_addr: &str, driver: &str, links: &[&str]) {
        let pf_device = self.pf_device_dir(pf_ifname);
        let vf_device = self.device_dir(pci_addr);
        fs::create_dir_all(&vf_device).expect("vf device dir");

        symlink(&vf_device, pf_device.join(format!("virtfn{vf}"))).expect("virtfn");
        symlink(&pf_device, vf_device.join("physfn")).expect("physfn");

        let driver_dir = self.root.path().join("drivers").join(driver);
        fs::create_dir_all(&driver_dir).expect("driver dir");
        symlink(&driver_dir, vf_device.join("driver")).expect("driver link");

        fs::create_dir_all(vf_device.join("net")).expect("vf net dir");
        for link in links {
            self.add_netdev(&vf_device, link);
        }

        let pci_entry = self.pci_root().join(pci_addr);
        if fs::symlink_metadata(&pci_entry).is_err() {
            symlink(&vf_device, &pci_entry).expect("pci entry");
        }
    }

    /// Two PF netdevs sharing one device dir (dual-port hardware).
    pub fn add_shared_pf_pair(&self, first: &str, second: &str, pci_addr: &str) {
        let device_dir = self.device_dir(pci_addr);
        fs::create_dir_all(&device_dir).expect("device dir");
        self.add_netdev(&device_dir, first);
        self.add_netdev(&device_dir, second);
        fs::write(device_dir.join("sriov_numvfs"), "0\n").expect("numvfs");
    }

    /// A virtfn entry that is a plain directory instead of a symlink.
    pub fn add_plain_virtfn_dir(&self, pf_ifname: &str, vf: u32) {
        let pf_device = self.pf_device_dir(pf_ifname);
        fs::create_dir_all(pf_device.join(format!("virtfn{vf}"))).expect("plain virtfn");
    }

    pub fn write_numvfs(&self, pf_ifname: &str, contents: &str) {
        let attr = self.net_root().join(pf_ifname).join("device/sriov_numvfs");
        fs::write(attr, contents).expect("write numvfs");
    }

    pub fn write_address(&self, ifname: &str, contents: &str) {
        let attr = self.net_root().join(ifname).join("address");
        fs::write(attr, contents).expect("write address");
    }

    pub fn write_ifindex(&self, ifname: &str, ifindex: u32) {
        let attr = self.net_root().join(ifname).join("ifindex");
        fs::write(attr, format!("{ifindex}\n")).expect("write ifindex");
    }

    /// Drop a VF netdev entry, as happens after a move into a sandbox
    /// namespace.
    pub fn remove_link(&self, pf_ifname: &str, vf: u32, ifname: &str) {
        let pf_device = self.pf_device_dir(pf_ifname);
        let vf_device = fs::read_link(pf_device.join(format!("virtfn{vf}"))).expect("virtfn");
        fs::remove_dir_all(vf_device.join("net").join(ifname)).expect("remove vf netdev");
        let class_entry = self.net_root().join(ifname);
        if fs::symlink_metadata(&class_entry).is_ok() {
            fs::remove_file(class_entry).expect("remove class entry");
        }
    }

    fn pf_device_dir(&self, pf_ifname: &str) -> PathBuf {
        let device_link = self.net_root().join(pf_ifname).join("device");
        fs::canonicalize(device_link).expect("pf device dir")
    }
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}
