//! Attachment configuration.
//!
//! [`NetConf`] is the operator-supplied payload decoded from the invocation
//! stdin; [`DeviceConfig`] is the fully resolved request for one logical
//! attachment after VF selection. A bonded request is an ordered list of
//! device configs, one per slave.

use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Records for userspace-driver bindings land here unless overridden.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/cni/sriov";

/// Highest valid 802.1Q VLAN id.
const MAX_VLAN_ID: u16 = 4094;

/// Netdevs a shared VF exposes at most; the second one carries the `d1`
/// name suffix inside the sandbox.
pub const MAX_SHARED_VF: usize = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse network configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("a \"master\" interface (or a \"bond\" list) is required")]
    MasterRequired,

    #[error("vlan id {0} is out of range")]
    VlanOutOfRange(u16),

    #[error("invalid key=value pair {0:?} in invocation args")]
    BadArgsPair(String),

    #[error("pod name not found in invocation args")]
    PodNameMissing,

    #[error("pod name {0:?} carries no numeric ordinal suffix")]
    BadPodOrdinal(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Userspace-driver binding parameters from the "dpdk" section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DpdkConf {
    /// Driver to restore at release when the live one cannot be captured.
    #[serde(default)]
    pub kernel_driver: Option<String>,
    pub dpdk_driver: String,
}

/// A selected VF: PCI address plus its place in the PF's VF table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VfDevice {
    #[serde(rename = "pci_addr")]
    pub pci_addr: String,
    #[serde(rename = "pfname")]
    pub pf_name: String,
    #[serde(rename = "vfid")]
    pub vf: u32,
}

/// Raw network configuration as decoded from stdin.
#[derive(Debug, Clone, Deserialize)]
pub struct NetConf {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: Option<String>,
    pub name: Option<String>,

    /// Master PF for a single attachment.
    #[serde(default, alias = "if0")]
    pub master: Option<String>,

    /// Master PFs for a bonded attachment, one slave per entry.
    #[serde(default)]
    pub bond: Option<Vec<String>>,

    #[serde(default)]
    pub vlan: u16,

    /// Per-pod VLAN table indexed by the pod name ordinal.
    #[serde(default)]
    pub vlans: Option<Vec<u16>>,

    #[serde(default, rename = "l2enable")]
    pub l2_mode: bool,

    #[serde(default, rename = "sharedvf")]
    pub shared_vf: bool,

    #[serde(default)]
    pub dpdk: Option<DpdkConf>,

    /// Pre-selected device; skips free-VF allocation when present.
    #[serde(default, rename = "deviceinfo")]
    pub device_info: Option<VfDevice>,

    /// Pre-selected device by PCI address only; PF and VF index are
    /// resolved from the topology.
    #[serde(default, rename = "deviceID")]
    pub device_id: Option<String>,

    #[serde(default, rename = "cniDir")]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub ipam: Option<IpamConf>,

    #[serde(default)]
    pub dns: Option<serde_json::Value>,
}

/// Only the delegate type is interesting here; the delegate itself gets the
/// full original payload.
#[derive(Debug, Clone, Deserialize)]
pub struct IpamConf {
    #[serde(rename = "type")]
    pub plugin: String,
}

impl NetConf {
    /// Decode and validate an invocation payload.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let conf: NetConf = serde_json::from_slice(data)?;
        if conf.master.is_none() && conf.bond.as_ref().is_none_or(|b| b.is_empty()) {
            return Err(ConfigError::MasterRequired);
        }
        if conf.vlan > MAX_VLAN_ID {
            return Err(ConfigError::VlanOutOfRange(conf.vlan));
        }
        if let Some(vlans) = &conf.vlans
            && let Some(&bad) = vlans.iter().find(|&&v| v > MAX_VLAN_ID)
        {
            return Err(ConfigError::VlanOutOfRange(bad));
        }
        Ok(conf)
    }

    /// Master PFs, one per slave. A plain attachment is a bond of one.
    pub fn masters(&self) -> Vec<String> {
        match (&self.bond, &self.master) {
            (Some(bond), _) if !bond.is_empty() => bond.clone(),
            (_, Some(master)) => vec![master.clone()],
            _ => Vec::new(),
        }
    }

    pub fn dpdk_mode(&self) -> bool {
        self.dpdk.is_some()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }

    /// VLAN id for the pod at `ordinal`, falling back to the scalar `vlan`
    /// when no per-pod table applies.
    pub fn vlan_for(&self, ordinal: Option<usize>) -> u16 {
        if let (Some(vlans), Some(ordinal)) = (&self.vlans, ordinal)
            && let Some(&vlan) = vlans.get(ordinal)
        {
            return vlan;
        }
        self.vlan
    }
}

/// Fully resolved request for one logical attachment.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub master: String,
    pub device: VfDevice,
    pub vlan: u16,
    pub l2_mode: bool,
    pub shared_vf: bool,
    pub dpdk: Option<DpdkConf>,
}

impl DeviceConfig {
    pub fn dpdk_mode(&self) -> bool {
        self.dpdk.is_some()
    }
}

/// Extract the pod name and its trailing `-<n>` ordinal from the
/// semicolon-separated `KEY=value` invocation args.
pub fn pod_ordinal(args: &str) -> Result<(String, usize)> {
    let mut pod_name = None;
    for pair in args.split(';').filter(|p| !p.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(ConfigError::BadArgsPair(pair.to_string()));
        };
        if key == "K8S_POD_NAME" {
            pod_name = Some(value.to_string());
            break;
        }
    }
    let pod_name = pod_name.ok_or(ConfigError::PodNameMissing)?;
    let ordinal = pod_name
        .rsplit('-')
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ConfigError::BadPodOrdinal(pod_name.clone()))?;
    Ok((pod_name, ordinal))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_conf() {
        let conf = NetConf::parse(br#"{"name": "sriov", "master": "eth0"}"#).unwrap();
        assert_eq!(conf.masters(), vec!["eth0".to_string()]);
        assert_eq!(conf.vlan, 0);
        assert!(!conf.dpdk_mode());
        assert!(!conf.l2_mode);
        assert_eq!(conf.data_dir(), PathBuf::from(DEFAULT_DATA_DIR));
    }

    #[test]
    fn parse_full_conf() {
        let conf = NetConf::parse(
            br#"{
                "name": "sriov-dpdk",
                "master": "enp59s0",
                "vlan": 1000,
                "l2enable": true,
                "sharedvf": true,
                "cniDir": "/run/sriov",
                "dpdk": {"kernel_driver": "i40evf", "dpdk_driver": "vfio-pci"},
                "deviceinfo": {"pci_addr": "0000:3b:02.0", "pfname": "enp59s0", "vfid": 4}
            }"#,
        )
        .unwrap();
        assert!(conf.dpdk_mode());
        assert!(conf.l2_mode);
        assert!(conf.shared_vf);
        assert_eq!(conf.data_dir(), PathBuf::from("/run/sriov"));
        let device = conf.device_info.unwrap();
        assert_eq!(device.vf, 4);
        assert_eq!(device.pf_name, "enp59s0");
    }

    #[test]
    fn master_is_required() {
        let err = NetConf::parse(br#"{"name": "sriov"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::MasterRequired));
    }

    #[test]
    fn bond_lists_every_slave() {
        let conf =
            NetConf::parse(br#"{"name": "bonded", "bond": ["eth0", "eth1", "eth2"]}"#).unwrap();
        assert_eq!(conf.masters().len(), 3);
    }

    #[test]
    fn vlan_range_is_checked() {
        let err = NetConf::parse(br#"{"master": "eth0", "vlan": 4095}"#).unwrap_err();
        assert!(matches!(err, ConfigError::VlanOutOfRange(4095)));
        let err = NetConf::parse(br#"{"master": "eth0", "vlans": [10, 9000]}"#).unwrap_err();
        assert!(matches!(err, ConfigError::VlanOutOfRange(9000)));
    }

    #[test]
    fn vlan_table_selection() {
        let conf =
            NetConf::parse(br#"{"master": "eth0", "vlan": 7, "vlans": [100, 200, 300]}"#).unwrap();
        assert_eq!(conf.vlan_for(Some(1)), 200);
        // out-of-range ordinal falls back to the scalar
        assert_eq!(conf.vlan_for(Some(9)), 7);
        assert_eq!(conf.vlan_for(None), 7);
    }

    #[test]
    fn pod_ordinal_from_args() {
        let (pod, ordinal) =
            pod_ordinal("IgnoreUnknown=1;K8S_POD_NAMESPACE=default;K8S_POD_NAME=web-2").unwrap();
        assert_eq!(pod, "web-2");
        assert_eq!(ordinal, 2);
    }

    #[test]
    fn pod_ordinal_requires_numeric_suffix() {
        let err = pod_ordinal("K8S_POD_NAME=web-main").unwrap_err();
        assert!(matches!(err, ConfigError::BadPodOrdinal(_)));
    }

    #[test]
    fn pod_ordinal_rejects_malformed_pairs() {
        let err = pod_ordinal("K8S_POD_NAME").unwrap_err();
        assert!(matches!(err, ConfigError::BadArgsPair(_)));
        let err = pod_ordinal("FOO=bar").unwrap_err();
        assert!(matches!(err, ConfigError::PodNameMissing));
    }
}
