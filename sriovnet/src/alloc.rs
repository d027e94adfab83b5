//! Free-VF selection.
//!
//! A VF whose netdev is still visible in the host namespace has not been
//! handed to any sandbox; the allocator picks the first such index. VFs
//! already moved away (or rebound to a userspace driver) expose no netdev
//! and are skipped.

use crate::config::VfDevice;
use crate::sysfs::{Topology, TopologyError};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("no free VF available on {pf}")]
    NoFreeVf { pf: String },

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

pub type Result<T> = std::result::Result<T, AllocError>;

/// Pick the first unassigned VF of `pf`.
pub fn assign_free_vf(topology: &Topology, pf: &str) -> Result<VfDevice> {
    let total = topology.vf_count(pf)?;
    for vf in 0..total {
        let names = match topology.link_names(pf, vf) {
            Ok(names) => names,
            Err(_) => continue,
        };
        if names.is_empty() {
            continue;
        }
        let pci_addr = topology.pci_address(pf, vf)?;
        debug!(pf, vf, %pci_addr, "assigned free vf");
        return Ok(VfDevice {
            pci_addr,
            pf_name: pf.to_string(),
            vf,
        });
    }
    Err(AllocError::NoFreeVf { pf: pf.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeHost;

    #[test]
    fn picks_first_vf_with_a_netdev() {
        let host = FakeHost::new();
        host.add_pf("eth0", "0000:03:00.0", 3);
        host.add_vf("eth0", 0, "0000:03:10.0", "i40evf", &[]);
        host.add_vf("eth0", 1, "0000:03:10.1", "i40evf", &["eth0v1"]);
        host.add_vf("eth0", 2, "0000:03:10.2", "i40evf", &["eth0v2"]);

        let device = assign_free_vf(&host.topology(), "eth0").unwrap();
        assert_eq!(device.vf, 1);
        assert_eq!(device.pci_addr, "0000:03:10.1");
        assert_eq!(device.pf_name, "eth0");
    }

    #[test]
    fn all_vfs_taken() {
        let host = FakeHost::new();
        host.add_pf("eth0", "0000:03:00.0", 2);
        host.add_vf("eth0", 0, "0000:03:10.0", "vfio-pci", &[]);
        host.add_vf("eth0", 1, "0000:03:10.1", "i40evf", &["eth0v1"]);
        host.remove_link("eth0", 1, "eth0v1");

        let err = assign_free_vf(&host.topology(), "eth0").unwrap_err();
        assert!(matches!(err, AllocError::NoFreeVf { .. }));
    }

    #[test]
    fn zero_vfs_is_no_free_vf() {
        let host = FakeHost::new();
        host.add_pf("eth0", "0000:03:00.0", 0);
        let err = assign_free_vf(&host.topology(), "eth0").unwrap_err();
        assert!(matches!(err, AllocError::NoFreeVf { .. }));
    }
}
