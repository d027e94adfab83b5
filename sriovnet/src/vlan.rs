//! VLAN tagging for VFs, including shared-VF mirroring.
//!
//! On dual-netdev hardware the two sibling PFs expose the same VF and must
//! carry identical VLAN configuration; mirroring to the sibling is part of
//! the operation, not best effort.

use crate::link;
use crate::sysfs::{Topology, TopologyError};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum VlanError {
    #[error("failed to resolve the shared sibling of {pf}: {source}")]
    SharedSibling { pf: String, source: TopologyError },

    #[error("{pf} reports no virtual functions")]
    ZeroVfs { pf: String },

    #[error("no VF of {pf} carries the netdev {ifname}")]
    VfIndexNotFound { pf: String, ifname: String },

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Link(#[from] link::LinkError),
}

pub type Result<T> = std::result::Result<T, VlanError>;

/// Set the 802.1Q tag of VF `vf` on `pf`, mirrored to the shared sibling
/// when `shared` is set.
///
/// The sibling is resolved before anything is written so that a broken
/// shared topology fails without having touched the primary PF.
pub async fn set_vlan(
    topology: &Topology,
    pf: &str,
    vf: u32,
    vlan: u16,
    shared: bool,
) -> Result<()> {
    let sibling = if shared {
        Some(
            topology
                .shared_pf(pf)
                .map_err(|source| VlanError::SharedSibling {
                    pf: pf.to_string(),
                    source,
                })?,
        )
    } else {
        None
    };

    link::set_vf_vlan(pf, vf, vlan).await?;
    if let Some(sibling) = sibling {
        link::set_vf_vlan(&sibling, vf, vlan).await?;
    }
    Ok(())
}

/// Clear the VLAN tag of the VF that carries `transient_ifname`.
///
/// At release time only the transient `dev<ifindex>` name is known; the VF
/// index is re-derived by scanning the PF's VF netdev directories for it.
pub async fn reset_vlan(topology: &Topology, pf: &str, transient_ifname: &str) -> Result<()> {
    let total = topology.vf_count(pf)?;
    if total == 0 {
        return Err(VlanError::ZeroVfs { pf: pf.to_string() });
    }

    let vf = topology
        .vf_index_of_link(pf, transient_ifname)?
        .ok_or_else(|| VlanError::VfIndexNotFound {
            pf: pf.to_string(),
            ifname: transient_ifname.to_string(),
        })?;

    debug!(pf, vf, ifname = transient_ifname, "resetting vf vlan");
    link::set_vf_vlan(pf, vf, 0).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeHost;

    #[tokio::test]
    async fn shared_set_fails_before_mutation_without_sibling() {
        let host = FakeHost::new();
        host.add_pf("eth0", "0000:03:00.0", 1);
        host.add_vf("eth0", 0, "0000:03:10.0", "i40evf", &["eth0v0"]);
        let topology = host.topology();
        let err = set_vlan(&topology, "eth0", 0, 100, true).await.unwrap_err();
        assert!(matches!(err, VlanError::SharedSibling { .. }));
    }

    #[tokio::test]
    async fn reset_with_zero_vfs() {
        let host = FakeHost::new();
        host.add_pf("eth0", "0000:03:00.0", 0);
        let topology = host.topology();
        let err = reset_vlan(&topology, "eth0", "dev42").await.unwrap_err();
        assert!(matches!(err, VlanError::ZeroVfs { .. }));
    }

    #[tokio::test]
    async fn reset_with_unknown_transient_name() {
        let host = FakeHost::new();
        host.add_pf("eth0", "0000:03:00.0", 2);
        host.add_vf("eth0", 0, "0000:03:10.0", "i40evf", &["eth0v0"]);
        host.add_vf("eth0", 1, "0000:03:10.1", "i40evf", &["eth0v1"]);
        let topology = host.topology();
        let err = reset_vlan(&topology, "eth0", "dev42").await.unwrap_err();
        assert!(matches!(err, VlanError::VfIndexNotFound { .. }));
    }
}
