//! Setup/release orchestration for VF attachments.
//!
//! Setup resolves a VF, branches on the driver mode and walks the
//! attachment through driver binding or VLAN + namespace placement; every
//! completed step pushes its inverse onto a rollback stack, and any failure
//! unwinds exactly the steps that ran. Release mirrors setup in reverse and
//! tolerates state that is already gone.

use crate::alloc::{self, AllocError};
use crate::bind::{BindError, DriverBinder};
use crate::config::{DeviceConfig, MAX_SHARED_VF, NetConf, VfDevice};
use crate::link::{self, LinkClient, LinkError, LinkRef, sort_by_ifindex};
use crate::netns::{NetNs, NetnsError};
use crate::record::{RecordError, RecordStore};
use crate::rollback::{RollbackStack, RollbackStep};
use crate::sysfs::{Topology, TopologyError};
use crate::vlan::{self, VlanError};
use std::os::fd::AsRawFd;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("l2enable must be set to use the shared net interfaces of {master}")]
    SharedVfNeedsL2 { master: String },

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Vlan(#[from] VlanError),

    #[error(transparent)]
    Netns(#[from] NetnsError),

    #[error(transparent)]
    Record(#[from] RecordError),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Pod-visible name for slave `i` of a request of `total` slaves.
fn slave_ifname(pod_ifname: &str, i: usize, total: usize) -> String {
    if total > 1 {
        format!("{pod_ifname}-{i}")
    } else {
        pod_ifname.to_string()
    }
}

/// Sequences the topology inspector, driver binder, namespace engine and
/// VLAN configurator for one invocation.
pub struct Orchestrator<S> {
    topology: Topology,
    binder: DriverBinder,
    store: S,
}

impl<S: RecordStore> Orchestrator<S> {
    pub fn new(topology: Topology, binder: DriverBinder, store: S) -> Self {
        Self {
            topology,
            binder,
            store,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Attach the request to the sandbox behind `netns`.
    ///
    /// A bonded request produces one attachment per slave, suffixed
    /// `-<index>` when there is more than one, and synchronizes every
    /// slave's hardware address to slave 0's pre-setup address afterwards.
    ///
    /// Returns the resolved slaves so the caller can decide whether address
    /// management applies to the attachment.
    pub async fn setup(
        &self,
        conf: &NetConf,
        pod_ifname: &str,
        container_id: &str,
        netns: &NetNs,
    ) -> Result<Vec<DeviceConfig>> {
        // cross-field policy, checked before any device mutation
        if conf.shared_vf && !conf.l2_mode {
            return Err(LifecycleError::SharedVfNeedsL2 {
                master: conf.masters().join(","),
            });
        }

        let slaves = self.resolve_slaves(conf)?;
        let bond_mac = if slaves.len() > 1 {
            Some(
                self.topology
                    .hw_address(&slaves[0].device.pf_name, slaves[0].device.vf)?,
            )
        } else {
            None
        };

        let mut stack = RollbackStack::new();
        match self
            .setup_all(
                &slaves,
                bond_mac.as_deref(),
                pod_ifname,
                container_id,
                netns,
                &mut stack,
            )
            .await
        {
            Ok(()) => Ok(slaves),
            Err(primary) => {
                self.rollback(stack, netns).await;
                Err(primary)
            }
        }
    }

    /// Detach the request from the sandbox behind `netns`.
    ///
    /// The caller maps a namespace that no longer exists to immediate
    /// success before getting here; a pod-visible interface that is already
    /// absent is treated the same way.
    pub async fn release(
        &self,
        conf: &NetConf,
        pod_ifname: &str,
        container_id: &str,
        netns: &NetNs,
    ) -> Result<()> {
        let masters = conf.masters();
        for (i, master) in masters.iter().enumerate() {
            let ifname = slave_ifname(pod_ifname, i, masters.len());
            self.release_one(conf, master, &ifname, container_id, netns)
                .await?;
        }
        Ok(())
    }

    fn resolve_slaves(&self, conf: &NetConf) -> Result<Vec<DeviceConfig>> {
        let masters = conf.masters();
        let single = masters.len() == 1;
        let mut slaves = Vec::with_capacity(masters.len());
        for master in &masters {
            let device = if single && let Some(device) = &conf.device_info {
                device.clone()
            } else if single && let Some(pci_addr) = &conf.device_id {
                let pf_name = self.topology.pf_name(pci_addr)?;
                let vf = self.topology.vf_index(pci_addr, &pf_name)?;
                VfDevice {
                    pci_addr: pci_addr.clone(),
                    pf_name,
                    vf,
                }
            } else {
                alloc::assign_free_vf(&self.topology, master)?
            };
            slaves.push(DeviceConfig {
                master: master.clone(),
                device,
                vlan: conf.vlan,
                l2_mode: conf.l2_mode,
                shared_vf: conf.shared_vf,
                dpdk: conf.dpdk.clone(),
            });
        }
        Ok(slaves)
    }

    async fn setup_all(
        &self,
        slaves: &[DeviceConfig],
        bond_mac: Option<&str>,
        pod_ifname: &str,
        container_id: &str,
        netns: &NetNs,
        stack: &mut RollbackStack,
    ) -> Result<()> {
        for (i, slave) in slaves.iter().enumerate() {
            let ifname = slave_ifname(pod_ifname, i, slaves.len());
            self.setup_one(slave, &ifname, container_id, netns, stack)
                .await?;
        }

        if let Some(mac) = bond_mac {
            // every bonded member presents slave 0's address to the link
            // partner; driven through the PF, so namespace placement does
            // not matter here
            for slave in &slaves[1..] {
                link::set_vf_mac(&slave.master, slave.device.vf, mac).await?;
            }
            info!(mac, slaves = slaves.len(), "bonded slaves synchronized");
        }
        Ok(())
    }

    async fn setup_one(
        &self,
        conf: &DeviceConfig,
        ifname: &str,
        container_id: &str,
        netns: &NetNs,
        stack: &mut RollbackStack,
    ) -> Result<()> {
        let pf = &conf.device.pf_name;
        let vf = conf.device.vf;
        info!(
            master = %conf.master,
            pf = %pf,
            vf,
            pci_addr = %conf.device.pci_addr,
            ifname,
            dpdk = conf.dpdk_mode(),
            l2 = conf.l2_mode,
            vlan = conf.vlan,
            "setting up vf attachment"
        );

        if let Some(dpdk) = &conf.dpdk {
            let (userspace_bind, canonical) =
                self.topology.driver_policy(pf, vf).unwrap_or((true, ""));
            if userspace_bind {
                self.binder.bind_userspace(
                    &self.store,
                    &conf.device.pci_addr,
                    &dpdk.dpdk_driver,
                    dpdk.kernel_driver.as_deref(),
                    container_id,
                    ifname,
                    vf,
                )?;
                stack.push(RollbackStep::RebindKernel {
                    container_id: container_id.to_string(),
                    ifname: ifname.to_string(),
                });
                return Ok(());
            }
            // bifurcated drivers keep the kernel netdev; fall through to
            // the kernel path with the dpdk section ignored
            info!(pf = %pf, vf, driver = canonical, "driver needs no userspace bind");
        }

        if !self.topology.has_netlink_representation(pf, vf)? {
            debug!(pf = %pf, vf, "vf has no kernel netdev; nothing to place");
            return Ok(());
        }
        let names = self.topology.link_names(pf, vf)?;
        if names.is_empty() {
            debug!(pf = %pf, vf, "vf exposes no netdev yet");
            return Ok(());
        }

        if conf.vlan != 0 {
            vlan::set_vlan(&self.topology, &conf.master, vf, conf.vlan, conf.shared_vf).await?;
            stack.push(RollbackStep::ResetVlan {
                pf: conf.master.clone(),
                vf,
                shared: conf.shared_vf,
            });
        }

        let mut links = Vec::with_capacity(names.len());
        for name in names {
            links.push(LinkRef {
                ifindex: self.topology.ifindex(&name)?,
                name,
            });
        }
        sort_by_ifindex(&mut links);

        let root_client = LinkClient::new()?;
        let mut moved = Vec::with_capacity(links.len());
        for link_ref in &links {
            let transient = self.move_in(&root_client, &link_ref.name, netns).await?;
            stack.push(RollbackStep::ReturnLink {
                names: vec![transient.clone()],
            });
            moved.push(transient);
        }

        // the connection below is opened while the guard holds the thread
        // inside the sandbox namespace, and keeps operating there afterwards
        let ns_client = {
            let _guard = netns.enter()?;
            LinkClient::new()?
        };
        for (i, transient) in moved.iter().enumerate() {
            let final_name = if moved.len() == MAX_SHARED_VF && i == moved.len() - 1 {
                format!("{ifname}d{i}")
            } else {
                ifname.to_string()
            };
            let index = ns_client.index_of(transient).await?;
            ns_client.rename(index, transient, &final_name).await?;
            stack.link_renamed(transient, &final_name);
            if conf.l2_mode {
                ns_client.set_up(index, &final_name).await?;
            }
        }
        Ok(())
    }

    /// Down, rename to the transient `dev<ifindex>` name, up, move into the
    /// sandbox namespace. Returns the transient name for the rename inside.
    async fn move_in(&self, client: &LinkClient, name: &str, netns: &NetNs) -> Result<String> {
        let index = client.index_of(name).await?;
        client.set_down(index, name).await?;
        // the kernel-assigned index is unique on the host right now, so the
        // transient name cannot collide inside the destination namespace
        let transient = format!("dev{index}");
        client.rename(index, name, &transient).await?;
        client.set_up(index, &transient).await?;
        client
            .move_to_ns(index, &transient, netns.fd().as_raw_fd())
            .await?;
        Ok(transient)
    }

    async fn release_one(
        &self,
        conf: &NetConf,
        master: &str,
        ifname: &str,
        container_id: &str,
        netns: &NetNs,
    ) -> Result<()> {
        info!(
            master,
            ifname,
            container_id,
            dpdk = conf.dpdk_mode(),
            "releasing vf attachment"
        );

        if conf.dpdk_mode() {
            let record = self
                .binder
                .unbind_userspace(&self.store, container_id, ifname)
                .await?;
            // the function accepts VF writes again once the settle delay
            // inside the unbind has passed
            link::set_vf_vlan(master, record.vf, 0).await?;
            return Ok(());
        }

        if let Some(device) = &conf.device_info
            && !self
                .topology
                .has_netlink_representation(&device.pf_name, device.vf)?
        {
            debug!(master, "vf has no kernel netdev; nothing to release");
            return Ok(());
        }

        let root = NetNs::current()?;
        let ns_client = {
            let _guard = netns.enter()?;
            LinkClient::new()?
        };

        // Shared topology is inferred from the d1-suffixed sibling. Fragile
        // if the suffix scheme ever changes, but no persisted flag exists.
        let mut shared = false;
        if conf.l2_mode {
            shared = ns_client.exists(&format!("{ifname}d1")).await?;
        }

        let mut target = ifname.to_string();
        let mut pf = master.to_string();
        for round in 0..MAX_SHARED_VF {
            if round == 1 {
                if !shared {
                    break;
                }
                target = format!("{ifname}d1");
                pf = self.topology.shared_pf(master)?;
            }

            let index = match ns_client.index_of(&target).await {
                Ok(index) => index,
                Err(LinkError::NotFound { .. }) if round == 0 => {
                    info!(ifname = %target, "interface already absent; release is a no-op");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            let transient = format!("dev{index}");
            ns_client.set_down(index, &target).await?;
            ns_client.rename(index, &target, &transient).await?;
            ns_client
                .move_to_ns(index, &transient, root.fd().as_raw_fd())
                .await?;

            if conf.vlan != 0 {
                vlan::reset_vlan(&self.topology, &pf, &transient).await?;
            }
        }
        Ok(())
    }

    /// Undo completed steps, most recent first. Failures here are reported
    /// but never replace the primary error the caller is propagating.
    async fn rollback(&self, stack: RollbackStack, netns: &NetNs) {
        if stack.is_empty() {
            return;
        }
        warn!(steps = stack.len(), "setup failed; rolling back completed steps");
        let root = match NetNs::current() {
            Ok(root) => root,
            Err(e) => {
                warn!(error = %e, "rollback cannot open the root namespace");
                return;
            }
        };
        for step in stack.unwind() {
            let result: Result<()> = match &step {
                RollbackStep::ReturnLink { names } => self.return_link(names, netns, &root).await,
                RollbackStep::ResetVlan { pf, vf, shared } => {
                    vlan::set_vlan(&self.topology, pf, *vf, 0, *shared)
                        .await
                        .map_err(Into::into)
                }
                RollbackStep::RebindKernel {
                    container_id,
                    ifname,
                } => self
                    .binder
                    .unbind_userspace(&self.store, container_id, ifname)
                    .await
                    .map(|_| ())
                    .map_err(Into::into),
            };
            if let Err(e) = result {
                warn!(?step, error = %e, "rollback step failed");
            }
        }
    }

    /// Bring a link back from the sandbox namespace to the root namespace,
    /// trying the candidate names newest first.
    async fn return_link(&self, names: &[String], netns: &NetNs, root: &NetNs) -> Result<()> {
        let ns_client = {
            let _guard = netns.enter()?;
            LinkClient::new()?
        };
        for name in names {
            if !ns_client.exists(name).await? {
                continue;
            }
            let index = ns_client.index_of(name).await?;
            ns_client.set_down(index, name).await?;
            let transient = format!("dev{index}");
            if name != &transient {
                ns_client.rename(index, name, &transient).await?;
            }
            ns_client
                .move_to_ns(index, &transient, root.fd().as_raw_fd())
                .await?;
            return Ok(());
        }
        debug!(?names, "link not present in sandbox namespace; nothing to return");
        Ok(())
    }
}
