//! Netlink link operations and the PF control path.
//!
//! A [`LinkClient`] wraps one rtnetlink connection. The namespace a client
//! operates in is fixed when it is created: a netlink socket keeps the
//! network namespace of the thread that opened it, so a client created
//! while a [`crate::netns::NetnsGuard`] is held keeps acting on that
//! namespace after the guard is dropped.
//!
//! Per-VF attributes (VLAN tag, administrative MAC) are driven through the
//! PF with the iproute2 tool, the same control path the kernel exposes for
//! VFs that have no netdev of their own.

use futures::TryStreamExt;
use nix::libc;
use std::io;
use std::os::fd::RawFd;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to open a netlink connection: {0}")]
    Connection(io::Error),

    #[error("device {ifname} not found")]
    NotFound { ifname: String },

    #[error("failed to look up device {ifname}: {source}")]
    Lookup {
        ifname: String,
        source: rtnetlink::Error,
    },

    #[error("failed to bring {ifname} down: {source}")]
    Down {
        ifname: String,
        source: rtnetlink::Error,
    },

    #[error("failed to bring {ifname} up: {source}")]
    Up {
        ifname: String,
        source: rtnetlink::Error,
    },

    #[error("failed to rename {ifname} to {new_name}: {source}")]
    Rename {
        ifname: String,
        new_name: String,
        source: rtnetlink::Error,
    },

    #[error("failed to move {ifname} to another network namespace: {source}")]
    NamespaceMove {
        ifname: String,
        source: rtnetlink::Error,
    },

    #[error("failed to add address {addr} to {ifname}: {source}")]
    AddressAdd {
        ifname: String,
        addr: String,
        source: rtnetlink::Error,
    },

    #[error("failed to add a default route via {gateway}: {source}")]
    RouteAdd {
        gateway: String,
        source: rtnetlink::Error,
    },

    #[error("failed to run `ip {args}`: {source}")]
    IpSpawn { args: String, source: io::Error },

    #[error("`ip {args}` failed: {stderr}")]
    IpCommand { args: String, stderr: String },
}

pub type Result<T> = std::result::Result<T, LinkError>;

/// A link name together with its kernel interface index.
///
/// The index is assigned by the kernel and stable for the lifetime of the
/// device, which makes it the ordering key for multi-netdev VFs and the
/// disambiguator in transient `dev<ifindex>` names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRef {
    pub name: String,
    pub ifindex: u32,
}

impl LinkRef {
    /// Transient name the link carries while migrating between namespaces.
    pub fn transient_name(&self) -> String {
        format!("dev{}", self.ifindex)
    }
}

/// Order links by kernel interface index, ascending.
pub fn sort_by_ifindex(links: &mut [LinkRef]) {
    links.sort_by_key(|link| link.ifindex);
}

/// Link operations over one rtnetlink connection.
pub struct LinkClient {
    handle: rtnetlink::Handle,
}

impl LinkClient {
    /// Open a connection in the calling thread's current namespace.
    pub fn new() -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection().map_err(LinkError::Connection)?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    /// Kernel interface index of `ifname`.
    pub async fn index_of(&self, ifname: &str) -> Result<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(ifname.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(link.header.index),
            Ok(None) => Err(LinkError::NotFound {
                ifname: ifname.to_string(),
            }),
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::ENODEV => {
                Err(LinkError::NotFound {
                    ifname: ifname.to_string(),
                })
            }
            Err(source) => Err(LinkError::Lookup {
                ifname: ifname.to_string(),
                source,
            }),
        }
    }

    /// Whether `ifname` exists in this client's namespace.
    pub async fn exists(&self, ifname: &str) -> Result<bool> {
        match self.index_of(ifname).await {
            Ok(_) => Ok(true),
            Err(LinkError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn set_down(&self, index: u32, ifname: &str) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .down()
            .execute()
            .await
            .map_err(|source| LinkError::Down {
                ifname: ifname.to_string(),
                source,
            })?;
        debug!(ifname, index, "link down");
        Ok(())
    }

    pub async fn set_up(&self, index: u32, ifname: &str) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|source| LinkError::Up {
                ifname: ifname.to_string(),
                source,
            })?;
        debug!(ifname, index, "link up");
        Ok(())
    }

    pub async fn rename(&self, index: u32, ifname: &str, new_name: &str) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .name(new_name.to_string())
            .execute()
            .await
            .map_err(|source| LinkError::Rename {
                ifname: ifname.to_string(),
                new_name: new_name.to_string(),
                source,
            })?;
        debug!(ifname, new_name, index, "link renamed");
        Ok(())
    }

    /// Add an address to the link.
    pub async fn add_address(
        &self,
        index: u32,
        ifname: &str,
        addr: std::net::IpAddr,
        prefix_len: u8,
    ) -> Result<()> {
        self.handle
            .address()
            .add(index, addr, prefix_len)
            .execute()
            .await
            .map_err(|source| LinkError::AddressAdd {
                ifname: ifname.to_string(),
                addr: format!("{addr}/{prefix_len}"),
                source,
            })?;
        debug!(ifname, %addr, prefix_len, "address added");
        Ok(())
    }

    /// Install a default IPv4 route via `gateway`.
    pub async fn add_default_route_v4(&self, gateway: std::net::Ipv4Addr) -> Result<()> {
        match self
            .handle
            .route()
            .add()
            .v4()
            .gateway(gateway)
            .execute()
            .await
        {
            Ok(()) => Ok(()),
            // route already present, nothing to do
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => Ok(()),
            Err(source) => Err(LinkError::RouteAdd {
                gateway: gateway.to_string(),
                source,
            }),
        }
    }

    /// Move the link into the namespace behind `ns_fd`.
    pub async fn move_to_ns(&self, index: u32, ifname: &str, ns_fd: RawFd) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .setns_by_fd(ns_fd)
            .execute()
            .await
            .map_err(|source| LinkError::NamespaceMove {
                ifname: ifname.to_string(),
                source,
            })?;
        info!(ifname, index, "link moved to target namespace");
        Ok(())
    }
}

async fn exec_ip(args: &[&str]) -> Result<()> {
    let joined = args.join(" ");
    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(|source| LinkError::IpSpawn {
            args: joined.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(LinkError::IpCommand {
            args: joined,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Set the 802.1Q tag of VF `vf` through the PF `pf`. Zero clears the tag.
pub async fn set_vf_vlan(pf: &str, vf: u32, vlan: u16) -> Result<()> {
    let vf_arg = vf.to_string();
    let vlan_arg = vlan.to_string();
    exec_ip(&["link", "set", "dev", pf, "vf", &vf_arg, "vlan", &vlan_arg]).await?;
    info!(pf, vf, vlan, "vf vlan set");
    Ok(())
}

/// Set the administrative MAC of VF `vf` through the PF `pf`.
pub async fn set_vf_mac(pf: &str, vf: u32, mac: &str) -> Result<()> {
    let vf_arg = vf.to_string();
    exec_ip(&["link", "set", "dev", pf, "vf", &vf_arg, "mac", mac]).await?;
    info!(pf, vf, mac, "vf mac set");
    Ok(())
}
