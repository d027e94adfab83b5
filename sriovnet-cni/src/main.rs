//! CNI command front end for sriovnet.
//!
//! Decodes the invocation environment and the stdin payload, dispatches
//! ADD/DEL to the orchestrator and reports a result or error object on
//! stdout. Logs go to stderr so stdout stays a clean protocol channel.

mod ipam;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::json;
use sriovnet::link::LinkClient;
use sriovnet::netns::NetnsError;
use sriovnet::{
    DriverBinder, DriverRegistry, FileRecordStore, NetConf, NetNs, Orchestrator, Topology, config,
};
use std::env;
use std::io::Read;
use std::net::Ipv4Addr;
use tracing::{info, warn};

const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1"];
const DEFAULT_CNI_VERSION: &str = "0.3.1";

/// Invocation parameters from the CNI environment.
struct Invocation {
    container_id: String,
    netns_path: String,
    ifname: String,
    args: String,
    cni_path: String,
}

impl Invocation {
    fn from_env() -> Result<Self> {
        Ok(Self {
            container_id: env::var("CNI_CONTAINERID").context("CNI_CONTAINERID is not set")?,
            netns_path: env::var("CNI_NETNS").unwrap_or_default(),
            ifname: env::var("CNI_IFNAME").context("CNI_IFNAME is not set")?,
            args: env::var("CNI_ARGS").unwrap_or_default(),
            cni_path: env::var("CNI_PATH").unwrap_or_default(),
        })
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // current_thread keeps every namespace entry on this one OS thread
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(Some(payload)) => println!("{payload}"),
        Ok(None) => {}
        Err(e) => {
            let payload = json!({
                "cniVersion": DEFAULT_CNI_VERSION,
                "code": 100,
                "msg": format!("{e}"),
                "details": format!("{e:#}"),
            });
            println!("{payload}");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<Option<String>> {
    let command = env::var("CNI_COMMAND").context("CNI_COMMAND is not set")?;
    if command == "VERSION" {
        return Ok(Some(
            json!({
                "cniVersion": DEFAULT_CNI_VERSION,
                "supportedVersions": SUPPORTED_VERSIONS,
            })
            .to_string(),
        ));
    }

    let invocation = Invocation::from_env()?;
    let mut payload = Vec::new();
    std::io::stdin()
        .read_to_end(&mut payload)
        .context("failed to read the network configuration from stdin")?;
    let mut conf = NetConf::parse(&payload)?;

    match command.as_str() {
        "ADD" => {
            select_vlan(&mut conf, &invocation.args, true)?;
            cmd_add(conf, &invocation, &payload).await
        }
        "DEL" => {
            select_vlan(&mut conf, &invocation.args, false)?;
            cmd_del(conf, &invocation, &payload).await
        }
        other => bail!("unsupported CNI command {other:?}"),
    }
}

/// Pick the per-pod VLAN from the `vlans` table using the pod name ordinal.
/// Strict on ADD; on DEL a malformed pod name falls back to the scalar so
/// teardown still proceeds.
fn select_vlan(conf: &mut NetConf, args: &str, strict: bool) -> Result<()> {
    if conf.vlans.is_none() {
        return Ok(());
    }
    match config::pod_ordinal(args) {
        Ok((pod_name, ordinal)) => {
            conf.vlan = conf.vlan_for(Some(ordinal));
            info!(%pod_name, ordinal, vlan = conf.vlan, "selected per-pod vlan");
            Ok(())
        }
        Err(e) if strict => Err(e).context("failed to select a vlan from the vlans table"),
        Err(e) => {
            warn!(error = %e, "cannot derive the pod ordinal; using the scalar vlan");
            Ok(())
        }
    }
}

fn orchestrator(conf: &NetConf) -> Orchestrator<FileRecordStore> {
    Orchestrator::new(
        Topology::host(DriverRegistry::default()),
        DriverBinder::host(),
        FileRecordStore::new(conf.data_dir()),
    )
}

async fn cmd_add(conf: NetConf, invocation: &Invocation, payload: &[u8]) -> Result<Option<String>> {
    let netns = NetNs::open(&invocation.netns_path)
        .with_context(|| format!("failed to open netns {:?}", invocation.netns_path))?;
    let orch = orchestrator(&conf);

    let slaves = orch
        .setup(&conf, &invocation.ifname, &invocation.container_id, &netns)
        .await
        .with_context(|| {
            format!(
                "failed to set up pod interface {} from {}",
                invocation.ifname,
                conf.masters().join(",")
            )
        })?;

    // address management only applies to kernel-bound L3 attachments
    let netlink_expected = match slaves.first() {
        Some(slave) => {
            match orch
                .topology()
                .has_netlink_representation(&slave.device.pf_name, slave.device.vf)
            {
                Ok(expected) => expected,
                Err(e) => {
                    teardown(&orch, &conf, invocation, &netns).await;
                    return Err(e).context("failed to classify the attached vf's driver");
                }
            }
        }
        None => false,
    };
    if conf.dpdk_mode() || conf.l2_mode || !netlink_expected {
        return Ok(Some(empty_result(&conf)));
    }
    let Some(ipam_conf) = conf.ipam.clone() else {
        return Ok(Some(empty_result(&conf)));
    };

    let result = match ipam::exec_add(&ipam_conf.plugin, &invocation.cni_path, payload).await {
        Ok(result) => result,
        Err(e) => {
            teardown(&orch, &conf, invocation, &netns).await;
            return Err(e).with_context(|| {
                format!("failed to set up IPAM plugin {:?}", ipam_conf.plugin)
            });
        }
    };

    if let Err(e) = configure_iface(&netns, &invocation.ifname, &result).await {
        if let Err(del_err) =
            ipam::exec_del(&ipam_conf.plugin, &invocation.cni_path, payload).await
        {
            warn!(error = %del_err, "failed to release the IPAM allocation");
        }
        teardown(&orch, &conf, invocation, &netns).await;
        return Err(e);
    }

    let mut raw = result.raw;
    if let (Some(object), Some(dns)) = (raw.as_object_mut(), &conf.dns) {
        object.insert("dns".to_string(), dns.clone());
    }
    Ok(Some(raw.to_string()))
}

async fn cmd_del(conf: NetConf, invocation: &Invocation, payload: &[u8]) -> Result<Option<String>> {
    if !conf.dpdk_mode()
        && !conf.l2_mode
        && let Some(ipam_conf) = &conf.ipam
    {
        ipam::exec_del(&ipam_conf.plugin, &invocation.cni_path, payload)
            .await
            .with_context(|| format!("failed to tear down IPAM plugin {:?}", ipam_conf.plugin))?;
    }

    if invocation.netns_path.is_empty() {
        return Ok(None);
    }
    let netns = match NetNs::open(&invocation.netns_path) {
        Ok(netns) => netns,
        Err(NetnsError::Gone { path }) => {
            // the namespace vanished (e.g. the node restarted before
            // teardown); the interface and its state are already gone
            info!(path = %path.display(), "netns is gone; nothing left to release");
            return Ok(None);
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to open netns {:?}", invocation.netns_path));
        }
    };

    orchestrator(&conf)
        .release(&conf, &invocation.ifname, &invocation.container_id, &netns)
        .await
        .with_context(|| format!("failed to release pod interface {}", invocation.ifname))?;
    Ok(None)
}

/// Undo a completed setup after a post-setup step failed. Best effort: the
/// primary error is what the caller reports.
async fn teardown(
    orch: &Orchestrator<FileRecordStore>,
    conf: &NetConf,
    invocation: &Invocation,
    netns: &NetNs,
) {
    if let Err(e) = orch
        .release(conf, &invocation.ifname, &invocation.container_id, netns)
        .await
    {
        warn!(error = %e, ifname = %invocation.ifname, "failed to release the interface after a setup failure");
    }
}

/// Apply the delegate's IPv4 configuration inside the sandbox namespace.
async fn configure_iface(netns: &NetNs, ifname: &str, result: &ipam::IpamResult) -> Result<()> {
    let ip4 = result
        .ip4
        .as_ref()
        .ok_or_else(|| anyhow!("IPAM plugin returned missing IPv4 config"))?;
    let (addr, prefix_len) = parse_cidr4(&ip4.ip)?;

    let client = {
        let _guard = netns.enter()?;
        LinkClient::new()?
    };
    let index = client.index_of(ifname).await?;
    client.set_up(index, ifname).await?;
    client
        .add_address(index, ifname, addr.into(), prefix_len)
        .await?;
    if let Some(gateway) = &ip4.gateway {
        let gateway: Ipv4Addr = gateway
            .parse()
            .with_context(|| format!("invalid gateway address {gateway:?}"))?;
        client.add_default_route_v4(gateway).await?;
    }
    info!(ifname, ip = %ip4.ip, "pod interface configured");
    Ok(())
}

fn empty_result(conf: &NetConf) -> String {
    json!({
        "cniVersion": conf
            .cni_version
            .clone()
            .unwrap_or_else(|| DEFAULT_CNI_VERSION.to_string()),
    })
    .to_string()
}

fn parse_cidr4(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, prefix_len) = cidr
        .split_once('/')
        .ok_or_else(|| anyhow!("address {cidr:?} is not in CIDR notation"))?;
    let addr: Ipv4Addr = addr
        .parse()
        .with_context(|| format!("invalid IPv4 address in {cidr:?}"))?;
    let prefix_len: u8 = prefix_len
        .parse()
        .with_context(|| format!("invalid prefix length in {cidr:?}"))?;
    if prefix_len > 32 {
        bail!("prefix length {prefix_len} out of range in {cidr:?}");
    }
    Ok((addr, prefix_len))
}
