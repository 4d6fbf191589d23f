//! Mapping → upstream socket address
//!
//! Processes are always reached over loopback; the port is re-derived from
//! the live process snapshot when the mapping carries an identifier, with
//! the stored port as fallback. Containers are reached through a published
//! host port when one exists (mandatory where the container network is not
//! routable from the proxy), otherwise directly via the container IP.

use crate::discovery::{ContainerInventory, ProcessRecord};
use crate::rebind;
use crate::store::{RouteMapping, TargetKind};
use anyhow::{Context, Result};
use tracing::{debug, warn};

pub const LOOPBACK: &str = "127.0.0.1";

/// Upstream address for a process mapping. Rebinding failures are
/// warnings, not errors; the stored port still stands.
pub fn process_upstream(mapping: &RouteMapping, snapshot: &[ProcessRecord]) -> (String, u16) {
    let port = match &mapping.identifier {
        Some(identifier) => match rebind::resolve_port(identifier, snapshot) {
            Some(port) => {
                if port != mapping.port {
                    debug!(
                        workdir = %identifier.workdir,
                        stored = mapping.port,
                        rebound = port,
                        "rebound process port"
                    );
                }
                port
            }
            None => {
                warn!(
                    workdir = %identifier.workdir,
                    fallback = mapping.port,
                    "no live process matches identifier, using stored port"
                );
                mapping.port
            }
        },
        None => mapping.port,
    };
    (LOOPBACK.to_string(), port)
}

/// Upstream address for a container mapping.
pub async fn container_upstream(
    mapping: &RouteMapping,
    containers: &ContainerInventory,
) -> Result<(String, u16)> {
    let published = containers
        .published_port(&mapping.target, mapping.port)
        .await;
    let network_ip = match published {
        Some(_) => None,
        None => containers.network_ip(&mapping.target).await,
    };
    choose_container_addr(&mapping.target, mapping.port, published, network_ip)
}

/// Published host address wins; the container-network IP is the fallback.
fn choose_container_addr(
    name: &str,
    port: u16,
    published: Option<(String, u16)>,
    network_ip: Option<String>,
) -> Result<(String, u16)> {
    if let Some((host_ip, host_port)) = published {
        return Ok((host_ip, host_port));
    }
    let ip = network_ip
        .filter(|ip| !ip.is_empty())
        .with_context(|| format!("container {name} has no published port {port} and no network address"))?;
    Ok((ip, port))
}

/// Upstream address for any mapping kind.
pub async fn build_upstream(
    mapping: &RouteMapping,
    process_snapshot: &[ProcessRecord],
    containers: &ContainerInventory,
) -> Result<(String, u16)> {
    match mapping.kind {
        TargetKind::Process => Ok(process_upstream(mapping, process_snapshot)),
        TargetKind::Container => container_upstream(mapping, containers).await,
    }
}
