//! Container discovery via the Docker API
//!
//! The runtime is optional: if no daemon is reachable the inventory is
//! simply empty and routing keeps working on process signals alone.

use bollard::container::ListContainersOptions;
use bollard::models::{ContainerInspectResponse, PortMap};
use bollard::Docker;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
const COMPOSE_WORKDIR_LABEL: &str = "com.docker.compose.project.working_dir";

/// A container port published on a host interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedPort {
    pub container_port: u16,
    pub host_ip: String,
    pub host_port: u16,
}

/// One running container as seen by the judge and the address builder.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub image: String,
    pub exposed_ports: Vec<u16>,
    pub published: Vec<PublishedPort>,
    pub network_ip: String,
    pub network_name: String,
    pub workdir: String,
    #[serde(skip)]
    pub labels: HashMap<String, String>,
}

/// Handle to the container runtime. `connect` failures are tolerated; every
/// query on an unconnected inventory answers as if no containers exist.
pub struct ContainerInventory {
    client: Option<Docker>,
}

impl ContainerInventory {
    /// Connect to the daemon, preferring `DOCKER_HOST` over the default
    /// socket. A missing daemon is not an error.
    pub async fn connect() -> Self {
        let client = match Self::try_connect().await {
            Ok(client) => {
                debug!("connected to container runtime");
                Some(client)
            }
            Err(e) => {
                warn!(error = %e, "container runtime unavailable, containers will not be discovered");
                None
            }
        };
        Self { client }
    }

    pub fn disconnected() -> Self {
        Self { client: None }
    }

    async fn try_connect() -> anyhow::Result<Docker> {
        let client = if let Ok(host) = std::env::var("DOCKER_HOST") {
            if let Some(path) = host.strip_prefix("unix://") {
                Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)?
            } else {
                Docker::connect_with_http(&host, 120, bollard::API_DEFAULT_VERSION)?
            }
        } else {
            Docker::connect_with_socket_defaults()?
        };
        client.ping().await?;
        Ok(client)
    }

    /// Inventory of running containers, excluding those belonging to
    /// `own_project` (the proxy's own compose stack must not route to
    /// itself through the judge).
    pub async fn scan(&self, own_project: Option<&str>) -> Vec<ContainerRecord> {
        let Some(client) = &self.client else {
            return Vec::new();
        };

        let summaries = match client
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
        {
            Ok(summaries) => summaries,
            Err(e) => {
                warn!(error = %e, "container listing failed");
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        for summary in summaries {
            let Some(id) = summary.id else { continue };
            let inspect = match client.inspect_container(&id, None).await {
                Ok(inspect) => inspect,
                Err(e) => {
                    debug!(id, error = %e, "container inspect failed");
                    continue;
                }
            };
            let record = record_from_inspect(&id, inspect);
            if let Some(own) = own_project {
                if record.labels.get(COMPOSE_PROJECT_LABEL).map(String::as_str) == Some(own) {
                    continue;
                }
            }
            records.push(record);
        }

        debug!(count = records.len(), "container scan complete");
        records
    }

    /// Host-reachable address for a container port, if the runtime
    /// published one. Required on hosts where the container network is not
    /// routable from the proxy process.
    pub async fn published_port(&self, name: &str, container_port: u16) -> Option<(String, u16)> {
        let client = self.client.as_ref()?;
        let inspect = client.inspect_container(name, None).await.ok()?;
        let ports = inspect.network_settings?.ports?;
        published_from_port_map(&ports, container_port)
    }

    /// IP of the container on its first attached network.
    pub async fn network_ip(&self, name: &str) -> Option<String> {
        let client = self.client.as_ref()?;
        let inspect = client.inspect_container(name, None).await.ok()?;
        first_network(&inspect).map(|(_, ip)| ip)
    }
}

fn first_network(inspect: &ContainerInspectResponse) -> Option<(String, String)> {
    let networks = inspect.network_settings.as_ref()?.networks.as_ref()?;
    networks.iter().find_map(|(name, endpoint)| {
        endpoint
            .ip_address
            .as_ref()
            .filter(|ip| !ip.is_empty())
            .map(|ip| (name.clone(), ip.clone()))
    })
}

/// Shape a raw inspect response into a [`ContainerRecord`].
fn record_from_inspect(id: &str, inspect: ContainerInspectResponse) -> ContainerRecord {
    let name = inspect
        .name
        .as_deref()
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();

    let (network_name, network_ip) = first_network(&inspect).unwrap_or_default();

    let config = inspect.config.unwrap_or_default();
    let labels = config.labels.unwrap_or_default();

    let mut exposed_ports: Vec<u16> = config
        .exposed_ports
        .unwrap_or_default()
        .keys()
        .filter_map(|spec| parse_port_spec(spec))
        .collect();
    exposed_ports.sort_unstable();

    let published = inspect
        .network_settings
        .and_then(|ns| ns.ports)
        .map(|ports| all_published(&ports))
        .unwrap_or_default();

    // Compose records where the stack lives beat the image's WORKDIR.
    let workdir = labels
        .get(COMPOSE_WORKDIR_LABEL)
        .cloned()
        .or(config.working_dir)
        .unwrap_or_default();

    ContainerRecord {
        id: id.to_string(),
        name,
        image: config.image.unwrap_or_default(),
        exposed_ports,
        published,
        network_ip,
        network_name,
        workdir,
        labels,
    }
}

/// `"5432/tcp"` → `5432`.
fn parse_port_spec(spec: &str) -> Option<u16> {
    spec.split('/').next()?.parse().ok()
}

fn normalize_host_ip(host_ip: Option<&str>) -> String {
    match host_ip {
        None | Some("") | Some("0.0.0.0") | Some("::") => "127.0.0.1".to_string(),
        Some(ip) => ip.to_string(),
    }
}

fn published_from_port_map(ports: &PortMap, container_port: u16) -> Option<(String, u16)> {
    let bindings = ports.get(&format!("{container_port}/tcp"))?.as_ref()?;
    bindings.iter().find_map(|b| {
        let host_port: u16 = b.host_port.as_deref()?.parse().ok()?;
        Some((normalize_host_ip(b.host_ip.as_deref()), host_port))
    })
}

fn all_published(ports: &PortMap) -> Vec<PublishedPort> {
    let mut result: Vec<PublishedPort> = ports
        .iter()
        .filter_map(|(spec, bindings)| {
            let container_port = parse_port_spec(spec)?;
            let binding = bindings.as_ref()?.first()?;
            let host_port: u16 = binding.host_port.as_deref()?.parse().ok()?;
            Some(PublishedPort {
                container_port,
                host_ip: normalize_host_ip(binding.host_ip.as_deref()),
                host_port,
            })
        })
        .collect();
    result.sort_by_key(|p| p.container_port);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerConfig, EndpointSettings, NetworkSettings, PortBinding};

    fn port_map(entries: &[(&str, Option<(&str, &str)>)]) -> PortMap {
        entries
            .iter()
            .map(|(spec, binding)| {
                let bindings = binding.map(|(ip, port)| {
                    vec![PortBinding {
                        host_ip: Some(ip.to_string()),
                        host_port: Some(port.to_string()),
                    }]
                });
                (spec.to_string(), bindings)
            })
            .collect()
    }

    #[test]
    fn test_published_lookup() {
        let ports = port_map(&[
            ("80/tcp", Some(("0.0.0.0", "8080"))),
            ("5432/tcp", None),
        ]);
        assert_eq!(
            published_from_port_map(&ports, 80),
            Some(("127.0.0.1".to_string(), 8080))
        );
        assert_eq!(published_from_port_map(&ports, 5432), None);
        assert_eq!(published_from_port_map(&ports, 9999), None);
    }

    #[test]
    fn test_published_keeps_explicit_host_ip() {
        let ports = port_map(&[("80/tcp", Some(("192.168.64.2", "8080")))]);
        assert_eq!(
            published_from_port_map(&ports, 80),
            Some(("192.168.64.2".to_string(), 8080))
        );
    }

    #[test]
    fn test_record_from_inspect() {
        let mut labels = HashMap::new();
        labels.insert(COMPOSE_PROJECT_LABEL.to_string(), "shop".to_string());
        labels.insert(COMPOSE_WORKDIR_LABEL.to_string(), "/home/u/shop".to_string());

        let mut exposed = HashMap::new();
        exposed.insert("80/tcp".to_string(), HashMap::new());
        exposed.insert("443/tcp".to_string(), HashMap::new());

        let mut networks = HashMap::new();
        networks.insert(
            "shop_default".to_string(),
            EndpointSettings {
                ip_address: Some("172.18.0.3".to_string()),
                ..Default::default()
            },
        );

        let inspect = ContainerInspectResponse {
            name: Some("/shop-web-1".to_string()),
            config: Some(ContainerConfig {
                image: Some("nginx:alpine".to_string()),
                labels: Some(labels),
                exposed_ports: Some(exposed),
                working_dir: Some("/etc/nginx".to_string()),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                networks: Some(networks),
                ports: Some(port_map(&[("80/tcp", Some(("0.0.0.0", "8080")))])),
                ..Default::default()
            }),
            ..Default::default()
        };

        let record = record_from_inspect("abc123", inspect);
        assert_eq!(record.name, "shop-web-1");
        assert_eq!(record.image, "nginx:alpine");
        assert_eq!(record.exposed_ports, vec![80, 443]);
        assert_eq!(record.network_ip, "172.18.0.3");
        assert_eq!(record.network_name, "shop_default");
        // Compose label wins over the image WORKDIR.
        assert_eq!(record.workdir, "/home/u/shop");
        assert_eq!(
            record.published,
            vec![PublishedPort {
                container_port: 80,
                host_ip: "127.0.0.1".to_string(),
                host_port: 8080,
            }]
        );
    }

    #[test]
    fn test_parse_port_spec() {
        assert_eq!(parse_port_spec("5432/tcp"), Some(5432));
        assert_eq!(parse_port_spec("80/udp"), Some(80));
        assert_eq!(parse_port_spec("garbage"), None);
    }
}
