//! Cluster specification and read-only accessors over it
//!
//! A [`ClusterSpec`] is the desired fleet: hosts with their roles, the
//! cluster-wide environment, and the rootfs image metadata. Host addresses
//! are stored the way users write them, optionally carrying an SSH port
//! (`10.0.0.1:2222`). Accessors hand out either the bare IP or an
//! `ip:port` form and never mix the two.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::maps::{list_to_map, merge_maps};
use crate::{Error, Result};

/// Port used when a host address carries no explicit SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Role a host plays in the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Control-plane host running the API server
    Master,
    /// Worker host
    Node,
}

/// A group of hosts sharing roles and environment
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    /// Host addresses, each `ip` or `ip:sshPort`
    pub ips: Vec<String>,
    /// Roles of every address in this group
    #[serde(default)]
    pub roles: Vec<Role>,
    /// Host-specific `KEY=VALUE` environment
    #[serde(default)]
    pub env: Vec<String>,
}

/// Metadata of the rootfs image the cluster is built from
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMeta {
    /// Image reference, informational
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Image labels (`vip`, `image`, `version`, ...)
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Environment declared by the image
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Desired cluster layout
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Cluster name
    pub name: String,
    /// Host groups, in declaration order
    #[serde(default)]
    pub hosts: Vec<Host>,
    /// Cluster-wide `KEY=VALUE` environment
    #[serde(default)]
    pub env: Vec<String>,
    /// Rootfs image metadata
    #[serde(default)]
    pub image: ImageMeta,
}

/// A `(host, port)` pair rendered as `host:port`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EndpointAddress {
    host: String,
    port: u16,
}

impl EndpointAddress {
    /// Build an endpoint; any port already on `host` is stripped
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host_ip(host).to_string(),
            port,
        }
    }

    /// Bare host IP
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Strip an optional port from a host address.
///
/// `10.0.0.1:22` becomes `10.0.0.1`, `[fd00::1]:22` becomes `fd00::1`.
/// A bare IPv6 address is returned unchanged.
pub fn host_ip(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split_once(']').map(|(ip, _)| ip).unwrap_or(rest);
    }
    match addr.rsplit_once(':') {
        Some((ip, port)) if !ip.contains(':') && port.parse::<u16>().is_ok() => ip,
        _ => addr,
    }
}

/// Port carried by a host address, if any
pub fn host_port(addr: &str) -> Option<u16> {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest
            .split_once("]:")
            .and_then(|(_, port)| port.parse().ok());
    }
    match addr.rsplit_once(':') {
        Some((ip, port)) if !ip.contains(':') => port.parse().ok(),
        _ => None,
    }
}

impl ClusterSpec {
    /// Parse a cluster file
    pub fn from_yaml(content: &str) -> Result<Self> {
        let spec: ClusterSpec = serde_yaml::from_str(content)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Read and parse a cluster file from disk
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Check that host addresses are unique within each role
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation("cluster name must not be empty"));
        }
        for role in [Role::Master, Role::Node] {
            let mut seen = HashSet::new();
            for addr in self.addresses(role) {
                if !seen.insert(host_ip(addr)) {
                    return Err(Error::validation(format!(
                        "host {} is listed more than once as {:?}",
                        addr, role
                    )));
                }
            }
        }
        Ok(())
    }

    fn addresses(&self, role: Role) -> impl Iterator<Item = &String> {
        self.hosts
            .iter()
            .filter(move |h| h.roles.contains(&role))
            .flat_map(|h| h.ips.iter())
    }

    /// Master IPs, ports stripped, in declaration order
    pub fn master_ip_list(&self) -> Vec<String> {
        self.addresses(Role::Master)
            .map(|a| host_ip(a).to_string())
            .collect()
    }

    /// Worker IPs, ports stripped, in declaration order
    pub fn node_ip_list(&self) -> Vec<String> {
        self.addresses(Role::Node)
            .map(|a| host_ip(a).to_string())
            .collect()
    }

    /// Master SSH addresses as `ip:sshPort`
    pub fn master_ip_and_port_list(&self) -> Vec<EndpointAddress> {
        self.addresses(Role::Master).map(|a| ssh_endpoint(a)).collect()
    }

    /// Worker SSH addresses as `ip:sshPort`
    pub fn node_ip_and_port_list(&self) -> Vec<EndpointAddress> {
        self.addresses(Role::Node).map(|a| ssh_endpoint(a)).collect()
    }

    /// First master's SSH address
    pub fn master0_ip_and_port(&self) -> Result<EndpointAddress> {
        self.addresses(Role::Master)
            .next()
            .map(|a| ssh_endpoint(a))
            .ok_or(Error::NoMasters)
    }

    /// First master's IP
    pub fn master0_ip(&self) -> Result<String> {
        self.addresses(Role::Master)
            .next()
            .map(|a| host_ip(a).to_string())
            .ok_or(Error::NoMasters)
    }

    /// Labels of the rootfs image
    pub fn image_labels(&self) -> &BTreeMap<String, String> {
        &self.image.labels
    }

    /// Environment declared by the rootfs image
    pub fn image_env(&self) -> &BTreeMap<String, String> {
        &self.image.env
    }

    /// Environment seen by `ip`: cluster env overlaid with its host group's env.
    pub fn host_env(&self, ip: &str) -> BTreeMap<String, String> {
        let ip = host_ip(ip);
        let cluster_env = list_to_map(&self.env);
        let host_env = self
            .hosts
            .iter()
            .find(|h| h.ips.iter().any(|a| host_ip(a) == ip))
            .map(|h| list_to_map(&h.env))
            .unwrap_or_default();
        merge_maps([&cluster_env, &host_env])
    }

    /// SSH port for `ip`, from its declared address or the default
    pub fn ssh_port(&self, ip: &str) -> u16 {
        let ip = host_ip(ip);
        self.hosts
            .iter()
            .flat_map(|h| h.ips.iter())
            .find(|a| host_ip(a) == ip)
            .and_then(|a| host_port(a))
            .unwrap_or(DEFAULT_SSH_PORT)
    }
}

fn ssh_endpoint(addr: &str) -> EndpointAddress {
    EndpointAddress::new(addr, host_port(addr).unwrap_or(DEFAULT_SSH_PORT))
}
