//! Runtime configuration derived from the cluster spec
//!
//! Image labels are read into [`ImageOptions`], where every field is an
//! explicit `Option`. A single default-fill step in [`RuntimeConfig::derive`]
//! turns them into concrete values, so "unset" never hides behind an empty
//! string.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cluster::{ClusterSpec, EndpointAddress};
use crate::maps::merge_maps;
use crate::template::render_env;
use crate::{
    Result, DEFAULT_API_SERVER_DOMAIN, DEFAULT_API_SERVER_PORT, DEFAULT_DNS_DOMAIN,
    DEFAULT_LVSCARE_IMAGE, DEFAULT_SERVICE_CIDR, DEFAULT_VIP, LABEL_KUBE_VERSION,
    LABEL_LVSCARE_IMAGE, LABEL_VIP,
};

/// Deployment parameters carried by image labels
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageOptions {
    /// Virtual IP fronting the API servers
    pub virtual_ip: Option<String>,
    /// lvscare image reference
    pub proxy_image: Option<String>,
    /// Kubernetes version shipped by the image
    pub kube_version: Option<String>,
}

fn label(labels: &BTreeMap<String, String>, key: &str) -> Option<String> {
    labels.get(key).filter(|v| !v.is_empty()).cloned()
}

impl ImageOptions {
    /// Read options from image labels; empty values count as unset.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        Self {
            virtual_ip: label(labels, LABEL_VIP),
            proxy_image: label(labels, LABEL_LVSCARE_IMAGE),
            kube_version: label(labels, LABEL_KUBE_VERSION),
        }
    }

    /// Render placeholders of every set option against `env`.
    pub fn render(self, env: &BTreeMap<String, String>) -> Self {
        let render = |v: Option<String>| v.map(|v| render_env(&v, env));
        Self {
            virtual_ip: render(self.virtual_ip),
            proxy_image: render(self.proxy_image),
            kube_version: render(self.kube_version),
        }
    }

    /// Read options from `cluster`'s image, templated for `reference_host`.
    ///
    /// The image's declared env is overlaid with the host's env, host wins.
    pub fn from_cluster(cluster: &ClusterSpec, reference_host: &str) -> Self {
        let env = merge_maps([cluster.image_env(), &cluster.host_env(reference_host)]);
        Self::from_labels(cluster.image_labels()).render(&env)
    }
}

/// Resolve the virtual IP, falling back to [`DEFAULT_VIP`].
pub fn resolve_virtual_ip(cluster: &ClusterSpec, reference_host: &str) -> String {
    let vip = ImageOptions::from_cluster(cluster, reference_host)
        .virtual_ip
        .unwrap_or_else(|| DEFAULT_VIP.to_string());
    debug!(vip = %vip, "resolved virtual IP");
    vip
}

/// Resolve the lvscare image, falling back to [`DEFAULT_LVSCARE_IMAGE`].
pub fn resolve_proxy_image(cluster: &ClusterSpec, reference_host: &str) -> String {
    ImageOptions::from_cluster(cluster, reference_host)
        .proxy_image
        .unwrap_or_else(|| DEFAULT_LVSCARE_IMAGE.to_string())
}

/// Kubernetes version from the image; `None` when the image does not say.
pub fn resolve_kube_version(cluster: &ClusterSpec, reference_host: &str) -> Option<String> {
    ImageOptions::from_cluster(cluster, reference_host).kube_version
}

fn default_api_server_port() -> u16 {
    DEFAULT_API_SERVER_PORT
}

fn default_service_cidr() -> String {
    DEFAULT_SERVICE_CIDR.to_string()
}

fn default_dns_domain() -> String {
    DEFAULT_DNS_DOMAIN.to_string()
}

fn default_api_server_domain() -> String {
    DEFAULT_API_SERVER_DOMAIN.to_string()
}

/// User-tunable kubeadm settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeadmSettings {
    /// API server bind port
    #[serde(default = "default_api_server_port")]
    pub api_server_port: u16,
    /// Service network CIDR
    #[serde(default = "default_service_cidr")]
    pub service_cidr: String,
    /// Cluster DNS domain
    #[serde(default = "default_dns_domain")]
    pub dns_domain: String,
    /// Extra SANs for API server certificates
    #[serde(default)]
    pub cert_sans: Vec<String>,
    /// Domain resolving to the API server through /etc/hosts
    #[serde(default = "default_api_server_domain")]
    pub api_server_domain: String,
}

impl Default for KubeadmSettings {
    fn default() -> Self {
        Self {
            api_server_port: DEFAULT_API_SERVER_PORT,
            service_cidr: default_service_cidr(),
            dns_domain: default_dns_domain(),
            cert_sans: Vec::new(),
            api_server_domain: default_api_server_domain(),
        }
    }
}

impl KubeadmSettings {
    /// Parse settings; an empty document yields defaults
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Read settings from disk
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }
}

/// Values fixed for one orchestration run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Kubernetes version; `None` when unknown
    pub kube_version: Option<String>,
    /// Virtual IP fronting the API servers
    pub virtual_ip: String,
    /// lvscare image reference
    pub proxy_image: String,
    /// API server port
    pub api_server_port: u16,
    /// Service network CIDR
    pub service_cidr: String,
    /// Cluster DNS domain
    pub dns_domain: String,
    /// Domain resolving to the API server
    pub api_server_domain: String,
    /// SANs requested for API server certificates
    pub cert_sans: Vec<String>,
}

impl RuntimeConfig {
    /// Derive the config once from the cluster and settings.
    ///
    /// Labels are templated against master0's environment. A cluster
    /// without masters templates against the cluster-wide env only.
    pub fn derive(cluster: &ClusterSpec, settings: &KubeadmSettings) -> Self {
        let reference_host = cluster.master0_ip().unwrap_or_default();
        let options = ImageOptions::from_cluster(cluster, &reference_host);

        let virtual_ip = options
            .virtual_ip
            .unwrap_or_else(|| DEFAULT_VIP.to_string());
        debug!(vip = %virtual_ip, "resolved virtual IP");
        let proxy_image = options
            .proxy_image
            .unwrap_or_else(|| DEFAULT_LVSCARE_IMAGE.to_string());

        let mut cert_sans: Vec<String> = Vec::new();
        let candidates = settings
            .cert_sans
            .iter()
            .cloned()
            .chain([
                "127.0.0.1".to_string(),
                settings.api_server_domain.clone(),
                virtual_ip.clone(),
            ])
            .chain(cluster.master_ip_list());
        for san in candidates {
            if !san.is_empty() && !cert_sans.contains(&san) {
                cert_sans.push(san);
            }
        }

        Self {
            kube_version: options.kube_version,
            virtual_ip,
            proxy_image,
            api_server_port: settings.api_server_port,
            service_cidr: settings.service_cidr.clone(),
            dns_domain: settings.dns_domain.clone(),
            api_server_domain: settings.api_server_domain.clone(),
            cert_sans,
        }
    }

    /// The virtual IP paired with the API server port
    pub fn vip_and_port(&self) -> EndpointAddress {
        EndpointAddress::new(&self.virtual_ip, self.api_server_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::cluster;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn missing_vip_label_yields_default() {
        for l in [
            labels(&[]),
            labels(&[("version", "v1.25.0")]),
            labels(&[("vip", "")]),
        ] {
            let mut spec = cluster(&["10.0.0.1"], &[]);
            spec.image.labels = l;
            spec.image.env = labels(&[("X", "10.0.0.5")]);
            assert_eq!(resolve_virtual_ip(&spec, "10.0.0.1"), DEFAULT_VIP);
        }
    }

    #[test]
    fn vip_label_is_templated_from_merged_env() {
        let mut spec = cluster(&["10.0.0.1"], &[]);
        spec.image.labels = labels(&[("vip", "${X}")]);
        spec.image.env = labels(&[("X", "10.0.0.5")]);
        assert_eq!(resolve_virtual_ip(&spec, "10.0.0.1"), "10.0.0.5");
    }

    #[test]
    fn unresolved_vip_placeholder_is_kept_verbatim() {
        let mut spec = cluster(&["10.0.0.1"], &[]);
        spec.image.labels = labels(&[("vip", "${X}")]);
        assert_eq!(resolve_virtual_ip(&spec, "10.0.0.1"), "${X}");
    }

    #[test]
    fn host_env_wins_over_image_env() {
        let mut spec = cluster(&["10.0.0.1"], &[]);
        spec.image.labels = labels(&[("vip", "${X}")]);
        spec.image.env = labels(&[("X", "10.0.0.5")]);
        spec.hosts[0].env = vec!["X=10.0.0.9".to_string()];
        assert_eq!(resolve_virtual_ip(&spec, "10.0.0.1"), "10.0.0.9");
    }

    #[test]
    fn proxy_image_and_version_fall_back() {
        let spec = cluster(&["10.0.0.1"], &[]);
        assert_eq!(resolve_proxy_image(&spec, "10.0.0.1"), DEFAULT_LVSCARE_IMAGE);
        assert_eq!(resolve_kube_version(&spec, "10.0.0.1"), None);

        let mut spec = spec;
        spec.image.labels = labels(&[("image", "${REG}/lvscare:v4"), ("version", "v1.27.1")]);
        spec.env = vec!["REG=sealos.hub:5000".to_string()];
        assert_eq!(resolve_proxy_image(&spec, "10.0.0.1"), "sealos.hub:5000/lvscare:v4");
        assert_eq!(resolve_kube_version(&spec, "10.0.0.1").as_deref(), Some("v1.27.1"));
    }

    #[test]
    fn derive_fills_defaults_and_collects_sans() {
        let spec = cluster(&["10.0.0.1", "10.0.0.2:2222"], &["10.0.0.10"]);
        let settings = KubeadmSettings {
            cert_sans: vec!["k8s.example.com".into(), "127.0.0.1".into()],
            ..Default::default()
        };
        let cfg = RuntimeConfig::derive(&spec, &settings);
        assert_eq!(cfg.virtual_ip, DEFAULT_VIP);
        assert_eq!(cfg.proxy_image, DEFAULT_LVSCARE_IMAGE);
        assert_eq!(cfg.kube_version, None);
        assert_eq!(cfg.api_server_port, 6443);
        assert_eq!(
            cfg.cert_sans,
            vec![
                "k8s.example.com",
                "127.0.0.1",
                DEFAULT_API_SERVER_DOMAIN,
                DEFAULT_VIP,
                "10.0.0.1",
                "10.0.0.2",
            ]
        );
        assert_eq!(cfg.vip_and_port().to_string(), format!("{DEFAULT_VIP}:6443"));
    }

    #[test]
    fn settings_parse_with_defaults() {
        assert_eq!(KubeadmSettings::from_yaml("").unwrap(), KubeadmSettings::default());
        let s = KubeadmSettings::from_yaml("apiServerPort: 8443\ncertSans: [a.example.com]").unwrap();
        assert_eq!(s.api_server_port, 8443);
        assert_eq!(s.cert_sans, vec!["a.example.com"]);
        assert_eq!(s.service_cidr, DEFAULT_SERVICE_CIDR);
        assert_eq!(s.dns_domain, DEFAULT_DNS_DOMAIN);
    }
}
