//! Kubeadm runtime orchestrator
//!
//! [`KubeadmRuntime`] owns the derived [`RuntimeConfig`] for one run and
//! drives node operations through the SSH and remote seams:
//!
//! - [`ipvs`] keeps every worker's lvscare static pod pointed at the masters
//! - [`node`] covers certificates, hostnames, /etc/hosts and join tokens
//! - [`kubeconfig`] propagates the admin credentials
//!
//! Apart from the worker fan-out in [`ipvs`], every method is a single,
//! sequential remote call; ordering across methods is up to the caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::client::{
    admin_target, api_server_url, ClientFactory, KubeClientCache, KubeExpansion,
    KubeconfigClientFactory,
};
use crate::cluster::{ClusterSpec, EndpointAddress};
use crate::config::{KubeadmSettings, RuntimeConfig};
use crate::paths::PathResolver;
use crate::remote::RemoteInterface;
use crate::ssh::SshInterface;
use crate::Result;

pub mod ipvs;
pub mod kubeconfig;
pub mod node;

pub use ipvs::SyncReport;

/// Orchestrates bootstrap and HA proxy operations across a cluster
pub struct KubeadmRuntime<F: ClientFactory = KubeconfigClientFactory> {
    cluster: Arc<ClusterSpec>,
    config: RuntimeConfig,
    ssh: Arc<dyn SshInterface>,
    remote: Arc<dyn RemoteInterface>,
    paths: PathResolver,
    client: KubeClientCache<F>,
}

impl KubeadmRuntime<KubeconfigClientFactory> {
    /// Runtime using kubeconfig-backed API clients
    pub fn new(
        cluster: ClusterSpec,
        settings: &KubeadmSettings,
        ssh: Arc<dyn SshInterface>,
        remote: Arc<dyn RemoteInterface>,
        paths: PathResolver,
    ) -> Self {
        Self::with_client_factory(cluster, settings, ssh, remote, paths, KubeconfigClientFactory)
    }

    /// Convenience wrapper over the cached client
    pub async fn kube_expansion(&self) -> Result<KubeExpansion> {
        Ok(KubeExpansion::new(self.kube_client().await?))
    }

    /// Kubernetes version recorded in the cluster's kubeadm-config
    pub async fn kube_version(&self) -> Result<Option<String>> {
        self.kube_expansion().await?.fetch_kube_version().await
    }
}

impl<F: ClientFactory> KubeadmRuntime<F> {
    /// Runtime building API clients with `factory`
    pub fn with_client_factory(
        cluster: ClusterSpec,
        settings: &KubeadmSettings,
        ssh: Arc<dyn SshInterface>,
        remote: Arc<dyn RemoteInterface>,
        paths: PathResolver,
        factory: F,
    ) -> Self {
        let config = RuntimeConfig::derive(&cluster, settings);
        info!(
            cluster = %cluster.name,
            vip = %config.virtual_ip,
            lvscare = %config.proxy_image,
            "runtime configured"
        );
        Self {
            cluster: Arc::new(cluster),
            config,
            ssh,
            remote,
            paths,
            client: KubeClientCache::new(factory),
        }
    }

    /// Cluster this runtime operates on
    pub fn cluster(&self) -> &ClusterSpec {
        &self.cluster
    }

    /// Values derived for this run
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Local layout of generated files
    pub fn paths(&self) -> &PathResolver {
        &self.paths
    }

    /// Kubernetes version declared by the image, after templating
    pub fn kube_version_from_image(&self) -> Option<&str> {
        self.config.kube_version.as_deref()
    }

    pub fn master0_ip(&self) -> Result<String> {
        self.cluster.master0_ip()
    }

    pub fn master_ip_list(&self) -> Vec<String> {
        self.cluster.master_ip_list()
    }

    pub fn node_ip_list(&self) -> Vec<String> {
        self.cluster.node_ip_list()
    }

    /// Masters as `ip:apiServerPort`, in declaration order
    pub fn master_ip_list_and_https_port(&self) -> Vec<EndpointAddress> {
        self.cluster
            .master_ip_list()
            .iter()
            .map(|ip| EndpointAddress::new(ip, self.config.api_server_port))
            .collect()
    }

    /// Masters as `ip:sshPort`
    pub fn master_ip_and_port_list(&self) -> Vec<EndpointAddress> {
        self.cluster.master_ip_and_port_list()
    }

    /// Workers as `ip:sshPort`
    pub fn node_ip_and_port_list(&self) -> Vec<EndpointAddress> {
        self.cluster.node_ip_and_port_list()
    }

    pub fn master0_ip_and_port(&self) -> Result<EndpointAddress> {
        self.cluster.master0_ip_and_port()
    }

    /// `https://<master0>:<apiServerPort>`
    pub fn master0_api_server(&self) -> Result<String> {
        Ok(api_server_url(
            &self.master0_ip()?,
            self.config.api_server_port,
        ))
    }

    /// Virtual IP fronting the API servers
    pub fn vip(&self) -> &str {
        &self.config.virtual_ip
    }

    /// Virtual IP with the API server port
    pub fn vip_and_port(&self) -> EndpointAddress {
        self.config.vip_and_port()
    }

    /// lvscare image for the static proxy pod
    pub fn proxy_image(&self) -> &str {
        &self.config.proxy_image
    }

    /// kubeadm config used for `kubeadm init` and token issuance
    pub fn init_master_kubeadm_config_file(&self) -> PathBuf {
        self.paths.init_master_kubeadm_config_file()
    }

    /// Run commands on `host`, streaming their output
    pub async fn ssh_cmd_async(&self, host: &str, cmds: &[String]) -> Result<()> {
        self.ssh.cmd_async(host, cmds).await
    }

    /// Run `cmd` on `host` and capture stdout
    pub async fn ssh_cmd_to_string(&self, host: &str, cmd: &str) -> Result<String> {
        self.ssh.cmd_to_string(host, cmd, "").await
    }

    /// Copy `src` to `dst` on `host`; identical paths are a logged no-op
    pub async fn ssh_copy(&self, host: &str, src: &Path, dst: &Path) -> Result<()> {
        if src == dst {
            info!(host = %host, path = %src.display(), "src and dst is same path, skip copy");
            return Ok(());
        }
        self.ssh.copy(host, src, dst).await
    }

    /// API client for master0 with the admin credentials, built once
    pub async fn kube_client(&self) -> Result<F::Client> {
        self.client
            .get_or_build(|| {
                Ok(admin_target(
                    &self.paths.admin_file(),
                    self.master0_api_server()?,
                ))
            })
            .await
    }

    /// Forget the cached client, e.g. after master0 changed
    pub async fn invalidate_kube_client(&self) {
        self.client.invalidate().await
    }
}
