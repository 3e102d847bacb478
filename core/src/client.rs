//! Kubernetes API client construction and caching
//!
//! The runtime talks to the API server with the admin credentials, pointed at
//! master0. [`KubeClientCache`] builds that client on first use and hands out
//! clones afterwards. Construction holds the cache lock, so concurrent first
//! callers share a single build. A failed build leaves the cache empty.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, ResourceExt};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{Error, Result};

/// Namespace holding kubeadm's cluster-wide config
const KUBEADM_CONFIG_NAMESPACE: &str = "kube-system";
/// ConfigMap written by `kubeadm init`
const KUBEADM_CONFIG_MAP: &str = "kubeadm-config";
/// Key of the ClusterConfiguration document inside [`KUBEADM_CONFIG_MAP`]
const CLUSTER_CONFIGURATION_KEY: &str = "ClusterConfiguration";

/// Where a client should connect and with which credentials
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientTarget {
    /// Admin kubeconfig file
    pub kubeconfig: PathBuf,
    /// API server URL overriding the kubeconfig's server
    pub api_server: String,
}

/// Builds API clients; the seam lets tests count constructions
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Client type produced
    type Client: Clone + Send + Sync;

    /// Build a client for `target`
    async fn build(&self, target: &ClientTarget) -> Result<Self::Client>;
}

/// Builds a [`kube::Client`] from a kubeconfig file and an explicit server URL
#[derive(Clone, Copy, Debug, Default)]
pub struct KubeconfigClientFactory;

#[async_trait]
impl ClientFactory for KubeconfigClientFactory {
    type Client = Client;

    async fn build(&self, target: &ClientTarget) -> Result<Client> {
        let kubeconfig = Kubeconfig::read_from(&target.kubeconfig)?;
        let mut config =
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
        config.cluster_url =
            target
                .api_server
                .parse::<http::Uri>()
                .map_err(|e| Error::InvalidApiServer {
                    url: target.api_server.clone(),
                    message: e.to_string(),
                })?;
        Ok(Client::try_from(config)?)
    }
}

/// Lazily built, memoized API client
pub struct KubeClientCache<F: ClientFactory> {
    factory: F,
    slot: Mutex<Option<F::Client>>,
}

impl<F: ClientFactory> KubeClientCache<F> {
    /// Empty cache building clients with `factory`
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            slot: Mutex::new(None),
        }
    }

    /// Return the cached client, building it for `target` on first use.
    ///
    /// `target` is only evaluated when a build is needed. Once a client is
    /// cached it is returned as-is until [`invalidate`](Self::invalidate).
    pub async fn get_or_build<T>(&self, target: T) -> Result<F::Client>
    where
        T: FnOnce() -> Result<ClientTarget> + Send,
    {
        let mut slot = self.slot.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let target = target()?;
        debug!(
            kubeconfig = %target.kubeconfig.display(),
            api_server = %target.api_server,
            "building kubernetes client"
        );
        let client = self.factory.build(&target).await?;
        *slot = Some(client.clone());
        Ok(client)
    }

    /// Drop the cached client so the next call rebuilds it
    pub async fn invalidate(&self) {
        if self.slot.lock().await.take().is_some() {
            info!("kubernetes client invalidated");
        }
    }

    pub(crate) fn factory(&self) -> &F {
        &self.factory
    }

    /// Whether a client is currently cached
    pub async fn is_cached(&self) -> bool {
        self.slot.lock().await.is_some()
    }
}

/// Higher-level helpers over a [`kube::Client`]
#[derive(Clone)]
pub struct KubeExpansion {
    client: Client,
}

impl KubeExpansion {
    /// Wrap `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// The wrapped client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// ClusterConfiguration document stored by `kubeadm init`
    pub async fn fetch_kubeadm_config(&self) -> Result<String> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), KUBEADM_CONFIG_NAMESPACE);
        let cm = api.get(KUBEADM_CONFIG_MAP).await?;
        cluster_configuration(&cm).ok_or_else(|| {
            Error::validation(format!(
                "{}/{} has no {} entry",
                KUBEADM_CONFIG_NAMESPACE, KUBEADM_CONFIG_MAP, CLUSTER_CONFIGURATION_KEY
            ))
        })
    }

    /// `kubernetesVersion` the control plane was initialised with
    pub async fn fetch_kube_version(&self) -> Result<Option<String>> {
        kubernetes_version(&self.fetch_kubeadm_config().await?)
    }

    /// Names of all registered nodes
    pub async fn list_node_names(&self) -> Result<Vec<String>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes.items.iter().map(|n| n.name_any()).collect())
    }
}

fn cluster_configuration(cm: &ConfigMap) -> Option<String> {
    cm.data
        .as_ref()
        .and_then(|data| data.get(CLUSTER_CONFIGURATION_KEY))
        .cloned()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterConfiguration {
    #[serde(default)]
    kubernetes_version: Option<String>,
}

/// `kubernetesVersion` of a ClusterConfiguration document; empty counts as unset
pub fn kubernetes_version(cluster_configuration: &str) -> Result<Option<String>> {
    let config: ClusterConfiguration = serde_yaml::from_str(cluster_configuration)?;
    Ok(config.kubernetes_version.filter(|v| !v.is_empty()))
}

/// `https://<ip>:<port>` for an API server
pub fn api_server_url(ip: &str, port: u16) -> String {
    if ip.contains(':') {
        format!("https://[{ip}]:{port}")
    } else {
        format!("https://{ip}:{port}")
    }
}

/// Admin kubeconfig path paired with `api_server`
pub fn admin_target(kubeconfig: &Path, api_server: String) -> ClientTarget {
    ClientTarget {
        kubeconfig: kubeconfig.to_path_buf(),
        api_server,
    }
}
