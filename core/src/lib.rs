//! kubeadm runtime - orchestration of a kubeadm control plane over SSH
//!
//! The runtime bootstraps and maintains a multi-master Kubernetes cluster on
//! hosts reached only through remote command execution. It derives its
//! configuration from rootfs image labels, keeps every worker's lvscare
//! static pod forwarding the virtual IP to the masters, and drives per-node
//! bootstrap steps (certificates, hosts entries, join tokens, kubeconfig).
//!
//! # Modules
//!
//! - [`cluster`] - Cluster spec and host address accessors
//! - [`config`] - Image label resolution and the derived runtime config
//! - [`template`] - `${KEY}` placeholder rendering
//! - [`maps`] - `KEY=VALUE` map helpers
//! - [`paths`] - Local layout of generated files
//! - [`ssh`] - Remote command transport
//! - [`remote`] - Node operations run through `sealctl`
//! - [`client`] - Cached Kubernetes API client
//! - [`runtime`] - The orchestrator
//! - [`error`] - Error types

pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod maps;
pub mod paths;
pub mod remote;
pub mod runtime;
mod shell;
pub mod ssh;
pub mod template;

pub use error::Error;
pub use runtime::KubeadmRuntime;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Defaults
// =============================================================================

/// Virtual IP used when the image does not declare one
pub const DEFAULT_VIP: &str = "10.103.97.2";

/// lvscare image used when the image does not declare one
pub const DEFAULT_LVSCARE_IMAGE: &str = "ghcr.io/labring/lvscare:v4.3.0";

/// Name of the lvscare static pod on workers
pub const LVSCARE_STATIC_POD_NAME: &str = "kube-sealos-lvscare";

/// API server port
pub const DEFAULT_API_SERVER_PORT: u16 = 6443;

/// Service network CIDR
pub const DEFAULT_SERVICE_CIDR: &str = "10.96.0.0/22";

/// Cluster DNS domain
pub const DEFAULT_DNS_DOMAIN: &str = "cluster.local";

/// Domain workers resolve to reach the API server
pub const DEFAULT_API_SERVER_DOMAIN: &str = "apiserver.cluster.local";

/// kubeadm config file used to init master0
pub const DEFAULT_INIT_KUBEADM_FILE_NAME: &str = "kubeadm-init.yaml";

// =============================================================================
// Image labels
// =============================================================================

/// Label carrying the virtual IP
pub const LABEL_VIP: &str = "vip";

/// Label carrying the lvscare image reference
pub const LABEL_LVSCARE_IMAGE: &str = "image";

/// Label carrying the Kubernetes version
pub const LABEL_KUBE_VERSION: &str = "version";
