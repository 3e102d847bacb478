//! Per-node bootstrap actions

use secrecy::SecretString;
use tracing::{debug, info};

use super::KubeadmRuntime;
use crate::client::ClientFactory;
use crate::cluster::host_ip;
use crate::Result;

impl<F: ClientFactory> KubeadmRuntime<F> {
    /// Lowercased hostname of `host`
    pub async fn exec_hostname(&self, host: &str) -> Result<String> {
        let hostname = self.remote.resolve_hostname(host).await?;
        Ok(hostname.to_lowercase())
    }

    /// Generate API server certificates on `host`.
    ///
    /// The hostname is resolved first; if that fails no certificate is
    /// requested.
    pub async fn exec_cert(&self, host: &str) -> Result<()> {
        let hostname = self.exec_hostname(host).await?;
        info!(host = %host, hostname = %hostname, "generating certificates");
        self.remote
            .request_certificate(
                host,
                &self.config.cert_sans,
                host_ip(host),
                &hostname,
                &self.config.service_cidr,
                &self.config.dns_domain,
            )
            .await
    }

    /// Map `domain` to the IP of `target` in /etc/hosts on `host`
    pub async fn exec_hosts_append(&self, host: &str, target: &str, domain: &str) -> Result<()> {
        self.remote
            .add_hosts_entry(host, host_ip(target), domain)
            .await
    }

    /// Drop `domain` from /etc/hosts on `host`
    pub async fn exec_hosts_delete(&self, host: &str, domain: &str) -> Result<()> {
        self.remote.remove_hosts_entry(host, domain).await
    }

    /// Issue a join token on `host`.
    ///
    /// Pass a certificate key to join control-plane nodes.
    pub async fn exec_token(
        &self,
        host: &str,
        certificate_key: Option<&str>,
    ) -> Result<SecretString> {
        let config = self.init_master_kubeadm_config_file();
        debug!(host = %host, config = %config.display(), "requesting join token");
        self.remote
            .request_token(host, &config, certificate_key.unwrap_or_default())
            .await
    }
}
