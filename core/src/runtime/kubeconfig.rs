//! Admin kubeconfig propagation

use std::path::Path;

use tracing::info;

use super::KubeadmRuntime;
use crate::client::ClientFactory;
use crate::Result;

/// Installs the admin kubeconfig for the login user on a master
const COPY_KUBE_ADMIN_CONFIG_COMMAND: &str = "rm -rf $HOME/.kube/config && mkdir -p $HOME/.kube \
     && cp /etc/kubernetes/admin.conf $HOME/.kube/config";

/// Destination relative to the remote login user's home
const REMOTE_KUBE_CONFIG: &str = ".kube/config";

impl<F: ClientFactory> KubeadmRuntime<F> {
    /// Copy the local admin kubeconfig to `~/.kube/config` on each host, in order.
    pub async fn copy_kube_config_file_to_nodes(&self, hosts: &[String]) -> Result<()> {
        let src = self.paths.admin_file();
        let dst = Path::new(REMOTE_KUBE_CONFIG);
        for host in hosts {
            info!(host = %host, "copying admin kubeconfig");
            self.ssh_copy(host, &src, dst).await?;
        }
        Ok(())
    }

    /// Install the kubeconfig that `kubeadm init` wrote on `host` itself
    pub async fn copy_master_kube_config(&self, host: &str) -> Result<()> {
        self.ssh_cmd_async(host, &[COPY_KUBE_ADMIN_CONFIG_COMMAND.to_string()])
            .await
    }
}
