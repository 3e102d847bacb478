//! Local filesystem layout of a cluster's generated artifacts

use std::path::{Path, PathBuf};

use crate::DEFAULT_INIT_KUBEADM_FILE_NAME;

/// Resolves where generated files for one cluster live on the control node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    /// Layout rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default layout: `$HOME/.sealos/<cluster>`
    pub fn for_cluster(home: &Path, cluster_name: &str) -> Self {
        Self::new(home.join(".sealos").join(cluster_name))
    }

    /// Cluster data root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding kubeadm configs and credentials
    pub fn configs_path(&self) -> PathBuf {
        self.root.join("etc")
    }

    /// Admin kubeconfig generated by `kubeadm init`
    pub fn admin_file(&self) -> PathBuf {
        self.configs_path().join("admin.conf")
    }

    /// kubeadm config used to init master0 and issue join tokens
    pub fn init_master_kubeadm_config_file(&self) -> PathBuf {
        self.configs_path().join(DEFAULT_INIT_KUBEADM_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_under_cluster_root() {
        let paths = PathResolver::for_cluster(Path::new("/root"), "default");
        assert_eq!(paths.root(), Path::new("/root/.sealos/default"));
        assert_eq!(paths.admin_file(), Path::new("/root/.sealos/default/etc/admin.conf"));
        assert_eq!(
            paths.init_master_kubeadm_config_file(),
            Path::new("/root/.sealos/default/etc/kubeadm-init.yaml")
        );
    }
}
