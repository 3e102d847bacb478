//! Privileged node operations executed on remote hosts
//!
//! [`RemoteInterface`] is what the runtime calls to change a node: deploy the
//! lvscare static pod, program IPVS rules, issue certificates, read the
//! hostname, edit /etc/hosts and issue join tokens. [`SealctlRemote`] carries
//! each of these out by running the matching `sealctl` subcommand over an
//! [`SshInterface`].

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use secrecy::SecretString;

use crate::cluster::EndpointAddress;
use crate::shell;
use crate::ssh::SshInterface;
use crate::{Error, Result};

/// Node-level operations keyed by host address
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteInterface: Send + Sync {
    /// Program IPVS on `host` so `vip` balances across `masters`, once
    async fn apply_ipvs(
        &self,
        host: &str,
        vip: &EndpointAddress,
        masters: &[EndpointAddress],
    ) -> Result<()>;

    /// Remove the IPVS virtual server for `vip` on `host`.
    ///
    /// Removing a virtual server that does not exist succeeds, so a clean can
    /// be repeated.
    async fn clean_ipvs(&self, host: &str, vip: &EndpointAddress) -> Result<()>;

    /// Write the lvscare static pod manifest on `host`
    async fn deploy_static_proxy_pod(
        &self,
        host: &str,
        vip: &EndpointAddress,
        pod_name: &str,
        image: &str,
        masters: &[EndpointAddress],
    ) -> Result<()>;

    /// Generate serving certificates on `host`
    async fn request_certificate(
        &self,
        host: &str,
        sans: &[String],
        ip: &str,
        hostname: &str,
        service_cidr: &str,
        dns_domain: &str,
    ) -> Result<()>;

    /// Issue a join token; an empty `certificate_key` means a worker join
    async fn request_token(
        &self,
        host: &str,
        kubeadm_config: &Path,
        certificate_key: &str,
    ) -> Result<SecretString>;

    /// Hostname reported by `host`
    async fn resolve_hostname(&self, host: &str) -> Result<String>;

    /// Map `domain` to `ip` in /etc/hosts on `host`
    async fn add_hosts_entry(&self, host: &str, ip: &str, domain: &str) -> Result<()>;

    /// Drop `domain` from /etc/hosts on `host`
    async fn remove_hosts_entry(&self, host: &str, domain: &str) -> Result<()>;
}

/// Default `sealctl` location on nodes
pub const DEFAULT_SEALCTL: &str = "sealctl";

/// [`RemoteInterface`] backed by `sealctl` on each node
#[derive(Clone)]
pub struct SealctlRemote {
    ssh: Arc<dyn SshInterface>,
    binary: String,
}

impl SealctlRemote {
    /// Run `sealctl` from the node's `PATH` over `ssh`
    pub fn new(ssh: Arc<dyn SshInterface>) -> Self {
        Self::with_binary(ssh, DEFAULT_SEALCTL)
    }

    /// Run `binary` as `sealctl`
    pub fn with_binary(ssh: Arc<dyn SshInterface>, binary: impl Into<String>) -> Self {
        Self {
            ssh,
            binary: binary.into(),
        }
    }

    fn command<I, S>(&self, args: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        std::iter::once(shell::escape(&self.binary))
            .chain(args.into_iter().map(|a| shell::escape(a.as_ref())))
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn run(&self, host: &str, args: Vec<String>) -> Result<()> {
        let cmd = self.command(args);
        self.ssh.cmd_async(host, &[cmd]).await
    }

    async fn capture(&self, host: &str, args: Vec<String>) -> Result<String> {
        let cmd = self.command(args);
        self.ssh.cmd_to_string(host, &cmd, "").await
    }
}

fn repeated(flag: &str, values: &[EndpointAddress]) -> Vec<String> {
    values
        .iter()
        .flat_map(|v| [flag.to_string(), v.to_string()])
        .collect()
}

#[async_trait]
impl RemoteInterface for SealctlRemote {
    async fn apply_ipvs(
        &self,
        host: &str,
        vip: &EndpointAddress,
        masters: &[EndpointAddress],
    ) -> Result<()> {
        let mut args = vec!["ipvs".to_string(), "--vs".to_string(), vip.to_string()];
        args.extend(repeated("--rs", masters));
        args.extend(
            ["--health-path", "/healthz", "--health-schem", "https", "--run-once"]
                .map(String::from),
        );
        self.run(host, args).await
    }

    /// `sealctl ipvs --clean` exits 0 when no virtual server matches `vip`
    async fn clean_ipvs(&self, host: &str, vip: &EndpointAddress) -> Result<()> {
        let args = vec![
            "ipvs".to_string(),
            "--clean".to_string(),
            "--vs".to_string(),
            vip.to_string(),
        ];
        self.run(host, args).await
    }

    async fn deploy_static_proxy_pod(
        &self,
        host: &str,
        vip: &EndpointAddress,
        pod_name: &str,
        image: &str,
        masters: &[EndpointAddress],
    ) -> Result<()> {
        let mut args = vec![
            "static-pod".to_string(),
            "lvscare".to_string(),
            "--name".to_string(),
            pod_name.to_string(),
            "--vip".to_string(),
            vip.to_string(),
            "--image".to_string(),
            image.to_string(),
        ];
        args.extend(repeated("--masters", masters));
        self.run(host, args).await
    }

    async fn request_certificate(
        &self,
        host: &str,
        sans: &[String],
        ip: &str,
        hostname: &str,
        service_cidr: &str,
        dns_domain: &str,
    ) -> Result<()> {
        let args = vec![
            "cert".to_string(),
            "--alt-names".to_string(),
            sans.join(","),
            "--node-ip".to_string(),
            ip.to_string(),
            "--node-name".to_string(),
            hostname.to_string(),
            "--service-cidr".to_string(),
            service_cidr.to_string(),
            "--dns-domain".to_string(),
            dns_domain.to_string(),
        ];
        self.run(host, args).await
    }

    async fn request_token(
        &self,
        host: &str,
        kubeadm_config: &Path,
        certificate_key: &str,
    ) -> Result<SecretString> {
        let mut args = vec!["token".to_string(), kubeadm_config.display().to_string()];
        if !certificate_key.is_empty() {
            args.push(certificate_key.to_string());
        }
        let token = self.capture(host, args).await?;
        if token.is_empty() {
            return Err(Error::remote(host, "sealctl token returned no token"));
        }
        Ok(SecretString::new(token))
    }

    async fn resolve_hostname(&self, host: &str) -> Result<String> {
        let hostname = self.capture(host, vec!["hostname".to_string()]).await?;
        if hostname.is_empty() {
            return Err(Error::remote(host, "sealctl hostname returned nothing"));
        }
        Ok(hostname)
    }

    async fn add_hosts_entry(&self, host: &str, ip: &str, domain: &str) -> Result<()> {
        let args = ["hosts", "add", "--ip", ip, "--domain", domain]
            .map(String::from)
            .to_vec();
        self.run(host, args).await
    }

    async fn remove_hosts_entry(&self, host: &str, domain: &str) -> Result<()> {
        let args = ["hosts", "delete", "--domain", domain]
            .map(String::from)
            .to_vec();
        self.run(host, args).await
    }
}
