//! Remote command transport
//!
//! [`SshInterface`] is the capability the runtime consumes: run commands on a
//! host, capture a command's stdout, and copy a local file to a host.
//! [`OpenSsh`] implements it by shelling out to the system `ssh` and `scp`
//! binaries. Timeouts are left to the SSH client configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::cluster::{host_ip, host_port, ClusterSpec, DEFAULT_SSH_PORT};
use crate::shell;
use crate::{Error, Result};

/// Command execution and file transfer against a host
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SshInterface: Send + Sync {
    /// Run each command in order on `host`, streaming output to the log.
    ///
    /// Stops at the first command that fails.
    async fn cmd_async(&self, host: &str, cmds: &[String]) -> Result<()>;

    /// Run `cmd` on `host` and return its stdout, lines joined by `sep`
    async fn cmd_to_string(&self, host: &str, cmd: &str, sep: &str) -> Result<String>;

    /// Copy local `src` to `dst` on `host`
    async fn copy(&self, host: &str, src: &Path, dst: &Path) -> Result<()>;
}

/// How unknown and changed host keys are treated
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HostKeyChecking {
    /// Only hosts already in `known_hosts` are accepted
    Strict,
    /// Unknown hosts are recorded on first contact; changed keys are refused
    #[default]
    AcceptNew,
    /// Any key is accepted
    Off,
}

impl HostKeyChecking {
    fn as_ssh_option(self) -> &'static str {
        match self {
            HostKeyChecking::Strict => "StrictHostKeyChecking=yes",
            HostKeyChecking::AcceptNew => "StrictHostKeyChecking=accept-new",
            HostKeyChecking::Off => "StrictHostKeyChecking=no",
        }
    }
}

impl FromStr for HostKeyChecking {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "strict" | "yes" => Ok(HostKeyChecking::Strict),
            "accept-new" => Ok(HostKeyChecking::AcceptNew),
            "off" | "no" => Ok(HostKeyChecking::Off),
            other => Err(Error::validation(format!(
                "unknown host key checking mode {other:?}, expected strict, accept-new or off"
            ))),
        }
    }
}

/// Options passed to every `ssh`/`scp` invocation
#[derive(Clone, Debug, Default)]
pub struct SshOptions {
    /// Login user; the client default when unset
    pub user: Option<String>,
    /// Private key file
    pub identity_file: Option<PathBuf>,
    pub host_key_checking: HostKeyChecking,
}

/// [`SshInterface`] over the OpenSSH command-line client
#[derive(Clone, Debug)]
pub struct OpenSsh {
    options: SshOptions,
    ports: BTreeMap<String, u16>,
}

impl OpenSsh {
    /// Client using `options` and the default SSH port for every host
    pub fn new(options: SshOptions) -> Self {
        Self {
            options,
            ports: BTreeMap::new(),
        }
    }

    /// Client that knows the SSH port declared for each host of `cluster`
    pub fn for_cluster(cluster: &ClusterSpec, options: SshOptions) -> Self {
        let ports = cluster
            .hosts
            .iter()
            .flat_map(|h| h.ips.iter())
            .filter_map(|addr| host_port(addr).map(|port| (host_ip(addr).to_string(), port)))
            .collect();
        Self { options, ports }
    }

    fn port(&self, host: &str) -> u16 {
        host_port(host)
            .or_else(|| self.ports.get(host_ip(host)).copied())
            .unwrap_or(DEFAULT_SSH_PORT)
    }

    fn target(&self, host: &str) -> String {
        let ip = host_ip(host);
        let ip = if ip.contains(':') {
            format!("[{ip}]")
        } else {
            ip.to_string()
        };
        match &self.options.user {
            Some(user) => format!("{user}@{ip}"),
            None => ip,
        }
    }

    fn common_args(&self, cmd: &mut Command) {
        cmd.args(["-o", "BatchMode=yes", "-o"])
            .arg(self.options.host_key_checking.as_ssh_option());
        if let Some(identity) = &self.options.identity_file {
            cmd.arg("-i").arg(identity);
        }
    }

    fn ssh_command(&self, host: &str, remote_cmd: &str) -> Command {
        let mut cmd = Command::new("ssh");
        self.common_args(&mut cmd);
        cmd.arg("-p")
            .arg(self.port(host).to_string())
            .arg(self.target(host))
            .arg("--")
            .arg(remote_cmd);
        cmd.stdin(Stdio::null());
        cmd
    }

    async fn run_streaming(&self, host: &str, remote_cmd: &str) -> Result<()> {
        debug!(host = %host, cmd = %remote_cmd, "executing remote command");
        let mut child = self
            .ssh_command(host, remote_cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::remote(host, format!("failed to spawn ssh: {e}")))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tokio::join!(log_lines(host, stdout), log_lines(host, stderr));

        let status = child
            .wait()
            .await
            .map_err(|e| Error::remote(host, format!("failed to wait for ssh: {e}")))?;
        if !status.success() {
            return Err(Error::remote(
                host,
                format!("command `{remote_cmd}` exited with {status}"),
            ));
        }
        Ok(())
    }
}

async fn log_lines<R: AsyncRead + Unpin>(host: &str, stream: Option<R>) {
    let Some(stream) = stream else { return };
    if let Err(e) = drain_lines(stream, |line| info!(host = %host, "{}", line)).await {
        warn!(host = %host, error = %e, "failed to read remote output");
    }
}

/// Read `stream` to EOF, handing each line to `on_line`.
///
/// Bytes that are not UTF-8 are replaced and reading continues, so the pipe
/// stays open until the remote command closes it.
async fn drain_lines<R, F>(stream: R, mut on_line: F) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf);
        on_line(line.trim_end_matches(|c: char| c == '\n' || c == '\r'));
    }
}

fn mkdir_command(dir: &Path) -> String {
    format!("mkdir -p -- {}", shell::escape(&dir.to_string_lossy()))
}

/// `target:path` for scp; the remote shell expands the path
fn scp_destination(target: &str, path: &Path) -> String {
    format!("{target}:{}", shell::escape(&path.to_string_lossy()))
}

/// Join output lines with `sep`, dropping the trailing newline
pub(crate) fn join_output(raw: &str, sep: &str) -> String {
    raw.lines()
        .map(|l| l.trim_end_matches('\r'))
        .collect::<Vec<_>>()
        .join(sep)
        .trim()
        .to_string()
}

#[async_trait]
impl SshInterface for OpenSsh {
    async fn cmd_async(&self, host: &str, cmds: &[String]) -> Result<()> {
        for cmd in cmds {
            self.run_streaming(host, cmd).await?;
        }
        Ok(())
    }

    async fn cmd_to_string(&self, host: &str, cmd: &str, sep: &str) -> Result<String> {
        debug!(host = %host, cmd = %cmd, "capturing remote command output");
        let output = self
            .ssh_command(host, cmd)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::remote(host, format!("failed to spawn ssh: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::remote(
                host,
                format!("command `{cmd}` exited with {}: {}", output.status, stderr.trim()),
            ));
        }
        Ok(join_output(&String::from_utf8_lossy(&output.stdout), sep))
    }

    async fn copy(&self, host: &str, src: &Path, dst: &Path) -> Result<()> {
        if let Some(parent) = dst.parent().filter(|p| !p.as_os_str().is_empty()) {
            self.run_streaming(host, &mkdir_command(parent)).await?;
        }

        debug!(host = %host, src = %src.display(), dst = %dst.display(), "copying file");
        let mut cmd = Command::new("scp");
        self.common_args(&mut cmd);
        let output = cmd
            .arg("-P")
            .arg(self.port(host).to_string())
            .arg("-r")
            .arg(src)
            .arg(scp_destination(&self.target(host), dst))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::remote(host, format!("failed to spawn scp: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::remote(
                host,
                format!(
                    "copy {} to {} failed: {}",
                    src.display(),
                    dst.display(),
                    stderr.trim()
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Host, Role};

    #[test]
    fn ports_come_from_cluster_addresses() {
        let cluster = ClusterSpec {
            name: "default".into(),
            hosts: vec![Host {
                ips: vec!["10.0.0.1:2222".into(), "10.0.0.2".into()],
                roles: vec![Role::Master],
                env: vec![],
            }],
            ..Default::default()
        };
        let ssh = OpenSsh::for_cluster(&cluster, SshOptions::default());
        assert_eq!(ssh.port("10.0.0.1"), 2222);
        assert_eq!(ssh.port("10.0.0.2"), 22);
        assert_eq!(ssh.port("10.0.0.2:2200"), 2200);
    }

    #[test]
    fn target_includes_user_and_brackets_ipv6() {
        let ssh = OpenSsh::new(SshOptions {
            user: Some("root".into()),
            ..Default::default()
        });
        assert_eq!(ssh.target("10.0.0.1:22"), "root@10.0.0.1");
        assert_eq!(ssh.target("fd00::1"), "root@[fd00::1]");
    }

    #[test]
    fn host_key_checking_defaults_to_accept_new() {
        let args = |options: SshOptions| -> Vec<String> {
            OpenSsh::new(options)
                .ssh_command("10.0.0.1", "true")
                .as_std()
                .get_args()
                .map(|a| a.to_string_lossy().into_owned())
                .collect()
        };
        assert!(args(SshOptions::default()).contains(&"StrictHostKeyChecking=accept-new".into()));
        let strict = SshOptions {
            host_key_checking: "strict".parse().unwrap(),
            ..Default::default()
        };
        assert!(args(strict).contains(&"StrictHostKeyChecking=yes".into()));
        assert!("sometimes".parse::<HostKeyChecking>().is_err());
    }

    #[test]
    fn remote_paths_are_quoted() {
        assert_eq!(
            mkdir_command(Path::new("kube dir;touch PWNED")),
            "mkdir -p -- 'kube dir;touch PWNED'"
        );
        assert_eq!(mkdir_command(Path::new(".kube")), "mkdir -p -- .kube");
        assert_eq!(
            scp_destination("root@10.0.0.1", Path::new("kube dir;touch PWNED/config")),
            "root@10.0.0.1:'kube dir;touch PWNED/config'"
        );
        assert_eq!(
            scp_destination("10.0.0.1", Path::new(".kube/config")),
            "10.0.0.1:.kube/config"
        );
    }

    #[tokio::test]
    async fn undecodable_output_is_read_to_the_end() {
        let mut raw = b"\xff\xfe\n".to_vec();
        for i in 0..20_000 {
            raw.extend_from_slice(format!("line {i}\n").as_bytes());
        }
        raw.extend_from_slice(b"done");

        let mut lines = Vec::new();
        drain_lines(raw.as_slice(), |l| lines.push(l.to_string()))
            .await
            .unwrap();
        assert_eq!(lines.len(), 20_002);
        assert_eq!(lines[0], "\u{fffd}\u{fffd}");
        assert_eq!(lines[1], "line 0");
        assert_eq!(lines.last().map(String::as_str), Some("done"));
    }

    #[test]
    fn output_lines_are_joined() {
        assert_eq!(join_output("Node-1\n", ""), "Node-1");
        assert_eq!(join_output("a\r\nb\n", ","), "a,b");
    }
}
