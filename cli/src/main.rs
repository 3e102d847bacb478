use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kubeadm_runtime::cluster::ClusterSpec;
use kubeadm_runtime::config::KubeadmSettings;
use kubeadm_runtime::paths::PathResolver;
use kubeadm_runtime::remote::{SealctlRemote, DEFAULT_SEALCTL};
use kubeadm_runtime::ssh::{HostKeyChecking, OpenSsh, SshOptions};
use kubeadm_runtime::KubeadmRuntime;

/// Bootstrap and maintain a kubeadm control plane over SSH
#[derive(Parser, Debug)]
#[command(name = "kubeadm-runtime", version, about, long_about = None)]
struct Cli {
    /// Cluster file describing hosts, roles and the rootfs image
    #[arg(short = 'f', long, env = "KUBEADM_RUNTIME_CLUSTERFILE")]
    cluster_file: PathBuf,

    /// Optional kubeadm settings file (ports, CIDRs, extra SANs)
    #[arg(long, env = "KUBEADM_RUNTIME_SETTINGS")]
    settings: Option<PathBuf>,

    /// Cluster data directory; defaults to $HOME/.sealos/<cluster>
    #[arg(long, env = "KUBEADM_RUNTIME_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// SSH login user
    #[arg(long, env = "KUBEADM_RUNTIME_SSH_USER")]
    ssh_user: Option<String>,

    /// SSH private key
    #[arg(long, env = "KUBEADM_RUNTIME_SSH_KEY")]
    ssh_key: Option<PathBuf>,

    /// Host key policy: strict, accept-new or off
    #[arg(long, env = "KUBEADM_RUNTIME_SSH_HOST_KEY_CHECKING", default_value = "accept-new")]
    ssh_host_key_checking: HostKeyChecking,

    /// sealctl binary on the nodes
    #[arg(long, default_value = DEFAULT_SEALCTL)]
    sealctl: String,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Push the lvscare static pod to every worker
    SyncProxy,

    /// Program IPVS rules for the virtual IP on one host
    ApplyProxy {
        #[arg(long)]
        host: String,
    },

    /// Remove the virtual IP's IPVS rules from one host
    CleanProxy {
        #[arg(long)]
        host: String,
    },

    /// Generate API server certificates on every master
    Certs,

    /// Issue a join token and print it
    Token {
        /// Host to issue the token on; master0 when unset
        #[arg(long)]
        host: Option<String>,

        /// Certificate key, for control-plane joins
        #[arg(long)]
        certificate_key: Option<String>,
    },

    /// Manage /etc/hosts entries
    #[command(subcommand)]
    Hosts(HostsCommand),

    /// Install the admin kubeconfig on master0 and copy it to all other hosts
    Kubeconfig,

    /// List registered nodes through the API server
    Nodes,

    /// Print the Kubernetes version of the cluster and of the image
    Version,
}

#[derive(Subcommand, Debug)]
enum HostsCommand {
    /// Map a domain to an IP on a host
    Add {
        #[arg(long)]
        host: String,
        #[arg(long)]
        ip: String,
        #[arg(long)]
        domain: String,
    },
    /// Remove a domain from a host
    Delete {
        #[arg(long)]
        host: String,
        #[arg(long)]
        domain: String,
    },
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn build_runtime(cli: &Cli) -> anyhow::Result<KubeadmRuntime> {
    let cluster = ClusterSpec::load(&cli.cluster_file)
        .with_context(|| format!("loading cluster file {}", cli.cluster_file.display()))?;
    let settings = match &cli.settings {
        Some(path) => KubeadmSettings::load(path)
            .with_context(|| format!("loading settings {}", path.display()))?,
        None => KubeadmSettings::default(),
    };
    let paths = match &cli.data_dir {
        Some(dir) => PathResolver::new(dir),
        None => {
            let home = std::env::var_os("HOME").context("HOME is not set")?;
            PathResolver::for_cluster(&PathBuf::from(home), &cluster.name)
        }
    };

    let ssh = Arc::new(OpenSsh::for_cluster(
        &cluster,
        SshOptions {
            user: cli.ssh_user.clone(),
            identity_file: cli.ssh_key.clone(),
            host_key_checking: cli.ssh_host_key_checking,
        },
    ));
    let remote = Arc::new(SealctlRemote::with_binary(ssh.clone(), cli.sealctl.clone()));
    Ok(KubeadmRuntime::new(cluster, &settings, ssh, remote, paths))
}

async fn issue_certs(rt: &KubeadmRuntime) -> anyhow::Result<()> {
    let mut failed = Vec::new();
    for master in rt.master_ip_list() {
        if let Err(e) = rt.exec_cert(&master).await {
            error!(host = %master, error = %e, "certificate generation failed");
            failed.push(master);
        }
    }
    if !failed.is_empty() {
        bail!("certificate generation failed on {}", failed.join(", "));
    }
    Ok(())
}

async fn propagate_kubeconfig(rt: &KubeadmRuntime) -> anyhow::Result<()> {
    let master0 = rt.master0_ip()?;
    rt.copy_master_kube_config(&master0)
        .await
        .context("installing kubeconfig on master0")?;

    let others: Vec<String> = rt
        .master_ip_list()
        .into_iter()
        .skip(1)
        .chain(rt.node_ip_list())
        .collect();
    rt.copy_kube_config_file_to_nodes(&others)
        .await
        .context("copying kubeconfig to hosts")?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let rt = build_runtime(&cli)?;

    match cli.command {
        Commands::SyncProxy => {
            rt.sync_worker_proxies()
                .await
                .context("syncing lvscare static pods")?;
            info!("lvscare static pods synced");
        }
        Commands::ApplyProxy { host } => {
            let masters = rt.master_ip_list_and_https_port();
            rt.exec_ipvs(&host, &masters).await?;
        }
        Commands::CleanProxy { host } => rt.exec_ipvs_clean(&host).await?,
        Commands::Certs => issue_certs(&rt).await?,
        Commands::Token {
            host,
            certificate_key,
        } => {
            let host = match host {
                Some(host) => host,
                None => rt.master0_ip()?,
            };
            let token = rt.exec_token(&host, certificate_key.as_deref()).await?;
            println!("{}", token.expose_secret());
        }
        Commands::Hosts(HostsCommand::Add { host, ip, domain }) => {
            rt.exec_hosts_append(&host, &ip, &domain).await?
        }
        Commands::Hosts(HostsCommand::Delete { host, domain }) => {
            rt.exec_hosts_delete(&host, &domain).await?
        }
        Commands::Kubeconfig => propagate_kubeconfig(&rt).await?,
        Commands::Nodes => {
            let nodes = rt
                .kube_expansion()
                .await
                .context("connecting to the API server")?
                .list_node_names()
                .await?;
            for node in nodes {
                println!("{node}");
            }
        }
        Commands::Version => {
            let cluster = rt
                .kube_version()
                .await
                .context("reading kubeadm-config")?;
            println!("cluster: {}", cluster.as_deref().unwrap_or("unknown"));
            println!("image: {}", rt.kube_version_from_image().unwrap_or("unknown"));
        }
    }

    Ok(())
}
