//! HA proxy sync engine
//!
//! Every worker runs lvscare as a static pod that balances the virtual IP
//! across the masters' API servers. On membership changes the full master
//! endpoint set is pushed to every worker again; there is no diffing.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{info, warn};

use super::KubeadmRuntime;
use crate::client::ClientFactory;
use crate::cluster::EndpointAddress;
use crate::{Error, Result, LVSCARE_STATIC_POD_NAME};

/// Per-worker outcomes of one sync, in completion order
#[derive(Debug, Default)]
pub struct SyncReport {
    outcomes: Vec<(String, Result<()>)>,
}

impl SyncReport {
    /// `(host, outcome)` pairs in the order tasks finished
    pub fn outcomes(&self) -> &[(String, Result<()>)] {
        &self.outcomes
    }

    /// Outcome for `host`, if it was part of the sync
    pub fn outcome(&self, host: &str) -> Option<&Result<()>> {
        self.outcomes
            .iter()
            .find(|(h, _)| h == host)
            .map(|(_, outcome)| outcome)
    }

    /// Hosts whose sync failed
    pub fn failed_hosts(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_err())
            .map(|(h, _)| h.as_str())
            .collect()
    }

    /// Whether every worker synced
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|(_, outcome)| outcome.is_ok())
    }

    /// First failure in completion order
    pub fn first_error(&self) -> Option<(&str, &Error)> {
        self.outcomes.iter().find_map(|(h, outcome)| match outcome {
            Err(e) => Some((h.as_str(), e)),
            Ok(()) => None,
        })
    }

    /// The first error to complete, or `Ok` when every worker synced.
    ///
    /// An error means at least one worker's proxy state is unknown, not
    /// that every worker failed.
    pub fn into_result(self) -> Result<()> {
        self.outcomes
            .into_iter()
            .find_map(|(_, outcome)| outcome.err())
            .map_or(Ok(()), Err)
    }
}

fn endpoints_display(endpoints: &[EndpointAddress]) -> String {
    endpoints
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

impl<F: ClientFactory> KubeadmRuntime<F> {
    /// Program IPVS on `host` to balance the VIP across `masters`, once
    pub async fn exec_ipvs(&self, host: &str, masters: &[EndpointAddress]) -> Result<()> {
        self.remote
            .apply_ipvs(host, &self.vip_and_port(), masters)
            .await
    }

    /// Remove the VIP's IPVS rules from `host`
    pub async fn exec_ipvs_clean(&self, host: &str) -> Result<()> {
        self.remote.clean_ipvs(host, &self.vip_and_port()).await
    }

    /// Write the lvscare static pod on `host` for `masters`
    pub async fn exec_ipvs_pod(&self, host: &str, masters: &[EndpointAddress]) -> Result<()> {
        self.remote
            .deploy_static_proxy_pod(
                host,
                &self.vip_and_port(),
                LVSCARE_STATIC_POD_NAME,
                self.proxy_image(),
                masters,
            )
            .await
    }

    /// Push the lvscare static pod for `master_ips` to every host in `node_ips`.
    ///
    /// All workers run concurrently and every task runs to completion. The
    /// first failure to complete is returned, tagged with its host.
    pub async fn sync_node_ipvs_yaml(
        &self,
        master_ips: &[String],
        node_ips: &[String],
    ) -> Result<()> {
        self.sync_node_ipvs_detailed(master_ips, node_ips)
            .await
            .into_result()
    }

    /// Like [`sync_node_ipvs_yaml`](Self::sync_node_ipvs_yaml), reporting every worker.
    pub async fn sync_node_ipvs_detailed(
        &self,
        master_ips: &[String],
        node_ips: &[String],
    ) -> SyncReport {
        let masters: Arc<Vec<EndpointAddress>> = Arc::new(
            master_ips
                .iter()
                .map(|m| EndpointAddress::new(m, self.config.api_server_port))
                .collect(),
        );
        let masters_display = endpoints_display(&masters);

        let mut tasks = FuturesUnordered::new();
        for node in node_ips {
            let remote = Arc::clone(&self.remote);
            let masters = Arc::clone(&masters);
            let vip = self.vip_and_port();
            let image = self.proxy_image().to_string();
            let host = node.clone();
            info!(node = %host, masters = %masters_display, "start to sync lvscare static pod");
            let handle = tokio::spawn(async move {
                let pod = LVSCARE_STATIC_POD_NAME;
                remote
                    .deploy_static_proxy_pod(&host, &vip, pod, &image, &masters)
                    .await
            });
            let node = node.clone();
            tasks.push(async move { (node, handle.await) });
        }

        let mut report = SyncReport::default();
        while let Some((node, joined)) = tasks.next().await {
            let outcome = match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    warn!(node = %node, error = %err, "update lvscare static pod failed");
                    Err(Error::proxy_sync(node.as_str(), err))
                }
                Err(join_err) => {
                    warn!(node = %node, error = %join_err, "lvscare sync task aborted");
                    Err(Error::TaskPanicked { host: node.clone() })
                }
            };
            report.outcomes.push((node, outcome));
        }
        report
    }

    /// Sync the lvscare static pod to every worker of the cluster
    pub async fn sync_worker_proxies(&self) -> Result<()> {
        self.sync_node_ipvs_yaml(&self.master_ip_list(), &self.node_ip_list())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::CountingFactory;
    use crate::cluster::tests::cluster;
    use crate::config::KubeadmSettings;
    use crate::paths::PathResolver;
    use crate::remote::{MockRemoteInterface, RemoteInterface};
    use crate::ssh::MockSshInterface;
    use crate::DEFAULT_VIP;
    use async_trait::async_trait;
    use secrecy::SecretString;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Barrier;
    use tokio::time::timeout;

    #[derive(Clone, Debug, PartialEq)]
    struct DeployCall {
        host: String,
        vip: String,
        pod_name: String,
        image: String,
        masters: Vec<String>,
    }

    /// Records static pod deployments; hosts in `failing` return an error.
    ///
    /// With a `barrier`, each deployment waits until all parties are in flight.
    #[derive(Default)]
    struct RecordingRemote {
        calls: Mutex<Vec<DeployCall>>,
        failing: Vec<String>,
        barrier: Option<Arc<Barrier>>,
    }

    #[async_trait]
    impl RemoteInterface for RecordingRemote {
        async fn apply_ipvs(
            &self,
            _: &str,
            _: &EndpointAddress,
            _: &[EndpointAddress],
        ) -> Result<()> {
            unimplemented!()
        }

        async fn clean_ipvs(&self, _: &str, _: &EndpointAddress) -> Result<()> {
            unimplemented!()
        }

        async fn deploy_static_proxy_pod(
            &self,
            host: &str,
            vip: &EndpointAddress,
            pod_name: &str,
            image: &str,
            masters: &[EndpointAddress],
        ) -> Result<()> {
            if let Some(barrier) = &self.barrier {
                if timeout(Duration::from_secs(5), barrier.wait()).await.is_err() {
                    return Err(Error::remote(host, "deployments did not overlap"));
                }
            }
            self.calls.lock().unwrap().push(DeployCall {
                host: host.to_string(),
                vip: vip.to_string(),
                pod_name: pod_name.to_string(),
                image: image.to_string(),
                masters: masters.iter().map(ToString::to_string).collect(),
            });
            if self.failing.iter().any(|h| h == host) {
                return Err(Error::remote(host, "read-only file system"));
            }
            Ok(())
        }

        async fn request_certificate(
            &self,
            _: &str,
            _: &[String],
            _: &str,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<()> {
            unimplemented!()
        }

        async fn request_token(&self, _: &str, _: &Path, _: &str) -> Result<SecretString> {
            unimplemented!()
        }

        async fn resolve_hostname(&self, _: &str) -> Result<String> {
            unimplemented!()
        }

        async fn add_hosts_entry(&self, _: &str, _: &str, _: &str) -> Result<()> {
            unimplemented!()
        }

        async fn remove_hosts_entry(&self, _: &str, _: &str) -> Result<()> {
            unimplemented!()
        }
    }

    fn runtime(
        spec: crate::cluster::ClusterSpec,
        remote: Arc<RecordingRemote>,
    ) -> KubeadmRuntime<CountingFactory> {
        KubeadmRuntime::with_client_factory(
            spec,
            &KubeadmSettings::default(),
            Arc::new(MockSshInterface::new()),
            remote,
            PathResolver::new("/root/.sealos/default"),
            CountingFactory::default(),
        )
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sync_deploys_once_per_worker_with_full_master_set() {
        let remote = Arc::new(RecordingRemote::default());
        let masters = strings(&["10.0.0.1", "10.0.0.2:22"]);
        let nodes = strings(&["10.0.0.10", "10.0.0.11", "10.0.0.12"]);
        let rt = runtime(cluster(&["10.0.0.1", "10.0.0.2:22"], &[]), Arc::clone(&remote));

        rt.sync_node_ipvs_yaml(&masters, &nodes).await.unwrap();

        let mut calls = remote.calls.lock().unwrap().clone();
        calls.sort_by(|a, b| a.host.cmp(&b.host));
        assert_eq!(calls.len(), 3);
        for (call, node) in calls.iter().zip(&nodes) {
            assert_eq!(&call.host, node);
            assert_eq!(call.vip, format!("{DEFAULT_VIP}:6443"));
            assert_eq!(call.pod_name, LVSCARE_STATIC_POD_NAME);
            assert_eq!(call.image, crate::DEFAULT_LVSCARE_IMAGE);
            assert_eq!(call.masters, vec!["10.0.0.1:6443", "10.0.0.2:6443"]);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_failing_worker_does_not_stop_the_others() {
        let remote = Arc::new(RecordingRemote {
            failing: strings(&["10.0.0.11"]),
            ..Default::default()
        });
        let nodes = strings(&["10.0.0.10", "10.0.0.11", "10.0.0.12"]);
        let rt = runtime(cluster(&["10.0.0.1"], &[]), Arc::clone(&remote));

        let err = rt
            .sync_node_ipvs_yaml(&strings(&["10.0.0.1"]), &nodes)
            .await
            .unwrap_err();
        assert_eq!(err.host(), Some("10.0.0.11"));
        assert!(err.to_string().contains("10.0.0.11"));

        let called: Vec<String> = remote
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.host.clone())
            .collect();
        assert_eq!(called.len(), 3);
        assert!(called.contains(&"10.0.0.10".to_string()));
        assert!(called.contains(&"10.0.0.12".to_string()));
    }

    #[tokio::test]
    async fn detailed_report_lists_every_worker() {
        let remote = Arc::new(RecordingRemote {
            failing: strings(&["10.0.0.11", "10.0.0.12"]),
            ..Default::default()
        });
        let nodes = strings(&["10.0.0.10", "10.0.0.11", "10.0.0.12"]);
        let rt = runtime(cluster(&["10.0.0.1"], &[]), Arc::clone(&remote));

        let report = rt
            .sync_node_ipvs_detailed(&strings(&["10.0.0.1"]), &nodes)
            .await;
        assert!(!report.is_success());
        assert_eq!(report.outcomes().len(), 3);
        assert!(matches!(report.outcome("10.0.0.10"), Some(Ok(()))));
        let mut failed = report.failed_hosts();
        failed.sort();
        assert_eq!(failed, vec!["10.0.0.11", "10.0.0.12"]);
        let (host, _) = report.first_error().unwrap();
        assert!(host == "10.0.0.11" || host == "10.0.0.12");
        assert!(report.into_result().is_err());
    }

    #[tokio::test]
    async fn sync_with_no_workers_is_a_no_op() {
        let remote = Arc::new(RecordingRemote::default());
        let rt = runtime(cluster(&["10.0.0.1"], &[]), Arc::clone(&remote));
        rt.sync_worker_proxies().await.unwrap();
        assert!(remote.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_worker_proxies_uses_cluster_membership() {
        let remote = Arc::new(RecordingRemote::default());
        let rt = runtime(
            cluster(&["10.0.0.1", "10.0.0.2"], &["10.0.0.10:2222"]),
            Arc::clone(&remote),
        );
        rt.sync_worker_proxies().await.unwrap();
        let calls = remote.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].host, "10.0.0.10");
        assert_eq!(calls[0].masters, vec!["10.0.0.1:6443", "10.0.0.2:6443"]);
    }

    #[tokio::test]
    async fn every_worker_deploy_is_in_flight_at_once() {
        let nodes = strings(&["10.0.0.10", "10.0.0.11", "10.0.0.12", "10.0.0.13"]);
        let remote = Arc::new(RecordingRemote {
            barrier: Some(Arc::new(Barrier::new(nodes.len()))),
            ..Default::default()
        });
        let rt = runtime(cluster(&["10.0.0.1"], &[]), Arc::clone(&remote));

        rt.sync_node_ipvs_yaml(&strings(&["10.0.0.1"]), &nodes)
            .await
            .unwrap();
        assert_eq!(remote.calls.lock().unwrap().len(), nodes.len());
    }

    #[tokio::test]
    async fn single_host_pod_deploy_uses_given_masters() {
        let remote = Arc::new(RecordingRemote::default());
        let mut spec = cluster(&["10.0.0.1"], &["10.0.0.10"]);
        spec.image
            .labels
            .insert("image".to_string(), "sealos.hub:5000/labring/lvscare:v4.3.0".to_string());
        let rt = runtime(spec, Arc::clone(&remote));
        let masters = vec![EndpointAddress::new("10.0.0.5", 6443)];
        rt.exec_ipvs_pod("10.0.0.10", &masters).await.unwrap();

        let calls = remote.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].image, "sealos.hub:5000/labring/lvscare:v4.3.0");
        assert_eq!(calls[0].masters, vec!["10.0.0.5:6443"]);
    }

    #[tokio::test]
    async fn apply_and_clean_target_the_vip() {
        let vip = format!("{DEFAULT_VIP}:6443");
        let mut remote = MockRemoteInterface::new();
        let expected = vip.clone();
        remote
            .expect_apply_ipvs()
            .withf(move |host, vip, masters| {
                host == "10.0.0.10"
                    && vip.to_string() == expected
                    && masters.len() == 1
                    && masters[0].to_string() == "10.0.0.1:6443"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let expected = vip.clone();
        remote
            .expect_clean_ipvs()
            .withf(move |host, vip| host == "10.0.0.10" && vip.to_string() == expected)
            .times(1)
            .returning(|_, _| Ok(()));
        let rt = crate::runtime::tests::runtime_with(
            cluster(&["10.0.0.1"], &["10.0.0.10"]),
            MockSshInterface::new(),
            remote,
        );
        let masters = rt.master_ip_list_and_https_port();
        rt.exec_ipvs("10.0.0.10", &masters).await.unwrap();
        rt.exec_ipvs_clean("10.0.0.10").await.unwrap();
    }
}
