use std::{collections::HashSet, sync::Arc, time::Duration};

use tokio::time::Instant;

use rand::seq::IndexedRandom;
use tracing::warn;

use crate::{
    error::Result,
    options::{ClientOptions, ServerAddress},
    runtime,
    sdam::{
        description::topology::TopologyType,
        topology::{TopologyUpdater, TopologyWatcher},
    },
    srv::LookupHosts,
    trace::SRV_POLLING_TRACING_EVENT_TARGET,
};

#[cfg(feature = "dns-resolver")]
use crate::srv::SrvResolver;

const MIN_RESCAN_SRV_INTERVAL: Duration = Duration::from_secs(60);

/// Background task that periodically re-resolves the SRV records a seedlist came from and syncs
/// the topology's hosts to them. Only active while the topology is Sharded or Unknown.
pub(crate) struct SrvPollingMonitor {
    initial_hostname: String,
    rescan_interval: Duration,
    last_rescan: Option<Instant>,
    client_options: Arc<ClientOptions>,
    topology_updater: TopologyUpdater,
    topology_watcher: TopologyWatcher,

    #[cfg(feature = "dns-resolver")]
    resolver: Option<SrvResolver>,
}

impl SrvPollingMonitor {
    /// Creates a monitor for the topology, or `None` when the topology was not seeded from an
    /// SRV lookup.
    pub(crate) fn new(
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        client_options: Arc<ClientOptions>,
    ) -> Option<Self> {
        let info = match client_options.srv_seedlist_info {
            Some(ref info) => info.clone(),
            None => return None,
        };

        Some(Self {
            initial_hostname: info.hostname,
            rescan_interval: info.min_ttl.max(MIN_RESCAN_SRV_INTERVAL),
            last_rescan: None,
            client_options,
            topology_updater,
            topology_watcher,

            #[cfg(feature = "dns-resolver")]
            resolver: None,
        })
    }

    pub(crate) fn start(
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        client_options: Arc<ClientOptions>,
    ) {
        if let Some(monitor) = Self::new(topology_updater, topology_watcher, client_options) {
            runtime::spawn(monitor.execute());
        }
    }

    async fn execute(mut self) {
        while self.topology_watcher.is_alive() {
            tokio::time::sleep(self.rescan_interval).await;

            if !self.topology_is_pollable() {
                // The deployment turned out not to be sharded; polling is permanently over.
                return;
            }

            self.rescan().await;
        }
    }

    fn topology_is_pollable(&self) -> bool {
        matches!(
            self.topology_watcher.latest().topology_type(),
            TopologyType::Sharded | TopologyType::Unknown
        )
    }

    /// Re-resolves the records and syncs the hosts if the rescan interval has elapsed since the
    /// last attempt. Used by on-demand scanning, where no polling task is running.
    pub(crate) async fn rescan_if_due(&mut self) {
        let due = self
            .last_rescan
            .map_or(true, |last| last.elapsed() >= self.rescan_interval);
        if due && self.topology_is_pollable() {
            self.rescan().await;
        }
    }

    async fn rescan(&mut self) {
        self.last_rescan = Some(Instant::now());

        match self.lookup_hosts().await {
            Ok(lookup) => self.update_hosts(lookup).await,
            Err(error) => {
                // Failed lookups leave the topology untouched and get retried at the
                // heartbeat frequency rather than the record TTL.
                self.rescan_interval = self
                    .topology_watcher
                    .latest()
                    .heartbeat_frequency()
                    .max(MIN_RESCAN_SRV_INTERVAL);
                warn!(
                    target: SRV_POLLING_TRACING_EVENT_TARGET,
                    hostname = %self.initial_hostname,
                    error = %error,
                    "SRV lookup failed"
                );
            }
        }
    }

    async fn update_hosts(&mut self, lookup: LookupHosts) {
        self.rescan_interval = lookup.min_ttl.max(MIN_RESCAN_SRV_INTERVAL);

        let mut hosts = lookup.hosts;
        let max_hosts = self.client_options.srv_max_hosts.unwrap_or(0) as usize;

        if max_hosts > 0 && hosts.len() > max_hosts {
            // Prefer hosts already being monitored so an unchanged DNS answer doesn't churn
            // the topology, then fill the remainder randomly.
            let current: HashSet<ServerAddress> = self
                .topology_watcher
                .latest()
                .server_addresses()
                .cloned()
                .collect();

            let (mut selected, new_hosts): (Vec<_>, Vec<_>) = hosts
                .drain(..)
                .partition(|host| current.contains(host));
            selected.truncate(max_hosts);
            let remaining = max_hosts - selected.len();
            selected.extend(
                new_hosts
                    .choose_multiple(&mut rand::rng(), remaining)
                    .cloned(),
            );
            hosts = selected;
        }

        self.topology_updater
            .sync_hosts(hosts.into_iter().collect())
            .await;
    }

    async fn lookup_hosts(&mut self) -> Result<LookupHosts> {
        #[cfg(test)]
        if let Some(mock) = self
            .client_options
            .test_options
            .as_ref()
            .and_then(|to| to.mock_lookup_hosts.as_ref())
        {
            return Ok(mock.clone());
        }

        #[cfg(feature = "dns-resolver")]
        {
            let resolver = match self.resolver {
                Some(ref resolver) => resolver,
                None => {
                    let resolver =
                        SrvResolver::new(self.client_options.srv_service_name.clone())?;
                    self.resolver.get_or_insert(resolver)
                }
            };
            resolver.get_srv_hosts(self.initial_hostname.as_str()).await
        }

        #[cfg(not(feature = "dns-resolver"))]
        {
            Err(crate::error::Error::internal(
                "SRV polling requires the dns-resolver feature",
            ))
        }
    }
}
