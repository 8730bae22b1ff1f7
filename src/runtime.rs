//! High-level runtime for a directory silo (Layer 7)
//!
//! Wires the partition, federation view, registrars, endpoint and
//! reconciliation agent of one silo together, and exposes the calls the
//! activation lifecycle makes: register, unregister, delete and cache
//! invalidation.

use crate::config::DirectoryConfig;
use crate::directory::partition::{ActivationEntry, DirectoryPartition, InMemoryDirectoryPartition};
use crate::directory::ring::ConsistentHashRing;
use crate::directory::types::{
    ActivationAddress, DirectoryEntryStatus, GrainId, HostId, UnregistrationCause,
};
use crate::errors::DirectoryError;
use crate::federation::{InMemoryMultiClusterOracle, MultiClusterConfiguration, MultiClusterOracle};
use crate::gsi::endpoint::{ClusterGrainDirectory, EndpointOptions};
use crate::gsi::maintainer::{
    ActivationCatalog, ActivationMaintainer, ChannelActivationCatalog, DeactivationRequest,
};
use crate::gsi::registrar::{
    ClusterLocalRegistrar, GlobalSingleInstanceRegistrar, GsiOptions, RegistrationStrategy,
};
use crate::gsi::registrar_manager::RegistrarManager;
use crate::transport::{
    DirectoryClient, DirectoryService, HttpDirectoryClient, HttpDirectoryServer, InProcessNetwork,
};
use slog::{error, info, Logger};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Build the federation view described by a configuration.
///
/// The default multi-cluster becomes the initial configuration and the
/// static gateways are installed.
pub fn oracle_from_config(config: &DirectoryConfig) -> InMemoryMultiClusterOracle {
    let options = &config.multi_cluster;
    let initial = (!options.default_multi_cluster.is_empty()).then(|| {
        MultiClusterConfiguration::new(options.default_multi_cluster.iter().cloned())
            .with_comment("default multi-cluster")
    });
    let oracle = InMemoryMultiClusterOracle::new(initial);
    for (cluster, gateways) in &options.gateways {
        oracle.set_gateways(cluster.clone(), gateways.clone());
    }
    oracle
}

/// A running directory silo.
///
/// # Example
///
/// ```no_run
/// use geodirectory::config::DirectoryConfig;
/// use geodirectory::runtime::{oracle_from_config, DirectoryRuntime};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = DirectoryConfig::new("us-east", "127.0.0.1:11111")
///         .with_multi_cluster(vec!["us-east".into(), "eu-west".into()]);
///     let oracle = Arc::new(oracle_from_config(&config));
///     let runtime = DirectoryRuntime::with_http(config, oracle, geodirectory::logging::discard_logger())?;
///     runtime.start_http().await?;
///
///     tokio::signal::ctrl_c().await?;
///     runtime.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct DirectoryRuntime {
    config: DirectoryConfig,
    ring: Arc<ConsistentHashRing>,
    partition: Arc<InMemoryDirectoryPartition>,
    manager: RegistrarManager,
    endpoint: Arc<ClusterGrainDirectory>,
    maintainer: Option<Arc<ActivationMaintainer>>,
    deactivations: Mutex<Option<mpsc::UnboundedReceiver<DeactivationRequest>>>,
    shutdown: CancellationToken,
    http_task: Mutex<Option<JoinHandle<()>>>,
    logger: Logger,
}

impl DirectoryRuntime {
    /// Build a silo and start its reconciliation agent.
    ///
    /// Must be called inside a tokio runtime when the multi-cluster network
    /// is enabled.
    ///
    /// # Arguments
    /// * `config` - Silo configuration, validated here
    /// * `oracle` - Federation view
    /// * `client` - Transport used to reach other silos and clusters
    /// * `logger` - Root logger
    pub fn new(
        config: DirectoryConfig,
        oracle: Arc<dyn MultiClusterOracle>,
        client: Arc<dyn DirectoryClient>,
        logger: Logger,
    ) -> Result<Self, DirectoryError> {
        config
            .validate()
            .map_err(|e| DirectoryError::InvalidConfiguration(e.to_string()))?;

        let (catalog, deactivations) = ChannelActivationCatalog::new();
        Self::with_catalog(config, oracle, client, Arc::new(catalog), Some(deactivations), logger)
    }

    /// Build a silo that reaches other silos over HTTP.
    pub fn with_http(
        config: DirectoryConfig,
        oracle: Arc<dyn MultiClusterOracle>,
        logger: Logger,
    ) -> Result<Self, DirectoryError> {
        let client = HttpDirectoryClient::new(config.request_timeout, logger.clone())?;
        Self::new(config, oracle, Arc::new(client), logger)
    }

    /// Build a silo that hands losing activations to `catalog`.
    pub fn with_activation_catalog(
        config: DirectoryConfig,
        oracle: Arc<dyn MultiClusterOracle>,
        client: Arc<dyn DirectoryClient>,
        catalog: Arc<dyn ActivationCatalog>,
        logger: Logger,
    ) -> Result<Self, DirectoryError> {
        config
            .validate()
            .map_err(|e| DirectoryError::InvalidConfiguration(e.to_string()))?;
        Self::with_catalog(config, oracle, client, catalog, None, logger)
    }

    fn with_catalog(
        config: DirectoryConfig,
        oracle: Arc<dyn MultiClusterOracle>,
        client: Arc<dyn DirectoryClient>,
        catalog: Arc<dyn ActivationCatalog>,
        deactivations: Option<mpsc::UnboundedReceiver<DeactivationRequest>>,
        logger: Logger,
    ) -> Result<Self, DirectoryError> {
        let logger = logger.new(slog::o!(
            "cluster" => config.cluster_id.to_string(),
            "silo" => config.silo_address.to_string()
        ));

        let ring = Arc::new(ConsistentHashRing::with_hosts(
            config.silo_address.clone(),
            config.cluster_silos.iter().cloned(),
        ));
        let partition = Arc::new(InMemoryDirectoryPartition::new(config.lazy_deregistration_delay));
        let shared_partition: Arc<dyn DirectoryPartition> = partition.clone();

        let gsi = Arc::new(GlobalSingleInstanceRegistrar::new(
            config.cluster_id.clone(),
            shared_partition.clone(),
            oracle.clone(),
            client.clone(),
            GsiOptions::from(&config),
            logger.clone(),
        ));
        let local = Arc::new(ClusterLocalRegistrar::new(shared_partition.clone()));

        let manager = RegistrarManager::new(config.default_strategy())
            .with_registrar(RegistrationStrategy::GlobalSingleInstance, gsi.clone())
            .with_registrar(RegistrationStrategy::ClusterLocal, local);
        for (grain_type, strategy) in &config.grain_strategies {
            manager.set_strategy(grain_type.clone(), *strategy);
        }

        let endpoint = Arc::new(ClusterGrainDirectory::new(
            config.cluster_id.clone(),
            ring.clone(),
            shared_partition.clone(),
            oracle.clone(),
            client,
            gsi.clone(),
            EndpointOptions::from(&config),
            logger.clone(),
        ));

        let maintainer = if config.multi_cluster.has_multi_cluster_network {
            let maintainer = Arc::new(ActivationMaintainer::new(
                gsi,
                shared_partition,
                oracle,
                catalog,
                config.multi_cluster.global_single_instance_retry_interval,
                logger.clone(),
            ));
            maintainer.start();
            Some(maintainer)
        } else {
            None
        };

        info!(logger, "Directory runtime started";
            "multi_cluster" => config.multi_cluster.has_multi_cluster_network,
            "silos" => ring.hosts().len()
        );

        Ok(Self {
            config,
            ring,
            partition,
            manager,
            endpoint,
            maintainer,
            deactivations: Mutex::new(deactivations),
            shutdown: CancellationToken::new(),
            http_task: Mutex::new(None),
            logger,
        })
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    /// Endpoint answering requests from other silos and clusters.
    pub fn endpoint(&self) -> Arc<ClusterGrainDirectory> {
        self.endpoint.clone()
    }

    /// Endpoint as a transport-facing service.
    pub fn service(&self) -> Arc<dyn DirectoryService> {
        self.endpoint.clone()
    }

    pub fn maintainer(&self) -> Option<&Arc<ActivationMaintainer>> {
        self.maintainer.as_ref()
    }

    pub fn registrar_manager(&self) -> &RegistrarManager {
        &self.manager
    }

    /// Make this silo reachable on an in-process network.
    pub fn join_network(&self, network: &InProcessNetwork) {
        network.register_host(self.config.silo_address.clone(), &self.service());
    }

    /// Receiver of deactivation requests for activations that lost ownership.
    ///
    /// Available once, and only when no custom catalog was supplied.
    pub fn take_deactivation_requests(&self) -> Option<mpsc::UnboundedReceiver<DeactivationRequest>> {
        self.deactivations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Serve the endpoint over HTTP on the configured listen address.
    ///
    /// Returns the bound address (useful with port 0).
    pub async fn start_http(&self) -> Result<SocketAddr, DirectoryError> {
        let listener = tokio::net::TcpListener::bind(&self.config.listen_address)
            .await
            .map_err(|e| {
                DirectoryError::InvalidConfiguration(format!(
                    "failed to bind {}: {}",
                    self.config.listen_address, e
                ))
            })?;
        let address = listener
            .local_addr()
            .map_err(|e| DirectoryError::InvalidConfiguration(e.to_string()))?;

        let server = HttpDirectoryServer::new(
            self.service(),
            self.config.cluster_id.clone(),
            self.config.silo_address.clone(),
            self.logger.clone(),
        );
        let shutdown = self.shutdown.child_token();
        let logger = self.logger.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = server.serve(listener, shutdown).await {
                error!(logger, "HTTP directory server failed"; "error" => %e);
            }
        });
        *self.http_task.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);

        Ok(address)
    }

    fn ensure_running(&self) -> Result<(), DirectoryError> {
        if self.shutdown.is_cancelled() {
            return Err(DirectoryError::Stopping);
        }
        Ok(())
    }

    fn ensure_partition_owner(&self, grain: &GrainId) -> Result<(), DirectoryError> {
        if self.ring.is_local_owner(grain) {
            return Ok(());
        }
        Err(DirectoryError::NotPartitionOwner {
            grain: grain.clone(),
            silo: self.ring.local_host().clone(),
            owner: self.ring.owner_of(grain),
        })
    }

    /// A silo joined this cluster; it takes over part of the directory partitions.
    pub fn add_silo(&self, silo: HostId) {
        if self.ring.add_host(silo.clone()) {
            info!(self.logger, "Silo joined the cluster"; "joined" => %silo, "silos" => self.ring.hosts().len());
        }
    }

    /// A silo left this cluster; its partitions move to the remaining silos.
    pub fn remove_silo(&self, silo: &HostId) {
        if self.ring.remove_host(silo) {
            info!(self.logger, "Silo left the cluster"; "left" => %silo, "silos" => self.ring.hosts().len());
        }
    }

    /// Silos currently sharing this cluster's directory.
    pub fn silos(&self) -> Vec<HostId> {
        self.ring.hosts()
    }

    /// Register an activation, returning the address callers should use.
    ///
    /// The result is a remote address when another cluster owns the grain.
    pub async fn register(
        &self,
        address: ActivationAddress,
        single_activation: bool,
    ) -> Result<ActivationAddress, DirectoryError> {
        self.ensure_running()?;
        self.ensure_partition_owner(&address.grain)?;
        let registrar = self.manager.registrar_for(address.grain.type_name())?;
        registrar.register(address, single_activation).await
    }

    pub async fn unregister(
        &self,
        addresses: Vec<ActivationAddress>,
        cause: UnregistrationCause,
    ) -> Result<(), DirectoryError> {
        self.ensure_running()?;
        let mut by_strategy: HashMap<RegistrationStrategy, Vec<ActivationAddress>> = HashMap::new();
        for address in addresses {
            by_strategy
                .entry(self.manager.strategy_for(address.grain.type_name()))
                .or_default()
                .push(address);
        }
        for (_, addresses) in by_strategy {
            let registrar = self.manager.registrar_for(addresses[0].grain.type_name())?;
            registrar.unregister(addresses, cause).await?;
        }
        Ok(())
    }

    pub async fn delete(&self, grain: GrainId) -> Result<(), DirectoryError> {
        self.ensure_running()?;
        let registrar = self.manager.registrar_for(grain.type_name())?;
        registrar.delete(grain).await
    }

    pub fn invalidate_cache(&self, address: &ActivationAddress) -> Result<(), DirectoryError> {
        let registrar = self.manager.registrar_for(address.grain.type_name())?;
        registrar.invalidate_cache(address);
        Ok(())
    }

    /// Local directory entry of a grain.
    pub fn lookup(&self, grain: &GrainId) -> Option<ActivationEntry> {
        self.partition.try_get_activation(grain)
    }

    /// Grains whose local entry is in `status`.
    pub fn grains_with_status(&self, status: DirectoryEntryStatus) -> Vec<GrainId> {
        self.partition.grains_with_status(status)
    }

    /// Stop the agent and the HTTP server.
    pub async fn shutdown(&self) {
        info!(self.logger, "Shutting down directory runtime");
        self.shutdown.cancel();

        if let Some(maintainer) = &self.maintainer {
            maintainer.stop().await;
        }

        let http = self
            .http_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = http {
            if let Err(e) = handle.await {
                error!(self.logger, "HTTP server task failed"; "error" => %e);
            }
        }
        info!(self.logger, "Directory runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::types::ClusterId;
    use crate::transport::InProcessDirectoryClient;

    fn runtime(config: DirectoryConfig, network: &Arc<InProcessNetwork>) -> DirectoryRuntime {
        let oracle = Arc::new(oracle_from_config(&config));
        let client = Arc::new(InProcessDirectoryClient::new(network.clone()));
        let runtime =
            DirectoryRuntime::new(config, oracle, client, crate::logging::discard_logger()).unwrap();
        runtime.join_network(network);
        runtime
    }

    #[tokio::test]
    async fn test_single_cluster_registration() {
        let network = Arc::new(InProcessNetwork::new());
        let runtime = runtime(DirectoryConfig::new("A", "a:1"), &network);
        assert!(runtime.maintainer().is_none());

        let address = ActivationAddress::new_activation(GrainId::new("Player", "1"), HostId::new("a:1"));
        let result = runtime.register(address.clone(), true).await.unwrap();
        assert_eq!(result, address);
        assert_eq!(
            runtime.lookup(&address.grain).map(|e| e.status),
            Some(DirectoryEntryStatus::Owned)
        );
        assert_eq!(network.request_count(), 0);

        runtime
            .unregister(vec![address.clone()], UnregistrationCause::Force)
            .await
            .unwrap();
        assert!(runtime.lookup(&address.grain).is_none());
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_strategy_selection() {
        let network = Arc::new(InProcessNetwork::new());
        let config = DirectoryConfig::new("A", "a:1")
            .with_multi_cluster(vec![ClusterId::new("A")])
            .with_grain_strategy("Session", RegistrationStrategy::ClusterLocal);
        let runtime = runtime(config, &network);

        let session = ActivationAddress::new_activation(GrainId::new("Session", "1"), HostId::new("a:1"));
        let player = ActivationAddress::new_activation(GrainId::new("Player", "1"), HostId::new("a:1"));
        runtime.register(session.clone(), false).await.unwrap();
        runtime.register(player.clone(), true).await.unwrap();

        assert_eq!(
            runtime.grains_with_status(DirectoryEntryStatus::ClusterLocal),
            vec![session.grain.clone()]
        );
        assert_eq!(
            runtime.grains_with_status(DirectoryEntryStatus::Owned),
            vec![player.grain.clone()]
        );

        let err = runtime.register(player, false).await.unwrap_err();
        assert!(matches!(err, DirectoryError::MultipleActivationsUnsupported { .. }));
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_requires_partition_ownership() {
        let network = Arc::new(InProcessNetwork::new());
        let config = DirectoryConfig::new("A", "a:1").with_cluster_silos(vec![HostId::new("a:2")]);
        let runtime = runtime(config, &network);

        let ring = ConsistentHashRing::with_hosts(HostId::new("a:1"), [HostId::new("a:2")]);
        let grain = (0..)
            .map(|key: u32| GrainId::new("Player", key.to_string()))
            .find(|g| ring.owner_of(g) == HostId::new("a:2"))
            .unwrap();

        let err = runtime
            .register(ActivationAddress::new_activation(grain, HostId::new("a:1")), true)
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::NotPartitionOwner { .. }));
    }

    #[tokio::test]
    async fn test_silo_membership_moves_partitions() {
        let network = Arc::new(InProcessNetwork::new());
        let runtime = runtime(DirectoryConfig::new("A", "a:1"), &network);
        let ring = ConsistentHashRing::with_hosts(HostId::new("a:1"), [HostId::new("a:2")]);
        let grain = (0..)
            .map(|key: u32| GrainId::new("Player", key.to_string()))
            .find(|g| ring.owner_of(g) == HostId::new("a:2"))
            .unwrap();

        runtime.add_silo(HostId::new("a:2"));
        assert_eq!(runtime.silos().len(), 2);
        let err = runtime
            .register(ActivationAddress::new_activation(grain.clone(), HostId::new("a:1")), true)
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::NotPartitionOwner { ref owner, .. } if owner == &HostId::new("a:2")));

        // The local silo never leaves its own ring.
        runtime.remove_silo(&HostId::new("a:1"));
        runtime.remove_silo(&HostId::new("a:2"));
        assert_eq!(runtime.silos(), vec![HostId::new("a:1")]);
        let address = ActivationAddress::new_activation(grain, HostId::new("a:1"));
        assert_eq!(runtime.register(address.clone(), true).await.unwrap(), address);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_configuration_fails_fast() {
        let network = Arc::new(InProcessNetwork::new());
        let config = DirectoryConfig::new("A,B", "a:1");
        let oracle = Arc::new(oracle_from_config(&config));
        let client = Arc::new(InProcessDirectoryClient::new(network));
        let result = DirectoryRuntime::new(config, oracle, client, crate::logging::discard_logger());
        assert!(matches!(result, Err(DirectoryError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_stopped_runtime_rejects_registrations() {
        let network = Arc::new(InProcessNetwork::new());
        let runtime = runtime(
            DirectoryConfig::new("A", "a:1").with_multi_cluster(vec![ClusterId::new("A")]),
            &network,
        );
        runtime.shutdown().await;

        let address = ActivationAddress::new_activation(GrainId::new("Player", "1"), HostId::new("a:1"));
        let err = runtime.register(address, true).await.unwrap_err();
        assert!(matches!(err, DirectoryError::Stopping));
    }

    #[test]
    fn test_oracle_from_config() {
        let config = DirectoryConfig::new("A", "a:1")
            .with_multi_cluster(vec![ClusterId::new("A"), ClusterId::new("B")])
            .with_gateway(ClusterId::new("B"), HostId::new("b:1"));
        let oracle = oracle_from_config(&config);

        assert!(oracle.is_member(&ClusterId::new("B")));
        assert_eq!(oracle.random_cluster_gateway(&ClusterId::new("B")), Some(HostId::new("b:1")));
        assert!(oracle_from_config(&DirectoryConfig::default()).configuration().is_none());
    }
}
