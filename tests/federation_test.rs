use geodirectory::config::DirectoryConfig;
use geodirectory::directory::{
    ActivationAddress, ClusterId, DirectoryEntryStatus, GrainId, HostId, UnregistrationCause,
};
use geodirectory::federation::{InMemoryMultiClusterOracle, MultiClusterConfiguration};
use geodirectory::gsi::precedes;
use geodirectory::runtime::{oracle_from_config, DirectoryRuntime};
use geodirectory::transport::{InProcessDirectoryClient, InProcessNetwork};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

struct Cluster {
    runtime: DirectoryRuntime,
    oracle: Arc<InMemoryMultiClusterOracle>,
    silo: HostId,
}

/// One single-silo cluster per name, each with gateways into all the others.
fn federation(network: &Arc<InProcessNetwork>, names: &[&str], members: &[&str]) -> Vec<Cluster> {
    names
        .iter()
        .map(|name| {
            let silo = format!("{}:1", name.to_lowercase());
            let mut config = DirectoryConfig::new(*name, silo.clone())
                .with_multi_cluster(members.iter().map(|m| ClusterId::new(*m)).collect())
                .with_retry_interval(Duration::from_millis(50))
                .with_forward_retry_delay(Duration::from_millis(1));
            for other in names.iter().filter(|other| *other != name) {
                config = config.with_gateway(
                    ClusterId::new(*other),
                    HostId::new(format!("{}:1", other.to_lowercase())),
                );
            }

            let oracle = Arc::new(oracle_from_config(&config));
            let client = Arc::new(InProcessDirectoryClient::new(network.clone()));
            let runtime = DirectoryRuntime::new(
                config,
                oracle.clone(),
                client,
                geodirectory::logging::discard_logger(),
            )
            .expect("Should build runtime");
            runtime.join_network(network);

            Cluster {
                runtime,
                oracle,
                silo: HostId::new(silo),
            }
        })
        .collect()
}

fn grain_won_by(winner: &str, loser: &str) -> GrainId {
    (0..)
        .map(|key: u32| GrainId::new("Player", key.to_string()))
        .find(|g| precedes(g, &ClusterId::new(winner), &ClusterId::new(loser)))
        .expect("Some grain is won by the first cluster")
}

async fn wait_for_status(cluster: &Cluster, grain: &GrainId, status: Option<DirectoryEntryStatus>) {
    let reached = timeout(Duration::from_secs(5), async {
        loop {
            if cluster.runtime.lookup(grain).map(|e| e.status) == status {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "{} never reached {:?} for {}, has {:?}",
        cluster.silo,
        status,
        grain,
        cluster.runtime.lookup(grain).map(|e| e.status)
    );
}

async fn shutdown(clusters: Vec<Cluster>) {
    for cluster in clusters {
        cluster.runtime.shutdown().await;
    }
}

#[tokio::test]
async fn test_single_cluster_registers_without_messages() {
    let network = Arc::new(InProcessNetwork::new());
    let clusters = federation(&network, &["A"], &["A"]);
    let a = &clusters[0];

    let address = ActivationAddress::new_activation(GrainId::new("Player", "7"), a.silo.clone());
    let result = a.runtime.register(address.clone(), true).await.unwrap();

    assert_eq!(result, address);
    assert_eq!(
        a.runtime.lookup(&address.grain).map(|e| e.status),
        Some(DirectoryEntryStatus::Owned)
    );
    assert_eq!(network.request_count(), 0);
    shutdown(clusters).await;
}

#[tokio::test]
async fn test_concurrent_registration_converges_on_precedence_winner() {
    println!("=== Concurrent registration across three clusters ===\n");

    let network = Arc::new(InProcessNetwork::new());
    network.set_latency(Duration::from_millis(20));
    let clusters = federation(&network, &["A", "B", "C"], &["A", "B", "C"]);
    let (a, b, c) = (&clusters[0], &clusters[1], &clusters[2]);

    let grain = grain_won_by("A", "B");
    let on_a = ActivationAddress::new_activation(grain.clone(), a.silo.clone());
    let on_b = ActivationAddress::new_activation(grain.clone(), b.silo.clone());

    let (result_a, result_b) = tokio::join!(
        a.runtime.register(on_a.clone(), true),
        b.runtime.register(on_b.clone(), true)
    );
    println!("A registered {:?}", result_a);
    println!("B registered {:?}", result_b);

    assert_eq!(result_a.unwrap(), on_a);
    assert_eq!(result_b.unwrap(), on_a);

    let entry_a = a.runtime.lookup(&grain).expect("A keeps its activation");
    assert_eq!(entry_a.status, DirectoryEntryStatus::Owned);
    assert_eq!(entry_a.address, on_a);

    let entry_b = b.runtime.lookup(&grain).expect("B caches the winner");
    assert_eq!(entry_b.status, DirectoryEntryStatus::Cached);
    assert_eq!(entry_b.address, on_a);

    assert!(c.runtime.lookup(&grain).is_none());
    println!("✓ A owns the grain, B points at A, C holds nothing");

    shutdown(clusters).await;
}

#[tokio::test]
async fn test_late_registration_finds_owner() {
    let network = Arc::new(InProcessNetwork::new());
    let clusters = federation(&network, &["A", "B"], &["A", "B"]);
    let (a, b) = (&clusters[0], &clusters[1]);

    let grain = grain_won_by("B", "A");
    let on_a = ActivationAddress::new_activation(grain.clone(), a.silo.clone());
    a.runtime.register(on_a.clone(), true).await.unwrap();
    assert_eq!(a.runtime.lookup(&grain).map(|e| e.status), Some(DirectoryEntryStatus::Owned));

    // B would win a race but A already owns the grain.
    let on_b = ActivationAddress::new_activation(grain.clone(), b.silo.clone());
    let result = b.runtime.register(on_b, true).await.unwrap();
    assert_eq!(result, on_a);
    assert_eq!(b.runtime.lookup(&grain).map(|e| e.status), Some(DirectoryEntryStatus::Cached));

    shutdown(clusters).await;
}

#[tokio::test]
async fn test_unreachable_cluster_leaves_entry_doubtful_until_reconciled() {
    println!("=== Doubtful entry recovered by the reconciliation agent ===\n");

    let network = Arc::new(InProcessNetwork::new());
    let clusters = federation(&network, &["A", "B"], &["A", "B"]);
    let (a, b) = (&clusters[0], &clusters[1]);
    network.disconnect(&b.silo);

    let grain = GrainId::new("Player", "42");
    let on_a = ActivationAddress::new_activation(grain.clone(), a.silo.clone());
    let result = a.runtime.register(on_a.clone(), true).await.unwrap();
    assert_eq!(result, on_a);
    assert_eq!(a.runtime.lookup(&grain).map(|e| e.status), Some(DirectoryEntryStatus::Doubtful));
    println!("✓ Registration with B unreachable ends doubtful");

    network.reconnect(&b.silo);
    wait_for_status(a, &grain, Some(DirectoryEntryStatus::Owned)).await;
    println!("✓ Agent promoted the entry once B answered");

    shutdown(clusters).await;
}

#[tokio::test]
async fn test_leaving_federation_demotes_and_rejoining_recovers() {
    let network = Arc::new(InProcessNetwork::new());
    let clusters = federation(&network, &["A", "B"], &["A", "B"]);
    let (a, _b) = (&clusters[0], &clusters[1]);

    let grain = GrainId::new("Player", "9");
    let on_a = ActivationAddress::new_activation(grain.clone(), a.silo.clone());
    a.runtime.register(on_a, true).await.unwrap();
    assert_eq!(a.runtime.lookup(&grain).map(|e| e.status), Some(DirectoryEntryStatus::Owned));

    a.oracle
        .inject_configuration(MultiClusterConfiguration::new([ClusterId::new("B")]));
    wait_for_status(a, &grain, Some(DirectoryEntryStatus::Doubtful)).await;

    a.oracle.inject_configuration(MultiClusterConfiguration::new([
        ClusterId::new("A"),
        ClusterId::new("B"),
    ]));
    wait_for_status(a, &grain, Some(DirectoryEntryStatus::Owned)).await;

    shutdown(clusters).await;
}

#[tokio::test]
async fn test_unregister_and_delete_reach_remote_caches() {
    let network = Arc::new(InProcessNetwork::new());
    let clusters = federation(&network, &["A", "B"], &["A", "B"]);
    let (a, b) = (&clusters[0], &clusters[1]);

    let first = GrainId::new("Player", "1");
    let second = GrainId::new("Player", "2");
    for grain in [&first, &second] {
        let on_a = ActivationAddress::new_activation(grain.clone(), a.silo.clone());
        a.runtime.register(on_a.clone(), true).await.unwrap();
        let on_b = ActivationAddress::new_activation(grain.clone(), b.silo.clone());
        assert_eq!(b.runtime.register(on_b, true).await.unwrap(), on_a);
        assert_eq!(b.runtime.lookup(grain).map(|e| e.status), Some(DirectoryEntryStatus::Cached));
    }

    let owned = a.runtime.lookup(&first).expect("A owns the first grain").address;
    a.runtime
        .unregister(vec![owned], UnregistrationCause::Force)
        .await
        .unwrap();
    assert!(a.runtime.lookup(&first).is_none());
    wait_for_status(b, &first, None).await;

    a.runtime.delete(second.clone()).await.unwrap();
    assert!(a.runtime.lookup(&second).is_none());
    wait_for_status(b, &second, None).await;

    shutdown(clusters).await;
}

#[tokio::test]
async fn test_losing_doubtful_activation_is_deactivated() {
    println!("=== Two doubtful activations reconciled after a partition ===\n");

    let network = Arc::new(InProcessNetwork::new());
    let clusters = federation(&network, &["A", "B"], &["A", "B"]);
    let (a, b) = (&clusters[0], &clusters[1]);
    let mut deactivations = b.runtime.take_deactivation_requests().expect("Channel catalog");

    network.disconnect(&a.silo);
    network.disconnect(&b.silo);

    let grain = grain_won_by("A", "B");
    let on_a = ActivationAddress::new_activation(grain.clone(), a.silo.clone());
    let on_b = ActivationAddress::new_activation(grain.clone(), b.silo.clone());
    a.runtime.register(on_a.clone(), true).await.unwrap();
    b.runtime.register(on_b.clone(), true).await.unwrap();
    assert_eq!(a.runtime.lookup(&grain).map(|e| e.status), Some(DirectoryEntryStatus::Doubtful));
    assert_eq!(b.runtime.lookup(&grain).map(|e| e.status), Some(DirectoryEntryStatus::Doubtful));
    println!("✓ Both clusters hold a doubtful activation");

    network.reconnect(&a.silo);
    network.reconnect(&b.silo);

    wait_for_status(a, &grain, Some(DirectoryEntryStatus::Owned)).await;
    wait_for_status(b, &grain, Some(DirectoryEntryStatus::Cached)).await;
    assert_eq!(b.runtime.lookup(&grain).map(|e| e.address), Some(on_a));

    let lost = timeout(Duration::from_secs(5), deactivations.recv())
        .await
        .expect("B hands its losing activation to the catalog")
        .expect("Channel open");
    assert_eq!(lost.host, b.silo);
    assert_eq!(lost.addresses, vec![on_b]);
    println!("✓ A owns the grain and B deactivates its copy");

    shutdown(clusters).await;
}
