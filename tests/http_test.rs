use geodirectory::config::DirectoryConfig;
use geodirectory::directory::{ActivationAddress, ClusterId, DirectoryEntryStatus, GrainId, HostId};
use geodirectory::federation::InMemoryMultiClusterOracle;
use geodirectory::runtime::{oracle_from_config, DirectoryRuntime};
use geodirectory::transport::messages::HealthResponse;
use std::sync::Arc;
use std::time::Duration;

async fn start_cluster(name: &str) -> (DirectoryRuntime, Arc<InMemoryMultiClusterOracle>, HostId) {
    let config = DirectoryConfig::new(name, "127.0.0.1:0")
        .with_multi_cluster(vec![ClusterId::new("A"), ClusterId::new("B")])
        .with_request_timeout(Duration::from_secs(2));
    let oracle = Arc::new(oracle_from_config(&config));
    let runtime = DirectoryRuntime::with_http(config, oracle.clone(), geodirectory::logging::create_test_logger())
        .expect("Should build runtime");
    let address = runtime.start_http().await.expect("Should bind loopback");
    (runtime, oracle, HostId::new(address.to_string()))
}

#[tokio::test]
async fn test_registration_over_http() {
    println!("=== Two clusters over loopback HTTP ===\n");

    let (a, oracle_a, addr_a) = start_cluster("A").await;
    let (b, oracle_b, addr_b) = start_cluster("B").await;
    oracle_a.set_gateways(ClusterId::new("B"), vec![addr_b.clone()]);
    oracle_b.set_gateways(ClusterId::new("A"), vec![addr_a.clone()]);
    println!("A listening on {}, B listening on {}", addr_a, addr_b);

    let health: HealthResponse = reqwest::get(format!("http://{}/health", addr_b))
        .await
        .expect("Health request should succeed")
        .json()
        .await
        .expect("Health response should decode");
    assert_eq!(health.cluster_id, ClusterId::new("B"));
    println!("✓ B is healthy");

    // Silo identities stay "127.0.0.1:0"; each ring has a single member.
    let grain = GrainId::new("Player", "http");
    let on_a = ActivationAddress::new_activation(grain.clone(), HostId::new("127.0.0.1:0"));
    let result = a.register(on_a.clone(), true).await.unwrap();
    assert_eq!(result, on_a);
    assert_eq!(a.lookup(&grain).map(|e| e.status), Some(DirectoryEntryStatus::Owned));
    println!("✓ A owns {}", grain);

    let on_b = ActivationAddress::new_activation(grain.clone(), HostId::new("127.0.0.1:0"));
    let result = b.register(on_b, true).await.unwrap();
    assert_eq!(result, on_a);
    assert_eq!(b.lookup(&grain).map(|e| e.status), Some(DirectoryEntryStatus::Cached));
    println!("✓ B points at A's activation");

    a.shutdown().await;
    b.shutdown().await;
}
