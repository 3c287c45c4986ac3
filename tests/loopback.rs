//! End-to-end tests over loopback: two full instances, certificate
//! bootstrap, TLS registration, and chunked transfer. mDNS is disabled and
//! sightings are injected directly so the tests never depend on the
//! network environment.

use std::path::Path;
use std::time::Duration;

use lanbeam::{
    ConnectionStatus, DeviceConfig, DiscoveryEvent, Event, LanbeamServer, ServerGuard,
    TransferStatus,
};
use tokio::time::timeout;

fn local_config(id: &str, name: &str, download_dir: &Path) -> DeviceConfig {
    let mut config = DeviceConfig::new(id, name, "localhost", "tester", download_dir);
    // Ephemeral ports so parallel tests never collide.
    config.transfer_port = 0;
    config.auth_port = 0;
    config
}

async fn start(config: DeviceConfig) -> ServerGuard {
    LanbeamServer::new(config)
        .with_discovery(false)
        .serve()
        .await
        .expect("instance should start")
}

/// A sighting pointing at a running local instance, as the browser would
/// have reported it.
fn sighting_of(guard: &ServerGuard, peer_id: &str) -> DiscoveryEvent {
    DiscoveryEvent {
        peer_id: peer_id.to_string(),
        hostname: "localhost".to_string(),
        address: Some("127.0.0.1".parse().unwrap()),
        transfer_port: guard.rpc_addr().port(),
        auth_port: guard.bootstrap_addr().expect("bootstrap running").port(),
        api_version: "2".to_string(),
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    timeout(Duration::from_secs(15), deadline)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[test_log::test(tokio::test)]
async fn bootstrap_connect_and_register() {
    let downloads_a = tempfile::tempdir().unwrap();
    let downloads_b = tempfile::tempdir().unwrap();
    let a = start(local_config("dev-a", "Device A", downloads_a.path())).await;
    let b = start(local_config("dev-b", "Device B", downloads_b.path())).await;

    // A sights B and walks Disconnected -> Connecting -> Connected.
    a.registry().handle_discovery(sighting_of(&b, "dev-b"));
    let registry_a = a.registry();
    wait_until("A connected to B", || {
        registry_a
            .snapshot("dev-b")
            .is_some_and(|d| d.status == ConnectionStatus::Connected)
    })
    .await;

    // Registration filled in B's metadata on A ...
    let details = registry_a.snapshot("dev-b").unwrap();
    assert_eq!(details.display_name, "Device B");
    assert_eq!(details.api_version, "2");

    // ... and taught B about A.
    let registry_b = b.registry();
    wait_until("B learned about A", || registry_b.snapshot("dev-a").is_some()).await;
    assert_eq!(registry_b.snapshot("dev-a").unwrap().display_name, "Device A");

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn sends_files_and_folders_end_to_end() {
    let source_dir = tempfile::tempdir().unwrap();
    std::fs::write(source_dir.path().join("a.txt"), vec![b'x'; 100]).unwrap();
    std::fs::create_dir(source_dir.path().join("docs")).unwrap();
    std::fs::write(source_dir.path().join("docs/b.txt"), vec![b'y'; 50]).unwrap();

    let downloads_a = tempfile::tempdir().unwrap();
    let downloads_b = tempfile::tempdir().unwrap();
    let mut config_b = local_config("dev-b", "Device B", downloads_b.path());
    config_b.auto_accept = true;

    let a = start(local_config("dev-a", "Device A", downloads_a.path())).await;
    let b = start(config_b).await;

    a.registry().handle_discovery(sighting_of(&b, "dev-b"));
    let registry_a = a.registry();
    wait_until("A connected to B", || {
        registry_a
            .snapshot("dev-b")
            .is_some_and(|d| d.status == ConnectionStatus::Connected)
    })
    .await;

    let remote = registry_a.get("dev-b").unwrap();
    let operation = remote
        .begin_send(vec![
            source_dir.path().join("a.txt"),
            source_dir.path().join("docs"),
        ])
        .unwrap();

    wait_until("send finished", || {
        registry_a
            .operation("dev-b", operation)
            .is_some_and(|op| op.status == TransferStatus::Finished)
    })
    .await;

    let snapshot = registry_a.operation("dev-b", operation).unwrap();
    assert_eq!(snapshot.total_size, 150);
    assert_eq!(snapshot.bytes_transferred, 150);

    // The receiving side resolved to Finished with identical accounting.
    let registry_b = b.registry();
    wait_until("receive finished", || {
        registry_b
            .operation("dev-a", operation)
            .is_some_and(|op| op.status == TransferStatus::Finished)
    })
    .await;
    let received = registry_b.operation("dev-a", operation).unwrap();
    assert_eq!(received.bytes_transferred, 150);

    assert_eq!(
        std::fs::read(downloads_b.path().join("a.txt")).unwrap(),
        vec![b'x'; 100]
    );
    assert_eq!(
        std::fs::read(downloads_b.path().join("docs/b.txt")).unwrap(),
        vec![b'y'; 50]
    );

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn denied_offer_cancels_the_send() {
    let source_dir = tempfile::tempdir().unwrap();
    std::fs::write(source_dir.path().join("secret.txt"), b"nope").unwrap();

    let downloads_a = tempfile::tempdir().unwrap();
    let downloads_b = tempfile::tempdir().unwrap();
    // B does not auto-accept; we deny by hand when the offer lands.
    let a = start(local_config("dev-a", "Device A", downloads_a.path())).await;
    let b = start(local_config("dev-b", "Device B", downloads_b.path())).await;

    let mut events_b = b.events().subscribe();

    a.registry().handle_discovery(sighting_of(&b, "dev-b"));
    let registry_a = a.registry();
    wait_until("A connected to B", || {
        registry_a
            .snapshot("dev-b")
            .is_some_and(|d| d.status == ConnectionStatus::Connected)
    })
    .await;

    let remote = registry_a.get("dev-b").unwrap();
    let operation = remote
        .begin_send(vec![source_dir.path().join("secret.txt")])
        .unwrap();

    // Wait for the offer to surface on B, then refuse it.
    let registry_b = b.registry();
    let offered = timeout(Duration::from_secs(15), async {
        loop {
            match events_b.recv().await.unwrap() {
                Event::OperationAdded {
                    remote, operation, ..
                } if remote == "dev-a" => break operation,
                _ => continue,
            }
        }
    })
    .await
    .expect("offer should reach B");
    assert_eq!(offered, operation);
    registry_b
        .get("dev-a")
        .unwrap()
        .find_receiving(offered)
        .unwrap()
        .deny();

    wait_until("send cancelled", || {
        registry_a
            .operation("dev-b", operation)
            .is_some_and(|op| op.status == TransferStatus::Cancelled)
    })
    .await;
    assert!(!downloads_b.path().join("secret.txt").exists());

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn shutdown_leaves_operations_terminal() {
    let downloads_a = tempfile::tempdir().unwrap();
    let downloads_b = tempfile::tempdir().unwrap();
    let a = start(local_config("dev-a", "Device A", downloads_a.path())).await;
    let b = start(local_config("dev-b", "Device B", downloads_b.path())).await;

    a.registry().handle_discovery(sighting_of(&b, "dev-b"));
    let registry_a = a.registry();
    wait_until("A connected to B", || {
        registry_a
            .snapshot("dev-b")
            .is_some_and(|d| d.status == ConnectionStatus::Connected)
    })
    .await;

    a.shutdown().await.unwrap();
    // Every remote ended in a resting state with no operation in flight.
    for details in registry_a.remotes() {
        assert_eq!(details.status, ConnectionStatus::Idle);
    }
    for remote in registry_a.remotes() {
        for op in registry_a.get(&remote.id).unwrap().operations() {
            assert!(op.status.is_terminal());
        }
    }

    b.shutdown().await.unwrap();
}
