// SPDX-License-Identifier: Apache-2.0

//! Live target migration between two providers on separate engines.

mod common;

use std::sync::Arc;

use warabi::{
    Client, Engine, Error, MigrationClient, MigrationOptions, MigrationServer, Provider, RegionId,
};

struct Pair {
    engine1: Arc<Engine>,
    engine2: Arc<Engine>,
    _provider1: Provider,
    _provider2: Provider,
    client: Client,
}

/// Provider 1 can send targets, provider 2 can receive them.
async fn setup_pair() -> Pair {
    common::init_logging();
    let engine1 = Engine::new("127.0.0.1:0").await.unwrap();
    let engine2 = Engine::new("127.0.0.1:0").await.unwrap();

    let migration_client = MigrationClient::new(engine1.clone());
    let migration_server = MigrationServer::new(&engine2).unwrap();

    let provider1 = Provider::new(engine1.clone(), 1, "", Some(migration_client), None)
        .await
        .unwrap();
    let provider2 = Provider::new(engine2.clone(), 2, "", None, Some(migration_server))
        .await
        .unwrap();
    let client = Client::new(engine1.clone());

    Pair {
        engine1,
        engine2,
        _provider1: provider1,
        _provider2: provider2,
        client,
    }
}

fn sample(i: usize, len: usize) -> Vec<u8> {
    (0..len).map(|j| b'A' + ((i + j) % 26) as u8).collect()
}

#[tokio::test]
async fn test_migrate_file_target() {
    let pair = setup_pair().await;
    let addr1 = pair.engine1.self_addr().to_string();
    let addr2 = pair.engine2.self_addr().to_string();
    let source_dir = tempfile::tempdir().unwrap();
    let dest_dir = tempfile::tempdir().unwrap();

    let target_dir = source_dir.path().join("target");
    let target = pair
        .client
        .add_target(
            &addr1,
            1,
            "file",
            &serde_json::json!({
                "path": target_dir.display().to_string(),
                "create_if_missing": true,
            })
            .to_string(),
        )
        .await
        .unwrap();

    let mut handle1 = pair
        .client
        .make_target_handle(&addr1, 1, target, true)
        .await
        .unwrap();
    handle1.set_eager_write_threshold(128);
    handle1.set_eager_read_threshold(128);

    // A mix of eager- and bulk-sized regions.
    let data_size = 196;
    let mut regions: Vec<RegionId> = Vec::new();
    for i in 0..16 {
        let region = handle1
            .create_and_write(&sample(i, data_size), true)
            .await
            .unwrap();
        regions.push(region);
    }

    pair.client
        .migrate_target(
            &addr1,
            1,
            target,
            &addr2,
            2,
            &MigrationOptions {
                new_root: dest_dir.path().join("x").display().to_string(),
                transfer_size: 1024,
                remove_source: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // The UUID now resolves on the destination and not on the source.
    let err = pair.client.check_target(&addr1, 1, target).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "got {err}");
    pair.client.check_target(&addr2, 2, target).await.unwrap();

    // Every region reads back byte-identical on the destination.
    let handle2 = pair
        .client
        .make_target_handle(&addr2, 2, target, true)
        .await
        .unwrap();
    for (i, region) in regions.iter().enumerate() {
        let out = handle2.read(region, 0, data_size as u64).await.unwrap();
        assert_eq!(out, sample(i, data_size));
    }

    // remove_source freed the source storage.
    assert!(!target_dir.exists());
}

#[tokio::test]
async fn test_migrate_memory_target() {
    let pair = setup_pair().await;
    let addr1 = pair.engine1.self_addr().to_string();
    let addr2 = pair.engine2.self_addr().to_string();
    let dest_dir = tempfile::tempdir().unwrap();

    let target = pair.client.add_target(&addr1, 1, "memory", "{}").await.unwrap();
    let handle1 = pair
        .client
        .make_target_handle(&addr1, 1, target, true)
        .await
        .unwrap();
    let region = handle1.create(1024).await.unwrap();
    handle1.write(&region, 0, b"hello", true).await.unwrap();

    pair.client
        .migrate_target(
            &addr1,
            1,
            target,
            &addr2,
            2,
            &MigrationOptions {
                new_root: dest_dir.path().join("mem").display().to_string(),
                remove_source: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(matches!(
        pair.client.check_target(&addr1, 1, target).await,
        Err(Error::NotFound(_))
    ));
    let handle2 = pair
        .client
        .make_target_handle(&addr2, 2, target, true)
        .await
        .unwrap();
    assert_eq!(handle2.read(&region, 0, 5).await.unwrap(), b"hello");
}

#[tokio::test]
async fn test_rejected_when_transfer_manager_missing_on_destination() {
    let pair = setup_pair().await;
    let addr1 = pair.engine1.self_addr().to_string();
    let addr2 = pair.engine2.self_addr().to_string();
    let dest_dir = tempfile::tempdir().unwrap();

    // "custom" exists on provider 1 but not on provider 2.
    pair.client
        .add_transfer_manager(&addr1, 1, "custom", "__default__", "{}")
        .await
        .unwrap();
    let target = pair
        .client
        .add_target(
            &addr1,
            1,
            "memory",
            r#"{ "transfer_manager": "custom" }"#,
        )
        .await
        .unwrap();
    let handle1 = pair
        .client
        .make_target_handle(&addr1, 1, target, true)
        .await
        .unwrap();
    let region = handle1.create_and_write(b"survivor", true).await.unwrap();

    let err = pair
        .client
        .migrate_target(
            &addr1,
            1,
            target,
            &addr2,
            2,
            &MigrationOptions {
                new_root: dest_dir.path().join("y").display().to_string(),
                remove_source: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.migration_status(), Some(2), "got {err}");

    // Rollback: the source target is still live and readable.
    pair.client.check_target(&addr1, 1, target).await.unwrap();
    assert_eq!(handle1.read(&region, 0, 8).await.unwrap(), b"survivor");

    // Nothing was installed on the destination.
    assert!(matches!(
        pair.client.check_target(&addr2, 2, target).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_rejected_when_uuid_already_present() {
    common::init_logging();
    // Both engines fully wired so provider 2 can also send.
    let engine1 = Engine::new("127.0.0.1:0").await.unwrap();
    let engine2 = Engine::new("127.0.0.1:0").await.unwrap();
    let mc1 = MigrationClient::new(engine1.clone());
    let mc2 = MigrationClient::new(engine2.clone());
    let ms1 = MigrationServer::new(&engine1).unwrap();
    let ms2 = MigrationServer::new(&engine2).unwrap();
    let _provider1 = Provider::new(engine1.clone(), 1, "", Some(mc1), Some(ms1))
        .await
        .unwrap();
    let _provider2 = Provider::new(engine2.clone(), 2, "", Some(mc2), Some(ms2))
        .await
        .unwrap();
    let client = Client::new(engine1.clone());
    let addr1 = engine1.self_addr().to_string();
    let addr2 = engine2.self_addr().to_string();
    let dest_dir = tempfile::tempdir().unwrap();

    let target = client.add_target(&addr1, 1, "memory", "{}").await.unwrap();
    let handle1 = client
        .make_target_handle(&addr1, 1, target, true)
        .await
        .unwrap();
    let region = handle1.create_and_write(b"hop", true).await.unwrap();

    client
        .migrate_target(
            &addr1,
            1,
            target,
            &addr2,
            2,
            &MigrationOptions {
                new_root: dest_dir.path().join("first").display().to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Migrating the target onto a provider that already holds its UUID is
    // refused by the before-callback, and the target survives.
    let err = client
        .migrate_target(
            &addr2,
            2,
            target,
            &addr2,
            2,
            &MigrationOptions {
                new_root: dest_dir.path().join("second").display().to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.migration_status(), Some(3), "got {err}");

    client.check_target(&addr2, 2, target).await.unwrap();
    let handle2 = client
        .make_target_handle(&addr2, 2, target, true)
        .await
        .unwrap();
    assert_eq!(handle2.read(&region, 0, 3).await.unwrap(), b"hop");
}

#[tokio::test]
async fn test_migrate_requires_wiring_and_options() {
    let pair = setup_pair().await;
    let addr1 = pair.engine1.self_addr().to_string();
    let addr2 = pair.engine2.self_addr().to_string();

    let target = pair.client.add_target(&addr1, 1, "memory", "{}").await.unwrap();

    // Empty new_root is refused before anything is frozen.
    let err = pair
        .client
        .migrate_target(&addr1, 1, target, &addr2, 2, &MigrationOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)), "got {err}");

    // Provider 2 has no migration client: it cannot send.
    let target2 = pair.client.add_target(&addr2, 2, "memory", "{}").await.unwrap();
    let err = pair
        .client
        .migrate_target(
            &addr2,
            2,
            target2,
            &addr1,
            1,
            &MigrationOptions {
                new_root: "/tmp/never-used".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)), "got {err}");
}
