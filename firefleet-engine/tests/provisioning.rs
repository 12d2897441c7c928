//! End-to-end provisioning, rollback and deletion against a script
//! hypervisor and mock collaborators.

mod common;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{create_ok, Harness, ALIVE, CRASHES, SILENT};
use firefleet_core::{OwnerId, VmId, VmState};
use firefleet_engine::{EngineError, FirecrackerConfig};

#[tokio::test]
async fn happy_path_reaches_running_with_socket_on_disk() {
    let h = Harness::new(ALIVE);
    let created = create_ok(&h, 42).await;

    assert!(created.port >= 9000, "port {} below start", created.port);
    assert_eq!(created.socket_path, h.socket_path(created.vm_id));
    assert!(
        created
            .socket_path
            .to_string_lossy()
            .ends_with(&format!("firecracker_{}.sock", created.vm_id)),
        "{}",
        created.socket_path.display()
    );
    assert!(created.socket_path.exists(), "socket must exist once Running");

    let record = h.engine.get(created.vm_id).unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(record.state, VmState::Running);
    assert_eq!(record.owner_id, OwnerId::new(42));
    assert_eq!(record.network.port, created.port);
    assert_eq!(record.resources.ram_mib, 512);
    assert_eq!(record.paths.vm_dir, h.vm_dir(42, created.vm_id));
}

#[tokio::test]
async fn workspace_holds_staged_images_disk_and_config() {
    let h = Harness::new(ALIVE);
    let created = create_ok(&h, 7).await;
    let vm_dir = h.vm_dir(7, created.vm_id);

    for name in [
        "kernel/k.img",
        "rootfs/r.img",
        "disk.ext4",
        "vm_config.json",
        "metrics.json",
        "console.log",
        "firecracker.log",
    ] {
        assert!(vm_dir.join(name).exists(), "{name} missing from {}", vm_dir.display());
    }

    let text = std::fs::read_to_string(vm_dir.join("vm_config.json"))
        .unwrap_or_else(|e| panic!("{e}"));
    let config: FirecrackerConfig =
        serde_json::from_str(&text).unwrap_or_else(|e| panic!("{e}"));
    let record = h.engine.get(created.vm_id).unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(config.network_interfaces[0].host_dev_name, record.network.vm_iface);
    assert_eq!(config.drives[0].path_on_host, vm_dir.join("disk.ext4"));
    assert_eq!(config.boot_source.kernel_image_path, vm_dir.join("kernel/k.img"));
    assert_eq!(config.machine_config.vcpu_count, 2);
    assert_eq!(config.machine_config.mem_size_mib, 512);

    assert!(h.collaborators.called(&format!("attach_tap {} br0", record.network.vm_iface)));
    assert!(h.collaborators.called("prepare_rootfs"));
}

#[tokio::test]
async fn network_failure_rolls_back_everything() {
    let h = Harness::new(ALIVE);
    h.collaborators.fail_attach.store(true, Ordering::SeqCst);

    let result = h.engine.create(&h.request(1)).await;
    assert!(
        matches!(result, Err(EngineError::ExternalScript(ref f)) if f.operation == "attach_tap"),
        "got {result:?}"
    );

    assert!(h.engine.list(None).unwrap_or_else(|e| panic!("{e}")).is_empty());
    let user_dir = h.config.base_dir.join("vm_for_users_1");
    let leftovers = std::fs::read_dir(&user_dir).map(Iterator::count).unwrap_or(0);
    assert_eq!(leftovers, 0, "no per-VM directory may survive");
    assert!(h.collaborators.called("release"));
    assert!(!h.collaborators.called("prepare_rootfs"));
}

#[tokio::test]
async fn storage_failure_detaches_the_tap() {
    let h = Harness::new(ALIVE);
    h.collaborators.fail_prepare.store(true, Ordering::SeqCst);

    let result = h.engine.create(&h.request(1)).await;
    assert!(matches!(result, Err(EngineError::ExternalScript(_))), "got {result:?}");

    assert!(h.collaborators.called("detach_tap tap0"));
    assert!(h.engine.list(None).unwrap_or_else(|e| panic!("{e}")).is_empty());
    assert!(!h.vm_dir(1, VmId::new(1)).exists());
}

#[tokio::test]
async fn crashing_hypervisor_fails_with_its_stderr() {
    let h = Harness::new(CRASHES);

    let err = match h.engine.create(&h.request(1)).await {
        Ok(created) => panic!("create must fail, got {created:?}"),
        Err(e) => e,
    };
    match &err {
        EngineError::LaunchFailure { diagnostic, .. } => {
            assert!(diagnostic.contains("cannot open root device"), "{diagnostic}");
        }
        other => panic!("expected LaunchFailure, got {other:?}"),
    }

    assert!(h.engine.list(None).unwrap_or_else(|e| panic!("{e}")).is_empty());
    assert!(!h.socket_path(VmId::new(1)).exists());
    assert!(!h.vm_dir(1, VmId::new(1)).exists());
    assert!(h.collaborators.called("detach_tap"));
}

#[tokio::test]
async fn invalid_request_reserves_nothing() {
    let h = Harness::new(ALIVE);
    let mut request = h.request(1);
    request.ip_addr = "300.1.1.1".to_owned();

    let result = h.engine.create(&request).await;
    assert!(matches!(result, Err(EngineError::InvalidRequest(_))), "got {result:?}");
    assert!(h.collaborators.calls().is_empty());

    // The failed request did not consume a port.
    let created = create_ok(&h, 1).await;
    assert_eq!(created.port, 9000);
}

#[tokio::test]
async fn missing_image_is_a_workspace_error() {
    let h = Harness::new(ALIVE);
    let mut request = h.request(1);
    request.template.kernel_image = h.images().join("absent.img");

    match h.engine.create(&request).await {
        Err(EngineError::Workspace { path, .. }) => assert!(path.ends_with("absent.img")),
        other => panic!("expected Workspace error, got {other:?}"),
    }
    assert!(h.engine.list(None).unwrap_or_else(|e| panic!("{e}")).is_empty());
}

#[tokio::test]
async fn listing_filters_by_owner() {
    let h = Harness::new(ALIVE);
    for owner in [1, 1, 2] {
        create_ok(&h, owner).await;
    }

    let count = |owner: Option<i64>| {
        h.engine
            .list(owner.map(OwnerId::new))
            .unwrap_or_else(|e| panic!("{e}"))
            .len()
    };
    assert_eq!(count(Some(1)), 2);
    assert_eq!(count(Some(2)), 1);
    assert_eq!(count(None), 3);
}

#[tokio::test]
async fn delete_is_idempotent_and_leaves_others_alone() {
    let h = Harness::new(ALIVE);
    let first = create_ok(&h, 1).await;
    let second = create_ok(&h, 1).await;

    let report = h.engine.delete(first.vm_id).await.unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(report.vm_id, first.vm_id);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert!(!first.socket_path.exists());
    assert!(!h.vm_dir(1, first.vm_id).exists());

    let again = h.engine.delete(first.vm_id).await;
    assert!(matches!(again, Err(EngineError::NotFound(id)) if id == first.vm_id));

    let survivor = h.engine.get(second.vm_id).unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(survivor.state, VmState::Running);
    assert!(second.socket_path.exists());
}

#[tokio::test]
async fn delete_reports_collaborator_errors_as_warnings() {
    let h = Harness::new(ALIVE);
    let created = create_ok(&h, 1).await;
    h.collaborators.fail_release.store(true, Ordering::SeqCst);

    let report = h.engine.delete(created.vm_id).await.unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(report.warnings.len(), 1, "{:?}", report.warnings);
    assert!(report.warnings[0].contains("release"));
    assert!(matches!(h.engine.get(created.vm_id), Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn ports_keep_rising_after_deletion() {
    let h = Harness::new(ALIVE);
    let mut previous = Vec::new();
    for _ in 0..3 {
        previous.push(create_ok(&h, 1).await);
    }
    let highest = previous.iter().map(|c| c.port).max().unwrap_or_default();
    if let Some(last) = previous.last() {
        h.engine.delete(last.vm_id).await.unwrap_or_else(|e| panic!("{e}"));
    }

    let next = create_ok(&h, 1).await;
    assert!(next.port > highest, "{} must exceed {highest}", next.port);
    assert!(previous.iter().all(|c| c.vm_id < next.vm_id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creations_get_distinct_resources() {
    let h = Harness::new(ALIVE);
    let mut tasks = Vec::new();
    for owner in 0..8 {
        let engine = Arc::clone(&h.engine);
        let request = h.request(owner);
        tasks.push(tokio::spawn(async move { engine.create(&request).await }));
    }

    let mut ports = HashSet::new();
    let mut sockets = HashSet::new();
    for task in tasks {
        let created = match task.await {
            Ok(Ok(created)) => created,
            Ok(Err(e)) => panic!("create failed: {e}"),
            Err(e) => panic!("task panicked: {e}"),
        };
        assert!(ports.insert(created.port), "duplicate port {}", created.port);
        assert!(sockets.insert(created.socket_path));
    }

    let records = h.engine.list(None).unwrap_or_else(|e| panic!("{e}"));
    let taps: HashSet<_> = records.iter().map(|r| r.network.vm_iface.clone()).collect();
    assert_eq!(records.len(), 8);
    assert_eq!(taps.len(), 8, "tap names must be unique");
}

#[tokio::test]
async fn flush_stats_on_unknown_vm_is_not_found() {
    let h = Harness::new(ALIVE);
    let result = h.engine.flush_stats(VmId::new(99)).await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn flush_stats_without_a_listening_socket_is_unreachable() {
    let h = Harness::new(ALIVE);
    let created = create_ok(&h, 1).await;

    // The script hypervisor only touches its socket path; nothing listens.
    let result = h.engine.flush_stats(created.vm_id).await;
    assert!(matches!(result, Err(EngineError::ControlUnreachable { .. })), "got {result:?}");

    let record = h.engine.get(created.vm_id).unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(record.state, VmState::Running, "a live VM is not reclaimed");
}

fn assert_nothing_left(h: &Harness, owner: i64, vm_id: VmId) {
    assert!(h.engine.list(None).unwrap_or_else(|e| panic!("{e}")).is_empty());
    assert!(!h.vm_dir(owner, vm_id).exists(), "vm dir survived");
    assert!(!h.socket_path(vm_id).exists(), "socket survived");
}

#[tokio::test]
async fn socket_that_never_appears_rolls_back() {
    let h = Harness::new(SILENT);

    let result = h.engine.create(&h.request(1)).await;
    assert!(matches!(result, Err(EngineError::ControlUnreachable { .. })), "got {result:?}");

    assert_nothing_left(&h, 1, VmId::new(1));
    assert!(h.collaborators.called("detach_tap tap0"));
    assert!(h.collaborators.called("release"));
}

#[tokio::test]
async fn config_write_failure_rolls_back() {
    let h = Harness::new(ALIVE);
    h.collaborators.occupy_config.store(true, Ordering::SeqCst);

    match h.engine.create(&h.request(1)).await {
        Err(EngineError::Workspace { path, .. }) => assert!(path.ends_with("vm_config.json")),
        other => panic!("expected Workspace error, got {other:?}"),
    }
    assert_nothing_left(&h, 1, VmId::new(1));
    assert!(h.collaborators.called("detach_tap tap0"));
}

#[tokio::test]
async fn delete_during_creation_converges() {
    let h = Harness::new(ALIVE);
    h.collaborators.block_prepare.store(true, Ordering::SeqCst);

    let engine = Arc::clone(&h.engine);
    let request = h.request(1);
    let creating = tokio::spawn(async move { engine.create(&request).await });
    h.collaborators.prepare_entered.notified().await;

    let vm_id = VmId::new(1);
    let in_flight = h.engine.get(vm_id).unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(in_flight.state, VmState::Allocated);
    let report = h.engine.delete(vm_id).await.unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(report.vm_id, vm_id);

    h.collaborators.prepare_release.notify_one();
    match creating.await {
        Ok(Ok(created)) => panic!("creation must not survive deletion: {created:?}"),
        Ok(Err(_)) => {}
        Err(e) => panic!("task panicked: {e}"),
    }

    assert_nothing_left(&h, 1, vm_id);
    assert!(matches!(h.engine.delete(vm_id).await, Err(EngineError::NotFound(_))));
}
