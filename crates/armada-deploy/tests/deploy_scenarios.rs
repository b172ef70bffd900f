//! End-to-end reconciliation scenarios against the dummy cloud.
//!
//! Everything runs in-process: in-memory state store, in-memory bus with
//! dummy agents, dummy cloud with an op log. Each test drives the real
//! task handlers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use armada_bus::{AgentClient, Bus, MemoryBus};
use armada_cloud::{Cloud, CloudOp, DummyAgentBehavior, DummyCloud};
use armada_core::LocalBlobstore;
use armada_deploy::tasks::{
    DeleteDeploymentJob, DeleteReleaseJob, UpdateDeploymentJob, UpdateStemcellJob,
};
use armada_deploy::DeployContext;
use armada_lock::{names as lock_names, LockGuard, LockOptions};
use armada_state::{
    PackageRecord, ReleaseRecord, ReleaseVersionRecord, StateStore, StemcellRecord, TemplateRecord,
};
use armada_tasks::{TaskContext, TaskHandler, TaskLogger};
use armada_workers::CancelToken;

use armada_core::DirectorError;

struct World {
    ctx: DeployContext,
    cloud: Arc<DummyCloud>,
    tmp: tempfile::TempDir,
}

fn world_with_behavior(behavior: DummyAgentBehavior) -> World {
    let tmp = tempfile::tempdir().unwrap();
    let bus = Arc::new(MemoryBus::new());
    let cloud = Arc::new(
        DummyCloud::new(Arc::clone(&bus) as Arc<dyn Bus>).with_agent_behavior(behavior),
    );
    let store = StateStore::open_in_memory().unwrap();
    let ctx = DeployContext {
        store,
        agents: AgentClient::new(Arc::clone(&bus) as Arc<dyn Bus>)
            .with_timeout(Duration::from_secs(5)),
        cloud: Arc::clone(&cloud) as Arc<dyn Cloud>,
        blobstore: Arc::new(LocalBlobstore::new(tmp.path().join("blobs"))),
        locks: LockOptions {
            ttl: Duration::from_secs(30),
            timeout: Duration::from_millis(200),
        },
    };
    World { ctx, cloud, tmp }
}

fn world() -> World {
    world_with_behavior(DummyAgentBehavior::default())
}

async fn seed_stemcell(world: &World) {
    let image = world.tmp.path().join("image");
    std::fs::write(&image, b"image-bytes").unwrap();
    let cid = world
        .cloud
        .create_stemcell(&image, &json!({}))
        .await
        .unwrap();
    world
        .ctx
        .store
        .put_stemcell(&StemcellRecord {
            name: "ubuntu".into(),
            version: "1.2".into(),
            cid,
            digest: "d-stemcell".into(),
        })
        .unwrap();
    world.cloud.clear_ops();
}

fn put_package(store: &StateStore, name: &str, fingerprint: &str, deps: &[&str]) {
    store
        .put_package(&PackageRecord {
            release: "redis".into(),
            release_version: "3".into(),
            name: name.into(),
            version: "1".into(),
            fingerprint: fingerprint.into(),
            blob_id: format!("src-{name}"),
            digest: format!("d-{name}"),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        })
        .unwrap();
}

fn seed_release(world: &World, template_packages: &[&str], packages: &[(&str, &[&str])]) {
    let store = &world.ctx.store;
    store.put_release(&ReleaseRecord { name: "redis".into() }).unwrap();
    store
        .put_release_version(&ReleaseVersionRecord {
            release: "redis".into(),
            version: "3".into(),
        })
        .unwrap();
    for (name, deps) in packages {
        put_package(store, name, &format!("fp-{name}"), deps);
    }
    store
        .put_template(&TemplateRecord {
            release: "redis".into(),
            release_version: "3".into(),
            name: "web-server".into(),
            version: "2".into(),
            blob_id: "blob-tpl".into(),
            digest: "d-tpl".into(),
            packages: template_packages.iter().map(|p| p.to_string()).collect(),
        })
        .unwrap();
}

fn manifest(instances: u32, static_ips: bool, persistent_disk: Option<u64>) -> String {
    let ips = if static_ips {
        let list: Vec<String> = (0..instances)
            .map(|i| format!("          - 10.0.0.{}", 10 + i))
            .collect();
        format!("        static_ips:\n{}", list.join("\n"))
    } else {
        String::new()
    };
    let disk = persistent_disk
        .map(|mb| format!("    persistent_disk: {mb}\n"))
        .unwrap_or_default();
    format!(
        r#"
name: prod
release:
  name: redis
  version: "3"
compilation:
  workers: 2
  network: default
update:
  canaries: 1
  max_in_flight: 2
  canary_watch_time: 1
  update_watch_time: 1
networks:
  - name: default
    subnets:
      - range: 10.0.0.0/24
        gateway: 10.0.0.1
        static:
          - 10.0.0.10 - 10.0.0.19
resource_pools:
  - name: small
    stemcell:
      name: ubuntu
      version: "1.2"
    network: default
    size: {instances}
jobs:
  - name: web
    template: web-server
    instances: {instances}
    resource_pool: small
{disk}    networks:
      - name: default
{ips}
"#
    )
}

fn task_context(world: &World, payload: serde_json::Value, cancel: CancelToken) -> TaskContext {
    let dir = world
        .tmp
        .path()
        .join(format!("task-{}", uuid_suffix()));
    TaskContext {
        task_id: 1,
        payload,
        logger: Arc::new(TaskLogger::create(&dir).unwrap()),
        cancel,
    }
}

fn uuid_suffix() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(0);
    NEXT.fetch_add(1, Ordering::SeqCst).to_string()
}

async fn run_update(world: &World, manifest_text: &str) -> anyhow::Result<String> {
    run_update_with_cancel(world, manifest_text, CancelToken::new()).await
}

async fn run_update_with_cancel(
    world: &World,
    manifest_text: &str,
    cancel: CancelToken,
) -> anyhow::Result<String> {
    let path = world
        .tmp
        .path()
        .join(format!("manifest-{}.yml", uuid_suffix()));
    std::fs::write(&path, manifest_text).unwrap();
    let handler = UpdateDeploymentJob {
        ctx: world.ctx.clone(),
    };
    handler
        .run(task_context(
            world,
            json!({"manifest_path": path.to_string_lossy()}),
            cancel,
        ))
        .await
}

fn domain(err: anyhow::Error) -> DirectorError {
    err.downcast::<DirectorError>().expect("domain error")
}

// ── Scenario: fresh deployment, one job, three instances ───────────

#[tokio::test]
async fn fresh_deployment_creates_three_instances_with_static_ips() {
    let world = world();
    seed_stemcell(&world).await;
    seed_release(&world, &["redis-server"], &[("libuv", &[]), ("redis-server", &["libuv"])]);

    let result = run_update(&world, &manifest(3, true, None)).await.unwrap();
    assert_eq!(result, "/deployments/prod");

    // Three pool VMs survive; compilation VMs are gone.
    assert_eq!(world.cloud.vm_count(), 3);

    let instances = world.ctx.store.list_instances("prod").unwrap();
    assert_eq!(instances.len(), 3);
    for (index, inst) in instances.iter().enumerate() {
        assert_eq!(inst.job, "web");
        assert_eq!(inst.index, index as u32);
        assert_eq!(inst.ips, vec![format!("10.0.0.{}", 10 + index)]);
        assert!(inst.vm_cid.is_some());
        // The applied state carries compiled artifacts for both packages.
        let packages = inst.state["packages"].as_object().unwrap();
        assert_eq!(packages.len(), 2);
        assert!(packages["redis-server"]["blob_id"]
            .as_str()
            .unwrap()
            .starts_with("compiled-"));
    }

    // Lock released.
    assert!(world
        .ctx
        .store
        .get_lock(&lock_names::deployment("prod"))
        .unwrap()
        .is_none());
}

// ── Scenario: idempotent redeploy ──────────────────────────────────

#[tokio::test]
async fn redeploying_the_same_manifest_makes_no_cloud_calls() {
    let world = world();
    seed_stemcell(&world).await;
    seed_release(&world, &["redis-server"], &[("libuv", &[]), ("redis-server", &["libuv"])]);

    let text = manifest(3, true, None);
    run_update(&world, &text).await.unwrap();
    let before = world.ctx.store.list_instances("prod").unwrap();

    world.cloud.clear_ops();
    run_update(&world, &text).await.unwrap();

    assert!(world.cloud.ops().is_empty(), "ops: {:?}", world.cloud.ops());
    assert_eq!(world.ctx.store.list_instances("prod").unwrap(), before);
}

// ── Scenario: persistent disk resize ───────────────────────────────

#[tokio::test]
async fn disk_resize_migrates_and_preserves_the_vm() {
    let world = world();
    seed_stemcell(&world).await;
    seed_release(&world, &["redis-server"], &[("libuv", &[]), ("redis-server", &["libuv"])]);

    run_update(&world, &manifest(1, true, Some(1024))).await.unwrap();
    let inst = &world.ctx.store.list_instances("prod").unwrap()[0];
    let old_disk = inst.disk_cid.clone().unwrap();
    let vm_cid = inst.vm_cid.clone().unwrap();

    world.cloud.clear_ops();
    run_update(&world, &manifest(1, true, Some(2048))).await.unwrap();

    let ops = world.cloud.ops();
    assert!(ops.iter().any(|op| matches!(op, CloudOp::CreateDisk { size_mb: 2048, .. })));
    assert!(ops.contains(&CloudOp::DeleteDisk { cid: old_disk.clone() }));
    assert!(!ops.iter().any(|op| matches!(op, CloudOp::CreateVm { .. })));
    assert!(!ops.iter().any(|op| matches!(op, CloudOp::DeleteVm { .. })));

    let inst = &world.ctx.store.list_instances("prod").unwrap()[0];
    assert_eq!(inst.vm_cid.as_deref(), Some(vm_cid.as_str()));
    assert_ne!(inst.disk_cid.as_deref(), Some(old_disk.as_str()));
    assert_eq!(world.cloud.disk_count(), 1);
}

#[tokio::test]
async fn failed_disk_migration_keeps_the_old_disk() {
    let world = world_with_behavior(DummyAgentBehavior {
        fail_migrate_disk: true,
        ..Default::default()
    });
    seed_stemcell(&world).await;
    seed_release(&world, &["redis-server"], &[("libuv", &[]), ("redis-server", &["libuv"])]);

    run_update(&world, &manifest(1, true, Some(1024))).await.unwrap();
    let inst = &world.ctx.store.list_instances("prod").unwrap()[0];
    let old_disk = inst.disk_cid.clone().unwrap();
    let vm_cid = inst.vm_cid.clone().unwrap();

    let err = run_update(&world, &manifest(1, true, Some(2048)))
        .await
        .unwrap_err();
    assert!(matches!(
        domain(err),
        DirectorError::InstanceUpdateFailed { ref job, index: 0, .. } if job == "web"
    ));

    // Old disk intact and still attached; the new one was rolled back.
    assert_eq!(world.cloud.disk_count(), 1);
    assert_eq!(world.cloud.get_disks(&vm_cid).await.unwrap(), vec![old_disk.clone()]);
    let inst = &world.ctx.store.list_instances("prod").unwrap()[0];
    assert_eq!(inst.disk_cid.as_deref(), Some(old_disk.as_str()));
}

// ── Scenario: lock contention ──────────────────────────────────────

#[tokio::test]
async fn concurrent_deployment_fails_with_lock_busy() {
    let world = world();
    seed_stemcell(&world).await;
    seed_release(&world, &["redis-server"], &[("libuv", &[]), ("redis-server", &["libuv"])]);

    let held = LockGuard::acquire(
        &world.ctx.store,
        &lock_names::deployment("prod"),
        world.ctx.locks.clone(),
    )
    .await
    .unwrap();

    let err = run_update(&world, &manifest(1, true, None)).await.unwrap_err();
    assert!(matches!(domain(err), DirectorError::LockBusy(_)));

    held.release();
    run_update(&world, &manifest(1, true, None)).await.unwrap();
}

// ── Scenario: package compilation fan-out ──────────────────────────

#[tokio::test]
async fn compilation_follows_the_dependency_dag_and_recompiles_minimally() {
    let world = world();
    seed_stemcell(&world).await;
    // DAG: b and c depend on a; d depends on b and c; e independent.
    seed_release(
        &world,
        &["d", "e"],
        &[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
            ("e", &[]),
        ],
    );

    run_update(&world, &manifest(1, false, None)).await.unwrap();

    let inst = &world.ctx.store.list_instances("prod").unwrap()[0];
    let packages = inst.state["packages"].as_object().unwrap();
    assert_eq!(packages.len(), 5);
    let blob_of = |name: &str| packages[name]["blob_id"].as_str().unwrap().to_string();
    let old_blobs: Vec<(String, String)> =
        ["a", "b", "c", "d", "e"].iter().map(|n| (n.to_string(), blob_of(n))).collect();

    // Change b's source; only b and its dependent d recompile.
    put_package(&world.ctx.store, "b", "fp-b-changed", &["a"]);
    world.cloud.clear_ops();
    run_update(&world, &manifest(1, false, None)).await.unwrap();

    let inst = &world.ctx.store.list_instances("prod").unwrap()[0];
    let packages = inst.state["packages"].as_object().unwrap();
    for (name, old_blob) in &old_blobs {
        let new_blob = packages[name]["blob_id"].as_str().unwrap();
        if name == "b" || name == "d" {
            assert_ne!(new_blob, old_blob, "{name} should have recompiled");
        } else {
            assert_eq!(new_blob, old_blob, "{name} should have been cached");
        }
    }

    // Compile VMs only; the instance VM was restarted, not replaced.
    let creates = world
        .cloud
        .ops()
        .iter()
        .filter(|op| matches!(op, CloudOp::CreateVm { .. }))
        .count();
    let deletes = world
        .cloud
        .ops()
        .iter()
        .filter(|op| matches!(op, CloudOp::DeleteVm { .. }))
        .count();
    assert_eq!(creates, deletes, "compilation vms are transient");
    assert!(creates >= 1 && creates <= 2);
}

// ── Scenario: canary gate ──────────────────────────────────────────

#[tokio::test]
async fn failed_canary_leaves_other_instances_untouched() {
    let world = world_with_behavior(DummyAgentBehavior {
        job_state_after_start: Some("failing".into()),
        ..Default::default()
    });
    seed_stemcell(&world).await;
    seed_release(&world, &["redis-server"], &[("libuv", &[]), ("redis-server", &["libuv"])]);

    let err = run_update(&world, &manifest(3, true, None)).await.unwrap_err();
    match domain(err) {
        DirectorError::InstanceUpdateFailed { job, index, .. } => {
            assert_eq!(job, "web");
            assert_eq!(index, 0);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // The canary never persisted and the rest were never started.
    assert!(world.ctx.store.list_instances("prod").unwrap().is_empty());
    assert!(world
        .ctx
        .store
        .get_lock(&lock_names::deployment("prod"))
        .unwrap()
        .is_none());
}

// ── Scenario: cancellation ─────────────────────────────────────────

#[tokio::test]
async fn cancelled_task_stops_at_the_next_suspension_point() {
    let world = world();
    seed_stemcell(&world).await;
    seed_release(&world, &["redis-server"], &[("libuv", &[]), ("redis-server", &["libuv"])]);

    let cancel = CancelToken::new();
    cancel.trip();
    let err = run_update_with_cancel(&world, &manifest(3, true, None), cancel)
        .await
        .unwrap_err();
    assert_eq!(domain(err), DirectorError::Cancelled);

    // Lock released, nothing half-persisted.
    assert!(world
        .ctx
        .store
        .get_lock(&lock_names::deployment("prod"))
        .unwrap()
        .is_none());
    assert!(world.ctx.store.list_instances("prod").unwrap().is_empty());
}

// ── Deployment deletion ────────────────────────────────────────────

#[tokio::test]
async fn delete_deployment_tears_everything_down() {
    let world = world();
    seed_stemcell(&world).await;
    seed_release(&world, &["redis-server"], &[("libuv", &[]), ("redis-server", &["libuv"])]);
    run_update(&world, &manifest(2, true, Some(512))).await.unwrap();
    assert_eq!(world.cloud.vm_count(), 2);
    assert_eq!(world.cloud.disk_count(), 2);

    let handler = DeleteDeploymentJob {
        ctx: world.ctx.clone(),
    };
    handler
        .run(task_context(&world, json!({"name": "prod"}), CancelToken::new()))
        .await
        .unwrap();

    assert_eq!(world.cloud.vm_count(), 0);
    assert_eq!(world.cloud.disk_count(), 0);
    assert!(world.ctx.store.get_deployment("prod").unwrap().is_none());
    assert!(world.ctx.store.list_instances("prod").unwrap().is_empty());
    assert!(world.ctx.store.list_vms("prod").unwrap().is_empty());
}

// ── Scaling down marks instances obsolete ──────────────────────────

#[tokio::test]
async fn scaling_down_deletes_obsolete_instances() {
    let world = world();
    seed_stemcell(&world).await;
    seed_release(&world, &["redis-server"], &[("libuv", &[]), ("redis-server", &["libuv"])]);

    run_update(&world, &manifest(3, true, None)).await.unwrap();
    run_update(&world, &manifest(2, true, None)).await.unwrap();

    let instances = world.ctx.store.list_instances("prod").unwrap();
    assert_eq!(instances.len(), 2);
    assert_eq!(world.cloud.vm_count(), 2);
}

// ── Release deletion guard ─────────────────────────────────────────

#[tokio::test]
async fn release_in_use_refuses_deletion_unless_forced() {
    let world = world();
    seed_stemcell(&world).await;
    seed_release(&world, &["redis-server"], &[("libuv", &[]), ("redis-server", &["libuv"])]);
    run_update(&world, &manifest(1, true, None)).await.unwrap();

    let handler = DeleteReleaseJob {
        ctx: world.ctx.clone(),
    };
    let err = handler
        .run(task_context(
            &world,
            json!({"name": "redis", "force": false}),
            CancelToken::new(),
        ))
        .await
        .unwrap_err();
    assert!(matches!(domain(err), DirectorError::ReleaseInUse(_)));

    handler
        .run(task_context(
            &world,
            json!({"name": "redis", "force": true}),
            CancelToken::new(),
        ))
        .await
        .unwrap();
    assert!(world.ctx.store.get_release("redis").unwrap().is_none());
}

// ── Stemcell upload ────────────────────────────────────────────────

#[tokio::test]
async fn stemcell_upload_registers_with_the_provider() {
    let world = world();

    // Build a stemcell bundle by hand.
    let bundle_path = world.tmp.path().join("stemcell.tgz");
    write_tgz(
        &bundle_path,
        &[
            (
                "stemcell.MF",
                b"name: centos\nversion: \"9\"\ncloud_properties:\n  infrastructure: vsphere\n"
                    as &[u8],
            ),
            ("image", b"image-bytes"),
        ],
    );

    let handler = UpdateStemcellJob {
        ctx: world.ctx.clone(),
    };
    let result = handler
        .run(task_context(
            &world,
            json!({"bundle_path": bundle_path.to_string_lossy()}),
            CancelToken::new(),
        ))
        .await
        .unwrap();
    assert_eq!(result, "/stemcells/centos/9");

    let record = world.ctx.store.get_stemcell("centos", "9").unwrap().unwrap();
    assert!(record.cid.starts_with("sc-"));
    assert!(world
        .cloud
        .ops()
        .iter()
        .any(|op| matches!(op, CloudOp::CreateStemcell { .. })));

    // A second upload of the same (name, version) is refused.
    let err = handler
        .run(task_context(
            &world,
            json!({"bundle_path": bundle_path.to_string_lossy()}),
            CancelToken::new(),
        ))
        .await
        .unwrap_err();
    assert!(matches!(domain(err), DirectorError::ValidationFailed(_)));
}

fn write_tgz(dest: &std::path::Path, entries: &[(&str, &[u8])]) {
    use std::io::Write;
    let file = std::fs::File::create(dest).unwrap();
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::fast());
    let mut builder = tar::Builder::new(encoder);
    for (name, bytes) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *bytes).unwrap();
    }
    builder
        .into_inner()
        .unwrap()
        .finish()
        .unwrap()
        .flush()
        .unwrap();
}
