//! End-to-end lifecycle tests for the podhost runtime.
//!
//! Every test runs a real runtime rooted in a temporary directory, with a
//! plain directory standing in for the cgroup hierarchy, and drives real
//! `sh` workloads through it.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use podhost_common::annotations as keys;
use podhost_common::config::RuntimeConfig;
use podhost_common::error::Code;
use podhost_common::types::{
    ContainerId, ContainerMetadata, ContainerState, Mount, ResourceLimits, SandboxMetadata,
    SandboxState,
};
use podhost_core::cgroup::io::BlockDevice;
use podhost_core::enforcer::CgroupEnforcer;
use podhost_runtime::Runtime;
use podhost_runtime::api::{
    ContainerConfig, ContainerFilter, ExecSyncRequest, ExitReason, PodSandboxConfig,
    PodSandboxFilter,
};
use podhost_runtime::service::{CallContext, RuntimeServer, RuntimeService};
use tempfile::TempDir;

fn runtime() -> (TempDir, Runtime) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let data = dir.path().join("data");
    let cgroups = dir.path().join("cgroup");
    let enforcer = CgroupEnforcer::new(&cgroups, &data)
        .with_host_cpus(4)
        .with_io_device(BlockDevice { major: 8, minor: 0 });
    let runtime = Runtime::builder(RuntimeConfig::with_dirs(&data, &cgroups))
        .enforcer(Arc::new(enforcer))
        .build()
        .expect("runtime");
    (dir, runtime)
}

fn sandbox_config(name: &str, handler: &str, annotations: &[(&str, &str)]) -> PodSandboxConfig {
    PodSandboxConfig {
        metadata: SandboxMetadata {
            name: name.to_string(),
            namespace: "default".to_string(),
            uid: format!("{name}-uid"),
            attempt: 0,
        },
        annotations: annotations
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect(),
        runtime_handler: handler.to_string(),
    }
}

fn container_config(name: &str, script: &str) -> ContainerConfig {
    ContainerConfig {
        metadata: ContainerMetadata {
            name: name.to_string(),
            attempt: 0,
        },
        image: "busybox:latest".to_string(),
        command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        ..ContainerConfig::default()
    }
}

async fn wait_for_exit(runtime: &Runtime, id: &ContainerId) -> i32 {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = runtime.container_status(id).await.expect("status");
        if status.state == ContainerState::Exited {
            return status.exit_code.expect("exit code");
        }
        assert!(Instant::now() < deadline, "container {id} never exited");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ── Sandboxes ────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sandbox_lifecycle_and_idempotent_teardown() {
    let (_dir, runtime) = runtime();
    let id = runtime
        .run_pod_sandbox(&sandbox_config("web", "", &[]))
        .await
        .expect("run");

    let status = runtime.pod_sandbox_status(&id).await.expect("status");
    assert_eq!(status.state, SandboxState::Running);
    assert_eq!(status.metadata.name, "web");

    runtime.stop_pod_sandbox(&id).await.expect("stop");
    runtime.stop_pod_sandbox(&id).await.expect("second stop");
    let stopped = runtime
        .list_pod_sandbox(PodSandboxFilter {
            state: Some(SandboxState::Stopped),
        })
        .await
        .expect("list");
    assert_eq!(stopped.len(), 1);

    runtime.remove_pod_sandbox(&id).await.expect("remove");
    runtime.remove_pod_sandbox(&id).await.expect("second remove");
    let err = runtime.pod_sandbox_status(&id).await.expect_err("removed");
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remove_without_stop_tears_everything_down() {
    let (_dir, runtime) = runtime();
    let sandbox = runtime
        .run_pod_sandbox(&sandbox_config("busy", "", &[]))
        .await
        .expect("run");
    let container = runtime
        .create_container(&sandbox, &container_config("sleeper", "sleep 30"))
        .await
        .expect("create");
    runtime.start_container(&container).await.expect("start");

    runtime.remove_pod_sandbox(&sandbox).await.expect("remove");
    assert_eq!(
        runtime.pod_sandbox_status(&sandbox).await.expect_err("gone").code(),
        Code::NotFound
    );
    assert_eq!(
        runtime.container_status(&container).await.expect_err("gone").code(),
        Code::NotFound
    );
    assert!(runtime.list_containers(&ContainerFilter::default()).await.expect("list").is_empty());
}

#[tokio::test]
async fn unknown_runtime_handler_is_rejected() {
    let (_dir, runtime) = runtime();
    let err = runtime
        .run_pod_sandbox(&sandbox_config("odd", "no-such-handler", &[]))
        .await
        .expect_err("unknown handler");
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(runtime.list_pod_sandbox(PodSandboxFilter::default()).await.expect("list").is_empty());
}

#[tokio::test]
async fn oversized_memory_is_rejected_before_boot() {
    let (_dir, runtime) = runtime();
    let err = runtime
        .run_pod_sandbox(&sandbox_config(
            "huge",
            "process",
            &[(keys::VM_MEMORY_SIZE_MB, "18446744073709551615")],
        ))
        .await
        .expect_err("too much memory");
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(runtime.list_pod_sandbox(PodSandboxFilter::default()).await.expect("list").is_empty());

    let sandbox = runtime
        .run_pod_sandbox(&sandbox_config("uncapped", "process", &[]))
        .await
        .expect("run");
    let mut config = container_config("greedy", "sleep 30");
    let _ = config
        .annotations
        .insert(keys::CONTAINER_MEMORY_SIZE_MB.to_string(), u64::MAX.to_string());
    let err = runtime
        .create_container(&sandbox, &config)
        .await
        .expect_err("too much memory");
    assert_eq!(err.code(), Code::InvalidArgument);
    runtime.remove_pod_sandbox(&sandbox).await.expect("remove");
}

#[tokio::test]
async fn hypervisor_annotations_are_reported_ignored_on_process_sandboxes() {
    let (_dir, runtime) = runtime();
    let id = runtime
        .run_pod_sandbox(&sandbox_config(
            "plain",
            "process",
            &[
                (keys::VM_MEMORY_ALLOW_OVERCOMMIT, "false"),
                ("example.com/unrelated", "anything"),
            ],
        ))
        .await
        .expect("run");
    let status = runtime.pod_sandbox_status(&id).await.expect("status");
    assert_eq!(status.ignored_annotations, vec![keys::VM_MEMORY_ALLOW_OVERCOMMIT.to_string()]);
    runtime.remove_pod_sandbox(&id).await.expect("remove");
}

// ── Containers ───────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn container_runs_to_completion_and_logs() {
    let (_dir, runtime) = runtime();
    let sandbox = runtime
        .run_pod_sandbox(&sandbox_config("job", "", &[]))
        .await
        .expect("run");
    let mut config = container_config("hello", "echo \"hello from $GREETING_TARGET\"");
    config.envs = vec![("GREETING_TARGET".to_string(), "podhost".to_string())];
    let container = runtime.create_container(&sandbox, &config).await.expect("create");
    assert_eq!(
        runtime.container_status(&container).await.expect("status").state,
        ContainerState::Created
    );

    runtime.start_container(&container).await.expect("start");
    assert_eq!(wait_for_exit(&runtime, &container).await, 0);
    let status = runtime.container_status(&container).await.expect("status");
    assert_eq!(status.reason, Some(ExitReason::Completed));
    assert!(status.pid.is_none());
    let logs = runtime.container_logs(&container).expect("logs");
    assert!(logs.contains("hello from podhost"), "logs: {logs}");

    let err = runtime.start_container(&container).await.expect_err("restart");
    assert_eq!(err.code(), Code::FailedPrecondition);
    runtime.remove_pod_sandbox(&sandbox).await.expect("remove");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_waits_for_grace_then_kills() {
    let (_dir, runtime) = runtime();
    let sandbox = runtime
        .run_pod_sandbox(&sandbox_config("stubborn", "", &[]))
        .await
        .expect("run");
    let container = runtime
        .create_container(&sandbox, &container_config("deaf", "trap '' TERM; sleep 30"))
        .await
        .expect("create");
    runtime.start_container(&container).await.expect("start");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    runtime
        .stop_container(&container, Duration::from_secs(2))
        .await
        .expect("stop");
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1900), "stopped after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "stopped after {elapsed:?}");

    let status = runtime.container_status(&container).await.expect("status");
    assert_eq!(status.state, ContainerState::Exited);
    assert_eq!(status.reason, Some(ExitReason::Killed));
    runtime.stop_container(&container, Duration::ZERO).await.expect("second stop");
    runtime.remove_container(&container).await.expect("remove container");
    runtime
        .stop_container(&container, Duration::ZERO)
        .await
        .expect("stop after remove");
    runtime
        .stop_container(&ContainerId::new("no-such-container"), Duration::ZERO)
        .await
        .expect("stop of unknown container");
    runtime.remove_pod_sandbox(&sandbox).await.expect("remove");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exec_sync_runs_inside_the_container() {
    let (_dir, runtime) = runtime();
    let sandbox = runtime
        .run_pod_sandbox(&sandbox_config("shell", "", &[]))
        .await
        .expect("run");
    let container = runtime
        .create_container(&sandbox, &container_config("idle", "sleep 30"))
        .await
        .expect("create");

    let request = ExecSyncRequest {
        container_id: container.clone(),
        cmd: vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo $PODHOST_CONTAINER_ID; exit 3".to_string(),
        ],
        timeout: Duration::from_secs(5),
    };
    let err = runtime.exec_sync(&request).await.expect_err("not running");
    assert_eq!(err.code(), Code::FailedPrecondition);

    runtime.start_container(&container).await.expect("start");
    let output = runtime.exec_sync(&request).await.expect("exec");
    assert_eq!(output.exit_code, 3);
    assert_eq!(output.stdout.trim(), container.as_str());

    let slow = ExecSyncRequest {
        container_id: container.clone(),
        cmd: vec!["sleep".to_string(), "10".to_string()],
        timeout: Duration::from_millis(200),
    };
    let err = runtime.exec_sync(&slow).await.expect_err("timeout");
    assert_eq!(err.code(), Code::DeadlineExceeded);
    runtime.remove_pod_sandbox(&sandbox).await.expect("remove");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn container_resources_round_trip_through_diagnostics() {
    let (_dir, runtime) = runtime();
    let sandbox = runtime
        .run_pod_sandbox(&sandbox_config("limited", "", &[]))
        .await
        .expect("run");
    let mut config = container_config("capped", "sleep 30");
    let _ = config
        .annotations
        .insert(keys::CONTAINER_MEMORY_SIZE_MB.to_string(), "256".to_string());
    let _ = config
        .annotations
        .insert(keys::CONTAINER_PROCESSOR_LIMIT.to_string(), "5000".to_string());
    let container = runtime.create_container(&sandbox, &config).await.expect("create");
    runtime.start_container(&container).await.expect("start");

    let diagnostics = runtime.diagnostics();
    let applied = diagnostics.container_resources(&container).expect("query");
    assert_eq!(applied.memory_mb, Some(256));
    assert_eq!(applied.cpu_limit, Some(5000));

    runtime
        .update_container_resources(
            &container,
            &ResourceLimits {
                memory_mb: Some(512),
                cpu_weight: Some(200),
                ..ResourceLimits::default()
            },
        )
        .await
        .expect("update");
    let applied = diagnostics.container_resources(&container).expect("query");
    assert_eq!(applied.memory_mb, Some(512));
    assert_eq!(applied.cpu_weight, Some(200));
    assert_eq!(applied.cpu_limit, Some(5000));

    let err = runtime
        .update_container_resources(
            &container,
            &ResourceLimits {
                cpu_count: Some(2),
                ..ResourceLimits::default()
            },
        )
        .await
        .expect_err("count with limit");
    assert_eq!(err.code(), Code::InvalidArgument);
    runtime.remove_pod_sandbox(&sandbox).await.expect("remove");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn devices_are_visible_only_to_their_container() {
    let (_dir, runtime) = runtime();
    let sandbox = runtime
        .run_pod_sandbox(&sandbox_config("devices", "", &[]))
        .await
        .expect("run");
    let mut with_device = container_config("with", "echo \"devices=$PODHOST_VISIBLE_DEVICES\"");
    with_device.devices = vec!["class://5B45201D-F2F2-4F3B-85BB-30FF1F953599".to_string()];
    let without_device = container_config("without", "echo \"devices=$PODHOST_VISIBLE_DEVICES\"");

    let first = runtime.create_container(&sandbox, &with_device).await.expect("create");
    let second = runtime.create_container(&sandbox, &without_device).await.expect("create");
    runtime.start_container(&first).await.expect("start");
    runtime.start_container(&second).await.expect("start");
    let _ = wait_for_exit(&runtime, &first).await;
    let _ = wait_for_exit(&runtime, &second).await;

    let first_logs = runtime.container_logs(&first).expect("logs");
    assert!(
        first_logs.contains("devices=class://5B45201D-F2F2-4F3B-85BB-30FF1F953599"),
        "logs: {first_logs}"
    );
    let second_logs = runtime.container_logs(&second).expect("logs");
    assert_eq!(second_logs.trim(), "devices=");

    let mut gpu = container_config("gpu", "true");
    gpu.devices = vec!["gpu://PCIROOT(0)#PCI(0100)".to_string()];
    let err = runtime.create_container(&sandbox, &gpu).await.expect_err("gpu on process");
    assert_eq!(err.code(), Code::InvalidArgument);
    runtime.remove_pod_sandbox(&sandbox).await.expect("remove");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writable_shares_are_denied_when_disabled() {
    let (dir, runtime) = runtime();
    let share = dir.path().join("share");
    std::fs::create_dir_all(&share).expect("share dir");
    let sandbox = runtime
        .run_pod_sandbox(&sandbox_config(
            "locked",
            "",
            &[(keys::VM_DISABLE_WRITABLE_FILE_SHARES, "true")],
        ))
        .await
        .expect("run");

    let mut writable = container_config("writer", "true");
    writable.mounts = vec![Mount::writable(&share, "/data")];
    let container = runtime.create_container(&sandbox, &writable).await.expect("create");
    let err = runtime.start_container(&container).await.expect_err("denied");
    assert_eq!(err.code(), Code::PermissionDenied);
    assert_eq!(
        runtime.container_status(&container).await.expect("status").state,
        ContainerState::Created
    );
    runtime.remove_container(&container).await.expect("remove");

    let mut readonly = container_config("reader", "true");
    readonly.mounts = vec![Mount::readonly(&share, "/data")];
    let container = runtime.create_container(&sandbox, &readonly).await.expect("create");
    runtime.start_container(&container).await.expect("start");
    assert_eq!(wait_for_exit(&runtime, &container).await, 0);
    runtime.remove_pod_sandbox(&sandbox).await.expect("remove");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn credential_specs_are_denied_when_disabled() {
    let (_dir, runtime) = runtime();
    let sandbox = runtime
        .run_pod_sandbox(&sandbox_config("creds", "", &[]))
        .await
        .expect("run");
    let mut config = container_config("gmsa", "true");
    config.credential_spec = Some("{\"DomainJoinConfig\":{}}".to_string());
    let _ = config.annotations.insert(keys::DISABLE_CREDENTIALS.to_string(), "true".to_string());
    let container = runtime.create_container(&sandbox, &config).await.expect("create");

    let err = runtime.start_container(&container).await.expect_err("denied");
    assert_eq!(err.code(), Code::PermissionDenied);
    assert!(err.to_string().contains("credential"));
    runtime.remove_pod_sandbox(&sandbox).await.expect("remove");
}

#[tokio::test]
async fn container_memory_cannot_exceed_the_sandbox() {
    let (_dir, runtime) = runtime();
    let sandbox = runtime
        .run_pod_sandbox(&sandbox_config("small", "", &[(keys::VM_MEMORY_SIZE_MB, "512")]))
        .await
        .expect("run");
    let mut config = container_config("large", "true");
    config.resources = Some(ResourceLimits {
        memory_mb: Some(1024),
        ..ResourceLimits::default()
    });
    let err = runtime.create_container(&sandbox, &config).await.expect_err("too large");
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(runtime.list_containers(&ContainerFilter::default()).await.expect("list").is_empty());
    runtime.remove_pod_sandbox(&sandbox).await.expect("remove");
}

// ── Service facade ───────────────────────────────────────────────────

#[tokio::test]
async fn cancelled_call_leaves_no_sandbox_behind() {
    let (_dir, runtime) = runtime();
    let server = RuntimeServer::new(runtime.clone());
    let ctx = CallContext::new();
    ctx.cancel.cancel();

    let status = server
        .run_pod_sandbox(&ctx, sandbox_config("never", "", &[]))
        .await
        .expect_err("cancelled");
    assert_eq!(status.code, Code::Cancelled);
    assert!(runtime.list_pod_sandbox(PodSandboxFilter::default()).await.expect("list").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn service_errors_carry_rpc_text() {
    let (_dir, runtime) = runtime();
    let server = RuntimeServer::new(runtime);
    let ctx = CallContext::with_timeout(Duration::from_secs(5));

    let status = server
        .run_pod_sandbox(&ctx, sandbox_config("bad", "", &[(keys::VM_PROCESSOR_LIMIT, "0")]))
        .await
        .expect_err("invalid limit");
    assert_eq!(status.code, Code::InvalidArgument);
    assert!(status.to_string().starts_with("rpc error: code = InvalidArgument desc = "));

    let id = server
        .run_pod_sandbox(&ctx, sandbox_config("good", "", &[]))
        .await
        .expect("run");
    server.remove_pod_sandbox(&ctx, &id).await.expect("remove");
}
