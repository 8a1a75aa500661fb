
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use buildfarm::bus::{KeySpace, SharedStore};
use buildfarm::config::BuilderConfig;
use buildfarm::scheduler::{BuildStatus, BuildTask, JobChannel};
use buildfarm::vm::{VmDescriptor, VmManager, VmState};
use buildfarm::worker::{BuildExecutor, BuildOutcome, BuildWorker, TaskOutcome};
use test_harness::{build_task, memory_store, ready_vm, vm_manager, FakeFrontend, FlakyStore};

/// Create an executor running `script` through `sh -c` with a short timeout
fn test_executor(results: &Path, script: &str, timeout: u64) -> BuildExecutor {
    BuildExecutor::new(
        BuilderConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout,
            vm_wait_interval: 1,
        },
        results,
    )
}

fn test_vm() -> VmDescriptor {
    VmDescriptor::new("vm-1", "10.0.0.1", 0, Utc::now())
}

fn test_task() -> BuildTask {
    build_task("task-1", 42, Some("fedora-40-x86_64"))
}

#[tokio::test]
async fn test_successful_build() {
    let dir = tempfile::tempdir().unwrap();
    let executor = test_executor(dir.path(), "echo building {task_id} on {vm_ip}", 30);

    let result = executor
        .execute(&test_task(), &test_vm(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.task_id, "task-1");
    assert_eq!(result.status, BuildStatus::Succeeded);
    assert_eq!(result.outcome, BuildOutcome::Finished { exit_code: Some(0) });
    assert_eq!(result.result_dir, dir.path().join("alice/tools/task-1"));

    let log = std::fs::read_to_string(result.result_dir.join("builder.log")).unwrap();
    assert_eq!(log, "building task-1 on 10.0.0.1\n");
}

#[tokio::test]
async fn test_failed_build() {
    let dir = tempfile::tempdir().unwrap();
    let executor = test_executor(dir.path(), "echo broken >&2; exit 3", 30);

    let result = executor
        .execute(&test_task(), &test_vm(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, BuildStatus::Failure);
    assert_eq!(result.outcome, BuildOutcome::Finished { exit_code: Some(3) });
    let log = std::fs::read_to_string(result.result_dir.join("builder.log")).unwrap();
    assert!(log.contains("broken"));
}

#[tokio::test]
async fn test_build_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let executor = test_executor(dir.path(), "sleep 30", 1);

    let result = executor
        .execute(&test_task(), &test_vm(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.outcome, BuildOutcome::TimedOut);
    assert_eq!(result.status, BuildStatus::Failure);
}

#[tokio::test]
async fn test_build_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let executor = test_executor(dir.path(), "sleep 30", 60);
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        })
    };
    let result = executor
        .execute(&test_task(), &test_vm(), cancel)
        .await
        .unwrap();
    canceller.await.unwrap();

    assert_eq!(result.outcome, BuildOutcome::Interrupted);
    assert_eq!(result.status, BuildStatus::Failure);
}

#[tokio::test]
async fn test_missing_builder_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let executor = BuildExecutor::new(
        BuilderConfig {
            command: vec!["/nonexistent/buildfarm-builder".to_string()],
            ..BuilderConfig::default()
        },
        dir.path(),
    );

    assert!(executor
        .execute(&test_task(), &test_vm(), CancellationToken::new())
        .await
        .is_err());
}

#[tokio::test]
async fn test_srpm_task_result_dir() {
    let dir = tempfile::tempdir().unwrap();
    let executor = test_executor(dir.path(), "echo {chroot}", 30);
    let task = build_task("srpm-7", 7, None);

    let result = executor
        .execute(&task, &test_vm(), CancellationToken::new())
        .await
        .unwrap();

    let log = std::fs::read_to_string(result.result_dir.join("builder.log")).unwrap();
    assert_eq!(log, "srpm-builds\n");
}

/// A worker of group 0 with one ready VM and one queued task
struct WorkerFixture {
    dir: tempfile::TempDir,
    worker: BuildWorker,
    channel: JobChannel,
    vms: VmManager,
    frontend: Arc<FakeFrontend>,
}

async fn worker_fixture(script: &str, with_vm: bool) -> WorkerFixture {
    worker_fixture_on(memory_store(), script, with_vm).await
}

async fn worker_fixture_on(store: SharedStore, script: &str, with_vm: bool) -> WorkerFixture {
    let dir = tempfile::tempdir().unwrap();
    let channel = JobChannel::open(store.clone(), KeySpace::default())
        .await
        .unwrap();
    let vms = vm_manager(store);
    if with_vm {
        ready_vm(&vms, "vm-1", "10.0.0.1", 0).await;
    }
    channel.enqueue(&test_task(), Utc::now()).await.unwrap();

    let frontend = FakeFrontend::new();
    let worker = BuildWorker::new(
        0,
        1,
        channel.clone(),
        vms.clone(),
        frontend.clone(),
        test_executor(dir.path(), script, 30),
        Duration::from_millis(50),
        Duration::from_millis(50),
    );
    WorkerFixture {
        dir,
        worker,
        channel,
        vms,
        frontend,
    }
}

#[tokio::test]
async fn test_worker_builds_and_reports() {
    let fx = worker_fixture("true", true).await;
    let task = fx.channel.claim(0).await.unwrap().unwrap();

    let outcome = fx.worker.process(task, &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, TaskOutcome::Built(BuildStatus::Succeeded));
    let statuses: Vec<BuildStatus> = fx.frontend.updates().iter().map(|u| u.status).collect();
    assert_eq!(statuses, vec![BuildStatus::Running, BuildStatus::Succeeded]);
    assert!(fx.frontend.updates()[1].result_dir.is_some());

    let vm = fx.vms.get_vm("vm-1").await.unwrap().unwrap();
    assert_eq!(vm.state, VmState::Ready);
    assert_eq!(fx.vms.available(0).await.unwrap(), vec!["vm-1".to_string()]);
    assert!(fx.channel.enqueue(&test_task(), Utc::now()).await.unwrap());
}

#[tokio::test]
async fn test_worker_reports_failed_build() {
    let fx = worker_fixture("exit 1", true).await;
    let task = fx.channel.claim(0).await.unwrap().unwrap();

    let outcome = fx.worker.process(task, &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, TaskOutcome::Built(BuildStatus::Failure));
    assert_eq!(fx.frontend.updates().last().unwrap().status, BuildStatus::Failure);
}

#[tokio::test]
async fn test_worker_skips_task_frontend_refused() {
    let fx = worker_fixture("true", true).await;
    fx.frontend.refuse_start.store(true, Ordering::SeqCst);
    let task = fx.channel.claim(0).await.unwrap().unwrap();

    let outcome = fx.worker.process(task, &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, TaskOutcome::Skipped);
    assert!(fx.frontend.updates().is_empty());
    assert_eq!(fx.vms.available(0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_worker_requeues_when_frontend_unreachable() {
    let fx = worker_fixture("true", true).await;
    fx.frontend.unreachable.store(true, Ordering::SeqCst);
    let task = fx.channel.claim(0).await.unwrap().unwrap();

    let outcome = fx.worker.process(task, &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, TaskOutcome::Requeued);
    assert_eq!(fx.channel.queued(0).await.unwrap(), 1);
}

#[tokio::test]
async fn test_worker_requeues_without_vm_on_shutdown() {
    let fx = worker_fixture("true", false).await;
    let task = fx.channel.claim(0).await.unwrap().unwrap();
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let outcome = fx.worker.process(task, &shutdown).await.unwrap();

    assert_eq!(outcome, TaskOutcome::Requeued);
    assert_eq!(fx.channel.queued(0).await.unwrap(), 1);
}

#[tokio::test]
async fn test_worker_gives_up_vm_when_builder_missing() {
    let fx = worker_fixture("true", true).await;
    let worker = BuildWorker::new(
        0,
        2,
        fx.channel.clone(),
        fx.vms.clone(),
        fx.frontend.clone(),
        BuildExecutor::new(
            BuilderConfig {
                command: vec!["/nonexistent/buildfarm-builder".to_string()],
                ..BuilderConfig::default()
            },
            fx.dir.path(),
        ),
        Duration::from_millis(50),
        Duration::from_millis(50),
    );
    let task = fx.channel.claim(0).await.unwrap().unwrap();

    let outcome = worker.process(task, &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, TaskOutcome::Requeued);
    assert_eq!(fx.channel.queued(0).await.unwrap(), 1);
    let vm = fx.vms.get_vm("vm-1").await.unwrap().unwrap();
    assert_eq!(vm.state, VmState::Terminating);
    assert!(fx.vms.available(0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_worker_store_failure_returns_task_and_vm() {
    let store = FlakyStore::new();
    let fx = worker_fixture_on(store.clone(), "true", true).await;
    let task = fx.channel.claim(0).await.unwrap().unwrap();

    store.fail("subscribe");
    assert!(fx.worker.process(task, &CancellationToken::new()).await.is_err());
    store.heal();

    assert_eq!(fx.channel.queued(0).await.unwrap(), 1);
    assert_eq!(fx.vms.available(0).await.unwrap(), vec!["vm-1".to_string()]);
    assert_eq!(fx.channel.claim(0).await.unwrap().unwrap().task_id, "task-1");
}

#[tokio::test]
async fn test_worker_build_interrupted() {
    let fx = worker_fixture("sleep 30", true).await;
    let task = fx.channel.claim(0).await.unwrap().unwrap();

    let interrupter = {
        let vms = fx.vms.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            vms.interrupt_build("10.0.0.1", "cancelled").await.unwrap();
        })
    };
    let outcome = fx.worker.process(task, &CancellationToken::new()).await.unwrap();
    interrupter.await.unwrap();

    assert_eq!(outcome, TaskOutcome::Built(BuildStatus::Failure));
    assert_eq!(fx.vms.available(0).await.unwrap(), vec!["vm-1".to_string()]);
}

#[tokio::test]
async fn test_worker_shutdown_mid_build_requeues() {
    let fx = worker_fixture("sleep 30", true).await;
    let task = fx.channel.claim(0).await.unwrap().unwrap();
    let shutdown = CancellationToken::new();

    let canceller = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            shutdown.cancel();
        })
    };
    let outcome = fx.worker.process(task, &shutdown).await.unwrap();
    canceller.await.unwrap();

    assert_eq!(outcome, TaskOutcome::Requeued);
    assert_eq!(fx.channel.queued(0).await.unwrap(), 1);
    assert_eq!(fx.vms.available(0).await.unwrap(), vec!["vm-1".to_string()]);
}

#[tokio::test]
async fn test_worker_loop_drains_queue() {
    let fx = worker_fixture("true", true).await;
    let shutdown = CancellationToken::new();

    let worker = fx.worker;
    let run = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    };

    tokio::time::timeout(Duration::from_secs(10), async {
        while fx.frontend.updates().len() < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    shutdown.cancel();
    run.await.unwrap().unwrap();

    assert_eq!(fx.channel.queued(0).await.unwrap(), 0);
}
