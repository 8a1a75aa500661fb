//! Worker pool reconciliation with simulated processes.


use std::sync::atomic::Ordering;

use buildfarm::config::BuildGroup;
use buildfarm::error::BackendError;
use buildfarm::worker::WorkerPool;
use test_harness::{dead_worker, running_worker, FakeSpawner};

#[test]
fn test_empty_pool_spins_up_to_max_workers() {
    let spawner = FakeSpawner::new();
    let mut pool = WorkerPool::new(BuildGroup::new(0, "PC", &["x86_64"], 2));

    let started = pool.spin_up_to_capacity(spawner.as_ref());

    assert_eq!(started, 2);
    assert_eq!(pool.len(), 2);
    let spawned = spawner.spawned_for(0);
    assert_eq!(spawned.len(), 2);
    assert!(spawned.iter().all(|s| s.is_started()));
}

#[test]
fn test_partial_pool_only_fills_the_deficit() {
    let spawner = FakeSpawner::new();
    let mut pool = WorkerPool::new(BuildGroup::new(1, "ARM", &["armv7"], 3));
    let (existing, _) = running_worker(1, 0);
    pool.push(existing);

    let started = pool.spin_up_to_capacity(spawner.as_ref());

    assert_eq!(started, 2);
    assert_eq!(spawner.spawn_count(), 2);
    assert_eq!(pool.len(), 3);
}

#[test]
fn test_spin_up_is_a_no_op_at_capacity() {
    let spawner = FakeSpawner::new();
    let mut pool = WorkerPool::new(BuildGroup::new(0, "PC", &["x86_64"], 2));
    pool.spin_up_to_capacity(spawner.as_ref());

    assert_eq!(pool.spin_up_to_capacity(spawner.as_ref()), 0);
    assert_eq!(spawner.spawn_count(), 2);
}

#[test]
fn test_new_workers_get_fresh_numbers() {
    let spawner = FakeSpawner::new();
    let mut pool = WorkerPool::new(BuildGroup::new(0, "PC", &["x86_64"], 2));
    let (existing, _) = running_worker(0, 4);
    pool.push(existing);

    pool.spin_up_to_capacity(spawner.as_ref());

    let nums: Vec<usize> = pool.workers().iter().map(|w| w.worker_num).collect();
    assert_eq!(nums, vec![4, 5]);
}

#[test]
fn test_failed_start_is_skipped() {
    let spawner = FakeSpawner::new();
    spawner.fail_start.store(true, Ordering::SeqCst);
    let mut pool = WorkerPool::new(BuildGroup::new(0, "PC", &["x86_64"], 2));

    assert_eq!(pool.spin_up_to_capacity(spawner.as_ref()), 0);
    assert!(pool.is_empty());
}

#[test]
fn test_prune_removes_dead_and_calls_termination_hook() {
    let mut pool = WorkerPool::new(BuildGroup::new(0, "PC", &["x86_64"], 2));
    let (alive, alive_state) = running_worker(0, 0);
    let (dead, dead_state) = dead_worker(0, 1);
    pool.push(alive);
    pool.push(dead);

    assert_eq!(pool.prune_dead(false).unwrap(), 1);

    assert_eq!(pool.len(), 1);
    assert_eq!(dead_state.terminations(), 1);
    assert_eq!(alive_state.terminations(), 0);
}

#[test]
fn test_prune_with_fail_fast_cleans_up_then_fails() {
    let mut pool = WorkerPool::new(BuildGroup::new(0, "PC", &["x86_64"], 2));
    let (alive, _) = running_worker(0, 0);
    let (dead, dead_state) = dead_worker(0, 1);
    pool.push(alive);
    pool.push(dead);

    let err = pool.prune_dead(true).unwrap_err();

    assert!(matches!(
        err,
        BackendError::WorkerDied {
            group_id: 0,
            count: 1
        }
    ));
    assert_eq!(pool.len(), 1);
    assert_eq!(dead_state.terminations(), 1);
}

#[test]
fn test_prune_with_fail_fast_passes_when_all_alive() {
    let mut pool = WorkerPool::new(BuildGroup::new(0, "PC", &["x86_64"], 2));
    let (alive, _) = running_worker(0, 0);
    pool.push(alive);

    assert_eq!(pool.prune_dead(true).unwrap(), 0);
    assert_eq!(pool.len(), 1);
}

#[test]
fn test_dead_worker_is_replaced_on_next_spin_up() {
    let spawner = FakeSpawner::new();
    let mut pool = WorkerPool::new(BuildGroup::new(0, "PC", &["x86_64"], 2));
    pool.spin_up_to_capacity(spawner.as_ref());
    spawner.spawned_for(0)[0].kill();

    pool.prune_dead(false).unwrap();
    assert_eq!(pool.spin_up_to_capacity(spawner.as_ref()), 1);
    assert_eq!(pool.len(), 2);
    assert_eq!(spawner.spawn_count(), 3);
}

#[test]
fn test_terminate_all_stops_every_worker_once() {
    let mut pool = WorkerPool::new(BuildGroup::new(0, "PC", &["x86_64"], 3));
    let (a, a_state) = running_worker(0, 0);
    let (b, b_state) = dead_worker(0, 1);
    pool.push(a);
    pool.push(b);

    let stopped = pool.terminate_all();

    assert_eq!(stopped.len(), 2);
    assert!(pool.is_empty());
    assert_eq!(a_state.terminations(), 1);
    assert_eq!(b_state.terminations(), 1);
    assert!(pool.terminate_all().is_empty());
}

#[tokio::test]
async fn test_stopped_handles_can_be_joined() {
    let mut pool = WorkerPool::new(BuildGroup::new(0, "PC", &["x86_64"], 1));
    let (a, _) = running_worker(0, 0);
    pool.push(a);

    for mut worker in pool.terminate_all() {
        assert!(!worker.is_alive());
        assert!(worker.join(std::time::Duration::from_secs(1)).await);
    }
}

#[test]
fn test_departed_workers_are_reported_once() {
    let mut pool = WorkerPool::new(BuildGroup::new(3, "ARM", &["aarch64"], 3));
    let (alive, _) = running_worker(3, 0);
    let (dead, _) = dead_worker(3, 1);
    pool.push(alive);
    pool.push(dead);

    pool.prune_dead(false).unwrap();
    assert_eq!(pool.take_departed(), vec!["worker-3-1".to_string()]);
    assert!(pool.take_departed().is_empty());

    pool.terminate_all();
    assert_eq!(pool.take_departed(), vec!["worker-3-0".to_string()]);
}

#[test]
fn test_alive_count_skips_dead_workers() {
    let mut pool = WorkerPool::new(BuildGroup::new(0, "PC", &["x86_64"], 3));
    let (a, _) = running_worker(0, 0);
    let (b, b_state) = running_worker(0, 1);
    pool.push(a);
    pool.push(b);
    assert_eq!(pool.alive_count(), 2);

    b_state.kill();
    assert_eq!(pool.alive_count(), 1);
    assert_eq!(pool.len(), 2);
}
