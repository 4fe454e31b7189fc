//! End-to-end tests against the `multipool-worker` binary

use futures::StreamExt;
use multipool_execution::{
    LeastPending, Pool, PoolConfig, PoolError, WorkerCommand, WorkerProcessStatus,
};
use serde_json::{json, Map};
use std::collections::HashSet;
use std::time::{Duration, Instant};

fn worker_command() -> WorkerCommand {
    WorkerCommand::new(env!("CARGO_BIN_EXE_multipool-worker"))
}

fn config(processes: usize, threads: usize, queue_count: usize) -> PoolConfig {
    PoolConfig {
        processes: Some(processes),
        threads: Some(threads),
        queue_count,
        poll_interval: Duration::from_millis(2),
        shutdown_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

async fn start(config: PoolConfig) -> Pool {
    Pool::builder(config)
        .worker_command(worker_command())
        .start()
        .await
        .expect("pool should start")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_squares_across_processes() {
    let pool = start(config(2, 4, 2)).await;

    let mut task_ids = Vec::new();
    for i in 0..8 {
        task_ids.push(pool.submit("square", vec![json!(i)], Map::new()).await.unwrap());
    }

    let completed: Vec<_> = pool.as_completed(task_ids.clone()).collect().await;
    let ids: HashSet<_> = completed.iter().map(|(task_id, _)| *task_id).collect();
    assert_eq!(ids, task_ids.iter().copied().collect::<HashSet<_>>());

    let mut values: Vec<_> = completed
        .into_iter()
        .map(|(_, result)| result.unwrap().as_i64().unwrap())
        .collect();
    values.sort_unstable();
    assert_eq!(values, vec![0, 1, 4, 9, 16, 25, 36, 49]);

    let report = pool.shutdown().await;
    assert!(report.graceful);
    assert_eq!(report.killed, 0);
    assert_eq!(pool.stats().live_workers, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failures_do_not_affect_other_tasks() {
    let pool = start(config(1, 2, 1)).await;

    let failing = pool
        .submit("fail", vec![json!("bad input")], Map::new())
        .await
        .unwrap();
    let panicking = pool
        .submit("panic", vec![json!("kaboom")], Map::new())
        .await
        .unwrap();
    let unknown = pool.submit("nope", vec![], Map::new()).await.unwrap();
    let fine = pool.submit("add", vec![json!(2), json!(5)], Map::new()).await.unwrap();

    match pool.result(failing).await {
        Err(PoolError::TaskFailed { task_id, trace }) => {
            assert_eq!(task_id, failing);
            assert!(trace.contains("bad input"));
        }
        other => panic!("unexpected result: {:?}", other),
    }
    let err = pool.result(panicking).await.unwrap_err();
    assert!(err.trace().unwrap().contains("kaboom"));
    let err = pool.result(unknown).await.unwrap_err();
    assert!(err.trace().unwrap().contains("unknown task function 'nope'"));
    assert_eq!(pool.result(fine).await.unwrap(), json!(7));

    let stats = pool.stats();
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.restarts, 0);

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_more_queues_than_processes_is_rejected() {
    let result = Pool::builder(config(2, 1, 3))
        .worker_command(worker_command())
        .start()
        .await;
    assert!(matches!(result, Err(PoolError::Config(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_round_robin_spreads_tasks_over_queues() {
    let pool = start(config(3, 1, 3)).await;

    let mut task_ids = Vec::new();
    for x in 0..9 {
        task_ids.push(pool.submit("square", vec![json!(x)], Map::new()).await.unwrap());
    }
    for task_id in task_ids {
        pool.result(task_id).await.unwrap();
    }

    let submitted: Vec<_> = pool.stats().queues.iter().map(|q| q.submitted).collect();
    assert_eq!(submitted, vec![3, 3, 3]);

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_least_pending_scheduler() {
    let pool = Pool::builder(config(2, 1, 2))
        .worker_command(worker_command())
        .scheduler(LeastPending)
        .start()
        .await
        .unwrap();

    let results = pool
        .starmap("add", vec![vec![json!(1), json!(2)], vec![json!(3), json!(4)]])
        .await
        .unwrap();
    assert_eq!(results, vec![json!(3), json!(7)]);

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_workers_are_replaced_after_ttl() {
    let mut config = config(1, 1, 1);
    config.max_tasks_per_child = 2;
    let pool = start(config).await;

    let pids = pool.map("pid", (0..6).map(|_| json!(null))).await.unwrap();
    let distinct: HashSet<_> = pids.iter().map(|pid| pid.as_u64().unwrap()).collect();
    assert!(distinct.len() >= 3, "expected at least 3 processes, got {:?}", pids);

    let stats = pool.stats();
    assert!(stats.retirements >= 2);
    assert_eq!(stats.restarts, 0);
    assert_eq!(stats.lost, 0);

    let report = pool.shutdown().await;
    assert!(report.graceful);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_crashed_worker_is_replaced() {
    let pool = start(config(1, 1, 1)).await;

    let err = pool.apply("abort", vec![], Map::new()).await.unwrap_err();
    assert!(matches!(err, PoolError::WorkerLost { .. }), "got {:?}", err);

    let value = pool.apply("square", vec![json!(3)], Map::new()).await.unwrap();
    assert_eq!(value, json!(9));

    let stats = pool.stats();
    assert_eq!(stats.restarts, 1);
    assert_eq!(stats.lost, 1);
    assert_eq!(stats.live_workers, 1);

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_crash_without_restart_fails_queued_tasks() {
    let mut config = config(1, 1, 1);
    config.restart_on_crash = false;
    let pool = start(config).await;

    let err = pool.apply("abort", vec![], Map::new()).await.unwrap_err();
    assert!(matches!(err, PoolError::WorkerLost { .. }));

    // The only queue has no live worker left
    let mut rejected = false;
    for _ in 0..200 {
        match pool.submit("square", vec![json!(2)], Map::new()).await {
            Err(PoolError::NoLiveWorkers) => {
                rejected = true;
                break;
            }
            Ok(task_id) => {
                let err = pool.result(task_id).await.unwrap_err();
                assert!(matches!(err, PoolError::WorkerLost { .. }));
            }
            Err(other) => panic!("unexpected error: {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(rejected);

    pool.terminate().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_as_completed_yields_in_completion_order() {
    let pool = start(config(1, 2, 1)).await;

    let slow = pool
        .submit("sleep_ms", vec![json!(400), json!("slow")], Map::new())
        .await
        .unwrap();
    let fast = pool
        .submit("sleep_ms", vec![json!(10), json!("fast")], Map::new())
        .await
        .unwrap();

    let completed: Vec<_> = pool.as_completed(vec![slow, fast]).collect().await;
    assert_eq!(completed.len(), 2);
    assert_eq!(completed[0].0, fast);
    assert_eq!(completed[0].1.as_ref().unwrap(), &json!("fast"));
    assert_eq!(completed[1].0, slow);
    assert_eq!(completed[1].1.as_ref().unwrap(), &json!("slow"));

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_map_keeps_input_order() {
    let pool = start(config(2, 2, 1)).await;

    // Earlier items sleep longer, so they finish last
    let items: Vec<_> = (0..6).map(|i| vec![json!((6 - i) * 20), json!(i)]).collect();
    let results = pool.starmap("sleep_ms", items).await.unwrap();
    assert_eq!(results, (0..6).map(|i| json!(i)).collect::<Vec<_>>());

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_initializer_runs_in_every_worker() {
    let pool = Pool::builder(config(2, 1, 2))
        .worker_command(worker_command())
        .initializer("set_env", vec![json!("MULTIPOOL_POOL_TEST"), json!("ready")])
        .start()
        .await
        .unwrap();

    let values = pool
        .map("env", (0..4).map(|_| json!("MULTIPOOL_POOL_TEST")))
        .await
        .unwrap();
    assert!(values.iter().all(|v| v == &json!("ready")), "got {:?}", values);

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_result_is_collected_once() {
    let pool = start(config(1, 1, 1)).await;

    let task_id = pool.submit("echo", vec![json!("hi")], Map::new()).await.unwrap();
    assert_eq!(pool.result(task_id).await.unwrap(), json!("hi"));
    assert!(matches!(
        pool.result(task_id).await,
        Err(PoolError::UnknownTask(id)) if id == task_id
    ));
    assert!(matches!(
        pool.result(9999).await,
        Err(PoolError::UnknownTask(9999))
    ));

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_submit_after_close_is_rejected() {
    let pool = start(config(1, 1, 1)).await;

    let queued = pool.submit("square", vec![json!(5)], Map::new()).await.unwrap();
    pool.close().await;
    assert!(matches!(
        pool.submit("square", vec![json!(6)], Map::new()).await,
        Err(PoolError::Closed)
    ));

    // Work queued before close still runs
    assert_eq!(pool.result(queued).await.unwrap(), json!(25));
    let report = pool.join(Duration::from_secs(10)).await;
    assert!(report.graceful);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminate_loses_running_tasks() {
    let pool = start(config(1, 1, 1)).await;

    let task_id = pool
        .submit("sleep_ms", vec![json!(30_000)], Map::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let report = pool.terminate().await;
    assert!(!report.graceful);
    assert_eq!(report.killed, 1);

    let err = pool.result(task_id).await.unwrap_err();
    assert!(matches!(err, PoolError::WorkerLost { .. }), "got {:?}", err);
    assert!(pool.is_finished());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_kills_workers_after_timeout() {
    let pool = start(config(1, 1, 1)).await;

    let task_id = pool
        .submit("sleep_ms", vec![json!(30_000)], Map::new())
        .await
        .unwrap();
    pool.close().await;

    let report = pool.join(Duration::from_millis(300)).await;
    assert!(!report.graceful);
    assert_eq!(report.killed, 1);
    assert!(report.lost >= 1);
    assert!(pool.result(task_id).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_tasks_spread_over_inner_threads() {
    let pool = start(config(1, 4, 1)).await;
    // Warm up so process start-up is not timed
    pool.apply("square", vec![json!(1)], Map::new()).await.unwrap();

    let started = Instant::now();
    let names = pool
        .map("block_ms", (0..8).map(|_| json!(300)))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // Eight 300ms blocking tasks over four threads take two rounds
    assert!(elapsed < Duration::from_millis(1500), "took {:?}", elapsed);
    let threads: HashSet<_> = names.iter().map(|name| name.as_str().unwrap().to_string()).collect();
    assert_eq!(threads.len(), 4, "threads used: {:?}", names);

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_workers_reports_live_processes() {
    let pool = start(config(1, 1, 1)).await;

    let pid = pool.apply("pid", vec![], Map::new()).await.unwrap();
    let workers = pool.workers().await;
    assert_eq!(workers.len(), 1);

    let worker = &workers[0];
    assert_eq!(worker.queue_id, 0);
    assert_eq!(worker.pid.map(u64::from), pid.as_u64());
    assert_eq!(worker.status, WorkerProcessStatus::Ready);
    assert_eq!(worker.restart_count, 0);
    assert_eq!(worker.in_flight, 0);
    assert!(worker.started_at <= chrono::Utc::now());

    pool.shutdown().await;
    assert!(pool.workers().await.is_empty());
}
