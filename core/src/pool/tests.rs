use super::*;
use crate::errors::{ErrorKind, OperationError, ValidationError};
use crate::registry::{ArgKind, OperationDescriptor, ParamDef, ResolvedArgs};
use crate::settings::{MemorySettingsStore, SettingsStore};
use crate::types::Tag;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

/// Inputs seen by `hold`, in execution order; tests use distinct prefixes
static EXECUTED: Mutex<Vec<String>> = Mutex::new(Vec::new());

fn hold(input: &Value, args: &ResolvedArgs) -> Result<Value, OperationError> {
    let ms = args.number("ms").unwrap_or(0.0) as u64;
    std::thread::sleep(Duration::from_millis(ms));
    if let Some(text) = input.as_str() {
        EXECUTED.lock().unwrap().push(text.to_string());
    }
    Ok(input.clone())
}

/// Blocking executions in flight inside `gauge`, and the most ever seen
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);
static MAX_IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

fn gauge(input: &Value, _args: &ResolvedArgs) -> Result<Value, OperationError> {
    let now = IN_FLIGHT.fetch_add(1, Ordering::SeqCst) + 1;
    MAX_IN_FLIGHT.fetch_max(now, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(10));
    IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
    Ok(input.clone())
}

fn executed_with_prefix(prefix: &str) -> Vec<String> {
    EXECUTED
        .lock()
        .unwrap()
        .iter()
        .filter(|s| s.starts_with(prefix))
        .cloned()
        .collect()
}

fn test_registry() -> OperationRegistry {
    let mut registry = OperationRegistry::with_builtins();
    registry
        .register(
            OperationDescriptor::new("hold", "Hold", &[Tag::String], Tag::String, hold)
                .param(ParamDef::optional("ms", ArgKind::Integer, 0.0)),
        )
        .unwrap();
    registry
        .register(OperationDescriptor::new("gauge", "Gauge", &[Tag::String], Tag::String, gauge))
        .unwrap();
    registry
}

fn pool(pool_size: usize, max_queue_length: usize) -> PoolController {
    PoolController::new(
        test_registry(),
        PoolSettings::new(pool_size, max_queue_length).unwrap(),
    )
    .unwrap()
}

fn recipe(text: &str) -> Recipe {
    Recipe::from_text(text).unwrap()
}

async fn wait_for_status(pool: &PoolController, id: &RequestId, wanted: ExecutionStatus) {
    for _ in 0..400 {
        if pool.result(id).as_ref() == Some(&wanted) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("request {} never reached {:?}", id, wanted);
}

async fn wait_for_stats(pool: &PoolController, check: impl Fn(&PoolStats) -> bool) {
    for _ in 0..400 {
        if check(&pool.stats()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("stats never matched: {:?}", pool.stats());
}

/// Submit a long `hold` and wait until a worker has claimed it
async fn occupy(pool: &PoolController, input: &str, ms: u64) -> RequestId {
    let id = pool
        .submit(&recipe(&format!("hold(ms={})", ms)), input.into())
        .unwrap();
    wait_for_status(pool, &id, ExecutionStatus::Running).await;
    id
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_worker_runs_recipe() {
    let pool = pool(1, 4);

    let id = pool.submit(&recipe("upper_first | uppercase"), "hello".into()).unwrap();
    assert_eq!(
        pool.wait(&id).await,
        Some(ExecutionOutcome::Success("HELLO".into()))
    );

    let record = pool.record(&id).unwrap();
    assert!(record.started_at.is_some());
    assert!(record.completed_at.is_some());
    assert_eq!(record.fingerprint.len(), 64);

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_queued_requests_dispatch_in_submission_order() {
    let pool = pool(1, 8);
    let blocker = occupy(&pool, "fifo-0", 100).await;

    let ids: Vec<RequestId> = (1..=5)
        .map(|i| pool.submit(&recipe("hold"), format!("fifo-{}", i).into()).unwrap())
        .collect();

    pool.wait(&blocker).await;
    for id in &ids {
        assert!(pool.wait(id).await.unwrap().is_success());
    }

    assert_eq!(
        executed_with_prefix("fifo-"),
        vec!["fifo-0", "fifo-1", "fifo-2", "fifo-3", "fifo-4", "fifo-5"]
    );
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_full_queue_rejects_with_backpressure() {
    let pool = pool(1, 2);
    let blocker = occupy(&pool, "bp-0", 200).await;

    let first = assert_ok!(pool.submit(&recipe("hold"), "bp-1".into()));
    let second = assert_ok!(pool.submit(&recipe("hold"), "bp-2".into()));
    let err = assert_err!(pool.submit(&recipe("hold"), "bp-3".into()));

    assert_eq!(err, SubmitError::Backpressure { queued: 2, capacity: 2 });
    assert_eq!(err.kind(), ErrorKind::Backpressure);

    let stats = pool.stats();
    assert_eq!(stats.queued, 2);
    assert_eq!(stats.rejected, 1);

    for id in [blocker, first, second] {
        assert!(pool.wait(&id).await.unwrap().is_success());
    }
    assert!(!executed_with_prefix("bp-").contains(&"bp-3".to_string()));
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_busy_workers_never_exceed_pool_size() {
    let pool = pool(3, 32);

    let ids: Vec<RequestId> = (0..12)
        .map(|i| {
            pool.submit(&recipe("hold(ms=30)"), format!("occ-{}", i).into())
                .unwrap()
        })
        .collect();
    for id in &ids {
        pool.wait(id).await;
    }

    let stats = pool.stats();
    assert!(stats.peak_busy >= 1 && stats.peak_busy <= 3, "{:?}", stats);
    assert_eq!(stats.completed, 12);
    assert_eq!(stats.busy_workers, 0);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_executions_never_exceed_pool_size() {
    let pool = pool(3, 2);
    let recipe = Arc::new(recipe("gauge | gauge"));

    let mut submitters = tokio::task::JoinSet::new();
    for s in 0..8 {
        let pool = pool.clone();
        let recipe = recipe.clone();
        submitters.spawn(async move {
            for i in 0..10 {
                let input: Value = format!("gauge-{}-{}", s, i).into();
                let id = loop {
                    match pool.submit(&recipe, input.clone()) {
                        Ok(id) => break id,
                        Err(SubmitError::Backpressure { .. }) => {
                            tokio::time::sleep(Duration::from_millis(1)).await
                        }
                        Err(e) => panic!("unexpected submit error: {}", e),
                    }
                };
                assert!(pool.wait(&id).await.unwrap().is_success());
            }
        });
    }
    while let Some(joined) = submitters.join_next().await {
        joined.unwrap();
    }

    let max = MAX_IN_FLIGHT.load(Ordering::SeqCst);
    assert!(max >= 2 && max <= 3, "max concurrent executions {}", max);
    assert_eq!(IN_FLIGHT.load(Ordering::SeqCst), 0);
    assert_eq!(pool.stats().completed, 80);
    assert!(pool.stats().rejected > 0);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_zero_queue_length_rejects_when_all_busy() {
    let pool = pool(1, 0);
    let blocker = occupy(&pool, "zq-0", 150).await;

    let err = assert_err!(pool.submit(&recipe("hold"), "zq-1".into()));
    assert_eq!(err, SubmitError::Backpressure { queued: 0, capacity: 0 });
    assert_eq!(pool.stats().queued, 0);

    assert!(pool.wait(&blocker).await.unwrap().is_success());
    wait_for_stats(&pool, |s| s.busy_workers == 0).await;

    // An idle worker admits the request even with no queue room
    let id = assert_ok!(pool.submit(&recipe("hold"), "zq-2".into()));
    assert!(pool.wait(&id).await.unwrap().is_success());
    assert!(!executed_with_prefix("zq-").contains(&"zq-1".to_string()));
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_queued_request_never_runs() {
    let pool = pool(1, 4);
    let blocker = occupy(&pool, "cq-0", 150).await;
    let victim = pool.submit(&recipe("hold"), "cq-victim".into()).unwrap();

    assert!(pool.cancel(&victim));
    assert_eq!(
        pool.result(&victim),
        Some(ExecutionStatus::Finished(ExecutionOutcome::Cancelled))
    );
    assert!(!pool.cancel(&victim));
    assert_eq!(pool.stats().queued, 0);

    pool.wait(&blocker).await;
    assert_eq!(executed_with_prefix("cq-"), vec!["cq-0"]);
    assert_eq!(pool.stats().cancelled, 1);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_running_request() {
    let pool = pool(1, 4);
    let id = pool
        .submit(&recipe("hold(ms=200) | hold"), "cr-0".into())
        .unwrap();
    wait_for_status(&pool, &id, ExecutionStatus::Running).await;

    assert!(pool.cancel(&id));
    assert_eq!(pool.wait(&id).await, Some(ExecutionOutcome::Cancelled));

    // Stopped between steps: the second hold never ran
    assert_eq!(executed_with_prefix("cr-"), vec!["cr-0"]);
    assert!(!pool.cancel(&id));
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_request_is_not_cancellable() {
    let pool = pool(1, 1);
    assert!(!pool.cancel(&RequestId::new()));
    assert_eq!(pool.result(&RequestId::new()), None);
    assert_eq!(pool.wait(&RequestId::new()).await, None);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_grow_picks_up_queued_work() {
    let pool = pool(1, 8);

    let ids: Vec<RequestId> = (0..4)
        .map(|i| {
            pool.submit(&recipe("hold(ms=150)"), format!("grow-{}", i).into())
                .unwrap()
        })
        .collect();
    assert_ok!(pool.resize(4));

    for id in &ids {
        assert!(pool.wait(id).await.unwrap().is_success());
    }

    let stats = pool.stats();
    assert_eq!(stats.pool_size, 4);
    assert_eq!(stats.live_workers, 4);
    assert!(stats.peak_busy >= 2, "{:?}", stats);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shrink_loses_no_requests() {
    let pool = pool(4, 16);

    let ids: Vec<RequestId> = (0..8)
        .map(|i| {
            pool.submit(&recipe("hold(ms=50)"), format!("shrink-{}", i).into())
                .unwrap()
        })
        .collect();
    assert_ok!(pool.resize(1));

    for id in &ids {
        assert!(pool.wait(id).await.unwrap().is_success());
    }
    wait_for_stats(&pool, |s| s.live_workers == 1).await;

    let stats = pool.stats();
    assert_eq!(stats.completed, 8);
    assert_eq!(stats.pool_size, 1);
    assert_eq!(executed_with_prefix("shrink-").len(), 8);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resize_to_zero_rejected() {
    let pool = pool(2, 2);
    assert_eq!(pool.resize(0), Err(SettingsError::ZeroPoolSize));
    assert_eq!(pool.settings().pool_size, 2);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shrinking_queue_keeps_queued_requests() {
    let pool = pool(1, 4);
    let blocker = occupy(&pool, "sq-0", 150).await;

    let queued: Vec<RequestId> = (1..=3)
        .map(|i| pool.submit(&recipe("hold"), format!("sq-{}", i).into()).unwrap())
        .collect();

    pool.set_max_queue_length(1);
    assert_eq!(pool.stats().queued, 3);
    assert!(matches!(
        pool.submit(&recipe("hold"), "sq-4".into()),
        Err(SubmitError::Backpressure { queued: 3, capacity: 1 })
    ));

    pool.wait(&blocker).await;
    for id in &queued {
        assert!(pool.wait(id).await.unwrap().is_success());
    }
    assert_eq!(
        executed_with_prefix("sq-"),
        vec!["sq-0", "sq-1", "sq-2", "sq-3"]
    );
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_finishes_running_and_cancels_queued() {
    let pool = pool(1, 4);
    let running = occupy(&pool, "sd-0", 150).await;
    let queued_a = pool.submit(&recipe("hold"), "sd-1".into()).unwrap();
    let queued_b = pool.submit(&recipe("hold"), "sd-2".into()).unwrap();

    pool.shutdown().await;

    assert_eq!(
        pool.result(&running),
        Some(ExecutionStatus::Finished(ExecutionOutcome::Success("sd-0".into())))
    );
    for id in [queued_a, queued_b] {
        assert_eq!(
            pool.result(&id),
            Some(ExecutionStatus::Finished(ExecutionOutcome::Cancelled))
        );
    }

    assert_eq!(
        pool.submit(&recipe("hold"), "sd-3".into()),
        Err(SubmitError::ShuttingDown)
    );
    assert_eq!(pool.stats().live_workers, 0);
    assert_eq!(executed_with_prefix("sd-"), vec!["sd-0"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_recipe_never_enters_queue() {
    let pool = pool(1, 4);

    let err = pool.submit(&recipe("trim | frobnicate"), "x".into()).unwrap_err();
    assert!(matches!(
        err,
        SubmitError::Validation(ValidationError::UnknownOperation { step_index: 1, .. })
    ));

    let err = pool.submit(&recipe("uppercase"), Value::Number(1.0)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);

    let stats = pool.stats();
    assert_eq!(stats.accepted, 0);
    assert_eq!(stats.rejected, 2);
    assert_eq!(stats.queued, 0);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failure_is_delivered_with_step() {
    let pool = pool(2, 4);

    let id = pool.submit(&recipe("trim | from_hex"), " zz ".into()).unwrap();
    match pool.wait(&id).await {
        Some(ExecutionOutcome::Failure(err)) => {
            assert_eq!(err.step_index, 1);
            assert_eq!(err.kind(), ErrorKind::DomainError);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(pool.stats().failed, 1);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_take_result_removes_finished_record() {
    let pool = pool(1, 4);
    let blocker = occupy(&pool, "take-0", 100).await;

    // Not finished yet, so nothing is removed
    assert_eq!(pool.take_result(&blocker), None);
    assert!(pool.result(&blocker).is_some());

    pool.wait(&blocker).await;
    assert_eq!(
        pool.take_result(&blocker),
        Some(ExecutionOutcome::Success("take-0".into()))
    );
    assert_eq!(pool.result(&blocker), None);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_swap_registry_affects_new_submissions() {
    let pool = PoolController::new(OperationRegistry::with_builtins(), PoolSettings::default())
        .unwrap();

    assert_err!(pool.submit(&recipe("hold"), "swap-0".into()));

    pool.swap_registry(test_registry());
    let id = assert_ok!(pool.submit(&recipe("hold"), "swap-1".into()));
    assert!(pool.wait(&id).await.unwrap().is_success());
    assert!(pool.registry().contains("hold"));
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_settings_survive_restart() {
    let store = Arc::new(MemorySettingsStore::new());

    let pool = assert_ok!(PoolController::with_store(
        test_registry(),
        store.clone(),
        PoolSettings::default()
    ));
    assert_eq!(pool.settings(), PoolSettings::default());

    let updated = PoolSettings::new(3, 9).unwrap();
    assert_ok!(pool.apply_settings(updated));
    assert_eq!(pool.settings(), updated);
    wait_for_stats(&pool, |s| s.live_workers == 3).await;
    pool.shutdown().await;

    let restarted = assert_ok!(PoolController::with_store(
        test_registry(),
        store.clone(),
        PoolSettings::default()
    ));
    assert_eq!(restarted.settings(), updated);
    assert_eq!(assert_ok!(store.load()), Some(updated));
    restarted.shutdown().await;
}

/// Store whose saves always fail
struct ReadOnlyStore;

impl SettingsStore for ReadOnlyStore {
    fn load(&self) -> anyhow::Result<Option<PoolSettings>> {
        Ok(None)
    }

    fn save(&self, _settings: &PoolSettings) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("settings store is read-only"))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_save_leaves_live_settings_alone() {
    let original = PoolSettings::new(2, 4).unwrap();
    let pool = assert_ok!(PoolController::with_store(
        test_registry(),
        Arc::new(ReadOnlyStore),
        original
    ));

    let err = assert_err!(pool.apply_settings(PoolSettings::new(5, 1).unwrap()));
    assert!(err.to_string().contains("read-only"));
    assert_eq!(pool.settings(), original);
    assert_eq!(pool.stats().live_workers, 2);
    pool.shutdown().await;
}
