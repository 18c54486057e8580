//! Worker loop: claim the oldest queued request, run it, deliver the result

use std::sync::Arc;
use tracing::{debug, warn};

use super::{ExecutionRequest, Shared};
use crate::executor;
use crate::types::{ExecutionOutcome, RequestId};

enum Next {
    Run(ExecutionRequest),
    Wait,
    Retire,
}

pub(crate) async fn run_worker(shared: Arc<Shared>, worker_id: u64) {
    debug!(worker_id, "Worker started");

    loop {
        let request = {
            // Register interest before looking at the queue so a push that
            // lands in between still wakes us. Dropped before running so a
            // busy worker never absorbs a wakeup meant for an idle one.
            let notified = shared.work_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match next_job(&shared) {
                Next::Run(request) => request,
                Next::Wait => {
                    notified.await;
                    continue;
                }
                Next::Retire => break,
            }
        };

        run_request(&shared, worker_id, request).await;
    }

    debug!(worker_id, "Worker retired");
}

fn next_job(shared: &Shared) -> Next {
    let mut state = shared.lock();

    let excess = state.live_workers > state.settings.pool_size;
    let drained = !state.accepting && state.queue.is_empty();
    if excess || drained {
        state.live_workers -= 1;
        // We may have consumed a wakeup meant for queued work
        if !state.queue.is_empty() {
            shared.work_available.notify_one();
        }
        return Next::Retire;
    }

    let Some(request) = state.queue.pop_front() else {
        return Next::Wait;
    };

    state.busy_workers += 1;
    state.stats.peak_busy = state.stats.peak_busy.max(state.busy_workers);
    state.mark_running(&request.id);

    if !state.queue.is_empty() {
        shared.work_available.notify_one();
    }

    Next::Run(request)
}

async fn run_request(shared: &Shared, worker_id: u64, request: ExecutionRequest) {
    let ExecutionRequest {
        id,
        recipe,
        input,
        registry,
        cancel,
    } = request;

    debug!(worker_id, request_id = %id, steps = recipe.len(), "Executing request");

    // Operations are synchronous and may be CPU-bound
    let joined = tokio::task::spawn_blocking(move || {
        executor::execute(&recipe, &registry, input, &cancel)
    })
    .await;

    let outcome = joined.unwrap_or_else(|e| {
        warn!(worker_id, request_id = %id, error = %e, "Execution task aborted");
        ExecutionOutcome::Cancelled
    });

    complete(shared, worker_id, &id, outcome);
}

fn complete(shared: &Shared, worker_id: u64, id: &RequestId, outcome: ExecutionOutcome) {
    let mut state = shared.lock();
    state.busy_workers = state.busy_workers.saturating_sub(1);

    match &outcome {
        ExecutionOutcome::Success(_) => debug!(worker_id, request_id = %id, "Request succeeded"),
        ExecutionOutcome::Failure(err) => {
            debug!(worker_id, request_id = %id, kind = ?err.kind(), error = %err, "Request failed")
        }
        ExecutionOutcome::Cancelled => debug!(worker_id, request_id = %id, "Request cancelled"),
    }

    if !state.finish(id, outcome) {
        debug!(worker_id, request_id = %id, "Result already delivered; dropping");
    }
}
