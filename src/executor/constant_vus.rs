use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use super::{ExecutorContext, OutcomeCounters, StopSignal, VuPool};

/// Run `vus` users back to back for `duration`.
pub(super) async fn run(
    context: ExecutorContext,
    vus: usize,
    duration: Duration,
    counters: &Arc<OutcomeCounters>,
    mut stop: StopSignal,
) -> bool {
    let mut pool = VuPool::new(&context, counters);
    debug!(
        "{}: launching {} users for {:?}",
        context.template.scenario, vus, duration
    );
    for _ in 0..vus {
        pool.spawn_user(None);
    }

    let stopped_early = tokio::select! {
        biased;
        _ = stop.stopped() => true,
        _ = time::sleep(duration) => false,
    };
    pool.shutdown(context.graceful_stop).await;
    stopped_early
}
