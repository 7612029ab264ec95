use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};

use super::{ExecutorContext, OutcomeCounters, StopSignal, VuPool};

enum End {
    Finished,
    MaxDuration,
    Stopped,
}

/// Run `iterations` iterations on each of `vus` users. Whatever is still running
/// at `max_duration` is interrupted without grace.
pub(super) async fn run(
    context: ExecutorContext,
    vus: usize,
    iterations: u64,
    max_duration: Duration,
    counters: &Arc<OutcomeCounters>,
    mut stop: StopSignal,
) -> bool {
    let mut pool = VuPool::new(&context, counters);
    debug!(
        "{}: launching {} users for {} iterations each",
        context.template.scenario, vus, iterations
    );
    for _ in 0..vus {
        pool.spawn_user(Some(iterations));
    }
    let deadline = Instant::now() + max_duration;

    let end = tokio::select! {
        biased;
        _ = stop.stopped() => End::Stopped,
        _ = time::sleep_until(deadline) => End::MaxDuration,
        _ = pool.wait_all() => End::Finished,
    };
    match end {
        End::Finished => false,
        End::MaxDuration => {
            info!(
                "{}: maxDuration of {:?} reached, interrupting running iterations",
                context.template.scenario, max_duration
            );
            pool.interrupt_all().await;
            false
        }
        End::Stopped => {
            pool.shutdown(context.graceful_stop).await;
            true
        }
    }
}
