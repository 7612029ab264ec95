use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tokio::time::{self, Instant};

use super::{ExecutorContext, OutcomeCounters, StopSignal, VuPool};
use crate::metrics::{self, Sample};
use crate::timeline::StageTimeline;

/// Start iterations at the instants the rate timeline schedules them.
///
/// Each due iteration goes to an idle worker; if there is none the pool grows,
/// up to `max_workers`. Past that the iteration is dropped and never retried.
pub(super) async fn run(
    context: ExecutorContext,
    timeline: StageTimeline,
    time_unit: Duration,
    pre_allocated_workers: usize,
    max_workers: usize,
    counters: &Arc<OutcomeCounters>,
    mut stop: StopSignal,
) -> bool {
    let scenario = context.template.scenario.clone();
    let mut pool = VuPool::new(&context, counters);
    let (idle_sender, idle) = flume::unbounded();
    for _ in 0..pre_allocated_workers {
        let id = pool.spawn_worker(idle_sender.clone());
        let _ = idle_sender.send(id);
    }

    let started = Instant::now();
    let scheduled = timeline.scheduled_events(time_unit);
    debug!(
        "{}: {} iterations scheduled over {:?}",
        scenario,
        scheduled,
        timeline.total_duration()
    );

    let mut stopped_early = false;
    for n in 1..=scheduled {
        let offset = match timeline.event_offset(n, time_unit) {
            Some(offset) => offset,
            None => break,
        };
        let stopped = tokio::select! {
            biased;
            _ = stop.stopped() => true,
            _ = time::sleep_until(started + offset) => false,
        };
        if stopped {
            stopped_early = true;
            break;
        }
        counters.scheduled();

        if dispatch(&pool, &idle) {
            continue;
        }
        if pool.active() < max_workers {
            let id = pool.spawn_worker(idle_sender.clone());
            debug!("{}: worker pool grown to {}", scenario, pool.active());
            if pool.iterate(id) {
                continue;
            }
        } else {
            // A worker finishing at this same instant has not reported yet.
            task::yield_now().await;
            if dispatch(&pool, &idle) {
                continue;
            }
        }

        let dropped = counters.dropped();
        context.template.metrics.record(
            Sample::counter(metrics::DROPPED_ITERATIONS, 1.0)
                .at(context.template.clock.elapsed())
                .with_tags(&context.template.tags),
        );
        if dropped == 1 {
            warn!(
                "{}: all {} workers busy, dropping iterations",
                scenario, max_workers
            );
        } else {
            debug!("{}: dropped iteration {}", scenario, n);
        }
    }

    pool.shutdown(context.graceful_stop).await;
    stopped_early
}

// Hand the iteration to a worker that reported itself idle.
fn dispatch(pool: &VuPool, idle: &flume::Receiver<usize>) -> bool {
    while let Ok(id) = idle.try_recv() {
        if pool.iterate(id) {
            return true;
        }
    }
    false
}
