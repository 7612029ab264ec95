use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};

use super::{ExecutorContext, OutcomeCounters, StopSignal, VuPool};
use crate::timeline::StageTimeline;

enum Next {
    Tick,
    End,
    Stopped,
}

/// Keep as many users running as the timeline asks for, reconciling on every
/// tick.
pub(super) async fn run(
    context: ExecutorContext,
    timeline: StageTimeline,
    ramp_down: Duration,
    counters: &Arc<OutcomeCounters>,
    mut stop: StopSignal,
) -> bool {
    let mut pool = VuPool::new(&context, counters);
    let started = Instant::now();
    let end = started + timeline.total_duration();
    let mut ticks = time::interval_at(started, context.tick);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let stopped_early = loop {
        let next = tokio::select! {
            biased;
            _ = stop.stopped() => Next::Stopped,
            _ = time::sleep_until(end) => Next::End,
            _ = ticks.tick() => Next::Tick,
        };
        match next {
            Next::Stopped => break true,
            Next::End => break false,
            Next::Tick => {
                let target = timeline.vus_at(started.elapsed());
                if target != pool.active() {
                    debug!(
                        "{}: scaling from {} to {} users",
                        context.template.scenario,
                        pool.active(),
                        target
                    );
                    pool.scale_to(target, ramp_down);
                }
                pool.reap();
            }
        }
    };
    pool.shutdown(context.graceful_stop).await;
    stopped_early
}
