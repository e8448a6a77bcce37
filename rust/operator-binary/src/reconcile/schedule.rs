//! Runs the reconciliation jobs on their fixed periods while this replica leads

use std::time::Duration;

use time::OffsetDateTime;
use tokio::{
    sync::watch,
    time::{interval, MissedTickBehavior},
};
use tracing::{error, info};

use super::Job;
use crate::Ctx;

pub const CAPTURE_PERIOD: Duration = Duration::from_secs(10 * 60);
pub const CLEANUP_PERIOD: Duration = Duration::from_secs(4 * 60 * 60);

const CAPTURE_JOBS: [Job; 2] = [Job::CheckAndCache, Job::CheckAndMark];
const CLEANUP_JOBS: [Job; 2] = [Job::PurgeDeleted, Job::CleanupExpiring];

fn leading(leadership: &watch::Receiver<bool>) -> bool {
    *leadership.borrow()
}

/// Runs the jobs until `leadership` turns `false` (or its sender goes away).
///
/// Leadership is checked again before every job, so a lost lease never starts another job.
pub async fn run(ctx: &Ctx, mut leadership: watch::Receiver<bool>) {
    let mut capture = interval(CAPTURE_PERIOD);
    let mut cleanup = interval(CLEANUP_PERIOD);
    capture.set_missed_tick_behavior(MissedTickBehavior::Delay);
    cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let jobs = tokio::select! {
            biased;
            _ = leadership.wait_for(|leading| !leading) => break,
            _ = capture.tick() => CAPTURE_JOBS,
            _ = cleanup.tick() => CLEANUP_JOBS,
        };
        for job in jobs {
            if !leading(&leadership) {
                info!(job = <&str>::from(job), "leadership lost, not starting job");
                return;
            }
            if let Err(err) = job.run(ctx, OffsetDateTime::now_utc()).await {
                error!(
                    job = <&str>::from(job),
                    error = &err as &dyn std::error::Error,
                    error.category = err.category(),
                    "reconciliation job failed"
                );
            }
        }
    }
    info!("leadership lost, stopping reconciliation");
}
