//! Background session sweep.
//!
//! One thread owns the periodic work: expiry checks, open-file rechecks,
//! orphaned-file cleanup and queue flushing. It shares the pipeline mutex
//! with the ingestion path (expiry-close and event-close race on the same
//! keys) but never holds it across delivery I/O. The cadence stretches when
//! the tracker is idle, mirroring load instead of a fixed tick.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::SweepConfig;
use crate::delivery::DeliveryClient;
use crate::editors::ProcessScanner;
use crate::events::EventPipeline;

const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

pub fn spawn_sweeper<S: ProcessScanner + Send + 'static>(
    pipeline: Arc<Mutex<EventPipeline<S>>>,
    delivery: Arc<Mutex<DeliveryClient>>,
    config: SweepConfig,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let base = Duration::from_secs(config.interval_secs.max(1));
        let idle_max = Duration::from_secs(config.idle_max_interval_secs.max(config.interval_secs));
        let mut interval = base;

        loop {
            if sleep_interruptible(interval, &shutdown) {
                return;
            }

            let (envelopes, active_sessions) = {
                let mut pipeline = match pipeline.lock() {
                    Ok(guard) => guard,
                    Err(_) => {
                        warn!("Pipeline lock poisoned, sweeper exiting");
                        return;
                    }
                };
                let now = Utc::now();
                let mut envelopes = pipeline.check_expired(now);
                envelopes.extend(pipeline.check_open_files(now));
                envelopes.extend(pipeline.cleanup_orphaned(now));
                let active = pipeline.stats_snapshot().sessions.active_sessions;
                (envelopes, active)
            };

            {
                let mut delivery = match delivery.lock() {
                    Ok(guard) => guard,
                    Err(_) => {
                        warn!("Delivery lock poisoned, sweeper exiting");
                        return;
                    }
                };
                for envelope in envelopes {
                    delivery.submit(envelope);
                }
                delivery.flush();
            }

            // No sessions, nothing queued to watch: stretch the cadence.
            interval = if active_sessions == 0 {
                (interval + interval / 2).min(idle_max)
            } else {
                base
            };
            debug!(
                active_sessions,
                next_interval_secs = interval.as_secs(),
                "Sweep pass complete"
            );
        }
    })
}

fn sleep_interruptible(total: Duration, shutdown: &AtomicBool) -> bool {
    let mut slept = Duration::ZERO;
    while slept < total {
        if shutdown.load(Ordering::SeqCst) {
            return true;
        }
        let step = SHUTDOWN_POLL.min(total - slept);
        thread::sleep(step);
        slept += step;
    }
    shutdown.load(Ordering::SeqCst)
}
