use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::booking::service::BookingService;
use crate::clock::Clock;

/// Slow-cadence cleanup pass: enumerates overdue pending bookings, expires
/// each one with per-row logging, then runs the bulk sweep once more. Runs
/// beside the queue handler and the scheduler; all three may fire for the
/// same booking, which the idempotent expire transition absorbs.
pub struct CleanupWorker {
    service: Arc<BookingService>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    cancel: CancellationToken,
}

impl CleanupWorker {
    pub fn new(
        service: Arc<BookingService>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            service,
            clock,
            interval,
            cancel,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        info!(interval_secs = self.interval.as_secs(), "booking cleanup worker started");
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.pass().await;
        }
        info!("booking cleanup worker stopped");
    }

    async fn pass(&self) {
        info!("starting expired bookings cleanup");

        let overdue = match self.service.overdue_bookings(self.clock.now()).await {
            Ok(overdue) => overdue,
            Err(e) => {
                error!(error = %e, "failed to enumerate overdue bookings");
                return;
            }
        };

        if overdue.is_empty() {
            debug!("no overdue bookings found");
        } else {
            info!(count = overdue.len(), "found overdue bookings");
            let mut success = 0u32;
            let mut failed = 0u32;

            for row in &overdue {
                if self.cancel.is_cancelled() {
                    info!("cleanup interrupted by shutdown");
                    return;
                }
                match self.service.expire_booking(row.booking_id).await {
                    Ok(()) => {
                        debug!(
                            booking_id = row.booking_id,
                            event_title = %row.event_title,
                            "expired overdue booking"
                        );
                        success += 1;
                    }
                    Err(e) => {
                        error!(booking_id = row.booking_id, error = %e, "failed to expire booking");
                        failed += 1;
                    }
                }
            }

            info!(success, failed, "expired bookings cleanup finished");
            if failed > 0 {
                warn!(failed, "bookings failed to expire during cleanup");
            }
        }

        // Bulk pass behind the per-row loop, in case rows appeared meanwhile.
        if let Err(e) = self.service.cancel_expired_bookings().await {
            error!(error = %e, "bulk cancellation of expired bookings failed");
        }
    }
}
