use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::booking::service::BookingService;

/// Minute-cadence safety net: sweeps overdue pending bookings to expired
/// independently of the queue, so lost timers or a dead queue cannot strand
/// a reservation in `pending`. Double-firing against the queue handler is
/// safe because the expire transition is idempotent.
pub struct ExpirationScheduler {
    service: Arc<BookingService>,
    interval: Duration,
    cancel: CancellationToken,
}

impl ExpirationScheduler {
    pub fn new(
        service: Arc<BookingService>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            service,
            interval,
            cancel,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        info!(interval_secs = self.interval.as_secs(), "expiration scheduler started");
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.service.cancel_expired_bookings().await {
                error!(error = %e, "failed to cancel expired bookings");
            }
        }
        info!("expiration scheduler stopped");
    }
}
