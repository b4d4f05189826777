use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::utils::config::SchedulerConfig;

use super::orders::OrderService;

/// Periodic expiry sweep over the order book.
pub struct Sweeper {
  orders: OrderService,
  interval: Duration,
}

impl Sweeper {
  pub fn new(orders: OrderService, config: &SchedulerConfig) -> Self {
    Self {
      orders,
      interval: config.interval,
    }
  }

  /// Expires due orders once. Returns how many were expired.
  pub async fn sweep(&self) -> usize {
    match self.orders.expire_due(Utc::now()).await {
      Ok(0) => 0,
      Ok(expired) => {
        info!("sweep expired {} orders", expired);
        expired
      }
      Err(e) => {
        error!("failed to sweep due orders. Err = {}", e);
        0
      }
    }
  }

  /// Ticks until `shutdown` flips to true or its sender is dropped. A sweep in flight finishes first.
  pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(self.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!("sweep running every {:?}", self.interval);

    loop {
      tokio::select! {
        _ = ticker.tick() => {
          self.sweep().await;
        }
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
      }
    }
    info!("sweep stopped");
  }

  pub fn spawn(self) -> (watch::Sender<bool>, JoinHandle<()>) {
    let (stop, shutdown) = watch::channel(false);
    let handle = tokio::spawn(self.run(shutdown));
    (stop, handle)
  }
}
