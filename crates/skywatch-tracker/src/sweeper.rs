//! Background sweeper
//!
//! Periodically runs engine housekeeping on the latest data time: stale
//! flights are expired (firing their expire callbacks) and quiet proximity
//! encounters are retired and broadcast to subscribers.
//!
//! ```ignore
//! let sweeper = Sweeper::new(engine.clone(), Duration::from_secs(1));
//! tokio::spawn(sweeper.run(shutdown_token));
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::StreamEngine;

pub struct Sweeper {
    engine: Arc<StreamEngine>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(engine: Arc<StreamEngine>, interval: Duration) -> Self {
        Self {
            engine,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Run one housekeeping round; a panicking callback is logged and contained
    pub fn sweep_once(&self) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.engine.housekeeping()));
        match result {
            Ok(Some(round)) if round.expired > 0 || !round.retired.is_empty() => {
                debug!(
                    now = round.now,
                    expired = round.expired,
                    retired = round.retired.len(),
                    "Sweep complete"
                );
            }
            Ok(_) => {}
            Err(_) => error!("Sweep panicked; continuing"),
        }
    }

    /// Sweep every `interval` until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "Sweeper starting");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first immediate tick
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Sweeper shutting down");
                    break;
                }

                _ = interval.tick() => self.sweep_once(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skywatch_core::{Altitude, PositionReport};
    use skywatch_rules::{Callback, RuleDocument};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine(yaml: &str, expired: Arc<AtomicUsize>) -> Arc<StreamEngine> {
        let doc = RuleDocument::from_yaml_str(yaml).unwrap();
        let engine = StreamEngine::builder()
            .register_callback(
                "gone",
                Callback::flight(move |_| {
                    expired.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap()
            .build(doc)
            .unwrap();
        Arc::new(engine)
    }

    const YAML: &str = r#"
config:
  flight_expire_secs: 60
  expire_interval_secs: 100000
rules:
  all:
    conditions: {}
    actions:
      expire_callback: gone
"#;

    #[tokio::test]
    async fn test_sweeper_shuts_down_on_cancel() {
        let engine = engine(YAML, Arc::new(AtomicUsize::new(0)));
        let token = CancellationToken::new();
        let sweeper = Sweeper::new(engine, Duration::from_millis(10));
        let handle = tokio::spawn(sweeper.run(token.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok(), "Sweeper should shut down promptly");
    }

    #[tokio::test]
    async fn test_sweeper_expires_on_data_time() {
        let expired = Arc::new(AtomicUsize::new(0));
        let engine = engine(YAML, expired.clone());
        engine
            .process(&PositionReport::new(0, "old", 40.0, -105.0, Altitude::Feet(1000)))
            .unwrap();
        engine
            .process(&PositionReport::new(100, "new", 40.0, -105.0, Altitude::Feet(1000)))
            .unwrap();
        assert_eq!(engine.flight_count(), 2);

        let token = CancellationToken::new();
        let sweeper = Sweeper::new(engine.clone(), Duration::from_millis(5));
        let handle = tokio::spawn(sweeper.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(engine.flight_count(), 1);
        assert!(engine.flight("new").is_some());
        assert_eq!(expired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sweep_contains_callback_panic() {
        let doc = RuleDocument::from_yaml_str(YAML).unwrap();
        let engine = StreamEngine::builder()
            .register_callback("gone", Callback::flight(|_| panic!("callback blew up")))
            .unwrap()
            .build(doc)
            .unwrap();
        let engine = Arc::new(engine);
        engine
            .process(&PositionReport::new(0, "old", 40.0, -105.0, Altitude::Feet(1000)))
            .unwrap();
        engine
            .process(&PositionReport::new(100, "new", 40.0, -105.0, Altitude::Feet(1000)))
            .unwrap();

        let sweeper = Sweeper::new(engine.clone(), Duration::from_secs(1));
        sweeper.sweep_once();
        // the flight was removed before its callback ran
        assert!(engine.flight("old").is_none());
    }
}
