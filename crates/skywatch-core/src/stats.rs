//! Process-wide counters
//!
//! `Stats` is shared through an `Arc` by the ingestion path and the
//! background sweeper. Counters are plain relaxed atomics: they exist for
//! observability only and no control flow reads them back.
//!
//! `reset()` zeroes every counter. It is meant for test setup; calling it
//! while an engine is running races with concurrent increments and only
//! guarantees that each counter was zero at some instant.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($field:ident => $record:ident),* $(,)?) => {
        /// Atomic engine counters
        #[derive(Debug, Default)]
        pub struct Stats {
            $($field: AtomicU64,)*
        }

        /// Point-in-time copy of [`Stats`]
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct StatsSnapshot {
            $(pub $field: u64,)*
        }

        impl Stats {
            pub fn new() -> Self {
                Self::default()
            }

            $(
                pub fn $record(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }

            pub fn reset(&self) {
                $(self.$field.store(0, Ordering::Relaxed);)*
            }
        }
    };
}

counters! {
    reports_processed => record_report,
    reports_skipped => record_skipped,
    rules_matched => record_rule_match,
    callbacks_fired => record_callback,
    callback_errors => record_callback_error,
    csv_records => record_csv,
    takeoffs => record_takeoff,
    landings => record_landing,
    flights_created => record_flight_created,
    flights_expired => record_flight_expired,
    proximity_encounters => record_encounter,
    proximity_retired => record_encounter_retired,
}
