//! # Skywatch Tracker
//!
//! The streaming side of skywatch: a concurrent flight registry, the rule
//! dispatcher, live and resampled proximity detection, and the
//! [`StreamEngine`] that ties them together.
//!
//! ```ignore
//! let doc = RuleDocument::from_path("rules.yaml")?;
//! let engine = StreamEngine::builder()
//!     .register_callback("notify", Callback::flight(|f| { println!("{}", f); Ok(()) }))?
//!     .build(doc)?;
//!
//! let summary = engine.process_json_lines(std::io::stdin().lock())?;
//! ```

pub mod dispatch;
pub mod engine;
pub mod error;
pub mod proximity;
pub mod registry;
pub mod resample;
pub mod sweeper;

pub use dispatch::{ActionDispatcher, CsvRecord, CsvSink, TracingCsvSink, CSV_PREFIX, CSV_TARGET};
pub use engine::{EngineBuilder, Housekeeping, ReportOutcome, StreamEngine, StreamSummary};
pub use error::{TrackerError, TrackerResult};
pub use proximity::{Observed, PairKey, ProximityTracker, PROXIMITY_TARGET};
pub use registry::{FlightRegistry, FlightUpdate};
pub use resample::{Resampler, Timeline};
pub use sweeper::Sweeper;
