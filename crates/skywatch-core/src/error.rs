//! Error types for the skywatch core crate

use std::path::PathBuf;
use thiserror::Error;

/// Core error type shared by the report, geometry and region layers
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid position report: {0}")]
    InvalidReport(String),

    #[error("Invalid position: latitude={lat}, longitude={lon}")]
    InvalidPosition { lat: f64, lon: f64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed geofence in {source_name}: {message}")]
    Kml { source_name: String, message: String },

    #[error("Geofence markup error in {source_name}: {error}")]
    Xml {
        source_name: String,
        #[source]
        error: quick_xml::Error,
    },

    #[error("Failed to read {path}: {error}")]
    Io {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },
}

impl CoreError {
    pub fn invalid_report(msg: impl Into<String>) -> Self {
        Self::InvalidReport(msg.into())
    }

    pub fn invalid_position(lat: f64, lon: f64) -> Self {
        Self::InvalidPosition { lat, lon }
    }

    pub fn kml(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Kml {
            source_name: source_name.into(),
            message: message.into(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
