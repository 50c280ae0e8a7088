//! Artifact wire format and file loading.
//!
//! # JSON Wire Format
//!
//! ```json
//! {
//!   "shard": 2,
//!   "status": "success",
//!   "locations": [
//!     {"file": "pkg/a.py", "start_line": 10, "end_line": 10, "hits": 3},
//!     {"file": "pkg/a.py", "start_line": 11, "end_line": 14, "hits": 0}
//!   ]
//! }
//! ```
//!
//! Any executor that writes this shape is accepted. Duplicate locations are
//! summed; `status` defaults to `success` when omitted.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{ArtifactStatus, CoverageArtifact, SourceLocation, cobertura};
use crate::config::ArtifactFormat;

/// Errors decoding a coverage artifact.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Invalid JSON artifact: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid Cobertura artifact: {0}")]
    Cobertura(String),

    #[error("Invalid location {location}: {reason}")]
    InvalidLocation { location: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct ArtifactWire {
    shard: usize,
    #[serde(default = "default_status")]
    status: ArtifactStatus,
    #[serde(default)]
    locations: Vec<LocationHits>,
}

fn default_status() -> ArtifactStatus {
    ArtifactStatus::Success
}

#[derive(Clone, Serialize, Deserialize)]
struct LocationHits {
    file: String,
    start_line: u32,
    end_line: u32,
    hits: u64,
}

impl TryFrom<ArtifactWire> for CoverageArtifact {
    type Error = ArtifactError;

    fn try_from(wire: ArtifactWire) -> Result<Self, Self::Error> {
        let mut artifact = CoverageArtifact::new(wire.shard, wire.status);
        for entry in wire.locations {
            let location = SourceLocation::range(entry.file, entry.start_line, entry.end_line);
            check_location(&location)?;
            artifact.record(location, entry.hits);
        }
        Ok(artifact)
    }
}

impl From<CoverageArtifact> for ArtifactWire {
    fn from(artifact: CoverageArtifact) -> Self {
        let locations = artifact
            .hits
            .into_iter()
            .map(|(location, hits)| LocationHits {
                file: location.file,
                start_line: location.start_line,
                end_line: location.end_line,
                hits,
            })
            .collect();
        Self {
            shard: artifact.shard,
            status: artifact.status,
            locations,
        }
    }
}

fn check_location(location: &SourceLocation) -> Result<(), ArtifactError> {
    let reason = if location.file.is_empty() {
        "empty file name"
    } else if location.end_line < location.start_line {
        "end line before start line"
    } else {
        return Ok(());
    };
    Err(ArtifactError::InvalidLocation {
        location: location.to_string(),
        reason: reason.to_string(),
    })
}

/// Decodes an artifact from its JSON wire format.
pub fn decode_json(content: &str) -> Result<CoverageArtifact, ArtifactError> {
    Ok(serde_json::from_str(content)?)
}

/// Loads an artifact file.
///
/// `shard` is used for formats that do not carry a shard index (Cobertura);
/// a JSON artifact keeps the index it declares so that a mismatch can be
/// flagged by the merger.
pub fn load_artifact(
    path: &Path,
    format: ArtifactFormat,
    shard: usize,
) -> Result<CoverageArtifact, ArtifactError> {
    let content = std::fs::read_to_string(path)?;
    let format = match format {
        ArtifactFormat::Auto => detect_format(path, &content),
        explicit => explicit,
    };

    match format {
        ArtifactFormat::Cobertura => cobertura::parse(&content, shard),
        _ => decode_json(&content),
    }
}

/// Picks the format from the content. The extension only decides when the
/// content starts like neither XML nor JSON.
fn detect_format(path: &Path, content: &str) -> ArtifactFormat {
    let head = content.trim_start_matches('\u{feff}').trim_start();
    if head.starts_with('<') {
        return ArtifactFormat::Cobertura;
    }
    if head.starts_with('{') {
        return ArtifactFormat::Json;
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some("xml") => ArtifactFormat::Cobertura,
        _ => ArtifactFormat::Json,
    }
}

/// Loads a baseline of instrumentable locations (a JSON array of
/// `{file, start_line, end_line}` objects).
pub fn load_known_locations(path: &Path) -> Result<BTreeSet<SourceLocation>, ArtifactError> {
    let content = std::fs::read_to_string(path)?;
    let locations: Vec<SourceLocation> = serde_json::from_str(&content)?;
    for location in &locations {
        check_location(location)?;
    }
    Ok(locations.into_iter().collect())
}
