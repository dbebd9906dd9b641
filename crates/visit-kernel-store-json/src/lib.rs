use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use visit_kernel_core::{Amenity, RecordId, VisitState, VisitStates};

pub const FORMAT_VERSION: u32 = 1;

/// Whole-file JSON persistence for [`VisitStates`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonStateStore {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
struct StateDocument<'a> {
    format_version: u32,
    visits: &'a VisitStates,
}

#[derive(Debug, Deserialize)]
struct RawStateDocument {
    #[serde(default)]
    format_version: Option<u32>,
    #[serde(default)]
    visits: BTreeMap<String, Value>,
}

impl JsonStateStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the durable copy. Never fails: a missing file reads as an empty
    /// mapping, an unreadable or corrupt one is logged and read as empty.
    #[must_use]
    pub fn load(&self) -> VisitStates {
        match self.try_load() {
            Ok(Some(states)) => {
                debug!(path = %self.path.display(), entries = states.len(), "loaded visit state");
                states
            }
            Ok(None) => {
                debug!(path = %self.path.display(), "no visit state file; starting empty");
                VisitStates::new()
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %format!("{err:#}"), "discarding unreadable visit state");
                VisitStates::new()
            }
        }
    }

    /// Strict variant of [`JsonStateStore::load`]. `Ok(None)` means the file
    /// does not exist.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or is not a JSON object.
    pub fn try_load(&self) -> Result<Option<VisitStates>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        let document: RawStateDocument = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;

        match document.format_version {
            Some(version) if version > FORMAT_VERSION => {
                warn!(version, supported = FORMAT_VERSION, "visit state written by a newer format");
            }
            None => debug!("visit state has no format_version; assuming {FORMAT_VERSION}"),
            Some(_) => {}
        }

        let mut states = VisitStates::new();
        for (id, raw) in document.visits {
            if let Some(state) = decode_entry(&id, raw) {
                states.insert(RecordId::new(id), &state);
            }
        }
        Ok(Some(states))
    }

    /// Serialize the whole mapping and atomically replace the durable copy.
    ///
    /// # Errors
    /// Returns an error when the temp file cannot be written or renamed; the
    /// previous durable copy is left untouched in that case.
    pub fn save(&self, states: &VisitStates) -> Result<()> {
        let bytes = encode_document(states)?;
        write_atomic(&self.path, &bytes)?;
        debug!(path = %self.path.display(), entries = states.len(), "saved visit state");
        Ok(())
    }

    /// Reset every entry to the default state and persist in one write.
    ///
    /// # Errors
    /// Returns an error when the reset mapping cannot be saved. The in-memory
    /// mapping is reset either way.
    pub fn clear_all(&self, states: &mut VisitStates) -> Result<()> {
        states.reset_all();
        self.save(states)?;
        info!(path = %self.path.display(), entries = states.len(), "cleared all visit state");
        Ok(())
    }
}

/// Decode one stored entry. Unrecognized amenities are dropped so the rest of
/// the entry survives.
fn decode_entry(id: &str, mut raw: Value) -> Option<VisitState> {
    if let Some(attributes) = raw.get_mut("attributes") {
        let known = match attributes.take() {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| {
                    let amenity = item.as_str().and_then(Amenity::parse);
                    if amenity.is_none() {
                        warn!(record_id = %id, attribute = %item, "dropping unrecognized amenity");
                    }
                    amenity
                })
                .map(|amenity| Value::String(amenity.as_str().to_string()))
                .collect(),
            Value::Null => Vec::new(),
            other => {
                warn!(record_id = %id, attributes = %other, "dropping malformed amenity list");
                Vec::new()
            }
        };
        *attributes = Value::Array(known);
    }

    match serde_json::from_value::<VisitState>(raw) {
        Ok(state) => Some(state),
        Err(err) => {
            warn!(record_id = %id, error = %err, "skipping malformed visit entry");
            None
        }
    }
}

/// Deterministic document bytes for `states`.
///
/// # Errors
/// Returns an error if serialization fails.
pub fn encode_document(states: &VisitStates) -> Result<Vec<u8>> {
    let document = StateDocument { format_version: FORMAT_VERSION, visits: states };
    let mut bytes =
        serde_json::to_vec_pretty(&document).context("failed to serialize visit state")?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory {}", parent.display()))?;

    let mut temp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    temp.write_all(contents).context("failed to write visit state temp file")?;
    temp.as_file().sync_all().context("failed to sync visit state temp file")?;
    temp.persist(path).with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// One row of the flat list format written by earlier releases.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct LegacyEntry {
    #[serde(rename = "nome")]
    pub name: String,
    #[serde(rename = "jv", default)]
    pub visited: bool,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(rename = "quadra", default)]
    pub sport_court: bool,
    #[serde(rename = "parquinho", default)]
    pub playground: bool,
    #[serde(rename = "academia", default)]
    pub gym: bool,
    #[serde(rename = "semnada", default)]
    pub no_amenities: bool,
}

impl LegacyEntry {
    #[must_use]
    pub fn visited_at(&self) -> Option<OffsetDateTime> {
        let seconds = self.timestamp.filter(|value| value.is_finite())?;
        #[allow(clippy::cast_possible_truncation)]
        let seconds = seconds.trunc() as i64;
        OffsetDateTime::from_unix_timestamp(seconds).ok()
    }

    /// Equivalent visit state, normalized. A visited row without a usable
    /// timestamp reads as unvisited.
    #[must_use]
    pub fn to_state(&self) -> VisitState {
        let attributes = [
            (Amenity::SportCourt, self.sport_court),
            (Amenity::Playground, self.playground),
            (Amenity::Gym, self.gym),
        ]
        .into_iter()
        .filter_map(|(amenity, present)| present.then_some(amenity))
        .collect::<BTreeSet<_>>();

        VisitState {
            visited: self.visited,
            visited_at: self.visited_at(),
            attributes,
            no_amenities: self.no_amenities,
        }
        .normalized()
    }
}

/// Read a legacy flat-list state file.
///
/// # Errors
/// Returns an error when the file cannot be read or is not a JSON array of
/// entries.
pub fn read_legacy_entries(path: &Path) -> Result<Vec<LegacyEntry>> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read legacy file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse legacy file {}", path.display()))
}
