use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use visit_kernel_core::{
    view, AxisOrder, Catalog, CatalogKind, Criteria, KernelError, NavigationLinks, Record,
    RecordId, VisitEvent, VisitState, VisitStates,
};
use visit_kernel_store_json::{read_legacy_entries, JsonStateStore};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    pub catalog: PathBuf,
    pub kind: CatalogKind,
    pub state: PathBuf,
    pub axis_order: AxisOrder,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            catalog: PathBuf::from("./catalog.json"),
            kind: CatalogKind::Plazas,
            state: PathBuf::from("./visit_state.json"),
            axis_order: AxisOrder::LatLon,
        }
    }
}

impl KernelConfig {
    /// # Errors
    /// Returns an error when `text` is not a valid YAML config document.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).context("failed to parse config YAML")
    }

    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    /// # Errors
    /// Returns [`KernelError::Config`] when a path is empty or the state file
    /// would overwrite the catalog.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.catalog.as_os_str().is_empty() {
            return Err(KernelError::Config("catalog path MUST NOT be empty".to_string()));
        }
        if self.state.as_os_str().is_empty() {
            return Err(KernelError::Config("state path MUST NOT be empty".to_string()));
        }
        if self.state == self.catalog {
            return Err(KernelError::Config(
                "state path MUST differ from the catalog path".to_string(),
            ));
        }
        Ok(())
    }
}

/// Read and normalize a catalog file.
///
/// # Errors
/// Returns an error when the file is missing, is not JSON, or does not have the
/// shape expected for `kind`.
pub fn load_catalog(path: &Path, kind: CatalogKind, axis_order: AxisOrder) -> Result<Catalog> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read catalog {}", path.display()))?;
    let source: serde_json::Value = serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse catalog {}", path.display()))?;
    let catalog = Catalog::from_json(kind, axis_order, &source)
        .with_context(|| format!("invalid {} catalog {}", kind.as_str(), path.display()))?;
    debug!(path = %path.display(), kind = kind.as_str(), records = catalog.len(), "loaded catalog");
    Ok(catalog)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitOutcome {
    pub record_id: RecordId,
    pub state: VisitState,
    /// False when the write-through save failed; the in-memory state still
    /// reflects the transition.
    pub persisted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClearOutcome {
    pub entries: usize,
    pub persisted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewEntry {
    pub sequence: Option<usize>,
    pub record: Record,
    pub state: VisitState,
    pub links: Option<NavigationLinks>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped_unvisited: usize,
    pub skipped_existing: usize,
    pub unmatched: Vec<String>,
    pub persisted: bool,
}

/// One catalog plus its visit states, with write-through persistence.
#[derive(Debug)]
pub struct VisitKernelApi {
    catalog: Catalog,
    store: JsonStateStore,
    states: VisitStates,
}

impl VisitKernelApi {
    /// Load the catalog and the persisted visit states.
    ///
    /// # Errors
    /// Returns an error when the config is invalid or the catalog cannot be
    /// loaded. A missing or corrupt state file is not an error.
    pub fn open(config: &KernelConfig) -> Result<Self> {
        config.validate()?;
        let catalog = load_catalog(&config.catalog, config.kind, config.axis_order)?;
        Ok(Self::with_catalog(catalog, JsonStateStore::new(&config.state)))
    }

    #[must_use]
    pub fn with_catalog(catalog: Catalog, store: JsonStateStore) -> Self {
        let states = store.load();
        Self { catalog, store, states }
    }

    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    #[must_use]
    pub fn states(&self) -> &VisitStates {
        &self.states
    }

    #[must_use]
    pub fn record(&self, id: &RecordId) -> Option<&Record> {
        self.catalog.get(id)
    }

    #[must_use]
    pub fn state(&self, id: &RecordId) -> &VisitState {
        self.states.state(id)
    }

    /// Visited records in the catalog. Ids outside the catalog are not counted.
    #[must_use]
    pub fn visited_count(&self) -> usize {
        self.catalog
            .records()
            .iter()
            .filter(|record| self.states.state(&record.id).is_visited())
            .count()
    }

    pub fn set_visited(&mut self, id: &RecordId, visited: bool) -> CommitOutcome {
        self.apply_at(id, VisitEvent::SetVisited(visited), OffsetDateTime::now_utc())
    }

    pub fn set_no_amenities(&mut self, id: &RecordId, value: bool) -> CommitOutcome {
        self.apply_at(id, VisitEvent::SetNoAmenities(value), OffsetDateTime::now_utc())
    }

    pub fn set_amenity(
        &mut self,
        id: &RecordId,
        amenity: visit_kernel_core::Amenity,
        value: bool,
    ) -> CommitOutcome {
        self.apply_at(id, VisitEvent::ToggleAttribute(amenity, value), OffsetDateTime::now_utc())
    }

    /// Apply one event at `now` and write the whole mapping through.
    pub fn apply_at(&mut self, id: &RecordId, event: VisitEvent, now: OffsetDateTime) -> CommitOutcome {
        if self.catalog.get(id).is_none() {
            debug!(record_id = %id, "transition on an id outside the catalog");
        }
        let state = self.states.apply(id, event, now).clone();
        let persisted = self.persist();
        CommitOutcome { record_id: id.clone(), state, persisted }
    }

    pub fn clear_all(&mut self) -> ClearOutcome {
        let persisted = match self.store.clear_all(&mut self.states) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to persist cleared visit state");
                false
            }
        };
        ClearOutcome { entries: self.states.len(), persisted }
    }

    #[must_use]
    pub fn default_criteria(&self) -> Criteria {
        Criteria::for_catalog(&self.catalog)
    }

    #[must_use]
    pub fn view(&self, criteria: &Criteria) -> Vec<ViewEntry> {
        view(&self.catalog, &self.states, criteria)
            .into_iter()
            .map(|entry| ViewEntry {
                sequence: entry.sequence,
                record: entry.record.clone(),
                state: entry.state.clone(),
                links: NavigationLinks::for_record(entry.record),
            })
            .collect()
    }

    #[must_use]
    pub fn links(&self, id: &RecordId) -> Option<NavigationLinks> {
        self.catalog.get(id).and_then(NavigationLinks::for_record)
    }

    /// Import a legacy flat-list state file. Rows match the first catalog
    /// record with the same display name; records that are already visited
    /// keep their current state.
    ///
    /// # Errors
    /// Returns an error when the legacy file cannot be read or parsed.
    pub fn import_legacy(&mut self, path: &Path) -> Result<ImportSummary> {
        let entries = read_legacy_entries(path)?;
        let mut summary = ImportSummary::default();

        for entry in entries {
            let Some(record) = self.catalog.find_by_name(&entry.name) else {
                summary.unmatched.push(entry.name);
                continue;
            };
            let state = entry.to_state();
            if !state.is_visited() {
                summary.skipped_unvisited += 1;
                continue;
            }
            if self.states.state(&record.id).is_visited() {
                summary.skipped_existing += 1;
                continue;
            }
            self.states.insert(record.id.clone(), &state);
            summary.imported += 1;
        }

        summary.persisted = self.persist();
        info!(
            imported = summary.imported,
            unmatched = summary.unmatched.len(),
            "imported legacy visit state"
        );
        Ok(summary)
    }

    fn persist(&self) -> bool {
        match self.store.save(&self.states) {
            Ok(()) => true,
            Err(err) => {
                warn!(path = %self.store.path().display(), error = %format!("{err:#}"), "failed to persist visit state");
                false
            }
        }
    }
}
