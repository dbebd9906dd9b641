use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

/// Placeholder for absent or blank source fields.
pub const UNKNOWN: &str = "-----";

const PLAZA_FIELDS: [(&str, &str); 6] = [
    ("address", "endereco"),
    ("neighborhood", "bairro"),
    ("subdivision", "loteamento"),
    ("area", "m2"),
    ("sport", "esporte"),
    ("law", "lei_dec_of"),
];

const PLAYER_FIELDS: [&str; 4] = ["age", "number", "nationality", "position"];

static DEFAULT_STATE: VisitState = VisitState {
    visited: false,
    visited_at: None,
    attributes: BTreeSet::new(),
    no_amenities: false,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("catalog error: {0}")]
    Catalog(String),
    #[error("config error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CatalogKind {
    Plazas,
    Players,
}

impl CatalogKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plazas => "plazas",
            Self::Players => "players",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "plazas" => Some(Self::Plazas),
            "players" => Some(Self::Players),
            _ => None,
        }
    }

    /// Fields that get a numeric range filter by default.
    #[must_use]
    pub fn numeric_fields(self) -> &'static [&'static str] {
        match self {
            Self::Plazas => &["area"],
            Self::Players => &["age", "number"],
        }
    }

    /// Fields that get a categorical membership filter by default.
    #[must_use]
    pub fn categorical_fields(self) -> &'static [&'static str] {
        match self {
            Self::Plazas => &["neighborhood", "subdivision"],
            Self::Players => &["nationality", "position", "team", "league"],
        }
    }
}

/// Axis order of the coordinate pair stored in the catalog source.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AxisOrder {
    #[default]
    LatLon,
    LonLat,
}

impl AxisOrder {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LatLon => "lat_lon",
            Self::LonLat => "lon_lat",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "lat_lon" | "lat-lon" => Some(Self::LatLon),
            "lon_lat" | "lon-lat" => Some(Self::LonLat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    /// Finite, inside WGS84 bounds, and neither axis exactly zero.
    #[must_use]
    pub fn is_usable(self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
            && self.lat.abs() > f64::EPSILON
            && self.lon.abs() > f64::EPSILON
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub id: RecordId,
    pub name: String,
    pub fields: BTreeMap<String, String>,
    pub coordinates: Option<Coordinates>,
}

impl Record {
    /// Normalized field text; absent fields read as [`UNKNOWN`].
    #[must_use]
    pub fn field(&self, name: &str) -> &str {
        self.fields.get(name).map_or(UNKNOWN, String::as_str)
    }

    #[must_use]
    pub fn numeric(&self, name: &str) -> Option<f64> {
        parse_number(self.field(name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Catalog {
    kind: CatalogKind,
    records: Vec<Record>,
}

impl Catalog {
    /// Normalize a parsed catalog document into records with stable ids.
    ///
    /// Plazas accept a feature array or a `FeatureCollection`; players accept
    /// `{leagues, teams, players}` or a bare player array.
    ///
    /// # Errors
    /// Returns [`KernelError::Catalog`] when the document does not have the
    /// shape expected for `kind`.
    pub fn from_json(
        kind: CatalogKind,
        axis_order: AxisOrder,
        source: &Value,
    ) -> Result<Self, KernelError> {
        let records = match kind {
            CatalogKind::Plazas => normalize_plazas(source, axis_order)?,
            CatalogKind::Players => normalize_players(source)?,
        };
        Ok(Self { kind, records })
    }

    #[must_use]
    pub fn from_records(kind: CatalogKind, records: Vec<Record>) -> Self {
        Self { kind, records }
    }

    #[must_use]
    pub fn kind(&self) -> CatalogKind {
        self.kind
    }

    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.records.iter().find(|record| &record.id == id)
    }

    /// First record in catalog order whose display name matches `name`.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<&Record> {
        let name = name.trim();
        self.records.iter().find(|record| record.name == name)
    }

    #[must_use]
    pub fn numeric_bounds(&self, field: &str) -> Option<(f64, f64)> {
        self.records.iter().filter_map(|record| record.numeric(field)).fold(None, |acc, value| {
            match acc {
                None => Some((value, value)),
                Some((min, max)) => Some((min.min(value), max.max(value))),
            }
        })
    }

    /// Distinct known values of `field`, sentinel excluded.
    #[must_use]
    pub fn distinct_values(&self, field: &str) -> BTreeSet<String> {
        self.records
            .iter()
            .map(|record| record.field(field))
            .filter(|value| *value != UNKNOWN)
            .map(str::to_string)
            .collect()
    }
}

#[must_use]
pub fn normalize_text(value: Option<&Value>) -> String {
    let text = match value {
        None | Some(Value::Null) => return UNKNOWN.to_string(),
        Some(Value::String(text)) => text.trim().to_string(),
        Some(other) => other.to_string(),
    };
    if text.is_empty() {
        UNKNOWN.to_string()
    } else {
        text
    }
}

/// Parse a normalized field as a number. Accepts `1234.5` and `1.234,5`.
#[must_use]
pub fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() || text == UNKNOWN {
        return None;
    }
    let parsed = text.parse::<f64>().ok().or_else(|| {
        if text.contains(',') {
            text.replace('.', "").replace(',', ".").parse::<f64>().ok()
        } else {
            None
        }
    });
    parsed.filter(|value| value.is_finite())
}

fn mint_record_id(
    kind: CatalogKind,
    natural_key: &str,
    seen: &mut BTreeMap<String, usize>,
) -> RecordId {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0_u8]);
    hasher.update(natural_key.as_bytes());
    let digest = hex::encode(hasher.finalize());
    let base = format!("rec-{}", &digest[..16]);

    let count = seen.entry(base.clone()).or_insert(0);
    *count += 1;
    if *count == 1 {
        RecordId(base)
    } else {
        RecordId(format!("{base}-{count}"))
    }
}

fn coordinate_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => parse_number(text),
        _ => None,
    }
}

fn parse_coordinate_pair(value: &Value, axis_order: AxisOrder) -> Option<Coordinates> {
    let items = value.as_array()?;
    let [first, second] = items.as_slice() else {
        return None;
    };
    let first = coordinate_value(first)?;
    let second = coordinate_value(second)?;
    Some(match axis_order {
        AxisOrder::LatLon => Coordinates { lat: first, lon: second },
        AxisOrder::LonLat => Coordinates { lat: second, lon: first },
    })
}

fn normalize_plazas(source: &Value, axis_order: AxisOrder) -> Result<Vec<Record>, KernelError> {
    let features = match source {
        Value::Array(items) => items,
        Value::Object(object) => {
            object.get("features").and_then(Value::as_array).ok_or_else(|| {
                KernelError::Catalog("plaza catalog object has no `features` array".to_string())
            })?
        }
        _ => {
            return Err(KernelError::Catalog(
                "plaza catalog MUST be an array of features".to_string(),
            ))
        }
    };

    let mut seen = BTreeMap::new();
    let mut records = Vec::with_capacity(features.len());
    for (index, feature) in features.iter().enumerate() {
        let properties = feature.get("properties");
        let prop = |key: &str| normalize_text(properties.and_then(|props| props.get(key)));

        let official = prop("den_oficia");
        let name = if official == UNKNOWN { prop("apelido") } else { official };

        let fields = PLAZA_FIELDS
            .iter()
            .map(|&(field, source_key)| (field.to_string(), prop(source_key)))
            .collect::<BTreeMap<_, _>>();

        let coordinates = feature
            .get("geometry")
            .and_then(|geometry| geometry.get("coordinates"))
            .and_then(|pair| parse_coordinate_pair(pair, axis_order));

        let natural_key = if name == UNKNOWN { format!("#{index}") } else { name.clone() };
        records.push(Record {
            id: mint_record_id(CatalogKind::Plazas, &natural_key, &mut seen),
            name,
            fields,
            coordinates,
        });
    }
    Ok(records)
}

fn index_by_id<'a>(items: Option<&'a Value>, id_key: &str) -> BTreeMap<String, &'a Value> {
    items
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| (normalize_text(item.get(id_key)), item))
                .filter(|(key, _)| key != UNKNOWN)
                .collect()
        })
        .unwrap_or_default()
}

fn normalize_players(source: &Value) -> Result<Vec<Record>, KernelError> {
    let (players, teams, leagues) = match source {
        Value::Array(items) => (items, BTreeMap::new(), BTreeMap::new()),
        Value::Object(object) => {
            let players = object.get("players").and_then(Value::as_array).ok_or_else(|| {
                KernelError::Catalog("player catalog object has no `players` array".to_string())
            })?;
            (
                players,
                index_by_id(object.get("teams"), "team_id"),
                index_by_id(object.get("leagues"), "league_id"),
            )
        }
        _ => {
            return Err(KernelError::Catalog(
                "player catalog MUST be an object or an array of players".to_string(),
            ))
        }
    };

    let mut seen = BTreeMap::new();
    let mut records = Vec::with_capacity(players.len());
    for (index, player) in players.iter().enumerate() {
        let name = normalize_text(player.get("name"));
        let mut fields = PLAYER_FIELDS
            .iter()
            .map(|field| ((*field).to_string(), normalize_text(player.get(*field))))
            .collect::<BTreeMap<_, _>>();

        let team = teams.get(&normalize_text(player.get("team_id"))).copied();
        let team_name = team.map_or_else(
            || normalize_text(player.get("team")),
            |team| normalize_text(team.get("team_name")),
        );
        let league_name = team
            .and_then(|team| leagues.get(&normalize_text(team.get("league_id"))))
            .map_or_else(
                || normalize_text(player.get("league")),
                |league| normalize_text(league.get("league_name")),
            );
        fields.insert("team".to_string(), team_name);
        fields.insert("league".to_string(), league_name);

        let source_id = normalize_text(player.get("id").or_else(|| player.get("player_id")));
        let natural_key = if source_id != UNKNOWN {
            format!("id:{source_id}")
        } else if name != UNKNOWN {
            name.clone()
        } else {
            format!("#{index}")
        };

        records.push(Record {
            id: mint_record_id(CatalogKind::Players, &natural_key, &mut seen),
            name,
            fields,
            coordinates: None,
        });
    }
    Ok(records)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Amenity {
    SportCourt,
    Playground,
    Gym,
}

impl Amenity {
    pub const ALL: [Self; 3] = [Self::SportCourt, Self::Playground, Self::Gym];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SportCourt => "sport_court",
            Self::Playground => "playground",
            Self::Gym => "gym",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sport_court" | "sport-court" => Some(Self::SportCourt),
            "playground" => Some(Self::Playground),
            "gym" => Some(Self::Gym),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum VisitEvent {
    SetVisited(bool),
    SetNoAmenities(bool),
    ToggleAttribute(Amenity, bool),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct VisitState {
    pub visited: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub visited_at: Option<OffsetDateTime>,
    pub attributes: BTreeSet<Amenity>,
    pub no_amenities: bool,
}

impl VisitState {
    /// A state counts as visited only when it also carries its timestamp.
    #[must_use]
    pub fn is_visited(&self) -> bool {
        self.visited && self.visited_at.is_some()
    }

    /// Project any snapshot onto the nearest state that satisfies the
    /// visit invariants.
    #[must_use]
    pub fn normalized(&self) -> Self {
        if !self.is_visited() {
            return Self::default();
        }
        let mut next = self.clone();
        if next.no_amenities {
            next.attributes.clear();
        }
        next
    }

    #[must_use]
    pub fn satisfies_invariants(&self) -> bool {
        let unvisited_is_empty = self.visited
            || (self.attributes.is_empty() && !self.no_amenities && self.visited_at.is_none());
        let exclusive = !self.no_amenities || self.attributes.is_empty();
        let timestamp_matches = self.visited_at.is_some() == self.visited;
        unvisited_is_empty && exclusive && timestamp_matches
    }

    /// Apply one toggle event. Total: events whose preconditions fail leave
    /// the (normalized) state unchanged.
    #[must_use]
    pub fn apply(&self, event: VisitEvent, now: OffsetDateTime) -> Self {
        let current = self.normalized();
        match event {
            VisitEvent::SetVisited(true) => {
                if current.visited {
                    return current;
                }
                Self {
                    visited: true,
                    visited_at: Some(truncate_to_seconds(now)),
                    attributes: BTreeSet::new(),
                    no_amenities: false,
                }
            }
            VisitEvent::SetVisited(false) => Self::default(),
            VisitEvent::SetNoAmenities(value) => {
                if !current.visited {
                    return current;
                }
                let mut next = current;
                next.no_amenities = value;
                if value {
                    next.attributes.clear();
                }
                next
            }
            VisitEvent::ToggleAttribute(amenity, value) => {
                if !current.visited || current.no_amenities {
                    return current;
                }
                let mut next = current;
                if value {
                    next.attributes.insert(amenity);
                } else {
                    next.attributes.remove(&amenity);
                }
                next
            }
        }
    }

    #[must_use]
    pub fn has_flag(&self, flag: AmenityFlag) -> bool {
        match flag {
            AmenityFlag::NoAmenities => self.no_amenities,
            AmenityFlag::SportCourt => self.attributes.contains(&Amenity::SportCourt),
            AmenityFlag::Playground => self.attributes.contains(&Amenity::Playground),
            AmenityFlag::Gym => self.attributes.contains(&Amenity::Gym),
        }
    }
}

fn truncate_to_seconds(value: OffsetDateTime) -> OffsetDateTime {
    value.replace_nanosecond(0).unwrap_or(value)
}

/// Visit state per record id. Unknown ids read as the default state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct VisitStates(BTreeMap<RecordId, VisitState>);

impl VisitStates {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self, id: &RecordId) -> &VisitState {
        self.0.get(id).unwrap_or(&DEFAULT_STATE)
    }

    #[must_use]
    pub fn contains(&self, id: &RecordId) -> bool {
        self.0.contains_key(id)
    }

    pub fn apply(&mut self, id: &RecordId, event: VisitEvent, now: OffsetDateTime) -> &VisitState {
        let entry = self.0.entry(id.clone()).or_default();
        *entry = entry.apply(event, now);
        entry
    }

    /// Overwrite one entry, normalizing it first.
    pub fn insert(&mut self, id: RecordId, state: &VisitState) {
        self.0.insert(id, state.normalized());
    }

    pub fn reset_all(&mut self) {
        for state in self.0.values_mut() {
            *state = VisitState::default();
        }
    }

    pub fn normalize_all(&mut self) {
        for state in self.0.values_mut() {
            *state = state.normalized();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RecordId, &VisitState)> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn visited_count(&self) -> usize {
        self.0.values().filter(|state| state.is_visited()).count()
    }
}

impl FromIterator<(RecordId, VisitState)> for VisitStates {
    fn from_iter<T: IntoIterator<Item = (RecordId, VisitState)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(id, state)| (id, state.normalized())).collect())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VisitStatusFilter {
    #[default]
    Any,
    VisitedOnly,
    UnvisitedOnly,
}

impl VisitStatusFilter {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::VisitedOnly => "visited_only",
            Self::UnvisitedOnly => "unvisited_only",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "any" => Some(Self::Any),
            "visited_only" | "visited" => Some(Self::VisitedOnly),
            "unvisited_only" | "unvisited" => Some(Self::UnvisitedOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AmenityFlag {
    SportCourt,
    Playground,
    Gym,
    NoAmenities,
}

impl AmenityFlag {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SportCourt => "sport_court",
            Self::Playground => "playground",
            Self::Gym => "gym",
            Self::NoAmenities => "no_amenities",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "no_amenities" | "no-amenities" => Some(Self::NoAmenities),
            other => Amenity::parse(other).map(Self::from),
        }
    }
}

impl From<Amenity> for AmenityFlag {
    fn from(value: Amenity) -> Self {
        match value {
            Amenity::SportCourt => Self::SportCourt,
            Amenity::Playground => Self::Playground,
            Amenity::Gym => Self::Gym,
        }
    }
}

/// Inclusive numeric bound on one record field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct NumericRange {
    min: f64,
    max: f64,
    observed_min: Option<f64>,
    observed_max: Option<f64>,
    #[serde(default)]
    narrowed: bool,
}

impl NumericRange {
    /// A user-supplied range. Bounds are swapped when `min > max`.
    #[must_use]
    pub fn new(min: f64, max: f64) -> Self {
        let (min, max) = ordered_bounds(min, max, None);
        Self { min, max, observed_min: None, observed_max: None, narrowed: true }
    }

    /// The full range observed in a catalog.
    #[must_use]
    pub fn observed(min: f64, max: f64) -> Self {
        let (min, max) = ordered_bounds(min, max, None);
        Self { min, max, observed_min: Some(min), observed_max: Some(max), narrowed: false }
    }

    /// Replace the bounds while remembering the observed span.
    #[must_use]
    pub fn narrowed(self, min: f64, max: f64) -> Self {
        let observed = self.observed_min.zip(self.observed_max);
        let (min, max) = ordered_bounds(min, max, observed);
        Self { min, max, narrowed: true, ..self }
    }

    #[must_use]
    pub fn min(&self) -> f64 {
        self.min
    }

    #[must_use]
    pub fn max(&self) -> f64 {
        self.max
    }

    /// True once the bounds were set explicitly, even to a span wider than
    /// the observed one.
    #[must_use]
    pub fn is_narrowed(&self) -> bool {
        self.narrowed
    }

    /// Non-numeric values pass only while the range is still the observed
    /// default.
    #[must_use]
    pub fn contains(&self, value: Option<f64>) -> bool {
        match value {
            Some(value) => self.min <= value && value <= self.max,
            None => !self.narrowed,
        }
    }
}

fn ordered_bounds(min: f64, max: f64, observed: Option<(f64, f64)>) -> (f64, f64) {
    let min = if min.is_nan() { observed.map_or(f64::MIN, |(low, _)| low) } else { min };
    let max = if max.is_nan() { observed.map_or(f64::MAX, |(_, high)| high) } else { max };
    if min > max {
        (max, min)
    } else {
        (min, max)
    }
}

/// Membership filter on one categorical record field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct CategoryFilter {
    selected: BTreeSet<String>,
    observed: BTreeSet<String>,
}

impl CategoryFilter {
    /// Every observed value selected.
    #[must_use]
    pub fn all(observed: BTreeSet<String>) -> Self {
        Self { selected: observed.clone(), observed }
    }

    /// Exactly `values`, with no knowledge of the catalog's value set.
    #[must_use]
    pub fn only<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { selected: values.into_iter().map(Into::into).collect(), observed: BTreeSet::new() }
    }

    pub fn select<I, S>(&mut self, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selected = values.into_iter().map(Into::into).collect();
    }

    #[must_use]
    pub fn selected(&self) -> &BTreeSet<String> {
        &self.selected
    }

    #[must_use]
    pub fn observed(&self) -> &BTreeSet<String> {
        &self.observed
    }

    #[must_use]
    pub fn is_narrowed(&self) -> bool {
        !self.selected.is_empty()
            && (self.observed.is_empty() || !self.observed.is_subset(&self.selected))
    }

    #[must_use]
    pub fn matches(&self, value: &str) -> bool {
        if !self.is_narrowed() {
            return true;
        }
        value != UNKNOWN && self.selected.contains(value)
    }
}

/// Conjunction of every configured filter axis.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Criteria {
    pub visit_status: VisitStatusFilter,
    pub require: BTreeSet<AmenityFlag>,
    pub ranges: BTreeMap<String, NumericRange>,
    pub categories: BTreeMap<String, CategoryFilter>,
    pub name_query: Option<String>,
}

impl Criteria {
    /// Permissive criteria with ranges spanning the observed bounds and
    /// every observed category selected.
    #[must_use]
    pub fn for_catalog(catalog: &Catalog) -> Self {
        let kind = catalog.kind();
        let ranges = kind
            .numeric_fields()
            .iter()
            .filter_map(|field| {
                catalog
                    .numeric_bounds(field)
                    .map(|(min, max)| ((*field).to_string(), NumericRange::observed(min, max)))
            })
            .collect();
        let categories = kind
            .categorical_fields()
            .iter()
            .map(|field| ((*field).to_string(), CategoryFilter::all(catalog.distinct_values(field))))
            .collect();
        Self { ranges, categories, ..Self::default() }
    }

    pub fn narrow_range(&mut self, field: &str, min: f64, max: f64) {
        let range = self
            .ranges
            .get(field)
            .map_or_else(|| NumericRange::new(min, max), |range| range.narrowed(min, max));
        self.ranges.insert(field.to_string(), range);
    }

    pub fn select_categories<I, S>(&mut self, field: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match self.categories.get_mut(field) {
            Some(filter) => filter.select(values),
            None => {
                self.categories.insert(field.to_string(), CategoryFilter::only(values));
            }
        }
    }

    #[must_use]
    pub fn matches(&self, record: &Record, state: &VisitState) -> bool {
        let status_ok = match self.visit_status {
            VisitStatusFilter::Any => true,
            VisitStatusFilter::VisitedOnly => state.is_visited(),
            VisitStatusFilter::UnvisitedOnly => !state.is_visited(),
        };
        if !status_ok {
            return false;
        }

        if !self.require.iter().all(|flag| state.has_flag(*flag)) {
            return false;
        }

        if !self.ranges.iter().all(|(field, range)| range.contains(record.numeric(field))) {
            return false;
        }

        if !self.categories.iter().all(|(field, filter)| filter.matches(record.field(field))) {
            return false;
        }

        match self.name_query.as_deref().map(str::trim) {
            Some(query) if !query.is_empty() => {
                record.name.to_lowercase().contains(&query.to_lowercase())
            }
            _ => true,
        }
    }

    #[must_use]
    pub fn predicate(&self) -> impl Fn(&Record, &VisitState) -> bool + '_ {
        build_predicate(self)
    }
}

#[must_use]
pub fn build_predicate(criteria: &Criteria) -> impl Fn(&Record, &VisitState) -> bool + '_ {
    move |record: &Record, state: &VisitState| criteria.matches(record, state)
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderedEntry<'a> {
    pub record: &'a Record,
    pub state: &'a VisitState,
    /// 1-based rank by visit time over every visited record.
    pub sequence: Option<usize>,
}

/// Visited records by ascending visit time (catalog order breaks ties),
/// then unvisited records in catalog order.
#[must_use]
pub fn order<'a>(catalog: &'a Catalog, states: &'a VisitStates) -> Vec<OrderedEntry<'a>> {
    let mut visited = Vec::new();
    let mut unvisited = Vec::new();
    for record in catalog.records() {
        let state = states.state(&record.id);
        let entry = OrderedEntry { record, state, sequence: None };
        if state.is_visited() {
            visited.push(entry);
        } else {
            unvisited.push(entry);
        }
    }

    visited.sort_by(|lhs, rhs| lhs.state.visited_at.cmp(&rhs.state.visited_at));
    for (index, entry) in visited.iter_mut().enumerate() {
        entry.sequence = Some(index + 1);
    }

    visited.extend(unvisited);
    visited
}

/// [`order`] followed by the criteria filter; survivors keep their
/// sequence numbers.
#[must_use]
pub fn view<'a>(
    catalog: &'a Catalog,
    states: &'a VisitStates,
    criteria: &Criteria,
) -> Vec<OrderedEntry<'a>> {
    let predicate = criteria.predicate();
    order(catalog, states).into_iter().filter(|entry| predicate(entry.record, entry.state)).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NavigationLinks {
    pub google_maps: String,
    pub waze: String,
}

impl NavigationLinks {
    #[must_use]
    pub fn for_coordinates(coordinates: Coordinates) -> Option<Self> {
        if !coordinates.is_usable() {
            return None;
        }
        let Coordinates { lat, lon } = coordinates;
        Some(Self {
            google_maps: format!("https://www.google.com/maps/search/?api=1&query={lat},{lon}"),
            waze: format!("https://waze.com/ul?ll={lat},{lon}&navigate=yes"),
        })
    }

    #[must_use]
    pub fn for_record(record: &Record) -> Option<Self> {
        record.coordinates.and_then(Self::for_coordinates)
    }
}
