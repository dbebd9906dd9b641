use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

const PLAZA_CATALOG: &str = r#"{
  "type": "FeatureCollection",
  "features": [
    {"properties": {"den_oficia": "Praça Central", "bairro": "Centro", "m2": "1200"},
     "geometry": {"coordinates": [-22.9, -47.06]}},
    {"properties": {"den_oficia": "", "apelido": "Pracinha", "bairro": "Cambuí", "m2": "300"},
     "geometry": {"coordinates": [0, 0]}},
    {"properties": {"den_oficia": "Largo do Pará", "bairro": "Centro"}}
  ]
}"#;

const PLAYER_CATALOG: &str = r#"{
  "leagues": [{"league_id": 39, "league_name": "Premier League"}],
  "teams": [{"team_id": 47, "team_name": "Tottenham", "league_id": 39}],
  "players": [
    {"id": 1, "name": "Kane", "age": 30, "number": 9, "nationality": "Inglaterra", "position": "Atacante", "team_id": 47},
    {"id": 2, "name": "Son", "age": 31, "number": 7, "nationality": "Coreia", "position": "Atacante", "team_id": 47},
    {"id": 3, "name": "Vicario", "age": 27, "number": 13, "nationality": "Itália", "position": "Goleiro", "team_id": 47}
  ]
}"#;

struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    fn plazas(prefix: &str) -> Self {
        let dir = unique_temp_dir(prefix);
        write_file(&dir.join("catalog.json"), PLAZA_CATALOG);
        Self { dir }
    }

    fn players(prefix: &str) -> Self {
        let dir = unique_temp_dir(prefix);
        write_file(&dir.join("catalog.json"), PLAYER_CATALOG);
        Self { dir }
    }

    fn args(&self, extra: &[&str]) -> Vec<String> {
        let mut args = vec![
            "--catalog".to_string(),
            path_str(&self.dir.join("catalog.json")).to_string(),
            "--state".to_string(),
            path_str(&self.state_path()).to_string(),
        ];
        args.extend(extra.iter().map(|arg| (*arg).to_string()));
        args
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("visit_state.json")
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{}-{now}", std::process::id()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn write_file(path: &Path, body: &str) {
    fs::write(path, body)
        .unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn run_vk<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_vk"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute vk binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_vk(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "vk command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn record_id(ws: &Workspace, name: &str) -> String {
    let listed = run_json(ws.args(&["list"]));
    as_array(&listed, "records")
        .iter()
        .find(|entry| entry["record"]["name"] == name)
        .map(|entry| as_str(&entry["record"], "id").to_string())
        .unwrap_or_else(|| panic!("record {name} missing from list: {listed}"))
}

fn names(listed: &Value) -> Vec<String> {
    as_array(listed, "records")
        .iter()
        .map(|entry| as_str(&entry["record"], "name").to_string())
        .collect()
}

#[test]
fn list_reports_catalog_with_contract_version() {
    let ws = Workspace::plazas("vk-cli-list");
    let listed = run_json(ws.args(&["list"]));
    assert_eq!(as_str(&listed, "contract_version"), "cli.v1");
    assert_eq!(listed["total"], 3);
    assert_eq!(listed["matched"], 3);
    assert_eq!(listed["visited"], 0);

    let records = as_array(&listed, "records");
    assert_eq!(records[1]["record"]["name"], "Pracinha");
    assert_eq!(records[2]["record"]["fields"]["area"], "-----");
    assert!(records.iter().all(|entry| entry["sequence"].is_null()));
}

#[test]
fn visit_persists_and_orders_by_visit_time() {
    let ws = Workspace::plazas("vk-cli-visit");
    let largo = record_id(&ws, "Largo do Pará");
    let central = record_id(&ws, "Praça Central");

    let outcome = run_json(ws.args(&["visit", &central]));
    assert_eq!(outcome["persisted"], true);
    assert_eq!(outcome["state"]["visited"], true);
    assert!(outcome["state"]["visited_at"].is_string());
    let _ = run_json(ws.args(&["visit", &largo]));

    // Same-second visits tie and fall back to catalog order, which agrees here.
    let listed = run_json(ws.args(&["list"]));
    assert_eq!(names(&listed), vec!["Praça Central", "Largo do Pará", "Pracinha"]);
    let records = as_array(&listed, "records");
    assert_eq!(records[0]["sequence"], 1);
    assert_eq!(records[1]["sequence"], 2);
    assert!(records[2]["sequence"].is_null());

    let persisted: Value = serde_json::from_str(
        &fs::read_to_string(ws.state_path())
            .unwrap_or_else(|err| panic!("state file should exist: {err}")),
    )
    .unwrap_or_else(|err| panic!("state file should be JSON: {err}"));
    assert_eq!(persisted["format_version"], 1);
    assert_eq!(persisted["visits"][largo.as_str()]["visited"], true);
}

#[test]
fn amenity_flags_follow_state_machine_rules() {
    let ws = Workspace::plazas("vk-cli-amenity");
    let central = record_id(&ws, "Praça Central");

    let ignored = run_json(ws.args(&["amenity", &central, "gym"]));
    assert_eq!(ignored["state"]["visited"], false);
    assert_eq!(ignored["state"]["attributes"], serde_json::json!([]));

    let _ = run_json(ws.args(&["visit", &central]));
    let with_gym = run_json(ws.args(&["amenity", &central, "gym"]));
    assert_eq!(with_gym["state"]["attributes"], serde_json::json!(["gym"]));

    let bare = run_json(ws.args(&["no-amenities", &central]));
    assert_eq!(bare["state"]["no_amenities"], true);
    assert_eq!(bare["state"]["attributes"], serde_json::json!([]));

    let blocked = run_json(ws.args(&["amenity", &central, "playground"]));
    assert_eq!(blocked["state"]["attributes"], serde_json::json!([]));

    let cleared = run_json(ws.args(&["no-amenities", &central, "--off"]));
    assert_eq!(cleared["state"]["no_amenities"], false);

    let unvisited = run_json(ws.args(&["unvisit", &central]));
    assert_eq!(unvisited["state"]["visited"], false);
    assert!(unvisited["state"]["visited_at"].is_null());
}

#[test]
fn list_filters_compose() {
    let ws = Workspace::plazas("vk-cli-filter");
    let central = record_id(&ws, "Praça Central");
    let pracinha = record_id(&ws, "Pracinha");
    let _ = run_json(ws.args(&["visit", &central]));
    let _ = run_json(ws.args(&["amenity", &central, "sport-court"]));
    let _ = run_json(ws.args(&["visit", &pracinha]));

    let listed = run_json(ws.args(&["list", "--status", "visited", "--require", "sport-court"]));
    assert_eq!(names(&listed), vec!["Praça Central"]);

    let listed = run_json(ws.args(&["list", "--status", "unvisited"]));
    assert_eq!(names(&listed), vec!["Largo do Pará"]);

    let listed = run_json(ws.args(&["list", "--category", "neighborhood=Centro"]));
    assert_eq!(names(&listed), vec!["Praça Central", "Largo do Pará"]);

    let listed = run_json(ws.args(&["list", "--range", "area=1500..200"]));
    assert_eq!(names(&listed), vec!["Praça Central", "Pracinha"]);

    let listed = run_json(ws.args(&["list", "--search", "LARGO"]));
    assert_eq!(names(&listed), vec!["Largo do Pará"]);
}

#[test]
fn links_are_suppressed_without_usable_coordinates() {
    let ws = Workspace::plazas("vk-cli-links");
    let central = record_id(&ws, "Praça Central");
    let pracinha = record_id(&ws, "Pracinha");

    let links = run_json(ws.args(&["links", &central]));
    assert_eq!(
        as_str(&links["links"], "google_maps"),
        "https://www.google.com/maps/search/?api=1&query=-22.9,-47.06"
    );
    assert_eq!(as_str(&links["links"], "waze"), "https://waze.com/ul?ll=-22.9,-47.06&navigate=yes");

    let links = run_json(ws.args(&["links", &pracinha]));
    assert!(links["links"].is_null());

    let missing = run_vk(ws.args(&["links", "rec-0000000000000000"]));
    assert!(!missing.status.success());
}

#[test]
fn visited_total_counts_only_catalog_records() {
    let ws = Workspace::plazas("vk-cli-stray");
    let central = record_id(&ws, "Praça Central");

    let stray = run_json(ws.args(&["visit", "rec-0000000000000000"]));
    assert_eq!(stray["state"]["visited"], true);
    let _ = run_json(ws.args(&["visit", &central]));

    let listed = run_json(ws.args(&["list"]));
    assert_eq!(listed["visited"], 1);
    let max_sequence = as_array(&listed, "records")
        .iter()
        .filter_map(|entry| entry["sequence"].as_u64())
        .max();
    assert_eq!(max_sequence, Some(1));
}

#[test]
fn clear_resets_every_visit() {
    let ws = Workspace::plazas("vk-cli-clear");
    let central = record_id(&ws, "Praça Central");
    let _ = run_json(ws.args(&["visit", &central]));

    let cleared = run_json(ws.args(&["clear"]));
    assert_eq!(cleared["persisted"], true);
    assert_eq!(cleared["entries"], 1);

    let shown = run_json(ws.args(&["show", &central]));
    assert_eq!(shown["state"]["visited"], false);
    assert_eq!(run_json(ws.args(&["list"]))["visited"], 0);
}

#[test]
fn corrupt_state_file_degrades_to_empty() {
    let ws = Workspace::plazas("vk-cli-corrupt");
    write_file(&ws.state_path(), "{ this is not json");

    let listed = run_json(ws.args(&["list"]));
    assert_eq!(listed["visited"], 0);
    assert_eq!(listed["total"], 3);
}

#[test]
fn missing_catalog_fails_with_message() {
    let ws = Workspace::plazas("vk-cli-missing");
    let output = run_vk([
        "--catalog",
        path_str(&ws.dir.join("nope.json")),
        "--state",
        path_str(&ws.state_path()),
        "list",
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to read catalog"), "stderr: {stderr}");
}

#[test]
fn import_legacy_maps_names_to_records() {
    let ws = Workspace::plazas("vk-cli-legacy");
    let legacy = ws.dir.join("visitas.json");
    write_file(
        &legacy,
        r#"[
            {"nome": "Praça Central", "jv": true, "timestamp": 1700000000.5, "quadra": true, "parquinho": false, "academia": false, "semnada": false},
            {"nome": "Praça Sumida", "jv": true, "timestamp": 1700000100.0}
        ]"#,
    );

    let summary = run_json(ws.args(&["import-legacy", "--in", path_str(&legacy)]));
    assert_eq!(summary["imported"], 1);
    assert_eq!(summary["unmatched"], serde_json::json!(["Praça Sumida"]));

    let central = record_id(&ws, "Praça Central");
    let shown = run_json(ws.args(&["show", &central]));
    assert_eq!(shown["state"]["visited_at"], "2023-11-14T22:13:20Z");
    assert_eq!(shown["state"]["attributes"], serde_json::json!(["sport_court"]));
}

#[test]
fn players_catalog_uses_config_file_and_joins() {
    let ws = Workspace::players("vk-cli-players");
    let config = ws.dir.join("vk.yaml");
    write_file(
        &config,
        &format!(
            "catalog: {}\nkind: players\nstate: {}\n",
            path_str(&ws.dir.join("catalog.json")),
            path_str(&ws.state_path())
        ),
    );
    let config = path_str(&config).to_string();

    let criteria = run_json(["--config", config.as_str(), "criteria"]);
    assert_eq!(criteria["ranges"]["age"]["min"], 27.0);
    assert_eq!(criteria["ranges"]["age"]["max"], 31.0);
    assert_eq!(
        criteria["categories"]["team"]["selected"],
        serde_json::json!(["Tottenham"])
    );

    let listed = run_json([
        "--config",
        config.as_str(),
        "list",
        "--range",
        "age=30..",
        "--category",
        "position=Atacante",
    ]);
    assert_eq!(names(&listed), vec!["Kane", "Son"]);
    let records = as_array(&listed, "records");
    assert_eq!(records[0]["record"]["fields"]["league"], "Premier League");
}
