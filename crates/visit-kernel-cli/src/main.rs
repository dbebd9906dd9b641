use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use visit_kernel_api::{KernelConfig, VisitKernelApi};
use visit_kernel_core::{
    Amenity, AmenityFlag, AxisOrder, CatalogKind, Criteria, NavigationLinks, RecordId,
    VisitStatusFilter,
};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "vk")]
#[command(about = "Visit Kernel CLI")]
struct Cli {
    /// YAML config file; flags below override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    #[arg(long, global = true, value_enum)]
    kind: Option<KindArg>,

    #[arg(long, global = true)]
    state: Option<PathBuf>,

    #[arg(long, global = true, value_enum)]
    axis_order: Option<AxisOrderArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    List(ListArgs),
    Show(IdArgs),
    Visit(IdArgs),
    Unvisit(IdArgs),
    NoAmenities(NoAmenitiesArgs),
    Amenity(AmenityArgs),
    Clear,
    Links(IdArgs),
    ImportLegacy(ImportLegacyArgs),
    Criteria,
}

#[derive(Debug, Args)]
struct IdArgs {
    id: String,
}

#[derive(Debug, Args)]
struct NoAmenitiesArgs {
    id: String,
    #[arg(long, default_value_t = false)]
    off: bool,
}

#[derive(Debug, Args)]
struct AmenityArgs {
    id: String,
    #[arg(value_enum)]
    amenity: AmenityArg,
    #[arg(long, default_value_t = false)]
    off: bool,
}

#[derive(Debug, Args)]
struct ImportLegacyArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, value_enum, default_value_t = StatusArg::Any)]
    status: StatusArg,
    /// Repeatable; every listed flag must be set.
    #[arg(long, value_enum)]
    require: Vec<RequireArg>,
    /// `field=min..max`; either bound may be omitted.
    #[arg(long)]
    range: Vec<String>,
    /// `field=value`; repeat to select several values of one field.
    #[arg(long)]
    category: Vec<String>,
    #[arg(long)]
    search: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Plazas,
    Players,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AxisOrderArg {
    LatLon,
    LonLat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StatusArg {
    Any,
    Visited,
    Unvisited,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AmenityArg {
    SportCourt,
    Playground,
    Gym,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RequireArg {
    SportCourt,
    Playground,
    Gym,
    NoAmenities,
}

impl From<KindArg> for CatalogKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Plazas => Self::Plazas,
            KindArg::Players => Self::Players,
        }
    }
}

impl From<AxisOrderArg> for AxisOrder {
    fn from(value: AxisOrderArg) -> Self {
        match value {
            AxisOrderArg::LatLon => Self::LatLon,
            AxisOrderArg::LonLat => Self::LonLat,
        }
    }
}

impl From<StatusArg> for VisitStatusFilter {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Any => Self::Any,
            StatusArg::Visited => Self::VisitedOnly,
            StatusArg::Unvisited => Self::UnvisitedOnly,
        }
    }
}

impl From<AmenityArg> for Amenity {
    fn from(value: AmenityArg) -> Self {
        match value {
            AmenityArg::SportCourt => Self::SportCourt,
            AmenityArg::Playground => Self::Playground,
            AmenityArg::Gym => Self::Gym,
        }
    }
}

impl From<RequireArg> for AmenityFlag {
    fn from(value: RequireArg) -> Self {
        match value {
            RequireArg::SportCourt => Self::SportCourt,
            RequireArg::Playground => Self::Playground,
            RequireArg::Gym => Self::Gym,
            RequireArg::NoAmenities => Self::NoAmenities,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn resolve_config(cli: &Cli) -> Result<KernelConfig> {
    let mut config = match &cli.config {
        Some(path) => KernelConfig::from_yaml_file(path)?,
        None => KernelConfig::default(),
    };
    if let Some(catalog) = &cli.catalog {
        config.catalog.clone_from(catalog);
    }
    if let Some(kind) = cli.kind {
        config.kind = kind.into();
    }
    if let Some(state) = &cli.state {
        config.state.clone_from(state);
    }
    if let Some(axis_order) = cli.axis_order {
        config.axis_order = axis_order.into();
    }
    debug!(?config, "resolved config");
    Ok(config)
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    let mut api = VisitKernelApi::open(&config)?;

    match cli.command {
        Command::List(args) => run_list(&args, &api),
        Command::Show(args) => run_show(&args, &api),
        Command::Visit(args) => {
            emit_json(serde_json::to_value(api.set_visited(&RecordId::new(args.id), true))?)
        }
        Command::Unvisit(args) => {
            emit_json(serde_json::to_value(api.set_visited(&RecordId::new(args.id), false))?)
        }
        Command::NoAmenities(args) => emit_json(serde_json::to_value(
            api.set_no_amenities(&RecordId::new(args.id), !args.off),
        )?),
        Command::Amenity(args) => emit_json(serde_json::to_value(api.set_amenity(
            &RecordId::new(args.id),
            args.amenity.into(),
            !args.off,
        ))?),
        Command::Clear => emit_json(serde_json::to_value(api.clear_all())?),
        Command::Links(args) => run_links(&args, &api),
        Command::ImportLegacy(args) => {
            let summary = api.import_legacy(&args.input)?;
            emit_json(serde_json::to_value(summary)?)
        }
        Command::Criteria => emit_json(serde_json::to_value(api.default_criteria())?),
    }
}

fn run_list(args: &ListArgs, api: &VisitKernelApi) -> Result<()> {
    let criteria = build_criteria(args, api.default_criteria())?;
    let entries = api.view(&criteria);
    emit_json(serde_json::json!({
        "total": api.catalog().len(),
        "visited": api.visited_count(),
        "matched": entries.len(),
        "records": entries,
    }))
}

fn run_show(args: &IdArgs, api: &VisitKernelApi) -> Result<()> {
    let id = RecordId::new(args.id.clone());
    let record = api.record(&id).ok_or_else(|| anyhow!("record not found: {id}"))?;
    emit_json(serde_json::json!({
        "record": record,
        "state": api.state(&id),
        "links": NavigationLinks::for_record(record),
    }))
}

fn run_links(args: &IdArgs, api: &VisitKernelApi) -> Result<()> {
    let id = RecordId::new(args.id.clone());
    if api.record(&id).is_none() {
        return Err(anyhow!("record not found: {id}"));
    }
    emit_json(serde_json::json!({
        "record_id": id,
        "links": api.links(&id),
    }))
}

fn build_criteria(args: &ListArgs, mut criteria: Criteria) -> Result<Criteria> {
    criteria.visit_status = args.status.into();
    criteria.require.extend(args.require.iter().copied().map(AmenityFlag::from));

    for raw_arg in &args.range {
        let (field, min, max) = parse_range_arg(raw_arg)?;
        criteria.narrow_range(&field, min, max);
    }

    let mut selections: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for raw_arg in &args.category {
        let (field, value) = raw_arg
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --category {raw_arg:?}; expected field=value"))?;
        selections.entry(field.trim().to_string()).or_default().push(value.trim().to_string());
    }
    for (field, values) in selections {
        criteria.select_categories(&field, values);
    }

    criteria.name_query.clone_from(&args.search);
    Ok(criteria)
}

/// Parse `field=min..max`. An omitted bound keeps the observed bound.
fn parse_range_arg(raw_arg: &str) -> Result<(String, f64, f64)> {
    let (field, bounds) = raw_arg
        .split_once('=')
        .ok_or_else(|| anyhow!("invalid --range {raw_arg:?}; expected field=min..max"))?;
    let (min, max) = bounds
        .split_once("..")
        .ok_or_else(|| anyhow!("invalid --range {raw_arg:?}; expected field=min..max"))?;
    let parse_bound = |raw: &str| -> Result<f64> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(f64::NAN);
        }
        raw.parse::<f64>().with_context(|| format!("invalid bound {raw:?} in --range {raw_arg:?}"))
    };
    Ok((field.trim().to_string(), parse_bound(min)?, parse_bound(max)?))
}
