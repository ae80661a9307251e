#![forbid(unsafe_code)]

//! Embedded command surface for the `mdb` binary.
//!
//! Host tooling can run parsed commands through [`execute`] and receive a
//! JSON envelope; [`run_cli`] prints that envelope to stdout. The resolved
//! model metadata comes from a JSON model descriptor file, the database
//! schema itself stays free of metadata concerns.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use modeldb_core::{
    read_csv, write_csv, AccCell, AccConverter, DbError, EntityMeta, ExprCell, ExprConverter,
    FloatFmt, ModelMeta, ParamConverter, ParamMeta, ReadPageLayout, RunStatus, TableMeta,
};
use modeldb_store_sqlite::ModelStore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Resolved model metadata: the model row plus its parameter, table and
/// entity descriptors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub model: ModelMeta,
    #[serde(default)]
    pub parameters: Vec<ParamMeta>,
    #[serde(default)]
    pub tables: Vec<TableMeta>,
    #[serde(default)]
    pub entities: Vec<EntityMeta>,
}

impl ModelDescriptor {
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open model descriptor {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("invalid model descriptor {}", path.display()))
    }

    pub fn parameter(&self, name: &str) -> Result<&ParamMeta> {
        self.parameters
            .iter()
            .find(|param| param.name == name)
            .ok_or_else(|| DbError::NotFound(format!("parameter {name}")).into())
    }

    pub fn table(&self, name: &str) -> Result<&TableMeta> {
        self.tables
            .iter()
            .find(|table| table.name == name)
            .ok_or_else(|| DbError::NotFound(format!("output table {name}")).into())
    }
}

#[derive(Debug, Parser)]
#[command(name = "mdb")]
#[command(about = "Model database maintenance CLI")]
pub struct Cli {
    #[arg(long, default_value = "./modeldb.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Schema {
        #[command(subcommand)]
        command: SchemaCommand,
    },
    Run {
        #[command(subcommand)]
        command: RunCommand,
    },
    Param {
        #[command(subcommand)]
        command: Box<ParamCommand>,
    },
    Table {
        #[command(subcommand)]
        command: Box<TableCommand>,
    },
    Workset {
        #[command(subcommand)]
        command: Box<WorksetCommand>,
    },
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum SchemaCommand {
    /// Apply the base schema and create the model's value tables.
    Init(SchemaInitArgs),
}

#[derive(Debug, Args)]
pub struct SchemaInitArgs {
    #[arg(long)]
    model: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum RunCommand {
    Create(RunCreateArgs),
    SetStatus(RunSetStatusArgs),
    Status(RunStatusArgs),
}

#[derive(Debug, Args)]
pub struct RunCreateArgs {
    #[arg(long)]
    model_id: i32,
    #[arg(long)]
    name: String,
    #[arg(long, default_value_t = 1)]
    sub_count: i32,
}

#[derive(Debug, Args)]
pub struct RunSetStatusArgs {
    #[arg(long)]
    run_id: i32,
    #[arg(long)]
    status: RunStatusArg,
}

#[derive(Debug, Args)]
pub struct RunStatusArgs {
    #[arg(long)]
    run_id: i32,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RunStatusArg {
    InProgress,
    Success,
    Exit,
    Error,
}

impl From<RunStatusArg> for RunStatus {
    fn from(value: RunStatusArg) -> Self {
        match value {
            RunStatusArg::InProgress => Self::InProgress,
            RunStatusArg::Success => Self::Success,
            RunStatusArg::Exit => Self::Exit,
            RunStatusArg::Error => Self::Error,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum ParamCommand {
    Read(ParamReadArgs),
}

#[derive(Debug, Args)]
pub struct ParamReadArgs {
    #[arg(long)]
    model: PathBuf,
    #[arg(long)]
    name: String,
    #[arg(long)]
    run_id: Option<i32>,
    #[arg(long)]
    workset: Option<String>,
    #[arg(long, default_value_t = 0)]
    offset: i64,
    #[arg(long, default_value_t = 0)]
    size: i64,
    #[arg(long)]
    last_page: bool,
    #[arg(long)]
    codes: bool,
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum TableCommand {
    Read(TableReadArgs),
    Write(TableWriteArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TableValueKind {
    Expr,
    Acc,
}

#[derive(Debug, Args)]
pub struct TableReadArgs {
    #[arg(long)]
    model: PathBuf,
    #[arg(long)]
    name: String,
    #[arg(long)]
    run_id: i32,
    #[arg(long, value_enum, default_value_t = TableValueKind::Expr)]
    kind: TableValueKind,
    #[arg(long, default_value_t = 0)]
    offset: i64,
    #[arg(long, default_value_t = 0)]
    size: i64,
    #[arg(long)]
    last_page: bool,
    #[arg(long)]
    codes: bool,
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct TableWriteArgs {
    #[arg(long)]
    model: PathBuf,
    #[arg(long)]
    name: String,
    #[arg(long)]
    run_id: i32,
    #[arg(long)]
    acc_csv: PathBuf,
    #[arg(long)]
    expr_csv: PathBuf,
    #[arg(long)]
    precision: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum WorksetCommand {
    Create(WorksetCreateArgs),
    UpdateParam(WorksetUpdateParamArgs),
    DeleteParam(WorksetDeleteParamArgs),
    SetReadonly(WorksetReadonlyArgs),
}

#[derive(Debug, Args)]
pub struct WorksetCreateArgs {
    #[arg(long)]
    model_id: i32,
    #[arg(long)]
    name: String,
    #[arg(long)]
    base_run_id: Option<i32>,
}

#[derive(Debug, Args)]
pub struct WorksetUpdateParamArgs {
    #[arg(long)]
    model: PathBuf,
    #[arg(long)]
    workset: String,
    #[arg(long)]
    name: String,
    #[arg(long)]
    csv: PathBuf,
    #[arg(long)]
    codes: bool,
}

#[derive(Debug, Args)]
pub struct WorksetDeleteParamArgs {
    #[arg(long)]
    model: PathBuf,
    #[arg(long)]
    workset: String,
    #[arg(long)]
    name: String,
}

#[derive(Debug, Args)]
pub struct WorksetReadonlyArgs {
    #[arg(long)]
    model_id: i32,
    #[arg(long)]
    name: String,
    #[arg(long)]
    readonly: bool,
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommand {
    Set(ProfileSetArgs),
    Get(ProfileNameArgs),
    Delete(ProfileNameArgs),
}

#[derive(Debug, Args)]
pub struct ProfileSetArgs {
    #[arg(long)]
    name: String,
    #[arg(long = "option", value_parser = parse_key_value)]
    options: Vec<(String, String)>,
}

#[derive(Debug, Args)]
pub struct ProfileNameArgs {
    #[arg(long)]
    name: String,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

/// Runs a parsed command and prints its JSON envelope.
pub fn run_cli(cli: Cli) -> Result<()> {
    let envelope = execute(cli)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&envelope).context("failed to render result envelope")?
    );
    Ok(())
}

/// Runs a parsed command and returns its JSON envelope.
pub fn execute(cli: Cli) -> Result<Value> {
    let mut store = ModelStore::open(&cli.db)?;

    match cli.command {
        Command::Schema { command } => match command {
            SchemaCommand::Init(args) => schema_init(&store, &args),
        },
        Command::Run { command } => match command {
            RunCommand::Create(args) => run_create(&mut store, &args),
            RunCommand::SetStatus(args) => run_set_status(&mut store, &args),
            RunCommand::Status(args) => run_status(&store, &args),
        },
        Command::Param { command } => match *command {
            ParamCommand::Read(args) => param_read(&store, &args),
        },
        Command::Table { command } => match *command {
            TableCommand::Read(args) => table_read(&store, &args),
            TableCommand::Write(args) => table_write(&mut store, &args),
        },
        Command::Workset { command } => match *command {
            WorksetCommand::Create(args) => workset_create(&mut store, &args),
            WorksetCommand::UpdateParam(args) => workset_update_param(&mut store, &args),
            WorksetCommand::DeleteParam(args) => workset_delete_param(&mut store, &args),
            WorksetCommand::SetReadonly(args) => workset_set_readonly(&mut store, &args),
        },
        Command::Profile { command } => match command {
            ProfileCommand::Set(args) => profile_set(&mut store, &args),
            ProfileCommand::Get(args) => profile_get(&store, &args),
            ProfileCommand::Delete(args) => profile_delete(&mut store, &args),
        },
    }
}

fn schema_init(store: &ModelStore, args: &SchemaInitArgs) -> Result<Value> {
    let descriptor = ModelDescriptor::from_file(&args.model)?;
    store.migrate()?;
    store.insert_model(&descriptor.model)?;
    store.create_model_tables(&descriptor.parameters, &descriptor.tables)?;

    Ok(json!({
        "model": descriptor.model.name,
        "parameters": descriptor.parameters.len(),
        "tables": descriptor.tables.len(),
    }))
}

fn run_create(store: &mut ModelStore, args: &RunCreateArgs) -> Result<Value> {
    let run_id = store.create_run(args.model_id, &args.name, args.sub_count)?;
    Ok(json!({
        "run_id": run_id,
        "name": args.name,
        "status": RunStatus::InProgress.as_str(),
    }))
}

fn run_set_status(store: &mut ModelStore, args: &RunSetStatusArgs) -> Result<Value> {
    let status = RunStatus::from(args.status);
    store.update_run_status(args.run_id, status)?;
    Ok(json!({
        "run_id": args.run_id,
        "status": status.as_str(),
    }))
}

fn run_status(store: &ModelStore, args: &RunStatusArgs) -> Result<Value> {
    let status = store.get_run_status(args.run_id)?;
    let sub_count = store.get_run_sub_count(args.run_id)?;
    Ok(json!({
        "run_id": args.run_id,
        "status": status.as_str(),
        "sub_count": sub_count,
    }))
}

fn param_read(store: &ModelStore, args: &ParamReadArgs) -> Result<Value> {
    let descriptor = ModelDescriptor::from_file(&args.model)?;
    let param = descriptor.parameter(&args.name)?;
    let layout = ReadPageLayout {
        offset: args.offset,
        size: args.size,
        is_last_page: args.last_page,
    };

    let (cells, actual) = match (args.run_id, args.workset.as_deref()) {
        (Some(run_id), None) => store.read_run_parameter(param, run_id, layout)?,
        (None, Some(set_name)) => {
            store.read_workset_parameter(descriptor.model.model_id, set_name, param, layout)?
        }
        _ => {
            return Err(DbError::InvalidArgument(
                "exactly one of --run-id or --workset is required".to_string(),
            )
            .into())
        }
    };

    let cvt = ParamConverter::new(param, FloatFmt::default())?;
    let rows = cells
        .iter()
        .map(|cell| {
            if args.codes {
                cvt.to_code_row(cell)
            } else {
                cvt.to_row(cell)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    maybe_write_csv(args.output.as_deref(), &cvt.header(), &rows)?;

    Ok(json!({
        "parameter": param.name,
        "offset": actual.offset,
        "size": actual.size,
        "is_last_page": actual.is_last_page,
        "header": cvt.header(),
        "rows": rows,
    }))
}

fn table_read(store: &ModelStore, args: &TableReadArgs) -> Result<Value> {
    let descriptor = ModelDescriptor::from_file(&args.model)?;
    let table = descriptor.table(&args.name)?;
    let layout = ReadPageLayout {
        offset: args.offset,
        size: args.size,
        is_last_page: args.last_page,
    };

    let (header, rows, actual) = match args.kind {
        TableValueKind::Expr => {
            let (cells, actual) = store.read_output_expressions(table, args.run_id, layout)?;
            let cvt = ExprConverter::new(table, FloatFmt::default())?;
            let rows = expr_rows(&cvt, &cells, args.codes)?;
            (cvt.header(), rows, actual)
        }
        TableValueKind::Acc => {
            let sub_count = store.get_run_sub_count(args.run_id)?;
            let (cells, actual) = store.read_output_accumulators(table, args.run_id, layout)?;
            let cvt = AccConverter::new(table, sub_count, FloatFmt::default())?;
            let rows = acc_rows(&cvt, &cells, args.codes)?;
            (cvt.header(), rows, actual)
        }
    };

    maybe_write_csv(args.output.as_deref(), &header, &rows)?;

    Ok(json!({
        "table": table.name,
        "offset": actual.offset,
        "size": actual.size,
        "is_last_page": actual.is_last_page,
        "header": header,
        "rows": rows,
    }))
}

fn expr_rows(
    cvt: &ExprConverter,
    cells: &[ExprCell],
    codes: bool,
) -> Result<Vec<Vec<String>>, DbError> {
    cells
        .iter()
        .map(|cell| {
            if codes {
                cvt.to_code_row(cell)
            } else {
                cvt.to_row(cell)
            }
        })
        .collect()
}

fn acc_rows(
    cvt: &AccConverter,
    cells: &[AccCell],
    codes: bool,
) -> Result<Vec<Vec<String>>, DbError> {
    cells
        .iter()
        .map(|cell| {
            if codes {
                cvt.to_code_row(cell)
            } else {
                cvt.to_row(cell)
            }
        })
        .collect()
}

fn table_write(store: &mut ModelStore, args: &TableWriteArgs) -> Result<Value> {
    let descriptor = ModelDescriptor::from_file(&args.model)?;
    let table = descriptor.table(&args.name)?;
    let fmt = FloatFmt {
        precision: args.precision,
    };

    let sub_count = store.get_run_sub_count(args.run_id)?;
    let acc_cvt = AccConverter::new(table, sub_count, fmt)?;
    let expr_cvt = ExprConverter::new(table, fmt)?;

    let accs = read_cell_file(&args.acc_csv, |row| acc_cvt.row_to_cell(row))?;
    let exprs = read_cell_file(&args.expr_csv, |row| expr_cvt.row_to_cell(row))?;

    let digest = store.write_output_table(table, args.run_id, &accs, &exprs, fmt)?;
    let (base_run_id, _) = store
        .get_run_table_link(args.run_id, table.table_id)?
        .ok_or_else(|| {
            anyhow::Error::new(DbError::IntegrityViolation(
                "run_table link missing after output write".to_string(),
            ))
        })?;

    Ok(json!({
        "table": table.name,
        "run_id": args.run_id,
        "digest": digest,
        "base_run_id": base_run_id,
        "stored": base_run_id == args.run_id,
        "acc_rows": accs.len(),
        "expr_rows": exprs.len(),
    }))
}

fn workset_create(store: &mut ModelStore, args: &WorksetCreateArgs) -> Result<Value> {
    let set_id = store.create_workset(args.model_id, &args.name, args.base_run_id)?;
    Ok(json!({
        "set_id": set_id,
        "name": args.name,
        "base_run_id": args.base_run_id,
    }))
}

fn workset_update_param(store: &mut ModelStore, args: &WorksetUpdateParamArgs) -> Result<Value> {
    let descriptor = ModelDescriptor::from_file(&args.model)?;
    let param = descriptor.parameter(&args.name)?;
    let cvt = ParamConverter::new(param, FloatFmt::default())?;

    let cells = read_cell_file(&args.csv, |row| {
        if args.codes {
            cvt.code_row_to_cell(row)
        } else {
            cvt.row_to_cell(row)
        }
    })?;

    let written =
        store.update_workset_parameter(descriptor.model.model_id, &args.workset, param, &cells)?;
    Ok(json!({
        "workset": args.workset,
        "parameter": param.name,
        "rows": written,
    }))
}

fn workset_delete_param(store: &mut ModelStore, args: &WorksetDeleteParamArgs) -> Result<Value> {
    let descriptor = ModelDescriptor::from_file(&args.model)?;
    let param = descriptor.parameter(&args.name)?;

    let deleted =
        store.delete_workset_parameter(descriptor.model.model_id, &args.workset, param)?;
    Ok(json!({
        "workset": args.workset,
        "parameter": param.name,
        "deleted_rows": deleted,
    }))
}

fn workset_set_readonly(store: &mut ModelStore, args: &WorksetReadonlyArgs) -> Result<Value> {
    store.set_workset_readonly(args.model_id, &args.name, args.readonly)?;
    Ok(json!({
        "workset": args.name,
        "readonly": args.readonly,
    }))
}

fn profile_set(store: &mut ModelStore, args: &ProfileSetArgs) -> Result<Value> {
    let options: BTreeMap<String, String> = args.options.iter().cloned().collect();
    store.update_profile(&args.name, &options)?;
    Ok(json!({
        "profile": args.name,
        "options": options.len(),
    }))
}

fn profile_get(store: &ModelStore, args: &ProfileNameArgs) -> Result<Value> {
    let options = store.get_profile(&args.name)?;
    Ok(json!({
        "profile": args.name,
        "options": options,
    }))
}

fn profile_delete(store: &mut ModelStore, args: &ProfileNameArgs) -> Result<Value> {
    store.delete_profile(&args.name)?;
    Ok(json!({
        "profile": args.name,
        "deleted": true,
    }))
}

fn maybe_write_csv(output: Option<&Path>, header: &[String], rows: &[Vec<String>]) -> Result<()> {
    let Some(path) = output else {
        return Ok(());
    };

    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let _ = write_csv(&mut writer, header, rows.iter().cloned().map(Ok))?;
    Ok(())
}

fn read_cell_file<T>(
    path: &Path,
    convert: impl Fn(&[String]) -> Result<T, DbError>,
) -> Result<Vec<T>> {
    let file =
        File::open(path).with_context(|| format!("failed to open cell file {}", path.display()))?;
    let (_header, rows) = read_csv(BufReader::new(file))?;
    rows.iter()
        .map(|row| convert(row).map_err(anyhow::Error::new))
        .collect()
}
