use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use clap::Parser;
use modeldb_cli::{execute, Cli, ModelDescriptor};
use modeldb_core::{
    AccMeta, DimMeta, EnumItem, ExprMeta, ModelMeta, ParamMeta, TableMeta, TypeDef, TypeKind,
};
use serde_json::{json, Value};

fn parse(args: &[&str]) -> Cli {
    match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => panic!("failed to parse CLI args {args:?}: {err}"),
    }
}

fn run(args: &[&str]) -> Value {
    match execute(parse(args)) {
        Ok(envelope) => envelope,
        Err(err) => panic!("command {args:?} failed: {err}"),
    }
}

fn temp_path(tag: &str, suffix: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let unique = COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!(
        "mdb-cli-{tag}-{}-{unique}{suffix}",
        std::process::id()
    ))
}

fn region_type() -> TypeDef {
    TypeDef::Enum {
        items: vec![
            EnumItem {
                enum_id: 10,
                code: "north".to_string(),
            },
            EnumItem {
                enum_id: 20,
                code: "south".to_string(),
            },
            EnumItem {
                enum_id: 30,
                code: "east".to_string(),
            },
        ],
        total_enum_id: Some(900),
    }
}

fn fixture_descriptor() -> ModelDescriptor {
    ModelDescriptor {
        model: ModelMeta {
            model_id: 1,
            name: "riskModel".to_string(),
            digest: "md-risk-1".to_string(),
        },
        parameters: vec![ParamMeta {
            param_id: 4,
            name: "taxRate".to_string(),
            dims: vec![
                DimMeta {
                    name: "region".to_string(),
                    type_def: region_type(),
                },
                DimMeta {
                    name: "age_group".to_string(),
                    type_def: TypeDef::Builtin(TypeKind::Int),
                },
            ],
            value_type: TypeDef::Builtin(TypeKind::Float),
            sub_count: 2,
        }],
        tables: vec![TableMeta {
            table_id: 7,
            name: "salarySum".to_string(),
            def_digest: "td-salarySum-1".to_string(),
            dims: vec![DimMeta {
                name: "region".to_string(),
                type_def: region_type(),
            }],
            accs: vec![
                AccMeta {
                    acc_id: 0,
                    name: "acc0".to_string(),
                },
                AccMeta {
                    acc_id: 1,
                    name: "acc1".to_string(),
                },
            ],
            exprs: vec![ExprMeta {
                expr_id: 0,
                name: "expr0".to_string(),
            }],
        }],
        entities: Vec::new(),
    }
}

fn write_descriptor(tag: &str) -> PathBuf {
    let path = temp_path(tag, "-model.json");
    let body = match serde_json::to_string_pretty(&fixture_descriptor()) {
        Ok(body) => body,
        Err(err) => panic!("failed to render model descriptor: {err}"),
    };
    if let Err(err) = fs::write(&path, body) {
        panic!("failed to write {}: {err}", path.display());
    }
    path
}

fn cleanup(paths: &[PathBuf]) {
    for path in paths {
        let _ = fs::remove_file(path);
        for suffix in ["-wal", "-shm"] {
            let mut name = path.as_os_str().to_os_string();
            name.push(suffix);
            let _ = fs::remove_file(PathBuf::from(name));
        }
    }
}

#[test]
fn output_write_dedups_identical_runs_end_to_end() {
    let db = temp_path("dedup", ".sqlite3");
    let model = write_descriptor("dedup");
    let acc_csv = temp_path("dedup", "-acc.csv");
    let expr_csv = temp_path("dedup", "-expr.csv");
    let db_arg = db.to_string_lossy().to_string();
    let model_arg = model.to_string_lossy().to_string();

    if let Err(err) = fs::write(
        &acc_csv,
        "acc_id,sub_id,region,acc_value\n0,0,10,1.5\n0,0,20,2.5\n1,0,10,null\n",
    ) {
        panic!("failed to write accumulator csv: {err}");
    }
    if let Err(err) = fs::write(&expr_csv, "expr_id,region,expr_value\n0,10,4\n0,900,8\n") {
        panic!("failed to write expression csv: {err}");
    }
    let acc_arg = acc_csv.to_string_lossy().to_string();
    let expr_arg = expr_csv.to_string_lossy().to_string();

    let init = run(&[
        "mdb", "--db", &db_arg, "schema", "init", "--model", &model_arg,
    ]);
    assert_eq!(init["model"], json!("riskModel"));
    assert_eq!(init["tables"], json!(1));

    for name in ["first", "second"] {
        let created = run(&[
            "mdb", "--db", &db_arg, "run", "create", "--model-id", "1", "--name", name,
        ]);
        let run_id = created["run_id"].to_string();
        let _ = run(&[
            "mdb",
            "--db",
            &db_arg,
            "run",
            "set-status",
            "--run-id",
            &run_id,
            "--status",
            "success",
        ]);
    }

    let first = run(&[
        "mdb", "--db", &db_arg, "table", "write", "--model", &model_arg, "--name", "salarySum",
        "--run-id", "1", "--acc-csv", &acc_arg, "--expr-csv", &expr_arg,
    ]);
    assert_eq!(first["stored"], json!(true));
    assert_eq!(first["base_run_id"], json!(1));

    let second = run(&[
        "mdb", "--db", &db_arg, "table", "write", "--model", &model_arg, "--name", "salarySum",
        "--run-id", "2", "--acc-csv", &acc_arg, "--expr-csv", &expr_arg,
    ]);
    assert_eq!(second["stored"], json!(false));
    assert_eq!(second["base_run_id"], json!(1));
    assert_eq!(second["digest"], first["digest"]);

    // the pointing run still reads the shared rows, total item as "all"
    let page = run(&[
        "mdb", "--db", &db_arg, "table", "read", "--model", &model_arg, "--name", "salarySum",
        "--run-id", "2", "--codes",
    ]);
    assert_eq!(
        page["rows"],
        json!([["0", "north", "4"], ["0", "all", "8"]])
    );
    assert_eq!(page["is_last_page"], json!(true));

    cleanup(&[db, model, acc_csv, expr_csv]);
}

#[test]
fn workset_parameter_csv_round_trip_and_delete() {
    let db = temp_path("workset", ".sqlite3");
    let model = write_descriptor("workset");
    let param_csv = temp_path("workset", "-param.csv");
    let db_arg = db.to_string_lossy().to_string();
    let model_arg = model.to_string_lossy().to_string();

    if let Err(err) = fs::write(
        &param_csv,
        "sub_id,region,age_group,param_value\n0,north,1,0.15\n0,south,1,0.25\n1,east,2,null\n",
    ) {
        panic!("failed to write parameter csv: {err}");
    }
    let csv_arg = param_csv.to_string_lossy().to_string();

    let _ = run(&[
        "mdb", "--db", &db_arg, "schema", "init", "--model", &model_arg,
    ]);
    let _ = run(&[
        "mdb", "--db", &db_arg, "workset", "create", "--model-id", "1", "--name", "edits",
    ]);

    let updated = run(&[
        "mdb", "--db", &db_arg, "workset", "update-param", "--model", &model_arg, "--workset",
        "edits", "--name", "taxRate", "--csv", &csv_arg, "--codes",
    ]);
    assert_eq!(updated["rows"], json!(3));

    let page = run(&[
        "mdb", "--db", &db_arg, "param", "read", "--model", &model_arg, "--name", "taxRate",
        "--workset", "edits", "--codes",
    ]);
    assert_eq!(
        page["rows"],
        json!([
            ["0", "north", "1", "0.15"],
            ["0", "south", "1", "0.25"],
            ["1", "east", "2", "null"],
        ])
    );

    let deleted = run(&[
        "mdb", "--db", &db_arg, "workset", "delete-param", "--model", &model_arg, "--workset",
        "edits", "--name", "taxRate",
    ]);
    assert_eq!(deleted["deleted_rows"], json!(3));

    let again = run(&[
        "mdb", "--db", &db_arg, "workset", "delete-param", "--model", &model_arg, "--workset",
        "edits", "--name", "taxRate",
    ]);
    assert_eq!(again["deleted_rows"], json!(0));

    cleanup(&[db, model, param_csv]);
}

#[test]
fn profile_options_are_set_read_and_deleted() {
    let db = temp_path("profile", ".sqlite3");
    let model = write_descriptor("profile");
    let db_arg = db.to_string_lossy().to_string();
    let model_arg = model.to_string_lossy().to_string();

    let _ = run(&[
        "mdb", "--db", &db_arg, "schema", "init", "--model", &model_arg,
    ]);

    let set = run(&[
        "mdb",
        "--db",
        &db_arg,
        "profile",
        "set",
        "--name",
        "default",
        "--option",
        "SubValues=8",
        "--option",
        "Parameter.Seed=42",
    ]);
    assert_eq!(set["options"], json!(2));

    let fetched = run(&["mdb", "--db", &db_arg, "profile", "get", "--name", "default"]);
    assert_eq!(
        fetched["options"],
        json!({"Parameter.Seed": "42", "SubValues": "8"})
    );

    let _ = run(&[
        "mdb", "--db", &db_arg, "profile", "delete", "--name", "default",
    ]);
    let gone = run(&["mdb", "--db", &db_arg, "profile", "get", "--name", "default"]);
    assert_eq!(gone["options"], Value::Null);

    cleanup(&[db, model]);
}
