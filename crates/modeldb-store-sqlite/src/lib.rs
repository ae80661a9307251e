#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! SQLite store for model runs, worksets and output values.
//!
//! Every multi-statement mutation runs inside one transaction: it commits
//! as a whole or rolls back on the first error. Reads run outside any
//! transaction and observe whatever committed snapshot the engine gives;
//! page reads are bounded by the requested page size, not the row count.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use modeldb_core::{
    digest_output_values, select_page, AccCell, CellValue, DbError, ExprCell, FloatFmt, ModelMeta,
    ParamCell, ParamConverter, ParamMeta, ReadPageLayout, RunStatus, TableMeta, TypeKind,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, info};

const BASE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_BASE_V1: &str = r"
CREATE TABLE IF NOT EXISTS model_lst (
  model_id INTEGER PRIMARY KEY,
  model_name TEXT NOT NULL,
  model_digest TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS run_lst (
  run_id INTEGER PRIMARY KEY AUTOINCREMENT,
  model_id INTEGER NOT NULL,
  run_name TEXT NOT NULL,
  sub_count INTEGER NOT NULL CHECK (sub_count >= 1),
  status TEXT NOT NULL CHECK (status IN ('in_progress', 'success', 'exit', 'error')),
  run_digest TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (model_id) REFERENCES model_lst(model_id)
);

CREATE TABLE IF NOT EXISTS run_table (
  run_id INTEGER NOT NULL,
  table_id INTEGER NOT NULL,
  base_run_id INTEGER NOT NULL,
  value_digest TEXT NOT NULL,
  PRIMARY KEY (run_id, table_id),
  FOREIGN KEY (run_id) REFERENCES run_lst(run_id)
);

CREATE INDEX IF NOT EXISTS idx_run_table_digest
  ON run_table(table_id, value_digest);

CREATE TABLE IF NOT EXISTS workset_lst (
  set_id INTEGER PRIMARY KEY AUTOINCREMENT,
  model_id INTEGER NOT NULL,
  set_name TEXT NOT NULL,
  is_readonly INTEGER NOT NULL DEFAULT 0 CHECK (is_readonly >= 0),
  base_run_id INTEGER,
  updated_at TEXT NOT NULL,
  UNIQUE (model_id, set_name),
  FOREIGN KEY (model_id) REFERENCES model_lst(model_id),
  FOREIGN KEY (base_run_id) REFERENCES run_lst(run_id)
);

CREATE TABLE IF NOT EXISTS workset_parameter (
  set_id INTEGER NOT NULL,
  param_id INTEGER NOT NULL,
  sub_count INTEGER NOT NULL DEFAULT 1 CHECK (sub_count >= 1),
  PRIMARY KEY (set_id, param_id),
  FOREIGN KEY (set_id) REFERENCES workset_lst(set_id)
);

CREATE TABLE IF NOT EXISTS workset_parameter_txt (
  set_id INTEGER NOT NULL,
  param_id INTEGER NOT NULL,
  lang_code TEXT NOT NULL,
  note TEXT,
  PRIMARY KEY (set_id, param_id, lang_code),
  FOREIGN KEY (set_id, param_id) REFERENCES workset_parameter(set_id, param_id)
);

CREATE TABLE IF NOT EXISTS profile_lst (
  profile_name TEXT PRIMARY KEY,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS profile_option (
  profile_name TEXT NOT NULL,
  option_key TEXT NOT NULL,
  option_value TEXT NOT NULL,
  PRIMARY KEY (profile_name, option_key),
  FOREIGN KEY (profile_name) REFERENCES profile_lst(profile_name)
);
";

pub struct ModelStore {
    conn: Connection,
}

impl ModelStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_BASE_V1)
            .context("failed to apply base schema")?;

        let now = now_stamp()?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![BASE_MIGRATION_VERSION, now],
            )
            .context("failed to register base schema migration")?;

        Ok(())
    }

    pub fn insert_model(&self, model: &ModelMeta) -> Result<()> {
        let now = now_stamp()?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO model_lst(model_id, model_name, model_digest, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![model.model_id, model.name, model.digest, now],
            )
            .context("failed to insert model row")?;
        Ok(())
    }

    /// Creates the generated value tables of one model: a run and a
    /// workset parameter table per parameter, an accumulator and an
    /// expression table per output table.
    pub fn create_model_tables(&self, params: &[ParamMeta], tables: &[TableMeta]) -> Result<()> {
        for param in params {
            check_name(&param.name)?;
            for dim in &param.dims {
                check_name(&dim.name)?;
            }
            self.conn
                .execute_batch(&parameter_table_ddl(param, "run_id", &run_value_table(&param.name)))
                .with_context(|| format!("failed to create value table for {}", param.name))?;
            self.conn
                .execute_batch(&parameter_table_ddl(param, "set_id", &set_value_table(&param.name)))
                .with_context(|| format!("failed to create workset table for {}", param.name))?;
        }

        for table in tables {
            check_name(&table.name)?;
            for dim in &table.dims {
                check_name(&dim.name)?;
            }
            self.conn
                .execute_batch(&acc_table_ddl(table))
                .with_context(|| format!("failed to create accumulator table for {}", table.name))?;
            self.conn
                .execute_batch(&expr_table_ddl(table))
                .with_context(|| format!("failed to create expression table for {}", table.name))?;
        }

        Ok(())
    }

    // --- run lifecycle ------------------------------------------------------

    pub fn create_run(&mut self, model_id: i32, run_name: &str, sub_count: i32) -> Result<i32> {
        if run_name.trim().is_empty() {
            return Err(DbError::InvalidArgument("empty run name".to_string()).into());
        }
        if sub_count < 1 {
            return Err(
                DbError::InvalidArgument(format!("invalid sub-value count: {sub_count}")).into(),
            );
        }

        let now = now_stamp()?;
        self.conn
            .execute(
                "INSERT INTO run_lst(model_id, run_name, sub_count, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    model_id,
                    run_name,
                    sub_count,
                    RunStatus::InProgress.as_str(),
                    now
                ],
            )
            .context("failed to insert run row")?;

        let run_id = self.conn.last_insert_rowid();
        i32::try_from(run_id).with_context(|| format!("run id out of range: {run_id}"))
    }

    pub fn update_run_status(&mut self, run_id: i32, status: RunStatus) -> Result<()> {
        let now = now_stamp()?;
        let updated = self
            .conn
            .execute(
                "UPDATE run_lst SET status = ?1, updated_at = ?2 WHERE run_id = ?3",
                params![status.as_str(), now, run_id],
            )
            .context("failed to update run status")?;

        if updated == 0 {
            return Err(DbError::NotFound(format!("run {run_id}")).into());
        }
        Ok(())
    }

    pub fn get_run_status(&self, run_id: i32) -> Result<RunStatus> {
        run_status_of(&self.conn, run_id)
    }

    pub fn get_run_sub_count(&self, run_id: i32) -> Result<i32> {
        self.conn
            .query_row(
                "SELECT sub_count FROM run_lst WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query run sub_count")?
            .ok_or_else(|| DbError::NotFound(format!("run {run_id}")).into())
    }

    /// Digests of all completed runs of one model, keyed by run id.
    pub fn run_digests(&self, model_id: i32) -> Result<BTreeMap<i32, String>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, run_digest FROM run_lst
             WHERE model_id = ?1 AND run_digest IS NOT NULL
             ORDER BY run_id ASC",
        )?;

        let mut rows = stmt.query(params![model_id])?;
        let mut map = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let run_id: i32 = row.get(0)?;
            let digest: String = row.get(1)?;
            let _ = map.insert(run_id, digest);
        }
        Ok(map)
    }

    pub fn get_run_table_link(&self, run_id: i32, table_id: i32) -> Result<Option<(i32, String)>> {
        self.conn
            .query_row(
                "SELECT base_run_id, value_digest FROM run_table
                 WHERE run_id = ?1 AND table_id = ?2",
                params![run_id, table_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("failed to query run_table link")
    }

    /// Number of physical value rows one run owns in a generated table.
    pub fn owned_row_count(&self, value_table: &str, owner_col: &str, owner_id: i64) -> Result<i64> {
        check_name(value_table)?;
        check_name(owner_col)?;
        self.conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {value_table} WHERE {owner_col} = ?1"),
                params![owner_id],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to count rows of {value_table}"))
    }

    // --- parameter read/write -----------------------------------------------

    /// Writes one run's values of one parameter. The run must still be in
    /// progress: a completed run owns its rows and never takes more.
    pub fn write_run_parameter(
        &mut self,
        param: &ParamMeta,
        run_id: i32,
        cells: &[ParamCell],
    ) -> Result<usize> {
        check_name(&param.name)?;
        let cvt = ParamConverter::new(param, FloatFmt::default())?;
        for cell in cells {
            let _ = cvt.to_row(cell)?;
        }

        let tx = self.conn.transaction()?;

        let status = run_status_of(&tx, run_id)?;
        if status.is_completed() {
            return Err(DbError::StateConflict(format!(
                "run {run_id} is completed, parameter {} is frozen",
                param.name
            ))
            .into());
        }

        let table = run_value_table(&param.name);
        let existing: i64 = tx.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE run_id = ?1"),
            params![run_id],
            |row| row.get(0),
        )?;
        if existing > 0 {
            return Err(DbError::StateConflict(format!(
                "parameter {} already written for run {run_id}",
                param.name
            ))
            .into());
        }

        insert_parameter_rows(&tx, param, &table, "run_id", i64::from(run_id), cells)?;

        let now = now_stamp()?;
        tx.execute(
            "UPDATE run_lst SET updated_at = ?1 WHERE run_id = ?2",
            params![now, run_id],
        )?;
        tx.commit()?;

        debug!(run_id, parameter = %param.name, rows = cells.len(), "run parameter stored");
        Ok(cells.len())
    }

    pub fn read_run_parameter(
        &self,
        param: &ParamMeta,
        run_id: i32,
        layout: ReadPageLayout,
    ) -> Result<(Vec<ParamCell>, ReadPageLayout)> {
        let status = self.get_run_status(run_id)?;
        if !status.is_completed() {
            return Err(DbError::StateConflict(format!(
                "run {run_id} is not completed, its values are not readable"
            ))
            .into());
        }

        self.read_parameter_rows(
            &run_value_table(&param.name),
            "run_id",
            i64::from(run_id),
            param,
            layout,
        )
    }

    /// Reads a workset's values of one parameter: its own override rows
    /// when the parameter belongs to the workset, the base run's rows
    /// otherwise.
    pub fn read_workset_parameter(
        &self,
        model_id: i32,
        set_name: &str,
        param: &ParamMeta,
        layout: ReadPageLayout,
    ) -> Result<(Vec<ParamCell>, ReadPageLayout)> {
        let set = self.get_workset_row(model_id, set_name)?;

        let member: Option<i64> = self
            .conn
            .query_row(
                "SELECT param_id FROM workset_parameter WHERE set_id = ?1 AND param_id = ?2",
                params![set.set_id, param.param_id],
                |row| row.get(0),
            )
            .optional()?;

        if member.is_some() {
            return self.read_parameter_rows(
                &set_value_table(&param.name),
                "set_id",
                set.set_id,
                param,
                layout,
            );
        }

        match set.base_run_id {
            Some(base_run_id) => self.read_run_parameter(param, base_run_id, layout),
            None => Err(DbError::NotFound(format!(
                "parameter {} is not in workset {set_name} and the workset has no base run",
                param.name
            ))
            .into()),
        }
    }

    fn read_parameter_rows(
        &self,
        value_table: &str,
        owner_col: &str,
        owner_id: i64,
        param: &ParamMeta,
        layout: ReadPageLayout,
    ) -> Result<(Vec<ParamCell>, ReadPageLayout)> {
        check_name(value_table)?;
        for dim in &param.dims {
            check_name(&dim.name)?;
        }

        let mut cols = vec!["sub_id".to_string()];
        cols.extend(param.dims.iter().map(|dim| dim.name.clone()));
        cols.push("param_value".to_string());

        let sql = format!(
            "SELECT {} FROM {value_table} WHERE {owner_col} = ?1 ORDER BY {}",
            cols.join(", "),
            order_by_ordinals(cols.len() - 1)
        );

        let rank = param.rank();
        let kind = param.value_type.storage_kind();
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![owner_id], move |row| {
            let sub_id: i32 = row.get(0)?;
            let mut dim_ids = Vec::with_capacity(rank);
            for idx in 0..rank {
                dim_ids.push(row.get::<_, i32>(idx + 1)?);
            }
            let value = decode_value(row, rank + 1, kind)?;
            Ok(ParamCell {
                sub_id,
                dim_ids,
                value,
            })
        })?;

        let (cells, actual) = select_page(rows, layout)
            .with_context(|| format!("failed to read parameter page from {value_table}"))?;
        Ok((cells, actual))
    }

    // --- output table read/write --------------------------------------------

    pub fn read_output_expressions(
        &self,
        table: &TableMeta,
        run_id: i32,
        layout: ReadPageLayout,
    ) -> Result<(Vec<ExprCell>, ReadPageLayout)> {
        let base_run_id = self.base_run_for(run_id, table)?;
        check_name(&table.name)?;
        for dim in &table.dims {
            check_name(&dim.name)?;
        }

        let mut cols = vec!["expr_id".to_string()];
        cols.extend(table.dims.iter().map(|dim| dim.name.clone()));
        cols.push("expr_value".to_string());

        let sql = format!(
            "SELECT {} FROM {} WHERE run_id = ?1 ORDER BY {}",
            cols.join(", "),
            expr_value_table(&table.name),
            order_by_ordinals(cols.len() - 1)
        );

        let rank = table.rank();
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![base_run_id], move |row| {
            let expr_id: i32 = row.get(0)?;
            let mut dim_ids = Vec::with_capacity(rank);
            for idx in 0..rank {
                dim_ids.push(row.get::<_, i32>(idx + 1)?);
            }
            let value = decode_value(row, rank + 1, TypeKind::Float)?;
            Ok(ExprCell {
                expr_id,
                dim_ids,
                value,
            })
        })?;

        let (cells, actual) = select_page(rows, layout)
            .with_context(|| format!("failed to read expression page of {}", table.name))?;
        Ok((cells, actual))
    }

    pub fn read_output_accumulators(
        &self,
        table: &TableMeta,
        run_id: i32,
        layout: ReadPageLayout,
    ) -> Result<(Vec<AccCell>, ReadPageLayout)> {
        let base_run_id = self.base_run_for(run_id, table)?;
        check_name(&table.name)?;
        for dim in &table.dims {
            check_name(&dim.name)?;
        }

        let mut cols = vec!["acc_id".to_string(), "sub_id".to_string()];
        cols.extend(table.dims.iter().map(|dim| dim.name.clone()));
        cols.push("acc_value".to_string());

        let sql = format!(
            "SELECT {} FROM {} WHERE run_id = ?1 ORDER BY {}",
            cols.join(", "),
            acc_value_table(&table.name),
            order_by_ordinals(cols.len() - 1)
        );

        let rank = table.rank();
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![base_run_id], move |row| {
            let acc_id: i32 = row.get(0)?;
            let sub_id: i32 = row.get(1)?;
            let mut dim_ids = Vec::with_capacity(rank);
            for idx in 0..rank {
                dim_ids.push(row.get::<_, i32>(idx + 2)?);
            }
            let value = decode_value(row, rank + 2, TypeKind::Float)?;
            Ok(AccCell {
                acc_id,
                sub_id,
                dim_ids,
                value,
            })
        })?;

        let (cells, actual) = select_page(rows, layout)
            .with_context(|| format!("failed to read accumulator page of {}", table.name))?;
        Ok((cells, actual))
    }

    fn base_run_for(&self, run_id: i32, table: &TableMeta) -> Result<i32> {
        let status = self.get_run_status(run_id)?;
        if !status.is_completed() {
            return Err(DbError::StateConflict(format!(
                "run {run_id} is not completed, its values are not readable"
            ))
            .into());
        }

        self.conn
            .query_row(
                "SELECT base_run_id FROM run_table WHERE run_id = ?1 AND table_id = ?2",
                params![run_id, table.table_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query run_table base run")?
            .ok_or_else(|| {
                DbError::NotFound(format!(
                    "run {run_id} has no output for table {}",
                    table.name
                ))
                .into()
            })
    }

    /// Writes one run's output values of one table, at most once per
    /// (run, table).
    ///
    /// The value digest decides physical storage: the first run with a
    /// given digest owns the bulk rows, every later run with the same
    /// digest only points at it through `base_run_id`.
    pub fn write_output_table(
        &mut self,
        table: &TableMeta,
        run_id: i32,
        accs: &[AccCell],
        exprs: &[ExprCell],
        fmt: FloatFmt,
    ) -> Result<String> {
        check_name(&table.name)?;
        for dim in &table.dims {
            check_name(&dim.name)?;
        }

        let tx = self.conn.transaction()?;

        let status = run_status_of(&tx, run_id)?;
        if !status.is_completed() {
            return Err(DbError::StateConflict(format!(
                "run {run_id} is not completed, output cannot be written"
            ))
            .into());
        }

        let sub_count: i32 = tx.query_row(
            "SELECT sub_count FROM run_lst WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;

        let already: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM run_table WHERE run_id = ?1 AND table_id = ?2",
                params![run_id, table.table_id],
                |row| row.get(0),
            )
            .optional()?;
        if already.is_some() {
            return Err(DbError::StateConflict(format!(
                "output of table {} already written for run {run_id}",
                table.name
            ))
            .into());
        }

        let digest = digest_output_values(table, sub_count, accs, exprs, fmt)?;

        tx.execute(
            "INSERT INTO run_table(run_id, table_id, base_run_id, value_digest)
             VALUES (?1, ?2, ?1, ?3)",
            params![run_id, table.table_id, digest],
        )?;

        let base_run_id: Option<i32> = tx.query_row(
            "SELECT MIN(run_id) FROM run_table WHERE table_id = ?1 AND value_digest = ?2",
            params![table.table_id, digest],
            |row| row.get(0),
        )?;
        let base_run_id = base_run_id.ok_or_else(|| {
            anyhow::Error::new(DbError::IntegrityViolation(format!(
                "no run_table row for table {} with digest {digest}",
                table.name
            )))
        })?;

        if base_run_id == run_id {
            insert_acc_rows(&tx, table, run_id, accs)?;
            insert_expr_rows(&tx, table, run_id, exprs)?;
            debug!(
                run_id,
                table = %table.name,
                accs = accs.len(),
                exprs = exprs.len(),
                "output values stored"
            );
        } else {
            let updated = tx.execute(
                "UPDATE run_table SET base_run_id = ?1 WHERE run_id = ?2 AND table_id = ?3",
                params![base_run_id, run_id, table.table_id],
            )?;
            if updated != 1 {
                return Err(DbError::IntegrityViolation(format!(
                    "base run update changed {updated} rows for run {run_id}, table {}",
                    table.name
                ))
                .into());
            }
            info!(
                run_id,
                base_run_id,
                table = %table.name,
                "identical output digest, values shared with base run"
            );
        }

        let now = now_stamp()?;
        tx.execute(
            "UPDATE run_lst SET run_digest = COALESCE(run_digest, ?1), updated_at = ?2
             WHERE run_id = ?3",
            params![digest, now, run_id],
        )?;

        tx.commit()?;
        Ok(digest)
    }

    // --- worksets -----------------------------------------------------------

    pub fn create_workset(
        &mut self,
        model_id: i32,
        set_name: &str,
        base_run_id: Option<i32>,
    ) -> Result<i64> {
        if set_name.trim().is_empty() {
            return Err(DbError::InvalidArgument("empty workset name".to_string()).into());
        }
        if let Some(base) = base_run_id {
            let status = self.get_run_status(base)?;
            if !status.is_completed() {
                return Err(DbError::StateConflict(format!(
                    "base run {base} is not completed"
                ))
                .into());
            }
        }

        let now = now_stamp()?;
        self.conn
            .execute(
                "INSERT INTO workset_lst(model_id, set_name, is_readonly, base_run_id, updated_at)
                 VALUES (?1, ?2, 0, ?3, ?4)",
                params![model_id, set_name, base_run_id, now],
            )
            .with_context(|| format!("failed to insert workset {set_name}"))?;

        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_workset_readonly(&self, model_id: i32, set_name: &str) -> Result<i64> {
        Ok(self.get_workset_row(model_id, set_name)?.is_readonly)
    }

    /// Flips the read-only flag. Marking read-only uses the same counter
    /// increment as the edit lock, so it fails while an editor holds the
    /// workset or the flag is already set.
    pub fn set_workset_readonly(
        &mut self,
        model_id: i32,
        set_name: &str,
        readonly: bool,
    ) -> Result<()> {
        let now = now_stamp()?;
        let tx = self.conn.transaction()?;

        if readonly {
            let updated = tx.execute(
                "UPDATE workset_lst SET is_readonly = is_readonly + 1, updated_at = ?3
                 WHERE model_id = ?1 AND set_name = ?2",
                params![model_id, set_name, now],
            )?;
            if updated == 0 {
                return Err(DbError::NotFound(format!("workset {set_name}")).into());
            }

            let counter: i64 = tx.query_row(
                "SELECT is_readonly FROM workset_lst WHERE model_id = ?1 AND set_name = ?2",
                params![model_id, set_name],
                |row| row.get(0),
            )?;
            if counter != 1 {
                return Err(DbError::StateConflict(format!(
                    "workset {set_name} is locked or already read-only"
                ))
                .into());
            }
        } else {
            let updated = tx.execute(
                "UPDATE workset_lst SET is_readonly = 0, updated_at = ?3
                 WHERE model_id = ?1 AND set_name = ?2",
                params![model_id, set_name, now],
            )?;
            if updated == 0 {
                return Err(DbError::NotFound(format!("workset {set_name}")).into());
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Replaces one parameter's override values in a workset under the
    /// edit lock. Membership and value rows are rewritten together.
    pub fn update_workset_parameter(
        &mut self,
        model_id: i32,
        set_name: &str,
        param: &ParamMeta,
        cells: &[ParamCell],
    ) -> Result<usize> {
        check_name(&param.name)?;
        let cvt = ParamConverter::new(param, FloatFmt::default())?;
        for cell in cells {
            let _ = cvt.to_row(cell)?;
        }

        let tx = self.conn.transaction()?;
        let lock = WorksetLock::acquire(&tx, model_id, set_name)?;

        let table = set_value_table(&param.name);
        let _ = tx.execute(
            &format!("DELETE FROM {table} WHERE set_id = ?1"),
            params![lock.set_id],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO workset_parameter(set_id, param_id, sub_count)
             VALUES (?1, ?2, ?3)",
            params![lock.set_id, param.param_id, param.sub_count],
        )?;
        insert_parameter_rows(&tx, param, &table, "set_id", lock.set_id, cells)?;

        lock.release(&tx)?;
        tx.commit()?;

        debug!(set_name, parameter = %param.name, rows = cells.len(), "workset parameter replaced");
        Ok(cells.len())
    }

    /// Deletes one parameter from a workset under the edit lock. Returns
    /// the number of deleted value rows, zero when the parameter was not
    /// part of the workset.
    pub fn delete_workset_parameter(
        &mut self,
        model_id: i32,
        set_name: &str,
        param: &ParamMeta,
    ) -> Result<usize> {
        check_name(&param.name)?;

        let tx = self.conn.transaction()?;
        let lock = WorksetLock::acquire(&tx, model_id, set_name)?;

        let member: Option<i64> = tx
            .query_row(
                "SELECT param_id FROM workset_parameter WHERE set_id = ?1 AND param_id = ?2",
                params![lock.set_id, param.param_id],
                |row| row.get(0),
            )
            .optional()?;

        if member.is_none() {
            lock.release(&tx)?;
            tx.commit()?;
            return Ok(0);
        }

        let deleted = tx.execute(
            &format!(
                "DELETE FROM {} WHERE set_id = ?1",
                set_value_table(&param.name)
            ),
            params![lock.set_id],
        )?;
        tx.execute(
            "DELETE FROM workset_parameter_txt WHERE set_id = ?1 AND param_id = ?2",
            params![lock.set_id, param.param_id],
        )?;
        tx.execute(
            "DELETE FROM workset_parameter WHERE set_id = ?1 AND param_id = ?2",
            params![lock.set_id, param.param_id],
        )?;

        lock.release(&tx)?;
        tx.commit()?;

        debug!(set_name, parameter = %param.name, rows = deleted, "workset parameter deleted");
        Ok(deleted)
    }

    fn get_workset_row(&self, model_id: i32, set_name: &str) -> Result<WorksetRow> {
        self.conn
            .query_row(
                "SELECT set_id, is_readonly, base_run_id FROM workset_lst
                 WHERE model_id = ?1 AND set_name = ?2",
                params![model_id, set_name],
                |row| {
                    Ok(WorksetRow {
                        set_id: row.get(0)?,
                        is_readonly: row.get(1)?,
                        base_run_id: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("failed to query workset row")?
            .ok_or_else(|| DbError::NotFound(format!("workset {set_name}")).into())
    }

    // --- profiles -----------------------------------------------------------

    pub fn update_profile(&mut self, name: &str, options: &BTreeMap<String, String>) -> Result<()> {
        if name.trim().is_empty() {
            return Err(DbError::InvalidArgument("empty profile name".to_string()).into());
        }

        let now = now_stamp()?;
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO profile_lst(profile_name, updated_at) VALUES (?1, ?2)
             ON CONFLICT(profile_name) DO UPDATE SET updated_at = excluded.updated_at",
            params![name, now],
        )?;
        tx.execute(
            "DELETE FROM profile_option WHERE profile_name = ?1",
            params![name],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO profile_option(profile_name, option_key, option_value)
                 VALUES (?1, ?2, ?3)",
            )?;
            for (key, value) in options {
                let _ = stmt.execute(params![name, key, value])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    pub fn delete_profile(&mut self, name: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM profile_option WHERE profile_name = ?1",
            params![name],
        )?;
        tx.execute(
            "DELETE FROM profile_lst WHERE profile_name = ?1",
            params![name],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_profile(&self, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM profile_lst WHERE profile_name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(None);
        }

        let mut stmt = self.conn.prepare(
            "SELECT option_key, option_value FROM profile_option
             WHERE profile_name = ?1 ORDER BY option_key ASC",
        )?;
        let mut rows = stmt.query(params![name])?;
        let mut options = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let _ = options.insert(row.get::<_, String>(0)?, row.get::<_, String>(1)?);
        }
        Ok(Some(options))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

struct WorksetRow {
    set_id: i64,
    is_readonly: i64,
    base_run_id: Option<i32>,
}

/// Cooperative edit lock over the workset read-only counter.
///
/// Acquire increments the counter and must then observe exactly 1; any
/// other value means the workset is read-only or another editor got there
/// first. A failed acquire rolls back with its transaction, which also
/// rolls back the increment, so the acquirer never touches a counter it
/// does not own. Release restores 0 and stamps the workset; it only runs
/// on success paths, error paths roll the whole transaction back.
struct WorksetLock {
    set_id: i64,
}

impl WorksetLock {
    fn acquire(tx: &Transaction<'_>, model_id: i32, set_name: &str) -> Result<Self> {
        let updated = tx.execute(
            "UPDATE workset_lst SET is_readonly = is_readonly + 1
             WHERE model_id = ?1 AND set_name = ?2",
            params![model_id, set_name],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("workset {set_name}")).into());
        }

        let (set_id, counter): (i64, i64) = tx.query_row(
            "SELECT set_id, is_readonly FROM workset_lst
             WHERE model_id = ?1 AND set_name = ?2",
            params![model_id, set_name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        if counter != 1 {
            return Err(DbError::StateConflict(format!(
                "workset {set_name} is read-only or locked by another editor"
            ))
            .into());
        }

        Ok(Self { set_id })
    }

    fn release(self, tx: &Transaction<'_>) -> Result<()> {
        let now = now_stamp()?;
        tx.execute(
            "UPDATE workset_lst SET is_readonly = 0, updated_at = ?1 WHERE set_id = ?2",
            params![now, self.set_id],
        )?;
        Ok(())
    }
}

// --- helpers ----------------------------------------------------------------

fn now_stamp() -> Result<String> {
    OffsetDateTime::now_utc()
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn run_status_of(conn: &Connection, run_id: i32) -> Result<RunStatus> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM run_lst WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )
        .optional()
        .context("failed to query run status")?;

    let raw = raw.ok_or_else(|| anyhow::Error::new(DbError::NotFound(format!("run {run_id}"))))?;
    RunStatus::parse(&raw).ok_or_else(|| {
        DbError::IntegrityViolation(format!("invalid run status '{raw}' for run {run_id}")).into()
    })
}

/// Identifiers are interpolated into generated SQL and must stay plain.
fn check_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        }
        None => false,
    };

    if !valid || name.len() > 63 {
        return Err(DbError::InvalidArgument(format!("invalid identifier: {name}")).into());
    }
    Ok(())
}

fn run_value_table(param_name: &str) -> String {
    format!("{param_name}_pv")
}

fn set_value_table(param_name: &str) -> String {
    format!("{param_name}_wv")
}

fn acc_value_table(table_name: &str) -> String {
    format!("{table_name}_av")
}

fn expr_value_table(table_name: &str) -> String {
    format!("{table_name}_ev")
}

fn column_type(kind: TypeKind) -> &'static str {
    match kind {
        TypeKind::Bool | TypeKind::Int => "INTEGER",
        TypeKind::Float => "REAL",
        TypeKind::Str => "TEXT",
    }
}

fn order_by_ordinals(count: usize) -> String {
    (1..=count)
        .map(|ordinal| ordinal.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn parameter_table_ddl(param: &ParamMeta, owner_col: &str, table_name: &str) -> String {
    let mut cols = vec![
        format!("{owner_col} INTEGER NOT NULL"),
        "sub_id INTEGER NOT NULL".to_string(),
    ];
    cols.extend(
        param
            .dims
            .iter()
            .map(|dim| format!("{} INTEGER NOT NULL", dim.name)),
    );
    cols.push(format!(
        "param_value {} NULL",
        column_type(param.value_type.storage_kind())
    ));

    let mut key = vec![owner_col.to_string(), "sub_id".to_string()];
    key.extend(param.dims.iter().map(|dim| dim.name.clone()));

    format!(
        "CREATE TABLE IF NOT EXISTS {table_name} (\n  {},\n  PRIMARY KEY ({})\n);",
        cols.join(",\n  "),
        key.join(", ")
    )
}

fn acc_table_ddl(table: &TableMeta) -> String {
    let mut cols = vec![
        "run_id INTEGER NOT NULL".to_string(),
        "acc_id INTEGER NOT NULL".to_string(),
        "sub_id INTEGER NOT NULL".to_string(),
    ];
    cols.extend(
        table
            .dims
            .iter()
            .map(|dim| format!("{} INTEGER NOT NULL", dim.name)),
    );
    cols.push("acc_value REAL NULL".to_string());

    let mut key = vec![
        "run_id".to_string(),
        "acc_id".to_string(),
        "sub_id".to_string(),
    ];
    key.extend(table.dims.iter().map(|dim| dim.name.clone()));

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  {},\n  PRIMARY KEY ({})\n);",
        acc_value_table(&table.name),
        cols.join(",\n  "),
        key.join(", ")
    )
}

fn expr_table_ddl(table: &TableMeta) -> String {
    let mut cols = vec![
        "run_id INTEGER NOT NULL".to_string(),
        "expr_id INTEGER NOT NULL".to_string(),
    ];
    cols.extend(
        table
            .dims
            .iter()
            .map(|dim| format!("{} INTEGER NOT NULL", dim.name)),
    );
    cols.push("expr_value REAL NULL".to_string());

    let mut key = vec!["run_id".to_string(), "expr_id".to_string()];
    key.extend(table.dims.iter().map(|dim| dim.name.clone()));

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  {},\n  PRIMARY KEY ({})\n);",
        expr_value_table(&table.name),
        cols.join(",\n  "),
        key.join(", ")
    )
}

fn decode_value(
    row: &rusqlite::Row<'_>,
    idx: usize,
    kind: TypeKind,
) -> rusqlite::Result<CellValue> {
    let value = match kind {
        TypeKind::Bool => row
            .get::<_, Option<i64>>(idx)?
            .map(|raw| CellValue::Bool(raw != 0)),
        TypeKind::Int => row.get::<_, Option<i64>>(idx)?.map(CellValue::Int),
        TypeKind::Float => row.get::<_, Option<f64>>(idx)?.map(CellValue::Float),
        TypeKind::Str => row.get::<_, Option<String>>(idx)?.map(CellValue::Str),
    };
    Ok(value.unwrap_or(CellValue::Null))
}

fn value_to_sql(value: &CellValue) -> rusqlite::types::Value {
    match value {
        CellValue::Null => rusqlite::types::Value::Null,
        CellValue::Bool(flag) => rusqlite::types::Value::Integer(i64::from(*flag)),
        CellValue::Int(number) => rusqlite::types::Value::Integer(*number),
        CellValue::Float(number) => rusqlite::types::Value::Real(*number),
        CellValue::Str(text) => rusqlite::types::Value::Text(text.clone()),
    }
}

fn insert_parameter_rows(
    tx: &Transaction<'_>,
    param: &ParamMeta,
    value_table: &str,
    owner_col: &str,
    owner_id: i64,
    cells: &[ParamCell],
) -> Result<()> {
    let mut cols = vec![owner_col.to_string(), "sub_id".to_string()];
    cols.extend(param.dims.iter().map(|dim| dim.name.clone()));
    cols.push("param_value".to_string());

    let sql = format!(
        "INSERT INTO {value_table} ({}) VALUES ({})",
        cols.join(", "),
        placeholders(cols.len())
    );

    let mut stmt = tx.prepare(&sql)?;
    for cell in cells {
        let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(cols.len());
        values.push(owner_id.into());
        values.push(i64::from(cell.sub_id).into());
        for dim_id in &cell.dim_ids {
            values.push(i64::from(*dim_id).into());
        }
        values.push(value_to_sql(&cell.value));
        let _ = stmt.execute(rusqlite::params_from_iter(values))?;
    }
    Ok(())
}

fn insert_acc_rows(
    tx: &Transaction<'_>,
    table: &TableMeta,
    run_id: i32,
    cells: &[AccCell],
) -> Result<()> {
    let mut cols = vec![
        "run_id".to_string(),
        "acc_id".to_string(),
        "sub_id".to_string(),
    ];
    cols.extend(table.dims.iter().map(|dim| dim.name.clone()));
    cols.push("acc_value".to_string());

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        acc_value_table(&table.name),
        cols.join(", "),
        placeholders(cols.len())
    );

    let mut stmt = tx.prepare(&sql)?;
    for cell in cells {
        let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(cols.len());
        values.push(i64::from(run_id).into());
        values.push(i64::from(cell.acc_id).into());
        values.push(i64::from(cell.sub_id).into());
        for dim_id in &cell.dim_ids {
            values.push(i64::from(*dim_id).into());
        }
        values.push(value_to_sql(&cell.value));
        let _ = stmt.execute(rusqlite::params_from_iter(values))?;
    }
    Ok(())
}

fn insert_expr_rows(
    tx: &Transaction<'_>,
    table: &TableMeta,
    run_id: i32,
    cells: &[ExprCell],
) -> Result<()> {
    let mut cols = vec!["run_id".to_string(), "expr_id".to_string()];
    cols.extend(table.dims.iter().map(|dim| dim.name.clone()));
    cols.push("expr_value".to_string());

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        expr_value_table(&table.name),
        cols.join(", "),
        placeholders(cols.len())
    );

    let mut stmt = tx.prepare(&sql)?;
    for cell in cells {
        let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(cols.len());
        values.push(i64::from(run_id).into());
        values.push(i64::from(cell.expr_id).into());
        for dim_id in &cell.dim_ids {
            values.push(i64::from(*dim_id).into());
        }
        values.push(value_to_sql(&cell.value));
        let _ = stmt.execute(rusqlite::params_from_iter(values))?;
    }
    Ok(())
}

fn placeholders(count: usize) -> String {
    (1..=count)
        .map(|ordinal| format!("?{ordinal}"))
        .collect::<Vec<_>>()
        .join(", ")
}
