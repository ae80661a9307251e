#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! Domain core of the model database: metadata descriptors, cell model,
//! enum id/code conversion, CSV cell converters, output value digests and
//! the paged cursor selector. No database access happens here; the store
//! crate drives these types against SQL.

use std::collections::{BTreeMap, VecDeque};
use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Literal used for missing values in CSV rows and digest lines.
pub const NULL_TOKEN: &str = "null";

/// Reserved code of the aggregate "total" enum item.
pub const TOTAL_CODE: &str = "all";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid value '{value}' for {context}")]
    InvalidValue { value: String, context: String },
    #[error("invalid row size: expected {expected} fields, got {actual}")]
    InvalidRowSize { expected: usize, actual: usize },
    #[error("unknown run: {0}")]
    UnknownRun(String),
    #[error("state conflict: {0}")]
    StateConflict(String),
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Success,
    Exit,
    Error,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Exit => "exit",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(Self::InProgress),
            "success" => Some(Self::Success),
            "exit" => Some(Self::Exit),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// A run owns its value rows only once it reached a terminal status.
    #[must_use]
    pub fn is_completed(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    Bool,
    Int,
    Float,
    Str,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EnumItem {
    pub enum_id: i32,
    pub code: String,
}

/// Type of one dimension, attribute or value: a built-in scalar or an
/// enumerated item list with an optional aggregate "total" item.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TypeDef {
    Builtin(TypeKind),
    Enum {
        items: Vec<EnumItem>,
        total_enum_id: Option<i32>,
    },
}

impl TypeDef {
    /// Column affinity of values of this type: enum items are stored as
    /// integer ids.
    #[must_use]
    pub fn storage_kind(&self) -> TypeKind {
        match self {
            Self::Builtin(kind) => *kind,
            Self::Enum { .. } => TypeKind::Int,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMeta {
    pub model_id: i32,
    pub name: String,
    pub digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DimMeta {
    pub name: String,
    pub type_def: TypeDef,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParamMeta {
    pub param_id: i32,
    pub name: String,
    pub dims: Vec<DimMeta>,
    pub value_type: TypeDef,
    pub sub_count: i32,
}

impl ParamMeta {
    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccMeta {
    pub acc_id: i32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExprMeta {
    pub expr_id: i32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableMeta {
    pub table_id: i32,
    pub name: String,
    /// Digest of the table definition, part of every value digest header.
    pub def_digest: String,
    pub dims: Vec<DimMeta>,
    pub accs: Vec<AccMeta>,
    pub exprs: Vec<ExprMeta>,
}

impl TableMeta {
    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttrMeta {
    pub attr_id: i32,
    pub name: String,
    pub type_def: TypeDef,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityMeta {
    pub entity_id: i32,
    pub name: String,
    pub key_name: String,
    pub attrs: Vec<AttrMeta>,
}

/// One scalar payload. Missing values are `Null`, never a stale payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl CellValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// Float rendering shared by CSV rows and the digest serializer. The two
/// must agree, otherwise value digests drift with the output format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct FloatFmt {
    pub precision: Option<usize>,
}

impl FloatFmt {
    #[must_use]
    pub fn format(&self, value: f64) -> String {
        match self.precision {
            Some(prec) => format!("{value:.prec$}"),
            None => format!("{value}"),
        }
    }
}

// --- cell model -------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParamCell {
    pub sub_id: i32,
    pub dim_ids: Vec<i32>,
    pub value: CellValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExprCell {
    pub expr_id: i32,
    pub dim_ids: Vec<i32>,
    pub value: CellValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccCell {
    pub acc_id: i32,
    pub sub_id: i32,
    pub dim_ids: Vec<i32>,
    pub value: CellValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompareCell {
    pub run_id: i32,
    pub dim_ids: Vec<i32>,
    pub value: CellValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MicroCell {
    pub key: i64,
    pub attrs: Vec<CellValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParamCellCode {
    pub sub_id: i32,
    pub dims: Vec<String>,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExprCellCode {
    pub expr_id: i32,
    pub dims: Vec<String>,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccCellCode {
    pub acc_id: i32,
    pub sub_id: i32,
    pub dims: Vec<String>,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompareCellCode {
    pub run_digest: String,
    pub dims: Vec<String>,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MicroCellCode {
    pub key: i64,
    pub attrs: Vec<String>,
}

// --- item codec -------------------------------------------------------------

/// Id/code translation for one dimension or attribute. Built once per
/// read or write operation and reused for every row; the per-lookup scan
/// over the enum list stays cheap because enum lists are small.
#[derive(Debug, Clone)]
pub struct ItemCodec {
    name: String,
    kind: ItemCodecKind,
}

#[derive(Debug, Clone)]
enum ItemCodecKind {
    Bool,
    Int,
    Enum {
        items: Vec<EnumItem>,
        total: Option<i32>,
    },
}

impl ItemCodec {
    /// Fails for float and string descriptors: those never form a
    /// dimension or enum attribute.
    pub fn new(name: &str, type_def: &TypeDef, use_total: bool) -> Result<Self, DbError> {
        let kind = match type_def {
            TypeDef::Builtin(TypeKind::Bool) => ItemCodecKind::Bool,
            TypeDef::Builtin(TypeKind::Int) => ItemCodecKind::Int,
            TypeDef::Builtin(other) => {
                return Err(DbError::InvalidArgument(format!(
                    "unsupported item type {} for {name}",
                    match other {
                        TypeKind::Float => "float",
                        _ => "string",
                    }
                )));
            }
            TypeDef::Enum {
                items,
                total_enum_id,
            } => ItemCodecKind::Enum {
                items: items.clone(),
                total: if use_total { *total_enum_id } else { None },
            },
        };

        Ok(Self {
            name: name.to_string(),
            kind,
        })
    }

    pub fn id_to_code(&self, item_id: i32) -> Result<String, DbError> {
        match &self.kind {
            ItemCodecKind::Bool => match item_id {
                0 => Ok("false".to_string()),
                1 | -1 => Ok("true".to_string()),
                other => Err(self.invalid(&other.to_string())),
            },
            ItemCodecKind::Int => Ok(item_id.to_string()),
            ItemCodecKind::Enum { items, total } => items
                .iter()
                .find(|item| item.enum_id == item_id)
                .map(|item| item.code.clone())
                .or_else(|| {
                    (*total)
                        .filter(|total_id| *total_id == item_id)
                        .map(|_| TOTAL_CODE.to_string())
                })
                .ok_or_else(|| self.invalid(&item_id.to_string())),
        }
    }

    pub fn code_to_id(&self, code: &str) -> Result<i32, DbError> {
        match &self.kind {
            ItemCodecKind::Bool => match code {
                "true" => Ok(1),
                "false" => Ok(0),
                other => Err(self.invalid(other)),
            },
            ItemCodecKind::Int => code.parse().map_err(|_| self.invalid(code)),
            ItemCodecKind::Enum { items, total } => items
                .iter()
                .find(|item| item.code == code)
                .map(|item| item.enum_id)
                .or_else(|| (*total).filter(|_| code == TOTAL_CODE))
                .ok_or_else(|| self.invalid(code)),
        }
    }

    fn invalid(&self, value: &str) -> DbError {
        DbError::InvalidValue {
            value: value.to_string(),
            context: self.name.clone(),
        }
    }
}

// --- value codec ------------------------------------------------------------

/// Formats and parses a cell payload in both the id-based and the
/// code-based row representation.
#[derive(Debug, Clone)]
pub struct ValueCodec {
    name: String,
    kind: ValueKind,
}

#[derive(Debug, Clone)]
enum ValueKind {
    Bool,
    Int,
    Float(FloatFmt),
    Str,
    Enum(ItemCodec),
}

impl ValueCodec {
    pub fn new(name: &str, type_def: &TypeDef, fmt: FloatFmt) -> Result<Self, DbError> {
        let kind = match type_def {
            TypeDef::Builtin(TypeKind::Bool) => ValueKind::Bool,
            TypeDef::Builtin(TypeKind::Int) => ValueKind::Int,
            TypeDef::Builtin(TypeKind::Float) => ValueKind::Float(fmt),
            TypeDef::Builtin(TypeKind::Str) => ValueKind::Str,
            TypeDef::Enum { .. } => ValueKind::Enum(ItemCodec::new(name, type_def, false)?),
        };

        Ok(Self {
            name: name.to_string(),
            kind,
        })
    }

    pub fn format_id(&self, value: &CellValue) -> Result<String, DbError> {
        if value.is_null() {
            return Ok(NULL_TOKEN.to_string());
        }

        match (&self.kind, value) {
            (ValueKind::Bool, CellValue::Bool(flag)) => Ok(i64::from(*flag).to_string()),
            (ValueKind::Int | ValueKind::Enum(_), CellValue::Int(number)) => Ok(number.to_string()),
            (ValueKind::Float(fmt), CellValue::Float(number)) => Ok(fmt.format(*number)),
            (ValueKind::Str, CellValue::Str(text)) => Ok(text.clone()),
            _ => Err(self.mismatch(value)),
        }
    }

    pub fn format_code(&self, value: &CellValue) -> Result<String, DbError> {
        if value.is_null() {
            return Ok(NULL_TOKEN.to_string());
        }

        match (&self.kind, value) {
            (ValueKind::Bool, CellValue::Bool(flag)) => Ok(flag.to_string()),
            (ValueKind::Enum(codec), CellValue::Int(number)) => {
                let item_id = i32::try_from(*number).map_err(|_| self.mismatch(value))?;
                codec.id_to_code(item_id)
            }
            _ => self.format_id(value),
        }
    }

    pub fn parse_id(&self, raw: &str) -> Result<CellValue, DbError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == NULL_TOKEN {
            return Ok(CellValue::Null);
        }

        match &self.kind {
            ValueKind::Bool => match trimmed {
                "0" => Ok(CellValue::Bool(false)),
                "1" | "-1" => Ok(CellValue::Bool(true)),
                other => Err(self.invalid(other)),
            },
            ValueKind::Int => trimmed
                .parse()
                .map(CellValue::Int)
                .map_err(|_| self.invalid(trimmed)),
            ValueKind::Float(_) => trimmed
                .parse()
                .map(CellValue::Float)
                .map_err(|_| self.invalid(trimmed)),
            ValueKind::Str => Ok(CellValue::Str(trimmed.to_string())),
            ValueKind::Enum(_) => trimmed
                .parse::<i32>()
                .map(|item_id| CellValue::Int(i64::from(item_id)))
                .map_err(|_| self.invalid(trimmed)),
        }
    }

    pub fn parse_code(&self, raw: &str) -> Result<CellValue, DbError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == NULL_TOKEN {
            return Ok(CellValue::Null);
        }

        match &self.kind {
            ValueKind::Bool => trimmed
                .parse::<bool>()
                .map(CellValue::Bool)
                .map_err(|_| self.invalid(trimmed)),
            ValueKind::Enum(codec) => codec
                .code_to_id(trimmed)
                .map(|item_id| CellValue::Int(i64::from(item_id))),
            _ => self.parse_id(raw),
        }
    }

    fn invalid(&self, value: &str) -> DbError {
        DbError::InvalidValue {
            value: value.to_string(),
            context: self.name.clone(),
        }
    }

    fn mismatch(&self, value: &CellValue) -> DbError {
        DbError::InvalidValue {
            value: format!("{value:?}"),
            context: self.name.clone(),
        }
    }
}

// --- cell converters --------------------------------------------------------

fn dim_codecs(dims: &[DimMeta], use_total: bool) -> Result<Vec<ItemCodec>, DbError> {
    dims.iter()
        .map(|dim| ItemCodec::new(&dim.name, &dim.type_def, use_total))
        .collect()
}

fn dim_names(dims: &[DimMeta]) -> Vec<String> {
    dims.iter().map(|dim| dim.name.clone()).collect()
}

fn parse_i32(raw: &str, context: &str) -> Result<i32, DbError> {
    raw.trim().parse().map_err(|_| DbError::InvalidValue {
        value: raw.to_string(),
        context: context.to_string(),
    })
}

fn parse_i64(raw: &str, context: &str) -> Result<i64, DbError> {
    raw.trim().parse().map_err(|_| DbError::InvalidValue {
        value: raw.to_string(),
        context: context.to_string(),
    })
}

fn check_row_size(actual: usize, expected: usize) -> Result<(), DbError> {
    if actual == expected {
        Ok(())
    } else {
        Err(DbError::InvalidRowSize { expected, actual })
    }
}

fn check_cell_rank(actual: usize, expected: usize, name: &str) -> Result<(), DbError> {
    if actual == expected {
        Ok(())
    } else {
        Err(DbError::InvalidArgument(format!(
            "cell has {actual} dimension items, {name} expects {expected}"
        )))
    }
}

fn ids_to_codes(codecs: &[ItemCodec], dim_ids: &[i32]) -> Result<Vec<String>, DbError> {
    codecs
        .iter()
        .zip(dim_ids)
        .map(|(codec, item_id)| codec.id_to_code(*item_id))
        .collect()
}

fn codes_to_ids(codecs: &[ItemCodec], codes: &[String]) -> Result<Vec<i32>, DbError> {
    codecs
        .iter()
        .zip(codes)
        .map(|(codec, code)| codec.code_to_id(code.trim()))
        .collect()
}

fn parse_dim_ids(codecs: &[ItemCodec], names: &[String], raw: &[String]) -> Result<Vec<i32>, DbError> {
    codecs
        .iter()
        .zip(names)
        .zip(raw)
        .map(|((codec, name), field)| {
            let item_id = parse_i32(field, name)?;
            // membership check: an id row must carry known item ids
            let _ = codec.id_to_code(item_id)?;
            Ok(item_id)
        })
        .collect()
}

/// Converter for input parameter cells: `sub_id`, one column per
/// dimension, then the parameter value.
#[derive(Debug, Clone)]
pub struct ParamConverter {
    name: String,
    sub_count: i32,
    dim_names: Vec<String>,
    dims: Vec<ItemCodec>,
    value: ValueCodec,
}

impl ParamConverter {
    pub fn new(param: &ParamMeta, fmt: FloatFmt) -> Result<Self, DbError> {
        Ok(Self {
            name: param.name.clone(),
            sub_count: param.sub_count,
            dim_names: dim_names(&param.dims),
            dims: dim_codecs(&param.dims, false)?,
            value: ValueCodec::new("param_value", &param.value_type, fmt)?,
        })
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.csv", self.name)
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn header(&self) -> Vec<String> {
        let mut header = Vec::with_capacity(self.rank() + 2);
        header.push("sub_id".to_string());
        header.extend(self.dim_names.iter().cloned());
        header.push("param_value".to_string());
        header
    }

    fn check_cell(&self, cell: &ParamCell) -> Result<(), DbError> {
        check_cell_rank(cell.dim_ids.len(), self.rank(), &self.name)?;
        self.check_sub_id(cell.sub_id)
    }

    fn check_sub_id(&self, sub_id: i32) -> Result<(), DbError> {
        if sub_id < 0 || sub_id >= self.sub_count {
            return Err(DbError::InvalidArgument(format!(
                "sub-value id {sub_id} out of range for parameter {}",
                self.name
            )));
        }
        Ok(())
    }

    pub fn to_row(&self, cell: &ParamCell) -> Result<Vec<String>, DbError> {
        self.check_cell(cell)?;
        let mut row = Vec::with_capacity(self.rank() + 2);
        row.push(cell.sub_id.to_string());
        row.extend(cell.dim_ids.iter().map(ToString::to_string));
        row.push(self.value.format_id(&cell.value)?);
        Ok(row)
    }

    pub fn to_code_row(&self, cell: &ParamCell) -> Result<Vec<String>, DbError> {
        let code = self.to_code_cell(cell)?;
        let mut row = Vec::with_capacity(self.rank() + 2);
        row.push(code.sub_id.to_string());
        row.extend(code.dims);
        row.push(code.value);
        Ok(row)
    }

    pub fn row_to_cell(&self, row: &[String]) -> Result<ParamCell, DbError> {
        check_row_size(row.len(), self.rank() + 2)?;
        let sub_id = parse_i32(&row[0], "sub_id")?;
        self.check_sub_id(sub_id)?;
        let dim_ids = parse_dim_ids(&self.dims, &self.dim_names, &row[1..=self.rank()])?;
        let value = self.value.parse_id(&row[self.rank() + 1])?;
        Ok(ParamCell {
            sub_id,
            dim_ids,
            value,
        })
    }

    pub fn code_row_to_cell(&self, row: &[String]) -> Result<ParamCell, DbError> {
        check_row_size(row.len(), self.rank() + 2)?;
        let sub_id = parse_i32(&row[0], "sub_id")?;
        self.check_sub_id(sub_id)?;
        let dim_ids = codes_to_ids(&self.dims, &row[1..=self.rank()])?;
        let value = self.value.parse_code(&row[self.rank() + 1])?;
        Ok(ParamCell {
            sub_id,
            dim_ids,
            value,
        })
    }

    pub fn to_code_cell(&self, cell: &ParamCell) -> Result<ParamCellCode, DbError> {
        self.check_cell(cell)?;
        Ok(ParamCellCode {
            sub_id: cell.sub_id,
            dims: ids_to_codes(&self.dims, &cell.dim_ids)?,
            value: self.value.format_code(&cell.value)?,
        })
    }
}

/// Converter for output expression cells: `expr_id`, dimensions, value.
/// Output dimensions carry the aggregate total item.
#[derive(Debug, Clone)]
pub struct ExprConverter {
    name: String,
    expr_ids: Vec<i32>,
    dim_names: Vec<String>,
    dims: Vec<ItemCodec>,
    value: ValueCodec,
}

impl ExprConverter {
    pub fn new(table: &TableMeta, fmt: FloatFmt) -> Result<Self, DbError> {
        Ok(Self {
            name: table.name.clone(),
            expr_ids: table.exprs.iter().map(|expr| expr.expr_id).collect(),
            dim_names: dim_names(&table.dims),
            dims: dim_codecs(&table.dims, true)?,
            value: ValueCodec::new(
                "expr_value",
                &TypeDef::Builtin(TypeKind::Float),
                fmt,
            )?,
        })
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.csv", self.name)
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn header(&self) -> Vec<String> {
        let mut header = Vec::with_capacity(self.rank() + 2);
        header.push("expr_id".to_string());
        header.extend(self.dim_names.iter().cloned());
        header.push("expr_value".to_string());
        header
    }

    fn check_cell(&self, cell: &ExprCell) -> Result<(), DbError> {
        check_cell_rank(cell.dim_ids.len(), self.rank(), &self.name)?;
        self.check_expr_id(cell.expr_id)
    }

    fn check_expr_id(&self, expr_id: i32) -> Result<(), DbError> {
        if self.expr_ids.contains(&expr_id) {
            Ok(())
        } else {
            Err(DbError::InvalidArgument(format!(
                "expression id {expr_id} is not defined for table {}",
                self.name
            )))
        }
    }

    pub fn to_row(&self, cell: &ExprCell) -> Result<Vec<String>, DbError> {
        self.check_cell(cell)?;
        let mut row = Vec::with_capacity(self.rank() + 2);
        row.push(cell.expr_id.to_string());
        row.extend(cell.dim_ids.iter().map(ToString::to_string));
        row.push(self.value.format_id(&cell.value)?);
        Ok(row)
    }

    pub fn to_code_row(&self, cell: &ExprCell) -> Result<Vec<String>, DbError> {
        let code = self.to_code_cell(cell)?;
        let mut row = Vec::with_capacity(self.rank() + 2);
        row.push(code.expr_id.to_string());
        row.extend(code.dims);
        row.push(code.value);
        Ok(row)
    }

    pub fn row_to_cell(&self, row: &[String]) -> Result<ExprCell, DbError> {
        check_row_size(row.len(), self.rank() + 2)?;
        let expr_id = parse_i32(&row[0], "expr_id")?;
        self.check_expr_id(expr_id)?;
        let dim_ids = parse_dim_ids(&self.dims, &self.dim_names, &row[1..=self.rank()])?;
        let value = self.value.parse_id(&row[self.rank() + 1])?;
        Ok(ExprCell {
            expr_id,
            dim_ids,
            value,
        })
    }

    pub fn code_row_to_cell(&self, row: &[String]) -> Result<ExprCell, DbError> {
        check_row_size(row.len(), self.rank() + 2)?;
        let expr_id = parse_i32(&row[0], "expr_id")?;
        self.check_expr_id(expr_id)?;
        let dim_ids = codes_to_ids(&self.dims, &row[1..=self.rank()])?;
        let value = self.value.parse_code(&row[self.rank() + 1])?;
        Ok(ExprCell {
            expr_id,
            dim_ids,
            value,
        })
    }

    pub fn to_code_cell(&self, cell: &ExprCell) -> Result<ExprCellCode, DbError> {
        self.check_cell(cell)?;
        Ok(ExprCellCode {
            expr_id: cell.expr_id,
            dims: ids_to_codes(&self.dims, &cell.dim_ids)?,
            value: self.value.format_code(&cell.value)?,
        })
    }
}

/// Converter for accumulator cells: `acc_id`, `sub_id`, dimensions, value.
#[derive(Debug, Clone)]
pub struct AccConverter {
    name: String,
    acc_ids: Vec<i32>,
    sub_count: i32,
    dim_names: Vec<String>,
    dims: Vec<ItemCodec>,
    value: ValueCodec,
}

impl AccConverter {
    pub fn new(table: &TableMeta, sub_count: i32, fmt: FloatFmt) -> Result<Self, DbError> {
        Ok(Self {
            name: table.name.clone(),
            acc_ids: table.accs.iter().map(|acc| acc.acc_id).collect(),
            sub_count,
            dim_names: dim_names(&table.dims),
            dims: dim_codecs(&table.dims, true)?,
            value: ValueCodec::new(
                "acc_value",
                &TypeDef::Builtin(TypeKind::Float),
                fmt,
            )?,
        })
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.acc.csv", self.name)
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn header(&self) -> Vec<String> {
        let mut header = Vec::with_capacity(self.rank() + 3);
        header.push("acc_id".to_string());
        header.push("sub_id".to_string());
        header.extend(self.dim_names.iter().cloned());
        header.push("acc_value".to_string());
        header
    }

    fn check_cell(&self, cell: &AccCell) -> Result<(), DbError> {
        check_cell_rank(cell.dim_ids.len(), self.rank(), &self.name)?;
        self.check_ids(cell.acc_id, cell.sub_id)
    }

    fn check_ids(&self, acc_id: i32, sub_id: i32) -> Result<(), DbError> {
        if !self.acc_ids.contains(&acc_id) {
            return Err(DbError::InvalidArgument(format!(
                "accumulator id {acc_id} is not defined for table {}",
                self.name
            )));
        }
        if sub_id < 0 || sub_id >= self.sub_count {
            return Err(DbError::InvalidArgument(format!(
                "sub-value id {sub_id} out of range for table {}",
                self.name
            )));
        }
        Ok(())
    }

    pub fn to_row(&self, cell: &AccCell) -> Result<Vec<String>, DbError> {
        self.check_cell(cell)?;
        let mut row = Vec::with_capacity(self.rank() + 3);
        row.push(cell.acc_id.to_string());
        row.push(cell.sub_id.to_string());
        row.extend(cell.dim_ids.iter().map(ToString::to_string));
        row.push(self.value.format_id(&cell.value)?);
        Ok(row)
    }

    pub fn to_code_row(&self, cell: &AccCell) -> Result<Vec<String>, DbError> {
        let code = self.to_code_cell(cell)?;
        let mut row = Vec::with_capacity(self.rank() + 3);
        row.push(code.acc_id.to_string());
        row.push(code.sub_id.to_string());
        row.extend(code.dims);
        row.push(code.value);
        Ok(row)
    }

    pub fn row_to_cell(&self, row: &[String]) -> Result<AccCell, DbError> {
        check_row_size(row.len(), self.rank() + 3)?;
        let acc_id = parse_i32(&row[0], "acc_id")?;
        let sub_id = parse_i32(&row[1], "sub_id")?;
        self.check_ids(acc_id, sub_id)?;
        let dim_ids = parse_dim_ids(&self.dims, &self.dim_names, &row[2..2 + self.rank()])?;
        let value = self.value.parse_id(&row[self.rank() + 2])?;
        Ok(AccCell {
            acc_id,
            sub_id,
            dim_ids,
            value,
        })
    }

    pub fn code_row_to_cell(&self, row: &[String]) -> Result<AccCell, DbError> {
        check_row_size(row.len(), self.rank() + 3)?;
        let acc_id = parse_i32(&row[0], "acc_id")?;
        let sub_id = parse_i32(&row[1], "sub_id")?;
        self.check_ids(acc_id, sub_id)?;
        let dim_ids = codes_to_ids(&self.dims, &row[2..2 + self.rank()])?;
        let value = self.value.parse_code(&row[self.rank() + 2])?;
        Ok(AccCell {
            acc_id,
            sub_id,
            dim_ids,
            value,
        })
    }

    pub fn to_code_cell(&self, cell: &AccCell) -> Result<AccCellCode, DbError> {
        self.check_cell(cell)?;
        Ok(AccCellCode {
            acc_id: cell.acc_id,
            sub_id: cell.sub_id,
            dims: ids_to_codes(&self.dims, &cell.dim_ids)?,
            value: self.value.format_code(&cell.value)?,
        })
    }
}

/// Converter for cross-run comparison cells. The code representation
/// names runs by digest; translation goes through a caller-supplied map.
#[derive(Debug, Clone)]
pub struct CompareConverter {
    name: String,
    dim_names: Vec<String>,
    dims: Vec<ItemCodec>,
    value: ValueCodec,
    digest_by_run: BTreeMap<i32, String>,
    run_by_digest: BTreeMap<String, i32>,
}

impl CompareConverter {
    pub fn new(
        table: &TableMeta,
        run_digests: &BTreeMap<i32, String>,
        fmt: FloatFmt,
    ) -> Result<Self, DbError> {
        let run_by_digest = run_digests
            .iter()
            .map(|(run_id, digest)| (digest.clone(), *run_id))
            .collect();
        Ok(Self {
            name: table.name.clone(),
            dim_names: dim_names(&table.dims),
            dims: dim_codecs(&table.dims, true)?,
            value: ValueCodec::new(
                "expr_value",
                &TypeDef::Builtin(TypeKind::Float),
                fmt,
            )?,
            digest_by_run: run_digests.clone(),
            run_by_digest,
        })
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.compare.csv", self.name)
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn header(&self) -> Vec<String> {
        let mut header = Vec::with_capacity(self.rank() + 2);
        header.push("run_id".to_string());
        header.extend(self.dim_names.iter().cloned());
        header.push("expr_value".to_string());
        header
    }

    #[must_use]
    pub fn code_header(&self) -> Vec<String> {
        let mut header = self.header();
        header[0] = "run_digest".to_string();
        header
    }

    pub fn to_row(&self, cell: &CompareCell) -> Result<Vec<String>, DbError> {
        check_cell_rank(cell.dim_ids.len(), self.rank(), &self.name)?;
        let mut row = Vec::with_capacity(self.rank() + 2);
        row.push(cell.run_id.to_string());
        row.extend(cell.dim_ids.iter().map(ToString::to_string));
        row.push(self.value.format_id(&cell.value)?);
        Ok(row)
    }

    pub fn to_code_row(&self, cell: &CompareCell) -> Result<Vec<String>, DbError> {
        let code = self.to_code_cell(cell)?;
        let mut row = Vec::with_capacity(self.rank() + 2);
        row.push(code.run_digest);
        row.extend(code.dims);
        row.push(code.value);
        Ok(row)
    }

    pub fn row_to_cell(&self, row: &[String]) -> Result<CompareCell, DbError> {
        check_row_size(row.len(), self.rank() + 2)?;
        let run_id = parse_i32(&row[0], "run_id")?;
        let dim_ids = parse_dim_ids(&self.dims, &self.dim_names, &row[1..=self.rank()])?;
        let value = self.value.parse_id(&row[self.rank() + 1])?;
        Ok(CompareCell {
            run_id,
            dim_ids,
            value,
        })
    }

    pub fn code_row_to_cell(&self, row: &[String]) -> Result<CompareCell, DbError> {
        check_row_size(row.len(), self.rank() + 2)?;
        let digest = row[0].trim();
        let run_id = *self
            .run_by_digest
            .get(digest)
            .ok_or_else(|| DbError::UnknownRun(digest.to_string()))?;
        let dim_ids = codes_to_ids(&self.dims, &row[1..=self.rank()])?;
        let value = self.value.parse_code(&row[self.rank() + 1])?;
        Ok(CompareCell {
            run_id,
            dim_ids,
            value,
        })
    }

    pub fn to_code_cell(&self, cell: &CompareCell) -> Result<CompareCellCode, DbError> {
        check_cell_rank(cell.dim_ids.len(), self.rank(), &self.name)?;
        let run_digest = self
            .digest_by_run
            .get(&cell.run_id)
            .cloned()
            .ok_or_else(|| DbError::UnknownRun(cell.run_id.to_string()))?;
        Ok(CompareCellCode {
            run_digest,
            dims: ids_to_codes(&self.dims, &cell.dim_ids)?,
            value: self.value.format_code(&cell.value)?,
        })
    }
}

/// Converter for entity microdata cells: entity key then one column per
/// attribute.
#[derive(Debug, Clone)]
pub struct MicroConverter {
    name: String,
    key_name: String,
    attr_names: Vec<String>,
    attrs: Vec<ValueCodec>,
}

impl MicroConverter {
    pub fn new(entity: &EntityMeta, fmt: FloatFmt) -> Result<Self, DbError> {
        let attrs = entity
            .attrs
            .iter()
            .map(|attr| ValueCodec::new(&attr.name, &attr.type_def, fmt))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: entity.name.clone(),
            key_name: entity.key_name.clone(),
            attr_names: entity.attrs.iter().map(|attr| attr.name.clone()).collect(),
            attrs,
        })
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.csv", self.name)
    }

    #[must_use]
    pub fn attr_count(&self) -> usize {
        self.attrs.len()
    }

    #[must_use]
    pub fn header(&self) -> Vec<String> {
        let mut header = Vec::with_capacity(self.attr_count() + 1);
        header.push(self.key_name.clone());
        header.extend(self.attr_names.iter().cloned());
        header
    }

    fn check_cell(&self, cell: &MicroCell) -> Result<(), DbError> {
        if cell.attrs.len() == self.attr_count() {
            Ok(())
        } else {
            Err(DbError::InvalidArgument(format!(
                "cell has {} attributes, entity {} expects {}",
                cell.attrs.len(),
                self.name,
                self.attr_count()
            )))
        }
    }

    pub fn to_row(&self, cell: &MicroCell) -> Result<Vec<String>, DbError> {
        self.check_cell(cell)?;
        let mut row = Vec::with_capacity(self.attr_count() + 1);
        row.push(cell.key.to_string());
        for (codec, value) in self.attrs.iter().zip(&cell.attrs) {
            row.push(codec.format_id(value)?);
        }
        Ok(row)
    }

    pub fn to_code_row(&self, cell: &MicroCell) -> Result<Vec<String>, DbError> {
        let code = self.to_code_cell(cell)?;
        let mut row = Vec::with_capacity(self.attr_count() + 1);
        row.push(code.key.to_string());
        row.extend(code.attrs);
        Ok(row)
    }

    pub fn row_to_cell(&self, row: &[String]) -> Result<MicroCell, DbError> {
        check_row_size(row.len(), self.attr_count() + 1)?;
        let key = parse_i64(&row[0], &self.key_name)?;
        let attrs = self
            .attrs
            .iter()
            .zip(&row[1..])
            .map(|(codec, field)| codec.parse_id(field))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(MicroCell { key, attrs })
    }

    pub fn code_row_to_cell(&self, row: &[String]) -> Result<MicroCell, DbError> {
        check_row_size(row.len(), self.attr_count() + 1)?;
        let key = parse_i64(&row[0], &self.key_name)?;
        let attrs = self
            .attrs
            .iter()
            .zip(&row[1..])
            .map(|(codec, field)| codec.parse_code(field))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(MicroCell { key, attrs })
    }

    pub fn to_code_cell(&self, cell: &MicroCell) -> Result<MicroCellCode, DbError> {
        self.check_cell(cell)?;
        let attrs = self
            .attrs
            .iter()
            .zip(&cell.attrs)
            .map(|(codec, value)| codec.format_code(value))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(MicroCellCode {
            key: cell.key,
            attrs,
        })
    }
}

// --- csv surface ------------------------------------------------------------

fn csv_quote(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[must_use]
pub fn join_csv(fields: &[String]) -> String {
    fields
        .iter()
        .map(|field| csv_quote(field))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn split_csv(line: &str) -> Result<Vec<String>, DbError> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            if ch == '"' {
                if chars.peek() == Some(&'"') {
                    let _ = chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(ch);
            }
        } else {
            match ch {
                '"' => in_quotes = true,
                ',' => fields.push(std::mem::take(&mut current)),
                _ => current.push(ch),
            }
        }
    }

    if in_quotes {
        return Err(DbError::InvalidArgument(format!(
            "unterminated quote in csv line: {line}"
        )));
    }

    fields.push(current);
    Ok(fields)
}

/// Writes a header row and cell rows, returns the number of data rows.
pub fn write_csv<W: Write>(
    writer: &mut W,
    header: &[String],
    rows: impl IntoIterator<Item = Result<Vec<String>, DbError>>,
) -> Result<usize, DbError> {
    writeln!(writer, "{}", join_csv(header))?;
    let mut count = 0;
    for row in rows {
        writeln!(writer, "{}", join_csv(&row?))?;
        count += 1;
    }
    Ok(count)
}

/// Reads a header row and data rows; blank lines are skipped.
pub fn read_csv<R: BufRead>(reader: R) -> Result<(Vec<String>, Vec<Vec<String>>), DbError> {
    let mut lines = reader.lines();
    let header = match lines.next() {
        Some(line) => split_csv(&line?)?,
        None => return Err(DbError::InvalidArgument("empty csv input".to_string())),
    };

    let mut rows = Vec::new();
    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        rows.push(split_csv(&line)?);
    }
    Ok((header, rows))
}

// --- digest engine ----------------------------------------------------------

/// Digest of one table's output values: a header line naming the table and
/// its definition digest, then accumulators, then expressions, each as an
/// id-based CSV section. Line order is significant; callers must supply
/// cells in their canonical (ascending id and dimension) order.
pub fn digest_output_values(
    table: &TableMeta,
    sub_count: i32,
    accs: &[AccCell],
    exprs: &[ExprCell],
    fmt: FloatFmt,
) -> Result<String, DbError> {
    let mut hasher = Sha256::new();
    hasher.update(format!("{},{}\n", table.name, table.def_digest).as_bytes());

    let acc_cvt = AccConverter::new(table, sub_count, fmt)?;
    hasher.update(acc_cvt.header().join(",").as_bytes());
    hasher.update(b"\n");
    for cell in accs {
        hasher.update(acc_cvt.to_row(cell)?.join(",").as_bytes());
        hasher.update(b"\n");
    }

    let expr_cvt = ExprConverter::new(table, fmt)?;
    hasher.update(expr_cvt.header().join(",").as_bytes());
    hasher.update(b"\n");
    for cell in exprs {
        hasher.update(expr_cvt.to_row(cell)?.join(",").as_bytes());
        hasher.update(b"\n");
    }

    Ok(hex::encode(hasher.finalize()))
}

// --- paged cursor selector --------------------------------------------------

/// Page request and page result of an ordered row selection.
///
/// `size <= 0` selects everything from `offset` to the end of the cursor.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReadPageLayout {
    pub offset: i64,
    pub size: i64,
    pub is_last_page: bool,
}

/// Applies a page window to an ordered cursor of decoded rows and returns
/// the page plus the layout actually achieved.
///
/// Forward mode scans one row past a filled page to learn whether more
/// rows remain. Last-page mode keeps a sliding window of at most `size`
/// rows, so memory stays bounded by the page size, and afterwards trims
/// leading rows while the achieved offset is below the requested one (the
/// cursor may have shrunk between two paged reads). Row decode errors
/// propagate unchanged; no partial page is returned.
pub fn select_page<T, E>(
    rows: impl Iterator<Item = Result<T, E>>,
    layout: ReadPageLayout,
) -> Result<(Vec<T>, ReadPageLayout), E> {
    let offset = layout.offset.max(0);
    let size = layout.size;

    if layout.is_last_page && size > 0 {
        let mut window: VecDeque<T> = VecDeque::new();
        let mut window_len: i64 = 0;
        let mut scanned: i64 = 0;

        for row in rows {
            let row = row?;
            scanned += 1;
            window.push_back(row);
            window_len += 1;
            if window_len > size {
                let _ = window.pop_front();
                window_len -= 1;
            }
        }

        let mut actual_offset = scanned - window_len;
        while actual_offset < offset && window_len > 1 {
            let _ = window.pop_front();
            window_len -= 1;
            actual_offset += 1;
        }

        let page: Vec<T> = window.into_iter().collect();
        return Ok((
            page,
            ReadPageLayout {
                offset: actual_offset,
                size: window_len,
                is_last_page: true,
            },
        ));
    }

    let mut page: Vec<T> = Vec::new();
    let mut kept: i64 = 0;
    let mut scanned: i64 = 0;
    let mut is_last = true;

    for row in rows {
        let row = row?;
        scanned += 1;
        if scanned <= offset {
            continue;
        }
        if size > 0 && kept >= size {
            // one row past the page: more rows remain after it
            is_last = false;
            break;
        }
        page.push(row);
        kept += 1;
    }

    let mut actual_offset = scanned - kept;
    if !is_last && actual_offset > 0 {
        actual_offset -= 1;
    }

    Ok((
        page,
        ReadPageLayout {
            offset: actual_offset,
            size: kept,
            is_last_page: is_last,
        },
    ))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp, clippy::too_many_lines)]

    use super::*;
    use proptest::prelude::*;

    fn must<T>(result: Result<T, DbError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
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

    fn fixture_param() -> ParamMeta {
        ParamMeta {
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
        }
    }

    fn fixture_table() -> TableMeta {
        TableMeta {
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
        }
    }

    fn fixture_accs() -> Vec<AccCell> {
        vec![
            AccCell {
                acc_id: 0,
                sub_id: 0,
                dim_ids: vec![10],
                value: CellValue::Float(1.5),
            },
            AccCell {
                acc_id: 0,
                sub_id: 0,
                dim_ids: vec![20],
                value: CellValue::Float(2.5),
            },
            AccCell {
                acc_id: 1,
                sub_id: 0,
                dim_ids: vec![10],
                value: CellValue::Null,
            },
        ]
    }

    fn fixture_exprs() -> Vec<ExprCell> {
        vec![
            ExprCell {
                expr_id: 0,
                dim_ids: vec![10],
                value: CellValue::Float(4.0),
            },
            ExprCell {
                expr_id: 0,
                dim_ids: vec![900],
                value: CellValue::Float(8.0),
            },
        ]
    }

    #[test]
    fn enum_codec_round_trips_every_item() {
        let codec = must(ItemCodec::new("region", &region_type(), false));
        for (enum_id, code) in [(10, "north"), (20, "south"), (30, "east")] {
            assert_eq!(must(codec.id_to_code(enum_id)), code);
            assert_eq!(must(codec.code_to_id(code)), enum_id);
        }
    }

    #[test]
    fn total_item_requires_opt_in() {
        let with_total = must(ItemCodec::new("region", &region_type(), true));
        assert_eq!(must(with_total.id_to_code(900)), TOTAL_CODE);
        assert_eq!(must(with_total.code_to_id(TOTAL_CODE)), 900);

        let without_total = must(ItemCodec::new("region", &region_type(), false));
        assert!(matches!(
            without_total.id_to_code(900),
            Err(DbError::InvalidValue { .. })
        ));
        assert!(matches!(
            without_total.code_to_id(TOTAL_CODE),
            Err(DbError::InvalidValue { .. })
        ));
    }

    #[test]
    fn unknown_enum_values_name_the_dimension() {
        let codec = must(ItemCodec::new("region", &region_type(), false));
        match codec.code_to_id("west") {
            Err(DbError::InvalidValue { value, context }) => {
                assert_eq!(value, "west");
                assert_eq!(context, "region");
            }
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn bool_codec_maps_negative_one_to_true() {
        let codec = must(ItemCodec::new(
            "is_active",
            &TypeDef::Builtin(TypeKind::Bool),
            false,
        ));
        assert_eq!(must(codec.id_to_code(0)), "false");
        assert_eq!(must(codec.id_to_code(1)), "true");
        assert_eq!(must(codec.id_to_code(-1)), "true");
        assert!(codec.id_to_code(2).is_err());
        assert_eq!(must(codec.code_to_id("true")), 1);
        assert_eq!(must(codec.code_to_id("false")), 0);
        assert!(codec.code_to_id("yes").is_err());
    }

    #[test]
    fn int_codec_is_decimal_passthrough() {
        let codec = must(ItemCodec::new(
            "age_group",
            &TypeDef::Builtin(TypeKind::Int),
            false,
        ));
        assert_eq!(must(codec.id_to_code(-42)), "-42");
        assert_eq!(must(codec.code_to_id("17")), 17);
        assert!(codec.code_to_id("seventeen").is_err());
    }

    #[test]
    fn float_descriptor_fails_codec_construction() {
        let result = ItemCodec::new("weight", &TypeDef::Builtin(TypeKind::Float), false);
        assert!(matches!(result, Err(DbError::InvalidArgument(_))));
    }

    #[test]
    fn param_row_round_trip_preserves_ids_and_value() {
        let cvt = must(ParamConverter::new(&fixture_param(), FloatFmt::default()));
        let cell = ParamCell {
            sub_id: 1,
            dim_ids: vec![20, 35],
            value: CellValue::Float(0.125),
        };

        let row = must(cvt.to_row(&cell));
        assert_eq!(row, vec!["1", "20", "35", "0.125"]);
        assert_eq!(must(cvt.row_to_cell(&row)), cell);
    }

    #[test]
    fn param_code_row_round_trip() {
        let cvt = must(ParamConverter::new(&fixture_param(), FloatFmt::default()));
        let cell = ParamCell {
            sub_id: 0,
            dim_ids: vec![10, 7],
            value: CellValue::Float(3.5),
        };

        let row = must(cvt.to_code_row(&cell));
        assert_eq!(row, vec!["0", "north", "7", "3.5"]);
        assert_eq!(must(cvt.code_row_to_cell(&row)), cell);
    }

    #[test]
    fn wrong_field_count_is_rejected_regardless_of_content() {
        let cvt = must(ParamConverter::new(&fixture_param(), FloatFmt::default()));
        let short: Vec<String> = vec!["0".to_string(), "10".to_string()];
        assert!(matches!(
            cvt.row_to_cell(&short),
            Err(DbError::InvalidRowSize {
                expected: 4,
                actual: 2
            })
        ));

        let long: Vec<String> = ["0", "10", "1", "2.0", "extra"]
            .iter()
            .map(ToString::to_string)
            .collect();
        assert!(matches!(
            cvt.row_to_cell(&long),
            Err(DbError::InvalidRowSize {
                expected: 4,
                actual: 5
            })
        ));
    }

    #[test]
    fn null_serializes_to_token_and_parses_back_to_null() {
        let cvt = must(ParamConverter::new(&fixture_param(), FloatFmt::default()));
        let cell = ParamCell {
            sub_id: 0,
            dim_ids: vec![10, 1],
            value: CellValue::Null,
        };

        let row = must(cvt.to_row(&cell));
        assert_eq!(row[3], NULL_TOKEN);

        let parsed = must(cvt.row_to_cell(&row));
        assert!(parsed.value.is_null());

        let mut empty = row.clone();
        empty[3] = String::new();
        assert!(must(cvt.row_to_cell(&empty)).value.is_null());
    }

    #[test]
    fn sub_id_out_of_range_is_invalid_argument() {
        let cvt = must(ParamConverter::new(&fixture_param(), FloatFmt::default()));
        let cell = ParamCell {
            sub_id: 2,
            dim_ids: vec![10, 1],
            value: CellValue::Float(1.0),
        };
        assert!(matches!(
            cvt.to_row(&cell),
            Err(DbError::InvalidArgument(_))
        ));
    }

    #[test]
    fn enum_valued_parameter_round_trips_codes() {
        let mut param = fixture_param();
        param.value_type = region_type();
        let cvt = must(ParamConverter::new(&param, FloatFmt::default()));
        let cell = ParamCell {
            sub_id: 0,
            dim_ids: vec![10, 1],
            value: CellValue::Int(30),
        };

        let code_row = must(cvt.to_code_row(&cell));
        assert_eq!(code_row[3], "east");
        assert_eq!(must(cvt.code_row_to_cell(&code_row)), cell);
    }

    #[test]
    fn expr_converter_accepts_total_item_in_code_rows() {
        let cvt = must(ExprConverter::new(&fixture_table(), FloatFmt::default()));
        let cell = ExprCell {
            expr_id: 0,
            dim_ids: vec![900],
            value: CellValue::Float(8.0),
        };

        let code_row = must(cvt.to_code_row(&cell));
        assert_eq!(code_row[1], TOTAL_CODE);
        assert_eq!(must(cvt.code_row_to_cell(&code_row)), cell);
    }

    #[test]
    fn acc_row_round_trip_and_size_check() {
        let cvt = must(AccConverter::new(&fixture_table(), 4, FloatFmt::default()));
        let cell = AccCell {
            acc_id: 1,
            sub_id: 3,
            dim_ids: vec![20],
            value: CellValue::Float(12.5),
        };

        let row = must(cvt.to_row(&cell));
        assert_eq!(row.len(), 4);
        assert_eq!(must(cvt.row_to_cell(&row)), cell);

        let short: Vec<String> = vec!["1".to_string(), "3".to_string(), "20".to_string()];
        assert!(matches!(
            cvt.row_to_cell(&short),
            Err(DbError::InvalidRowSize { .. })
        ));
    }

    #[test]
    fn compare_converter_maps_runs_to_digests_both_ways() {
        let mut digests = BTreeMap::new();
        digests.insert(101, "digest-a".to_string());
        digests.insert(102, "digest-b".to_string());
        let cvt = must(CompareConverter::new(
            &fixture_table(),
            &digests,
            FloatFmt::default(),
        ));

        let cell = CompareCell {
            run_id: 102,
            dim_ids: vec![10],
            value: CellValue::Float(1.0),
        };

        let code = must(cvt.to_code_cell(&cell));
        assert_eq!(code.run_digest, "digest-b");

        let code_row = must(cvt.to_code_row(&cell));
        assert_eq!(must(cvt.code_row_to_cell(&code_row)), cell);

        let unknown = CompareCell {
            run_id: 999,
            dim_ids: vec![10],
            value: CellValue::Float(1.0),
        };
        assert!(matches!(
            cvt.to_code_cell(&unknown),
            Err(DbError::UnknownRun(_))
        ));
    }

    #[test]
    fn micro_converter_round_trips_mixed_attributes() {
        let entity = EntityMeta {
            entity_id: 1,
            name: "person".to_string(),
            key_name: "person_key".to_string(),
            attrs: vec![
                AttrMeta {
                    attr_id: 0,
                    name: "region".to_string(),
                    type_def: region_type(),
                },
                AttrMeta {
                    attr_id: 1,
                    name: "income".to_string(),
                    type_def: TypeDef::Builtin(TypeKind::Float),
                },
                AttrMeta {
                    attr_id: 2,
                    name: "note".to_string(),
                    type_def: TypeDef::Builtin(TypeKind::Str),
                },
            ],
        };
        let cvt = must(MicroConverter::new(&entity, FloatFmt::default()));
        let cell = MicroCell {
            key: 778899,
            attrs: vec![
                CellValue::Int(20),
                CellValue::Null,
                CellValue::Str("checked".to_string()),
            ],
        };

        let row = must(cvt.to_row(&cell));
        assert_eq!(row, vec!["778899", "20", "null", "checked"]);
        assert_eq!(must(cvt.row_to_cell(&row)), cell);

        let code_row = must(cvt.to_code_row(&cell));
        assert_eq!(code_row[1], "south");
    }

    #[test]
    fn csv_round_trips_quoted_fields() {
        let header = vec!["person_key".to_string(), "note".to_string()];
        let rows = vec![
            Ok(vec!["1".to_string(), "plain".to_string()]),
            Ok(vec!["2".to_string(), "a,b \"c\"".to_string()]),
        ];

        let mut buffer = Vec::new();
        let written = must(write_csv(&mut buffer, &header, rows));
        assert_eq!(written, 2);

        let (parsed_header, parsed_rows) = must(read_csv(buffer.as_slice()));
        assert_eq!(parsed_header, header);
        assert_eq!(parsed_rows[1][1], "a,b \"c\"");
    }

    #[test]
    fn float_format_is_shared_by_rows_and_digest() {
        let fmt = FloatFmt {
            precision: Some(4),
        };
        let table = fixture_table();

        let mut accs_a = fixture_accs();
        let mut accs_b = fixture_accs();
        accs_a[0].value = CellValue::Float(1.500_004);
        accs_b[0].value = CellValue::Float(1.500_004_9);

        let cvt = must(AccConverter::new(&table, 4, fmt));
        assert_eq!(must(cvt.to_row(&accs_a[0]))[3], "1.5000");
        assert_eq!(must(cvt.to_row(&accs_b[0]))[3], "1.5000");

        let digest_a = must(digest_output_values(&table, 4, &accs_a, &fixture_exprs(), fmt));
        let digest_b = must(digest_output_values(&table, 4, &accs_b, &fixture_exprs(), fmt));
        assert_eq!(digest_a, digest_b);
    }

    #[test]
    fn digest_is_deterministic_and_order_sensitive() {
        let table = fixture_table();
        let fmt = FloatFmt::default();

        let first = must(digest_output_values(
            &table,
            4,
            &fixture_accs(),
            &fixture_exprs(),
            fmt,
        ));
        let second = must(digest_output_values(
            &table,
            4,
            &fixture_accs(),
            &fixture_exprs(),
            fmt,
        ));
        assert_eq!(first, second);

        let mut reordered = fixture_accs();
        reordered.swap(0, 1);
        let third = must(digest_output_values(
            &table,
            4,
            &reordered,
            &fixture_exprs(),
            fmt,
        ));
        assert_ne!(first, third);
    }

    fn ok_rows(count: i64) -> impl Iterator<Item = Result<i64, DbError>> {
        (0..count).map(Ok)
    }

    fn page_of(
        count: i64,
        offset: i64,
        size: i64,
        is_last_page: bool,
    ) -> (Vec<i64>, ReadPageLayout) {
        match select_page(
            ok_rows(count),
            ReadPageLayout {
                offset,
                size,
                is_last_page,
            },
        ) {
            Ok(result) => result,
            Err(err) => panic!("paging failed: {err}"),
        }
    }

    #[test]
    fn forward_page_in_the_middle_of_the_cursor() {
        let (rows, layout) = page_of(10, 2, 3, false);
        assert_eq!(rows, vec![2, 3, 4]);
        assert_eq!(layout.offset, 2);
        assert_eq!(layout.size, 3);
        assert!(!layout.is_last_page);
    }

    #[test]
    fn forward_page_reaching_the_end_is_last() {
        let (rows, layout) = page_of(10, 7, 5, false);
        assert_eq!(rows, vec![7, 8, 9]);
        assert_eq!(layout.offset, 7);
        assert_eq!(layout.size, 3);
        assert!(layout.is_last_page);
    }

    #[test]
    fn forward_page_ending_exactly_at_the_last_row() {
        let (rows, layout) = page_of(10, 7, 3, false);
        assert_eq!(rows, vec![7, 8, 9]);
        assert!(layout.is_last_page);
    }

    #[test]
    fn unbounded_size_returns_everything_from_offset() {
        let (rows, layout) = page_of(6, 2, 0, false);
        assert_eq!(rows, vec![2, 3, 4, 5]);
        assert_eq!(layout.offset, 2);
        assert!(layout.is_last_page);

        let (rows, layout) = page_of(6, 2, 0, true);
        assert_eq!(rows, vec![2, 3, 4, 5]);
        assert!(layout.is_last_page);
    }

    #[test]
    fn last_page_returns_the_trailing_rows() {
        let (rows, layout) = page_of(10, 0, 4, true);
        assert_eq!(rows, vec![6, 7, 8, 9]);
        assert_eq!(layout.offset, 6);
        assert_eq!(layout.size, 4);
        assert!(layout.is_last_page);
    }

    #[test]
    fn last_page_larger_than_cursor_returns_all_rows() {
        let (rows, layout) = page_of(3, 0, 10, true);
        assert_eq!(rows, vec![0, 1, 2]);
        assert_eq!(layout.offset, 0);
        assert_eq!(layout.size, 3);
    }

    #[test]
    fn last_page_trims_leading_rows_up_to_requested_offset() {
        // the caller assumed at least 12 rows, the cursor only has 10
        let (rows, layout) = page_of(10, 8, 4, true);
        assert_eq!(rows, vec![8, 9]);
        assert_eq!(layout.offset, 8);
        assert_eq!(layout.size, 2);
    }

    #[test]
    fn last_page_trim_keeps_at_least_one_row() {
        let (rows, layout) = page_of(5, 40, 3, true);
        assert_eq!(rows, vec![4]);
        assert_eq!(layout.size, 1);
    }

    #[test]
    fn offset_beyond_cursor_returns_empty_page() {
        let (rows, layout) = page_of(4, 9, 3, false);
        assert!(rows.is_empty());
        assert_eq!(layout.offset, 4);
        assert!(layout.is_last_page);
    }

    #[test]
    fn decode_errors_propagate_without_partial_page() {
        let rows = (0..5).map(|value| {
            if value == 3 {
                Err(DbError::InvalidValue {
                    value: "bad".to_string(),
                    context: "region".to_string(),
                })
            } else {
                Ok(value)
            }
        });

        let result = select_page(
            rows,
            ReadPageLayout {
                offset: 0,
                size: 10,
                is_last_page: false,
            },
        );
        assert!(result.is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn prop_forward_paging_matches_slice_window(
            count in 0i64..40,
            offset in 0i64..45,
            size in 1i64..15,
        ) {
            let (rows, layout) = page_of(count, offset, size, false);
            let start = offset.min(count);
            let end = (offset + size).min(count);
            let expected: Vec<i64> = (start..end).collect();

            prop_assert_eq!(&rows, &expected);
            prop_assert_eq!(layout.size, expected.len() as i64);
            prop_assert_eq!(layout.is_last_page, end == count);
            if !rows.is_empty() {
                prop_assert_eq!(layout.offset, start);
            }
        }

        #[test]
        fn prop_last_page_returns_final_rows(
            count in 0i64..40,
            size in 1i64..15,
        ) {
            let (rows, layout) = page_of(count, 0, size, true);
            let expected: Vec<i64> = ((count - size).max(0)..count).collect();

            prop_assert_eq!(&rows, &expected);
            prop_assert_eq!(layout.offset, (count - size).max(0));
            prop_assert!(layout.is_last_page);
        }
    }

    #[test]
    fn run_status_round_trips_and_flags_completion() {
        for status in [
            RunStatus::InProgress,
            RunStatus::Success,
            RunStatus::Exit,
            RunStatus::Error,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert!(!RunStatus::InProgress.is_completed());
        assert!(RunStatus::Success.is_completed());
        assert!(RunStatus::Exit.is_completed());
        assert!(RunStatus::Error.is_completed());
        assert_eq!(RunStatus::parse("running"), None);
    }
}
