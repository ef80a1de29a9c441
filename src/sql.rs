use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// One booking request; every VALUES row is one line.
    SubmitBooking {
        id: Option<Ulid>,
        request: BookingRequest,
    },
    PreviewPrice {
        line: LineRequest,
    },
    SelectSubmission {
        id: Ulid,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectHistory {
        user_id: Option<String>,
        status: Option<BookingStatus>,
        room_id: Option<Ulid>,
        page: usize,
        page_size: usize,
    },
    SelectSchedule {
        room_id: Ulid,
        start: Ms,
        end: Ms,
    },
    UpdateStatus {
        booking_id: Ulid,
        status: BookingStatus,
    },
    CancelBooking {
        id: Ulid,
    },
}

/// Column order assumed by `INSERT INTO booking_requests VALUES (...)` without a column list.
const BOOKING_REQUEST_COLUMNS: [&str; 11] = [
    "id",
    "user_id",
    "name",
    "phone",
    "company",
    "notes",
    "room_id",
    "snack_id",
    "start_time",
    "end_time",
    "participants",
];

const STATUS_UPDATE_COLUMNS: [&str; 2] = ["booking_id", "status"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Rows a statement produces, known without binding its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// Command tag only.
    Execution,
    Submission,
    PricePreview,
    BookingLines,
    History,
    Schedule,
}

/// Classify a statement by target table. Placeholders such as `$1` are fine.
pub fn describe(sql: &str) -> Result<ResultShape, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => match insert_table_name(insert)?.as_str() {
            "booking_requests" => Ok(ResultShape::Submission),
            "status_updates" => Ok(ResultShape::Execution),
            other => Err(SqlError::UnknownTable(other.to_string())),
        },
        Statement::Delete(_) => Ok(ResultShape::Execution),
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return Err(SqlError::Unsupported("non-SELECT query".into()));
            };
            let Some(from) = select.from.first() else {
                return Err(SqlError::Parse("SELECT without FROM".into()));
            };
            match table_factor_name(&from.relation)?.as_str() {
                "price_preview" => Ok(ResultShape::PricePreview),
                "submissions" => Ok(ResultShape::Submission),
                "schedule" => Ok(ResultShape::Schedule),
                "bookings" => {
                    let preds = predicates(&select.selection)?;
                    if find_pred(&preds, "id", CmpOp::Eq).is_some() {
                        Ok(ResultShape::BookingLines)
                    } else {
                        Ok(ResultShape::History)
                    }
                }
                other => Err(SqlError::UnknownTable(other.to_string())),
            }
        }
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let columns = insert_column_names(insert);
    let rows = extract_all_insert_rows(insert)?;

    match table.as_str() {
        "booking_requests" => parse_booking_request(&columns, &rows),
        "status_updates" => {
            if rows.len() != 1 {
                return Err(SqlError::Parse("status_updates takes exactly one row".into()));
            }
            let row = Row::new("status_updates", &columns, &STATUS_UPDATE_COLUMNS, &rows[0])?;
            Ok(Command::UpdateStatus {
                booking_id: parse_ulid_expr(row.required("booking_id")?)?,
                status: parse_status_expr(row.required("status")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_booking_request(columns: &[String], rows: &[Vec<Expr>]) -> Result<Command, SqlError> {
    let mut header: Option<(Option<Ulid>, BookingRequest)> = None;
    let mut lines = Vec::with_capacity(rows.len());

    for (i, values) in rows.iter().enumerate() {
        let at_row = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
        let row = Row::new("booking_requests", columns, &BOOKING_REQUEST_COLUMNS, values)?;

        let id = row.optional("id").map(parse_ulid_or_null).transpose().map_err(at_row)?.flatten();
        let request = BookingRequest {
            user_id: parse_string_expr(row.required("user_id")?).map_err(at_row)?,
            name: parse_string_expr(row.required("name")?).map_err(at_row)?,
            phone: row.optional("phone").map(parse_string_expr).transpose().map_err(at_row)?.unwrap_or_default(),
            company: row.optional("company").map(parse_string_expr).transpose().map_err(at_row)?.unwrap_or_default(),
            notes: row.optional("notes").map(parse_text_or_null).transpose().map_err(at_row)?.flatten(),
            lines: Vec::new(),
        };
        if let Some((first_id, first)) = &header {
            if *first_id != id
                || first.user_id != request.user_id
                || first.name != request.name
                || first.phone != request.phone
                || first.company != request.company
                || first.notes != request.notes
            {
                return Err(SqlError::Parse(format!(
                    "row {i}: booking columns differ from the first row"
                )));
            }
        } else {
            header = Some((id, request));
        }

        lines.push(LineRequest {
            room_id: parse_ulid_expr(row.required("room_id")?).map_err(at_row)?,
            snack_id: row.optional("snack_id").map(parse_ulid_or_null).transpose().map_err(at_row)?.flatten(),
            start: parse_time_expr(row.required("start_time")?).map_err(at_row)?,
            end: parse_time_expr(row.required("end_time")?).map_err(at_row)?,
            participants: parse_u32(row.required("participants")?).map_err(at_row)?,
        });
    }

    let (id, mut request) = header.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
    request.lines = lines;
    Ok(Command::SubmitBooking { id, request })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let preds = predicates(&delete.selection)?;

    match table.as_str() {
        "bookings" => Ok(Command::CancelBooking {
            id: parse_ulid_expr(require_eq(&preds, "id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let preds = predicates(&select.selection)?;

    match table.as_str() {
        "price_preview" => Ok(Command::PreviewPrice {
            line: LineRequest {
                room_id: parse_ulid_expr(require_eq(&preds, "room_id")?)?,
                snack_id: find_pred(&preds, "snack_id", CmpOp::Eq)
                    .map(parse_ulid_or_null)
                    .transpose()?
                    .flatten(),
                start: parse_time_expr(require_eq(&preds, "start_time")?)?,
                end: parse_time_expr(require_eq(&preds, "end_time")?)?,
                participants: parse_u32(require_eq(&preds, "participants")?)?,
            },
        }),
        "submissions" => Ok(Command::SelectSubmission {
            id: parse_ulid_expr(require_eq(&preds, "id")?)?,
        }),
        "bookings" => {
            if let Some(id) = find_pred(&preds, "id", CmpOp::Eq) {
                return Ok(Command::SelectBooking {
                    id: parse_ulid_expr(id)?,
                });
            }
            Ok(Command::SelectHistory {
                user_id: find_pred(&preds, "user_id", CmpOp::Eq)
                    .map(parse_string_expr)
                    .transpose()?,
                status: find_pred(&preds, "status", CmpOp::Eq)
                    .map(parse_status_expr)
                    .transpose()?,
                room_id: find_pred(&preds, "room_id", CmpOp::Eq)
                    .map(parse_ulid_expr)
                    .transpose()?,
                page: find_pred(&preds, "page", CmpOp::Eq)
                    .map(parse_usize)
                    .transpose()?
                    .unwrap_or(1),
                page_size: find_pred(&preds, "page_size", CmpOp::Eq)
                    .map(parse_usize)
                    .transpose()?
                    .unwrap_or(0),
            })
        }
        "schedule" => Ok(Command::SelectSchedule {
            room_id: parse_ulid_expr(require_eq(&preds, "room_id")?)?,
            start: parse_time_expr(
                find_pred(&preds, "start", CmpOp::GtEq).ok_or(SqlError::MissingFilter("start"))?,
            )?,
            end: parse_time_expr(
                find_pred(&preds, "end", CmpOp::LtEq).ok_or(SqlError::MissingFilter("end"))?,
            )?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE predicates ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    GtEq,
    LtEq,
}

#[derive(Debug)]
struct Predicate<'a> {
    column: String,
    op: CmpOp,
    value: &'a Expr,
}

/// Flatten a conjunction of `column <op> value` comparisons.
fn predicates(selection: &Option<Expr>) -> Result<Vec<Predicate<'_>>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_predicates(expr, &mut out)?;
    }
    Ok(out)
}

fn collect_predicates<'a>(expr: &'a Expr, out: &mut Vec<Predicate<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    collect_predicates(left, out)?;
                    return collect_predicates(right, out);
                }
                ast::BinaryOperator::Eq => CmpOp::Eq,
                ast::BinaryOperator::GtEq => CmpOp::GtEq,
                ast::BinaryOperator::LtEq => CmpOp::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("comparison {expr}")))?;
            out.push(Predicate {
                column,
                op,
                value: right,
            });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn find_pred<'a>(preds: &[Predicate<'a>], column: &str, op: CmpOp) -> Option<&'a Expr> {
    preds
        .iter()
        .find(|p| p.column == column && p.op == op)
        .map(|p| p.value)
}

fn require_eq<'a>(preds: &[Predicate<'a>], column: &'static str) -> Result<&'a Expr, SqlError> {
    find_pred(preds, column, CmpOp::Eq).ok_or(SqlError::MissingFilter(column))
}

// ── INSERT rows ───────────────────────────────────────────────

/// One VALUES row with its values addressed by column name.
struct Row<'a> {
    columns: Vec<&'a str>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        columns: &'a [String],
        default_columns: &'static [&'static str],
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let columns: Vec<&str> = if columns.is_empty() {
            default_columns.to_vec()
        } else {
            columns.iter().map(String::as_str).collect()
        };
        if columns.len() != values.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        if let Some(unknown) = columns
            .iter()
            .find(|c| !default_columns.iter().any(|d| d == *c))
        {
            return Err(SqlError::Parse(format!("{table}: unknown column {unknown}")));
        }
        Ok(Self { columns, values })
    }

    fn optional(&self, column: &str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| *c == column)
            .map(|i| &self.values[i])
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.optional(column).ok_or(SqlError::MissingColumn(column))
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn insert_column_names(insert: &ast::Insert) -> Vec<String> {
    insert
        .columns
        .iter()
        .map(|c| c.to_string().trim_matches('"').to_lowercase())
        .collect()
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) if s.is_empty() => Ok(None),
        _ => parse_ulid_expr(expr).map(Some),
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// NULL and the empty string both mean "not given".
fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(|s| (!s.is_empty()).then_some(s)),
    }
}

fn parse_status_expr(expr: &Expr) -> Result<BookingStatus, SqlError> {
    parse_string_expr(expr)?.parse().map_err(SqlError::Parse)
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

/// A timestamp is either Unix milliseconds or a `YYYY-MM-DD HH:MM:SS[.mmm] ±HHMM` string.
fn parse_time_expr(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => match s.trim().parse::<Ms>() {
            Ok(ms) => Ok(ms),
            Err(_) => parse_timestamp(s).map_err(SqlError::Parse),
        },
        _ => parse_i64_expr(expr),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_usize(expr: &Expr) -> Result<usize, SqlError> {
    let v = parse_i64_expr(expr)?;
    usize::try_from(v).map_err(|_| SqlError::Parse(format!("{v} is negative")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingColumn(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
