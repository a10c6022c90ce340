use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::Target;
use crate::limits::MAX_SCAN_DAYS;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSettings {
        row: SettingsRow,
    },
    SelectSettings,
    InsertPolicy {
        policy: ReputationPolicy,
    },
    InsertService {
        service: Service,
    },
    DeleteService {
        id: Ulid,
    },
    SelectServices,
    SelectAvailability {
        day: NaiveDate,
        service_ids: Vec<Ulid>,
        alternatives: bool,
    },
    SelectSuggestions {
        from_day: NaiveDate,
        service_ids: Vec<Ulid>,
        max_days: u32,
    },
    InsertAppointment {
        id: Ulid,
        customer_id: Ulid,
        car_id: Ulid,
        start: Ms,
        service_ids: Vec<Ulid>,
        notes: Option<String>,
    },
    SelectAppointment {
        id: Ulid,
    },
    SelectAppointmentsOn {
        day: NaiveDate,
    },
    DeleteAppointment {
        id: Ulid,
    },
    InsertTransition {
        appointment_id: Ulid,
        target: Target,
        expected_version: Option<u64>,
    },
    InsertReschedule {
        appointment_id: Ulid,
        start: Ms,
        service_ids: Option<Vec<Ulid>>,
        expected_version: Option<u64>,
    },
    SelectReputation {
        customer_id: Ulid,
    },
}

// Positional column order used when an INSERT names no columns.
const SETTINGS_COLUMNS: &[&str] = &[
    "opening_time",
    "closing_time",
    "slot_interval_minutes",
    "max_concurrent",
    "timezone",
    "lunch_start",
    "lunch_end",
];
const POLICY_COLUMNS: &[&str] = &[
    "enabled",
    "no_show_penalty_rating",
    "min_rating_for_no_advance",
    "advance_percent",
    "recover_on_show",
];
const SERVICE_COLUMNS: &[&str] = &[
    "id",
    "name",
    "duration_minutes",
    "price",
    "exclusivity_group",
    "active",
];
const APPOINTMENT_COLUMNS: &[&str] = &["id", "customer_id", "car_id", "start", "services", "notes"];
const TRANSITION_COLUMNS: &[&str] = &["appointment_id", "status", "suggested_start", "note", "version"];
const RESCHEDULE_COLUMNS: &[&str] = &["appointment_id", "start", "services", "version"];

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

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let columns: Vec<String> = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .collect();
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "settings" => {
            let row = InsertRow::new(SETTINGS_COLUMNS, &columns, &values)?;
            Ok(Command::InsertSettings {
                row: SettingsRow {
                    opening_time: parse_time(row.required("opening_time")?)?,
                    closing_time: parse_time(row.required("closing_time")?)?,
                    slot_interval_minutes: parse_u32(row.required("slot_interval_minutes")?)?,
                    max_concurrent: parse_u32(row.required("max_concurrent")?)?,
                    timezone: parse_string(row.required("timezone")?)?,
                    lunch_start: row
                        .optional("lunch_start")
                        .map(parse_time)
                        .transpose()?
                        .unwrap_or_else(default_lunch_start),
                    lunch_end: row
                        .optional("lunch_end")
                        .map(parse_time)
                        .transpose()?
                        .unwrap_or_else(default_lunch_end),
                },
            })
        }
        "reputation_policy" => {
            let row = InsertRow::new(POLICY_COLUMNS, &columns, &values)?;
            let defaults = ReputationPolicy::default();
            Ok(Command::InsertPolicy {
                policy: ReputationPolicy {
                    enabled: row
                        .optional("enabled")
                        .map(parse_bool)
                        .transpose()?
                        .unwrap_or(defaults.enabled),
                    no_show_penalty_rating: row
                        .optional("no_show_penalty_rating")
                        .map(parse_rating)
                        .transpose()?
                        .unwrap_or(defaults.no_show_penalty_rating),
                    min_rating_for_no_advance: row
                        .optional("min_rating_for_no_advance")
                        .map(parse_rating)
                        .transpose()?
                        .unwrap_or(defaults.min_rating_for_no_advance),
                    advance_percent: row
                        .optional("advance_percent")
                        .map(parse_u8)
                        .transpose()?
                        .unwrap_or(defaults.advance_percent),
                    recover_on_show: row
                        .optional("recover_on_show")
                        .map(parse_bool)
                        .transpose()?
                        .unwrap_or(defaults.recover_on_show),
                },
            })
        }
        "services" => {
            let row = InsertRow::new(SERVICE_COLUMNS, &columns, &values)?;
            Ok(Command::InsertService {
                service: Service {
                    id: parse_ulid(row.required("id")?)?,
                    name: parse_string(row.required("name")?)?,
                    duration_minutes: parse_u32(row.required("duration_minutes")?)?,
                    price: parse_i64(row.required("price")?)?,
                    exclusivity_group: row
                        .optional("exclusivity_group")
                        .map(parse_string)
                        .transpose()?,
                    active: row
                        .optional("active")
                        .map(parse_bool)
                        .transpose()?
                        .unwrap_or(true),
                },
            })
        }
        "appointments" => {
            let row = InsertRow::new(APPOINTMENT_COLUMNS, &columns, &values)?;
            Ok(Command::InsertAppointment {
                id: parse_ulid(row.required("id")?)?,
                customer_id: parse_ulid(row.required("customer_id")?)?,
                car_id: parse_ulid(row.required("car_id")?)?,
                start: parse_i64(row.required("start")?)?,
                service_ids: parse_ulid_list(row.required("services")?)?,
                notes: row.optional("notes").map(parse_string).transpose()?,
            })
        }
        "transitions" => {
            let row = InsertRow::new(TRANSITION_COLUMNS, &columns, &values)?;
            let status = parse_string(row.required("status")?)?;
            let kind = StatusKind::parse(&status)
                .ok_or_else(|| SqlError::Parse(format!("unknown status: {status}")))?;
            let note = row
                .optional("note")
                .map(parse_string)
                .transpose()?
                .unwrap_or_default();
            let target = match kind {
                StatusKind::ConfirmedByClient => Target::ConfirmedByClient,
                StatusKind::Confirmed => Target::Confirmed,
                StatusKind::Rescheduled => Target::Rescheduled {
                    suggested_start: parse_i64(
                        row.optional("suggested_start")
                            .ok_or(SqlError::MissingColumn("suggested_start"))?,
                    )?,
                    business_notes: note,
                },
                StatusKind::InProgress => Target::InProgress,
                StatusKind::Completed => Target::Completed,
                StatusKind::Canceled => Target::Canceled { reason: note },
                StatusKind::NoShow => Target::NoShow,
                StatusKind::Pending => {
                    return Err(SqlError::Parse("pending is not a transition target".into()));
                }
            };
            Ok(Command::InsertTransition {
                appointment_id: parse_ulid(row.required("appointment_id")?)?,
                target,
                expected_version: row.optional("version").map(parse_u64).transpose()?,
            })
        }
        "reschedules" => {
            let row = InsertRow::new(RESCHEDULE_COLUMNS, &columns, &values)?;
            Ok(Command::InsertReschedule {
                appointment_id: parse_ulid(row.required("appointment_id")?)?,
                start: parse_i64(row.required("start")?)?,
                service_ids: row.optional("services").map(parse_ulid_list).transpose()?,
                expected_version: row.optional("version").map(parse_u64).transpose()?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(delete.selection.as_ref())?;
    let id = parse_ulid(filter(&filters, "id")?)?;

    match table.as_str() {
        "appointments" => Ok(Command::DeleteAppointment { id }),
        "services" => Ok(Command::DeleteService { id }),
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
    let filters = where_filters(select.selection.as_ref())?;

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            day: parse_date(filter(&filters, "day")?)?,
            service_ids: parse_ulid_list(filter(&filters, "services")?)?,
            alternatives: optional_filter(&filters, "alternatives")
                .map(parse_bool)
                .transpose()?
                .unwrap_or(false),
        }),
        "suggestions" => Ok(Command::SelectSuggestions {
            from_day: parse_date(filter(&filters, "day")?)?,
            service_ids: parse_ulid_list(filter(&filters, "services")?)?,
            max_days: optional_filter(&filters, "max_days")
                .map(parse_u32)
                .transpose()?
                .unwrap_or(MAX_SCAN_DAYS),
        }),
        "appointments" => {
            if let Some(id) = optional_filter(&filters, "id") {
                Ok(Command::SelectAppointment { id: parse_ulid(id)? })
            } else if let Some(day) = optional_filter(&filters, "day") {
                Ok(Command::SelectAppointmentsOn { day: parse_date(day)? })
            } else {
                Err(SqlError::MissingFilter("id or day"))
            }
        }
        "reputation" => Ok(Command::SelectReputation {
            customer_id: parse_ulid(filter(&filters, "customer_id")?)?,
        }),
        "settings" => Ok(Command::SelectSettings),
        "services" => Ok(Command::SelectServices),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Row & filter access ───────────────────────────────────────

/// One VALUES row addressed by column name, either through the INSERT's
/// column list or by the table's positional order.
struct InsertRow<'a> {
    order: &'static [&'static str],
    columns: &'a [String],
    values: &'a [Expr],
}

impl<'a> InsertRow<'a> {
    fn new(
        order: &'static [&'static str],
        columns: &'a [String],
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        if !columns.is_empty() && columns.len() != values.len() {
            return Err(SqlError::Parse(format!(
                "{} columns but {} values",
                columns.len(),
                values.len()
            )));
        }
        if let Some(unknown) = columns.iter().find(|c| !order.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(unknown.clone()));
        }
        Ok(Self { order, columns, values })
    }

    /// The value for `name`, with SQL NULL treated as absent.
    fn optional(&self, name: &str) -> Option<&'a Expr> {
        let idx = if self.columns.is_empty() {
            self.order.iter().position(|c| *c == name)?
        } else {
            self.columns.iter().position(|c| c == name)?
        };
        self.values.get(idx).filter(|e| !is_null(e))
    }

    fn required(&self, name: &'static str) -> Result<&'a Expr, SqlError> {
        self.optional(name).ok_or(SqlError::MissingColumn(name))
    }
}

/// `col = value` pairs from a WHERE clause joined by AND.
fn where_filters(selection: Option<&Expr>) -> Result<Vec<(String, Expr)>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_filters(expr, &mut out)?;
    }
    Ok(out)
}

fn collect_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_filters(left, out)?;
                collect_filters(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                out.push((col, right.as_ref().clone()));
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("operator {op}"))),
        },
        Expr::Nested(inner) => collect_filters(inner, out),
        _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
    }
}

fn optional_filter<'a>(filters: &'a [(String, Expr)], name: &str) -> Option<&'a Expr> {
    filters.iter().find(|(c, _)| c == name).map(|(_, e)| e)
}

fn filter<'a>(filters: &'a [(String, Expr)], name: &'static str) -> Result<&'a Expr, SqlError> {
    optional_filter(filters, name).ok_or(SqlError::MissingFilter(name))
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

/// Text of a literal: quoted strings verbatim, numbers as written.
fn literal_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected literal, got {value}"))),
        None => match expr {
            Expr::UnaryOp {
                op: ast::UnaryOperator::Minus,
                expr,
            } => Ok(format!("-{}", literal_text(expr)?)),
            _ => Err(SqlError::Parse(format!("expected value, got {expr}"))),
        },
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        _ => Err(SqlError::Parse(format!("expected string, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal_text(expr)?;
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

/// Comma-separated ULIDs, e.g. `'01H...,01H...'`.
fn parse_ulid_list(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    let s = parse_string(expr)?;
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            Ulid::from_string(part).map_err(|e| SqlError::Parse(format!("bad ULID {part:?}: {e}")))
        })
        .collect()
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    let s = literal_text(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} must not be negative")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u8 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// Local wall-clock time, `HH:MM` or `HH:MM:SS`.
fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    NaiveTime::parse_from_str(&s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

/// Calendar date, `YYYY-MM-DD`.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

/// Rating on the 0.0..=5.0 scale.
fn parse_rating(expr: &Expr) -> Result<Rating, SqlError> {
    let s = literal_text(expr)?;
    s.trim()
        .parse::<f64>()
        .ok()
        .and_then(Rating::from_f64)
        .ok_or_else(|| SqlError::Parse(format!("bad rating {s:?}: expected 0.0 to 5.0")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("missing value for column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
