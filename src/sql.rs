use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{AdminEdit, BookingRequest, SlotRequest};
use crate::limits::MAX_SQL_LEN;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertAuthor(AuthorProfile),
    InsertInterviewType(InterviewType),
    InsertRule {
        id: Ulid,
        author_id: Ulid,
        day_of_week: u8,
        start: NaiveTime,
        end: NaiveTime,
    },
    SetRuleActive {
        id: Ulid,
        active: bool,
    },
    InsertOverride(AvailabilityOverride),
    SelectRules {
        author_id: Ulid,
    },
    SelectOverrides {
        author_id: Ulid,
    },
    SelectAvailability {
        author_id: Ulid,
        date: NaiveDate,
    },
    SelectSlots(SlotRequest),
    InsertAppointment(BookingRequest),
    Reschedule {
        id: Ulid,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    },
    Cancel {
        id: Ulid,
        reason: Option<String>,
    },
    Confirm {
        id: Ulid,
        actor: Option<String>,
    },
    AdminEdit {
        id: Ulid,
        edit: AdminEdit,
    },
    SelectAppointment {
        id: Ulid,
        as_of: Option<DateTime<Utc>>,
    },
    SelectAppointments {
        author_id: Ulid,
    },
    SelectAudit {
        appointment_id: Ulid,
    },
    RunReminders {
        secret: Option<String>,
    },
}

/// Column order assumed when an INSERT omits its column list.
const AUTHOR_COLUMNS: &[&str] = &[
    "id",
    "timezone",
    "slot_granularity_min",
    "max_bookings_per_day",
    "default_buffer_before_min",
    "default_buffer_after_min",
    "name",
    "email",
];
const INTERVIEW_TYPE_COLUMNS: &[&str] = &[
    "id",
    "author_id",
    "name",
    "duration_options",
    "buffer_before_min",
    "buffer_after_min",
    "min_notice_hours",
    "cancellation_policy_hours",
    "location_required",
];
const RULE_COLUMNS: &[&str] = &["id", "author_id", "day_of_week", "start_time", "end_time"];
const OVERRIDE_COLUMNS: &[&str] = &["id", "author_id", "date", "kind", "start_time", "end_time", "note"];
const APPOINTMENT_COLUMNS: &[&str] = &[
    "id",
    "author_id",
    "interview_type_id",
    "start_at",
    "end_at",
    "customer_timezone",
    "customer_email",
    "location",
];

const DEFAULT_GRANULARITY_MIN: u32 = 30;

/// Parse a single statement. Anything after the first is ignored.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    parse_batch(sql)?.into_iter().next().ok_or(SqlError::Empty)
}

/// Parse every `;`-separated statement of a simple query.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::TooLong);
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();

    match table.as_str() {
        "authors" => {
            let row = Row::new("authors", AUTHOR_COLUMNS, &columns, values)?;
            Ok(Command::InsertAuthor(AuthorProfile {
                id: row.ulid("id")?,
                name: row.opt_string("name")?,
                email: row.opt_string("email")?,
                timezone: row.opt_string("timezone")?.unwrap_or_else(|| "UTC".into()),
                slot_granularity_min: row.opt_u32("slot_granularity_min")?.unwrap_or(DEFAULT_GRANULARITY_MIN),
                max_bookings_per_day: row.opt_u32("max_bookings_per_day")?,
                default_buffer_before_min: row.opt_u32("default_buffer_before_min")?.unwrap_or(0),
                default_buffer_after_min: row.opt_u32("default_buffer_after_min")?.unwrap_or(0),
            }))
        }
        "interview_types" => {
            let row = Row::new("interview_types", INTERVIEW_TYPE_COLUMNS, &columns, values)?;
            Ok(Command::InsertInterviewType(InterviewType {
                id: row.ulid("id")?,
                author_id: row.ulid("author_id")?,
                name: row.opt_string("name")?.unwrap_or_default(),
                duration_options_min: row.durations("duration_options")?,
                buffer_before_min: row.opt_u32("buffer_before_min")?,
                buffer_after_min: row.opt_u32("buffer_after_min")?,
                min_notice_hours: row.opt_u32("min_notice_hours")?.unwrap_or(0),
                cancellation_policy_hours: row.opt_u32("cancellation_policy_hours")?.unwrap_or(0),
                location_required: row.opt_bool("location_required")?.unwrap_or(false),
            }))
        }
        "availability_rules" => {
            let row = Row::new("availability_rules", RULE_COLUMNS, &columns, values)?;
            let day = row.u32("day_of_week")?;
            Ok(Command::InsertRule {
                id: row.ulid("id")?,
                author_id: row.ulid("author_id")?,
                day_of_week: u8::try_from(day)
                    .map_err(|_| SqlError::InvalidValue(format!("day_of_week out of range: {day}")))?,
                start: row.time("start_time")?,
                end: row.time("end_time")?,
            })
        }
        "availability_overrides" => {
            let row = Row::new("availability_overrides", OVERRIDE_COLUMNS, &columns, values)?;
            let kind = match row.string("kind")?.to_lowercase().as_str() {
                "add" => OverrideKind::Add,
                "remove" => OverrideKind::Remove,
                other => return Err(SqlError::InvalidValue(format!("override kind must be add or remove, got {other}"))),
            };
            Ok(Command::InsertOverride(AvailabilityOverride {
                id: row.ulid("id")?,
                author_id: row.ulid("author_id")?,
                date_local: row.date("date")?,
                kind,
                start_time_local: row.opt_time("start_time")?,
                end_time_local: row.opt_time("end_time")?,
                note: row.opt_string("note")?,
            }))
        }
        "appointments" => {
            let row = Row::new("appointments", APPOINTMENT_COLUMNS, &columns, values)?;
            Ok(Command::InsertAppointment(BookingRequest {
                id: row.opt_ulid("id")?,
                author_id: row.opt_ulid("author_id")?,
                interview_type_id: row.opt_ulid("interview_type_id")?,
                start_at: row.opt_timestamp("start_at")?,
                end_at: row.opt_timestamp("end_at")?,
                customer_timezone: row.opt_string("customer_timezone")?,
                customer_email: row.opt_string("customer_email")?,
                location: row.opt_string("location")?,
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;

    let mut columns = Vec::with_capacity(assignments.len());
    let mut values = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            _ => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        columns.push(col);
        values.push(a.value.clone());
    }
    let row = Row::new(&table, &[], &columns, values)?;

    match table.as_str() {
        "availability_rules" => Ok(Command::SetRuleActive {
            id,
            active: row.bool("active")?,
        }),
        "appointments" => {
            if let Some(status) = row.opt_string("status")? {
                return match AppointmentStatus::parse(&status) {
                    Some(AppointmentStatus::Cancelled) => Ok(Command::Cancel {
                        id,
                        reason: row.opt_string("reason")?,
                    }),
                    Some(AppointmentStatus::Confirmed) => Ok(Command::Confirm {
                        id,
                        actor: row.opt_string("actor")?,
                    }),
                    _ => Err(SqlError::InvalidValue(format!(
                        "status can only be set to cancelled or confirmed here, got {status}"
                    ))),
                };
            }
            Ok(Command::Reschedule {
                id,
                start_at: row.timestamp("start_at")?,
                end_at: row.timestamp("end_at")?,
            })
        }
        "admin_appointments" => {
            let status = match row.opt_string("status")? {
                Some(s) => Some(
                    AppointmentStatus::parse(&s)
                        .ok_or_else(|| SqlError::InvalidValue(format!("unknown status: {s}")))?,
                ),
                None => None,
            };
            Ok(Command::AdminEdit {
                id,
                edit: AdminEdit {
                    start_at: row.opt_timestamp("start_at")?,
                    end_at: row.opt_timestamp("end_at")?,
                    status,
                    interview_type_id: row.opt_ulid("interview_type_id")?,
                    actor: row.opt_string("actor")?,
                    note: row.opt_string("note")?,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = HashMap::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let row = Row { table: table.clone(), cells: filters };

    match table.as_str() {
        "availability_rules" => Ok(Command::SelectRules {
            author_id: row.filter_ulid("author_id")?,
        }),
        "availability_overrides" => Ok(Command::SelectOverrides {
            author_id: row.filter_ulid("author_id")?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            author_id: row.filter_ulid("author_id")?,
            date: row
                .opt_date("date")?
                .ok_or(SqlError::MissingFilter("date"))?,
        }),
        "slots" => Ok(Command::SelectSlots(SlotRequest {
            author_id: row.opt_ulid("author_id")?,
            interview_type_id: row.opt_ulid("interview_type_id")?,
            duration_min: row.opt_u32("duration")?,
            from_date: row.opt_date("from_date")?,
            to_date: row.opt_date("to_date")?,
            caller_timezone: row.opt_string("timezone")?,
        })),
        "appointments" => {
            if let Some(id) = row.opt_ulid("id")? {
                Ok(Command::SelectAppointment {
                    id,
                    as_of: row.opt_timestamp("as_of")?,
                })
            } else {
                Ok(Command::SelectAppointments {
                    author_id: row.filter_ulid("author_id")?,
                })
            }
        }
        "appointment_audit" => Ok(Command::SelectAudit {
            appointment_id: row.filter_ulid("appointment_id")?,
        }),
        "reminders" => Ok(Command::RunReminders {
            secret: row.opt_string("job_secret")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Collect `column = value` pairs from an AND tree. Other predicates are ignored.
fn collect_eq_filters(expr: &Expr, out: &mut HashMap<String, Expr>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)?;
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left) {
                    out.insert(col, right.as_ref().clone());
                }
            }
            _ => {}
        },
        Expr::Nested(inner) => collect_eq_filters(inner, out)?,
        _ => {}
    }
    Ok(())
}

// ── Row access ────────────────────────────────────────────────

/// Named values of one INSERT row, SET list or WHERE clause.
struct Row {
    table: String,
    cells: HashMap<String, Expr>,
}

impl Row {
    fn new(table: &str, defaults: &[&str], columns: &[String], values: Vec<Expr>) -> Result<Self, SqlError> {
        let names: Vec<String> = if columns.is_empty() {
            defaults.iter().map(|c| c.to_string()).collect()
        } else {
            columns.to_vec()
        };
        if values.len() > names.len() {
            return Err(SqlError::WrongArity(table.to_string(), names.len(), values.len()));
        }
        Ok(Self {
            table: table.to_string(),
            cells: names.into_iter().zip(values).collect(),
        })
    }

    /// The cell's value, treating an explicit NULL as absent.
    fn value(&self, col: &str) -> Option<&Value> {
        match self.cells.get(col).and_then(extract_value) {
            Some(Value::Null) => None,
            other => other,
        }
    }

    fn text(&self, col: &str) -> Result<Option<String>, SqlError> {
        let Some(expr) = self.cells.get(col) else {
            return Ok(None);
        };
        match extract_value(expr) {
            Some(Value::Null) => Ok(None),
            Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
            Some(Value::Boolean(b)) => Ok(Some(b.to_string())),
            Some(other) => Err(SqlError::InvalidValue(format!("{col}: unexpected {other}"))),
            None => match expr {
                Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } => match extract_value(expr) {
                    Some(Value::Number(s, _)) => Ok(Some(format!("-{s}"))),
                    _ => Err(SqlError::InvalidValue(format!("{col}: expected a literal"))),
                },
                _ => Err(SqlError::InvalidValue(format!("{col}: expected a literal, got {expr}"))),
            },
        }
    }

    fn require<T>(&self, col: &'static str, v: Option<T>) -> Result<T, SqlError> {
        v.ok_or_else(|| SqlError::MissingColumn(self.table.clone(), col))
    }

    fn opt_string(&self, col: &str) -> Result<Option<String>, SqlError> {
        self.text(col)
    }

    fn string(&self, col: &'static str) -> Result<String, SqlError> {
        let v = self.text(col)?;
        self.require(col, v)
    }

    fn opt_ulid(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.text(col)?
            .map(|s| Ulid::from_string(&s).map_err(|e| SqlError::InvalidValue(format!("{col}: bad ULID: {e}"))))
            .transpose()
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        let v = self.opt_ulid(col)?;
        self.require(col, v)
    }

    /// Required WHERE filter.
    fn filter_ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        self.opt_ulid(col)?.ok_or(SqlError::MissingFilter(col))
    }

    fn opt_u32(&self, col: &str) -> Result<Option<u32>, SqlError> {
        self.text(col)?
            .map(|s| {
                s.trim()
                    .parse::<u32>()
                    .map_err(|_| SqlError::InvalidValue(format!("{col}: expected a non-negative integer, got {s}")))
            })
            .transpose()
    }

    fn u32(&self, col: &'static str) -> Result<u32, SqlError> {
        let v = self.opt_u32(col)?;
        self.require(col, v)
    }

    fn opt_bool(&self, col: &str) -> Result<Option<bool>, SqlError> {
        match self.value(col) {
            None => Ok(None),
            Some(Value::Boolean(b)) => Ok(Some(*b)),
            Some(Value::Number(n, _)) => Ok(Some(n != "0")),
            Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(Some(true)),
                "false" | "f" | "0" => Ok(Some(false)),
                _ => Err(SqlError::InvalidValue(format!("{col}: bad bool: {s}"))),
            },
            Some(other) => Err(SqlError::InvalidValue(format!("{col}: expected bool, got {other}"))),
        }
    }

    fn bool(&self, col: &'static str) -> Result<bool, SqlError> {
        let v = self.opt_bool(col)?;
        self.require(col, v)
    }

    fn opt_timestamp(&self, col: &str) -> Result<Option<DateTime<Utc>>, SqlError> {
        self.text(col)?.map(|s| parse_timestamp(col, &s)).transpose()
    }

    fn timestamp(&self, col: &'static str) -> Result<DateTime<Utc>, SqlError> {
        let v = self.opt_timestamp(col)?;
        self.require(col, v)
    }

    fn opt_date(&self, col: &str) -> Result<Option<NaiveDate>, SqlError> {
        self.text(col)?
            .map(|s| {
                NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                    .map_err(|e| SqlError::InvalidValue(format!("{col}: bad date {s}: {e}")))
            })
            .transpose()
    }

    fn date(&self, col: &'static str) -> Result<NaiveDate, SqlError> {
        let v = self.opt_date(col)?;
        self.require(col, v)
    }

    fn opt_time(&self, col: &str) -> Result<Option<NaiveTime>, SqlError> {
        self.text(col)?.map(|s| parse_time(col, &s)).transpose()
    }

    fn time(&self, col: &'static str) -> Result<NaiveTime, SqlError> {
        let v = self.opt_time(col)?;
        self.require(col, v)
    }

    /// `'30,60,90'` or a single number.
    fn durations(&self, col: &'static str) -> Result<Vec<u32>, SqlError> {
        let raw = self.string(col)?;
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<u32>()
                    .map_err(|_| SqlError::InvalidValue(format!("{col}: bad duration {s}")))
            })
            .collect()
    }
}

fn parse_timestamp(col: &str, s: &str) -> Result<DateTime<Utc>, SqlError> {
    let s = s.trim();
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%#z"))
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SqlError::InvalidValue(format!("{col}: bad timestamp {s}: {e}")))
}

fn parse_time(col: &str, s: &str) -> Result<NaiveTime, SqlError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|e| SqlError::InvalidValue(format!("{col}: bad time {s}: {e}")))
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ast::ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
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
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let mut filters = HashMap::new();
    if let Some(sel) = selection {
        collect_eq_filters(sel, &mut filters)?;
    }
    Row { table: String::new(), cells: filters }.filter_ulid("id")
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

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("query too long")]
    TooLong,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected at most {1} values, got {2}")]
    WrongArity(String, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(String, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl SqlError {
    /// Whether the statement was well formed but carried bad input.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            SqlError::MissingColumn(..) | SqlError::MissingFilter(_) | SqlError::InvalidValue(_)
        )
    }
}
