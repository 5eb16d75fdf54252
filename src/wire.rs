use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone};
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::BookdAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

pub struct BookdHandler {
    engine: Arc<Engine>,
    query_parser: Arc<BookdQueryParser>,
}

impl BookdHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(BookdQueryParser),
        }
    }

    async fn run(&self, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertAuthor(profile) => {
                engine.register_author(profile).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertInterviewType(interview_type) => {
                engine
                    .add_interview_type(interview_type)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertRule {
                id,
                author_id,
                day_of_week,
                start,
                end,
            } => {
                engine
                    .add_rule(id, author_id, day_of_week, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SetRuleActive { id, active } => {
                engine.set_rule_active(id, active).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::InsertOverride(entry) => {
                engine.add_override(entry).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectRules { author_id } => {
                let rules = engine.list_rules(author_id).await.map_err(engine_err)?;
                rows_response(rule_schema(), rules, |enc, r| {
                    enc.encode_field(&r.id.to_string())?;
                    enc.encode_field(&r.author_id.to_string())?;
                    enc.encode_field(&r.day_of_week.to_string())?;
                    enc.encode_field(&r.start_time_local.format("%H:%M").to_string())?;
                    enc.encode_field(&r.end_time_local.format("%H:%M").to_string())?;
                    enc.encode_field(&r.active.to_string())
                })
            }
            Command::SelectOverrides { author_id } => {
                let overrides = engine.list_overrides(author_id).await.map_err(engine_err)?;
                rows_response(override_schema(), overrides, |enc, o| {
                    enc.encode_field(&o.id.to_string())?;
                    enc.encode_field(&o.author_id.to_string())?;
                    enc.encode_field(&o.date_local.to_string())?;
                    enc.encode_field(&o.kind.as_str().to_string())?;
                    enc.encode_field(&o.start_time_local.map(|t| t.format("%H:%M").to_string()))?;
                    enc.encode_field(&o.end_time_local.map(|t| t.format("%H:%M").to_string()))?;
                    enc.encode_field(&o.note)
                })
            }
            Command::SelectAvailability { author_id, date } => {
                let windows = engine.raw_windows(author_id, date).await.map_err(engine_err)?;
                let author = author_id.to_string();
                let day = date.to_string();
                rows_response(availability_schema(), windows, |enc, w| {
                    enc.encode_field(&author)?;
                    enc.encode_field(&day)?;
                    enc.encode_field(&w.start.format("%H:%M").to_string())?;
                    enc.encode_field(&w.end.format("%H:%M").to_string())
                })
            }
            Command::SelectSlots(req) => {
                let slots = engine.list_slots(req).await.map_err(engine_err)?;
                rows_response(slot_schema(), slots, |enc, s| {
                    enc.encode_field(&ts(&s.start_utc))?;
                    enc.encode_field(&ts(&s.end_utc))?;
                    enc.encode_field(&ts(&s.start_local_author))?;
                    enc.encode_field(&ts(&s.end_local_author))?;
                    enc.encode_field(&ts(&s.start_local_caller))?;
                    enc.encode_field(&ts(&s.end_local_caller))
                })
            }
            Command::InsertAppointment(req) => {
                let appt = engine.create_appointment(req).await.map_err(engine_err)?;
                appointment_response(vec![appt])
            }
            Command::Reschedule { id, start_at, end_at } => {
                let appt = engine
                    .reschedule_appointment(id, start_at, end_at)
                    .await
                    .map_err(engine_err)?;
                appointment_response(vec![appt])
            }
            Command::Cancel { id, reason } => {
                let appt = engine.cancel_appointment(id, reason).await.map_err(engine_err)?;
                appointment_response(vec![appt])
            }
            Command::Confirm { id, actor } => {
                let appt = engine.confirm_appointment(id, actor).await.map_err(engine_err)?;
                appointment_response(vec![appt])
            }
            Command::AdminEdit { id, edit } => {
                let appt = engine
                    .admin_edit_appointment(id, edit)
                    .await
                    .map_err(engine_err)?;
                appointment_response(vec![appt])
            }
            Command::SelectAppointment { id, as_of: None } => {
                let appt = engine.get_appointment(id).await.map_err(engine_err)?;
                appointment_response(vec![appt])
            }
            Command::SelectAppointment { id, as_of: Some(at) } => {
                let appt = engine.appointment_as_of(id, at).await.map_err(engine_err)?;
                appointment_response(appt.into_iter().collect())
            }
            Command::SelectAppointments { author_id } => {
                let appts = engine.list_appointments(author_id).await.map_err(engine_err)?;
                appointment_response(appts)
            }
            Command::SelectAudit { appointment_id } => {
                let history = engine
                    .appointment_history(appointment_id)
                    .await
                    .map_err(engine_err)?;
                rows_response(audit_schema(), history, |enc, e| {
                    enc.encode_field(&e.id.to_string())?;
                    enc.encode_field(&e.appointment_id.to_string())?;
                    enc.encode_field(&e.action.as_str().to_string())?;
                    enc.encode_field(&e.actor)?;
                    enc.encode_field(&ts(&e.at))?;
                    enc.encode_field(&e.note)?;
                    enc.encode_field(&e.before.as_ref().map(to_json).transpose()?)?;
                    enc.encode_field(&to_json(&e.after)?)
                })
            }
            Command::RunReminders { secret } => {
                let due = engine
                    .run_reminder_job(secret.as_deref())
                    .await
                    .map_err(engine_err)?;
                rows_response(reminder_schema(), due, |enc, r| {
                    enc.encode_field(&r.lead.as_str().to_string())?;
                    enc.encode_field(&r.appointment.id.to_string())?;
                    enc.encode_field(&r.appointment.author_id.to_string())?;
                    enc.encode_field(&r.appointment.customer_email)?;
                    enc.encode_field(&ts(&r.appointment.start_at_utc))
                })
            }
        }
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn ts<Tz: TimeZone>(t: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn to_json(appt: &Appointment) -> PgWireResult<String> {
    serde_json::to_string(appt).map_err(|e| PgWireError::ApiError(Box::new(e)))
}

fn rows_response<T, F>(schema: Vec<FieldInfo>, items: Vec<T>, encode: F) -> PgWireResult<Response>
where
    F: Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
{
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn appointment_response(appts: Vec<Appointment>) -> PgWireResult<Response> {
    rows_response(appointment_schema(), appts, |enc, a| {
        enc.encode_field(&a.id.to_string())?;
        enc.encode_field(&a.author_id.to_string())?;
        enc.encode_field(&a.interview_type_id.to_string())?;
        enc.encode_field(&a.customer_email)?;
        enc.encode_field(&ts(&a.start_at_utc))?;
        enc.encode_field(&ts(&a.end_at_utc))?;
        enc.encode_field(&a.status.as_str().to_string())?;
        enc.encode_field(&a.customer_timezone)?;
        enc.encode_field(&a.author_timezone)?;
        enc.encode_field(&a.location)?;
        enc.encode_field(&a.meeting_link)
    })
}

/// Every column goes out as text, so the same schema serves both protocols.
fn text_fields(names: &[&str]) -> Vec<FieldInfo> {
    names
        .iter()
        .map(|name| FieldInfo::new((*name).into(), None, None, Type::VARCHAR, FieldFormat::Text))
        .collect()
}

fn rule_schema() -> Vec<FieldInfo> {
    text_fields(&["id", "author_id", "day_of_week", "start_time", "end_time", "active"])
}

fn override_schema() -> Vec<FieldInfo> {
    text_fields(&["id", "author_id", "date", "kind", "start_time", "end_time", "note"])
}

fn availability_schema() -> Vec<FieldInfo> {
    text_fields(&["author_id", "date", "start_time", "end_time"])
}

fn slot_schema() -> Vec<FieldInfo> {
    text_fields(&[
        "start_utc",
        "end_utc",
        "start_local_author",
        "end_local_author",
        "start_local_caller",
        "end_local_caller",
    ])
}

fn appointment_schema() -> Vec<FieldInfo> {
    text_fields(&[
        "id",
        "author_id",
        "interview_type_id",
        "customer_email",
        "start_at",
        "end_at",
        "status",
        "customer_timezone",
        "author_timezone",
        "location",
        "meeting_link",
    ])
}

fn audit_schema() -> Vec<FieldInfo> {
    text_fields(&["id", "appointment_id", "action", "actor", "at", "note", "before", "after"])
}

fn reminder_schema() -> Vec<FieldInfo> {
    text_fields(&["lead", "appointment_id", "author_id", "customer_email", "start_at"])
}

/// Row description for a statement that has not been executed yet.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .collect();
    let table_after = |keyword: &str| {
        words
            .iter()
            .position(|w| *w == keyword)
            .and_then(|i| words.get(i + 1))
            .copied()
    };
    let table = match words.first().copied() {
        Some("select") => table_after("from"),
        Some("insert") => table_after("into"),
        Some("update") => words.get(1).copied(),
        _ => None,
    };
    match (words.first().copied(), table) {
        (Some("select"), Some("availability_rules")) => rule_schema(),
        (Some("select"), Some("availability_overrides")) => override_schema(),
        (Some("select"), Some("availability")) => availability_schema(),
        (Some("select"), Some("slots")) => slot_schema(),
        (Some("select"), Some("appointment_audit")) => audit_schema(),
        (Some("select"), Some("reminders")) => reminder_schema(),
        (_, Some("appointments")) | (Some("update"), Some("admin_appointments")) => appointment_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for BookdHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let commands = sql::parse_batch(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            responses.push(self.run(cmd).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BookdQueryParser;

#[async_trait]
impl QueryParser for BookdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for BookdHandler {
    type Statement = String;
    type QueryParser = BookdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(cmd).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Split SQL into literal text and `$N` placeholders, skipping quoted
/// strings and identifiers.
fn scan_placeholders(sql: &str, mut on: impl FnMut(Piece<'_>)) {
    let bytes = sql.as_bytes();
    let mut i = 0;
    let mut text_start = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        // A doubled quote is an escaped quote, not the end.
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'$' => {
                let digits = i + 1;
                let mut j = digits;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    j += 1;
                }
                match sql[digits..j].parse::<usize>() {
                    Ok(n) if n > 0 => {
                        on(Piece::Text(&sql[text_start..i]));
                        on(Piece::Param(n));
                        text_start = j;
                    }
                    _ => {}
                }
                i = j.max(i + 1);
            }
            _ => i += 1,
        }
    }
    on(Piece::Text(&sql[text_start.min(sql.len())..]));
}

enum Piece<'a> {
    Text(&'a str),
    Param(usize),
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    scan_placeholders(sql, |piece| {
        if let Piece::Param(n) = piece {
            max = max.max(n);
        }
    });
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &params)
}

/// Single pass over the original text; bound values are never rescanned.
fn substitute(sql: &str, params: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    scan_placeholders(sql, |piece| match piece {
        Piece::Text(text) => result.push_str(text),
        Piece::Param(n) => match params.get(n - 1) {
            Some(Some(text)) => {
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            Some(None) => result.push_str("NULL"),
            None => {
                result.push('$');
                result.push_str(&n.to_string());
            }
        },
    });
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct BookdFactory {
    handler: Arc<BookdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<BookdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl BookdFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = BookdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(BookdHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BookdFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(BookdFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for an engine error.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound { .. } => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Conflict(_) => "40001",
        EngineError::PolicyViolation { .. } => "P0001",
        EngineError::Unauthorized => "28000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Storage(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if matches!(e, EngineError::Storage(_)) {
        tracing::error!("storage failure: {e}");
    }
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::TooLong => "54000",
        e if e.is_invalid_input() => "22023",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
