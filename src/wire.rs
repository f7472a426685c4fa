use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SlotbookAuthSource;
use crate::model::*;
use crate::observability::{self, command_label};
use crate::service::{Scheduler, SchedulingError};
use crate::sql::{self, Command, SqlError};

pub struct SlotbookHandler {
    scheduler: Arc<Scheduler>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, sql: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(cmd, format).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result.map_err(scheduling_err)
    }

    async fn execute_command(&self, cmd: Command, format: &Format) -> Result<Response, SchedulingError> {
        let s = &self.scheduler;
        match cmd {
            Command::SelectSlots { date } => {
                let slots = s.available_slots(&date).await?;
                let schema = Arc::new(slots_schema(format));
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.time.to_string())?;
                        encoder.encode_field(&slot.status.as_str())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectCapacity { date } => {
                let cap = s.daily_capacity(&date).await?;
                let schema = Arc::new(capacity_schema(format));
                let row = encode_capacity(&schema, &cap);
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(vec![row]))))
            }
            Command::InsertReservation { request, returning_id } => {
                let reservation = s.create_reservation(request).await?;
                if !returning_id {
                    return Ok(Response::Execution(Tag::new("INSERT").with_rows(1)));
                }
                let schema = Arc::new(returning_id_schema(format));
                let row = encode_id(&schema, reservation.id);
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(vec![row]))))
            }
            Command::SelectReservations { date, status } => {
                let reservations = s.list_reservations(date.as_deref(), status.as_deref()).await?;
                let schema = Arc::new(reservations_schema(format));
                let rows: Vec<PgWireResult<_>> = reservations
                    .iter()
                    .map(|r| encode_reservation(&schema, r))
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::CancelReservation { id } => {
                s.cancel_reservation(id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::UpdateStatus { id, status } => {
                s.update_status(id, &status).await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectStats => {
                let stats = s.stats().await;
                let schema = Arc::new(stats_schema(format));
                let row = encode_stats(&schema, &stats);
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(vec![row]))))
            }
        }
    }
}

fn encode_capacity(schema: &Arc<Vec<FieldInfo>>, cap: &DayCapacity) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&cap.date.to_string())?;
    encoder.encode_field(&(cap.current as i32))?;
    encoder.encode_field(&(cap.capacity as i32))?;
    encoder.encode_field(&cap.is_full)?;
    Ok(encoder.take_row())
}

fn encode_id(schema: &Arc<Vec<FieldInfo>>, id: ReservationId) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&id.to_string())?;
    Ok(encoder.take_row())
}

fn encode_stats(schema: &Arc<Vec<FieldInfo>>, stats: &Stats) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&(stats.today as i64))?;
    encoder.encode_field(&(stats.total as i64))?;
    encoder.encode_field(&(stats.active as i64))?;
    encoder.encode_field(&(stats.cancelled as i64))?;
    encoder.encode_field(&(stats.completed as i64))?;
    encoder.encode_field(&stats.top_service)?;
    Ok(encoder.take_row())
}

fn encode_reservation(schema: &Arc<Vec<FieldInfo>>, r: &Reservation) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.name)?;
    encoder.encode_field(&r.phone)?;
    encoder.encode_field(&r.service)?;
    encoder.encode_field(&r.date.to_string())?;
    encoder.encode_field(&r.time.to_string())?;
    encoder.encode_field(&r.status.as_str())?;
    encoder.encode_field(&r.created_at.format("%Y-%m-%d %H:%M:%S").to_string())?;
    Ok(encoder.take_row())
}

// ── Result schemas ───────────────────────────────────────────────

fn fields(columns: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(i)))
        .collect()
}

fn slots_schema(format: &Format) -> Vec<FieldInfo> {
    fields(&[("slot", Type::VARCHAR), ("status", Type::VARCHAR)], format)
}

fn capacity_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("date", Type::VARCHAR),
            ("current", Type::INT4),
            ("capacity", Type::INT4),
            ("is_full", Type::BOOL),
        ],
        format,
    )
}

fn reservations_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("phone", Type::VARCHAR),
            ("service", Type::VARCHAR),
            ("date", Type::VARCHAR),
            ("time", Type::VARCHAR),
            ("status", Type::VARCHAR),
            ("created_at", Type::VARCHAR),
        ],
        format,
    )
}

fn stats_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("today", Type::INT8),
            ("total", Type::INT8),
            ("active", Type::INT8),
            ("cancelled", Type::INT8),
            ("completed", Type::INT8),
            ("top_service", Type::VARCHAR),
        ],
        format,
    )
}

fn returning_id_schema(format: &Format) -> Vec<FieldInfo> {
    fields(&[("id", Type::VARCHAR)], format)
}

/// Row description for a statement that has not been executed yet. Works on
/// raw text so unbound `$n` placeholders don't matter.
fn statement_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    if normalized.starts_with("SELECT") {
        let from = |table: &str| {
            let needle = format!("FROM {table}");
            normalized
                .find(&needle)
                .map(|i| &normalized[i + needle.len()..])
                .is_some_and(|rest| rest.is_empty() || rest.starts_with([' ', ';']))
        };
        if from("SLOTS") {
            return slots_schema(format);
        }
        if from("CAPACITY") {
            return capacity_schema(format);
        }
        if from("RESERVATIONS") {
            return reservations_schema(format);
        }
        if from("STATS") {
            return stats_schema(format);
        }
    } else if normalized.starts_with("INSERT") && normalized.contains("RETURNING") {
        return returning_id_schema(format);
    }
    vec![]
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

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
        self.run(&sql, &portal.result_column_format).await
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
            statement_schema(&target.statement, &Format::UnifiedText),
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
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// Byte ranges and 1-based indexes of every `$N` placeholder outside quoted
/// literals and identifiers.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote inside a literal closes and reopens it, which
            // leaves the state unchanged.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i;
                let mut end = i + 1;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if let Ok(n) = sql[start + 1..end].parse::<usize>()
                    && n > 0
                {
                    found.push((start..end, n));
                }
                i = end;
                continue;
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Replace each placeholder with its bound value as a quoted literal, in one
/// pass over the statement text so bound values are never rescanned.
fn bind_params(sql: &str, params: &[Option<String>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for (range, n) in placeholders(sql) {
        out.push_str(&sql[last..range.start]);
        match params.get(n - 1) {
            Some(Some(text)) => {
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&sql[range.clone()]),
        }
        last = range.end;
    }
    out.push_str(&sql[last..]);
    out
}

/// Bind the portal's text-format parameters into its statement.
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    bind_params(&portal.statement.statement, &params)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(scheduler: Arc<Scheduler>, user: String, password: String) -> Self {
        let auth_source = SlotbookAuthSource::new(user, password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotbookHandler::new(scheduler)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
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
    scheduler: Arc<Scheduler>,
    user: String,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = SlotbookFactory::new(scheduler, user, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

/// SQLSTATE for each scheduling error kind.
pub fn sqlstate(e: &SchedulingError) -> &'static str {
    match e {
        SchedulingError::Validation { .. } => "22023",
        SchedulingError::PastDate(_) => "22008",
        SchedulingError::OutOfHours { .. } => "22023",
        SchedulingError::SlotElapsed { .. } => "22008",
        SchedulingError::CapacityExceeded { .. } => "53400",
        SchedulingError::SlotConflict { .. } => "23505",
        SchedulingError::NotFound(_) => "P0002",
        SchedulingError::InvalidStatus(_) => "22P02",
        SchedulingError::Storage(_) => "58030",
    }
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(_) => "42703",
        SqlError::Unsupported(_) | SqlError::ReadOnlyColumn(_) => "0A000",
        SqlError::InvalidId(_) => "22P02",
        SqlError::Parse(_) | SqlError::Empty | SqlError::WrongArity(..) | SqlError::MissingFilter(_) => "42601",
    }
}

fn scheduling_err(e: SchedulingError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sql_sqlstate(&e).into(),
        e.to_string(),
    )))
}
