use std::collections::HashSet;
use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
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
use rust_decimal::Decimal;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::admission::{AdmitError, Quote};
use crate::auth::{caller_from_login, MeetbookAuthSource};
use crate::model::*;
use crate::observability;
use crate::pricing::duration_hours;
use crate::queue::{Outcome, SubmissionStatus};
use crate::service::BookingService;
use crate::sql::{self, Command, ResultShape, SqlError};

pub struct MeetbookHandler {
    service: Arc<BookingService>,
    admin_users: Arc<HashSet<String>>,
    query_parser: Arc<MeetbookQueryParser>,
}

impl MeetbookHandler {
    pub fn new(service: Arc<BookingService>, admin_users: Arc<HashSet<String>>) -> Self {
        Self {
            service,
            admin_users,
            query_parser: Arc::new(MeetbookQueryParser),
        }
    }

    fn resolve_caller<C: ClientInfo>(&self, client: &C) -> PgWireResult<Caller> {
        match client.metadata().get("user") {
            Some(user) if !user.is_empty() => Ok(caller_from_login(user, &self.admin_users)),
            _ => {
                metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                Err(user_error("28000", "no user name in startup message".into()))
            }
        }
    }

    async fn run(&self, caller: &Caller, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(caller, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, caller: &Caller, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::SubmitBooking { id, request } => {
                let id = self
                    .service
                    .submit(caller, id, request)
                    .await
                    .map_err(admit_err)?;
                query_response(
                    ResultShape::Submission,
                    vec![submission_row(id, &SubmissionStatus::Queued)],
                )
            }
            Command::PreviewPrice { line } => {
                let quote = self
                    .service
                    .preview(std::slice::from_ref(&line))
                    .await
                    .map_err(admit_err)?;
                query_response(ResultShape::PricePreview, preview_rows(&quote))
            }
            Command::SelectSubmission { id } => {
                let status = self.service.submission_status(id).map_err(admit_err)?;
                query_response(ResultShape::Submission, vec![submission_row(id, &status)])
            }
            Command::SelectBooking { id } => {
                let booking = self.service.booking(caller, id).map_err(admit_err)?;
                query_response(ResultShape::BookingLines, booking_line_rows(&booking))
            }
            Command::SelectHistory {
                user_id,
                status,
                room_id,
                page,
                page_size,
            } => {
                let page = self.service.history(
                    caller,
                    HistoryFilter {
                        user_id,
                        status,
                        room_id,
                        page,
                        page_size,
                    },
                );
                query_response(ResultShape::History, history_rows(&page))
            }
            Command::SelectSchedule { room_id, start, end } => {
                if start >= end {
                    return Err(user_error(
                        "22023",
                        "schedule window start must be before end".into(),
                    ));
                }
                let entries = self
                    .service
                    .schedule(room_id, Span::new(start, end))
                    .await
                    .map_err(admit_err)?;
                let rows = entries.iter().map(|e| schedule_row(room_id, e)).collect();
                query_response(ResultShape::Schedule, rows)
            }
            Command::UpdateStatus { booking_id, status } => {
                self.service
                    .update_status(caller, booking_id, status)
                    .await
                    .map_err(admit_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::CancelBooking { id } => {
                self.service.cancel(caller, id).await.map_err(admit_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
        }
    }
}

// ── Result rows ──────────────────────────────────────────────────

/// A cell in text format. Absent values are sent as empty strings.
enum Cell {
    Text(String),
    Int(i64),
}

impl From<String> for Cell {
    fn from(s: String) -> Self {
        Cell::Text(s)
    }
}

impl From<&str> for Cell {
    fn from(s: &str) -> Self {
        Cell::Text(s.to_string())
    }
}

impl From<i64> for Cell {
    fn from(n: i64) -> Self {
        Cell::Int(n)
    }
}

fn opt<T: ToString>(value: Option<T>) -> Cell {
    Cell::Text(value.map(|v| v.to_string()).unwrap_or_default())
}

/// Decimals without trailing fractional zeros.
fn amount(value: Decimal) -> Cell {
    Cell::Text(value.normalize().to_string())
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

pub fn result_schema(shape: ResultShape) -> Vec<FieldInfo> {
    match shape {
        ResultShape::Execution => vec![],
        ResultShape::Submission => vec![
            text_field("id"),
            text_field("status"),
            text_field("booking_id"),
            text_field("room_id"),
            text_field("reason"),
            int_field("attempts"),
        ],
        ResultShape::PricePreview => vec![
            text_field("room_id"),
            text_field("room_name"),
            text_field("snack_id"),
            text_field("snack_name"),
            text_field("start_time"),
            text_field("end_time"),
            int_field("participants"),
            text_field("duration_hours"),
            text_field("subtotal_room"),
            text_field("subtotal_snack"),
            text_field("line_total"),
            text_field("total"),
        ],
        ResultShape::BookingLines => vec![
            text_field("booking_id"),
            text_field("user_id"),
            text_field("name"),
            text_field("phone"),
            text_field("company"),
            text_field("notes"),
            text_field("status"),
            text_field("total"),
            text_field("created_at"),
            text_field("updated_at"),
            text_field("line_id"),
            text_field("room_id"),
            text_field("snack_id"),
            text_field("start_time"),
            text_field("end_time"),
            int_field("participants"),
            text_field("price_room_perhour"),
            text_field("price_snack_perpack"),
            text_field("subtotal_room"),
            text_field("subtotal_snack"),
        ],
        ResultShape::History => vec![
            text_field("booking_id"),
            text_field("user_id"),
            text_field("name"),
            text_field("status"),
            text_field("total"),
            int_field("lines"),
            text_field("created_at"),
            text_field("updated_at"),
            int_field("page"),
            int_field("page_size"),
            int_field("total_bookings"),
            int_field("total_pages"),
        ],
        ResultShape::Schedule => vec![
            text_field("room_id"),
            text_field("booking_id"),
            text_field("line_id"),
            text_field("status"),
            int_field("start"),
            int_field("end"),
            text_field("start_time"),
            text_field("end_time"),
        ],
    }
}

fn query_response(shape: ResultShape, rows: Vec<Vec<Cell>>) -> PgWireResult<Response> {
    let schema = Arc::new(result_schema(shape));
    let encoded: Vec<PgWireResult<_>> = rows
        .into_iter()
        .map(|row| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            for cell in row {
                match cell {
                    Cell::Text(s) => encoder.encode_field(&s)?,
                    Cell::Int(n) => encoder.encode_field(&n)?,
                }
            }
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(encoded),
    )))
}

fn submission_row(id: Ulid, status: &SubmissionStatus) -> Vec<Cell> {
    let (booking_id, room_id, reason, attempts) = match status {
        SubmissionStatus::Queued => (None, None, None, 0),
        SubmissionStatus::Settled(outcome) => match outcome {
            Outcome::Committed { booking_id } => (Some(*booking_id), None, None, 0),
            Outcome::Rejected { reason } => (None, None, Some(reason.clone()), 0),
            Outcome::SlotUnavailable { room_id } => (None, Some(*room_id), None, 0),
            Outcome::DeadLettered { reason, attempts } => {
                (None, None, Some(reason.clone()), i64::from(*attempts))
            }
        },
    };
    vec![
        id.to_string().into(),
        status.label().into(),
        opt(booking_id),
        opt(room_id),
        opt(reason),
        attempts.into(),
    ]
}

fn preview_rows(quote: &Quote) -> Vec<Vec<Cell>> {
    quote
        .lines
        .iter()
        .map(|line| {
            vec![
                line.room.id.to_string().into(),
                line.room.name.as_str().into(),
                opt(line.snack.as_ref().map(|s| s.id)),
                opt(line.snack.as_ref().map(|s| s.name.clone())),
                format_timestamp(line.span.start).into(),
                format_timestamp(line.span.end).into(),
                i64::from(line.participants).into(),
                amount(duration_hours(&line.span)),
                amount(line.price.subtotal_room),
                amount(line.price.subtotal_snack),
                amount(line.price.total),
                amount(quote.total),
            ]
        })
        .collect()
}

fn booking_line_rows(booking: &Booking) -> Vec<Vec<Cell>> {
    let h = &booking.header;
    booking
        .lines
        .iter()
        .map(|line| {
            vec![
                h.id.to_string().into(),
                h.user_id.as_str().into(),
                h.name.as_str().into(),
                h.phone.as_str().into(),
                h.company.as_str().into(),
                opt(h.notes.as_deref()),
                h.status.as_str().into(),
                amount(h.total),
                format_timestamp(h.created_at).into(),
                format_timestamp(h.updated_at).into(),
                line.id.to_string().into(),
                line.room_id.to_string().into(),
                opt(line.snack_id),
                format_timestamp(line.span.start).into(),
                format_timestamp(line.span.end).into(),
                i64::from(line.participants).into(),
                amount(line.price_room_perhour),
                amount(line.price_snack_perpack),
                amount(line.subtotal_room),
                amount(line.subtotal_snack),
            ]
        })
        .collect()
}

fn history_rows(page: &Page<Booking>) -> Vec<Vec<Cell>> {
    let total_pages = page.total_pages() as i64;
    page.items
        .iter()
        .map(|booking| {
            let h = &booking.header;
            vec![
                h.id.to_string().into(),
                h.user_id.as_str().into(),
                h.name.as_str().into(),
                h.status.as_str().into(),
                amount(h.total),
                (booking.lines.len() as i64).into(),
                format_timestamp(h.created_at).into(),
                format_timestamp(h.updated_at).into(),
                (page.page as i64).into(),
                (page.page_size as i64).into(),
                (page.total as i64).into(),
                total_pages.into(),
            ]
        })
        .collect()
}

fn schedule_row(room_id: Ulid, entry: &ScheduleEntry) -> Vec<Cell> {
    vec![
        room_id.to_string().into(),
        entry.booking_id.to_string().into(),
        entry.line_id.to_string().into(),
        entry.status.as_str().into(),
        entry.start.into(),
        entry.end.into(),
        format_timestamp(entry.start).into(),
        format_timestamp(entry.end).into(),
    ]
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for MeetbookHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let caller = self.resolve_caller(client)?;
        Ok(vec![self.run(&caller, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct MeetbookQueryParser;

#[async_trait]
impl QueryParser for MeetbookQueryParser {
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
        Ok(describe_schema(stmt))
    }
}

/// Schema for a not-yet-bound statement. Unparseable statements describe as
/// no rows; executing them reports the parse error.
fn describe_schema(sql: &str) -> Vec<FieldInfo> {
    sql::describe(sql)
        .map(result_schema)
        .unwrap_or_default()
}

#[async_trait]
impl ExtendedQueryHandler for MeetbookHandler {
    type Statement = String;
    type QueryParser = MeetbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let caller = self.resolve_caller(client)?;
        let sql = substitute_params(portal);
        self.run(&caller, &sql).await
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
            describe_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(describe_schema(
            &target.statement.statement,
        )))
    }
}

/// Byte ranges of the `$N` placeholders outside quoted literals, with their N.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i;
                i += 1;
                let digits = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[digits..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql)
        .into_iter()
        .map(|(_, n)| n)
        .max()
        .unwrap_or(0)
}

/// Replace `$1`, `$2`, ... with the bound text-format parameters as quoted literals.
fn substitute_params(portal: &Portal<String>) -> String {
    let values: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute_placeholders(&portal.statement.statement, &values)
}

fn substitute_placeholders(sql: &str, values: &[Option<String>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        out.push_str(&sql[copied..range.start]);
        match n.checked_sub(1).and_then(|i| values.get(i)) {
            Some(Some(text)) => {
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            // Unbound; left for the parser to reject.
            None => out.push_str(&sql[range.clone()]),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct MeetbookFactory {
    handler: Arc<MeetbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<MeetbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl MeetbookFactory {
    pub fn new(
        service: Arc<BookingService>,
        password: String,
        admin_users: Arc<HashSet<String>>,
    ) -> Self {
        let auth_source = MeetbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(MeetbookHandler::new(service, admin_users)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for MeetbookFactory {
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
    service: Arc<BookingService>,
    password: String,
    admin_users: Arc<HashSet<String>>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = MeetbookFactory::new(service, password, admin_users);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each admission error kind.
pub fn admit_sqlstate(e: &AdmitError) -> &'static str {
    match e {
        AdmitError::Validation(_) => "22023",
        AdmitError::Unauthorized(_) => "42501",
        AdmitError::NotFound(..) => "P0002",
        AdmitError::SlotUnavailable { .. } => "23P01",
        AdmitError::AlreadyProcessed(_) => "55000",
        AdmitError::CapacityExceeded { .. } => "53000",
        AdmitError::Store(_) => "58000",
    }
}

fn admit_err(e: AdmitError) -> PgWireError {
    user_error(admit_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
