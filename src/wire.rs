use std::fmt::Debug;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{
    AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler,
};
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

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, AppointmentFilter, Command, SqlError};

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = ShopFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct ShopHandler {
    engine: Arc<Engine>,
    query_parser: Arc<ShopQueryParser>,
}

impl ShopHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(ShopQueryParser),
        }
    }

    async fn run(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = std::time::Instant::now();
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
            Command::InsertService {
                id,
                name,
                duration_minutes,
                active,
            } => {
                engine
                    .add_service(id, &name, duration_minutes, active)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeactivateService { id } => {
                engine.deactivate_service(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectServices => service_rows(engine.list_services(true)),
            Command::InsertAppointment(req) => {
                let appointment = engine.submit_booking(req).await.map_err(engine_err)?;
                appointment_rows(vec![appointment])
            }
            Command::Reschedule { id, date, time } => {
                let appointment = engine
                    .reschedule_appointment(id, date, time)
                    .await
                    .map_err(engine_err)?;
                appointment_rows(vec![appointment])
            }
            Command::SetStatus {
                id,
                status: AppointmentStatus::Complete,
                invoice,
            } => {
                let appointment = engine
                    .complete_appointment(id, invoice)
                    .await
                    .map_err(engine_err)?;
                appointment_rows(vec![appointment])
            }
            Command::SetStatus { id, status, .. } => {
                let appointment = engine.set_status(id, status).await.map_err(engine_err)?;
                appointment_rows(vec![appointment])
            }
            Command::CancelByCustomer { code, contact } => {
                engine
                    .cancel_by_customer(&code, &contact)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectAppointments(filter) => {
                let list = match filter {
                    AppointmentFilter::OnDate(date) => engine.appointments_on(date),
                    AppointmentFilter::ById(id) => engine.get_appointment(id).ok().into_iter().collect(),
                    AppointmentFilter::ByConfirmation { code, contact } => engine
                        .lookup_appointment(&code, &contact)
                        .ok()
                        .into_iter()
                        .collect(),
                };
                appointment_rows(list)
            }
            Command::SelectAvailability {
                date,
                service_ids,
                exclude,
            } => {
                let slots = engine
                    .available_slots(date, &service_ids, exclude)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let date = date.to_string();
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&date)?;
                        encoder.encode_field(&slot.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("date", Type::VARCHAR),
        text_field("time", Type::VARCHAR),
    ]
}

fn services_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("duration_minutes", Type::INT4),
        text_field("active", Type::BOOL),
    ]
}

fn appointments_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("confirmation_number", Type::VARCHAR),
        text_field("customer_name", Type::VARCHAR),
        text_field("customer_email", Type::VARCHAR),
        text_field("customer_phone", Type::VARCHAR),
        text_field("car_make", Type::VARCHAR),
        text_field("car_model", Type::VARCHAR),
        text_field("car_year", Type::INT4),
        text_field("appointment_date", Type::VARCHAR),
        text_field("appointment_time", Type::VARCHAR),
        text_field("service_ids", Type::VARCHAR),
        text_field("duration_minutes", Type::INT4),
        text_field("notes", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
    ]
}

fn minutes_i32(minutes: Minutes) -> i32 {
    i32::try_from(minutes).unwrap_or(i32::MAX)
}

fn service_rows(services: Vec<Service>) -> PgWireResult<Response> {
    let schema = Arc::new(services_schema());
    let rows: Vec<PgWireResult<_>> = services
        .into_iter()
        .map(|service| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&service.id.to_string())?;
            encoder.encode_field(&service.name)?;
            encoder.encode_field(&minutes_i32(service.duration_minutes))?;
            encoder.encode_field(&service.active)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn appointment_rows(appointments: Vec<Appointment>) -> PgWireResult<Response> {
    let schema = Arc::new(appointments_schema());
    let rows: Vec<PgWireResult<_>> = appointments
        .into_iter()
        .map(|a| {
            let service_ids = a
                .service_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let status = a.status.to_string();
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&a.id.to_string())?;
            encoder.encode_field(&a.confirmation_code)?;
            encoder.encode_field(&a.customer.name)?;
            encoder.encode_field(&a.customer.email)?;
            encoder.encode_field(&a.customer.phone)?;
            encoder.encode_field(&a.vehicle.make)?;
            encoder.encode_field(&a.vehicle.model)?;
            encoder.encode_field(&a.vehicle.year)?;
            encoder.encode_field(&a.date.to_string())?;
            encoder.encode_field(&a.time.to_string())?;
            encoder.encode_field(&service_ids)?;
            encoder.encode_field(&minutes_i32(a.duration_minutes))?;
            encoder.encode_field(&a.notes)?;
            encoder.encode_field(&status)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Row shape a statement produces, decided from its verb and target table
/// so it can be described before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let words: Vec<String> = sql
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect();
    let after = |keyword: &str| {
        words
            .iter()
            .position(|w| w == keyword)
            .and_then(|i| words.get(i + 1))
            .map(|w| {
                w.trim_matches(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .split('(')
                    .next()
                    .unwrap_or_default()
                    .to_string()
            })
    };
    let (verb, table) = match words.first().map(String::as_str) {
        Some("select") => ("select", after("from")),
        Some("insert") => ("insert", after("into")),
        Some("update") => ("update", words.get(1).cloned()),
        _ => return vec![],
    };
    match (verb, table.as_deref()) {
        ("select", Some("availability")) => availability_schema(),
        ("select", Some("services")) => services_schema(),
        (_, Some("appointments")) => appointments_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ShopHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ShopQueryParser;

#[async_trait]
impl QueryParser for ShopQueryParser {
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
impl ExtendedQueryHandler for ShopHandler {
    type Statement = String;
    type QueryParser = ShopQueryParser;

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
        self.run(&sql).await
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

/// `$N` placeholders outside string literals, as `(byte range, N)`.
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            // A doubled quote toggles twice, so escapes need no special case.
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Splice text-format parameter values into the statement template.
///
/// One left-to-right pass over the template: bound values are copied to the
/// output and never scanned for placeholders themselves.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        out.push_str(&sql[copied..range.start]);
        match n.checked_sub(1).and_then(|i| params.get(i)) {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            // Unbound or out-of-range placeholders become NULL.
            _ => out.push_str("NULL"),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Auth ─────────────────────────────────────────────────────────

/// One shared password for every user name.
#[derive(Debug)]
pub struct ShopAuthSource {
    password: String,
}

impl ShopAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for ShopAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ShopFactory {
    handler: Arc<ShopHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ShopAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ShopFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(ShopHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                ShopAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ShopFactory {
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

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_)
        | EngineError::UnknownService(_)
        | EngineError::InactiveService(_)
        | EngineError::OutsideBusinessHours(_) => "22023",
        EngineError::SlotUnavailable { .. } => "23P01",
        EngineError::Terminal { .. } | EngineError::InvalidTransition { .. } => "55000",
        EngineError::NotFound(_) | EngineError::NoMatchingBooking => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::CodeSpaceExhausted => "XX000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if !e.is_rejection() {
        tracing::error!("engine failure: {e}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
