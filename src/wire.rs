use std::fmt::Debug;
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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::MedslotAuthSource;
use crate::engine::{BookingRequest, Engine, EngineError, ReservationOutcome};
use crate::model::*;
use crate::observability::{self, command_label};
use crate::sql::{self, AppointmentFilter, Command, SqlError};
use crate::tenant::TenantManager;

pub struct MedslotHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<MedslotQueryParser>,
}

impl MedslotHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(MedslotQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertDoctor { id, name, timezone, consultation_fee, active } => {
                engine
                    .create_doctor(id, name, &timezone, consultation_fee, active)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::UpdateDoctor { id, name, consultation_fee, active } => {
                engine
                    .update_doctor(id, name, consultation_fee, active)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::SetWeeklyHours { doctor_id, hours } => {
                let count = hours.len();
                engine.set_weekly_hours(doctor_id, hours).await.map_err(engine_err)?;
                Ok(vec![inserted(count)])
            }
            Command::InsertBlock { doctor_id, block } => {
                engine.add_block(doctor_id, block).await.map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::DeleteBlock { id } => {
                engine.remove_block(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertAppointment {
                id,
                doctor_id,
                service_id,
                patient_id,
                start,
                duration_minutes,
                idempotency_key,
            } => {
                let mut req = BookingRequest::new(doctor_id, patient_id, service_id, start, duration_minutes);
                req.id = id;
                req.idempotency_key = idempotency_key;
                let outcome = engine.reserve(req).await.map_err(engine_err)?;
                outcome_response(outcome)
            }
            Command::InsertStatusChange { appointment_id, status, reason } => {
                engine
                    .update_status(appointment_id, status, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::InsertReschedule { appointment_id, start } => {
                let outcome = engine.reschedule(appointment_id, start).await.map_err(engine_err)?;
                outcome_response(outcome)
            }
            Command::InsertPayment { appointment_id, status, reference } => {
                engine
                    .record_payment(appointment_id, status, reference)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::SelectDoctors { id } => {
                let doctors = match id {
                    Some(id) => found(engine.get_doctor(id).await)?.into_iter().collect(),
                    None => engine.list_doctors().await,
                };
                let schema = Arc::new(doctors_schema());
                let rows: Vec<PgWireResult<DataRow>> = doctors.iter().map(|d| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&d.id.to_string())?;
                    encoder.encode_field(&d.name)?;
                    encoder.encode_field(&d.timezone)?;
                    encoder.encode_field(&(d.consultation_fee as i64))?;
                    encoder.encode_field(&d.active)?;
                    Ok(encoder.take_row())
                }).collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectWeeklyHours { doctor_id } => {
                let hours = engine.get_weekly_hours(doctor_id).await.map_err(engine_err)?;
                let schema = Arc::new(weekly_hours_schema());
                let did = doctor_id.to_string();
                let rows: Vec<PgWireResult<DataRow>> = hours.iter().map(|h| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&did)?;
                    encoder.encode_field(&h.weekday.to_string().to_lowercase())?;
                    encoder.encode_field(&h.start.to_string())?;
                    encoder.encode_field(&h.end.to_string())?;
                    encoder.encode_field(&h.is_available)?;
                    Ok(encoder.take_row())
                }).collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectBlocks { doctor_id } => {
                let blocks = engine.get_blocks(doctor_id).await.map_err(engine_err)?;
                let schema = Arc::new(blocks_schema());
                let did = doctor_id.to_string();
                let rows: Vec<PgWireResult<DataRow>> = blocks.iter().map(|b| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&b.id.to_string())?;
                    encoder.encode_field(&did)?;
                    encoder.encode_field(&b.date.format("%Y-%m-%d").to_string())?;
                    encoder.encode_field(&b.start.to_string())?;
                    encoder.encode_field(&b.end.to_string())?;
                    encoder.encode_field(&b.reason)?;
                    Ok(encoder.take_row())
                }).collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectAppointments { filter } => {
                let appointments = match filter {
                    AppointmentFilter::Id(id) => found(engine.get_appointment(id).await)?.into_iter().collect(),
                    AppointmentFilter::Doctor { doctor_id, date } => {
                        engine.list_appointments(doctor_id, date).await.map_err(engine_err)?
                    }
                    AppointmentFilter::Patient(patient_id) => engine.list_patient_appointments(patient_id).await,
                };
                let schema = Arc::new(appointments_schema());
                let rows: Vec<_> = appointments.iter().map(|a| encode_appointment(&schema, a)).collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectAvailability { doctor_id, date } => {
                let free = engine.resolve_availability(doctor_id, date).await.map_err(engine_err)?;
                Ok(vec![spans_response(doctor_id, &free)])
            }
            Command::SelectSlots { doctor_id, date, duration_minutes, granularity_minutes } => {
                let slots = engine
                    .resolve_available_slots(doctor_id, date, duration_minutes, granularity_minutes)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![spans_response(doctor_id, &slots)])
            }
        }
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

/// Rejections and conflicts are outcomes inside the engine but errors to a SQL client.
fn outcome_response(outcome: ReservationOutcome) -> PgWireResult<Vec<Response>> {
    match outcome {
        ReservationOutcome::Committed(_) => Ok(vec![inserted(1)]),
        ReservationOutcome::Rejected(reason) => {
            Err(user_error("P0001", format!("booking rejected: {reason}")))
        }
        ReservationOutcome::Conflicted { appointment_id } => Err(user_error(
            "23P01",
            format!("slot conflicts with appointment {appointment_id}"),
        )),
    }
}

/// Point lookups on a missing id read as an empty result set.
fn found<T>(result: Result<T, EngineError>) -> PgWireResult<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(EngineError::NotFound(_)) => Ok(None),
        Err(e) => Err(engine_err(e)),
    }
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn spans_response(doctor_id: Ulid, spans: &[Span]) -> Response {
    let schema = Arc::new(spans_schema());
    let did = doctor_id.to_string();
    let rows: Vec<PgWireResult<DataRow>> = spans.iter().map(|span| {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&did)?;
        encoder.encode_field(&span.start)?;
        encoder.encode_field(&span.end)?;
        Ok(encoder.take_row())
    }).collect();
    query_response(schema.clone(), rows)
}

fn encode_appointment(schema: &Arc<Vec<FieldInfo>>, a: &Appointment) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&a.id.to_string())?;
    encoder.encode_field(&a.doctor_id.to_string())?;
    encoder.encode_field(&a.patient_id.to_string())?;
    encoder.encode_field(&a.service_id.to_string())?;
    encoder.encode_field(&a.start)?;
    encoder.encode_field(&a.end())?;
    encoder.encode_field(&(a.duration_minutes as i64))?;
    encoder.encode_field(&a.status.as_str())?;
    encoder.encode_field(&a.payment_status.as_str())?;
    encoder.encode_field(&(a.amount as i64))?;
    encoder.encode_field(&a.payment_reference)?;
    encoder.encode_field(&a.cancellation_reason)?;
    encoder.encode_field(&a.reminder_sent)?;
    Ok(encoder.take_row())
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn doctors_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("timezone", Type::VARCHAR),
        field("consultation_fee", Type::INT8),
        field("active", Type::BOOL),
    ]
}

fn weekly_hours_schema() -> Vec<FieldInfo> {
    vec![
        field("doctor_id", Type::VARCHAR),
        field("weekday", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("is_available", Type::BOOL),
    ]
}

fn blocks_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("doctor_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("reason", Type::VARCHAR),
    ]
}

fn appointments_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("doctor_id", Type::VARCHAR),
        field("patient_id", Type::VARCHAR),
        field("service_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("duration", Type::INT8),
        field("status", Type::VARCHAR),
        field("payment_status", Type::VARCHAR),
        field("amount", Type::INT8),
        field("payment_reference", Type::VARCHAR),
        field("cancellation_reason", Type::VARCHAR),
        field("reminder_sent", Type::BOOL),
    ]
}

/// Shared by `availability` and `slots`.
fn spans_schema() -> Vec<FieldInfo> {
    vec![
        field("doctor_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

/// Schema a statement will produce, judged from its text before parameters
/// are bound. Writes produce none.
fn schema_for(stmt: &str) -> Vec<FieldInfo> {
    let lower = stmt.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    let table = lower
        .split_whitespace()
        .skip_while(|w| *w != "from")
        .nth(1)
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric() && c != '_'))
        .unwrap_or_default();
    match table {
        "doctors" => doctors_schema(),
        "weekly_hours" => weekly_hours_schema(),
        "blocked_intervals" => blocks_schema(),
        "appointments" => appointments_schema(),
        "availability" | "slots" => spans_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for MedslotHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct MedslotQueryParser;

#[async_trait]
impl QueryParser for MedslotQueryParser {
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

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for MedslotHandler {
    type Statement = String;
    type QueryParser = MedslotQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.run(&engine, cmd).await?;
        Ok(responses.remove(0))
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
        Ok(DescribeStatementResponse::new(param_types, schema_for(&target.statement)))
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
        Ok(DescribePortalResponse::new(schema_for(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals. Highest index first so
/// `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct MedslotFactory {
    handler: Arc<MedslotHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<MedslotAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl MedslotFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(MedslotHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                MedslotAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for MedslotFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = MedslotFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidArgument(_) | EngineError::Duration { .. } => "22023",
        EngineError::Conflict(_) => "23P01",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::Transient(_) => "40001",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Payment(_) => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
