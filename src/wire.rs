use std::fmt::Debug;
use std::io;
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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{BookdAuthSource, resolve_actor};
use crate::engine::{Engine, EngineError, NewAppointment};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct BookdHandler {
    tenant_manager: Arc<TenantManager>,
    admin_user: String,
    query_parser: Arc<BookdQueryParser>,
}

impl BookdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, admin_user: String) -> Self {
        Self {
            tenant_manager,
            admin_user,
            query_parser: Arc::new(BookdQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        let user = client.metadata().get("user").map(String::as_str).unwrap_or_default();
        resolve_actor(user, &self.admin_user).map_err(engine_err)
    }

    /// Parse, run and meter one statement.
    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let actor = self.resolve_actor(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);

        let started = Instant::now();
        let result = self.execute_command(&engine, actor, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        actor: Actor,
        cmd: Command,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertSettings { row } => {
                engine.put_settings(actor, row).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectSettings => {
                let s = engine.settings().await.map_err(engine_err)?;
                let schema = Arc::new(settings_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&hhmm(s.opening_time))?;
                encoder.encode_field(&hhmm(s.closing_time))?;
                encoder.encode_field(&i64::from(s.slot_interval_minutes))?;
                encoder.encode_field(&i64::from(s.max_concurrent))?;
                encoder.encode_field(&s.timezone.name())?;
                encoder.encode_field(&hhmm(s.lunch_start))?;
                encoder.encode_field(&hhmm(s.lunch_end))?;
                Ok(query_response(schema, vec![Ok(encoder.take_row())]))
            }
            Command::InsertPolicy { policy } => {
                engine.put_policy(actor, policy).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertService { service } => {
                engine.upsert_service(actor, service).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteService { id } => {
                engine.deactivate_service(actor, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectServices => {
                let schema = Arc::new(services_schema());
                let rows: Vec<PgWireResult<DataRow>> = engine
                    .list_services()
                    .into_iter()
                    .map(|svc| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&svc.id.to_string())?;
                        encoder.encode_field(&svc.name)?;
                        encoder.encode_field(&i64::from(svc.duration_minutes))?;
                        encoder.encode_field(&svc.price)?;
                        encoder.encode_field(&svc.exclusivity_group)?;
                        encoder.encode_field(&svc.active)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectAvailability {
                day,
                service_ids,
                alternatives,
            } => {
                let avail = engine
                    .get_availability(day, &service_ids, alternatives)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let requested = avail.slots.iter().map(|slot| (avail.day, Some(slot), false));
                // A full day still reports its totals, on one row without a start.
                let totals_only = (avail.slots.is_empty() && avail.total_duration_minutes > 0)
                    .then_some((avail.day, None, false));
                let others = avail
                    .alternatives
                    .iter()
                    .flat_map(|d| d.slots.iter().map(move |slot| (d.day, Some(slot), true)));
                let rows: Vec<PgWireResult<DataRow>> = requested
                    .chain(totals_only)
                    .chain(others)
                    .map(|(day, slot, alternative)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&day.to_string())?;
                        encoder.encode_field(&slot.map(|s| s.start))?;
                        encoder.encode_field(&slot.map(|s| hhmm(s.local_time)))?;
                        encoder.encode_field(&i64::from(avail.total_duration_minutes))?;
                        encoder.encode_field(&avail.total_price)?;
                        encoder.encode_field(&alternative)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectSuggestions {
                from_day,
                service_ids,
                max_days,
            } => {
                let days = engine
                    .suggest_next_available(from_day, &service_ids, max_days)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(suggestions_schema());
                let rows: Vec<PgWireResult<DataRow>> = days
                    .iter()
                    .flat_map(|d| d.slots.iter().map(move |slot| (d.day, slot)))
                    .map(|(day, slot)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&day.to_string())?;
                        encoder.encode_field(&slot.start)?;
                        encoder.encode_field(&hhmm(slot.local_time))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::InsertAppointment {
                id,
                customer_id,
                car_id,
                start,
                service_ids,
                notes,
            } => {
                engine
                    .create_appointment(
                        actor,
                        NewAppointment {
                            id,
                            customer_id,
                            car_id,
                            start,
                            service_ids,
                            notes,
                        },
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectAppointment { id } => {
                let appt = engine.get_appointment(actor, id).await.map_err(engine_err)?;
                let schema = Arc::new(appointment_schema());
                let row = encode_appointment(&schema, &appt);
                Ok(query_response(schema, vec![row]))
            }
            Command::SelectAppointmentsOn { day } => {
                let appts = engine
                    .list_appointments(actor, day)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(appointment_schema());
                let rows: Vec<PgWireResult<DataRow>> = appts
                    .iter()
                    .map(|appt| encode_appointment(&schema, appt))
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::DeleteAppointment { id } => {
                engine.delete_appointment(actor, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertTransition {
                appointment_id,
                target,
                expected_version,
            } => {
                engine
                    .update_status(actor, appointment_id, target, expected_version)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertReschedule {
                appointment_id,
                start,
                service_ids,
                expected_version,
            } => {
                engine
                    .reschedule(actor, appointment_id, start, service_ids, expected_version)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectReputation { customer_id } => {
                let info = engine
                    .reputation(actor, customer_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(reputation_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&info.customer_id.to_string())?;
                encoder.encode_field(&info.rating.to_string())?;
                encoder.encode_field(&i64::from(info.no_show_count))?;
                encoder.encode_field(&i64::from(info.completed_count))?;
                encoder.encode_field(&info.requires_advance_payment)?;
                encoder.encode_field(&i64::from(info.advance_percent))?;
                Ok(query_response(schema, vec![Ok(encoder.take_row())]))
            }
        }
    }
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_appointment(schema: &Arc<Vec<FieldInfo>>, appt: &Appointment) -> PgWireResult<DataRow> {
    let services = appt
        .service_ids()
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&appt.id.to_string())?;
    encoder.encode_field(&appt.customer_id.to_string())?;
    encoder.encode_field(&appt.car_id.to_string())?;
    encoder.encode_field(&appt.span.start)?;
    encoder.encode_field(&appt.span.end)?;
    encoder.encode_field(&appt.status.kind().as_str())?;
    encoder.encode_field(&appt.suggested_start())?;
    encoder.encode_field(&services)?;
    encoder.encode_field(&appt.total_price)?;
    encoder.encode_field(&appt.advance_payment.map(|a| i64::from(a.percent)))?;
    encoder.encode_field(&appt.advance_payment.map(|a| a.amount))?;
    encoder.encode_field(&appt.notes)?;
    encoder.encode_field(&appt.business_notes)?;
    encoder.encode_field(&version_i64(appt.version))?;
    Ok(encoder.take_row())
}

fn version_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn hhmm(t: chrono::NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("day", Type::VARCHAR),
        field("start", Type::INT8),
        field("local_time", Type::VARCHAR),
        field("total_duration_minutes", Type::INT8),
        field("total_price", Type::INT8),
        field("alternative", Type::BOOL),
    ]
}

fn suggestions_schema() -> Vec<FieldInfo> {
    vec![
        field("day", Type::VARCHAR),
        field("start", Type::INT8),
        field("local_time", Type::VARCHAR),
    ]
}

fn appointment_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("customer_id", Type::VARCHAR),
        field("car_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
        field("suggested_start", Type::INT8),
        field("services", Type::VARCHAR),
        field("total_price", Type::INT8),
        field("advance_percent", Type::INT8),
        field("advance_amount", Type::INT8),
        field("notes", Type::VARCHAR),
        field("business_notes", Type::VARCHAR),
        field("version", Type::INT8),
    ]
}

fn reputation_schema() -> Vec<FieldInfo> {
    vec![
        field("customer_id", Type::VARCHAR),
        field("rating", Type::VARCHAR),
        field("no_show_count", Type::INT8),
        field("completed_count", Type::INT8),
        field("requires_advance_payment", Type::BOOL),
        field("advance_percent", Type::INT8),
    ]
}

fn settings_schema() -> Vec<FieldInfo> {
    vec![
        field("opening_time", Type::VARCHAR),
        field("closing_time", Type::VARCHAR),
        field("slot_interval_minutes", Type::INT8),
        field("max_concurrent", Type::INT8),
        field("timezone", Type::VARCHAR),
        field("lunch_start", Type::VARCHAR),
        field("lunch_end", Type::VARCHAR),
    ]
}

fn services_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("duration_minutes", Type::INT8),
        field("price", Type::INT8),
        field("exclusivity_group", Type::VARCHAR),
        field("active", Type::BOOL),
    ]
}

/// Result columns of a statement, judged from the table it selects from.
fn result_schema(stmt: &str) -> Vec<FieldInfo> {
    let lower = stmt.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    let table = lower
        .split_whitespace()
        .skip_while(|w| *w != "from")
        .nth(1)
        .map(|t| t.trim_matches(|c: char| c == ';' || c == '"'));
    match table {
        Some("availability") => availability_schema(),
        Some("suggestions") => suggestions_schema(),
        Some("appointments") => appointment_schema(),
        Some("reputation") => reputation_schema(),
        Some("settings") => settings_schema(),
        Some("services") => services_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for BookdHandler {
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
        Ok(vec![self.run(client, query).await?])
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
        let sql = substitute_params(portal);
        self.run(client, &sql).await
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

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    bind_text_params(&portal.statement.statement, &portal.parameters)
}

fn bind_text_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
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
    pub fn new(tenant_manager: Arc<TenantManager>, password: String, admin_user: String) -> Self {
        let auth_source = BookdAuthSource::new(password, admin_user.clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(BookdHandler::new(tenant_manager, admin_user)),
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    admin_user: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(BookdFactory::new(tenant_manager, password, admin_user));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::ConfigurationMissing | EngineError::InvalidSettings(_) => "F0000",
        EngineError::Unauthorized | EngineError::Forbidden(_) => "42501",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::UnknownService(_)
        | EngineError::InvalidRequest(_)
        | EngineError::LimitExceeded(_) => "22023",
        EngineError::SlotRejected(_)
        | EngineError::CapacityExceeded(_)
        | EngineError::InvalidTransition { .. }
        | EngineError::StaleVersion { .. } => "P0001",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
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
