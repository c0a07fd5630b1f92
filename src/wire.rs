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
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::LedgerAuthSource;
use crate::engine::{CostBreakdown, Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, ResultShape, SqlError};

pub struct LedgerHandler {
    engine: Arc<Engine>,
    admin_user: String,
    query_parser: Arc<LedgerQueryParser>,
}

impl LedgerHandler {
    pub fn new(engine: Arc<Engine>, admin_user: String) -> Self {
        Self {
            engine,
            admin_user,
            query_parser: Arc::new(LedgerQueryParser),
        }
    }

    /// The login name decides who is calling, once per statement.
    fn resolve_caller<C: ClientInfo>(&self, client: &C) -> PgWireResult<Caller> {
        let user = client
            .metadata()
            .get("user")
            .map(String::as_str)
            .unwrap_or_default();
        self.engine
            .resolve_caller(user, &self.admin_user)
            .ok_or_else(|| user_error("42501", format!("unknown user: {user}")))
    }

    async fn run(&self, caller: &Caller, query: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();

        let result = self.execute_command(caller, cmd, format).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        caller: &Caller,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        let engine = &self.engine;
        let schema = describe(cmd.result_shape(), format);
        match cmd {
            Command::InsertLot {
                id,
                name,
                address,
                pin_code,
                hourly_rate,
                capacity,
            } => {
                let spec = LotSpec {
                    id,
                    name,
                    address,
                    pin_code,
                    hourly_rate,
                    capacity,
                };
                engine.create_lot(caller, spec).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateLot { id, patch } => {
                engine.update_lot(caller, id, patch).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteLot { id } => {
                engine.delete_lot(caller, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertUser {
                id,
                username,
                full_name,
            } => {
                if username.trim().eq_ignore_ascii_case(&self.admin_user) {
                    return Err(user_error(
                        "23505",
                        format!("username {username} is reserved"),
                    ));
                }
                engine
                    .register_user(caller, id, &username, full_name)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateUser { id, active } => {
                engine
                    .set_user_active(caller, id, active)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::InsertReservation {
                id,
                lot_id,
                vehicle_number,
                vehicle_model,
            } => {
                let req = ReserveRequest {
                    id,
                    lot_id,
                    vehicle_number,
                    vehicle_model,
                };
                let ticket = engine.reserve(caller, req).await.map_err(engine_err)?;
                Ok(rows_response(schema, &[ticket], encode_ticket))
            }
            Command::OccupyReservation { id } => {
                let r = engine.occupy(caller, id).await.map_err(engine_err)?;
                Ok(rows_response(schema, &[r], encode_reservation))
            }
            Command::ReleaseReservation { id } => {
                let receipt = engine.release(caller, id).await.map_err(engine_err)?;
                Ok(rows_response(schema, &[receipt], encode_receipt))
            }
            Command::ForceReleaseReservation { id } => {
                let receipt = engine.force_release(caller, id).await.map_err(engine_err)?;
                Ok(rows_response(schema, &[receipt], encode_receipt))
            }
            Command::CancelReservation { id } => {
                let r = engine.cancel(caller, id).await.map_err(engine_err)?;
                Ok(rows_response(schema, &[r], encode_reservation))
            }
            Command::SelectLots { id: Some(id) } => {
                let lot = engine.get_lot(caller, id).await.map_err(engine_err)?;
                Ok(rows_response(schema, &[lot], encode_lot))
            }
            Command::SelectLots { id: None } => {
                let lots = engine.list_lots(caller).await;
                Ok(rows_response(schema, &lots, encode_lot))
            }
            Command::SelectSpots { lot_id } => {
                let spots = engine.list_spots(caller, lot_id).await.map_err(engine_err)?;
                Ok(rows_response(schema, &spots, encode_spot))
            }
            Command::SelectUsers => {
                let users = engine.list_users(caller).await.map_err(engine_err)?;
                Ok(rows_response(schema, &users, encode_user))
            }
            Command::SelectReservations { filter } => {
                let rs = engine
                    .list_reservations(caller, filter)
                    .await
                    .map_err(engine_err)?;
                Ok(rows_response(schema, &rs, encode_reservation))
            }
            Command::SelectEstimate { reservation_id } => {
                let bill = engine
                    .estimate(caller, reservation_id)
                    .await
                    .map_err(engine_err)?;
                let row = (reservation_id, bill);
                Ok(rows_response(schema, &[row], encode_estimate))
            }
        }
    }
}

// ── Result rows ──────────────────────────────────────────────────

/// Column names and types for each row shape.
fn columns(shape: ResultShape) -> Vec<(&'static str, Type)> {
    // Money goes out as VARCHAR ("100.00") so every client reads it the same way.
    match shape {
        ResultShape::Lots => vec![
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("address", Type::VARCHAR),
            ("pin_code", Type::VARCHAR),
            ("hourly_rate", Type::VARCHAR),
            ("capacity", Type::INT8),
            ("available", Type::INT8),
            ("occupied", Type::INT8),
            ("active", Type::BOOL),
        ],
        ResultShape::Spots => vec![
            ("id", Type::VARCHAR),
            ("lot_id", Type::VARCHAR),
            ("label", Type::VARCHAR),
            ("status", Type::VARCHAR),
            ("reservation_id", Type::VARCHAR),
        ],
        ResultShape::Users => vec![
            ("id", Type::VARCHAR),
            ("username", Type::VARCHAR),
            ("full_name", Type::VARCHAR),
            ("active", Type::BOOL),
            ("active_reservation", Type::VARCHAR),
        ],
        ResultShape::Reservations => vec![
            ("id", Type::VARCHAR),
            ("lot_id", Type::VARCHAR),
            ("spot_id", Type::VARCHAR),
            ("spot_label", Type::VARCHAR),
            ("user_id", Type::VARCHAR),
            ("vehicle_number", Type::VARCHAR),
            ("vehicle_model", Type::VARCHAR),
            ("entry", Type::INT8),
            ("exit", Type::INT8),
            ("final_cost", Type::VARCHAR),
            ("status", Type::VARCHAR),
            ("forced", Type::BOOL),
        ],
        ResultShape::Ticket => vec![
            ("id", Type::VARCHAR),
            ("lot_id", Type::VARCHAR),
            ("spot_id", Type::VARCHAR),
            ("spot_label", Type::VARCHAR),
            ("entry", Type::INT8),
            ("hourly_rate", Type::VARCHAR),
        ],
        ResultShape::Receipt => vec![
            ("id", Type::VARCHAR),
            ("lot_id", Type::VARCHAR),
            ("spot_label", Type::VARCHAR),
            ("entry", Type::INT8),
            ("exit", Type::INT8),
            ("duration_minutes", Type::INT8),
            ("billing_hours", Type::INT8),
            ("hourly_rate", Type::VARCHAR),
            ("final_cost", Type::VARCHAR),
            ("forced", Type::BOOL),
        ],
        ResultShape::Estimate => vec![
            ("reservation_id", Type::VARCHAR),
            ("hourly_rate", Type::VARCHAR),
            ("duration_minutes", Type::INT8),
            ("elapsed_hours", Type::VARCHAR),
            ("billing_hours", Type::INT8),
            ("cost", Type::VARCHAR),
            ("is_final", Type::BOOL),
        ],
        ResultShape::None => vec![],
    }
}

/// Field list for `shape`, each column in the format the client asked for.
/// A short per-column list leaves the remaining columns as text.
fn describe(shape: ResultShape, format: &Format) -> Vec<FieldInfo> {
    columns(shape)
        .into_iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            let field_format = match format {
                Format::Individual(codes) => codes
                    .get(i)
                    .map_or(FieldFormat::Text, |code| FieldFormat::from(*code)),
                other => other.format_for(i),
            };
            FieldInfo::new(name.into(), None, None, ty, field_format)
        })
        .collect()
}

/// Row description of a statement that may still hold `$N` placeholders.
fn result_schema(sql: &str, format: &Format) -> PgWireResult<Vec<FieldInfo>> {
    let shape = sql::result_shape(sql).map_err(sql_err)?;
    Ok(describe(shape, format))
}

fn encode_lot(e: &mut DataRowEncoder, lot: &LotInfo) -> PgWireResult<()> {
    e.encode_field(&lot.id.to_string())?;
    e.encode_field(&lot.name)?;
    e.encode_field(&lot.address)?;
    e.encode_field(&lot.pin_code)?;
    e.encode_field(&lot.hourly_rate.to_string())?;
    e.encode_field(&i64::from(lot.capacity))?;
    e.encode_field(&i64::from(lot.available))?;
    e.encode_field(&i64::from(lot.occupied))?;
    e.encode_field(&lot.active)
}

fn encode_spot(e: &mut DataRowEncoder, spot: &SpotInfo) -> PgWireResult<()> {
    e.encode_field(&spot.id.to_string())?;
    e.encode_field(&spot.lot_id.to_string())?;
    e.encode_field(&spot.label)?;
    e.encode_field(&spot.status.as_str().to_string())?;
    e.encode_field(&spot.reservation_id.map(|r| r.to_string()))
}

fn encode_user(e: &mut DataRowEncoder, user: &UserInfo) -> PgWireResult<()> {
    e.encode_field(&user.id.to_string())?;
    e.encode_field(&user.username)?;
    e.encode_field(&user.full_name)?;
    e.encode_field(&user.active)?;
    e.encode_field(&user.active_reservation.map(|r| r.to_string()))
}

fn encode_reservation(e: &mut DataRowEncoder, r: &Reservation) -> PgWireResult<()> {
    e.encode_field(&r.id.to_string())?;
    e.encode_field(&r.lot_id.to_string())?;
    e.encode_field(&r.spot_id.to_string())?;
    e.encode_field(&r.spot_label)?;
    e.encode_field(&r.user_id.to_string())?;
    e.encode_field(&r.vehicle_number)?;
    e.encode_field(&r.vehicle_model)?;
    e.encode_field(&r.entry)?;
    e.encode_field(&r.exit)?;
    e.encode_field(&r.final_cost.map(|c| c.to_string()))?;
    e.encode_field(&r.status.as_str().to_string())?;
    e.encode_field(&r.forced)
}

fn encode_ticket(e: &mut DataRowEncoder, t: &ReservationTicket) -> PgWireResult<()> {
    e.encode_field(&t.id.to_string())?;
    e.encode_field(&t.lot_id.to_string())?;
    e.encode_field(&t.spot_id.to_string())?;
    e.encode_field(&t.spot_label)?;
    e.encode_field(&t.entry)?;
    e.encode_field(&t.hourly_rate.to_string())
}

fn encode_receipt(e: &mut DataRowEncoder, r: &Receipt) -> PgWireResult<()> {
    e.encode_field(&r.id.to_string())?;
    e.encode_field(&r.lot_id.to_string())?;
    e.encode_field(&r.spot_label)?;
    e.encode_field(&r.entry)?;
    e.encode_field(&r.exit)?;
    e.encode_field(&r.duration_minutes)?;
    e.encode_field(&r.billing_hours)?;
    e.encode_field(&r.hourly_rate.to_string())?;
    e.encode_field(&r.final_cost.to_string())?;
    e.encode_field(&r.forced)
}

fn encode_estimate(e: &mut DataRowEncoder, row: &(ulid::Ulid, CostBreakdown)) -> PgWireResult<()> {
    let (id, bill) = row;
    e.encode_field(&id.to_string())?;
    e.encode_field(&bill.hourly_rate.to_string())?;
    e.encode_field(&bill.duration_minutes)?;
    e.encode_field(&bill.elapsed_hours.to_string())?;
    e.encode_field(&bill.billing_hours)?;
    e.encode_field(&bill.cost.to_string())?;
    e.encode_field(&bill.is_final)
}

fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

#[async_trait]
impl SimpleQueryHandler for LedgerHandler {
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
        Ok(vec![self.run(&caller, query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LedgerQueryParser;

#[async_trait]
impl QueryParser for LedgerQueryParser {
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
        // Refuse at prepare time what describe could not give a row shape for.
        sql::result_shape(sql).map_err(sql_err)?;
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        let text = Format::UnifiedText;
        result_schema(stmt, column_format.unwrap_or(&text))
    }
}

#[async_trait]
impl ExtendedQueryHandler for LedgerHandler {
    type Statement = String;
    type QueryParser = LedgerQueryParser;

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
        self.run(&caller, &sql, &portal.result_column_format).await
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
        let fields = result_schema(&target.statement, &Format::UnifiedText)?;
        Ok(DescribeStatementResponse::new(param_types, fields))
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
        let fields = result_schema(&target.statement.statement, &target.result_column_format)?;
        Ok(DescribePortalResponse::new(fields))
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
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first, so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct LedgerFactory {
    handler: Arc<LedgerHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<LedgerAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl LedgerFactory {
    pub fn new(engine: Arc<Engine>, admin_user: String, password: String) -> Self {
        let auth_source = LedgerAuthSource::new(engine.clone(), admin_user.clone(), password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(LedgerHandler::new(engine, admin_user)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LedgerFactory {
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
    factory: Arc<LedgerFactory>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
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

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::WalError(msg) = &e {
        tracing::error!("WAL failure: {msg}");
    }
    user_error(e.sqlstate(), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
