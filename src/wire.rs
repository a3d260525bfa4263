use std::fmt::Debug;
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
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::PortalAuthSource;
use crate::engine::{Engine, EngineError, Entity};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, SqlError};

pub struct RoomLedgerHandler {
    engine: Arc<Engine>,
    admin_user: String,
    query_parser: Arc<RoomLedgerQueryParser>,
}

impl RoomLedgerHandler {
    pub fn new(engine: Arc<Engine>, admin_user: String) -> Self {
        Self {
            engine,
            admin_user,
            query_parser: Arc::new(RoomLedgerQueryParser),
        }
    }

    /// The registered user behind this session. The admin account owns no
    /// bookings, so it must name an owner explicitly.
    fn session_owner<C: ClientInfo>(&self, client: &C) -> PgWireResult<Ulid> {
        let login = client.metadata().get("user").cloned().unwrap_or_default();
        if login == self.admin_user {
            return Err(user_error(
                "22023",
                "owner_id is required when booking as the admin user".into(),
            ));
        }
        self.engine
            .find_user_by_email(&login)
            .map(|u| u.id)
            .ok_or_else(|| user_error("28000", format!("session user is not registered: {login}")))
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(client, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command<C: ClientInfo>(
        &self,
        client: &C,
        cmd: Command,
    ) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertRoom { room } => {
                engine.create_room(room).await.map_err(engine_err)?;
                Ok(tag("INSERT", 1))
            }
            Command::UpdateRoom { id, patch } => {
                engine.update_room(id, patch).await.map_err(engine_err)?;
                Ok(tag("UPDATE", 1))
            }
            Command::DeleteRoom { id } => {
                engine.delete_room(id).await.map_err(engine_err)?;
                Ok(tag("DELETE", 1))
            }
            Command::SelectRooms { id } => {
                let rooms: Vec<Room> = match id {
                    Some(id) => engine.get_room(&id).into_iter().collect(),
                    None => engine.list_rooms(),
                };
                rows_response(rooms_schema(), rooms.iter(), encode_room)
            }
            Command::UpsertUser { user } => {
                engine.upsert_user(user).await.map_err(engine_err)?;
                Ok(tag("INSERT", 1))
            }
            Command::DeleteUser { id } => {
                engine.delete_user(id).await.map_err(engine_err)?;
                Ok(tag("DELETE", 1))
            }
            Command::SelectUsers {
                search,
                sort,
                pagination,
            } => {
                let page = engine.list_users(search.as_deref(), sort, pagination);
                let total = page.total as i64;
                rows_response(users_schema(), page.items.iter(), |enc, user| {
                    encode_user(enc, user)?;
                    enc.encode_field(&total)
                })
            }
            Command::InsertBooking {
                id,
                room_id,
                owner_id,
                start,
                end,
                title,
            } => {
                let owner_id = match owner_id {
                    Some(owner) => owner,
                    None => self.session_owner(client)?,
                };
                engine
                    .create_booking(id, room_id, owner_id, start, end, title)
                    .await
                    .map_err(engine_err)?;
                Ok(tag("INSERT", 1))
            }
            Command::UpdateBooking {
                id,
                start,
                end,
                title,
            } => {
                let (start, end) = match (start, end) {
                    (Some(s), Some(e)) => (s, e),
                    (start, end) => {
                        let current = engine
                            .get_booking(&id)
                            .await
                            .ok_or_else(|| engine_err(EngineError::NotFound(Entity::Booking, id)))?;
                        (
                            start.unwrap_or(current.span.start),
                            end.unwrap_or(current.span.end),
                        )
                    }
                };
                engine
                    .update_booking(id, start, end, title)
                    .await
                    .map_err(engine_err)?;
                Ok(tag("UPDATE", 1))
            }
            Command::CancelBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(tag("UPDATE", 1))
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(id).await.map_err(engine_err)?;
                Ok(tag("DELETE", 1))
            }
            Command::SelectBooking { id } => {
                let booking = engine.get_booking(&id).await;
                rows_response(bookings_schema(), booking.iter(), encode_booking)
            }
            Command::SelectRoomBookings { room_id, range } => {
                let bookings = engine
                    .list_bookings_for_room(room_id, range)
                    .await
                    .map_err(engine_err)?;
                rows_response(bookings_schema(), bookings.iter(), encode_booking)
            }
            Command::SelectOwnerBookings {
                owner_id,
                sort,
                pagination,
            } => {
                let page = engine
                    .list_bookings_for_owner(owner_id, pagination, sort)
                    .await;
                let total = page.total as i64;
                rows_response(owner_bookings_schema(), page.items.iter(), |enc, view| {
                    encode_booking(enc, &view.booking)?;
                    enc.encode_field(&view.room_name)?;
                    enc.encode_field(&view.owner_name)?;
                    enc.encode_field(&total)
                })
            }
            Command::SelectAvailability {
                room_id,
                start,
                end,
                min_duration,
            } => {
                let slots = engine
                    .compute_free_slots(room_id, start, end, min_duration)
                    .await
                    .map_err(engine_err)?;
                let rid = room_id.to_string();
                rows_response(availability_schema(), slots.iter(), |enc, slot| {
                    enc.encode_field(&rid)?;
                    enc.encode_field(&slot.start)?;
                    enc.encode_field(&slot.end)
                })
            }
            Command::SelectConflicts {
                room_id,
                start,
                end,
                exclude_id,
            } => {
                let verdict = engine
                    .check_availability(room_id, start, end, exclude_id)
                    .await
                    .map_err(engine_err)?;
                rows_response(bookings_schema(), verdict.conflicts.iter(), encode_booking)
            }
        }
    }
}

fn tag(command: &str, rows: usize) -> Response {
    Response::Execution(Tag::new(command).with_rows(rows))
}

fn rows_response<'a, T: 'a>(
    schema: Vec<FieldInfo>,
    items: impl Iterator<Item = &'a T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<DataRow>> = items
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    )))
}

fn encode_room(enc: &mut DataRowEncoder, room: &Room) -> PgWireResult<()> {
    enc.encode_field(&room.id.to_string())?;
    enc.encode_field(&room.name)?;
    enc.encode_field(&i64::from(room.capacity))?;
    enc.encode_field(&room.location)?;
    enc.encode_field(&room.phone)?;
    enc.encode_field(&i64::from(room.chairs))?;
    enc.encode_field(&room.has_tv)?;
    enc.encode_field(&room.has_monitor)?;
    enc.encode_field(&room.has_board)?;
    enc.encode_field(&room.is_working)
}

fn encode_user(enc: &mut DataRowEncoder, user: &User) -> PgWireResult<()> {
    enc.encode_field(&user.id.to_string())?;
    enc.encode_field(&user.employee_id)?;
    enc.encode_field(&user.name)?;
    enc.encode_field(&user.email)?;
    enc.encode_field(&user.phone)?;
    enc.encode_field(&user.verified)?;
    enc.encode_field(&user.created_at)
}

fn encode_booking(enc: &mut DataRowEncoder, booking: &Booking) -> PgWireResult<()> {
    enc.encode_field(&booking.id.to_string())?;
    enc.encode_field(&booking.room_id.to_string())?;
    enc.encode_field(&booking.owner_id.to_string())?;
    enc.encode_field(&booking.span.start)?;
    enc.encode_field(&booking.span.end)?;
    enc.encode_field(&booking.title)?;
    enc.encode_field(&booking.is_cancelled)?;
    enc.encode_field(&booking.created_at)?;
    enc.encode_field(&booking.updated_at)
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn rooms_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("capacity", Type::INT8),
        field("location", Type::VARCHAR),
        field("phone", Type::VARCHAR),
        field("chairs", Type::INT8),
        field("has_tv", Type::BOOL),
        field("has_monitor", Type::BOOL),
        field("has_board", Type::BOOL),
        field("is_working", Type::BOOL),
    ]
}

fn users_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("employee_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("email", Type::VARCHAR),
        field("phone", Type::VARCHAR),
        field("verified", Type::BOOL),
        field("created_at", Type::INT8),
        field("total_count", Type::INT8),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("room_id", Type::VARCHAR),
        field("owner_id", Type::VARCHAR),
        field("start_time", Type::INT8),
        field("end_time", Type::INT8),
        field("title", Type::VARCHAR),
        field("is_cancelled", Type::BOOL),
        field("created_at", Type::INT8),
        field("updated_at", Type::INT8),
    ]
}

fn owner_bookings_schema() -> Vec<FieldInfo> {
    let mut schema = bookings_schema();
    schema.push(field("room_name", Type::VARCHAR));
    schema.push(field("owner_name", Type::VARCHAR));
    schema.push(field("total_count", Type::INT8));
    schema
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("room_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

/// Result columns for a statement, judged from its text alone since
/// parameters are not bound yet at describe time.
fn describe_schema(statement: &str) -> Vec<FieldInfo> {
    let lower = statement.to_ascii_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    let from = |table: &str| {
        lower.contains(&format!("from {table}")) || lower.contains(&format!("from \"{table}\""))
    };
    if from("availability") {
        availability_schema()
    } else if from("conflicts") {
        bookings_schema()
    } else if from("rooms") {
        rooms_schema()
    } else if from("users") {
        users_schema()
    } else if from("bookings") && lower.contains("owner_id") {
        owner_bookings_schema()
    } else if from("bookings") {
        bookings_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for RoomLedgerHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
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
pub struct RoomLedgerQueryParser;

#[async_trait]
impl QueryParser for RoomLedgerQueryParser {
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

#[async_trait]
impl ExtendedQueryHandler for RoomLedgerHandler {
    type Statement = String;
    type QueryParser = RoomLedgerQueryParser;

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

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
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

/// Inline bound text parameters as quoted literals, highest index first so
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

pub struct RoomLedgerFactory {
    handler: Arc<RoomLedgerHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<PortalAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl RoomLedgerFactory {
    pub fn new(engine: Arc<Engine>, password: String, admin_user: String) -> Self {
        let auth_source = PortalAuthSource::new(engine.clone(), password, admin_user.clone());
        Self {
            handler: Arc::new(RoomLedgerHandler::new(engine, admin_user)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomLedgerFactory {
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
    admin_user: String,
) -> std::io::Result<()> {
    let factory = Arc::new(RoomLedgerFactory::new(engine, password, admin_user));
    pgwire::tokio::process_socket(socket, None, factory).await
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
    let code = e.class().sqlstate();
    let message = match &e {
        EngineError::BookingConflict { conflicts, .. } => {
            match serde_json::to_string(conflicts) {
                Ok(json) => format!("{e}; conflicting bookings: {json}"),
                Err(_) => e.to_string(),
            }
        }
        _ => e.to_string(),
    };
    user_error(code, message)
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
