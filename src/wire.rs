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

use crate::auth::SpotbookAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct SpotbookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SpotbookQueryParser>,
}

impl SpotbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SpotbookQueryParser),
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

    /// The authenticated login name; bookings are owned by it.
    fn resolve_user<C: ClientInfo>(&self, client: &C) -> PgWireResult<String> {
        client
            .metadata()
            .get("user")
            .filter(|u| !u.is_empty())
            .cloned()
            .ok_or_else(|| {
                PgWireError::UserError(Box::new(ErrorInfo::new(
                    "ERROR".into(),
                    "28000".into(),
                    "no user in session".into(),
                )))
            })
    }

    async fn run<C: ClientInfo>(&self, client: &C, sql_text: &str) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let user = self.resolve_user(client)?;
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;

        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(&engine, &user, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        user: &str,
        cmd: Command,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertListing {
                id,
                name,
                total_spots,
                max_guests,
                price_per_night,
            } => {
                engine
                    .create_listing(ListingInfo {
                        id,
                        name,
                        total_spots,
                        max_guests,
                        price_per_night,
                        host: user.to_string(),
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteListing { id } => {
                engine.delete_listing(id, user).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectListings => {
                let schema = Arc::new(listings_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_listings()
                    .iter()
                    .map(|listing| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&listing.id.to_string())?;
                        encoder.encode_field(&listing.name)?;
                        encoder.encode_field(&i64::from(listing.total_spots))?;
                        encoder.encode_field(&i64::from(listing.max_guests))?;
                        encoder.encode_field(&listing.price_per_night)?;
                        encoder.encode_field(&listing.host)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectAvailability {
                listing_id,
                from,
                to,
            } => {
                let range = day_range(from, to)?;
                let nights = engine
                    .nightly_availability(listing_id, range)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let lid = listing_id.to_string();
                let rows: Vec<PgWireResult<_>> = nights
                    .into_iter()
                    .map(|night| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&lid)?;
                        encoder.encode_field(&night.day.to_string())?;
                        encoder.encode_field(&i64::from(night.booked))?;
                        encoder.encode_field(&i64::from(night.remaining))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::InsertBooking {
                listing_id,
                check_in,
                check_out,
                guests,
                total_price,
                returning,
            } => {
                let request = BookingRequest {
                    listing_id,
                    user_id: user.to_string(),
                    range: day_range(check_in, check_out)?,
                    guests,
                    total_price,
                };
                let booking = engine.reserve(request).await.map_err(engine_err)?;
                if returning {
                    let listing = engine.catalog.get(&booking.listing_id);
                    Ok(bookings_response(vec![BookingView { booking, listing }]))
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::CancelBooking { id, returning } => {
                let booking = engine.cancel(id, user).await.map_err(engine_err)?;
                if returning {
                    let listing = engine.catalog.get(&booking.listing_id);
                    Ok(bookings_response(vec![BookingView { booking, listing }]))
                } else {
                    Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
                }
            }
            Command::SelectBookings => Ok(bookings_response(engine.bookings_for_user(user))),
        }
    }
}

fn day_range(from: Day, to: Day) -> PgWireResult<DayRange> {
    DayRange::new(from, to).ok_or_else(|| {
        engine_err(EngineError::Validation(format!(
            "check-out {to} is before check-in {from}"
        )))
    })
}

fn bookings_response(views: Vec<BookingView>) -> Response {
    let schema = Arc::new(bookings_schema());
    let rows: Vec<PgWireResult<_>> = views
        .into_iter()
        .map(|view| {
            let b = &view.booking;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.listing_id.to_string())?;
            encoder.encode_field(&view.listing.as_ref().map(|l| l.name.clone()))?;
            encoder.encode_field(&b.user_id)?;
            encoder.encode_field(&b.range.check_in.to_string())?;
            encoder.encode_field(&b.range.check_out.to_string())?;
            encoder.encode_field(&i64::from(b.guests))?;
            encoder.encode_field(&b.total_price)?;
            encoder.encode_field(&b.status.as_str())?;
            encoder.encode_field(&b.created_at)?;
            encoder.encode_field(&b.cancelled_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn listings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("total_spots", Type::INT8),
        text_field("max_guests", Type::INT8),
        text_field("price_per_night", Type::INT8),
        text_field("host", Type::VARCHAR),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("listing_id", Type::VARCHAR),
        text_field("day", Type::VARCHAR),
        text_field("booked", Type::INT8),
        text_field("remaining", Type::INT8),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("listing_id", Type::VARCHAR),
        text_field("listing_name", Type::VARCHAR),
        text_field("user_id", Type::VARCHAR),
        text_field("check_in", Type::VARCHAR),
        text_field("check_out", Type::VARCHAR),
        text_field("guests", Type::INT8),
        text_field("total_price", Type::INT8),
        text_field("status", Type::VARCHAR),
        text_field("created_at", Type::INT8),
        text_field("cancelled_at", Type::INT8),
    ]
}

/// Row shape a statement will produce, judged from its text since `$n`
/// placeholders keep it from parsing before bind.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let is_select = upper.trim_start().starts_with("SELECT");
    if upper.contains("RETURNING") || (is_select && upper.contains("BOOKINGS")) {
        bookings_schema()
    } else if is_select && upper.contains("AVAILABILITY") {
        availability_schema()
    } else if is_select && upper.contains("LISTINGS") {
        listings_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SpotbookHandler {
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
pub struct SpotbookQueryParser;

#[async_trait]
impl QueryParser for SpotbookQueryParser {
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
impl ExtendedQueryHandler for SpotbookHandler {
    type Statement = String;
    type QueryParser = SpotbookQueryParser;

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
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    max = max.max(n);
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute_text_params(&portal.statement.statement, &params)
}

/// One left-to-right pass: each `$N` outside a string literal is replaced
/// once, and inserted values are never scanned again.
fn substitute_text_params(sql: &str, params: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut chars = sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
            result.push(c);
            continue;
        }
        if c != '$' || in_literal {
            result.push(c);
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while let Some(&(j, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            end = j + 1;
            chars.next();
        }
        let param = sql[start..end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        match param {
            Some(Some(text)) => {
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            Some(None) => result.push_str("NULL"),
            None => result.push_str(&sql[i..end]),
        }
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SpotbookFactory {
    handler: Arc<SpotbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SpotbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SpotbookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, auth_source: SpotbookAuthSource) -> Self {
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SpotbookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SpotbookFactory {
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
    auth_source: SpotbookAuthSource,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(SpotbookFactory::new(tenant_manager, auth_source));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
