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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::LedgerAuthSource;
use crate::engine::{Engine, EngineError, RestockInput, ScheduleChangeInput, TransferFilter, TransferInput};
use crate::model::*;
use crate::observability;
use crate::restock::RestockRequest;
use crate::schedule::{MinuteOfDay, ScheduleChangeRequest};
use crate::transfer::StockTransfer;
use crate::sql::{self, Command, SqlError};

pub struct LedgerHandler {
    engine: Arc<Engine>,
    query_parser: Arc<LedgerQueryParser>,
}

impl LedgerHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(LedgerQueryParser),
        }
    }

    /// Parse and run one statement, recording per-command metrics.
    async fn run(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertProduct {
                id,
                name,
                category,
                price_cents,
                active,
            } => {
                engine
                    .register_product(id, name, category, price_cents, active)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeactivateProduct { id } => {
                engine.set_product_active(id, false).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::InsertBranch { id, code, name, active } => {
                engine
                    .register_branch(id, code, name, active)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeactivateBranch { id } => {
                engine.set_branch_active(id, false).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::SetStock {
                product_id,
                branch_id,
                stock_quantity,
            } => {
                engine
                    .set_stock(product_id, branch_id, stock_quantity)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::SetStockBulk { product_id, entries } => {
                let rows = engine
                    .set_stock_bulk(product_id, entries)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(rows.len()))
            }
            Command::SetThreshold {
                product_id,
                branch_id,
                threshold,
            } => {
                engine
                    .set_low_stock_threshold(product_id, branch_id, threshold)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertReservation {
                id,
                user_id,
                product_id,
                branch_id,
                quantity,
                notes,
                expected_available,
            } => {
                engine
                    .create_bounded(id, user_id, product_id, branch_id, quantity, notes, expected_available)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::ReservationAction {
                reservation_id,
                action,
                actor,
                notes,
            } => {
                engine
                    .transition(reservation_id, &actor, action, notes)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateReservationQuantity {
                reservation_id,
                quantity,
                actor,
            } => {
                engine
                    .update_quantity(reservation_id, &actor, quantity)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertTransfer {
                id,
                product_id,
                from_branch_id,
                to_branch_id,
                quantity,
                reason,
                actor,
            } => {
                let input = TransferInput {
                    product_id,
                    from_branch_id,
                    to_branch_id,
                    quantity,
                    reason,
                };
                engine.request_transfer(id, &actor, input).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::TransferTransition {
                transfer_id,
                action,
                actor,
            } => {
                engine
                    .transition_transfer(transfer_id, &actor, action)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertRestock {
                id,
                product_id,
                branch_id,
                requested_quantity,
                notes,
                actor,
            } => {
                let input = RestockInput {
                    product_id,
                    branch_id,
                    requested_quantity,
                    notes,
                };
                engine.request_restock(id, &actor, input).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::RestockTransition {
                request_id,
                action,
                actor,
            } => {
                engine
                    .transition_restock(request_id, &actor, action)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertScheduleChange {
                id,
                requester_id,
                role,
                branch_id,
                day_of_week,
                start_time,
                end_time,
                reason,
            } => {
                let actor = Actor::new(requester_id, role, Vec::new());
                let input = ScheduleChangeInput {
                    requester_id,
                    role,
                    branch_id,
                    day_of_week,
                    start_time,
                    end_time,
                    reason,
                };
                engine
                    .request_schedule_change(id, &actor, input)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::ReviewScheduleChange {
                request_id,
                decision,
                actor,
                admin_notes,
            } => {
                engine
                    .review_schedule_change(request_id, &actor, decision, admin_notes)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::SelectAvailability { product_id, branch_id } => {
                let by_branch = engine
                    .availability(product_id, branch_id)
                    .await
                    .map_err(engine_err)?;
                let rows = by_branch
                    .into_iter()
                    .map(|(branch, available)| vec![id_cell(product_id), id_cell(branch), int_cell(available)])
                    .collect();
                rows_response(Table::Availability, rows)
            }
            Command::SelectBranchStock { product_id, branch_id } => {
                let rows = engine.branch_stock(product_id, branch_id).await;
                rows_response(Table::BranchStock, rows.iter().map(stock_row).collect())
            }
            Command::SelectLowStock { branch_id } => {
                let rows = engine.low_stock(branch_id).await;
                rows_response(Table::BranchStock, rows.iter().map(stock_row).collect())
            }
            Command::SelectBranchSummary { branch_id } => {
                let s = engine.branch_summary(branch_id).await.map_err(engine_err)?;
                let row = vec![
                    id_cell(branch_id),
                    int_cell(s.total as i64),
                    int_cell(s.in_stock as i64),
                    int_cell(s.low_stock as i64),
                    int_cell(s.out_of_stock as i64),
                ];
                rows_response(Table::BranchSummary, vec![row])
            }
            Command::SelectReservation { id } => {
                let r = engine.get_reservation(id).await.map_err(engine_err)?;
                rows_response(Table::Reservations, vec![reservation_row(&r)])
            }
            Command::SelectReservations { filter } => {
                let list = engine.list_reservations(&filter).await;
                rows_response(Table::Reservations, list.iter().map(reservation_row).collect())
            }
            Command::SelectApprovedTotal { user_id } => {
                let total = engine.approved_total(user_id).await.map_err(engine_err)?;
                rows_response(Table::ApprovedTotals, vec![vec![id_cell(user_id), int_cell(total)]])
            }
            Command::SelectScheduleChanges { status } => {
                let list = engine.list_schedule_changes(status).await;
                rows_response(Table::ScheduleChanges, list.iter().map(schedule_row).collect())
            }
            Command::SelectStaffSchedule { staff_id } => {
                let rows = engine
                    .weekly_schedule(staff_id)
                    .into_iter()
                    .map(|slot| {
                        vec![
                            id_cell(staff_id),
                            int_cell(slot.day_of_week),
                            opt_id_cell(slot.branch_id),
                            time_cell(slot.start_time),
                            time_cell(slot.end_time),
                        ]
                    })
                    .collect();
                rows_response(Table::StaffSchedules, rows)
            }
            Command::SelectTransfer { id } => {
                let t = engine.get_transfer(id).await.map_err(engine_err)?;
                rows_response(Table::Transfers, vec![transfer_row(&t)])
            }
            Command::SelectTransfers {
                status,
                product_id,
                branch_id,
            } => {
                let filter = TransferFilter {
                    status,
                    product_id,
                    branch_id,
                };
                let list = engine.list_transfers(&filter).await;
                rows_response(Table::Transfers, list.iter().map(transfer_row).collect())
            }
            Command::SelectRestock { id } => {
                let r = engine.get_restock(id).await.map_err(engine_err)?;
                rows_response(Table::Restocks, vec![restock_row(&r)])
            }
            Command::SelectRestocks { status, branch_id } => {
                let list = engine.list_restocks(status, branch_id).await;
                rows_response(Table::Restocks, list.iter().map(restock_row).collect())
            }
        }
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn deleted(rows: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(rows))
}

// ── Result sets ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Availability,
    BranchStock,
    BranchSummary,
    Reservations,
    ApprovedTotals,
    ScheduleChanges,
    StaffSchedules,
    Transfers,
    Restocks,
}

impl Table {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "availability" => Table::Availability,
            "branch_stock" | "low_stock" => Table::BranchStock,
            "branch_summary" => Table::BranchSummary,
            "reservations" => Table::Reservations,
            "approved_totals" => Table::ApprovedTotals,
            "schedule_change_requests" => Table::ScheduleChanges,
            "staff_schedules" => Table::StaffSchedules,
            "stock_transfers" => Table::Transfers,
            "restock_requests" => Table::Restocks,
            _ => return None,
        })
    }

    fn columns(self) -> &'static [(&'static str, Type)] {
        match self {
            Table::Availability => &[
                ("product_id", Type::VARCHAR),
                ("branch_id", Type::VARCHAR),
                ("available_quantity", Type::INT8),
            ],
            Table::BranchStock => &[
                ("product_id", Type::VARCHAR),
                ("branch_id", Type::VARCHAR),
                ("stock_quantity", Type::INT8),
                ("reserved_quantity", Type::INT8),
                ("available_quantity", Type::INT8),
                ("low_stock_threshold", Type::INT8),
            ],
            Table::BranchSummary => &[
                ("branch_id", Type::VARCHAR),
                ("total", Type::INT8),
                ("in_stock", Type::INT8),
                ("low_stock", Type::INT8),
                ("out_of_stock", Type::INT8),
            ],
            Table::Reservations => &[
                ("id", Type::VARCHAR),
                ("user_id", Type::VARCHAR),
                ("product_id", Type::VARCHAR),
                ("branch_id", Type::VARCHAR),
                ("quantity", Type::INT8),
                ("status", Type::VARCHAR),
                ("notes", Type::VARCHAR),
                ("admin_notes", Type::VARCHAR),
                ("reserved_at", Type::INT8),
                ("approved_at", Type::INT8),
                ("rejected_at", Type::INT8),
                ("closed_at", Type::INT8),
            ],
            Table::ApprovedTotals => &[("user_id", Type::VARCHAR), ("total_cents", Type::INT8)],
            Table::ScheduleChanges => &[
                ("id", Type::VARCHAR),
                ("requester_id", Type::VARCHAR),
                ("role", Type::VARCHAR),
                ("branch_id", Type::VARCHAR),
                ("day_of_week", Type::INT8),
                ("start_time", Type::VARCHAR),
                ("end_time", Type::VARCHAR),
                ("reason", Type::VARCHAR),
                ("status", Type::VARCHAR),
                ("admin_notes", Type::VARCHAR),
                ("reviewer_id", Type::VARCHAR),
                ("requested_at", Type::INT8),
                ("reviewed_at", Type::INT8),
            ],
            Table::StaffSchedules => &[
                ("staff_id", Type::VARCHAR),
                ("day_of_week", Type::INT8),
                ("branch_id", Type::VARCHAR),
                ("start_time", Type::VARCHAR),
                ("end_time", Type::VARCHAR),
            ],
            Table::Transfers => &[
                ("id", Type::VARCHAR),
                ("product_id", Type::VARCHAR),
                ("from_branch_id", Type::VARCHAR),
                ("to_branch_id", Type::VARCHAR),
                ("quantity", Type::INT8),
                ("reason", Type::VARCHAR),
                ("status", Type::VARCHAR),
                ("requested_by", Type::VARCHAR),
                ("approved_by", Type::VARCHAR),
                ("requested_at", Type::INT8),
                ("approved_at", Type::INT8),
                ("completed_at", Type::INT8),
                ("cancelled_at", Type::INT8),
            ],
            Table::Restocks => &[
                ("id", Type::VARCHAR),
                ("product_id", Type::VARCHAR),
                ("branch_id", Type::VARCHAR),
                ("requested_by", Type::VARCHAR),
                ("current_stock", Type::INT8),
                ("requested_quantity", Type::INT8),
                ("notes", Type::VARCHAR),
                ("status", Type::VARCHAR),
                ("approved_by", Type::VARCHAR),
                ("requested_at", Type::INT8),
                ("approved_at", Type::INT8),
                ("fulfilled_at", Type::INT8),
                ("cancelled_at", Type::INT8),
            ],
        }
    }

    fn schema(self) -> Vec<FieldInfo> {
        self.columns()
            .iter()
            .map(|(name, ty)| FieldInfo::new((*name).into(), None, None, ty.clone(), FieldFormat::Text))
            .collect()
    }
}

/// Result columns for a statement, empty for writes.
fn statement_schema(sql: &str) -> Vec<FieldInfo> {
    sql::select_table(sql)
        .and_then(|t| Table::from_name(&t))
        .map(Table::schema)
        .unwrap_or_default()
}

enum Cell {
    Text(Option<String>),
    Int(Option<i64>),
}

fn id_cell(id: Ulid) -> Cell {
    Cell::Text(Some(id.to_string()))
}

fn opt_id_cell(id: Option<Ulid>) -> Cell {
    Cell::Text(id.map(|i| i.to_string()))
}

fn text_cell(s: impl ToString) -> Cell {
    Cell::Text(Some(s.to_string()))
}

fn int_cell(v: impl Into<i64>) -> Cell {
    Cell::Int(Some(v.into()))
}

fn time_cell(t: Option<MinuteOfDay>) -> Cell {
    Cell::Text(t.map(|t| t.to_string()))
}

fn stock_row(s: &StockInfo) -> Vec<Cell> {
    vec![
        id_cell(s.product_id),
        id_cell(s.branch_id),
        int_cell(s.stock_quantity),
        int_cell(s.reserved_quantity),
        int_cell(s.available_quantity),
        int_cell(s.low_stock_threshold),
    ]
}

fn reservation_row(r: &Reservation) -> Vec<Cell> {
    vec![
        id_cell(r.id),
        id_cell(r.user_id),
        id_cell(r.product_id),
        id_cell(r.branch_id),
        int_cell(r.quantity),
        text_cell(r.status),
        Cell::Text(r.notes.clone()),
        Cell::Text(r.admin_notes.clone()),
        int_cell(r.reserved_at),
        Cell::Int(r.approved_at),
        Cell::Int(r.rejected_at),
        Cell::Int(r.closed_at),
    ]
}

fn schedule_row(r: &ScheduleChangeRequest) -> Vec<Cell> {
    vec![
        id_cell(r.id),
        id_cell(r.requester_id),
        text_cell(r.role),
        opt_id_cell(r.branch_id),
        int_cell(r.day_of_week),
        time_cell(r.start_time),
        time_cell(r.end_time),
        Cell::Text(Some(r.reason.clone())),
        text_cell(r.status),
        Cell::Text(r.admin_notes.clone()),
        opt_id_cell(r.reviewer_id),
        int_cell(r.requested_at),
        Cell::Int(r.reviewed_at),
    ]
}

fn transfer_row(t: &StockTransfer) -> Vec<Cell> {
    vec![
        id_cell(t.id),
        id_cell(t.product_id),
        id_cell(t.from_branch_id),
        id_cell(t.to_branch_id),
        int_cell(t.quantity),
        Cell::Text(t.reason.clone()),
        text_cell(t.status),
        id_cell(t.requested_by),
        opt_id_cell(t.approved_by),
        int_cell(t.requested_at),
        Cell::Int(t.approved_at),
        Cell::Int(t.completed_at),
        Cell::Int(t.cancelled_at),
    ]
}

fn restock_row(r: &RestockRequest) -> Vec<Cell> {
    vec![
        id_cell(r.id),
        id_cell(r.product_id),
        id_cell(r.branch_id),
        id_cell(r.requested_by),
        int_cell(r.current_stock),
        int_cell(r.requested_quantity),
        Cell::Text(r.notes.clone()),
        text_cell(r.status),
        opt_id_cell(r.approved_by),
        int_cell(r.requested_at),
        Cell::Int(r.approved_at),
        Cell::Int(r.fulfilled_at),
        Cell::Int(r.cancelled_at),
    ]
}

fn rows_response(table: Table, rows: Vec<Vec<Cell>>) -> PgWireResult<Response> {
    let schema = Arc::new(table.schema());
    let data: Vec<PgWireResult<_>> = rows
        .into_iter()
        .map(|row| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            for cell in row {
                match cell {
                    Cell::Text(v) => encoder.encode_field(&v)?,
                    Cell::Int(v) => encoder.encode_field(&v)?,
                }
            }
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(data))))
}

#[async_trait]
impl SimpleQueryHandler for LedgerHandler {
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
pub struct LedgerQueryParser;

#[async_trait]
impl QueryParser for LedgerQueryParser {
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
        Ok(statement_schema(stmt))
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
            statement_schema(&target.statement),
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
        )))
    }
}

/// Highest `$N` placeholder outside string literals.
fn count_params(sql: &str) -> usize {
    let mut max = 0;
    map_placeholders(sql, |n| {
        max = max.max(n);
        None
    });
    max
}

/// Walk `sql` once, handing each `$N` outside a `'...'` literal to
/// `on_param`. Its `Some` replaces the placeholder; `None` keeps it as is.
/// Replacement text is never scanned again.
fn map_placeholders(sql: &str, mut on_param: impl FnMut(usize) -> Option<String>) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut in_literal = false;
    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            // A doubled quote inside a literal toggles twice and stays inside.
            in_literal = !in_literal;
        }
        if c != '$' || in_literal {
            out.push(c);
            continue;
        }
        let digits_start = i + 1;
        let mut digits_end = digits_start;
        while let Some(&(j, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            digits_end = j + 1;
            chars.next();
        }
        match sql[digits_start..digits_end].parse::<usize>().ok().and_then(&mut on_param) {
            Some(replacement) => out.push_str(&replacement),
            None => out.push_str(&sql[i..digits_end]),
        }
    }
    out
}

/// Substitute `$1`, `$2`, ... with the bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let values: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute_values(&portal.statement.statement, &values)
}

fn substitute_values(sql: &str, values: &[Option<String>]) -> String {
    map_placeholders(sql, |n| {
        let value = values.get(n.checked_sub(1)?)?;
        Some(match value {
            Some(text) => format!("'{}'", text.replace('\'', "''")),
            None => "NULL".to_string(),
        })
    })
}

// ── Factory ──────────────────────────────────────────────────────

pub struct LedgerFactory {
    handler: Arc<LedgerHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<LedgerAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl LedgerFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = LedgerAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(LedgerHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
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

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<LedgerFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE reported for each engine failure.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InsufficientStock { .. } | EngineError::BelowReserved { .. } => "23514",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::Forbidden(_) => "42501",
        EngineError::NotFound(_) => "P0002",
        EngineError::InvalidTarget(_) => "23503",
        EngineError::DuplicatePending(_) | EngineError::AlreadyExists(_) => "23505",
        EngineError::InvariantViolation(_) => "XX000",
        EngineError::LimitExceeded(_) | EngineError::Invalid(_) => "22023",
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
    let code = match &e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::Unsupported(_) => "0A000",
        _ => "42601",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), e.to_string())))
}
