use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_ACTOR_BRANCHES;
use crate::model::*;
use crate::reservation::Action;
use crate::restock::{RestockAction, RestockStatus};
use crate::schedule::{MinuteOfDay, ScheduleStatus};
use crate::transfer::{TransferAction, TransferStatus};

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProduct {
        id: Ulid,
        name: String,
        category: Option<String>,
        price_cents: i64,
        active: bool,
    },
    DeactivateProduct {
        id: Ulid,
    },
    InsertBranch {
        id: Ulid,
        code: String,
        name: String,
        active: bool,
    },
    DeactivateBranch {
        id: Ulid,
    },
    SetStock {
        product_id: Ulid,
        branch_id: Ulid,
        stock_quantity: u32,
    },
    SetStockBulk {
        product_id: Ulid,
        entries: Vec<(Ulid, u32)>,
    },
    SetThreshold {
        product_id: Ulid,
        branch_id: Ulid,
        threshold: u32,
    },
    InsertReservation {
        id: Ulid,
        user_id: Ulid,
        product_id: Ulid,
        branch_id: Ulid,
        quantity: u32,
        notes: Option<String>,
        expected_available: Option<u32>,
    },
    ReservationAction {
        reservation_id: Ulid,
        action: Action,
        actor: Actor,
        notes: Option<String>,
    },
    UpdateReservationQuantity {
        reservation_id: Ulid,
        quantity: u32,
        actor: Actor,
    },
    InsertTransfer {
        id: Ulid,
        product_id: Ulid,
        from_branch_id: Ulid,
        to_branch_id: Ulid,
        quantity: u32,
        reason: Option<String>,
        actor: Actor,
    },
    TransferTransition {
        transfer_id: Ulid,
        action: TransferAction,
        actor: Actor,
    },
    InsertRestock {
        id: Ulid,
        product_id: Ulid,
        branch_id: Ulid,
        requested_quantity: u32,
        notes: Option<String>,
        actor: Actor,
    },
    RestockTransition {
        request_id: Ulid,
        action: RestockAction,
        actor: Actor,
    },
    InsertScheduleChange {
        id: Ulid,
        requester_id: Ulid,
        role: Role,
        branch_id: Option<Ulid>,
        day_of_week: u8,
        start_time: Option<MinuteOfDay>,
        end_time: Option<MinuteOfDay>,
        reason: String,
    },
    ReviewScheduleChange {
        request_id: Ulid,
        decision: ScheduleStatus,
        actor: Actor,
        admin_notes: Option<String>,
    },
    SelectAvailability {
        product_id: Ulid,
        branch_id: Option<Ulid>,
    },
    SelectBranchStock {
        product_id: Option<Ulid>,
        branch_id: Option<Ulid>,
    },
    SelectBranchSummary {
        branch_id: Ulid,
    },
    SelectLowStock {
        branch_id: Option<Ulid>,
    },
    SelectReservation {
        id: Ulid,
    },
    SelectReservations {
        filter: ReservationFilter,
    },
    SelectApprovedTotal {
        user_id: Ulid,
    },
    SelectScheduleChanges {
        status: Option<ScheduleStatus>,
    },
    SelectStaffSchedule {
        staff_id: Ulid,
    },
    SelectTransfer {
        id: Ulid,
    },
    SelectTransfers {
        status: Option<TransferStatus>,
        product_id: Option<Ulid>,
        branch_id: Option<Ulid>,
    },
    SelectRestock {
        id: Ulid,
    },
    SelectRestocks {
        status: Option<RestockStatus>,
        branch_id: Option<Ulid>,
    },
}

/// Writable tables and the column order assumed when an INSERT names none.
const WRITABLE_TABLES: [(&str, &[&str]); 13] = [
    ("products", &["id", "name", "category", "price_cents", "active"]),
    ("branches", &["id", "code", "name", "active"]),
    ("stock_levels", &["product_id", "branch_id", "stock_quantity"]),
    ("stock_thresholds", &["product_id", "branch_id", "low_stock_threshold"]),
    (
        "reservations",
        &["id", "user_id", "product_id", "branch_id", "quantity", "notes", "expected_available"],
    ),
    (
        "reservation_actions",
        &["reservation_id", "action", "actor_id", "actor_role", "actor_branches", "notes"],
    ),
    (
        "schedule_change_requests",
        &[
            "id",
            "requester_id",
            "role",
            "branch_id",
            "day_of_week",
            "start_time",
            "end_time",
            "reason",
        ],
    ),
    (
        "schedule_change_reviews",
        &["request_id", "decision", "actor_id", "actor_role", "admin_notes"],
    ),
    (
        "reservation_updates",
        &["reservation_id", "quantity", "actor_id", "actor_role", "actor_branches"],
    ),
    (
        "stock_transfers",
        &[
            "id",
            "product_id",
            "from_branch_id",
            "to_branch_id",
            "quantity",
            "reason",
            "actor_id",
            "actor_role",
            "actor_branches",
        ],
    ),
    (
        "transfer_actions",
        &["transfer_id", "action", "actor_id", "actor_role", "actor_branches"],
    ),
    (
        "restock_requests",
        &[
            "id",
            "product_id",
            "branch_id",
            "requested_quantity",
            "notes",
            "actor_id",
            "actor_role",
            "actor_branches",
        ],
    ),
    (
        "restock_actions",
        &["request_id", "action", "actor_id", "actor_role", "actor_branches"],
    ),
];

fn default_columns(table: &str) -> Option<(&'static str, &'static [&'static str])> {
    WRITABLE_TABLES.iter().find(|(t, _)| *t == table).copied()
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table a SELECT reads from, without interpreting its filters. Used to
/// describe statements whose `$n` parameters are not bound yet.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    match stmts.first()? {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => table_factor_name(&select.from.first()?.relation).ok(),
            _ => None,
        },
        _ => None,
    }
}

/// One VALUES tuple addressed by column name.
struct Row<'a> {
    table: &'static str,
    columns: &'a [String],
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.required(column)?)
    }

    fn opt_ulid(&self, column: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.get(column).map_or(Ok(None), parse_ulid_or_null)
    }

    fn u32(&self, column: &'static str) -> Result<u32, SqlError> {
        parse_u32(self.required(column)?)
    }

    fn opt_u32(&self, column: &'static str) -> Result<Option<u32>, SqlError> {
        match self.get(column) {
            None => Ok(None),
            Some(e) if is_null(e) => Ok(None),
            Some(e) => parse_u32(e).map(Some),
        }
    }

    fn text(&self, column: &'static str) -> Result<String, SqlError> {
        parse_string_or_null(self.required(column)?)?.ok_or(SqlError::MissingColumn(self.table, column))
    }

    fn opt_text(&self, column: &'static str) -> Result<Option<String>, SqlError> {
        self.get(column).map_or(Ok(None), parse_string_or_null)
    }

    fn bool_or(&self, column: &'static str, default: bool) -> Result<bool, SqlError> {
        match self.get(column) {
            None => Ok(default),
            Some(e) if is_null(e) => Ok(default),
            Some(e) => parse_bool(e),
        }
    }

    fn opt_time(&self, column: &'static str) -> Result<Option<MinuteOfDay>, SqlError> {
        match self.opt_text(column)? {
            None => Ok(None),
            Some(s) => s
                .parse()
                .map(Some)
                .map_err(|_| SqlError::Parse(format!("{column}: expected HH:MM, got {s}"))),
        }
    }

    fn actor(&self) -> Result<Actor, SqlError> {
        let user_id = self.ulid("actor_id")?;
        let role = self.text("actor_role")?.parse::<Role>().map_err(SqlError::Parse)?;
        let branch_ids = match self.opt_text("actor_branches")? {
            Some(list) => parse_ulid_list(&list)?,
            None => Vec::new(),
        };
        Ok(Actor::new(user_id, role, branch_ids))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (table_name, defaults) = default_columns(&table).ok_or_else(|| SqlError::UnknownTable(table.clone()))?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    let rows = extract_insert_rows(insert)?;
    let row_at = |i: usize| Row {
        table: table_name,
        columns: &columns,
        values: &rows[i],
    };

    match table_name {
        "products" => {
            single_row(table_name, &rows)?;
            let row = row_at(0);
            Ok(Command::InsertProduct {
                id: row.ulid("id")?,
                name: row.text("name")?,
                category: row.opt_text("category")?,
                price_cents: match row.get("price_cents") {
                    Some(e) if !is_null(e) => parse_i64_expr(e)?,
                    _ => 0,
                },
                active: row.bool_or("active", true)?,
            })
        }
        "branches" => {
            single_row(table_name, &rows)?;
            let row = row_at(0);
            Ok(Command::InsertBranch {
                id: row.ulid("id")?,
                code: row.text("code")?,
                name: row.text("name")?,
                active: row.bool_or("active", true)?,
            })
        }
        "stock_levels" => {
            if rows.len() == 1 {
                let row = row_at(0);
                return Ok(Command::SetStock {
                    product_id: row.ulid("product_id")?,
                    branch_id: row.ulid("branch_id")?,
                    stock_quantity: row.u32("stock_quantity")?,
                });
            }
            let mut product_id = None;
            let mut entries = Vec::with_capacity(rows.len());
            for i in 0..rows.len() {
                let row = row_at(i);
                let pid = row.ulid("product_id").map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
                if product_id.is_some_and(|p| p != pid) {
                    return Err(SqlError::Unsupported("bulk stock rows must share one product_id".into()));
                }
                product_id = Some(pid);
                entries.push((
                    row.ulid("branch_id").map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?,
                    row.u32("stock_quantity").map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?,
                ));
            }
            Ok(Command::SetStockBulk {
                product_id: product_id.ok_or(SqlError::Parse("empty VALUES".into()))?,
                entries,
            })
        }
        "stock_thresholds" => {
            single_row(table_name, &rows)?;
            let row = row_at(0);
            Ok(Command::SetThreshold {
                product_id: row.ulid("product_id")?,
                branch_id: row.ulid("branch_id")?,
                threshold: row.u32("low_stock_threshold")?,
            })
        }
        "reservations" => {
            single_row(table_name, &rows)?;
            let row = row_at(0);
            Ok(Command::InsertReservation {
                id: row.ulid("id")?,
                user_id: row.ulid("user_id")?,
                product_id: row.ulid("product_id")?,
                branch_id: row.ulid("branch_id")?,
                quantity: row.u32("quantity")?,
                notes: row.opt_text("notes")?,
                expected_available: row.opt_u32("expected_available")?,
            })
        }
        "reservation_actions" => {
            single_row(table_name, &rows)?;
            let row = row_at(0);
            Ok(Command::ReservationAction {
                reservation_id: row.ulid("reservation_id")?,
                action: row.text("action")?.parse().map_err(SqlError::Parse)?,
                actor: row.actor()?,
                notes: row.opt_text("notes")?,
            })
        }
        "reservation_updates" => {
            single_row(table_name, &rows)?;
            let row = row_at(0);
            Ok(Command::UpdateReservationQuantity {
                reservation_id: row.ulid("reservation_id")?,
                quantity: row.u32("quantity")?,
                actor: row.actor()?,
            })
        }
        "stock_transfers" => {
            single_row(table_name, &rows)?;
            let row = row_at(0);
            Ok(Command::InsertTransfer {
                id: row.ulid("id")?,
                product_id: row.ulid("product_id")?,
                from_branch_id: row.ulid("from_branch_id")?,
                to_branch_id: row.ulid("to_branch_id")?,
                quantity: row.u32("quantity")?,
                reason: row.opt_text("reason")?,
                actor: row.actor()?,
            })
        }
        "transfer_actions" => {
            single_row(table_name, &rows)?;
            let row = row_at(0);
            Ok(Command::TransferTransition {
                transfer_id: row.ulid("transfer_id")?,
                action: row.text("action")?.parse().map_err(SqlError::Parse)?,
                actor: row.actor()?,
            })
        }
        "restock_requests" => {
            single_row(table_name, &rows)?;
            let row = row_at(0);
            Ok(Command::InsertRestock {
                id: row.ulid("id")?,
                product_id: row.ulid("product_id")?,
                branch_id: row.ulid("branch_id")?,
                requested_quantity: row.u32("requested_quantity")?,
                notes: row.opt_text("notes")?,
                actor: row.actor()?,
            })
        }
        "restock_actions" => {
            single_row(table_name, &rows)?;
            let row = row_at(0);
            Ok(Command::RestockTransition {
                request_id: row.ulid("request_id")?,
                action: row.text("action")?.parse().map_err(SqlError::Parse)?,
                actor: row.actor()?,
            })
        }
        "schedule_change_requests" => {
            single_row(table_name, &rows)?;
            let row = row_at(0);
            let day = row.u32("day_of_week")?;
            Ok(Command::InsertScheduleChange {
                id: row.ulid("id")?,
                requester_id: row.ulid("requester_id")?,
                role: row.text("role")?.parse().map_err(SqlError::Parse)?,
                branch_id: row.opt_ulid("branch_id")?,
                day_of_week: u8::try_from(day).map_err(|_| SqlError::Parse(format!("day_of_week {day} out of range")))?,
                start_time: row.opt_time("start_time")?,
                end_time: row.opt_time("end_time")?,
                reason: row.text("reason")?,
            })
        }
        "schedule_change_reviews" => {
            single_row(table_name, &rows)?;
            let row = row_at(0);
            Ok(Command::ReviewScheduleChange {
                request_id: row.ulid("request_id")?,
                decision: row.text("decision")?.parse().map_err(SqlError::Parse)?,
                actor: row.actor()?,
                admin_notes: row.opt_text("admin_notes")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn single_row(table: &'static str, rows: &[Vec<Expr>]) -> Result<(), SqlError> {
    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!("{table} takes one row per statement")));
    }
    Ok(())
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "products" => Ok(Command::DeactivateProduct { id }),
        "branches" => Ok(Command::DeactivateBranch { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let lookup = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| e);
    let ulid_filter = |col: &'static str| -> Result<Option<Ulid>, SqlError> {
        lookup(col).map(parse_ulid_expr).transpose()
    };

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            product_id: ulid_filter("product_id")?.ok_or(SqlError::MissingFilter("product_id"))?,
            branch_id: ulid_filter("branch_id")?,
        }),
        "branch_stock" => Ok(Command::SelectBranchStock {
            product_id: ulid_filter("product_id")?,
            branch_id: ulid_filter("branch_id")?,
        }),
        "branch_summary" => Ok(Command::SelectBranchSummary {
            branch_id: ulid_filter("branch_id")?.ok_or(SqlError::MissingFilter("branch_id"))?,
        }),
        "low_stock" => Ok(Command::SelectLowStock {
            branch_id: ulid_filter("branch_id")?,
        }),
        "reservations" => {
            if let Some(id) = ulid_filter("id")? {
                return Ok(Command::SelectReservation { id });
            }
            let status = match lookup("status") {
                Some(e) => Some(parse_text_expr(e)?.parse::<ReservationStatus>().map_err(SqlError::Parse)?),
                None => None,
            };
            Ok(Command::SelectReservations {
                filter: ReservationFilter {
                    status,
                    branch_id: ulid_filter("branch_id")?,
                    user_id: ulid_filter("user_id")?,
                },
            })
        }
        "approved_totals" => Ok(Command::SelectApprovedTotal {
            user_id: ulid_filter("user_id")?.ok_or(SqlError::MissingFilter("user_id"))?,
        }),
        "schedule_change_requests" => {
            let status = match lookup("status") {
                Some(e) => Some(parse_text_expr(e)?.parse::<ScheduleStatus>().map_err(SqlError::Parse)?),
                None => None,
            };
            Ok(Command::SelectScheduleChanges { status })
        }
        "staff_schedules" => Ok(Command::SelectStaffSchedule {
            staff_id: ulid_filter("staff_id")?.ok_or(SqlError::MissingFilter("staff_id"))?,
        }),
        "stock_transfers" => {
            if let Some(id) = ulid_filter("id")? {
                return Ok(Command::SelectTransfer { id });
            }
            let status = match lookup("status") {
                Some(e) => Some(parse_text_expr(e)?.parse::<TransferStatus>().map_err(SqlError::Parse)?),
                None => None,
            };
            Ok(Command::SelectTransfers {
                status,
                product_id: ulid_filter("product_id")?,
                branch_id: ulid_filter("branch_id")?,
            })
        }
        "restock_requests" => {
            if let Some(id) = ulid_filter("id")? {
                return Ok(Command::SelectRestock { id });
            }
            let status = match lookup("status") {
                Some(e) => Some(parse_text_expr(e)?.parse::<RestockStatus>().map_err(SqlError::Parse)?),
                None => None,
            };
            Ok(Command::SelectRestocks {
                status,
                branch_id: ulid_filter("branch_id")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y ...` into (column, value) pairs.
fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left).ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                out.push((col, right.as_ref().clone()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("WHERE clause {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid_expr(expr).map(Some)
}

/// `'id1,id2'` → ids. Empty string → no branches.
fn parse_ulid_list(list: &str) -> Result<Vec<Ulid>, SqlError> {
    let ids = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}"))))
        .collect::<Result<Vec<_>, _>>()?;
    if ids.len() > MAX_ACTOR_BRANCHES {
        return Err(SqlError::Parse("too many branches in actor claim".into()));
    }
    Ok(ids)
}

fn parse_text_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(n, _)) => Ok(n.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_text_expr(expr).map(Some)
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => {
                s.trim().parse().map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing value for {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
