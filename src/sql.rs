use rust_decimal::Decimal;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertLot {
        id: Ulid,
        name: String,
        address: String,
        pin_code: String,
        hourly_rate: Decimal,
        capacity: u32,
    },
    UpdateLot {
        id: Ulid,
        patch: LotPatch,
    },
    DeleteLot {
        id: Ulid,
    },
    InsertUser {
        id: Ulid,
        username: String,
        full_name: Option<String>,
    },
    UpdateUser {
        id: Ulid,
        active: bool,
    },
    InsertReservation {
        id: Ulid,
        lot_id: Ulid,
        vehicle_number: String,
        vehicle_model: Option<String>,
    },
    OccupyReservation {
        id: Ulid,
    },
    ReleaseReservation {
        id: Ulid,
    },
    ForceReleaseReservation {
        id: Ulid,
    },
    CancelReservation {
        id: Ulid,
    },
    SelectLots {
        id: Option<Ulid>,
    },
    SelectSpots {
        lot_id: Ulid,
    },
    SelectUsers,
    SelectReservations {
        filter: ReservationFilter,
    },
    SelectEstimate {
        reservation_id: Ulid,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Rows a statement answers with. Every `Command` maps to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    Lots,
    Spots,
    Users,
    Reservations,
    Ticket,
    Receipt,
    Estimate,
    /// Command tag only.
    None,
}

impl Command {
    pub fn result_shape(&self) -> ResultShape {
        match self {
            Command::InsertLot { .. }
            | Command::UpdateLot { .. }
            | Command::DeleteLot { .. }
            | Command::InsertUser { .. }
            | Command::UpdateUser { .. } => ResultShape::None,
            Command::InsertReservation { .. } => ResultShape::Ticket,
            Command::ReleaseReservation { .. } | Command::ForceReleaseReservation { .. } => {
                ResultShape::Receipt
            }
            Command::OccupyReservation { .. }
            | Command::CancelReservation { .. }
            | Command::SelectReservations { .. } => ResultShape::Reservations,
            Command::SelectLots { .. } => ResultShape::Lots,
            Command::SelectSpots { .. } => ResultShape::Spots,
            Command::SelectUsers => ResultShape::Users,
            Command::SelectEstimate { .. } => ResultShape::Estimate,
        }
    }
}

/// Row shape of a statement whose `$N` parameters may not be bound yet.
///
/// Agrees with `parse_sql(..).result_shape()` once the parameters are
/// substituted. A reservation's target status decides between a receipt and
/// a reservation row, so it has to be written as a literal.
pub fn result_shape(sql: &str) -> Result<ResultShape, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Ok(ResultShape::None);
    };

    match stmt {
        Statement::Insert(insert) => match insert_table_name(insert)?.as_str() {
            "reservations" => Ok(ResultShape::Ticket),
            _ => Ok(ResultShape::None),
        },
        Statement::Update {
            table, assignments, ..
        } => {
            if table_factor_name(&table.relation)? != "reservations" {
                return Ok(ResultShape::None);
            }
            let status = assignments.iter().find(|a| match &a.target {
                AssignmentTarget::ColumnName(name) => {
                    object_name_last(name).as_deref() == Some("status")
                }
                AssignmentTarget::Tuple(_) => false,
            });
            let Some(status) = status else {
                return Ok(ResultShape::Reservations);
            };
            if let Some(Value::Placeholder(p)) = extract_value(&status.value) {
                return Err(SqlError::Unsupported(format!(
                    "reservation status must be a literal, not {p}"
                )));
            }
            let s = parse_string(&status.value)?;
            match ReservationStatus::parse(&s) {
                Some(ReservationStatus::Completed) => Ok(ResultShape::Receipt),
                Some(_) => Ok(ResultShape::Reservations),
                None => Err(SqlError::Parse(format!("bad status: {s}"))),
            }
        }
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return Err(SqlError::Unsupported("non-SELECT query".into()));
            };
            let Some(from) = select.from.first() else {
                return Err(SqlError::Parse("SELECT without FROM".into()));
            };
            match table_factor_name(&from.relation)?.as_str() {
                "lots" => Ok(ResultShape::Lots),
                "spots" => Ok(ResultShape::Spots),
                "users" => Ok(ResultShape::Users),
                "reservations" => Ok(ResultShape::Reservations),
                "estimates" => Ok(ResultShape::Estimate),
                other => Err(SqlError::UnknownTable(other.to_string())),
            }
        }
        _ => Ok(ResultShape::None),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Named columns of a single VALUES row. Without a column list the table's
/// declared order applies.
struct Row {
    table: &'static str,
    cells: Vec<(String, Expr)>,
}

impl Row {
    fn get(&self, col: &str) -> Option<&Expr> {
        self.cells.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn require(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }

    fn reject_unknown(&self, known: &[&str]) -> Result<(), SqlError> {
        match self.cells.iter().find(|(c, _)| !known.contains(&c.as_str())) {
            Some((c, _)) => Err(SqlError::UnknownColumn(c.clone())),
            None => Ok(()),
        }
    }
}

const LOT_COLUMNS: &[&str] = &["id", "name", "address", "pin_code", "hourly_rate", "capacity"];
const USER_COLUMNS: &[&str] = &["id", "username", "full_name"];
const RESERVATION_COLUMNS: &[&str] = &["id", "lot_id", "vehicle_number", "vehicle_model"];

fn insert_row(insert: &ast::Insert, table: &'static str, declared: &[&str]) -> Result<Row, SqlError> {
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        declared.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|i| i.value.to_lowercase()).collect()
    };
    // Positional inserts may stop early; missing columns are reported by name.
    let short_positional = insert.columns.is_empty() && values.len() < columns.len();
    if values.len() != columns.len() && !short_positional {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    Ok(Row {
        table,
        cells: columns.into_iter().zip(values).collect(),
    })
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "lots" => {
            let row = insert_row(insert, "lots", LOT_COLUMNS)?;
            row.reject_unknown(LOT_COLUMNS)?;
            Ok(Command::InsertLot {
                id: parse_ulid(row.require("id")?)?,
                name: parse_string(row.require("name")?)?,
                address: parse_string(row.require("address")?)?,
                pin_code: parse_string(row.require("pin_code")?)?,
                hourly_rate: parse_decimal(row.require("hourly_rate")?)?,
                capacity: parse_u32(row.require("capacity")?)?,
            })
        }
        "users" => {
            let row = insert_row(insert, "users", USER_COLUMNS)?;
            row.reject_unknown(USER_COLUMNS)?;
            Ok(Command::InsertUser {
                id: parse_ulid(row.require("id")?)?,
                username: parse_string(row.require("username")?)?,
                full_name: row.get("full_name").map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "reservations" => {
            let row = insert_row(insert, "reservations", RESERVATION_COLUMNS)?;
            row.reject_unknown(RESERVATION_COLUMNS)?;
            Ok(Command::InsertReservation {
                id: parse_ulid(row.require("id")?)?,
                lot_id: parse_ulid(row.require("lot_id")?)?,
                vehicle_number: parse_string(row.require("vehicle_number")?)?,
                vehicle_model: row
                    .get("vehicle_model")
                    .map(parse_string_or_null)
                    .transpose()?
                    .flatten(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;
    let mut sets = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        sets.push((col, &a.value));
    }
    if sets.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }

    match table.as_str() {
        "lots" => {
            let mut patch = LotPatch::default();
            for (col, value) in sets {
                match col.as_str() {
                    "name" => patch.name = Some(parse_string(value)?),
                    "address" => patch.address = Some(parse_string(value)?),
                    "pin_code" => patch.pin_code = Some(parse_string(value)?),
                    "hourly_rate" => patch.hourly_rate = Some(parse_decimal(value)?),
                    "capacity" => patch.capacity = Some(parse_u32(value)?),
                    "active" => patch.active = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnknownColumn(col)),
                }
            }
            Ok(Command::UpdateLot { id, patch })
        }
        "users" => match sets.as_slice() {
            [(col, value)] if col == "active" => Ok(Command::UpdateUser {
                id,
                active: parse_bool(value)?,
            }),
            _ => Err(SqlError::Unsupported("users only support SET active".into())),
        },
        "reservations" => parse_reservation_update(id, &sets),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Reservation updates name a transition rather than edit fields.
fn parse_reservation_update(id: Ulid, sets: &[(String, &Expr)]) -> Result<Command, SqlError> {
    let mut status = None;
    let mut forced = false;
    let mut occupy = false;
    for (col, value) in sets {
        match col.as_str() {
            "status" => {
                let s = parse_string(value)?;
                status = Some(
                    ReservationStatus::parse(&s)
                        .ok_or_else(|| SqlError::Parse(format!("bad status: {s}")))?,
                );
            }
            "forced" => forced = parse_bool(value)?,
            "entry" if is_now(value) => occupy = true,
            "entry" => return Err(SqlError::Unsupported("entry can only be set to now()".into())),
            _ => return Err(SqlError::UnknownColumn(col.clone())),
        }
    }

    match (status, forced, occupy) {
        (None, false, true) => Ok(Command::OccupyReservation { id }),
        (Some(ReservationStatus::Completed), false, false) => Ok(Command::ReleaseReservation { id }),
        (Some(ReservationStatus::Completed), true, false) => {
            Ok(Command::ForceReleaseReservation { id })
        }
        (Some(ReservationStatus::Cancelled), false, false) => Ok(Command::CancelReservation { id }),
        _ => Err(SqlError::Unsupported(
            "reservation transition must be one of: entry = now(), status = 'completed' [, forced = true], status = 'cancelled'".into(),
        )),
    }
}

fn is_now(expr: &Expr) -> bool {
    match expr {
        Expr::Function(f) => object_name_last(&f.name).as_deref() == Some("now"),
        _ => false,
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "lots" => Ok(Command::DeleteLot { id }),
        "reservations" => Err(SqlError::Unsupported(
            "reservations are never deleted; set status = 'cancelled'".into(),
        )),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

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

    match table.as_str() {
        "lots" => {
            let mut id = None;
            for (col, value) in filters {
                match col.as_str() {
                    "id" => id = Some(parse_ulid(value)?),
                    _ => return Err(SqlError::UnknownColumn(col)),
                }
            }
            Ok(Command::SelectLots { id })
        }
        "spots" => {
            let mut lot_id = None;
            for (col, value) in filters {
                match col.as_str() {
                    "lot_id" => lot_id = Some(parse_ulid(value)?),
                    _ => return Err(SqlError::UnknownColumn(col)),
                }
            }
            Ok(Command::SelectSpots {
                lot_id: lot_id.ok_or(SqlError::MissingFilter("lot_id"))?,
            })
        }
        "users" => match filters.first() {
            None => Ok(Command::SelectUsers),
            Some((col, _)) => Err(SqlError::UnknownColumn(col.clone())),
        },
        "reservations" => {
            let mut filter = ReservationFilter::default();
            for (col, value) in filters {
                match col.as_str() {
                    "id" => filter.id = Some(parse_ulid(value)?),
                    "lot_id" => filter.lot_id = Some(parse_ulid(value)?),
                    "user_id" => filter.user_id = Some(parse_ulid(value)?),
                    "status" => {
                        let s = parse_string(value)?;
                        filter.status = Some(
                            ReservationStatus::parse(&s)
                                .ok_or_else(|| SqlError::Parse(format!("bad status: {s}")))?,
                        );
                    }
                    _ => return Err(SqlError::UnknownColumn(col)),
                }
            }
            Ok(Command::SelectReservations { filter })
        }
        "estimates" => {
            let mut reservation_id = None;
            for (col, value) in filters {
                match col.as_str() {
                    "reservation_id" => reservation_id = Some(parse_ulid(value)?),
                    _ => return Err(SqlError::UnknownColumn(col)),
                }
            }
            Ok(Command::SelectEstimate {
                reservation_id: reservation_id.ok_or(SqlError::MissingFilter("reservation_id"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y ...` into column/value pairs.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
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
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
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
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
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
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

/// Money arrives as a numeric literal or a quoted string; both parse exactly.
fn parse_decimal(expr: &Expr) -> Result<Decimal, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse::<Decimal>()
                .map_err(|e| SqlError::Parse(format!("bad decimal {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_decimal(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
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
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing value for {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const LOT: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn id() -> Ulid {
        Ulid::from_string(ID).unwrap()
    }

    #[test]
    fn parse_insert_lot() {
        let sql = format!(
            "INSERT INTO lots (id, name, address, pin_code, hourly_rate, capacity) \
             VALUES ('{ID}', 'Central', '1 Market Street', '560001', 49.50, 12)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertLot {
                id: lot_id,
                name,
                hourly_rate,
                capacity,
                ..
            } => {
                assert_eq!(lot_id, id());
                assert_eq!(name, "Central");
                assert_eq!(hourly_rate, Decimal::new(4950, 2));
                assert_eq!(capacity, 12);
            }
            cmd => panic!("expected InsertLot, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_lot_positional() {
        let sql = format!(
            "INSERT INTO lots VALUES ('{ID}', 'Central', '1 Market Street', '560001', '30', 4)"
        );
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::InsertLot { capacity: 4, .. }
        ));
    }

    #[test]
    fn parse_insert_lot_missing_column() {
        let sql = format!("INSERT INTO lots (id, name) VALUES ('{ID}', 'Central')");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("lots", "address"))
        ));
    }

    #[test]
    fn parse_insert_user_with_null_full_name() {
        let sql = format!("INSERT INTO users (id, username, full_name) VALUES ('{ID}', 'maya', NULL)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertUser {
                id: id(),
                username: "maya".into(),
                full_name: None,
            }
        );
    }

    #[test]
    fn parse_insert_reservation() {
        let sql = format!(
            "INSERT INTO reservations (id, lot_id, vehicle_number) VALUES ('{ID}', '{LOT}', 'KA01AB1234')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertReservation {
                lot_id,
                vehicle_number,
                vehicle_model,
                ..
            } => {
                assert_eq!(lot_id.to_string(), LOT);
                assert_eq!(vehicle_number, "KA01AB1234");
                assert_eq!(vehicle_model, None);
            }
            cmd => panic!("expected InsertReservation, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_rejects_unknown_column() {
        let sql = format!("INSERT INTO users (id, username, email) VALUES ('{ID}', 'maya', 'm@x')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn(c)) if c == "email"));
    }

    #[test]
    fn parse_update_lot_patch() {
        let sql = format!("UPDATE lots SET capacity = 20, hourly_rate = '35.25', active = false WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateLot {
                id: id(),
                patch: LotPatch {
                    capacity: Some(20),
                    hourly_rate: Some(Decimal::new(3525, 2)),
                    active: Some(false),
                    ..Default::default()
                },
            }
        );
    }

    #[test]
    fn parse_update_user_active() {
        let sql = format!("UPDATE users SET active = false WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateUser {
                id: id(),
                active: false
            }
        );
    }

    #[test]
    fn parse_reservation_transitions() {
        let cases = [
            ("entry = now()", Command::OccupyReservation { id: id() }),
            ("status = 'completed'", Command::ReleaseReservation { id: id() }),
            (
                "status = 'completed', forced = true",
                Command::ForceReleaseReservation { id: id() },
            ),
            ("status = 'cancelled'", Command::CancelReservation { id: id() }),
        ];
        for (set, expected) in cases {
            let sql = format!("UPDATE reservations SET {set} WHERE id = '{ID}'");
            assert_eq!(parse_sql(&sql).unwrap(), expected, "{set}");
        }
    }

    #[test]
    fn parse_reservation_transition_rejects_nonsense() {
        for set in ["status = 'active'", "forced = true", "entry = 5", "status = 'cancelled', forced = true"] {
            let sql = format!("UPDATE reservations SET {set} WHERE id = '{ID}'");
            assert!(parse_sql(&sql).is_err(), "{set}");
        }
    }

    #[test]
    fn parse_update_requires_id() {
        assert!(matches!(
            parse_sql("UPDATE lots SET capacity = 3"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_delete_lot() {
        let sql = format!("DELETE FROM lots WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteLot { id: id() });
    }

    #[test]
    fn parse_delete_reservation_is_refused() {
        let sql = format!("DELETE FROM reservations WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_select_lots() {
        assert_eq!(parse_sql("SELECT * FROM lots").unwrap(), Command::SelectLots { id: None });
        let sql = format!("SELECT * FROM lots WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::SelectLots { id: Some(id()) });
    }

    #[test]
    fn parse_select_spots_requires_lot() {
        assert!(matches!(
            parse_sql("SELECT * FROM spots"),
            Err(SqlError::MissingFilter("lot_id"))
        ));
    }

    #[test]
    fn parse_select_reservations_filters() {
        let sql = format!("SELECT * FROM reservations WHERE lot_id = '{LOT}' AND status = 'active'");
        match parse_sql(&sql).unwrap() {
            Command::SelectReservations { filter } => {
                assert_eq!(filter.lot_id.map(|u| u.to_string()).as_deref(), Some(LOT));
                assert_eq!(filter.status, Some(ReservationStatus::Active));
                assert_eq!(filter.id, None);
            }
            cmd => panic!("expected SelectReservations, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_estimate() {
        let sql = format!("SELECT * FROM estimates WHERE reservation_id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectEstimate { reservation_id: id() }
        );
    }

    #[test]
    fn parse_or_filter_is_unsupported() {
        let sql = format!("SELECT * FROM reservations WHERE id = '{ID}' OR lot_id = '{LOT}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }

    /// Bind `$N` the way the wire layer does: quoted text.
    fn bind(sql: &str, params: &[&str]) -> String {
        params
            .iter()
            .enumerate()
            .rev()
            .fold(sql.to_string(), |acc, (i, p)| acc.replace(&format!("${}", i + 1), &format!("'{p}'")))
    }

    #[test]
    fn prepared_shape_matches_executed_shape() {
        let cases: &[(&str, &[&str])] = &[
            ("SELECT * FROM lots", &[]),
            ("SELECT * FROM lots WHERE id = $1", &[ID]),
            ("SELECT * FROM spots WHERE lot_id = $1", &[LOT]),
            ("SELECT * FROM users", &[]),
            ("SELECT * FROM reservations WHERE lot_id = $1", &[LOT]),
            ("SELECT * FROM estimates WHERE reservation_id = $1", &[ID]),
            (
                "INSERT INTO reservations (id, lot_id, vehicle_number) VALUES ($1, $2, $3)",
                &[ID, LOT, "KA01AB1234"],
            ),
            ("UPDATE reservations SET entry = now() WHERE id = $1", &[ID]),
            ("UPDATE reservations SET status = 'completed' WHERE id = $1", &[ID]),
            ("UPDATE reservations SET status = 'completed', forced = $2 WHERE id = $1", &[ID, "true"]),
            ("UPDATE reservations SET status = 'cancelled' WHERE id = $1", &[ID]),
            ("UPDATE lots SET capacity = $2 WHERE id = $1", &[ID, "12"]),
            ("DELETE FROM lots WHERE id = $1", &[ID]),
        ];
        for (sql, params) in cases {
            let prepared = result_shape(sql).unwrap();
            let executed = parse_sql(&bind(sql, params)).unwrap().result_shape();
            assert_eq!(prepared, executed, "{sql}");
        }
    }

    #[test]
    fn placeholder_status_has_no_known_shape() {
        let sql = "UPDATE reservations SET status = $1 WHERE id = $2";
        assert!(matches!(result_shape(sql), Err(SqlError::Unsupported(_))));
        let sql = "UPDATE reservations SET status = 'parked' WHERE id = $1";
        assert!(matches!(result_shape(sql), Err(SqlError::Parse(_))));
        assert_eq!(
            result_shape("UPDATE reservations SET status = 'COMPLETED' WHERE id = $1").unwrap(),
            ResultShape::Receipt
        );
    }
}
