use std::collections::HashMap;

use sqlparser::ast::{self, Expr, FromTable, Ident, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::Day;

const LISTING_COLUMNS: &[&str] = &["id", "name", "total_spots", "max_guests", "price_per_night"];
const BOOKING_COLUMNS: &[&str] = &["listing_id", "check_in", "check_out", "guests", "total_price"];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertListing {
        id: Ulid,
        name: String,
        total_spots: u32,
        max_guests: u32,
        price_per_night: i64,
    },
    DeleteListing {
        id: Ulid,
    },
    SelectListings,
    SelectAvailability {
        listing_id: Ulid,
        from: Day,
        to: Day,
    },
    InsertBooking {
        listing_id: Ulid,
        check_in: Day,
        check_out: Day,
        guests: u32,
        total_price: Option<i64>,
        returning: bool,
    },
    /// `DELETE FROM bookings` is a soft delete: the booking becomes cancelled.
    CancelBooking {
        id: Ulid,
        returning: bool,
    },
    /// The caller's own bookings; the user comes from the session, never the query.
    SelectBookings,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_single_row(insert)?;

    match table.as_str() {
        "listings" => {
            let row = bind_columns("listings", &insert.columns, &values, LISTING_COLUMNS)?;
            Ok(Command::InsertListing {
                id: parse_ulid_expr(row.required("id")?)?,
                name: match row.get("name") {
                    Some(e) => parse_string_expr(e)?,
                    None => String::new(),
                },
                total_spots: parse_u32_expr(row.required("total_spots")?)?,
                max_guests: parse_u32_expr(row.required("max_guests")?)?,
                price_per_night: match row.get("price_per_night") {
                    Some(e) => parse_i64_expr(e)?,
                    None => 0,
                },
            })
        }
        "bookings" => {
            let row = bind_columns("bookings", &insert.columns, &values, BOOKING_COLUMNS)?;
            Ok(Command::InsertBooking {
                listing_id: parse_ulid_expr(row.required("listing_id")?)?,
                check_in: parse_day_expr(row.required("check_in")?)?,
                check_out: parse_day_expr(row.required("check_out")?)?,
                guests: parse_u32_expr(row.required("guests")?)?,
                total_price: match row.get("total_price") {
                    Some(e) => parse_i64_or_null(e)?,
                    None => None,
                },
                returning: insert.returning.is_some(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "listings" => Ok(Command::DeleteListing { id }),
        "bookings" => Ok(Command::CancelBooking {
            id,
            returning: delete.returning.is_some(),
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    match table.as_str() {
        "listings" => Ok(Command::SelectListings),
        "bookings" => Ok(Command::SelectBookings),
        "availability" => {
            let mut filters = AvailabilityFilters::default();
            if let Some(selection) = &select.selection {
                filters.collect(selection)?;
            }
            Ok(Command::SelectAvailability {
                listing_id: filters.listing_id.ok_or(SqlError::MissingFilter("listing_id"))?,
                from: filters.from.ok_or(SqlError::MissingFilter("day >="))?,
                to: filters.to.ok_or(SqlError::MissingFilter("day <="))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct AvailabilityFilters {
    listing_id: Option<Ulid>,
    from: Option<Day>,
    to: Option<Day>,
}

impl AvailabilityFilters {
    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner)?,
            Expr::BinaryOp { left, op, right } => match op {
                ast::BinaryOperator::And => {
                    self.collect(left)?;
                    self.collect(right)?;
                }
                ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                    Some("listing_id") => self.listing_id = Some(parse_ulid_expr(right)?),
                    Some("day") => {
                        let day = parse_day_expr(right)?;
                        self.from = Some(day);
                        self.to = Some(day);
                    }
                    _ => {}
                },
                ast::BinaryOperator::GtEq if is_day_column(left) => {
                    self.from = Some(parse_day_expr(right)?);
                }
                ast::BinaryOperator::LtEq if is_day_column(left) => {
                    self.to = Some(parse_day_expr(right)?);
                }
                _ => {}
            },
            Expr::Between { expr, negated: false, low, high } if is_day_column(expr) => {
                self.from = Some(parse_day_expr(low)?);
                self.to = Some(parse_day_expr(high)?);
            }
            _ => {}
        }
        Ok(())
    }
}

fn is_day_column(expr: &Expr) -> bool {
    expr_column_name(expr).as_deref() == Some("day")
}

// ── Helpers ───────────────────────────────────────────────────

/// One VALUES row keyed by column name.
struct BoundRow<'a> {
    table: &'static str,
    values: HashMap<String, &'a Expr>,
}

impl<'a> BoundRow<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.values.get(column).copied()
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

/// Pair values with the explicit column list, or with `default_order` when the
/// INSERT names no columns.
fn bind_columns<'a>(
    table: &'static str,
    columns: &[Ident],
    values: &'a [Expr],
    default_order: &[&str],
) -> Result<BoundRow<'a>, SqlError> {
    let names: Vec<String> = if columns.is_empty() {
        default_order.iter().map(|c| c.to_string()).collect()
    } else {
        columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() > names.len() {
        return Err(SqlError::WrongArity(table, names.len(), values.len()));
    }
    if !columns.is_empty() && values.len() != names.len() {
        return Err(SqlError::WrongArity(table, names.len(), values.len()));
    }
    let mut bound = HashMap::new();
    for (name, value) in names.into_iter().zip(values) {
        if !default_order.contains(&name.as_str()) {
            return Err(SqlError::UnknownColumn(table, name));
        }
        bound.insert(name, value);
    }
    Ok(BoundRow { table, values: bound })
}

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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn extract_single_row(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
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
    match selection.as_ref() {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
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

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_day_expr(expr: &Expr) -> Result<Day, SqlError> {
    let s = parse_string_expr(expr)?;
    Day::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad date: {s}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32_expr(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => Ok(Some(parse_i64_expr(expr)?)),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
