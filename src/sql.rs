use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::service::ReservationRequest;

/// Parsed command from SQL input.
///
/// Dates, times and statuses stay as client text here; the scheduler owns
/// their validation so the error kinds are the same on every path.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// `SELECT * FROM slots WHERE date = '…'`
    SelectSlots { date: String },
    /// `SELECT * FROM capacity WHERE date = '…'`
    SelectCapacity { date: String },
    InsertReservation {
        request: ReservationRequest,
        returning_id: bool,
    },
    SelectReservations {
        date: Option<String>,
        status: Option<String>,
    },
    /// `DELETE FROM reservations WHERE id = '…'` cancels; rows are never removed.
    CancelReservation { id: Ulid },
    UpdateStatus { id: Ulid, status: String },
    SelectStats,
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
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "reservations" {
        return Err(SqlError::UnknownTable(table));
    }

    let values = extract_insert_values(insert)?;
    let [name, phone, service, date, time] = insert_row(&insert.columns, &values)?;
    Ok(Command::InsertReservation {
        request: ReservationRequest {
            name: parse_text(name)?,
            phone: parse_text(phone)?,
            service: parse_text(service)?,
            date: parse_text(date)?,
            time: parse_text(time)?,
        },
        returning_id: insert.returning.is_some(),
    })
}

const INSERT_COLUMNS: [&str; 5] = ["name", "phone", "service", "date", "time"];

/// Order the VALUES row as `INSERT_COLUMNS`. Without a column list the values
/// are positional.
fn insert_row<'a>(columns: &[ast::Ident], values: &'a [Expr]) -> Result<[&'a Expr; 5], SqlError> {
    let arity = if columns.is_empty() { INSERT_COLUMNS.len() } else { columns.len() };
    if values.len() != arity {
        return Err(SqlError::WrongArity("reservations", arity, values.len()));
    }
    if columns.is_empty() {
        return Ok([&values[0], &values[1], &values[2], &values[3], &values[4]]);
    }

    let mut row: [Option<&Expr>; 5] = [None; 5];
    for (column, value) in columns.iter().zip(values) {
        let name = column.value.to_lowercase();
        let slot = INSERT_COLUMNS
            .iter()
            .position(|c| *c == name)
            .ok_or_else(|| SqlError::UnknownColumn(name.clone()))?;
        if row[slot].replace(value).is_some() {
            return Err(SqlError::Parse(format!("column {name} specified more than once")));
        }
    }
    match row {
        [Some(name), Some(phone), Some(service), Some(date), Some(time)] => {
            Ok([name, phone, service, date, time])
        }
        _ => Err(SqlError::WrongArity("reservations", INSERT_COLUMNS.len(), columns.len())),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "reservations" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(&delete.selection)?;
    Ok(Command::CancelReservation { id })
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    if name != "reservations" {
        return Err(SqlError::UnknownTable(name));
    }

    let mut status = None;
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            _ => None,
        };
        match column.as_deref() {
            Some("status") => status = Some(parse_text(&assignment.value)?),
            Some(other) => return Err(SqlError::ReadOnlyColumn(other.to_string())),
            None => return Err(SqlError::Parse("unsupported assignment target".into())),
        }
    }

    Ok(Command::UpdateStatus {
        id: extract_where_id(selection)?,
        status: status.ok_or(SqlError::MissingFilter("status"))?,
    })
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            date: filters.date.ok_or(SqlError::MissingFilter("date"))?,
        }),
        "capacity" => Ok(Command::SelectCapacity {
            date: filters.date.ok_or(SqlError::MissingFilter("date"))?,
        }),
        "reservations" => Ok(Command::SelectReservations {
            date: filters.date,
            status: filters.status,
        }),
        "stats" => Ok(Command::SelectStats),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct Filters {
    date: Option<String>,
    status: Option<String>,
}

/// Collect `col = 'value'` terms joined by AND. Anything else is rejected
/// rather than silently widening the result.
fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, filters),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_filters(left, filters)?;
                extract_filters(right, filters)
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("date") => {
                    filters.date = Some(parse_text(right)?);
                    Ok(())
                }
                Some("status") => {
                    filters.status = Some(parse_text(right)?);
                    Ok(())
                }
                Some(other) => Err(SqlError::UnknownColumn(other.to_string())),
                None => Err(SqlError::Unsupported(format!("filter {expr}"))),
            },
            _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
        },
        _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
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
                parse_ulid_expr(right)
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::InvalidId(format!("{s}: {e}")))
}

/// String literal, or a bare number taken verbatim (phones are often sent unquoted).
fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(Value::Null) => Ok(String::new()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    /// Only `status` may be assigned by UPDATE.
    ReadOnlyColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    InvalidId(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::ReadOnlyColumn(c) => write!(f, "column {c} cannot be updated"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::InvalidId(s) => write!(f, "invalid reservation id {s}"),
        }
    }
}

impl std::error::Error for SqlError {}
