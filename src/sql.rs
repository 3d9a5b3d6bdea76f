use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::BookingRequest;
use crate::model::*;
use crate::notify::Invoice;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertService {
        id: Ulid,
        name: String,
        duration_minutes: Minutes,
        active: bool,
    },
    DeactivateService {
        id: Ulid,
    },
    SelectServices,
    InsertAppointment(BookingRequest),
    Reschedule {
        id: Ulid,
        date: NaiveDate,
        time: TimeOfDay,
    },
    SetStatus {
        id: Ulid,
        status: AppointmentStatus,
        invoice: Option<Invoice>,
    },
    CancelByCustomer {
        code: String,
        contact: Contact,
    },
    SelectAppointments(AppointmentFilter),
    SelectAvailability {
        date: NaiveDate,
        service_ids: Vec<Ulid>,
        exclude: Option<Ulid>,
    },
}

#[derive(Debug, PartialEq)]
pub enum AppointmentFilter {
    OnDate(NaiveDate),
    ById(Ulid),
    ByConfirmation { code: String, contact: Contact },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "services" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("services", 3, values.len()));
            }
            Ok(Command::InsertService {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                duration_minutes: parse_u32(&values[2])?,
                active: match values.get(3) {
                    Some(expr) => parse_bool(expr)?,
                    None => true,
                },
            })
        }
        "appointments" => {
            if values.len() < 9 {
                return Err(SqlError::WrongArity("appointments", 9, values.len()));
            }
            let year = parse_i64(&values[5])?;
            Ok(Command::InsertAppointment(BookingRequest {
                customer: Customer {
                    name: parse_string(&values[0])?,
                    email: parse_string(&values[1])?,
                    phone: parse_string(&values[2])?,
                },
                vehicle: Vehicle {
                    make: parse_string(&values[3])?,
                    model: parse_string(&values[4])?,
                    year: i32::try_from(year)
                        .map_err(|_| SqlError::Parse(format!("{year} out of year range")))?,
                },
                date: parse_date(&values[6])?,
                time: parse_time(&values[7])?,
                service_ids: parse_ulid_list(&values[8])?,
                notes: match values.get(9) {
                    Some(expr) => parse_string_or_null(expr)?,
                    None => None,
                },
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }

    let mut set = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        set.push((column, &assignment.value));
    }
    let filters = where_equalities(selection)?;
    let id = parse_ulid(required(&filters, "id")?)?;

    let moves = lookup(&set, "appointment_date").is_some() || lookup(&set, "appointment_time").is_some();
    if let Some(status) = lookup(&set, "status") {
        if moves {
            return Err(SqlError::Unsupported(
                "status and appointment_date/appointment_time in one UPDATE".into(),
            ));
        }
        let status = parse_string(status)?
            .parse()
            .map_err(SqlError::Parse)?;
        let invoice = match lookup(&set, "invoice") {
            Some(expr) => match parse_string_or_null(expr)? {
                Some(json) => Some(
                    serde_json::from_str(&json)
                        .map_err(|e| SqlError::Parse(format!("bad invoice: {e}")))?,
                ),
                None => None,
            },
            None => None,
        };
        return Ok(Command::SetStatus {
            id,
            status,
            invoice,
        });
    }

    if lookup(&set, "invoice").is_some() {
        return Err(SqlError::Unsupported("invoice without status".into()));
    }
    let date = lookup(&set, "appointment_date").ok_or(SqlError::MissingColumn("appointment_date"))?;
    let time = lookup(&set, "appointment_time").ok_or(SqlError::MissingColumn("appointment_time"))?;
    Ok(Command::Reschedule {
        id,
        date: parse_date(date)?,
        time: parse_time(time)?,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_equalities(delete.selection.as_ref())?;

    match table.as_str() {
        "services" => Ok(Command::DeactivateService {
            id: parse_ulid(required(&filters, "id")?)?,
        }),
        "appointments" => Ok(Command::CancelByCustomer {
            code: parse_string(required(&filters, "confirmation_number")?)?,
            contact: parse_contact(&filters)?,
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
    let filters = where_equalities(select.selection.as_ref())?;

    match table.as_str() {
        "services" => Ok(Command::SelectServices),
        "appointments" => {
            let filter = if let Some(date) = lookup(&filters, "appointment_date") {
                AppointmentFilter::OnDate(parse_date(date)?)
            } else if let Some(id) = lookup(&filters, "id") {
                AppointmentFilter::ById(parse_ulid(id)?)
            } else if let Some(code) = lookup(&filters, "confirmation_number") {
                AppointmentFilter::ByConfirmation {
                    code: parse_string(code)?,
                    contact: parse_contact(&filters)?,
                }
            } else {
                return Err(SqlError::MissingFilter(
                    "appointment_date, id or confirmation_number",
                ));
            };
            Ok(Command::SelectAppointments(filter))
        }
        "availability" => Ok(Command::SelectAvailability {
            date: parse_date(required(&filters, "date")?)?,
            service_ids: parse_ulid_list(required(&filters, "service_ids")?)?,
            exclude: match lookup(&filters, "exclude_id") {
                Some(expr) => parse_ulid_or_null(expr)?,
                None => None,
            },
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clauses ─────────────────────────────────────────────

type Pairs<'a> = Vec<(String, &'a Expr)>;

/// Flatten `a = 1 AND b = 2 ...` into column/value pairs.
fn where_equalities(selection: Option<&Expr>) -> Result<Pairs<'_>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_equalities(expr, &mut out)?;
    }
    Ok(out)
}

fn collect_equalities<'a>(expr: &'a Expr, out: &mut Pairs<'a>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_equalities(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_equalities(left, out)?;
            collect_equalities(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((column, right));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn lookup<'a>(pairs: &[(String, &'a Expr)], column: &str) -> Option<&'a Expr> {
    pairs
        .iter()
        .find(|(name, _)| name == column)
        .map(|(_, expr)| *expr)
}

fn required<'a>(pairs: &[(String, &'a Expr)], column: &'static str) -> Result<&'a Expr, SqlError> {
    lookup(pairs, column).ok_or(SqlError::MissingFilter(column))
}

fn parse_contact(pairs: &[(String, &Expr)]) -> Result<Contact, SqlError> {
    if let Some(email) = lookup(pairs, "customer_email") {
        Ok(Contact::Email(parse_string(email)?))
    } else if let Some(phone) = lookup(pairs, "customer_phone") {
        Ok(Contact::Phone(parse_string(phone)?))
    } else {
        Err(SqlError::MissingFilter("customer_email or customer_phone"))
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid(expr).map(Some),
    }
}

/// `ARRAY['a', 'b']`, `'a,b'` or the Postgres array literal `'{a,b}'`.
fn parse_ulid_list(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    if let Expr::Array(array) = expr {
        return array.elem.iter().map(parse_ulid).collect();
    }
    let text = parse_string(expr)?;
    let text = text.trim().trim_start_matches('{').trim_end_matches('}');
    text.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            Ulid::from_string(part).map_err(|e| SqlError::Parse(format!("bad ULID {part:?}: {e}")))
        })
        .collect()
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    let s = parse_string(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
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

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_time(expr: &Expr) -> Result<TimeOfDay, SqlError> {
    let s = parse_string(expr)?;
    s.parse().map_err(|e: TimeParseError| SqlError::Parse(e.to_string()))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingColumn(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingColumn(col) => write!(f, "missing SET column: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
