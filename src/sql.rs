use chrono::{DateTime, NaiveDateTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, LimitClause, ObjectNamePart, OrderByKind, SetExpr,
    Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom {
        room: Room,
    },
    UpdateRoom {
        id: Ulid,
        patch: RoomPatch,
    },
    DeleteRoom {
        id: Ulid,
    },
    SelectRooms {
        id: Option<Ulid>,
    },
    UpsertUser {
        user: UserUpsert,
    },
    DeleteUser {
        id: Ulid,
    },
    SelectUsers {
        search: Option<String>,
        sort: UserSort,
        pagination: Pagination,
    },
    InsertBooking {
        id: Ulid,
        room_id: Ulid,
        /// `None` means the session user.
        owner_id: Option<Ulid>,
        start: Ms,
        end: Ms,
        title: String,
    },
    /// Missing fields keep the booking's current values.
    UpdateBooking {
        id: Ulid,
        start: Option<Ms>,
        end: Option<Ms>,
        title: Option<String>,
    },
    CancelBooking {
        id: Ulid,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBooking {
        id: Ulid,
    },
    /// Bookings overlapping `range`. Accepts `end_time > a AND start_time < b`,
    /// or the looser `start_time >= a AND end_time <= b`, which is read as the
    /// same overlap window, not as containment.
    SelectRoomBookings {
        room_id: Ulid,
        range: Option<(Ms, Ms)>,
    },
    SelectOwnerBookings {
        owner_id: Ulid,
        sort: BookingSort,
        pagination: Pagination,
    },
    SelectAvailability {
        room_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    },
    SelectConflicts {
        room_id: Ulid,
        start: Ms,
        end: Ms,
        exclude_id: Option<Ulid>,
    },
}

const ROOM_COLUMNS: &[&str] = &[
    "id",
    "name",
    "capacity",
    "location",
    "phone",
    "chairs",
    "has_tv",
    "has_monitor",
    "has_board",
    "is_working",
];
const USER_COLUMNS: &[&str] = &["id", "employee_id", "name", "email", "phone", "verified"];
const BOOKING_COLUMNS: &[&str] = &["id", "room_id", "owner_id", "start_time", "end_time", "title"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
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

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "rooms" => {
            let row = insert_row(insert, "rooms", ROOM_COLUMNS)?;
            let mut room = Room::new(
                parse_ulid(row.required("id")?)?,
                parse_string(row.required("name")?)?,
            );
            if let Some(e) = row.get("capacity") {
                room.capacity = parse_u32(e)?;
            }
            if let Some(e) = row.get("location") {
                room.location = parse_string_or_null(e)?;
            }
            if let Some(e) = row.get("phone") {
                room.phone = parse_string_or_null(e)?;
            }
            if let Some(e) = row.get("chairs") {
                room.chairs = parse_u32(e)?;
            }
            if let Some(e) = row.get("has_tv") {
                room.has_tv = parse_bool(e)?;
            }
            if let Some(e) = row.get("has_monitor") {
                room.has_monitor = parse_bool(e)?;
            }
            if let Some(e) = row.get("has_board") {
                room.has_board = parse_bool(e)?;
            }
            if let Some(e) = row.get("is_working") {
                room.is_working = parse_bool(e)?;
            }
            Ok(Command::InsertRoom { room })
        }
        "users" => {
            let row = insert_row(insert, "users", USER_COLUMNS)?;
            let id = match row.get("id") {
                Some(e) => parse_ulid(e)?,
                None => Ulid::new(),
            };
            let user = UserUpsert {
                id,
                employee_id: row.get("employee_id").map(parse_string_or_null).transpose()?.flatten(),
                name: parse_string(row.required("name")?)?,
                email: parse_string(row.required("email")?)?,
                phone: row.get("phone").map(parse_string_or_null).transpose()?.flatten(),
                verified: row.get("verified").map(parse_bool).transpose()?,
            };
            Ok(Command::UpsertUser { user })
        }
        "bookings" => {
            let row = insert_row(insert, "bookings", BOOKING_COLUMNS)?;
            Ok(Command::InsertBooking {
                id: parse_ulid(row.required("id")?)?,
                room_id: parse_ulid(row.required("room_id")?)?,
                owner_id: row.get("owner_id").map(parse_ulid_or_null).transpose()?.flatten(),
                start: parse_timestamp(row.required("start_time")?)?,
                end: parse_timestamp(row.required("end_time")?)?,
                title: row
                    .get("title")
                    .map(parse_string_or_null)
                    .transpose()?
                    .flatten()
                    .unwrap_or_default(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// One VALUES row keyed by canonical column name.
struct Row<'a> {
    table: &'static str,
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, e)| *e)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

/// `start`/`end` are accepted for the booking time columns.
fn canonical_column(name: &str) -> String {
    match name {
        "start" => "start_time".into(),
        "end" => "end_time".into(),
        other => other.into(),
    }
}

/// Without a column list, values map positionally onto `columns`.
fn insert_row<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    columns: &[&str],
) -> Result<Row<'a>, SqlError> {
    let values = extract_insert_values(insert)?;
    let names: Vec<String> = if insert.columns.is_empty() {
        columns.iter().take(values.len()).map(|c| c.to_string()).collect()
    } else {
        insert
            .columns
            .iter()
            .map(|c| canonical_column(&c.value.to_lowercase()))
            .collect()
    };
    if values.len() != names.len() {
        let expected = if insert.columns.is_empty() { columns.len() } else { names.len() };
        return Err(SqlError::WrongArity(table, expected, values.len()));
    }
    if let Some(unknown) = names.iter().find(|n| !columns.contains(&n.as_str())) {
        return Err(SqlError::UnknownColumn(unknown.clone()));
    }
    Ok(Row {
        table,
        cells: names.into_iter().zip(values.iter()).collect(),
    })
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
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        sets.push((canonical_column(&column), &assignment.value));
    }

    match table.as_str() {
        "rooms" => {
            let mut patch = RoomPatch::default();
            for (column, value) in sets {
                match column.as_str() {
                    "name" => patch.name = Some(parse_string(value)?),
                    "capacity" => patch.capacity = Some(parse_u32(value)?),
                    "location" => patch.location = Some(parse_string_or_null(value)?),
                    "phone" => patch.phone = Some(parse_string_or_null(value)?),
                    "chairs" => patch.chairs = Some(parse_u32(value)?),
                    "has_tv" => patch.has_tv = Some(parse_bool(value)?),
                    "has_monitor" => patch.has_monitor = Some(parse_bool(value)?),
                    "has_board" => patch.has_board = Some(parse_bool(value)?),
                    "is_working" => patch.is_working = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateRoom { id, patch })
        }
        "bookings" => {
            let (mut start, mut end, mut title, mut cancel) = (None, None, None, false);
            for (column, value) in sets {
                match column.as_str() {
                    "start_time" => start = Some(parse_timestamp(value)?),
                    "end_time" => end = Some(parse_timestamp(value)?),
                    "title" => title = Some(parse_string_or_null(value)?.unwrap_or_default()),
                    "is_cancelled" => {
                        if !parse_bool(value)? {
                            return Err(SqlError::Unsupported(
                                "a cancelled booking cannot be restored".into(),
                            ));
                        }
                        cancel = true;
                    }
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            if cancel {
                if start.is_some() || end.is_some() || title.is_some() {
                    return Err(SqlError::Unsupported(
                        "cancel cannot be combined with other changes".into(),
                    ));
                }
                return Ok(Command::CancelBooking { id });
            }
            if start.is_none() && end.is_none() && title.is_none() {
                return Err(SqlError::Parse("UPDATE without changes".into()));
            }
            Ok(Command::UpdateBooking { id, start, end, title })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "rooms" => Ok(Command::DeleteRoom { id }),
        "users" => Ok(Command::DeleteUser { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

/// Column filters collected from a WHERE clause of ANDed comparisons.
#[derive(Default)]
struct Filters<'a> {
    eq: Vec<(String, &'a Expr)>,
    gte: Vec<(String, &'a Expr)>,
    lte: Vec<(String, &'a Expr)>,
    gt: Vec<(String, &'a Expr)>,
    lt: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn collect(expr: &'a Expr, out: &mut Self) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => Self::collect(inner, out),
            Expr::BinaryOp { left, op, right } => {
                let push = |list: &mut Vec<(String, &'a Expr)>| -> Result<(), SqlError> {
                    let col = expr_column_name(left)
                        .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                    list.push((canonical_column(&col), right.as_ref()));
                    Ok(())
                };
                match op {
                    ast::BinaryOperator::And => {
                        Self::collect(left, out)?;
                        Self::collect(right, out)
                    }
                    ast::BinaryOperator::Eq => push(&mut out.eq),
                    ast::BinaryOperator::GtEq => push(&mut out.gte),
                    ast::BinaryOperator::LtEq => push(&mut out.lte),
                    ast::BinaryOperator::Gt => push(&mut out.gt),
                    ast::BinaryOperator::Lt => push(&mut out.lt),
                    other => Err(SqlError::Unsupported(format!("operator {other}"))),
                }
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn find(list: &[(String, &'a Expr)], column: &str) -> Option<&'a Expr> {
        list.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
    }

    fn eq(&self, column: &str) -> Option<&'a Expr> {
        Self::find(&self.eq, column)
    }

    fn gte(&self, column: &str) -> Option<&'a Expr> {
        Self::find(&self.gte, column)
    }

    fn lte(&self, column: &str) -> Option<&'a Expr> {
        Self::find(&self.lte, column)
    }

    /// `end_time > a AND start_time < b`: the overlap test spelled out.
    fn overlap_window(&self) -> Result<Option<(Ms, Ms)>, SqlError> {
        let after = Self::find(&self.gt, "end_time");
        let before = Self::find(&self.lt, "start_time");
        match (after, before) {
            (None, None) => Ok(None),
            (Some(a), Some(b)) => Ok(Some((parse_timestamp(a)?, parse_timestamp(b)?))),
            (Some(_), None) => Err(SqlError::MissingFilter("start_time <")),
            (None, Some(_)) => Err(SqlError::MissingFilter("end_time >")),
        }
    }

    /// `start >= a AND "end" <= b` as a required window.
    fn window(&self) -> Result<(Ms, Ms), SqlError> {
        let start = self.gte("start_time").ok_or(SqlError::MissingFilter("start"))?;
        let end = self.lte("end_time").ok_or(SqlError::MissingFilter("end"))?;
        Ok((parse_timestamp(start)?, parse_timestamp(end)?))
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        Filters::collect(selection, &mut filters)?;
    }

    match table.as_str() {
        "rooms" => Ok(Command::SelectRooms {
            id: filters.eq("id").map(parse_ulid).transpose()?,
        }),
        "users" => {
            let (sort_column, ascending) = order_by(query)?;
            let field = sort_column
                .as_deref()
                .map(UserSortField::parse)
                .unwrap_or_default();
            let order = match ascending {
                Some(false) => SortOrder::Desc,
                _ => SortOrder::Asc,
            };
            Ok(Command::SelectUsers {
                search: filters.eq("search").map(parse_string).transpose()?,
                sort: UserSort { field, order },
                pagination: pagination(query)?,
            })
        }
        "bookings" => {
            if let Some(id) = filters.eq("id") {
                return Ok(Command::SelectBooking { id: parse_ulid(id)? });
            }
            if let Some(room_id) = filters.eq("room_id") {
                let range = match filters.overlap_window()? {
                    Some(window) => Some(window),
                    None => match (filters.gte("start_time"), filters.lte("end_time")) {
                        (None, None) => None,
                        _ => Some(filters.window()?),
                    },
                };
                return Ok(Command::SelectRoomBookings {
                    room_id: parse_ulid(room_id)?,
                    range,
                });
            }
            let owner_id = filters
                .eq("owner_id")
                .ok_or(SqlError::MissingFilter("room_id or owner_id"))?;
            let (sort_column, ascending) = order_by(query)?;
            let order = match ascending {
                Some(true) => SortOrder::Asc,
                Some(false) => SortOrder::Desc,
                None => SortOrder::default(),
            };
            Ok(Command::SelectOwnerBookings {
                owner_id: parse_ulid(owner_id)?,
                sort: BookingSort {
                    field: sort_column
                        .as_deref()
                        .map(BookingSortField::parse)
                        .unwrap_or_default(),
                    order,
                },
                pagination: pagination(query)?,
            })
        }
        "availability" => {
            let (start, end) = filters.window()?;
            Ok(Command::SelectAvailability {
                room_id: parse_ulid(filters.eq("room_id").ok_or(SqlError::MissingFilter("room_id"))?)?,
                start,
                end,
                min_duration: filters.eq("min_duration").map(parse_i64).transpose()?,
            })
        }
        "conflicts" => {
            let (start, end) = filters.window()?;
            Ok(Command::SelectConflicts {
                room_id: parse_ulid(filters.eq("room_id").ok_or(SqlError::MissingFilter("room_id"))?)?,
                start,
                end,
                exclude_id: filters.eq("exclude_id").map(parse_ulid_or_null).transpose()?.flatten(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// First ORDER BY column (unvalidated; the sort enums allow-list it) and
/// its explicit direction, if any.
fn order_by(query: &ast::Query) -> Result<(Option<String>, Option<bool>), SqlError> {
    let Some(order_by) = &query.order_by else {
        return Ok((None, None));
    };
    match &order_by.kind {
        OrderByKind::Expressions(exprs) => match exprs.first() {
            Some(first) => Ok((expr_column_name(&first.expr), first.options.asc)),
            None => Ok((None, None)),
        },
        OrderByKind::All(_) => Err(SqlError::Unsupported("ORDER BY ALL".into())),
    }
}

fn pagination(query: &ast::Query) -> Result<Pagination, SqlError> {
    let (limit, offset) = match &query.limit_clause {
        None => (None, None),
        Some(LimitClause::LimitOffset { limit, offset, .. }) => (
            limit.as_ref().map(parse_usize).transpose()?,
            offset.as_ref().map(|o| parse_usize(&o.value)).transpose()?,
        ),
        Some(LimitClause::OffsetCommaLimit { offset, limit }) => {
            (Some(parse_usize(limit)?), Some(parse_usize(offset)?))
        }
    };
    Ok(Pagination::new(offset, limit))
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

fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.as_slice()),
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
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_usize(expr: &Expr) -> Result<usize, SqlError> {
    let v = parse_i64(expr)?;
    usize::try_from(v).map_err(|_| SqlError::Parse(format!("{v} must not be negative")))
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

/// Unix milliseconds, or an RFC 3339 / `YYYY-MM-DDTHH:MM[:SS]` string read as UTC.
fn parse_timestamp(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => parse_timestamp_str(s),
        _ => parse_i64(expr),
    }
}

pub fn parse_timestamp_str(s: &str) -> Result<Ms, SqlError> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(naive.and_utc().timestamp_millis());
        }
    }
    Err(SqlError::Parse(format!("bad timestamp: {s}")))
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
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
