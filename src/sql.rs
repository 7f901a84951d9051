use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::engine::BulkPayload;
use crate::limits::{MAX_BATCH_SIZE, MAX_IN_CLAUSE_IDS};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertDay {
        id: Id,
        name: String,
        number: u8,
    },
    SetDayActive {
        institution_id: Id,
        day_id: Id,
        active: bool,
    },
    InsertShift {
        id: Id,
        institution_id: Id,
        kind: String,
        program_type: String,
    },
    InsertReference {
        reference: Reference,
    },
    InsertTimeTable {
        id: Id,
        shift_id: Id,
        title: String,
        description: Option<String>,
        start_date: NaiveDate,
        end_date: NaiveDate,
    },
    InsertSlot {
        shift_id: Id,
        input: SlotInput,
    },
    UpdateSlot {
        id: Id,
        patch: SlotPatch,
    },
    DeleteSlot {
        id: Id,
    },
    InsertAllocation {
        input: AllocationInput,
    },
    /// Multi-row allocation INSERT: one payload spread over several days.
    BulkApply {
        time_table_id: Id,
        slot_id: Id,
        section_id: Option<Id>,
        days: Vec<Id>,
        payload: BulkPayload,
        /// day → allocation already occupying it
        existing: HashMap<Id, Id>,
    },
    UpdateAllocation {
        id: Id,
        patch: AllocationPatch,
    },
    DeleteAllocation {
        id: Id,
    },
    BulkRemove {
        ids: Vec<Id>,
    },
    SelectAllocations {
        time_table_id: Id,
    },
    SelectSlots {
        shift_id: Id,
    },
    SelectConflicts {
        time_table_id: Id,
        candidate: Candidate,
        exclude: Option<Id>,
    },
    SelectWorkload {
        teacher_id: Id,
        date: Option<NaiveDate>,
    },
}

/// Columns named in `UPDATE slots SET ...`. Unnamed columns keep their value.
#[derive(Debug, Default, PartialEq)]
pub struct SlotPatch {
    pub code: Option<String>,
    pub name: Option<String>,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub is_practical: Option<bool>,
}

impl SlotPatch {
    pub fn apply(self, slot: &Slot) -> SlotInput {
        SlotInput {
            code: self.code.unwrap_or_else(|| slot.code.clone()),
            name: self.name.unwrap_or_else(|| slot.name.clone()),
            start_time: self.start_time.unwrap_or(slot.start_time),
            end_time: self.end_time.unwrap_or(slot.end_time),
            is_practical: self.is_practical.unwrap_or(slot.is_practical),
        }
    }
}

/// Columns named in `UPDATE allocations SET ...`. The outer `Option` is
/// "was it named", the inner one is the (nullable) new value.
#[derive(Debug, Default, PartialEq)]
pub struct AllocationPatch {
    pub section_id: Option<Option<Id>>,
    pub day_id: Option<Id>,
    pub slot_id: Option<Id>,
    pub teacher_id: Option<Option<Id>>,
    pub room_id: Option<Option<Id>>,
    pub course_id: Option<Option<Id>>,
}

impl AllocationPatch {
    pub fn apply(&self, current: &Allocation) -> AllocationInput {
        AllocationInput {
            time_table_id: current.time_table_id,
            section_id: self.section_id.unwrap_or(current.section_id),
            day_id: self.day_id.unwrap_or(current.day_id),
            slot_id: self.slot_id.unwrap_or(current.slot_id),
            teacher_id: self.teacher_id.unwrap_or(current.teacher_id),
            room_id: self.room_id.unwrap_or(current.room_id),
            course_id: self.course_id.unwrap_or(current.course_id),
        }
    }
}

/// Parse a single statement. Prepared statements carry exactly one.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let stmts = parse_statements(sql)?;
    match stmts.as_slice() {
        [] => Err(SqlError::Empty),
        [stmt] => parse_statement(stmt),
        _ => Err(SqlError::Unsupported(
            "multiple statements in one prepared query".into(),
        )),
    }
}

/// Parse every statement of a simple-query string, in order. Nothing is
/// returned unless all of them parse.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let stmts = parse_statements(sql)?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statements(sql: &str) -> Result<Vec<Statement>, SqlError> {
    let dialect = PostgreSqlDialect {};
    Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Shape of the rows a statement answers with, decided from its structure
/// alone so that statements with `$n` placeholders can be described before
/// they are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// Command tag only.
    None,
    Allocations,
    Slots,
    BulkApply,
    BulkRemove,
    Conflicts,
    Workload,
}

pub fn result_shape(sql: &str) -> ResultShape {
    let dialect = PostgreSqlDialect {};
    let Ok(stmts) = Parser::parse_sql(&dialect, sql) else {
        return ResultShape::None;
    };
    let Some(stmt) = stmts.first() else {
        return ResultShape::None;
    };
    match stmt {
        Statement::Insert(insert) => {
            let rows = match insert.source.as_ref().map(|q| q.body.as_ref()) {
                Some(SetExpr::Values(values)) => values.rows.len(),
                _ => 0,
            };
            match insert_table_name(insert).as_deref() {
                Ok("slots") => ResultShape::Slots,
                Ok("allocations") if rows > 1 => ResultShape::BulkApply,
                Ok("allocations") => ResultShape::Allocations,
                _ => ResultShape::None,
            }
        }
        Statement::Update { table, .. } => match table_factor_name(&table.relation).as_deref() {
            Ok("slots") => ResultShape::Slots,
            Ok("allocations") => ResultShape::Allocations,
            _ => ResultShape::None,
        },
        Statement::Delete(delete) => match (delete_table_name(delete).as_deref(), &delete.selection) {
            (Ok("allocations"), Some(Expr::InList { .. })) => ResultShape::BulkRemove,
            _ => ResultShape::None,
        },
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return ResultShape::None;
            };
            let table = select
                .from
                .first()
                .and_then(|from| table_factor_name(&from.relation).ok());
            match table.as_deref() {
                Some("allocations") => ResultShape::Allocations,
                Some("slots") => ResultShape::Slots,
                Some("conflicts") => ResultShape::Conflicts,
                Some("workload") => ResultShape::Workload,
                _ => ResultShape::None,
            }
        }
        _ => ResultShape::None,
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by column name.
type Row = HashMap<String, Expr>;

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = named_rows(insert)?;

    if table == "allocations" && rows.len() > 1 {
        return parse_bulk_apply(&rows);
    }
    if rows.len() > 1 {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }
    let row = &rows[0];

    match table.as_str() {
        "days" => Ok(Command::InsertDay {
            id: req_id(row, "id")?,
            name: req_str(row, "name")?,
            number: u8::try_from(req_i64(row, "number")?)
                .map_err(|_| SqlError::Parse("day number out of range".into()))?,
        }),
        "institution_days" => Ok(Command::SetDayActive {
            institution_id: req_id(row, "institution_id")?,
            day_id: req_id(row, "day_id")?,
            active: opt_bool(row, "active")?.unwrap_or(true),
        }),
        "shifts" => Ok(Command::InsertShift {
            id: req_id(row, "id")?,
            institution_id: req_id(row, "institution_id")?,
            kind: req_str(row, "kind")?,
            program_type: req_str(row, "program_type")?,
        }),
        "teachers" | "courses" | "rooms" | "sections" => {
            let kind = match table.as_str() {
                "teachers" => RefKind::Teacher,
                "courses" => RefKind::Course,
                "rooms" => RefKind::Room,
                _ => RefKind::Section,
            };
            let program_type = match kind {
                RefKind::Room | RefKind::Section => opt_str(row, "program_type")?,
                _ => None,
            };
            Ok(Command::InsertReference {
                reference: Reference {
                    kind,
                    id: req_id(row, "id")?,
                    institution_id: req_id(row, "institution_id")?,
                    program_type,
                },
            })
        }
        "timetables" => Ok(Command::InsertTimeTable {
            id: req_id(row, "id")?,
            shift_id: req_id(row, "shift_id")?,
            title: req_str(row, "title")?,
            description: opt_str(row, "description")?,
            start_date: req_date(row, "start_date")?,
            end_date: req_date(row, "end_date")?,
        }),
        "slots" => Ok(Command::InsertSlot {
            shift_id: req_id(row, "shift_id")?,
            input: SlotInput {
                code: req_str(row, "code")?,
                name: req_str(row, "name")?,
                start_time: req_time(row, "start_time")?,
                end_time: req_time(row, "end_time")?,
                is_practical: opt_bool(row, "is_practical")?.unwrap_or(false),
            },
        }),
        "allocations" => Ok(Command::InsertAllocation {
            input: AllocationInput {
                time_table_id: req_id(row, "time_table_id")?,
                section_id: opt_id(row, "section_id")?,
                day_id: req_id(row, "day_id")?,
                slot_id: req_id(row, "slot_id")?,
                teacher_id: opt_id(row, "teacher_id")?,
                room_id: opt_id(row, "room_id")?,
                course_id: opt_id(row, "course_id")?,
            },
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Rows must agree on everything but `day_id` and the optional `id` of the
/// allocation already sitting on that day.
fn parse_bulk_apply(rows: &[Row]) -> Result<Command, SqlError> {
    if rows.len() > MAX_BATCH_SIZE {
        return Err(SqlError::LimitExceeded("too many rows in bulk INSERT"));
    }
    let first = &rows[0];
    let shared = |row: &Row| -> Result<(Id, Id, Option<Id>, BulkPayload), SqlError> {
        Ok((
            req_id(row, "time_table_id")?,
            req_id(row, "slot_id")?,
            opt_id(row, "section_id")?,
            BulkPayload {
                teacher_id: opt_id(row, "teacher_id")?,
                room_id: opt_id(row, "room_id")?,
                course_id: opt_id(row, "course_id")?,
            },
        ))
    };
    let (time_table_id, slot_id, section_id, payload) = shared(first)?;

    let mut days = Vec::with_capacity(rows.len());
    let mut existing = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
        if shared(row)? != (time_table_id, slot_id, section_id, payload) {
            return Err(SqlError::Parse(format!(
                "row {i}: bulk rows may differ only in day_id and id"
            )));
        }
        let day_id = req_id(row, "day_id")?;
        if days.contains(&day_id) {
            return Err(SqlError::Parse(format!("row {i}: day {day_id} listed twice")));
        }
        days.push(day_id);
        if let Some(id) = opt_id(row, "id")? {
            existing.insert(day_id, id);
        }
    }

    Ok(Command::BulkApply {
        time_table_id,
        slot_id,
        section_id,
        days,
        payload,
        existing,
    })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    let mut set = Row::new();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            _ => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.insert(column, assignment.value.clone());
    }

    match name.as_str() {
        "slots" => {
            check_columns(&set, &["code", "name", "start_time", "end_time", "is_practical"])?;
            let patch = SlotPatch {
                code: set.contains_key("code").then(|| req_str(&set, "code")).transpose()?,
                name: set.contains_key("name").then(|| req_str(&set, "name")).transpose()?,
                start_time: set
                    .contains_key("start_time")
                    .then(|| req_time(&set, "start_time"))
                    .transpose()?,
                end_time: set
                    .contains_key("end_time")
                    .then(|| req_time(&set, "end_time"))
                    .transpose()?,
                is_practical: opt_bool(&set, "is_practical")?,
            };
            Ok(Command::UpdateSlot { id, patch })
        }
        "allocations" => {
            check_columns(
                &set,
                &["section_id", "day_id", "slot_id", "teacher_id", "room_id", "course_id"],
            )?;
            let nullable = |col: &str| -> Result<Option<Option<Id>>, SqlError> {
                set.contains_key(col).then(|| opt_id(&set, col)).transpose()
            };
            let required = |col: &'static str| -> Result<Option<Id>, SqlError> {
                set.contains_key(col).then(|| req_id(&set, col)).transpose()
            };
            let patch = AllocationPatch {
                section_id: nullable("section_id")?,
                day_id: required("day_id")?,
                slot_id: required("slot_id")?,
                teacher_id: nullable("teacher_id")?,
                room_id: nullable("room_id")?,
                course_id: nullable("course_id")?,
            };
            Ok(Command::UpdateAllocation { id, patch })
        }
        _ => Err(SqlError::UnknownTable(name)),
    }
}

fn check_columns(set: &Row, allowed: &[&str]) -> Result<(), SqlError> {
    match set.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(col) => Err(SqlError::Unsupported(format!("cannot SET {col}"))),
        None => Ok(()),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let selection = delete.selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;

    match (table.as_str(), selection) {
        (
            "allocations",
            Expr::InList {
                expr,
                list,
                negated: false,
            },
        ) if expr_column_name(expr).as_deref() == Some("id") => {
            if list.len() > MAX_IN_CLAUSE_IDS {
                return Err(SqlError::LimitExceeded("too many ids in IN list"));
            }
            let ids = list.iter().map(parse_id_expr).collect::<Result<_, _>>()?;
            Ok(Command::BulkRemove { ids })
        }
        ("allocations", _) => Ok(Command::DeleteAllocation {
            id: extract_where_id(&delete.selection)?,
        }),
        ("slots", _) => Ok(Command::DeleteSlot {
            id: extract_where_id(&delete.selection)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Row::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let need = |col: &'static str| -> Result<Id, SqlError> {
        if filters.contains_key(col) {
            req_id(&filters, col)
        } else {
            Err(SqlError::MissingFilter(col))
        }
    };

    match table.as_str() {
        "allocations" => Ok(Command::SelectAllocations {
            time_table_id: need("time_table_id")?,
        }),
        "slots" => Ok(Command::SelectSlots {
            shift_id: need("shift_id")?,
        }),
        "conflicts" => Ok(Command::SelectConflicts {
            time_table_id: need("time_table_id")?,
            candidate: Candidate {
                day_id: need("day_id")?,
                slot_id: need("slot_id")?,
                teacher_id: opt_id(&filters, "teacher_id")?,
                room_id: opt_id(&filters, "room_id")?,
                section_id: opt_id(&filters, "section_id")?,
            },
            exclude: opt_id(&filters, "exclude_id")?,
        }),
        "workload" => Ok(Command::SelectWorkload {
            teacher_id: need("teacher_id")?,
            date: filters
                .contains_key("date")
                .then(|| req_date(&filters, "date"))
                .transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Gather `column = value` terms joined by AND.
fn collect_eq_filters(expr: &Expr, out: &mut Row) -> Result<(), SqlError> {
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
            out.insert(col, (**right).clone());
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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

/// VALUES rows zipped with the INSERT's column list.
fn named_rows(insert: &ast::Insert) -> Result<Vec<Row>, SqlError> {
    if insert.columns.is_empty() {
        return Err(SqlError::Parse("INSERT needs an explicit column list".into()));
    }
    let columns: Vec<String> = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .collect();
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => values,
        SetExpr::Values(_) => return Err(SqlError::Parse("empty VALUES".into())),
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    values
        .rows
        .iter()
        .map(|row| {
            if row.len() != columns.len() {
                return Err(SqlError::WrongArity(columns.len(), row.len()));
            }
            Ok(columns.iter().cloned().zip(row.iter().cloned()).collect())
        })
        .collect()
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Id, SqlError> {
    match selection.as_ref() {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_id_expr(right),
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

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    match (extract_value(expr), expr) {
        (Some(Value::Number(s, _) | Value::SingleQuotedString(s)), _) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        (
            None,
            Expr::UnaryOp {
                op: ast::UnaryOperator::Minus,
                expr,
            },
        ) => Ok(-parse_i64_expr(expr)?),
        _ => Err(SqlError::Parse(format!("expected integer, got {expr}"))),
    }
}

fn parse_id_expr(expr: &Expr) -> Result<Id, SqlError> {
    let v = parse_i64_expr(expr)?;
    Id::try_from(v).map_err(|_| SqlError::Parse(format!("{v} is not a valid id")))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::DoubleQuotedString(s)) => Ok(s.clone()),
        _ => Err(SqlError::Parse(format!("expected string, got {expr}"))),
    }
}

fn parse_bool_expr(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        _ => Err(SqlError::Parse(format!("expected bool, got {expr}"))),
    }
}

fn parse_time_expr(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveTime::parse_from_str(&s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn column<'a>(row: &'a Row, col: &'static str) -> Result<&'a Expr, SqlError> {
    row.get(col).ok_or(SqlError::MissingColumn(col))
}

fn req_id(row: &Row, col: &'static str) -> Result<Id, SqlError> {
    parse_id_expr(column(row, col)?)
}

fn req_i64(row: &Row, col: &'static str) -> Result<i64, SqlError> {
    parse_i64_expr(column(row, col)?)
}

fn req_str(row: &Row, col: &'static str) -> Result<String, SqlError> {
    parse_string_expr(column(row, col)?)
}

fn req_time(row: &Row, col: &'static str) -> Result<NaiveTime, SqlError> {
    parse_time_expr(column(row, col)?)
}

fn req_date(row: &Row, col: &'static str) -> Result<NaiveDate, SqlError> {
    parse_date_expr(column(row, col)?)
}

/// Missing column and NULL both read as `None`.
fn opt_id(row: &Row, col: &str) -> Result<Option<Id>, SqlError> {
    match row.get(col) {
        None => Ok(None),
        Some(e) if is_null(e) => Ok(None),
        Some(e) => parse_id_expr(e).map(Some),
    }
}

fn opt_str(row: &Row, col: &str) -> Result<Option<String>, SqlError> {
    match row.get(col) {
        None => Ok(None),
        Some(e) if is_null(e) => Ok(None),
        Some(e) => parse_string_expr(e).map(Some),
    }
}

fn opt_bool(row: &Row, col: &str) -> Result<Option<bool>, SqlError> {
    match row.get(col) {
        None => Ok(None),
        Some(e) if is_null(e) => Ok(None),
        Some(e) => parse_bool_expr(e).map(Some),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    /// (columns, values)
    WrongArity(usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    LimitExceeded(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(cols, got) => {
                write!(f, "{cols} columns but {got} values")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for SqlError {}
