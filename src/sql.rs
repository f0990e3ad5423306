use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

/// Parsed command from SQL input. Values are positional, in the column order
/// documented on each table.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// `doctors (id, name, timezone, consultation_fee, active)`
    InsertDoctor {
        id: Ulid,
        name: Option<String>,
        timezone: String,
        consultation_fee: u64,
        active: bool,
    },
    /// `doctor_updates (id, name, consultation_fee, active)`
    UpdateDoctor {
        id: Ulid,
        name: Option<String>,
        consultation_fee: u64,
        active: bool,
    },
    /// `weekly_hours (doctor_id, weekday, start_time, end_time, is_available)`, one row per day.
    SetWeeklyHours {
        doctor_id: Ulid,
        hours: Vec<WeeklyAvailability>,
    },
    /// `blocked_intervals (id, doctor_id, date, start_time, end_time, reason)`
    InsertBlock {
        doctor_id: Ulid,
        block: BlockedInterval,
    },
    DeleteBlock {
        id: Ulid,
    },
    /// `appointments (id, doctor_id, service_id, patient_id, start, duration, idempotency_key)`
    InsertAppointment {
        id: Ulid,
        doctor_id: Ulid,
        service_id: Ulid,
        patient_id: Ulid,
        start: Ms,
        duration_minutes: u32,
        idempotency_key: Option<String>,
    },
    /// `status_changes (appointment_id, status, reason)`
    InsertStatusChange {
        appointment_id: Ulid,
        status: AppointmentStatus,
        reason: Option<String>,
    },
    /// `reschedules (appointment_id, start)`
    InsertReschedule {
        appointment_id: Ulid,
        start: Ms,
    },
    /// `payments (appointment_id, status, reference)`
    InsertPayment {
        appointment_id: Ulid,
        status: PaymentStatus,
        reference: Option<String>,
    },
    SelectDoctors {
        id: Option<Ulid>,
    },
    SelectWeeklyHours {
        doctor_id: Ulid,
    },
    SelectBlocks {
        doctor_id: Ulid,
    },
    SelectAppointments {
        filter: AppointmentFilter,
    },
    SelectAvailability {
        doctor_id: Ulid,
        date: NaiveDate,
    },
    SelectSlots {
        doctor_id: Ulid,
        date: NaiveDate,
        duration_minutes: i64,
        granularity_minutes: Option<i64>,
    },
}

#[derive(Debug, PartialEq)]
pub enum AppointmentFilter {
    Id(Ulid),
    Doctor { doctor_id: Ulid, date: Option<NaiveDate> },
    Patient(Ulid),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::TooLong);
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;
    if rows.len() > MAX_ROWS_PER_INSERT {
        return Err(SqlError::Parse(format!("at most {MAX_ROWS_PER_INSERT} rows per INSERT")));
    }

    if table == "weekly_hours" {
        return parse_weekly_hours(&rows);
    }
    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }
    let values = &rows[0];

    match table.as_str() {
        "doctors" => {
            require("doctors", values, 1)?;
            Ok(Command::InsertDoctor {
                id: parse_ulid(&values[0])?,
                name: optional(values, 1, parse_string_or_null)?.flatten(),
                timezone: optional(values, 2, parse_string_or_null)?
                    .flatten()
                    .unwrap_or_else(|| "UTC".to_string()),
                consultation_fee: optional(values, 3, parse_u64)?.unwrap_or(0),
                active: optional(values, 4, parse_bool)?.unwrap_or(true),
            })
        }
        "doctor_updates" => {
            require("doctor_updates", values, 4)?;
            Ok(Command::UpdateDoctor {
                id: parse_ulid(&values[0])?,
                name: parse_string_or_null(&values[1])?,
                consultation_fee: parse_u64(&values[2])?,
                active: parse_bool(&values[3])?,
            })
        }
        "blocked_intervals" => {
            require("blocked_intervals", values, 5)?;
            Ok(Command::InsertBlock {
                doctor_id: parse_ulid(&values[1])?,
                block: BlockedInterval {
                    id: parse_ulid(&values[0])?,
                    date: parse_date_expr(&values[2])?,
                    start: parse_time_expr(&values[3])?,
                    end: parse_time_expr(&values[4])?,
                    reason: optional(values, 5, parse_string_or_null)?.flatten(),
                },
            })
        }
        "appointments" => {
            require("appointments", values, 6)?;
            Ok(Command::InsertAppointment {
                id: parse_ulid(&values[0])?,
                doctor_id: parse_ulid(&values[1])?,
                service_id: parse_ulid(&values[2])?,
                patient_id: parse_ulid(&values[3])?,
                start: parse_i64(&values[4])?,
                duration_minutes: parse_u32(&values[5])?,
                idempotency_key: optional(values, 6, parse_string_or_null)?.flatten(),
            })
        }
        "status_changes" => {
            require("status_changes", values, 2)?;
            Ok(Command::InsertStatusChange {
                appointment_id: parse_ulid(&values[0])?,
                status: parse_string(&values[1])?
                    .parse()
                    .map_err(|e: crate::engine::EngineError| SqlError::Parse(e.to_string()))?,
                reason: optional(values, 2, parse_string_or_null)?.flatten(),
            })
        }
        "reschedules" => {
            require("reschedules", values, 2)?;
            Ok(Command::InsertReschedule {
                appointment_id: parse_ulid(&values[0])?,
                start: parse_i64(&values[1])?,
            })
        }
        "payments" => {
            require("payments", values, 2)?;
            Ok(Command::InsertPayment {
                appointment_id: parse_ulid(&values[0])?,
                status: parse_payment_status(&parse_string(&values[1])?)?,
                reference: optional(values, 2, parse_string_or_null)?.flatten(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_weekly_hours(rows: &[Vec<Expr>]) -> Result<Command, SqlError> {
    let mut doctor_id = None;
    let mut hours = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        require("weekly_hours", row, 4)?;
        let at_row = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
        let did = parse_ulid(&row[0]).map_err(at_row)?;
        if *doctor_id.get_or_insert(did) != did {
            return Err(SqlError::Parse("weekly_hours rows must share one doctor_id".into()));
        }
        let weekday = parse_weekday(&parse_string(&row[1]).map_err(at_row)?)
            .map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
        hours.push(WeeklyAvailability {
            weekday,
            start: parse_time_expr(&row[2]).map_err(at_row)?,
            end: parse_time_expr(&row[3]).map_err(at_row)?,
            is_available: optional(row, 4, parse_bool).map_err(at_row)?.unwrap_or(true),
        });
    }
    Ok(Command::SetWeeklyHours {
        doctor_id: doctor_id.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?,
        hours,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = collect_filters(delete.selection.as_ref())?;
    let id = filter_ulid(&filters, "id")?.ok_or(SqlError::MissingFilter("id"))?;

    match table.as_str() {
        "blocked_intervals" => Ok(Command::DeleteBlock { id }),
        "appointments" => Err(SqlError::Unsupported(
            "appointments are never deleted; insert a status change instead".into(),
        )),
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
    let filters = collect_filters(select.selection.as_ref())?;
    let doctor_id = filter_ulid(&filters, "doctor_id")?;
    let need_doctor = || doctor_id.ok_or(SqlError::MissingFilter("doctor_id"));
    let need_date = || filter_date(&filters, "date")?.ok_or(SqlError::MissingFilter("date"));

    match table.as_str() {
        "doctors" => Ok(Command::SelectDoctors { id: filter_ulid(&filters, "id")? }),
        "weekly_hours" => Ok(Command::SelectWeeklyHours { doctor_id: need_doctor()? }),
        "blocked_intervals" => Ok(Command::SelectBlocks { doctor_id: need_doctor()? }),
        "appointments" => {
            let filter = if let Some(id) = filter_ulid(&filters, "id")? {
                AppointmentFilter::Id(id)
            } else if let Some(patient_id) = filter_ulid(&filters, "patient_id")? {
                AppointmentFilter::Patient(patient_id)
            } else if let Some(doctor_id) = doctor_id {
                AppointmentFilter::Doctor { doctor_id, date: filter_date(&filters, "date")? }
            } else {
                return Err(SqlError::MissingFilter("doctor_id, patient_id or id"));
            };
            Ok(Command::SelectAppointments { filter })
        }
        "availability" => Ok(Command::SelectAvailability {
            doctor_id: need_doctor()?,
            date: need_date()?,
        }),
        "slots" => Ok(Command::SelectSlots {
            doctor_id: need_doctor()?,
            date: need_date()?,
            duration_minutes: filter_i64(&filters, "duration")?.ok_or(SqlError::MissingFilter("duration"))?,
            granularity_minutes: filter_i64(&filters, "granularity")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y AND ...` into `(column, value)` pairs.
fn collect_filters(selection: Option<&Expr>) -> Result<Vec<(String, Expr)>, SqlError> {
    fn walk(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
        match expr {
            Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
                walk(left, out)?;
                walk(right, out)
            }
            Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((col, right.as_ref().clone()));
                Ok(())
            }
            Expr::Nested(inner) => walk(inner, out),
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }
    let mut out = Vec::new();
    if let Some(expr) = selection {
        walk(expr, &mut out)?;
    }
    Ok(out)
}

fn find_filter<'a>(filters: &'a [(String, Expr)], column: &str) -> Option<&'a Expr> {
    filters.iter().find(|(c, _)| c == column).map(|(_, e)| e)
}

fn filter_ulid(filters: &[(String, Expr)], column: &str) -> Result<Option<Ulid>, SqlError> {
    find_filter(filters, column).map(parse_ulid).transpose()
}

fn filter_date(filters: &[(String, Expr)], column: &str) -> Result<Option<NaiveDate>, SqlError> {
    find_filter(filters, column).map(parse_date_expr).transpose()
}

fn filter_i64(filters: &[(String, Expr)], column: &str) -> Result<Option<i64>, SqlError> {
    find_filter(filters, column).map(parse_i64).transpose()
}

// ── Helpers ───────────────────────────────────────────────────

fn require(table: &'static str, values: &[Expr], n: usize) -> Result<(), SqlError> {
    if values.len() < n {
        return Err(SqlError::WrongArity(table, n, values.len()));
    }
    Ok(())
}

/// Parse column `i` if the row has it.
fn optional<T>(
    values: &[Expr],
    i: usize,
    parse: impl Fn(&Expr) -> Result<T, SqlError>,
) -> Result<Option<T>, SqlError> {
    values.get(i).map(parse).transpose()
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
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
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
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
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
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
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} must not be negative")))
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

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    parse_date(&parse_string(expr)?).map_err(|e| SqlError::Parse(e.to_string()))
}

fn parse_time_expr(expr: &Expr) -> Result<TimeOfDay, SqlError> {
    parse_string(expr)?
        .parse::<TimeOfDay>()
        .map_err(|e| SqlError::Parse(e.to_string()))
}

fn parse_payment_status(s: &str) -> Result<PaymentStatus, SqlError> {
    match s.trim().to_lowercase().as_str() {
        "pending" => Ok(PaymentStatus::Pending),
        "completed" => Ok(PaymentStatus::Completed),
        "failed" => Ok(PaymentStatus::Failed),
        "refunded" => Ok(PaymentStatus::Refunded),
        _ => Err(SqlError::Parse(format!("unknown payment status: {s:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("query too long")]
    TooLong,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    #[test]
    fn parse_insert_doctor_defaults() {
        let cmd = parse_sql(&format!("INSERT INTO doctors (id) VALUES ('{A}')")).unwrap();
        assert_eq!(
            cmd,
            Command::InsertDoctor {
                id: Ulid::from_string(A).unwrap(),
                name: None,
                timezone: "UTC".into(),
                consultation_fee: 0,
                active: true,
            }
        );
    }

    #[test]
    fn parse_insert_doctor_full() {
        let sql = format!(
            "INSERT INTO doctors (id, name, timezone, consultation_fee, active) VALUES ('{A}', 'Dr. Adeyemi', 'Africa/Lagos', 15000, false)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertDoctor { name, timezone, consultation_fee, active, .. } => {
                assert_eq!(name.as_deref(), Some("Dr. Adeyemi"));
                assert_eq!(timezone, "Africa/Lagos");
                assert_eq!(consultation_fee, 15000);
                assert!(!active);
            }
            cmd => panic!("expected InsertDoctor, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_doctor_update() {
        let sql = format!("INSERT INTO doctor_updates VALUES ('{A}', NULL, 9000, true)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateDoctor {
                id: Ulid::from_string(A).unwrap(),
                name: None,
                consultation_fee: 9000,
                active: true,
            }
        );
    }

    #[test]
    fn parse_weekly_hours_multi_row() {
        let sql = format!(
            "INSERT INTO weekly_hours (doctor_id, weekday, start_time, end_time, is_available) VALUES \
             ('{A}', 'monday', '09:00', '17:00', true), \
             ('{A}', 'Tue', '10:00', '14:30', true), \
             ('{A}', 'sunday', '00:00', '00:00', false)"
        );
        match parse_sql(&sql).unwrap() {
            Command::SetWeeklyHours { doctor_id, hours } => {
                assert_eq!(doctor_id.to_string(), A);
                assert_eq!(hours.len(), 3);
                assert_eq!(hours[0].weekday, chrono::Weekday::Mon);
                assert_eq!(hours[1].end.to_string(), "14:30");
                assert!(!hours[2].is_available);
            }
            cmd => panic!("expected SetWeeklyHours, got {cmd:?}"),
        }
    }

    #[test]
    fn weekly_hours_rows_must_share_doctor() {
        let sql = format!(
            "INSERT INTO weekly_hours VALUES ('{A}', 'monday', '09:00', '17:00'), ('{B}', 'tuesday', '09:00', '17:00')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn weekly_hours_bad_time_rejected() {
        let sql = format!("INSERT INTO weekly_hours VALUES ('{A}', 'monday', '9am', '17:00')");
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_insert_block() {
        let sql = format!(
            "INSERT INTO blocked_intervals VALUES ('{B}', '{A}', '2026-03-16', '12:00', '13:00', 'lunch')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBlock { doctor_id, block } => {
                assert_eq!(doctor_id.to_string(), A);
                assert_eq!(block.id.to_string(), B);
                assert_eq!(block.date, NaiveDate::from_ymd_opt(2026, 3, 16).unwrap());
                assert_eq!(block.start.minutes(), 720);
                assert_eq!(block.reason.as_deref(), Some("lunch"));
            }
            cmd => panic!("expected InsertBlock, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_delete_block() {
        let sql = format!("DELETE FROM blocked_intervals WHERE id = '{B}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::DeleteBlock { id: Ulid::from_string(B).unwrap() }
        );
    }

    #[test]
    fn appointments_cannot_be_deleted() {
        let sql = format!("DELETE FROM appointments WHERE id = '{B}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_insert_appointment() {
        let sql = format!(
            "INSERT INTO appointments (id, doctor_id, service_id, patient_id, start, duration, idempotency_key) \
             VALUES ('{B}', '{A}', '{A}', '{B}', 1773655200000, 45, 'req-42')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertAppointment { start, duration_minutes, idempotency_key, .. } => {
                assert_eq!(start, 1_773_655_200_000);
                assert_eq!(duration_minutes, 45);
                assert_eq!(idempotency_key.as_deref(), Some("req-42"));
            }
            cmd => panic!("expected InsertAppointment, got {cmd:?}"),
        }
    }

    #[test]
    fn appointment_requires_duration() {
        let sql = format!("INSERT INTO appointments VALUES ('{B}', '{A}', '{A}', '{B}', 1000)");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("appointments", 6, 5))));
    }

    #[test]
    fn parse_status_change() {
        let sql = format!("INSERT INTO status_changes VALUES ('{B}', 'cancelled', 'patient request')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertStatusChange {
                appointment_id: Ulid::from_string(B).unwrap(),
                status: AppointmentStatus::Cancelled,
                reason: Some("patient request".into()),
            }
        );
        let bad = format!("INSERT INTO status_changes VALUES ('{B}', 'archived')");
        assert!(parse_sql(&bad).is_err());
    }

    #[test]
    fn parse_reschedule_and_payment() {
        let sql = format!("INSERT INTO reschedules VALUES ('{B}', 1773662400000)");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::InsertReschedule { start: 1_773_662_400_000, .. }));
        let sql = format!("INSERT INTO payments VALUES ('{B}', 'completed', 'pi_9')");
        match parse_sql(&sql).unwrap() {
            Command::InsertPayment { status, reference, .. } => {
                assert_eq!(status, PaymentStatus::Completed);
                assert_eq!(reference.as_deref(), Some("pi_9"));
            }
            cmd => panic!("expected InsertPayment, got {cmd:?}"),
        }
    }

    #[test]
    fn multi_row_appointments_unsupported() {
        let sql = format!(
            "INSERT INTO appointments VALUES ('{B}', '{A}', '{A}', '{B}', 1000, 30), ('{A}', '{A}', '{A}', '{B}', 5000, 30)"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_select_doctors() {
        assert_eq!(parse_sql("SELECT * FROM doctors").unwrap(), Command::SelectDoctors { id: None });
        let sql = format!("SELECT * FROM doctors WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectDoctors { id: Some(Ulid::from_string(A).unwrap()) }
        );
    }

    #[test]
    fn parse_select_appointments_variants() {
        let by_doctor = format!("SELECT * FROM appointments WHERE doctor_id = '{A}' AND date = '2026-03-16'");
        match parse_sql(&by_doctor).unwrap() {
            Command::SelectAppointments { filter: AppointmentFilter::Doctor { date, .. } } => {
                assert_eq!(date, NaiveDate::from_ymd_opt(2026, 3, 16));
            }
            cmd => panic!("expected doctor filter, got {cmd:?}"),
        }
        let by_patient = format!("SELECT * FROM appointments WHERE patient_id = '{B}'");
        assert!(matches!(
            parse_sql(&by_patient).unwrap(),
            Command::SelectAppointments { filter: AppointmentFilter::Patient(_) }
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM appointments"),
            Err(SqlError::MissingFilter(_))
        ));
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!("SELECT * FROM availability WHERE doctor_id = '{A}' AND date = '2026-03-16'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                doctor_id: Ulid::from_string(A).unwrap(),
                date: NaiveDate::from_ymd_opt(2026, 3, 16).unwrap(),
            }
        );
        let missing = format!("SELECT * FROM availability WHERE doctor_id = '{A}'");
        assert!(matches!(parse_sql(&missing), Err(SqlError::MissingFilter("date"))));
    }

    #[test]
    fn parse_select_slots() {
        let sql = format!(
            "SELECT * FROM slots WHERE doctor_id = '{A}' AND date = '2026-03-16' AND duration = 45 AND granularity = 15"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectSlots { duration_minutes, granularity_minutes, .. } => {
                assert_eq!(duration_minutes, 45);
                assert_eq!(granularity_minutes, Some(15));
            }
            cmd => panic!("expected SelectSlots, got {cmd:?}"),
        }
    }

    #[test]
    fn range_filters_rejected() {
        let sql = format!("SELECT * FROM slots WHERE doctor_id = '{A}' AND duration >= 30");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }

    #[test]
    fn oversized_query_rejected() {
        let sql = "x".repeat(MAX_SQL_LEN + 1);
        assert!(matches!(parse_sql(&sql), Err(SqlError::TooLong)));
    }
}
