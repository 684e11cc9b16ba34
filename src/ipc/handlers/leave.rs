//! Leave requests. Student requests are decided by the class teacher of the
//! student's class (or the school); teacher requests only by the school.

use chrono::{Datelike, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::auth::{Principal, Role};
use crate::calc::{self, LeaveRow};
use crate::domain::{LeaveStatus, LeaveType, Requester};
use crate::ipc::helpers::{
    authed, class_teacher_class, get_optional_date, get_optional_i64, get_optional_str,
    get_required_date, get_required_str, new_id, now_rfc3339, parse_date, require_teacher, today,
    HandlerErr,
};
use crate::ipc::types::{AppState, Ctx, Request};

const LEAVE_SELECT: &str = "SELECT lr.id, lr.requester_kind, lr.requester_id,
        COALESCE(st.name, t.name), st.class_id, lr.leave_type, lr.start_date, lr.end_date, lr.reason,
        lr.status, lr.approver_id, lr.approver_kind, lr.rejection_reason, lr.created_at, lr.updated_at
     FROM leave_requests lr
     LEFT JOIN students st ON lr.requester_kind = 'student' AND st.id = lr.requester_id
     LEFT JOIN teachers t ON lr.requester_kind = 'teacher' AND t.id = lr.requester_id";

#[derive(Debug, Clone)]
struct Leave {
    id: String,
    requester: Requester,
    requester_name: Option<String>,
    student_class_id: Option<String>,
    leave_type: String,
    start_date: String,
    end_date: String,
    reason: String,
    status: String,
    approver_id: Option<String>,
    approver_kind: Option<String>,
    rejection_reason: Option<String>,
    created_at: String,
    updated_at: String,
}

impl Leave {
    fn dates(&self) -> Option<(NaiveDate, NaiveDate)> {
        Some((parse_date(&self.start_date)?, parse_date(&self.end_date)?))
    }

    fn status(&self) -> LeaveStatus {
        LeaveStatus::parse(&self.status).unwrap_or(LeaveStatus::Pending)
    }

    fn duration(&self) -> i64 {
        self.dates()
            .map(|(s, e)| calc::leave_duration_days(s, e))
            .unwrap_or(0)
    }

    fn to_row(&self) -> Option<LeaveRow> {
        let (start_date, end_date) = self.dates()?;
        Some(LeaveRow {
            requester_kind: self.requester.kind().to_string(),
            leave_type: self.leave_type.clone(),
            status: self.status(),
            start_date,
            end_date,
        })
    }

    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "requester": {
                "kind": self.requester.kind(),
                "id": self.requester.id(),
                "name": self.requester_name,
                "classId": self.student_class_id,
            },
            "leaveType": self.leave_type,
            "startDate": self.start_date,
            "endDate": self.end_date,
            "duration": self.duration(),
            "reason": self.reason,
            "status": self.status,
            "approver": self.approver_id.as_ref().map(|id| json!({
                "id": id,
                "kind": self.approver_kind,
            })),
            "rejectionReason": self.rejection_reason,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
        })
    }
}

fn leave_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Leave> {
    let kind: String = r.get(1)?;
    let requester_id: String = r.get(2)?;
    let requester = Requester::from_parts(&kind, requester_id).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown requester kind: {}", kind).into(),
        )
    })?;
    Ok(Leave {
        id: r.get(0)?,
        requester,
        requester_name: r.get(3)?,
        student_class_id: r.get(4)?,
        leave_type: r.get(5)?,
        start_date: r.get(6)?,
        end_date: r.get(7)?,
        reason: r.get(8)?,
        status: r.get(9)?,
        approver_id: r.get(10)?,
        approver_kind: r.get(11)?,
        rejection_reason: r.get(12)?,
        created_at: r.get(13)?,
        updated_at: r.get(14)?,
    })
}

fn query_leaves(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Leave>, HandlerErr> {
    let sql = format!(
        "{} WHERE {} ORDER BY lr.created_at DESC, lr.rowid DESC",
        LEAVE_SELECT, filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params, leave_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_leave(conn: &Connection, school_id: &str, id: &str) -> Result<Leave, HandlerErr> {
    let sql = format!("{} WHERE lr.id = ? AND lr.school_id = ?", LEAVE_SELECT);
    conn.query_row(&sql, (id, school_id), leave_row)
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("leave request not found"))
}

fn requester_of(p: &Principal) -> Result<Requester, HandlerErr> {
    Requester::from_principal(p).ok_or_else(|| HandlerErr::forbidden("only students and teachers file leave"))
}

fn get_leave_type(params: &serde_json::Value) -> Result<Option<LeaveType>, HandlerErr> {
    match get_optional_str(params, "leaveType")?.filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(raw) => LeaveType::parse(&raw).map(Some).ok_or_else(|| {
            HandlerErr::bad_params(format!("leaveType must be one of: {}", LeaveType::choices()))
        }),
    }
}

fn check_range(start: NaiveDate, end: NaiveDate) -> Result<(), HandlerErr> {
    if end < start {
        return Err(HandlerErr::bad_params("endDate must not be before startDate"));
    }
    Ok(())
}

fn handle_submit(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let requester = requester_of(p)?;
    let start = get_required_date(params, "startDate")?;
    let end = get_required_date(params, "endDate")?;
    check_range(start, end)?;
    let reason = get_required_str(params, "reason")?;
    let leave_type = get_leave_type(params)?.unwrap_or(LeaveType::Other);

    let id = new_id();
    let now = now_rfc3339();
    ctx.conn.execute(
        "INSERT INTO leave_requests(id, school_id, requester_kind, requester_id, leave_type, start_date,
                                    end_date, reason, status, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            &p.school_id,
            requester.kind(),
            requester.id(),
            leave_type.as_str(),
            start.to_string(),
            end.to_string(),
            &reason,
            LeaveStatus::Pending.as_str(),
            &now,
            &now,
        ],
    )?;
    tracing::info!(leave_id = %id, requester = %requester.id(), kind = requester.kind(), "leave submitted");
    Ok(json!({ "leave": load_leave(ctx.conn, &p.school_id, &id)?.to_json() }))
}

fn handle_my(ctx: &Ctx, p: &Principal, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let requester = requester_of(p)?;
    let leaves = query_leaves(
        ctx.conn,
        "lr.school_id = ? AND lr.requester_kind = ? AND lr.requester_id = ?",
        (&p.school_id, requester.kind(), requester.id()),
    )?;
    let leaves: Vec<serde_json::Value> = leaves.iter().map(Leave::to_json).collect();
    Ok(json!({ "leaves": leaves }))
}

/// The class a teacher decides student leave for, if any.
fn decided_class(ctx: &Ctx, p: &Principal) -> Result<Option<String>, HandlerErr> {
    let teacher = require_teacher(ctx.conn, &p.school_id, &p.id)?;
    Ok(class_teacher_class(&teacher).map(str::to_string))
}

fn handle_pending(ctx: &Ctx, p: &Principal, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let leaves = match p.role {
        Role::School => query_leaves(
            ctx.conn,
            "lr.school_id = ? AND lr.status = 'PENDING'",
            [&p.school_id],
        )?,
        _ => match decided_class(ctx, p)? {
            None => Vec::new(),
            Some(class_id) => query_leaves(
                ctx.conn,
                "lr.school_id = ? AND lr.status = 'PENDING'
                 AND lr.requester_kind = 'student' AND st.class_id = ?",
                (&p.school_id, &class_id),
            )?,
        },
    };
    let leaves: Vec<serde_json::Value> = leaves.iter().map(Leave::to_json).collect();
    Ok(json!({ "leaves": leaves }))
}

fn handle_update_status(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let raw_status = get_required_str(params, "status")?;
    let status = match LeaveStatus::parse(&raw_status) {
        Some(s @ (LeaveStatus::Approved | LeaveStatus::Rejected)) => s,
        _ => return Err(HandlerErr::bad_params("status must be APPROVED or REJECTED")),
    };
    let rejection_reason = get_optional_str(params, "rejectionReason")?.filter(|s| !s.is_empty());
    let leave = load_leave(ctx.conn, &p.school_id, &id)?;

    if p.role == Role::Teacher {
        match &leave.requester {
            Requester::Teacher(_) => {
                return Err(HandlerErr::forbidden(
                    "teacher leave can only be decided by the school",
                ))
            }
            Requester::Student(_) => {
                let mine = decided_class(ctx, p)?;
                if mine.is_none() || mine != leave.student_class_id {
                    return Err(HandlerErr::forbidden(
                        "only the class teacher of this student can decide",
                    ));
                }
            }
        }
    }
    if leave.status() != LeaveStatus::Pending {
        return Err(HandlerErr::conflict(format!(
            "leave request is already {}",
            leave.status
        )));
    }
    if status == LeaveStatus::Rejected && rejection_reason.is_none() {
        return Err(HandlerErr::bad_params("rejectionReason is required when rejecting"));
    }

    // Guarded on PENDING so a decision lands once.
    let n = ctx.conn.execute(
        "UPDATE leave_requests SET status = ?, approver_id = ?, approver_kind = ?,
                                   rejection_reason = ?, updated_at = ?
         WHERE id = ? AND status = 'PENDING'",
        rusqlite::params![
            status.as_str(),
            &p.id,
            p.role.as_str().to_ascii_lowercase(),
            if status == LeaveStatus::Rejected { rejection_reason.as_deref() } else { None },
            now_rfc3339(),
            &id,
        ],
    )?;
    if n == 0 {
        return Err(HandlerErr::conflict("leave request is no longer pending"));
    }
    tracing::info!(leave_id = %id, status = status.as_str(), approver = %p.id, "leave decided");
    Ok(json!({ "leave": load_leave(ctx.conn, &p.school_id, &id)?.to_json() }))
}

fn load_own_pending(ctx: &Ctx, p: &Principal, id: &str) -> Result<Leave, HandlerErr> {
    let requester = requester_of(p)?;
    let leave = load_leave(ctx.conn, &p.school_id, id)?;
    if leave.requester != requester {
        return Err(HandlerErr::forbidden("only the requester can change this leave request"));
    }
    if leave.status() != LeaveStatus::Pending {
        return Err(HandlerErr::conflict("only pending leave requests can be changed"));
    }
    Ok(leave)
}

fn handle_update(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let leave = load_own_pending(ctx, p, &id)?;
    let (cur_start, cur_end) = leave
        .dates()
        .ok_or_else(|| HandlerErr::new("internal", "stored leave dates are malformed"))?;
    let start = get_optional_date(params, "startDate")?.unwrap_or(cur_start);
    let end = get_optional_date(params, "endDate")?.unwrap_or(cur_end);
    check_range(start, end)?;
    let reason = get_optional_str(params, "reason")?;
    if reason.as_deref() == Some("") {
        return Err(HandlerErr::bad_params("reason must not be empty"));
    }
    let leave_type = get_leave_type(params)?.map(|t| t.as_str());

    ctx.conn.execute(
        "UPDATE leave_requests SET start_date = ?, end_date = ?, reason = COALESCE(?, reason),
                                   leave_type = COALESCE(?, leave_type), updated_at = ?
         WHERE id = ?",
        rusqlite::params![
            start.to_string(),
            end.to_string(),
            &reason,
            leave_type,
            now_rfc3339(),
            &id
        ],
    )?;
    Ok(json!({ "leave": load_leave(ctx.conn, &p.school_id, &id)?.to_json() }))
}

fn handle_delete(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    load_own_pending(ctx, p, &id)?;
    ctx.conn.execute("DELETE FROM leave_requests WHERE id = ?", [&id])?;
    Ok(json!({ "deleted": true }))
}

fn get_year(params: &serde_json::Value) -> Result<i32, HandlerErr> {
    match get_optional_i64(params, "year")? {
        None => Ok(today().year()),
        Some(y) if (1900..=9999).contains(&y) => Ok(y as i32),
        Some(_) => Err(HandlerErr::bad_params("year is out of range")),
    }
}

fn handle_analytics(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let year = get_year(params)?;
    let leaves = query_leaves(ctx.conn, "lr.school_id = ?", [&p.school_id])?;
    let rows: Vec<LeaveRow> = leaves.iter().filter_map(Leave::to_row).collect();

    let summary = calc::leave_summary(&rows);
    let trend = calc::leave_monthly_trend(&rows, year);
    let by_requester = calc::distribution_by(&rows, |r| r.requester_kind.as_str());
    let by_type = calc::distribution_by(&rows, |r| r.leave_type.as_str());
    // Already ordered newest first.
    let recent: Vec<serde_json::Value> = leaves.iter().take(5).map(Leave::to_json).collect();

    Ok(json!({
        "year": year,
        "summary": summary,
        "monthlyTrend": trend,
        "byRequesterType": by_requester,
        "byLeaveType": by_type,
        "recent": recent,
    }))
}

fn handle_calendar(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let year = get_year(params)?;
    let month = match get_optional_i64(params, "month")? {
        None => today().month(),
        Some(m) if (1..=12).contains(&m) => m as u32,
        Some(_) => return Err(HandlerErr::bad_params("month must be between 1 and 12")),
    };
    let anchor = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| HandlerErr::bad_params("invalid year/month"))?;
    let (first, last) = calc::month_bounds(anchor);
    let (first, last) = (first.to_string(), last.to_string());

    const WINDOW: &str = "lr.school_id = ? AND lr.status <> 'REJECTED'
         AND lr.start_date <= ? AND lr.end_date >= ?";
    let leaves = match p.role {
        Role::School => query_leaves(ctx.conn, WINDOW, (&p.school_id, &last, &first))?,
        Role::Student => query_leaves(
            ctx.conn,
            &format!("{} AND lr.requester_kind = 'student' AND lr.requester_id = ?", WINDOW),
            (&p.school_id, &last, &first, &p.id),
        )?,
        Role::Teacher => {
            let class_id = decided_class(ctx, p)?;
            query_leaves(
                ctx.conn,
                &format!(
                    "{} AND ((lr.requester_kind = 'teacher' AND lr.requester_id = ?)
                          OR (lr.requester_kind = 'student' AND st.class_id = ?))",
                    WINDOW
                ),
                rusqlite::params![&p.school_id, &last, &first, &p.id, &class_id],
            )?
        }
    };

    let mut leaves: Vec<Leave> = leaves;
    leaves.sort_by(|a, b| a.start_date.cmp(&b.start_date).then_with(|| a.id.cmp(&b.id)));
    let entries: Vec<serde_json::Value> = leaves.iter().map(Leave::to_json).collect();
    Ok(json!({
        "year": year,
        "month": month,
        "startDate": first,
        "endDate": last,
        "leaves": entries,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    const REQUESTERS: &[Role] = &[Role::Student, Role::Teacher];
    const DECIDERS: &[Role] = &[Role::School, Role::Teacher];
    match req.method.as_str() {
        "leave.submit" => Some(authed(state, req, REQUESTERS, handle_submit)),
        "leave.my" => Some(authed(state, req, REQUESTERS, handle_my)),
        "leave.pending" => Some(authed(state, req, DECIDERS, handle_pending)),
        "leave.updateStatus" => Some(authed(state, req, DECIDERS, handle_update_status)),
        "leave.update" => Some(authed(state, req, REQUESTERS, handle_update)),
        "leave.delete" => Some(authed(state, req, REQUESTERS, handle_delete)),
        "leave.analytics" => Some(authed(state, req, &[Role::School], handle_analytics)),
        "leave.calendar" => Some(authed(state, req, &Role::ALL, handle_calendar)),
        _ => None,
    }
}
