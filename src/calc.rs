use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::domain::{AttendanceStatus, LeaveStatus, TeacherAttendanceStatus};

/// Round half away from zero to `dp` decimal places.
pub fn round_to(x: f64, dp: i32) -> f64 {
    let f = 10f64.powi(dp);
    (x * f).round() / f
}

/// Half-open interval overlap: `[a_start, a_end)` vs `[b_start, b_end)`.
/// Touching intervals do not overlap.
pub fn intervals_overlap<T: PartialOrd>(a_start: T, a_end: T, b_start: T, b_end: T) -> bool {
    a_start < b_end && a_end > b_start
}

pub fn result_percentage(marks: f64, max_marks: f64) -> f64 {
    if max_marks <= 0.0 {
        return 0.0;
    }
    round_to(marks / max_marks * 100.0, 2)
}

/// Inclusive day count; 0 when `end < start`.
pub fn leave_duration_days(start: NaiveDate, end: NaiveDate) -> i64 {
    let diff = (end - start).num_days();
    if diff < 0 {
        0
    } else {
        diff + 1
    }
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    match (
        NaiveDate::from_ymd_opt(year, month, 1),
        NaiveDate::from_ymd_opt(next_year, next_month, 1),
    ) {
        (Some(first), Some(next)) => (next - first).num_days() as u32,
        _ => 0,
    }
}

/// First and last calendar day of the month containing `date`.
pub fn month_bounds(date: NaiveDate) -> (NaiveDate, NaiveDate) {
    let first = date.with_day(1).unwrap_or(date);
    let last = date
        .with_day(days_in_month(date.year(), date.month()))
        .unwrap_or(date);
    (first, last)
}

/// Monthly rollup percentage: present days over calendar days in the month.
pub fn monthly_attendance_percentage(present_days: u32, total_days_in_month: u32) -> i64 {
    if total_days_in_month == 0 {
        return 0;
    }
    (present_days as f64 / total_days_in_month as f64 * 100.0).round() as i64
}

/// Collapse per-subject rows to one status per calendar day, keeping the
/// highest-ranked status seen on that day.
pub fn one_status_per_day<S, I, R>(rows: I, rank: R) -> Vec<S>
where
    S: Copy,
    I: IntoIterator<Item = (NaiveDate, S)>,
    R: Fn(S) -> u8,
{
    let mut days: BTreeMap<NaiveDate, S> = BTreeMap::new();
    for (date, status) in rows {
        days.entry(date)
            .and_modify(|cur| {
                if rank(status) > rank(*cur) {
                    *cur = status;
                }
            })
            .or_insert(status);
    }
    days.into_values().collect()
}

pub fn student_day_rank(s: AttendanceStatus) -> u8 {
    match s {
        AttendanceStatus::Present => 3,
        AttendanceStatus::Late => 2,
        AttendanceStatus::Excused => 1,
        AttendanceStatus::Absent => 0,
    }
}

pub fn teacher_day_rank(s: TeacherAttendanceStatus) -> u8 {
    match s {
        TeacherAttendanceStatus::Present => 3,
        TeacherAttendanceStatus::Late => 2,
        TeacherAttendanceStatus::OnLeave => 1,
        TeacherAttendanceStatus::Absent => 0,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceCounts {
    pub total: u32,
    pub present: u32,
    pub absent: u32,
    pub late: u32,
    pub excused: u32,
    pub on_leave: u32,
}

impl AttendanceCounts {
    pub fn tally_students<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = AttendanceStatus>,
    {
        let mut c = AttendanceCounts::default();
        for s in statuses {
            c.total += 1;
            match s {
                AttendanceStatus::Present => c.present += 1,
                AttendanceStatus::Absent => c.absent += 1,
                AttendanceStatus::Late => c.late += 1,
                AttendanceStatus::Excused => c.excused += 1,
            }
        }
        c
    }

    pub fn tally_teachers<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = TeacherAttendanceStatus>,
    {
        let mut c = AttendanceCounts::default();
        for s in statuses {
            c.total += 1;
            match s {
                TeacherAttendanceStatus::Present => c.present += 1,
                TeacherAttendanceStatus::Absent => c.absent += 1,
                TeacherAttendanceStatus::Late => c.late += 1,
                TeacherAttendanceStatus::OnLeave => c.on_leave += 1,
            }
        }
        c
    }

    /// Present share of recorded days, rounded to a whole percent.
    pub fn recorded_percentage(&self) -> i64 {
        if self.total == 0 {
            return 0;
        }
        (self.present as f64 / self.total as f64 * 100.0).round() as i64
    }
}

#[derive(Debug, Clone)]
pub struct ResultRow {
    pub student_id: String,
    pub student_name: String,
    pub marks: f64,
    pub max_marks: f64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentStanding {
    pub student_id: String,
    pub student_name: String,
    pub subject_count: usize,
    pub total_marks: f64,
    pub total_max_marks: f64,
    pub overall_percentage: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamTotals {
    pub student_count: usize,
    pub pass_count: usize,
    pub fail_count: usize,
    pub pass_rate: f64,
    pub average_percentage: f64,
    pub highest_percentage: f64,
    pub lowest_percentage: f64,
}

/// Group results by student. A student passes only when every subject
/// percentage meets `pass_threshold`.
pub fn exam_standings(rows: &[ResultRow], pass_threshold: f64) -> Vec<StudentStanding> {
    let mut order: Vec<String> = Vec::new();
    let mut by_student: HashMap<String, StudentStanding> = HashMap::new();
    for r in rows {
        let entry = by_student.entry(r.student_id.clone()).or_insert_with(|| {
            order.push(r.student_id.clone());
            StudentStanding {
                student_id: r.student_id.clone(),
                student_name: r.student_name.clone(),
                subject_count: 0,
                total_marks: 0.0,
                total_max_marks: 0.0,
                overall_percentage: 0.0,
                passed: true,
            }
        });
        entry.subject_count += 1;
        entry.total_marks += r.marks;
        entry.total_max_marks += r.max_marks;
        if r.percentage < pass_threshold {
            entry.passed = false;
        }
    }

    let mut out: Vec<StudentStanding> = order
        .into_iter()
        .filter_map(|id| by_student.remove(&id))
        .map(|mut s| {
            s.overall_percentage = if s.total_max_marks > 0.0 {
                round_to(s.total_marks / s.total_max_marks * 100.0, 2)
            } else {
                0.0
            };
            s
        })
        .collect();
    out.sort_by(|a, b| {
        b.overall_percentage
            .partial_cmp(&a.overall_percentage)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.student_name.cmp(&b.student_name))
    });
    out
}

pub fn exam_totals(standings: &[StudentStanding]) -> ExamTotals {
    if standings.is_empty() {
        return ExamTotals::default();
    }
    let n = standings.len();
    let pass_count = standings.iter().filter(|s| s.passed).count();
    let sum: f64 = standings.iter().map(|s| s.overall_percentage).sum();
    let highest = standings
        .iter()
        .map(|s| s.overall_percentage)
        .fold(f64::MIN, f64::max);
    let lowest = standings
        .iter()
        .map(|s| s.overall_percentage)
        .fold(f64::MAX, f64::min);
    ExamTotals {
        student_count: n,
        pass_count,
        fail_count: n - pass_count,
        pass_rate: round_to(pass_count as f64 / n as f64 * 100.0, 2),
        average_percentage: round_to(sum / n as f64, 2),
        highest_percentage: highest,
        lowest_percentage: lowest,
    }
}

#[derive(Debug, Clone)]
pub struct LeaveRow {
    pub requester_kind: String,
    pub leave_type: String,
    pub status: LeaveStatus,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveSummary {
    pub total: usize,
    pub approved: usize,
    pub rejected: usize,
    pub pending: usize,
    pub approval_rate: f64,
    pub avg_duration: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthBucket {
    pub month: u32,
    pub count: usize,
    pub approved: usize,
}

pub fn leave_summary(rows: &[LeaveRow]) -> LeaveSummary {
    let total = rows.len();
    if total == 0 {
        return LeaveSummary::default();
    }
    let count = |s: LeaveStatus| rows.iter().filter(|r| r.status == s).count();
    let approved = count(LeaveStatus::Approved);
    // A malformed range (end before start) still counts as one day here.
    let days: i64 = rows
        .iter()
        .map(|r| ((r.end_date - r.start_date).num_days() + 1).max(1))
        .sum();
    LeaveSummary {
        total,
        approved,
        rejected: count(LeaveStatus::Rejected),
        pending: count(LeaveStatus::Pending),
        approval_rate: round_to(approved as f64 / total as f64, 2),
        avg_duration: round_to(days as f64 / total as f64, 2),
    }
}

/// Twelve buckets for `year`, keyed by the month of each request's start date.
pub fn leave_monthly_trend(rows: &[LeaveRow], year: i32) -> Vec<MonthBucket> {
    let mut buckets: Vec<MonthBucket> = (1..=12)
        .map(|month| MonthBucket {
            month,
            ..MonthBucket::default()
        })
        .collect();
    for r in rows.iter().filter(|r| r.start_date.year() == year) {
        let b = &mut buckets[(r.start_date.month() - 1) as usize];
        b.count += 1;
        if r.status == LeaveStatus::Approved {
            b.approved += 1;
        }
    }
    buckets
}

pub fn distribution_by<F>(rows: &[LeaveRow], key: F) -> BTreeMap<String, usize>
where
    F: Fn(&LeaveRow) -> &str,
{
    let mut out = BTreeMap::new();
    for r in rows {
        *out.entry(key(r).to_string()).or_insert(0) += 1;
    }
    out
}
