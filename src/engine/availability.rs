use chrono::{Datelike, NaiveDate};

use crate::model::*;

// ── Availability Resolver ─────────────────────────────────────────

/// Free intervals of a doctor on one local date, before appointments.
///
/// Weekly hours for the weekday form the base interval; every blocked interval
/// on exactly that date is subtracted. Result is sorted and pairwise disjoint.
pub fn resolve_free(doctor: &DoctorState, date: NaiveDate) -> Vec<Span> {
    let hours = match doctor.weekly_for(date.weekday()) {
        Some(h) if h.is_available => h,
        _ => return Vec::new(),
    };
    let tz = &doctor.timezone;
    let start = local_time_to_ms(tz, date, hours.start);
    let end = local_time_to_ms(tz, date, hours.end);
    // A DST transition can collapse a short window to nothing.
    if start >= end {
        return Vec::new();
    }
    let base = [Span::new(start, end)];

    let mut blocked: Vec<Span> = doctor
        .blocks_on(date)
        .iter()
        .filter_map(|b| {
            let s = local_time_to_ms(tz, date, b.start);
            let e = local_time_to_ms(tz, date, b.end);
            (s < e).then(|| Span::new(s, e))
        })
        .collect();
    if blocked.is_empty() {
        return base.to_vec();
    }
    blocked.sort_by_key(|s| s.start);
    let blocked = merge_overlapping(&blocked);
    subtract_intervals(&base, &blocked)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Linear sweep: `base` minus `to_remove`. Both sorted by start, `to_remove` merged.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut cursor = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= cursor {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > cursor {
                result.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
            j += 1;
        }

        if cursor < b.end {
            result.push(Span::new(cursor, b.end));
        }
    }

    result
}
