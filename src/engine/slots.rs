use crate::limits::MAX_SLOT_MINUTES;
use crate::model::*;

use super::EngineError;

/// Discretize free intervals into fixed-length slots.
///
/// Within each free interval, candidate starts step by `granularity_minutes` from
/// the interval's own start. A slot is emitted while it fits entirely inside the
/// interval; slots never straddle two intervals.
pub fn generate_slots(
    free: &[Span],
    duration_minutes: i64,
    granularity_minutes: i64,
) -> Result<Vec<Slot>, EngineError> {
    if !(1..=MAX_SLOT_MINUTES).contains(&duration_minutes) {
        return Err(EngineError::InvalidArgument(format!(
            "slot duration must be 1..={MAX_SLOT_MINUTES} minutes, got {duration_minutes}"
        )));
    }
    if !(1..=MAX_SLOT_MINUTES).contains(&granularity_minutes) {
        return Err(EngineError::InvalidArgument(format!(
            "slot granularity must be 1..={MAX_SLOT_MINUTES} minutes, got {granularity_minutes}"
        )));
    }
    let duration = duration_minutes * MINUTE_MS;
    let step = granularity_minutes * MINUTE_MS;

    let mut slots = Vec::new();
    for interval in free {
        let mut t = interval.start;
        while t + duration <= interval.end {
            slots.push(Span::new(t, t + duration));
            t += step;
        }
    }
    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: Ms = MINUTE_MS;
    const H: Ms = HOUR_MS;

    #[test]
    fn granularity_defaults_to_duration_when_equal() {
        let free = [Span::new(9 * H, 12 * H)];
        let slots = generate_slots(&free, 60, 60).unwrap();
        assert_eq!(
            slots,
            vec![
                Span::new(9 * H, 10 * H),
                Span::new(10 * H, 11 * H),
                Span::new(11 * H, 12 * H),
            ]
        );
    }

    #[test]
    fn finer_granularity_overlapping_slots() {
        let free = [Span::new(9 * H, 10 * H + 30 * M)];
        let slots = generate_slots(&free, 60, 30).unwrap();
        assert_eq!(
            slots,
            vec![
                Span::new(9 * H, 10 * H),
                Span::new(9 * H + 30 * M, 10 * H + 30 * M),
            ]
        );
    }

    #[test]
    fn remainder_too_short_is_dropped() {
        let free = [Span::new(9 * H, 9 * H + 50 * M)];
        let slots = generate_slots(&free, 30, 30).unwrap();
        assert_eq!(slots, vec![Span::new(9 * H, 9 * H + 30 * M)]);
    }

    #[test]
    fn interval_shorter_than_duration_yields_nothing() {
        let free = [Span::new(9 * H, 9 * H + 20 * M)];
        assert!(generate_slots(&free, 30, 15).unwrap().is_empty());
    }

    #[test]
    fn slots_do_not_cross_interval_gaps() {
        // 09:00-12:00 and 13:00-17:00, 45 minute slots.
        let free = [Span::new(9 * H, 12 * H), Span::new(13 * H, 17 * H)];
        let slots = generate_slots(&free, 45, 45).unwrap();
        assert_eq!(slots.len(), 4 + 5);
        assert_eq!(slots[3], Span::new(11 * H + 15 * M, 12 * H));
        assert_eq!(slots[4].start, 13 * H);
        assert!(slots.windows(2).all(|w| w[0].start < w[1].start));
        for s in &slots {
            assert!(free.iter().any(|f| f.contains_span(s)));
        }
    }

    #[test]
    fn empty_free_list() {
        assert!(generate_slots(&[], 30, 15).unwrap().is_empty());
    }

    #[test]
    fn non_positive_arguments_rejected() {
        let free = [Span::new(0, H)];
        assert!(matches!(generate_slots(&free, 0, 15), Err(EngineError::InvalidArgument(_))));
        assert!(matches!(generate_slots(&free, 30, 0), Err(EngineError::InvalidArgument(_))));
        assert!(matches!(generate_slots(&free, -5, 15), Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn oversized_arguments_rejected() {
        let free = [Span::new(0, H)];
        let huge = 1i64 << 59;
        assert!(matches!(generate_slots(&free, 30, huge), Err(EngineError::InvalidArgument(_))));
        assert!(matches!(generate_slots(&free, huge, 15), Err(EngineError::InvalidArgument(_))));
        assert!(matches!(generate_slots(&free, 30, i64::MAX), Err(EngineError::InvalidArgument(_))));
        assert!(matches!(
            generate_slots(&free, 30, MAX_SLOT_MINUTES + 1),
            Err(EngineError::InvalidArgument(_))
        ));
        // A whole-day step is still fine and yields one slot per interval.
        assert_eq!(generate_slots(&free, 30, MAX_SLOT_MINUTES).unwrap(), vec![Span::new(0, 30 * M)]);
    }
}
