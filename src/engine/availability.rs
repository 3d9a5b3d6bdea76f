use crate::model::*;

// ── Slot grid ─────────────────────────────────────────────────────

/// The fixed list of start times offered to customers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotGrid {
    slots: Vec<TimeOfDay>,
}

impl SlotGrid {
    /// Every `step` minutes from `open` through `close`, both ends included.
    pub fn every(open: TimeOfDay, close: TimeOfDay, step: Minutes) -> Self {
        debug_assert!(step > 0 && open <= close);
        let slots = (open.minutes()..=close.minutes())
            .step_by(step as usize)
            .filter_map(TimeOfDay::from_minutes)
            .collect();
        Self { slots }
    }

    pub fn slots(&self) -> &[TimeOfDay] {
        &self.slots
    }

    /// Business hours are the closed range between the first and last slot.
    pub fn within_hours(&self, time: TimeOfDay) -> bool {
        match (self.slots.first(), self.slots.last()) {
            (Some(open), Some(close)) => *open <= time && time <= *close,
            _ => false,
        }
    }
}

impl Default for SlotGrid {
    /// 09:00 to 17:00 every half hour.
    fn default() -> Self {
        Self::every(TimeOfDay::hm(9, 0), TimeOfDay::hm(17, 0), 30)
    }
}

// ── Availability ──────────────────────────────────────────────────

/// The overlap predicate shared by availability listing and every
/// write-time re-check: `[start, start + requested)` must not strictly
/// overlap any occupied span.
pub fn is_slot_free(start: TimeOfDay, requested: Minutes, occupied: &[Span]) -> bool {
    let candidate = Span::starting_at(start, requested);
    occupied.iter().all(|existing| !candidate.overlaps(existing))
}

/// Grid entries at which a booking of `requested` minutes fits.
///
/// A zero duration means nothing has been selected yet and returns the whole
/// grid. Grid order is preserved; an empty result is a normal answer.
pub fn compute_available_slots(
    grid: &[TimeOfDay],
    requested: Minutes,
    occupied: &[Span],
) -> Vec<TimeOfDay> {
    if requested == 0 {
        return grid.to_vec();
    }
    grid.iter()
        .copied()
        .filter(|&slot| is_slot_free(slot, requested, occupied))
        .collect()
}
