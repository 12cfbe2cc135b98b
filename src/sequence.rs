//! Daily sequence allocator for UI order numbering.
//!
//! Assigns gapless per-day counters ("order #1 today") keyed by an order's
//! display number. The allocator is UI-facing state only: it is never
//! persisted, resets at local midnight, and can be rebuilt from whatever
//! order list is available by replaying numbers in chronological order.

use chrono::{Local, NaiveDate};
use std::collections::HashMap;

#[derive(Debug)]
pub struct DailySequence {
    date: NaiveDate,
    counter: u32,
    assigned: HashMap<String, u32>,
}

impl Default for DailySequence {
    fn default() -> Self {
        Self::new()
    }
}

impl DailySequence {
    pub fn new() -> Self {
        Self {
            date: Local::now().date_naive(),
            counter: 0,
            assigned: HashMap::new(),
        }
    }

    /// Assign (or return the already-assigned) daily counter for a display
    /// number. Idempotent per display number per calendar day.
    pub fn assign(&mut self, order_number: &str) -> u32 {
        self.assign_on(Local::now().date_naive(), order_number)
    }

    /// Assign counters for a batch of display numbers. The slice must be in
    /// chronological creation order so the first order created today gets #1.
    pub fn batch_assign(&mut self, order_numbers: &[String]) -> HashMap<String, u32> {
        let today = Local::now().date_naive();
        order_numbers
            .iter()
            .map(|number| (number.clone(), self.assign_on(today, number)))
            .collect()
    }

    /// Date-injected worker so day rollover is testable.
    fn assign_on(&mut self, today: NaiveDate, order_number: &str) -> u32 {
        if self.date != today {
            self.date = today;
            self.counter = 0;
            self.assigned.clear();
        }

        if let Some(existing) = self.assigned.get(order_number) {
            return *existing;
        }

        self.counter += 1;
        self.assigned.insert(order_number.to_string(), self.counter);
        self.counter
    }

    /// Peek at an already-assigned counter without allocating a new one.
    pub fn get(&self, order_number: &str) -> Option<u32> {
        self.assigned.get(order_number).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_assign_is_strictly_increasing_and_unique() {
        let mut seq = DailySequence::new();
        let today = day("2026-08-06");
        let a = seq.assign_on(today, "ORD-06082026-00001");
        let b = seq.assign_on(today, "ORD-06082026-00002");
        let c = seq.assign_on(today, "ORD-06082026-00003");
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[test]
    fn test_assign_is_idempotent_per_display_number() {
        let mut seq = DailySequence::new();
        let today = day("2026-08-06");
        let first = seq.assign_on(today, "ORD-06082026-00007");
        seq.assign_on(today, "ORD-06082026-00008");
        let again = seq.assign_on(today, "ORD-06082026-00007");
        assert_eq!(first, again);
    }

    #[test]
    fn test_day_rollover_resets_to_one() {
        let mut seq = DailySequence::new();
        seq.assign_on(day("2026-08-05"), "ORD-05082026-00041");
        seq.assign_on(day("2026-08-05"), "ORD-05082026-00042");
        let first_of_day = seq.assign_on(day("2026-08-06"), "ORD-06082026-00001");
        assert_eq!(first_of_day, 1);
        assert!(seq.get("ORD-05082026-00041").is_none());
    }

    #[test]
    fn test_batch_assign_preserves_chronological_order() {
        let mut seq = DailySequence::new();
        let numbers: Vec<String> = ["ORD-A", "ORD-B", "ORD-C"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let map = seq.batch_assign(&numbers);
        assert_eq!(map["ORD-A"], 1);
        assert_eq!(map["ORD-B"], 2);
        assert_eq!(map["ORD-C"], 3);
    }

    #[test]
    fn test_batch_assign_tolerates_partial_history() {
        // Rebuilding from an incomplete list must still be stable for the
        // numbers it does see.
        let mut seq = DailySequence::new();
        let partial: Vec<String> = ["ORD-B", "ORD-C"].iter().map(|s| s.to_string()).collect();
        let map = seq.batch_assign(&partial);
        assert_eq!(map["ORD-B"], 1);
        assert_eq!(map["ORD-C"], 2);
        // A later appearance of an unseen earlier order gets the next slot.
        assert_eq!(seq.assign("ORD-A"), 3);
    }
}
