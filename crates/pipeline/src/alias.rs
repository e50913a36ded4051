//! Placeholder alias allocation.
//!
//! Every face the pipeline has not yet named gets an `unknown_NNN` alias.
//! Released names are recycled lowest-first before the counter grows, and
//! the whole namespace resets at local midnight so `unknown_001` on Tuesday
//! and `unknown_001` on Wednesday are distinct records (the store keys
//! identities by date as well as alias).

use chrono::NaiveDate;
use std::collections::BTreeSet;

pub struct AliasAllocator {
    counter: u32,
    // Ordered so the lowest released alias is reused first.
    free: BTreeSet<String>,
    today: NaiveDate,
}

impl AliasAllocator {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            counter: 1,
            free: BTreeSet::new(),
            today,
        }
    }

    /// Hand out the next alias: a recycled one if any, else a fresh
    /// `unknown_{counter:03}`.
    pub fn next(&mut self) -> String {
        if let Some(alias) = self.free.pop_first() {
            return alias;
        }
        let alias = format!("unknown_{:03}", self.counter);
        self.counter += 1;
        alias
    }

    /// Return an alias to the pool, e.g. after it has been renamed to a
    /// real identity.
    pub fn release(&mut self, alias: String) {
        self.free.insert(alias);
    }

    /// Reset the namespace when the calendar date advances. Returns true on
    /// rollover; the caller must drop its track-to-alias assignments, since
    /// they refer to the old day's namespace.
    pub fn roll_day(&mut self, today: NaiveDate) -> bool {
        if today == self.today {
            return false;
        }
        tracing::info!(from = %self.today, to = %today, "alias namespace reset at day rollover");
        self.counter = 1;
        self.free.clear();
        self.today = today;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn aliases_are_sequential_and_zero_padded() {
        let mut alloc = AliasAllocator::new(day("2026-08-20"));
        assert_eq!(alloc.next(), "unknown_001");
        assert_eq!(alloc.next(), "unknown_002");
        assert_eq!(alloc.next(), "unknown_003");
    }

    #[test]
    fn released_alias_is_reused_before_counter_grows() {
        let mut alloc = AliasAllocator::new(day("2026-08-20"));
        let a = alloc.next();
        let b = alloc.next();
        alloc.release(a.clone());
        alloc.release(b.clone());

        // Lowest released name comes back first.
        assert_eq!(alloc.next(), a);
        assert_eq!(alloc.next(), b);
        assert_eq!(alloc.next(), "unknown_003");
    }

    #[test]
    fn day_rollover_resets_counter_and_free_list() {
        let mut alloc = AliasAllocator::new(day("2026-08-20"));
        alloc.next();
        alloc.next();
        alloc.release("unknown_001".into());

        assert!(!alloc.roll_day(day("2026-08-20")));
        assert!(alloc.roll_day(day("2026-08-21")));
        assert_eq!(alloc.next(), "unknown_001");
        assert_eq!(alloc.next(), "unknown_002");
    }
}
