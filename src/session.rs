/// Caller-local running sum of saved row totals.
///
/// Lives with whoever issues saves (the CLI, a browser tab). Resetting it
/// never touches a ledger; the ledger's grand total stays authoritative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionTally {
    sum: u64,
    saves: usize,
}

impl SessionTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the total of a row that was just saved; returns the new sum.
    pub fn record(&mut self, row_total: u32) -> u64 {
        self.sum += row_total as u64;
        self.saves += 1;
        self.sum
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }

    pub fn saves(&self) -> usize {
        self.saves
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_accumulates_until_reset() {
        let mut tally = SessionTally::new();
        assert_eq!(tally.record(20), 20);
        assert_eq!(tally.record(13), 33);
        assert_eq!(tally.saves(), 2);

        tally.reset();
        assert_eq!(tally.sum(), 0);
        assert_eq!(tally.record(5), 5);
    }
}
