use std::time::Duration;

/// Delays of the reference policy, in minutes.
pub const REFERENCE_MINUTES: [u64; 6] = [2, 5, 10, 20, 30, 60];

/// Longest single delay a table may hold.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BackoffError {
    #[error("backoff table is empty")]
    Empty,
    #[error("backoff table decreases at entry {0}")]
    Decreasing(usize),
    #[error("backoff entry {0} exceeds the one year limit")]
    TooLong(usize),
}

/// Attempt-indexed delay table, capped at its last entry.
///
/// Attempt numbers are 1-based: `delay(1)` is the first entry. Anything past
/// the end of the table reuses the last entry, so retries never stop and
/// never wait longer than [`BackoffPolicy::max_delay`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    table: Vec<Duration>,
}

impl BackoffPolicy {
    pub fn new(table: Vec<Duration>) -> Result<Self, BackoffError> {
        if table.is_empty() {
            return Err(BackoffError::Empty);
        }

        if let Some(idx) = table.iter().position(|d| *d > MAX_DELAY) {
            return Err(BackoffError::TooLong(idx));
        }

        if let Some(idx) = table.windows(2).position(|w| w[1] < w[0]) {
            return Err(BackoffError::Decreasing(idx + 1));
        }

        Ok(Self { table })
    }

    pub fn from_minutes(minutes: &[u64]) -> Result<Self, BackoffError> {
        let table = minutes
            .iter()
            .enumerate()
            .map(|(idx, m)| {
                m.checked_mul(60)
                    .map(Duration::from_secs)
                    .ok_or(BackoffError::TooLong(idx))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(table)
    }

    pub fn reference() -> Self {
        Self {
            table: REFERENCE_MINUTES
                .iter()
                .map(|m| Duration::from_secs(m * 60))
                .collect(),
        }
    }

    /// Delay before `attempt` is re-evaluated. Attempt 0 is treated as 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let idx = (attempt.max(1) as usize - 1).min(self.table.len() - 1);
        self.table[idx]
    }

    pub fn max_delay(&self) -> Duration {
        self.table[self.table.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::reference()
    }
}
