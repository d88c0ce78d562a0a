//! Attempt-scoped timestamp validation.

use std::collections::BTreeSet;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplayRejection {
    #[error("timestamp {ts} already seen in this attempt")]
    Duplicate { ts: u64 },
    #[error("timestamp {ts} runs backwards past newest {newest}")]
    Backwards { ts: u64, newest: u64 },
    #[error("clock offset drifted {drift_ms} ms from attempt baseline")]
    OffsetDrift { drift_ms: i64 },
    #[error("timestamp {ts} is out of range")]
    OutOfRange { ts: u64 },
}

/// Rejects frames whose client timestamps cannot belong to a live capture.
///
/// The first accepted frame fixes the baseline `receipt - timestamp` offset.
/// Later frames must stay within `window_ms` of it, may not repeat a
/// timestamp, and may arrive out of order only by `skew_ms`.
#[derive(Debug, Clone)]
pub struct ReplayGuard {
    window_ms: u64,
    skew_ms: u64,
    baseline: Option<i64>,
    newest: Option<u64>,
    seen: BTreeSet<u64>,
    rejected: u64,
}

impl ReplayGuard {
    pub fn new(window_ms: u64, skew_ms: u64) -> Self {
        Self {
            window_ms,
            skew_ms,
            baseline: None,
            newest: None,
            seen: BTreeSet::new(),
            rejected: 0,
        }
    }

    pub fn check(&mut self, timestamp_ms: u64, received_at_ms: u64) -> Result<(), ReplayRejection> {
        match self.validate(timestamp_ms, received_at_ms) {
            Ok(offset) => {
                self.accept(timestamp_ms, offset);
                Ok(())
            }
            Err(rejection) => {
                self.rejected += 1;
                Err(rejection)
            }
        }
    }

    /// Returns the frame's `receipt - timestamp` offset when it is acceptable.
    fn validate(&self, ts: u64, received: u64) -> Result<i64, ReplayRejection> {
        let offset = offset(ts, received).ok_or(ReplayRejection::OutOfRange { ts })?;
        if self.seen.contains(&ts) {
            return Err(ReplayRejection::Duplicate { ts });
        }
        if let Some(newest) = self.newest {
            if newest.saturating_sub(ts) > self.skew_ms {
                return Err(ReplayRejection::Backwards { ts, newest });
            }
        }
        if let Some(baseline) = self.baseline {
            let drift_ms = offset.saturating_sub(baseline);
            if drift_ms.unsigned_abs() > self.window_ms {
                return Err(ReplayRejection::OffsetDrift { drift_ms });
            }
        }
        Ok(offset)
    }

    fn accept(&mut self, ts: u64, offset: i64) {
        self.baseline.get_or_insert(offset);
        let newest = self.newest.map_or(ts, |n| n.max(ts));
        self.newest = Some(newest);
        self.seen.insert(ts);
        // Anything older than this is rejected as backwards anyway.
        let floor = newest.saturating_sub(self.skew_ms);
        self.seen = self.seen.split_off(&floor);
    }

    /// Frames rejected since the attempt started.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn tracked(&self) -> usize {
        self.seen.len()
    }
}

/// `None` when either clock is beyond `i64` milliseconds.
fn offset(ts: u64, received: u64) -> Option<i64> {
    i64::try_from(received)
        .ok()?
        .checked_sub(i64::try_from(ts).ok()?)
}
