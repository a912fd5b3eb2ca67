/// Commit bookkeeping for one partition.
///
/// `resolved` is the highest offset whose message and every predecessor have
/// a final outcome; `committed` is the highest offset acknowledged to the
/// broker. Both only move forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitCursor {
    resolved: Option<i64>,
    committed: Option<i64>,
}

impl CommitCursor {
    /// Move the resolved offset forward; returns false for stale reports
    pub fn advance(&mut self, offset: i64) -> bool {
        match self.resolved {
            Some(current) if current >= offset => false,
            _ => {
                self.resolved = Some(offset);
                true
            }
        }
    }

    /// Resolved offset not yet acknowledged to the broker
    pub fn pending(&self) -> Option<i64> {
        match (self.resolved, self.committed) {
            (Some(resolved), Some(committed)) if resolved <= committed => None,
            (resolved, _) => resolved,
        }
    }

    pub fn mark_committed(&mut self, offset: i64) {
        if self.committed.map_or(true, |current| offset > current) {
            self.committed = Some(offset);
        }
    }

    pub fn resolved(&self) -> Option<i64> {
        self.resolved
    }

    pub fn committed(&self) -> Option<i64> {
        self.committed
    }
}
