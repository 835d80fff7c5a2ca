use std::time::Duration;

/// What the store knows locally about one entity when a server snapshot arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSyncState {
    /// Last server `updatedAt` applied or acknowledged, unix ms.
    pub updated_at: i64,
    pub dirty: bool,
    pub local_updated_at: Option<i64>,
    pub conflict_server_at: Option<i64>,
    pub has_pending_op: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    Apply,
    PreserveLocal,
    Conflict { server_at: i64 },
    /// Already flagged at this or a newer server version.
    Skip,
}

/// Timestamp-precedence conflict rules with a tolerance for client/server clock skew.
#[derive(Debug, Clone, Copy)]
pub struct ConflictDetector {
    skew_ms: i64,
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl ConflictDetector {
    pub fn new(skew: Duration) -> Self {
        Self {
            skew_ms: skew.as_millis().min(i64::MAX as u128) as i64,
        }
    }

    /// Local wins without comparing content: a dirty edit newer than the server
    /// snapshot by more than the skew tolerance.
    pub fn should_preserve_local_changes(
        &self,
        local: Option<&LocalSyncState>,
        server_updated_at: i64,
    ) -> bool {
        let Some(local) = local else {
            return false;
        };
        match local.local_updated_at {
            Some(edited_at) if local.dirty => {
                edited_at > server_updated_at.saturating_add(self.skew_ms)
            }
            _ => false,
        }
    }

    /// Per-record verdict: the fast path, then divergence, with an already flagged
    /// record held until the server version strictly advances.
    pub fn decide(&self, local: Option<&LocalSyncState>, server_updated_at: i64) -> ConflictDecision {
        let Some(local) = local else {
            return ConflictDecision::Apply;
        };
        if self.should_preserve_local_changes(Some(local), server_updated_at) {
            return ConflictDecision::PreserveLocal;
        }
        if local
            .conflict_server_at
            .is_some_and(|flagged_at| server_updated_at <= flagged_at)
        {
            return ConflictDecision::Skip;
        }
        if Self::diverged(local, server_updated_at) {
            return ConflictDecision::Conflict {
                server_at: server_updated_at,
            };
        }
        if local.dirty && local.has_pending_op {
            return ConflictDecision::PreserveLocal;
        }
        ConflictDecision::Apply
    }

    fn diverged(local: &LocalSyncState, server_updated_at: i64) -> bool {
        local.dirty && local.has_pending_op && server_updated_at != local.updated_at
    }
}
