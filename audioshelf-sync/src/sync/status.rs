use crate::error::ErrorKind;

use super::records::EntityFamily;

/// Ordered sub-steps of a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    Contributors,
    Series,
    Genres,
    Tags,
    Books,
    Collections,
    Lenses,
    Profile,
    RebuildingSearchIndex,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Contributors => "syncing_contributors",
            SyncPhase::Series => "syncing_series",
            SyncPhase::Genres => "syncing_genres",
            SyncPhase::Tags => "syncing_tags",
            SyncPhase::Books => "syncing_books",
            SyncPhase::Collections => "syncing_collections",
            SyncPhase::Lenses => "syncing_lenses",
            SyncPhase::Profile => "syncing_profile",
            SyncPhase::RebuildingSearchIndex => "rebuilding_search_index",
        }
    }
}

/// Aggregate failure reported to the UI: one per cycle, never per family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub family: Option<EntityFamily>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing {
        phase: SyncPhase,
    },
    Progress {
        phase: SyncPhase,
        current: u64,
        total: Option<u64>,
    },
    Success {
        completed_at: i64,
    },
    Error {
        failure: SyncFailure,
    },
}

impl SyncStatus {
    pub fn is_busy(&self) -> bool {
        matches!(self, SyncStatus::Syncing { .. } | SyncStatus::Progress { .. })
    }
}
