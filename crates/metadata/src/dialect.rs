//! Backend capability classes.
//!
//! The queue contracts are the same on every engine, but the statements that
//! implement an atomic upsert or an atomic claim are not. Each store resolves
//! its [`Backend`] once and asks it which strategy to run.

use std::fmt;

/// Relational engine behind a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Backend {
    Sqlite,
    Postgres,
    Cockroach,
}

impl Backend {
    pub fn name(self) -> &'static str {
        match self {
            Backend::Sqlite => "sqlite",
            Backend::Postgres => "postgres",
            Backend::Cockroach => "cockroach",
        }
    }

    pub fn upsert_strategy(self) -> UpsertStrategy {
        match self {
            Backend::Postgres => UpsertStrategy::NativeUpsert,
            Backend::Cockroach => UpsertStrategy::CteConditionalWrite,
            Backend::Sqlite => UpsertStrategy::UpdateThenInsertIgnore,
        }
    }

    pub fn claim_strategy(self) -> ClaimStrategy {
        match self {
            Backend::Postgres => ClaimStrategy::LockedSubselect,
            Backend::Cockroach => ClaimStrategy::SerializableSubselect,
            Backend::Sqlite => ClaimStrategy::CompareAndSwap,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How an insert-or-update reports whether the row already existed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertStrategy {
    /// `INSERT .. ON CONFLICT DO UPDATE RETURNING (xmax = 0)`.
    NativeUpsert,
    /// A read-only CTE records which keys exist, the same statement upserts
    /// and joins its output back against that snapshot.
    CteConditionalWrite,
    /// `UPDATE`, then `INSERT OR IGNORE` if nothing matched, then `UPDATE`
    /// again if the insert was ignored. Runs inside one transaction.
    UpdateThenInsertIgnore,
}

/// How a bounded set of rows moves from eligible to claimed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimStrategy {
    /// Candidate sub-select takes row locks and skips rows locked by others.
    LockedSubselect,
    /// Candidate sub-select without locks; the engine's serializable
    /// isolation aborts one of two overlapping claims.
    SerializableSubselect,
    /// Candidates are read, then each row is claimed by an update guarded on
    /// its attempt time still being eligible.
    CompareAndSwap,
}

impl ClaimStrategy {
    /// Locking clause appended to the candidate sub-select.
    pub fn candidate_lock_clause(self) -> &'static str {
        match self {
            ClaimStrategy::LockedSubselect => " FOR UPDATE SKIP LOCKED",
            ClaimStrategy::SerializableSubselect | ClaimStrategy::CompareAndSwap => "",
        }
    }
}
