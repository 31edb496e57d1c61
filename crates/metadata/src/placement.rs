//! Placement restrictions applied to repair queue claims.

use mender_core::PlacementConstraint;
use sqlx::{Database, Encode, QueryBuilder, Type};

/// Placement restriction for a claim.
///
/// An empty `included` list allows every placement. Anything in `excluded`
/// is filtered out even if it is also included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementFilter {
    included: Vec<i32>,
    excluded: Vec<i32>,
}

impl PlacementFilter {
    pub fn new(included: &[PlacementConstraint], excluded: &[PlacementConstraint]) -> Self {
        let collect = |placements: &[PlacementConstraint]| {
            let mut values: Vec<i32> = placements.iter().map(|p| p.to_db()).collect();
            values.sort_unstable();
            values.dedup();
            values
        };
        Self {
            included: collect(included),
            excluded: collect(excluded),
        }
    }

    /// Whether the filter restricts anything at all.
    pub fn is_unrestricted(&self) -> bool {
        self.included.is_empty() && self.excluded.is_empty()
    }

    /// Whether a placement passes the filter.
    pub fn allows(&self, placement: PlacementConstraint) -> bool {
        let value = placement.to_db();
        (self.included.is_empty() || self.included.contains(&value))
            && !self.excluded.contains(&value)
    }

    /// Append ` AND column IN (...)` / ` AND column NOT IN (...)` clauses,
    /// binding each placement as a parameter.
    pub fn push_sql<'args, DB>(&self, qb: &mut QueryBuilder<'args, DB>, column: &str)
    where
        DB: Database,
        i32: 'args + Encode<'args, DB> + Type<DB>,
    {
        if !self.included.is_empty() {
            qb.push(" AND ").push(column).push(" IN (");
            push_bind_list(qb, &self.included);
        }
        if !self.excluded.is_empty() {
            qb.push(" AND ").push(column).push(" NOT IN (");
            push_bind_list(qb, &self.excluded);
        }
    }
}

fn push_bind_list<'args, DB>(qb: &mut QueryBuilder<'args, DB>, values: &[i32])
where
    DB: Database,
    i32: 'args + Encode<'args, DB> + Type<DB>,
{
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push_bind(*value);
    }
    qb.push(")");
}
