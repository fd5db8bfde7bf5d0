//! AffectedSet index: for every reservation unit, the units whose bookings
//! occupy the same physical capacity.
//!
//! Two units affect each other when one owns a space that is an ancestor or
//! descendant of (or equal to) a space of the other, or when they share a
//! resource. The relation is symmetric and reflexive but not transitive:
//! two sibling rooms both affect their parent hall without affecting each
//! other.
//!
//! The index is a batch-built snapshot. It is replaced wholesale after
//! structural writes and may lag them; readers tolerate that staleness.

use std::collections::{HashMap, HashSet};

use ulid::Ulid;

use crate::limits::MAX_HIERARCHY_DEPTH;
use crate::model::*;

use super::HierarchyError;

/// Point-in-time copy of the structural tables.
#[derive(Debug, Clone, Default)]
pub struct Structure {
    pub spaces: Vec<Space>,
    pub resources: Vec<Resource>,
    pub units: Vec<ReservationUnit>,
}

#[derive(Debug, Clone, Default)]
pub struct AffectedSetIndex {
    sets: HashMap<Ulid, HashSet<Ulid>>,
    /// Structural version the index was built from.
    pub version: u64,
    pub built_at: Ms,
}

impl AffectedSetIndex {
    pub fn get(&self, unit_id: &Ulid) -> Option<&HashSet<Ulid>> {
        self.sets.get(unit_id)
    }

    /// Members of `unit_id`'s AffectedSet. A unit created after the last
    /// rebuild is not indexed yet and affects only itself until then.
    pub fn members(&self, unit_id: &Ulid) -> Vec<Ulid> {
        match self.sets.get(unit_id) {
            Some(set) => set.iter().copied().collect(),
            None => vec![*unit_id],
        }
    }

    pub fn affects(&self, a: &Ulid, b: &Ulid) -> bool {
        a == b || self.sets.get(a).is_some_and(|set| set.contains(b))
    }

    pub fn unit_count(&self) -> usize {
        self.sets.len()
    }

    pub fn units(&self) -> impl Iterator<Item = &Ulid> {
        self.sets.keys()
    }
}

/// Ancestors of every space, nearest first. Rejects dangling parents,
/// cycles, and trees deeper than `MAX_HIERARCHY_DEPTH`.
fn ancestor_chains(spaces: &[Space]) -> Result<HashMap<Ulid, Vec<Ulid>>, HierarchyError> {
    let parents: HashMap<Ulid, Option<Ulid>> =
        spaces.iter().map(|s| (s.id, s.parent_id)).collect();

    let mut chains = HashMap::with_capacity(spaces.len());
    for space in spaces {
        let mut chain = Vec::new();
        let mut visited = HashSet::from([space.id]);
        let mut current = space.parent_id;
        while let Some(pid) = current {
            if !visited.insert(pid) {
                return Err(HierarchyError::Cycle(pid));
            }
            if chain.len() >= MAX_HIERARCHY_DEPTH {
                return Err(HierarchyError::TooDeep(MAX_HIERARCHY_DEPTH));
            }
            let next = parents.get(&pid).ok_or(HierarchyError::DanglingParent {
                space: space.id,
                parent: pid,
            })?;
            chain.push(pid);
            current = *next;
        }
        chains.insert(space.id, chain);
    }
    Ok(chains)
}

/// Build the AffectedSet of every reservation unit in one pass.
pub fn rebuild_affected_sets(
    structure: &Structure,
    version: u64,
    now: Ms,
) -> Result<AffectedSetIndex, HierarchyError> {
    let ancestors = ancestor_chains(&structure.spaces)?;

    // family(s) = s ∪ ancestors(s) ∪ descendants(s)
    let mut family: HashMap<Ulid, HashSet<Ulid>> = ancestors
        .iter()
        .map(|(id, chain)| {
            let mut set: HashSet<Ulid> = chain.iter().copied().collect();
            set.insert(*id);
            (*id, set)
        })
        .collect();
    for (id, chain) in &ancestors {
        for ancestor in chain {
            if let Some(set) = family.get_mut(ancestor) {
                set.insert(*id);
            }
        }
    }

    let known_resources: HashSet<Ulid> = structure.resources.iter().map(|r| r.id).collect();
    let mut units_by_space: HashMap<Ulid, Vec<Ulid>> = HashMap::new();
    let mut units_by_resource: HashMap<Ulid, Vec<Ulid>> = HashMap::new();
    for unit in &structure.units {
        for space in &unit.space_ids {
            if !family.contains_key(space) {
                return Err(HierarchyError::UnknownSpace { unit: unit.id, space: *space });
            }
            units_by_space.entry(*space).or_default().push(unit.id);
        }
        for resource in &unit.resource_ids {
            if !known_resources.contains(resource) {
                return Err(HierarchyError::UnknownResource {
                    unit: unit.id,
                    resource: *resource,
                });
            }
            units_by_resource.entry(*resource).or_default().push(unit.id);
        }
    }

    let mut sets = HashMap::with_capacity(structure.units.len());
    for unit in &structure.units {
        let mut affected = HashSet::from([unit.id]);
        for space in &unit.space_ids {
            for related in &family[space] {
                if let Some(owners) = units_by_space.get(related) {
                    affected.extend(owners.iter().copied());
                }
            }
        }
        for resource in &unit.resource_ids {
            if let Some(owners) = units_by_resource.get(resource) {
                affected.extend(owners.iter().copied());
            }
        }
        sets.insert(unit.id, affected);
    }

    Ok(AffectedSetIndex {
        sets,
        version,
        built_at: now,
    })
}

/// The AffectedSet index lags structural writes for longer than allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructuralStalenessWarning {
    pub index_version: u64,
    pub current_version: u64,
    pub stale_for_ms: Ms,
}

impl std::fmt::Display for StructuralStalenessWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "affected-set index at version {} lags structure version {} for {}ms",
            self.index_version, self.current_version, self.stale_for_ms
        )
    }
}
