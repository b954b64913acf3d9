//! Range-precise reaching definitions over [`SharingMap`]s.
//!
//! Every program point holds one [`RdDomain`]: a map from identifier to the
//! set of interned [`Record`]s that may reach that point. States are copied
//! along every CFG edge, so the map is a persistent [`SharingMap`] and the
//! join picks whichever side is already closer to the union as the
//! accumulator.
//!
//! ```
//! use std::rc::Rc;
//! use rd_sharing::domain::{MergeStats, RdConfig, RdDomain};
//! use rd_sharing::interner::RecordInterner;
//! use rd_sharing::types::{Identifier, Location};
//!
//! let interner = Rc::new(RecordInterner::default());
//! let x = Identifier::new("x");
//!
//! let mut a = RdDomain::entry(interner, RdConfig::default());
//! a.gen(Location::new(1), &x, 0, 32);
//! let mut b = a.clone();
//! b.gen(Location::new(2), &x, 0, 32);
//!
//! let mut stats = MergeStats::default();
//! assert!(a.merge(&b, &mut stats).unwrap());
//! assert_eq!(a.get(&x).len(), 2);
//! ```

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug, Display, Formatter};
use std::rc::Rc;

use log::{debug, trace};
use rustc_hash::FxHashMap;

use crate::error::{Feature, RdError, Result};
use crate::interner::{Record, RecordId, RecordInterner};
use crate::sharing_map::SharingMap;
use crate::types::{Identifier, Location, RangeSpec, Ternary};

/// Ids of the records reaching a point, for one identifier.
pub type ValuesInner = BTreeSet<RecordId>;

/// Bit ranges grouped by the location that defined them.
pub type RangesAtLoc = BTreeMap<Location, BTreeSet<(RangeSpec, RangeSpec)>>;

pub type Values = SharingMap<Identifier, ValuesInner>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Lattice {
    Bottom,
    Normal,
    Top,
}

/// Which side of a join accumulates the union.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum MergeDirection {
    /// Always extend `self` with the entries of `other`.
    IntoSelf,
    /// Always copy `other` in and extend it with the old entries of `self`.
    IntoOther,
    /// Score both sides and extend the one closer to the union.
    #[default]
    Dynamic,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RdConfig {
    /// Hide callee-invisible locals across calls and restore them on return.
    pub remove_locals: bool,
    pub merge_direction: MergeDirection,
}

impl Default for RdConfig {
    fn default() -> Self {
        Self {
            remove_locals: true,
            merge_direction: MergeDirection::default(),
        }
    }
}

/// Counters for the merge-direction heuristic.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct MergeStats {
    pub into_self: usize,
    pub into_other: usize,
    /// Merges where `self` was bottom and became a copy.
    pub from_bottom: usize,
    /// Merges of a bottom `other`, which are no-ops.
    pub of_bottom: usize,
}

impl MergeStats {
    pub fn total(&self) -> usize {
        self.into_self + self.into_other + self.from_bottom + self.of_bottom
    }
}

impl Display for MergeStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "merges: {} into self, {} into other, {} from bottom, {} of bottom",
            self.into_self, self.into_other, self.from_bottom, self.of_bottom
        )
    }
}

pub struct RdDomain {
    pub(crate) values: Values,
    lattice: Lattice,
    interner: Rc<RecordInterner>,
    config: RdConfig,
    export_cache: RefCell<FxHashMap<Identifier, Rc<RangesAtLoc>>>,
}

impl RdDomain {
    /// A bottom state: not yet reached.
    pub fn new(interner: Rc<RecordInterner>, config: RdConfig) -> Self {
        Self {
            values: SharingMap::new(),
            lattice: Lattice::Bottom,
            interner,
            config,
            export_cache: RefCell::new(FxHashMap::default()),
        }
    }

    /// A reached state with no definitions, for the program entry.
    pub fn entry(interner: Rc<RecordInterner>, config: RdConfig) -> Self {
        let mut state = Self::new(interner, config);
        state.make_entry();
        state
    }

    /// Mark as unreached, dropping every definition.
    pub fn make_bottom(&mut self) {
        self.values.clear();
        self.lattice = Lattice::Bottom;
        self.invalidate_all();
    }

    /// Mark as "anything may reach". Never produced by the transfer functions.
    pub fn make_top(&mut self) {
        self.values.clear();
        self.lattice = Lattice::Top;
        self.invalidate_all();
    }

    /// Mark as reached with no definitions.
    pub fn make_entry(&mut self) {
        self.values.clear();
        self.lattice = Lattice::Normal;
        self.invalidate_all();
    }

    pub fn is_bottom(&self) -> bool {
        self.lattice == Lattice::Bottom
    }

    pub fn is_top(&self) -> bool {
        self.lattice == Lattice::Top
    }

    /// Whether any definition reaches: known only for bottom and top.
    pub fn has_values(&self) -> Ternary {
        match self.lattice {
            Lattice::Bottom => Ternary::False,
            Lattice::Top => Ternary::True,
            Lattice::Normal => Ternary::Unknown,
        }
    }

    pub fn config(&self) -> RdConfig {
        self.config
    }

    pub fn interner(&self) -> &Rc<RecordInterner> {
        &self.interner
    }

    pub fn values(&self) -> &Values {
        &self.values
    }

    /// Tracked identifiers, sorted.
    pub fn identifiers(&self) -> Vec<&Identifier> {
        let mut ids: Vec<_> = self.values.keys().collect();
        ids.sort();
        ids
    }

    /// The records reaching this point for `identifier`, in id order.
    pub fn records(&self, identifier: &Identifier) -> Vec<Record> {
        match self.values.find(identifier) {
            None => Vec::new(),
            Some(ids) => ids.iter().map(|&id| self.interner.get(id)).collect(),
        }
    }

    fn invalidate(&self, identifier: &Identifier) {
        self.export_cache.borrow_mut().remove(identifier);
    }

    fn invalidate_all(&self) {
        self.export_cache.borrow_mut().clear();
    }

    /// Record that `identifier` is written in `[bit_begin, bit_end)` at `from`.
    ///
    /// Returns whether the identifier's set grew. Zero-width writes are
    /// ignored.
    pub fn gen(&mut self, from: Location, identifier: &Identifier, bit_begin: RangeSpec, bit_end: RangeSpec) -> bool {
        // Objects of size zero, like zero-width bit-fields.
        if bit_begin == 0 && bit_end == 0 {
            return false;
        }

        assert!(bit_begin >= 0, "Range begin {} is negative", bit_begin);
        assert!(
            bit_end > bit_begin || bit_end == -1,
            "Range end {} is neither after begin {} nor unknown",
            bit_end,
            bit_begin
        );

        let id = self
            .interner
            .add(Record::new(identifier.clone(), from, bit_begin, bit_end));

        // Look before writing: `find_mut` path-copies even when the id is
        // already there.
        let known = self.values.find(identifier).map(|ids| ids.contains(&id));
        let added = match known {
            Some(true) => false,
            Some(false) => self.values.find_mut(identifier).is_some_and(|ids| ids.insert(id)),
            None => self.values.insert_with_hint(identifier.clone(), BTreeSet::from([id]), Ternary::False),
        };
        if added {
            trace!("gen {} as {}", self.interner.get(id), id);
            self.invalidate(identifier);
        }
        added
    }

    /// Drop every definition of `identifier` overlapping `[bit_begin, bit_end)`.
    ///
    /// Returns whether anything was dropped.
    pub fn kill(&mut self, identifier: &Identifier, bit_begin: RangeSpec, bit_end: RangeSpec) -> bool {
        let Some(ids) = self.values.find(identifier) else {
            return false;
        };
        let kept: ValuesInner = ids
            .iter()
            .copied()
            .filter(|&id| !self.interner.get(id).overlaps(bit_begin, bit_end))
            .collect();
        if kept.len() == ids.len() {
            return false;
        }
        trace!("kill {}[{}:{}]: {} -> {}", identifier, bit_begin, bit_end, ids.len(), kept.len());
        if kept.is_empty() {
            self.values.erase(identifier);
        } else {
            self.values.insert_with_hint(identifier.clone(), kept, Ternary::True);
        }
        self.invalidate(identifier);
        true
    }

    /// Forget `identifier` entirely.
    pub fn erase(&mut self, identifier: &Identifier) -> bool {
        let erased = self.values.erase(identifier);
        if erased {
            self.invalidate(identifier);
        }
        erased
    }

    /// Join `other` into `self`, returning whether `self` changed.
    ///
    /// The accumulating side follows [`RdConfig::merge_direction`]. With
    /// [`MergeDirection::Dynamic`] both sides are scored by how close they
    /// already are to the union, and the closer one accumulates. When that
    /// is `other`, its map is copied (sharing nodes) and swapped in, so only
    /// the differing entries of the old `self` get merged.
    pub fn merge(&mut self, other: &RdDomain, stats: &mut MergeStats) -> Result<bool> {
        if other.is_bottom() {
            stats.of_bottom += 1;
            return Ok(false);
        }

        if self.is_top() || other.is_top() {
            return Err(RdError::Invariant("top is never produced by reaching definitions"));
        }

        if self.is_bottom() {
            self.values = other.values.clone();
            self.lattice = other.lattice;
            self.invalidate_all();
            stats.from_bottom += 1;
            return Ok(true);
        }

        let into_self = match self.config.merge_direction {
            MergeDirection::IntoSelf => true,
            MergeDirection::IntoOther => false,
            MergeDirection::Dynamic => {
                let (score_self, score_other) = self.direction_score(other);
                debug!(
                    "merge scores: self {} vs other {}, accumulating into {}",
                    score_self,
                    score_other,
                    if score_self >= score_other { "self" } else { "other" }
                );
                score_self >= score_other
            }
        };

        let rest = if into_self {
            stats.into_self += 1;
            other.values.clone()
        } else {
            stats.into_other += 1;
            let mut theirs = other.values.clone();
            self.values.swap(&mut theirs);
            theirs
        };
        let swapped = !into_self;

        // Iterate over a snapshot so `self.values` can be path-copied below.
        let accumulator = self.values.clone();
        let mut changed = false;
        for entry in accumulator.delta_view(&rest, false) {
            match (entry.value, entry.other_value) {
                (Some(_), None) => {
                    // Only the accumulator has it: new for the old self iff swapped.
                    changed |= swapped;
                }
                (None, Some(theirs)) => {
                    trace!("merge: {} taken over", entry.key);
                    self.values
                        .insert_with_hint(entry.key.clone(), theirs.clone(), Ternary::False);
                    changed |= into_self;
                }
                (Some(ours), Some(theirs)) => {
                    if ours.is_superset(theirs) {
                        // The sets differ, so the accumulator holds strictly more.
                        changed |= swapped;
                    } else {
                        let Some(inner) = self.values.find_mut(entry.key) else {
                            return Err(RdError::Invariant("key in both maps is missing from the accumulator"));
                        };
                        inner.extend(theirs.iter().copied());
                        trace!("merge: {} united to {} ids", entry.key, inner.len());
                        changed |= into_self || *inner != *theirs;
                    }
                }
                (None, None) => {
                    return Err(RdError::Invariant("delta entry with no value on either side"));
                }
            }
        }

        self.invalidate_all();
        Ok(changed)
    }

    /// Count, per side, the keys where that side already covers the other.
    fn direction_score(&self, other: &RdDomain) -> (usize, usize) {
        let mut score_self = 0;
        let mut score_other = 0;
        // Shared subtrees are skipped even with `include_equal`; they would
        // score both sides alike.
        for entry in self.values.delta_view(&other.values, true) {
            match (entry.value, entry.other_value) {
                (Some(ours), Some(theirs)) => {
                    if ours.is_superset(theirs) {
                        score_self += 1;
                    }
                    if theirs.is_superset(ours) {
                        score_other += 1;
                    }
                }
                (Some(_), None) => score_self += 1,
                (None, Some(_)) => score_other += 1,
                (None, None) => {}
            }
        }
        (score_self, score_other)
    }

    /// Merging cross-thread writes is not supported.
    pub fn merge_shared(&mut self, _other: &RdDomain, _from: Location, _to: Location) -> Result<bool> {
        Err(RdError::Unsupported(Feature::MergeShared))
    }

    /// The ranges of `identifier` reaching this point, grouped by defining
    /// location.
    pub fn get(&self, identifier: &Identifier) -> Rc<RangesAtLoc> {
        if let Some(cached) = self.export_cache.borrow().get(identifier) {
            return Rc::clone(cached);
        }

        let ids = match self.values.find(identifier) {
            Some(ids) if !ids.is_empty() => ids,
            _ => return Rc::new(RangesAtLoc::new()),
        };

        let mut ranges = RangesAtLoc::new();
        for &id in ids {
            let record = self.interner.get(id);
            ranges
                .entry(record.definition_at)
                .or_default()
                .insert((record.bit_begin, record.bit_end));
        }
        let ranges = Rc::new(ranges);
        self.export_cache
            .borrow_mut()
            .insert(identifier.clone(), Rc::clone(&ranges));
        ranges
    }

    /// Restore the state of `saved`, keeping the lattice tag.
    pub(crate) fn restore_values(&mut self, saved: &RdDomain) {
        self.values = saved.values.clone();
        self.invalidate_all();
    }

    pub(crate) fn take_values(&mut self) -> Values {
        let mut taken = SharingMap::new();
        self.values.swap(&mut taken);
        self.invalidate_all();
        taken
    }
}

impl Clone for RdDomain {
    fn clone(&self) -> Self {
        Self {
            values: self.values.clone(),
            lattice: self.lattice,
            interner: Rc::clone(&self.interner),
            config: self.config,
            export_cache: RefCell::new(FxHashMap::default()),
        }
    }
}

impl PartialEq for RdDomain {
    fn eq(&self, other: &Self) -> bool {
        self.lattice == other.lattice && self.values == other.values
    }
}

impl Eq for RdDomain {}

impl Debug for RdDomain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RdDomain")
            .field("lattice", &self.lattice)
            .field("identifiers", &self.values.len())
            .finish()
    }
}

impl Display for RdDomain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Reaching definitions:")?;

        let has_values = self.has_values();
        if has_values.is_known() {
            return writeln!(f, "{}", has_values);
        }

        for identifier in self.identifiers() {
            write!(f, "  {}", identifier)?;
            let mut first = true;
            for (at, ranges) in self.get(identifier).iter() {
                for (begin, end) in ranges {
                    if !first {
                        write!(f, " ")?;
                    }
                    first = false;
                    write!(f, "[{}:{}]@{}", begin, end, at)?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
