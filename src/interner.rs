//! Definition records and the run-wide interner that numbers them.

use std::cell::RefCell;
use std::fmt::{self, Debug, Display, Formatter};

use log::trace;

use crate::table::Table;
use crate::types::{Identifier, Location, RangeSpec};
use crate::utils::{fx_hash, MyHash};

/// One definition: `identifier` was written in bits `[bit_begin, bit_end)`
/// at `definition_at`.
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash)]
pub struct Record {
    pub identifier: Identifier,
    pub definition_at: Location,
    pub bit_begin: RangeSpec,
    pub bit_end: RangeSpec,
}

impl Record {
    pub fn new(
        identifier: Identifier,
        definition_at: Location,
        bit_begin: RangeSpec,
        bit_end: RangeSpec,
    ) -> Self {
        Self {
            identifier,
            definition_at,
            bit_begin,
            bit_end,
        }
    }

    /// Whether the written range intersects `[begin, end)`.
    ///
    /// An end of `-1` extends to infinity on either side.
    pub fn overlaps(&self, begin: RangeSpec, end: RangeSpec) -> bool {
        let starts_before_other_ends = end == -1 || self.bit_begin < end;
        let other_starts_before_end = self.bit_end == -1 || begin < self.bit_end;
        starts_before_other_ends && other_starts_before_end
    }
}

impl MyHash for Record {
    fn hash(&self) -> u64 {
        fx_hash(self)
    }
}

impl Display for Record {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}:{}]@{}",
            self.identifier, self.bit_begin, self.bit_end, self.definition_at
        )
    }
}

/// Stable id of an interned [`Record`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordId(usize);

impl RecordId {
    pub const fn index(self) -> usize {
        self.0
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Bijection between [`Record`]s and [`RecordId`]s, append-only for the run.
///
/// A single interner is shared (through `Rc`) by every domain state of an
/// analysis run, so that id equality coincides with record equality.
pub struct RecordInterner {
    table: RefCell<Table<Record>>,
}

impl RecordInterner {
    pub fn new(bits: usize) -> Self {
        Self {
            table: RefCell::new(Table::new(bits)),
        }
    }

    /// Intern `record`, returning the id of the equal record if there is one.
    pub fn add(&self, record: Record) -> RecordId {
        let mut table = self.table.borrow_mut();
        let before = table.len();
        let index = table.put(record);
        if table.len() != before {
            trace!("interned {} as #{}", table[index], index);
        }
        RecordId(index)
    }

    /// The id of `record` if it was interned before.
    pub fn find(&self, record: &Record) -> Option<RecordId> {
        self.table.borrow().find(record).map(RecordId)
    }

    /// The record behind `id`.
    ///
    /// Panics if `id` was not produced by this interner.
    pub fn get(&self, id: RecordId) -> Record {
        self.table.borrow().value(id.0).clone()
    }

    pub fn len(&self) -> usize {
        self.table.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RecordInterner {
    fn default() -> Self {
        RecordInterner::new(16)
    }
}

impl Debug for RecordInterner {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordInterner")
            .field("len", &self.len())
            .finish()
    }
}
