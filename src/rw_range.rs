//! Bit ranges written by an assignment target.

use std::fmt::{self, Display, Formatter};

use crate::context::ValueSets;
use crate::program::Expr;
use crate::types::{Identifier, Location, RangeSpec, UNKNOWN_END};

/// `identifier` is (possibly) written in bits `[bit_begin, bit_end)`.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct WrittenRange {
    pub identifier: Identifier,
    pub bit_begin: RangeSpec,
    pub bit_end: RangeSpec,
}

impl WrittenRange {
    fn new(identifier: Identifier, offset: Option<u64>, width: Option<u64>) -> Self {
        let (bit_begin, bit_end) = match offset.and_then(to_range_spec) {
            None => (0, UNKNOWN_END),
            Some(begin) => {
                let end = width
                    .and_then(to_range_spec)
                    .and_then(|w| begin.checked_add(w))
                    .unwrap_or(UNKNOWN_END);
                (begin, end)
            }
        };
        Self {
            identifier,
            bit_begin,
            bit_end,
        }
    }
}

impl Display for WrittenRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}:{}]", self.identifier, self.bit_begin, self.bit_end)
    }
}

fn to_range_spec(bits: u64) -> Option<RangeSpec> {
    RangeSpec::try_from(bits).ok()
}

/// All ranges `lhs` may write when assigned at `at`.
///
/// Dereferences fan out to every object the pointer may target. Objects
/// without a symbol (null, unknown) are skipped.
pub fn written_ranges(lhs: &Expr, at: Location, value_sets: &dyn ValueSets) -> Vec<WrittenRange> {
    let mut out = Vec::new();
    let width = lhs.ty().bit_width();
    if width == Some(0) {
        return out;
    }
    collect(lhs, Some(0), width, at, value_sets, &mut out);
    out.sort();
    out.dedup();
    out
}

fn collect(
    expr: &Expr,
    offset: Option<u64>,
    width: Option<u64>,
    at: Location,
    value_sets: &dyn ValueSets,
    out: &mut Vec<WrittenRange>,
) {
    match expr {
        Expr::Symbol { identifier, .. } => {
            out.push(WrittenRange::new(identifier.clone(), offset, width));
        }
        Expr::Member { compound, field, .. } => {
            let field_offset = compound.ty().member_offset(field);
            let offset = offset.zip(field_offset).and_then(|(a, b)| a.checked_add(b));
            collect(compound, offset, width, at, value_sets, out);
        }
        Expr::Index { array, index, ty } => {
            let offset = match (offset, index.as_ref(), ty.bit_width()) {
                (Some(base), Expr::Constant { value, .. }, Some(element)) if *value >= 0 => {
                    (*value as u64).checked_mul(element).and_then(|o| o.checked_add(base))
                }
                _ => None,
            };
            collect(array, offset, width, at, value_sets, out);
        }
        Expr::Typecast { op, .. } => collect(op, offset, width, at, value_sets, out),
        Expr::Dereference { pointer, .. } => {
            for target in value_sets.targets(pointer, at) {
                let Some(identifier) = target.identifier else {
                    continue;
                };
                let offset = offset.zip(target.offset).and_then(|(a, b)| a.checked_add(b));
                out.push(WrittenRange::new(identifier, offset, width));
            }
        }
        Expr::Constant { .. } | Expr::Nondet { .. } | Expr::AddressOf { .. } | Expr::Operation { .. } => {
            log::debug!("{} is not an lvalue, nothing written", expr);
        }
    }
}

/// The symbol an object expression lives in and its bit offset there,
/// without following dereferences.
pub fn object_offset(expr: &Expr) -> Option<(Identifier, Option<u64>)> {
    match expr {
        Expr::Symbol { identifier, .. } => Some((identifier.clone(), Some(0))),
        Expr::Member { compound, field, .. } => {
            let (id, base) = object_offset(compound)?;
            let field_offset = compound.ty().member_offset(field);
            Some((id, base.zip(field_offset).and_then(|(a, b)| a.checked_add(b))))
        }
        Expr::Index { array, index, ty } => {
            let (id, base) = object_offset(array)?;
            let offset = match (base, index.as_ref(), ty.bit_width()) {
                (Some(base), Expr::Constant { value, .. }, Some(element)) if *value >= 0 => {
                    (*value as u64).checked_mul(element).and_then(|o| o.checked_add(base))
                }
                _ => None,
            };
            Some((id, offset))
        }
        Expr::Typecast { op, .. } => object_offset(op),
        _ => None,
    }
}
