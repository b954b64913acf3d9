//! Collaborators the reaching-definitions transfer functions consult.
//!
//! The domain never reaches into a concrete analysis type. It asks the
//! [`Analyzer`] it is handed for the [`RdContext`] capability, and fails with
//! [`RdError::ContextMismatch`][crate::error::RdError::ContextMismatch] when
//! the analyzer does not provide one.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::domain::RdDomain;
use crate::program::{Expr, GotoModel, InstructionKind, Operator, Type};
use crate::rw_range::object_offset;
use crate::types::{Identifier, Location};

/// An abstract interpreter driving domain states.
pub trait Analyzer {
    /// The reaching-definitions capability, if this analyzer has one.
    fn reaching_definitions(&self) -> Option<&dyn RdContext> {
        None
    }
}

/// What the reaching-definitions transfer functions need from the analysis.
pub trait RdContext {
    fn value_sets(&self) -> &dyn ValueSets;

    /// Whether `location` may run concurrently with another thread.
    fn is_threaded(&self, location: Location) -> bool;

    /// Whether the address of `identifier` escapes.
    fn is_dirty(&self, identifier: &Identifier) -> bool;

    /// The state recorded before the instruction at `location`.
    fn state_at(&self, location: Location) -> Option<&RdDomain>;
}

/// An object a pointer may point into.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PointerTarget {
    /// `None` for objects without a symbol (null, unknown memory).
    pub identifier: Option<Identifier>,
    /// Bit offset into the object, `None` when unknown.
    pub offset: Option<u64>,
}

impl PointerTarget {
    /// A known object, at `offset` bits if known.
    pub fn object(identifier: &str, offset: Option<u64>) -> Self {
        Self {
            identifier: Some(Identifier::new(identifier)),
            offset,
        }
    }

    /// The null pointer.
    pub fn null() -> Self {
        Self {
            identifier: None,
            offset: Some(0),
        }
    }

    /// Anything at all.
    pub fn unknown() -> Self {
        Self {
            identifier: None,
            offset: None,
        }
    }

    fn with_unknown_offset(mut self) -> Self {
        self.offset = None;
        self
    }
}

/// Pointer value sets.
pub trait ValueSets {
    /// Objects `pointer` may point to when evaluated at `at`.
    fn targets(&self, pointer: &Expr, at: Location) -> Vec<PointerTarget>;

    /// Narrow the value sets with `guard`, assumed to hold at `at`.
    fn assume(&self, _guard: &Expr, _at: Location) {}
}

/// Flow-insensitive points-to sets for pointer symbols.
///
/// Built once per program from `p = &x`, `p = q`, `*pp = &x`, and
/// argument-to-parameter bindings, iterated until no set grows.
#[derive(Debug, Clone, Default)]
pub struct PointsToMap {
    sets: BTreeMap<Identifier, BTreeSet<PointerTarget>>,
}

impl PointsToMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flow-insensitive points-to sets of every pointer assigned or passed in `model`.
    pub fn from_program(model: &GotoModel) -> Self {
        let mut bindings: Vec<(Expr, &Expr)> = Vec::new();
        for (_, inst) in model.program.instructions() {
            match &inst.kind {
                InstructionKind::Assign { lhs, rhs } if is_pointer(lhs.ty()) => bindings.push((lhs.clone(), rhs)),
                InstructionKind::FunctionCall(call) => {
                    let Some(params) = model.parameters(&call.function) else {
                        continue;
                    };
                    for (p, arg) in params.iter().zip(&call.arguments) {
                        if !p.identifier.is_empty() && is_pointer(&p.ty) {
                            let formal = Expr::Symbol {
                                identifier: p.identifier.clone(),
                                ty: p.ty.clone(),
                            };
                            bindings.push((formal, arg));
                        }
                    }
                }
                _ => {}
            }
        }

        let mut map = Self::new();
        let mut rounds = 0;
        loop {
            rounds += 1;
            let mut changed = false;
            for (lhs, rhs) in &bindings {
                let values = map.eval(rhs);
                for pointer in map.pointer_symbols(lhs) {
                    let set = map.sets.entry(pointer).or_default();
                    for v in &values {
                        changed |= set.insert(v.clone());
                    }
                }
            }
            if !changed {
                break;
            }
        }
        debug!("points-to map stable after {} rounds, {} pointers", rounds, map.sets.len());
        map
    }

    /// Add `target` to the set of `pointer`.
    pub fn insert(&mut self, pointer: &str, target: PointerTarget) -> bool {
        self.sets.entry(Identifier::new(pointer)).or_default().insert(target)
    }

    /// Targets of `pointer`, if it was ever bound.
    pub fn get(&self, pointer: &Identifier) -> Option<&BTreeSet<PointerTarget>> {
        self.sets.get(pointer)
    }

    /// Possible values of a pointer-typed expression.
    fn eval(&self, expr: &Expr) -> BTreeSet<PointerTarget> {
        let mut out = BTreeSet::new();
        match expr {
            Expr::AddressOf { object, .. } => match object.as_ref() {
                Expr::Dereference { pointer, .. } => out = self.eval(pointer),
                _ => match object_offset(object) {
                    Some((id, offset)) => {
                        out.insert(PointerTarget {
                            identifier: Some(id),
                            offset,
                        });
                    }
                    None => {
                        out.insert(PointerTarget::unknown());
                    }
                },
            },
            Expr::Symbol { .. } | Expr::Member { .. } | Expr::Index { .. } => {
                if let Some(set) = expr.root_object().and_then(|id| self.sets.get(id)) {
                    out.extend(set.iter().cloned());
                }
            }
            Expr::Typecast { op, .. } => out = self.eval(op),
            Expr::Constant { value: 0, .. } => {
                out.insert(PointerTarget::null());
            }
            Expr::Operation {
                operator: Operator::Plus | Operator::Minus,
                operands,
                ..
            } => {
                for op in operands.iter().filter(|op| is_pointer(op.ty())) {
                    out.extend(self.eval(op).into_iter().map(PointerTarget::with_unknown_offset));
                }
            }
            Expr::Dereference { pointer, .. } => {
                // Loading a pointer through a pointer.
                for target in self.eval(pointer) {
                    if let Some(set) = target.identifier.as_ref().and_then(|id| self.sets.get(id)) {
                        out.extend(set.iter().cloned());
                    }
                }
            }
            _ => {
                out.insert(PointerTarget::unknown());
            }
        }
        out
    }

    /// Pointer symbols an assignment to `lhs` updates.
    fn pointer_symbols(&self, lhs: &Expr) -> Vec<Identifier> {
        match lhs {
            Expr::Symbol { identifier, .. } => vec![identifier.clone()],
            Expr::Typecast { op, .. } => self.pointer_symbols(op),
            Expr::Dereference { pointer, .. } => self
                .eval(pointer)
                .into_iter()
                .filter_map(|t| t.identifier)
                .collect(),
            // Pointers inside aggregates are tracked per whole object.
            other => other.root_object().cloned().into_iter().collect(),
        }
    }
}

fn is_pointer(ty: &Type) -> bool {
    matches!(ty, Type::Pointer(_))
}

impl ValueSets for PointsToMap {
    fn targets(&self, pointer: &Expr, _at: Location) -> Vec<PointerTarget> {
        self.eval(pointer).into_iter().collect()
    }
}

/// Symbols whose address is taken somewhere in the program.
#[derive(Debug, Clone, Default)]
pub struct DirtyVariables {
    dirty: BTreeSet<Identifier>,
}

impl DirtyVariables {
    /// Every variable whose address is taken somewhere in `model`.
    pub fn from_program(model: &GotoModel) -> Self {
        let mut dirty = BTreeSet::new();
        for (_, inst) in model.program.instructions() {
            for expr in inst.kind.expressions() {
                expr.visit(&mut |e| {
                    if let Expr::AddressOf { object, .. } = e {
                        if let Some(id) = object.root_object() {
                            dirty.insert(id.clone());
                        }
                    }
                });
            }
        }
        debug!("{} dirty variables", dirty.len());
        Self { dirty }
    }

    /// Whether the address of `identifier` may escape.
    pub fn is_dirty(&self, identifier: &Identifier) -> bool {
        self.dirty.contains(identifier)
    }

    /// Number of address-taken variables.
    pub fn len(&self) -> usize {
        self.dirty.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::program::{Call, GotoProgram, Parameter, SymbolTable};

    fn int_ptr() -> Type {
        Type::pointer_to(Type::int())
    }

    fn model(body: Vec<InstructionKind>) -> GotoModel {
        let mut symbols = SymbolTable::new();
        symbols.add_local("x", Type::int());
        symbols.add_local("y", Type::int());
        symbols.add_local("p", int_ptr());
        symbols.add_local("q", int_ptr());
        symbols.add_function("f", vec![Parameter::new("a", int_ptr())], Type::Empty);
        let mut program = GotoProgram::new();
        program.add_function("main", body);
        program.add_function("f", vec![]);
        GotoModel::new(symbols, program)
    }

    fn x() -> Expr {
        Expr::symbol("x", Type::int())
    }

    fn y() -> Expr {
        Expr::symbol("y", Type::int())
    }

    fn p() -> Expr {
        Expr::symbol("p", int_ptr())
    }

    fn q() -> Expr {
        Expr::symbol("q", int_ptr())
    }

    #[test]
    fn test_address_of_and_copy() {
        let m = model(vec![
            InstructionKind::assign(q(), Expr::address_of(y())),
            InstructionKind::assign(p(), Expr::address_of(x())),
            InstructionKind::assign(p(), q()),
        ]);
        let pts = PointsToMap::from_program(&m);
        let targets = pts.targets(&p(), Location::new(0));
        assert_eq!(
            targets,
            vec![PointerTarget::object("x", Some(0)), PointerTarget::object("y", Some(0))]
        );
        assert_eq!(pts.targets(&q(), Location::new(0)), vec![PointerTarget::object("y", Some(0))]);
    }

    #[test]
    fn test_copy_before_address_of_reaches_fixpoint() {
        // The copy precedes the assignment it depends on.
        let m = model(vec![
            InstructionKind::assign(p(), q()),
            InstructionKind::assign(q(), Expr::address_of(x())),
        ]);
        let pts = PointsToMap::from_program(&m);
        assert_eq!(pts.targets(&p(), Location::new(0)), vec![PointerTarget::object("x", Some(0))]);
    }

    #[test]
    fn test_arguments_bind_parameters() {
        let m = model(vec![InstructionKind::call(Call::new(None, "f", vec![Expr::address_of(x())]))]);
        let pts = PointsToMap::from_program(&m);
        let a = Expr::symbol("a", int_ptr());
        assert_eq!(pts.targets(&a, Location::new(0)), vec![PointerTarget::object("x", Some(0))]);
    }

    #[test]
    fn test_null_and_unknown() {
        let m = model(vec![
            InstructionKind::assign(p(), Expr::constant(0, int_ptr())),
            InstructionKind::assign(q(), Expr::nondet(int_ptr())),
        ]);
        let pts = PointsToMap::from_program(&m);
        assert_eq!(pts.targets(&p(), Location::new(0)), vec![PointerTarget::null()]);
        assert_eq!(pts.targets(&q(), Location::new(0)), vec![PointerTarget::unknown()]);
    }

    #[test]
    fn test_dirty_variables() {
        let m = model(vec![
            InstructionKind::assign(p(), Expr::address_of(x())),
            InstructionKind::assign(y(), Expr::constant(1, Type::int())),
        ]);
        let dirty = DirtyVariables::from_program(&m);
        assert!(dirty.is_dirty(&"x".into()));
        assert!(!dirty.is_dirty(&"y".into()));
        assert!(!dirty.is_dirty(&"p".into()));
        assert_eq!(dirty.len(), 1);
    }

    #[test]
    fn test_default_analyzer_has_no_capability() {
        struct Plain;
        impl Analyzer for Plain {}
        assert!(Plain.reaching_definitions().is_none());
    }
}
