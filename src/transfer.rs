//! Per-instruction transfer functions for [`RdDomain`].

use log::{debug, trace};

use crate::context::{Analyzer, RdContext};
use crate::domain::RdDomain;
use crate::error::{Feature, RdError, Result};
use crate::program::{Call, Expr, GotoModel, InstructionKind, Parameter};
use crate::rw_range::written_ranges;
use crate::types::{Identifier, Location, RangeSpec, UNKNOWN_END};

impl RdDomain {
    /// Apply the effect of the edge `from -> to` to this state.
    ///
    /// `ai` must expose a reaching-definitions context; anything else is a
    /// [`RdError::ContextMismatch`]. Bottom states stay bottom.
    pub fn transform(&mut self, model: &GotoModel, from: Location, to: Location, ai: &dyn Analyzer) -> Result<()> {
        let ctx = ai.reaching_definitions().ok_or(RdError::ContextMismatch)?;

        if self.is_bottom() {
            return Ok(());
        }

        let instruction = model
            .program
            .get(from)
            .ok_or(RdError::Invariant("transform from a location outside the program"))?;
        debug!("transform {} -> {}: {}", from, to, instruction.kind.name());

        match &instruction.kind {
            InstructionKind::Decl(_) => {}
            InstructionKind::Dead(identifier) => {
                self.erase(identifier);
            }
            InstructionKind::Assign { lhs, .. } => self.transform_assign(lhs, from, ctx),
            InstructionKind::FunctionCall(call) => self.transform_function_call(model, call, from, to, ctx)?,
            InstructionKind::EndFunction => self.transform_end_function(model, from, to, ctx)?,
            InstructionKind::Goto { .. }
            | InstructionKind::Assert(_)
            | InstructionKind::Skip
            | InstructionKind::Location
            | InstructionKind::Other => {}
            InstructionKind::Assume(guard) => ctx.value_sets().assume(guard, from),
            InstructionKind::Return(_) => return Err(RdError::Unsupported(Feature::Return)),
            InstructionKind::StartThread(_) => return Err(RdError::Unsupported(Feature::StartThread)),
            InstructionKind::EndThread => return Err(RdError::Unsupported(Feature::EndThread)),
            InstructionKind::AtomicBegin => return Err(RdError::Unsupported(Feature::AtomicBegin)),
            InstructionKind::AtomicEnd => return Err(RdError::Unsupported(Feature::AtomicEnd)),
            InstructionKind::Throw => return Err(RdError::Unsupported(Feature::Throw)),
            InstructionKind::Catch => return Err(RdError::Unsupported(Feature::Catch)),
            InstructionKind::IncompleteGoto | InstructionKind::NoInstructionType => {
                return Err(RdError::UnrecognizedInstruction { location: from });
            }
        }
        Ok(())
    }

    /// Gen every range `lhs` may write, without killing older definitions.
    fn transform_assign(&mut self, lhs: &Expr, at: Location, ctx: &dyn RdContext) {
        for range in written_ranges(lhs, at, ctx.value_sets()) {
            trace!("{}: assign {}", at, range);
            self.gen(at, &range.identifier, range.bit_begin, range.bit_end);
        }
    }

    fn transform_function_call(
        &mut self,
        model: &GotoModel,
        call: &Call,
        from: Location,
        to: Location,
        ctx: &dyn RdContext,
    ) -> Result<()> {
        // Edges to the fall-through instruction skip a call without a body.
        if to == from.next() {
            if let Some(lhs) = &call.lhs {
                self.transform_assign(lhs, from, ctx);
            }
            return Ok(());
        }

        if self.config().remove_locals {
            let hidden: Vec<Identifier> = self
                .values
                .keys()
                .filter(|id| !model.symbols.is_shared(id) && !ctx.is_dirty(id))
                .cloned()
                .collect();
            debug!("call at {}: hiding {} locals", from, hidden.len());
            for identifier in &hidden {
                self.erase(identifier);
            }
        }

        let parameters = model
            .parameters(&call.function)
            .ok_or_else(|| RdError::UnknownFunction(call.function.clone()))?;
        for parameter in named(parameters) {
            let width = parameter
                .ty
                .bit_width()
                .and_then(|w| RangeSpec::try_from(w).ok())
                .unwrap_or(UNKNOWN_END);
            self.gen(from, &parameter.identifier, 0, width);
        }
        Ok(())
    }

    fn transform_end_function(
        &mut self,
        model: &GotoModel,
        from: Location,
        to: Location,
        ctx: &dyn RdContext,
    ) -> Result<()> {
        let call_site = to
            .prev()
            .ok_or(RdError::Invariant("return edge into the first instruction"))?;
        let InstructionKind::FunctionCall(call) = &model.program.instruction(call_site).kind else {
            return Err(RdError::Invariant("return edge does not follow a call"));
        };

        if self.config().remove_locals {
            let callee = self.take_values();
            let saved = ctx
                .state_at(call_site)
                .ok_or(RdError::Invariant("no state recorded at the call site"))?;
            if saved.is_bottom() {
                // The call site was never reached, neither is its return site.
                self.make_bottom();
                return Ok(());
            }
            self.restore_values(saved);

            let threaded = ctx.is_threaded(call_site);
            for (identifier, ids) in callee.iter() {
                if !model.symbols.is_shared(identifier) && !ctx.is_dirty(identifier) {
                    continue;
                }
                let records: Vec<_> = ids.iter().map(|&id| self.interner().get(id)).collect();
                if !threaded {
                    for r in &records {
                        self.kill(identifier, r.bit_begin, r.bit_end);
                    }
                }
                for r in records {
                    self.gen(r.definition_at, identifier, r.bit_begin, r.bit_end);
                }
            }
        }

        let function = &model.program.instruction(from).function;
        let parameters = model
            .parameters(function)
            .ok_or_else(|| RdError::UnknownFunction(function.clone()))?;
        for parameter in named(parameters) {
            self.erase(&parameter.identifier);
        }

        if let Some(lhs) = &call.lhs {
            self.transform_assign(lhs, from, ctx);
        }
        Ok(())
    }
}

fn named(parameters: &[Parameter]) -> impl Iterator<Item = &Parameter> {
    parameters.iter().filter(|p| !p.identifier.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::rc::Rc;

    use test_log::test;

    use super::*;
    use crate::context::{DirtyVariables, PointsToMap, ValueSets};
    use crate::domain::{RangesAtLoc, RdConfig};
    use crate::interner::RecordInterner;
    use crate::program::{GotoProgram, SymbolTable, Type};

    struct TestContext {
        points_to: PointsToMap,
        dirty: DirtyVariables,
        threaded: bool,
        states: BTreeMap<Location, RdDomain>,
    }

    impl TestContext {
        fn new(model: &GotoModel) -> Self {
            Self {
                points_to: PointsToMap::from_program(model),
                dirty: DirtyVariables::from_program(model),
                threaded: false,
                states: BTreeMap::new(),
            }
        }
    }

    impl RdContext for TestContext {
        fn value_sets(&self) -> &dyn ValueSets {
            &self.points_to
        }

        fn is_threaded(&self, _location: Location) -> bool {
            self.threaded
        }

        fn is_dirty(&self, identifier: &Identifier) -> bool {
            self.dirty.is_dirty(identifier)
        }

        fn state_at(&self, location: Location) -> Option<&RdDomain> {
            self.states.get(&location)
        }
    }

    impl Analyzer for TestContext {
        fn reaching_definitions(&self) -> Option<&dyn RdContext> {
            Some(self)
        }
    }

    fn int(name: &str) -> Expr {
        Expr::symbol(name, Type::int())
    }

    fn one() -> Expr {
        Expr::constant(1, Type::int())
    }

    fn loc(i: usize) -> Location {
        Location::new(i)
    }

    fn id(name: &str) -> Identifier {
        Identifier::new(name)
    }

    fn ranges(items: &[(usize, RangeSpec, RangeSpec)]) -> RangesAtLoc {
        let mut r = RangesAtLoc::new();
        for &(at, b, e) in items {
            r.entry(loc(at)).or_default().insert((b, e));
        }
        r
    }

    fn symbols() -> SymbolTable {
        let mut symbols = SymbolTable::new();
        symbols.add_local("x", Type::int());
        symbols.add_local("y", Type::int());
        symbols.add_local("r", Type::int());
        symbols.add_local("p", Type::pointer_to(Type::int()));
        symbols.add_global("g", Type::int());
        symbols.add_function("main", vec![], Type::int());
        symbols.add_function("f", vec![Parameter::new("a", Type::int())], Type::int());
        symbols.add_function("ext", vec![Parameter::new("e", Type::int())], Type::int());
        symbols
    }

    /// ```text
    /// 0: x = 1        5: g = 1
    /// 1: g = 1        6: a = 1
    /// 2: r = f(x)     7: END_FUNCTION
    /// 3: y = ext(x)
    /// 4: END_FUNCTION
    /// ```
    fn call_model() -> GotoModel {
        let mut program = GotoProgram::new();
        program.add_function(
            "main",
            vec![
                InstructionKind::assign(int("x"), one()),
                InstructionKind::assign(int("g"), one()),
                InstructionKind::call(Call::new(Some(int("r")), "f", vec![int("x")])),
                InstructionKind::call(Call::new(Some(int("y")), "ext", vec![int("x")])),
            ],
        );
        program.add_function(
            "f",
            vec![
                InstructionKind::assign(int("g"), one()),
                InstructionKind::assign(int("a"), one()),
            ],
        );
        GotoModel::new(symbols(), program)
    }

    fn single(kind: InstructionKind) -> GotoModel {
        let mut program = GotoProgram::new();
        program.add_function("main", vec![kind]);
        GotoModel::new(symbols(), program)
    }

    fn entry() -> RdDomain {
        RdDomain::entry(Rc::new(RecordInterner::default()), RdConfig::default())
    }

    #[test]
    fn test_assign_gens_without_kill() {
        let model = call_model();
        let ctx = TestContext::new(&model);
        let mut d = entry();
        d.transform(&model, loc(1), loc(2), &ctx).unwrap();
        d.transform(&model, loc(5), loc(6), &ctx).unwrap();
        assert_eq!(*d.get(&id("g")), ranges(&[(1, 0, 32), (5, 0, 32)]));
    }

    #[test]
    fn test_dead_erases() {
        let model = single(InstructionKind::Dead(id("x")));
        let ctx = TestContext::new(&model);
        let mut d = entry();
        d.gen(loc(7), &id("x"), 0, 32);
        d.gen(loc(8), &id("x"), 0, 16);
        d.transform(&model, loc(0), loc(1), &ctx).unwrap();
        assert!(d.get(&id("x")).is_empty());
    }

    #[test]
    fn test_noops() {
        for kind in [
            InstructionKind::Decl(id("x")),
            InstructionKind::goto(loc(0), Expr::bool(true)),
            InstructionKind::Assert(Expr::bool(true)),
            InstructionKind::Assume(Expr::bool(true)),
            InstructionKind::Skip,
            InstructionKind::Location,
            InstructionKind::Other,
        ] {
            let model = single(kind);
            let ctx = TestContext::new(&model);
            let mut d = entry();
            d.gen(loc(5), &id("x"), 0, 32);
            let before = d.clone();
            d.transform(&model, loc(0), loc(1), &ctx).unwrap();
            assert_eq!(d, before);
        }
    }

    #[test]
    fn test_unsupported_instructions() {
        let cases = [
            (InstructionKind::Return(None), Feature::Return),
            (InstructionKind::StartThread(loc(0)), Feature::StartThread),
            (InstructionKind::EndThread, Feature::EndThread),
            (InstructionKind::AtomicBegin, Feature::AtomicBegin),
            (InstructionKind::AtomicEnd, Feature::AtomicEnd),
            (InstructionKind::Throw, Feature::Throw),
            (InstructionKind::Catch, Feature::Catch),
        ];
        for (kind, feature) in cases {
            let model = single(kind);
            let ctx = TestContext::new(&model);
            let result = entry().transform(&model, loc(0), loc(1), &ctx);
            assert_eq!(result, Err(RdError::Unsupported(feature)));
        }
    }

    #[test]
    fn test_unrecognized_instructions() {
        for kind in [InstructionKind::IncompleteGoto, InstructionKind::NoInstructionType] {
            let model = single(kind);
            let ctx = TestContext::new(&model);
            let result = entry().transform(&model, loc(0), loc(1), &ctx);
            assert_eq!(result, Err(RdError::UnrecognizedInstruction { location: loc(0) }));
        }
    }

    #[test]
    fn test_context_mismatch() {
        struct Plain;
        impl Analyzer for Plain {}

        let model = single(InstructionKind::Skip);
        let result = entry().transform(&model, loc(0), loc(1), &Plain);
        assert_eq!(result, Err(RdError::ContextMismatch));
    }

    #[test]
    fn test_bottom_stays_bottom() {
        let model = single(InstructionKind::assign(int("x"), one()));
        let ctx = TestContext::new(&model);
        let mut d = RdDomain::new(Rc::new(RecordInterner::default()), RdConfig::default());
        d.transform(&model, loc(0), loc(1), &ctx).unwrap();
        assert!(d.is_bottom());
    }

    #[test]
    fn test_assign_through_pointer() {
        let p = Expr::symbol("p", Type::pointer_to(Type::int()));
        let mut program = GotoProgram::new();
        program.add_function(
            "main",
            vec![
                InstructionKind::assign(p.clone(), Expr::address_of(int("x"))),
                InstructionKind::assign(p.clone(), Expr::address_of(int("y"))),
                InstructionKind::assign(Expr::deref(p), one()),
            ],
        );
        let model = GotoModel::new(symbols(), program);
        let ctx = TestContext::new(&model);
        let mut d = entry();
        d.transform(&model, loc(2), loc(3), &ctx).unwrap();
        assert_eq!(*d.get(&id("x")), ranges(&[(2, 0, 32)]));
        assert_eq!(*d.get(&id("y")), ranges(&[(2, 0, 32)]));
        assert!(d.get(&id("p")).is_empty());
    }

    #[test]
    fn test_call_hides_locals_and_binds_parameters() {
        let model = call_model();
        let ctx = TestContext::new(&model);
        let mut d = entry();
        d.transform(&model, loc(0), loc(1), &ctx).unwrap();
        d.transform(&model, loc(1), loc(2), &ctx).unwrap();
        d.transform(&model, loc(2), loc(5), &ctx).unwrap();

        assert!(d.get(&id("x")).is_empty());
        assert_eq!(*d.get(&id("g")), ranges(&[(1, 0, 32)]));
        assert_eq!(*d.get(&id("a")), ranges(&[(2, 0, 32)]));
    }

    #[test]
    fn test_call_keeps_locals_without_removal() {
        let model = call_model();
        let ctx = TestContext::new(&model);
        let config = RdConfig {
            remove_locals: false,
            ..RdConfig::default()
        };
        let mut d = RdDomain::entry(Rc::new(RecordInterner::default()), config);
        d.transform(&model, loc(0), loc(1), &ctx).unwrap();
        d.transform(&model, loc(2), loc(5), &ctx).unwrap();
        assert_eq!(*d.get(&id("x")), ranges(&[(0, 0, 32)]));
    }

    #[test]
    fn test_call_keeps_dirty_locals() {
        let mut program = GotoProgram::new();
        let p = Expr::symbol("p", Type::pointer_to(Type::int()));
        program.add_function(
            "main",
            vec![
                InstructionKind::assign(p, Expr::address_of(int("x"))),
                InstructionKind::call(Call::new(None, "f", vec![one()])),
            ],
        );
        program.add_function("f", vec![]);
        let model = GotoModel::new(symbols(), program);
        let ctx = TestContext::new(&model);

        let mut d = entry();
        d.gen(loc(0), &id("x"), 0, 32);
        d.gen(loc(0), &id("y"), 0, 32);
        d.transform(&model, loc(1), loc(3), &ctx).unwrap();
        assert_eq!(*d.get(&id("x")), ranges(&[(0, 0, 32)]));
        assert!(d.get(&id("y")).is_empty());
    }

    #[test]
    fn test_call_without_body_assigns_lhs() {
        let model = call_model();
        let ctx = TestContext::new(&model);
        let mut d = entry();
        d.gen(loc(0), &id("x"), 0, 32);
        d.transform(&model, loc(3), loc(4), &ctx).unwrap();
        assert_eq!(*d.get(&id("y")), ranges(&[(3, 0, 32)]));
        // Nothing is hidden or bound.
        assert_eq!(*d.get(&id("x")), ranges(&[(0, 0, 32)]));
        assert!(d.get(&id("e")).is_empty());
    }

    #[test]
    fn test_call_to_unknown_function() {
        let mut program = GotoProgram::new();
        program.add_function("main", vec![InstructionKind::call(Call::new(None, "nowhere", vec![]))]);
        program.add_function("nowhere", vec![]);
        let model = GotoModel::new(symbols(), program);
        let ctx = TestContext::new(&model);
        let result = entry().transform(&model, loc(0), loc(2), &ctx);
        assert_eq!(result, Err(RdError::UnknownFunction(id("nowhere"))));
    }

    #[test]
    fn test_return_restores_caller_and_reapplies_globals() {
        let model = call_model();
        let mut ctx = TestContext::new(&model);

        let mut d = entry();
        d.transform(&model, loc(0), loc(1), &ctx).unwrap();
        d.transform(&model, loc(1), loc(2), &ctx).unwrap();
        ctx.states.insert(loc(2), d.clone());

        d.transform(&model, loc(2), loc(5), &ctx).unwrap();
        d.transform(&model, loc(5), loc(6), &ctx).unwrap();
        d.transform(&model, loc(6), loc(7), &ctx).unwrap();
        d.transform(&model, loc(7), loc(3), &ctx).unwrap();

        assert_eq!(*d.get(&id("x")), ranges(&[(0, 0, 32)]));
        assert_eq!(*d.get(&id("g")), ranges(&[(1, 0, 32), (5, 0, 32)]));
        assert_eq!(*d.get(&id("r")), ranges(&[(7, 0, 32)]));
        assert!(d.get(&id("a")).is_empty());
    }

    #[test]
    fn test_return_kills_unless_threaded() {
        let model = call_model();
        let interner = Rc::new(RecordInterner::default());

        let mut caller = RdDomain::entry(Rc::clone(&interner), RdConfig::default());
        caller.gen(loc(1), &id("g"), 0, 32);
        let mut callee = RdDomain::entry(Rc::clone(&interner), RdConfig::default());
        callee.gen(loc(5), &id("g"), 0, 32);

        let mut ctx = TestContext::new(&model);
        ctx.states.insert(loc(2), caller);

        let mut d = callee.clone();
        d.transform(&model, loc(7), loc(3), &ctx).unwrap();
        assert_eq!(*d.get(&id("g")), ranges(&[(5, 0, 32)]));

        ctx.threaded = true;
        let mut d = callee.clone();
        d.transform(&model, loc(7), loc(3), &ctx).unwrap();
        assert_eq!(*d.get(&id("g")), ranges(&[(1, 0, 32), (5, 0, 32)]));
    }

    #[test]
    fn test_return_to_unreached_call_site_is_bottom() {
        let model = call_model();
        let mut ctx = TestContext::new(&model);
        let interner = Rc::new(RecordInterner::default());
        ctx.states
            .insert(loc(2), RdDomain::new(Rc::clone(&interner), RdConfig::default()));

        let mut d = RdDomain::entry(interner, RdConfig::default());
        d.gen(loc(5), &id("g"), 0, 32);
        d.transform(&model, loc(7), loc(3), &ctx).unwrap();
        assert!(d.is_bottom());
    }

    #[test]
    fn test_return_without_call_site_state() {
        let model = call_model();
        let ctx = TestContext::new(&model);
        let result = entry().transform(&model, loc(7), loc(3), &ctx);
        assert!(matches!(result, Err(RdError::Invariant(_))));
    }
}
