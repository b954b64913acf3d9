//! Worklist fixed-point driver for reaching definitions.

use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::rc::Rc;

use crate::context::{Analyzer, DirtyVariables, PointsToMap, RdContext, ValueSets};
use crate::domain::{MergeStats, RdConfig, RdDomain};
use crate::error::{RdError, Result};
use crate::interner::RecordInterner;
use crate::program::{Expr, GotoModel, InstructionKind};
use crate::types::{Identifier, Location};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AnalysisConfig {
    pub rd: RdConfig,
    /// Worklist pops before giving up on a fixed point.
    pub max_iterations: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            rd: RdConfig::default(),
            max_iterations: 100_000,
        }
    }
}

/// Reaching definitions for a whole [`GotoModel`].
///
/// Holds one state per location, the state *before* the instruction, and
/// serves as the [`RdContext`] its own transfer functions consult.
pub struct ReachingDefinitionsAnalysis {
    config: AnalysisConfig,
    interner: Rc<RecordInterner>,
    points_to: PointsToMap,
    dirty: DirtyVariables,
    threaded: bool,
    states: Vec<RdDomain>,
    stats: MergeStats,
    iterations: usize,
    converged: bool,
}

impl ReachingDefinitionsAnalysis {
    /// Prepare an analysis of `model` with every state bottom.
    pub fn new(model: &GotoModel, config: AnalysisConfig) -> Self {
        let interner = Rc::new(RecordInterner::default());
        let states = (0..model.program.len())
            .map(|_| RdDomain::new(Rc::clone(&interner), config.rd))
            .collect();
        let threaded = model
            .program
            .instructions()
            .any(|(_, inst)| matches!(inst.kind, InstructionKind::StartThread(_)));

        Self {
            config,
            interner,
            points_to: PointsToMap::from_program(model),
            dirty: DirtyVariables::from_program(model),
            threaded,
            states,
            stats: MergeStats::default(),
            iterations: 0,
            converged: false,
        }
    }

    /// Run the analysis from the entry of `entry_function`.
    pub fn analyze(model: &GotoModel, entry_function: &str, config: AnalysisConfig) -> Result<Self> {
        let mut analysis = Self::new(model, config);
        analysis.run(model, entry_function)?;
        Ok(analysis)
    }

    /// Iterate to a fixed point, stopping at the first error.
    ///
    /// Hitting [`AnalysisConfig::max_iterations`] is an error: the states
    /// left behind do not cover every execution.
    pub fn run(&mut self, model: &GotoModel, entry_function: &str) -> Result<()> {
        let entry_function = Identifier::new(entry_function);
        let body = model
            .program
            .body(&entry_function)
            .ok_or(RdError::UnknownFunction(entry_function))?;

        self.states[body.entry.index()].make_entry();
        let mut worklist = BTreeSet::from([body.entry]);
        self.iterations = 0;
        self.converged = false;

        while let Some(from) = worklist.pop_first() {
            self.iterations += 1;
            if self.iterations > self.config.max_iterations {
                log::warn!(
                    "Reaching definitions did not converge after {} iterations",
                    self.config.max_iterations
                );
                return Err(RdError::NotConverged {
                    iterations: self.config.max_iterations,
                });
            }

            for to in successors(model, from) {
                let mut next = self.states[from.index()].clone();
                next.transform(model, from, to, &*self)?;
                if self.states[to.index()].merge(&next, &mut self.stats)? {
                    log::trace!("{} -> {} changed", from, to);
                    worklist.insert(to);
                    // Return edges read the call-site state, so the callee's
                    // exit has to be revisited too.
                    if let Some(end) = callee_end(model, to) {
                        if !self.states[end.index()].is_bottom() {
                            worklist.insert(end);
                        }
                    }
                }
            }
        }

        self.converged = true;
        log::debug!(
            "Reaching definitions converged after {} iterations, {} records, {}",
            self.iterations,
            self.interner.len(),
            self.stats
        );
        Ok(())
    }

    /// The state before the instruction at `location`.
    pub fn state(&self, location: Location) -> &RdDomain {
        &self.states[location.index()]
    }

    pub fn stats(&self) -> MergeStats {
        self.stats
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn interner(&self) -> &Rc<RecordInterner> {
        &self.interner
    }

    /// Every reached location with its instruction and state.
    pub fn report<'a>(&'a self, model: &'a GotoModel) -> Report<'a> {
        Report { analysis: self, model }
    }
}

/// Printable per-location listing, see [`ReachingDefinitionsAnalysis::report`].
pub struct Report<'a> {
    analysis: &'a ReachingDefinitionsAnalysis,
    model: &'a GotoModel,
}

impl Display for Report<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (location, instruction) in self.model.program.instructions() {
            let state = self.analysis.state(location);
            if state.is_bottom() {
                continue;
            }
            writeln!(f, "**** {} {} ({})", location, instruction.kind.name(), instruction.function)?;
            write!(f, "{}", state)?;
        }
        Ok(())
    }
}

impl Analyzer for ReachingDefinitionsAnalysis {
    fn reaching_definitions(&self) -> Option<&dyn RdContext> {
        Some(self)
    }
}

impl RdContext for ReachingDefinitionsAnalysis {
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
        self.states.get(location.index())
    }
}

/// Control-flow successors of `location`, interprocedurally.
pub fn successors(model: &GotoModel, location: Location) -> Vec<Location> {
    let instruction = model.program.instruction(location);
    let next = location.next();
    match &instruction.kind {
        InstructionKind::Goto { targets, guard } => {
            let mut out = targets.clone();
            if !is_true(guard) {
                out.push(next);
            }
            out.sort();
            out.dedup();
            out
        }
        InstructionKind::FunctionCall(call) => match model.program.body(&call.function) {
            Some(body) => vec![body.entry],
            None => vec![next],
        },
        InstructionKind::EndFunction => model
            .program
            .call_sites(&instruction.function)
            .map(Location::next)
            .collect(),
        InstructionKind::Assume(guard) if is_false(guard) => Vec::new(),
        _ => vec![next],
    }
}

/// The `END_FUNCTION` of the function called at `location`, if any.
fn callee_end(model: &GotoModel, location: Location) -> Option<Location> {
    match &model.program.instruction(location).kind {
        InstructionKind::FunctionCall(call) => model.program.body(&call.function).map(|body| body.end),
        _ => None,
    }
}

fn is_true(guard: &Expr) -> bool {
    matches!(guard, Expr::Constant { value, .. } if *value != 0)
}

fn is_false(guard: &Expr) -> bool {
    matches!(guard, Expr::Constant { value: 0, .. })
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::domain::RangesAtLoc;
    use crate::error::Feature;
    use crate::program::{Call, GotoProgram, SymbolTable, Type};
    use crate::types::RangeSpec;

    fn int(name: &str) -> Expr {
        Expr::symbol(name, Type::int())
    }

    fn loc(i: usize) -> Location {
        Location::new(i)
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
        symbols.add_local("c", Type::Bool);
        symbols.add_function("main", vec![], Type::Empty);
        symbols
    }

    /// ```text
    /// 0: x = 1
    /// 1: IF c GOTO 3
    /// 2: x = 2
    /// 3: SKIP
    /// 4: END_FUNCTION
    /// ```
    fn diamond() -> GotoModel {
        let mut program = GotoProgram::new();
        program.add_function(
            "main",
            vec![
                InstructionKind::assign(int("x"), Expr::constant(1, Type::int())),
                InstructionKind::goto(loc(3), Expr::symbol("c", Type::Bool)),
                InstructionKind::assign(int("x"), Expr::constant(2, Type::int())),
                InstructionKind::Skip,
            ],
        );
        GotoModel::new(symbols(), program)
    }

    #[test]
    fn test_successors() {
        let model = diamond();
        assert_eq!(successors(&model, loc(0)), vec![loc(1)]);
        assert_eq!(successors(&model, loc(1)), vec![loc(2), loc(3)]);
        assert!(successors(&model, loc(4)).is_empty());
    }

    #[test]
    fn test_diamond_join() {
        let model = diamond();
        let analysis = ReachingDefinitionsAnalysis::analyze(&model, "main", AnalysisConfig::default()).unwrap();
        assert!(analysis.converged());

        let x = Identifier::new("x");
        assert!(analysis.state(loc(0)).get(&x).is_empty());
        assert_eq!(*analysis.state(loc(2)).get(&x), ranges(&[(0, 0, 32)]));
        // No kill on assignment: both definitions reach the join.
        assert_eq!(*analysis.state(loc(3)).get(&x), ranges(&[(0, 0, 32), (2, 0, 32)]));
        assert_eq!(*analysis.state(loc(4)).get(&x), ranges(&[(0, 0, 32), (2, 0, 32)]));
    }

    #[test]
    fn test_loop_terminates() {
        let mut program = GotoProgram::new();
        program.add_function(
            "main",
            vec![
                InstructionKind::assign(int("x"), Expr::constant(0, Type::int())),
                InstructionKind::assign(int("x"), Expr::constant(1, Type::int())),
                InstructionKind::goto(loc(1), Expr::symbol("c", Type::Bool)),
            ],
        );
        let model = GotoModel::new(symbols(), program);
        let analysis = ReachingDefinitionsAnalysis::analyze(&model, "main", AnalysisConfig::default()).unwrap();
        assert!(analysis.converged());
        let x = Identifier::new("x");
        assert_eq!(*analysis.state(loc(1)).get(&x), ranges(&[(0, 0, 32), (1, 0, 32)]));
        assert!(analysis.stats().total() > 0);
    }

    #[test]
    fn test_iteration_cap() {
        let model = diamond();
        let config = AnalysisConfig {
            max_iterations: 2,
            ..AnalysisConfig::default()
        };
        let result = ReachingDefinitionsAnalysis::analyze(&model, "main", config);
        assert!(matches!(result, Err(RdError::NotConverged { iterations: 2 })));

        let mut analysis = ReachingDefinitionsAnalysis::new(&model, config);
        assert!(analysis.run(&model, "main").is_err());
        assert!(!analysis.converged());
    }

    #[test]
    fn test_rerun_starts_counting_afresh() {
        let model = diamond();
        let mut analysis = ReachingDefinitionsAnalysis::analyze(&model, "main", AnalysisConfig::default()).unwrap();
        let first = analysis.iterations();
        analysis.run(&model, "main").unwrap();
        assert!(analysis.converged());
        assert!(analysis.iterations() <= first);
    }

    #[test]
    fn test_unreachable_stays_bottom() {
        let mut program = GotoProgram::new();
        program.add_function(
            "main",
            vec![
                InstructionKind::goto(loc(2), Expr::bool(true)),
                InstructionKind::assign(int("x"), Expr::constant(1, Type::int())),
                InstructionKind::Skip,
            ],
        );
        let model = GotoModel::new(symbols(), program);
        let analysis = ReachingDefinitionsAnalysis::analyze(&model, "main", AnalysisConfig::default()).unwrap();
        assert!(analysis.state(loc(1)).is_bottom());
        assert!(!analysis.state(loc(2)).is_bottom());
        let report = analysis.report(&model).to_string();
        assert!(report.contains("**** L2 SKIP (main)"));
        assert!(!report.contains("**** L1"));
    }

    #[test]
    fn test_unknown_entry_function() {
        let model = diamond();
        let result = ReachingDefinitionsAnalysis::analyze(&model, "start", AnalysisConfig::default());
        assert!(matches!(result, Err(RdError::UnknownFunction(f)) if f.as_str() == "start"));
    }

    #[test]
    fn test_thread_start_fails() {
        let mut program = GotoProgram::new();
        program.add_function("main", vec![InstructionKind::StartThread(loc(1)), InstructionKind::Skip]);
        let model = GotoModel::new(symbols(), program);
        let result = ReachingDefinitionsAnalysis::analyze(&model, "main", AnalysisConfig::default());
        assert!(matches!(result, Err(RdError::Unsupported(Feature::StartThread))));
    }

    /// ```text
    /// 0: x = 1        5: END_FUNCTION (f)
    /// 1: f()
    /// 2: x = 2
    /// 3: IF c GOTO 1
    /// 4: END_FUNCTION
    /// ```
    #[test]
    fn test_return_sees_caller_changes_hidden_from_callee() {
        let mut program = GotoProgram::new();
        program.add_function(
            "main",
            vec![
                InstructionKind::assign(int("x"), Expr::constant(1, Type::int())),
                InstructionKind::call(Call::new(None, "f", vec![])),
                InstructionKind::assign(int("x"), Expr::constant(2, Type::int())),
                InstructionKind::goto(loc(1), Expr::symbol("c", Type::Bool)),
            ],
        );
        program.add_function("f", vec![]);
        let mut symbols = symbols();
        symbols.add_function("f", vec![], Type::Empty);
        let model = GotoModel::new(symbols, program);

        let analysis = ReachingDefinitionsAnalysis::analyze(&model, "main", AnalysisConfig::default()).unwrap();
        let x = Identifier::new("x");
        // `x` is hidden inside `f`, so the callee entry never changes.
        assert!(analysis.state(loc(5)).get(&x).is_empty());
        assert_eq!(*analysis.state(loc(1)).get(&x), ranges(&[(0, 0, 32), (2, 0, 32)]));
        assert_eq!(*analysis.state(loc(2)).get(&x), ranges(&[(0, 0, 32), (2, 0, 32)]));
    }

    #[test]
    fn test_call_and_return_edges() {
        let mut program = GotoProgram::new();
        program.add_function(
            "main",
            vec![
                InstructionKind::call(Call::new(None, "f", vec![])),
                InstructionKind::call(Call::new(None, "f", vec![])),
            ],
        );
        program.add_function("f", vec![]);
        program.add_function("g", vec![]);
        let mut symbols = symbols();
        symbols.add_function("f", vec![], Type::Empty);
        let model = GotoModel::new(symbols, program);

        assert_eq!(successors(&model, loc(0)), vec![loc(3)]);
        assert_eq!(successors(&model, loc(3)), vec![loc(1), loc(2)]);
        assert!(successors(&model, loc(4)).is_empty());
    }
}
