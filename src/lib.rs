//! # rd-sharing: range-precise reaching definitions on sharing maps
//!
//! **`rd-sharing`** is the dataflow backbone of a program-verification
//! toolchain: a persistent, structurally shared map and, built on it, a
//! reaching-definitions abstract domain that tracks *which bits* of each
//! variable every definition may have written.
//!
//! ## Why sharing maps?
//!
//! A fixed-point analysis keeps one abstract state per program point and
//! copies states along every CFG edge. With a [`SharingMap`][crate::sharing_map::SharingMap]
//! a copy is O(1): both copies hold the same root, and a later write
//! path-copies only the nodes between the root and the changed entry.
//! Comparing two states is proportional to the number of *differing* nodes,
//! because the [delta view][crate::sharing_map::SharingMap::delta_view] skips
//! every subtree the two maps still share.
//!
//! ## Key Features
//!
//! - **Interned definitions**: each `(identifier, location, bit range)` is
//!   numbered once by the [`RecordInterner`][crate::interner::RecordInterner],
//!   so sets of definitions are compared by id.
//! - **Direction-choosing join**: [`RdDomain::merge`][crate::domain::RdDomain::merge]
//!   accumulates into whichever side already covers more of the union.
//! - **Call-aware transfer**: locals invisible to a callee are hidden on the
//!   call edge and restored on return, while effects on globals and
//!   address-taken variables flow back out.
//! - **Typed failures**: unsupported constructs surface as
//!   [`RdError`][crate::error::RdError] instead of unsound results.
//!
//! ## Basic Usage
//!
//! ```rust
//! use rd_sharing::analysis::{AnalysisConfig, ReachingDefinitionsAnalysis};
//! use rd_sharing::program::{Expr, GotoModel, GotoProgram, InstructionKind, SymbolTable, Type};
//! use rd_sharing::types::{Identifier, Location};
//!
//! let mut symbols = SymbolTable::new();
//! symbols.add_local("x", Type::int());
//! symbols.add_function("main", vec![], Type::Empty);
//!
//! let x = Expr::symbol("x", Type::int());
//! let mut program = GotoProgram::new();
//! program.add_function(
//!     "main",
//!     vec![
//!         InstructionKind::assign(x.clone(), Expr::constant(1, Type::int())),
//!         InstructionKind::Skip,
//!     ],
//! );
//! let model = GotoModel::new(symbols, program);
//!
//! let analysis = ReachingDefinitionsAnalysis::analyze(&model, "main", AnalysisConfig::default()).unwrap();
//! let at_skip = analysis.state(Location::new(1));
//! let defs = at_skip.get(&Identifier::new("x"));
//! assert_eq!(defs[&Location::new(0)].iter().next(), Some(&(0, 32)));
//! ```
//!
//! ## Core Components
//!
//! - **[`sharing_map`]**: the persistent map, its iterator and delta view.
//! - **[`domain`]**: the lattice state, `gen`/`kill`/`merge` and queries.
//! - **[`transfer`]**: per-instruction transfer functions.
//! - **[`analysis`]**: a worklist driver over a [`program::GotoModel`].

pub mod analysis;
pub mod context;
pub mod domain;
pub mod error;
pub mod interner;
pub mod program;
pub mod rw_range;
pub mod sharing_map;
pub mod table;
pub mod transfer;
pub mod types;
pub mod utils;
