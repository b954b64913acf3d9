//! Reaching definitions on a small program with a loop and calls.
//!
//! ```c
//! int g;
//! int bump(int a) { g = a; return a; }
//! int main() {
//!     int x = 0;
//!     int *p = &x;
//!     while (c) { x = bump(x); *p = 1; }   // repeated `n` times
//! }
//! ```
//!
//! Run with: `cargo run --example fixpoint_trace`
//! With options: `cargo run --example fixpoint_trace -- -n 3 --keep-locals --merge into-other`

use std::time::Instant;

use clap::{Parser, ValueEnum};
use color_eyre::eyre::eyre;
use rd_sharing::analysis::{AnalysisConfig, ReachingDefinitionsAnalysis};
use rd_sharing::domain::{MergeDirection, RdConfig};
use rd_sharing::program::{Call, Expr, GotoModel, GotoProgram, InstructionKind, Operator, Parameter, SymbolTable, Type};
use rd_sharing::types::Location;

#[derive(Parser, Debug)]
#[command(name = "fixpoint_trace")]
#[command(about = "Trace reaching definitions to a fixed point")]
struct Args {
    /// Number of loops in `main`
    #[arg(short, long, default_value_t = 1)]
    n: usize,

    /// Let caller locals flow through calls
    #[arg(long)]
    keep_locals: bool,

    /// Side of each join that accumulates the union
    #[arg(long, value_enum, default_value_t = Merge::Dynamic)]
    merge: Merge,

    /// Print only statistics
    #[arg(short, long)]
    quiet: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log: simplelog::LevelFilter,
}

#[derive(ValueEnum, Debug, Copy, Clone)]
enum Merge {
    IntoSelf,
    IntoOther,
    Dynamic,
}

impl From<Merge> for MergeDirection {
    fn from(merge: Merge) -> Self {
        match merge {
            Merge::IntoSelf => MergeDirection::IntoSelf,
            Merge::IntoOther => MergeDirection::IntoOther,
            Merge::Dynamic => MergeDirection::Dynamic,
        }
    }
}

fn build(n: usize) -> GotoModel {
    let int = Type::int();
    let x = Expr::symbol("x", int.clone());
    let p = Expr::symbol("p", Type::pointer_to(int.clone()));
    let c = Expr::symbol("c", Type::Bool);

    let mut symbols = SymbolTable::new();
    symbols.add_local("x", int.clone());
    symbols.add_local("p", Type::pointer_to(int.clone()));
    symbols.add_local("c", Type::Bool);
    symbols.add_global("g", int.clone());
    symbols.add_function("main", vec![], Type::Empty);
    symbols.add_function("bump", vec![Parameter::new("a", int.clone())], int.clone());

    let mut program = GotoProgram::new();
    let mut body = vec![
        InstructionKind::assign(x.clone(), Expr::constant(0, int.clone())),
        InstructionKind::assign(p.clone(), Expr::address_of(x.clone())),
    ];
    for _ in 0..n {
        let head = Location::new(body.len());
        let exit = Location::new(body.len() + 4);
        let not_c = Expr::operation(Operator::Not, vec![c.clone()], Type::Bool);
        body.push(InstructionKind::goto(exit, not_c));
        body.push(InstructionKind::call(Call::new(Some(x.clone()), "bump", vec![x.clone()])));
        body.push(InstructionKind::assign(Expr::deref(p.clone()), Expr::constant(1, int.clone())));
        body.push(InstructionKind::goto(head, Expr::bool(true)));
    }
    body.push(InstructionKind::Skip);
    program.add_function("main", body);

    let a = Expr::symbol("a", int.clone());
    let g = Expr::symbol("g", int.clone());
    program.add_function("bump", vec![InstructionKind::assign(g, a)]);

    GotoModel::new(symbols, program)
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    simplelog::TermLogger::init(
        args.log,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    let time_total = Instant::now();

    let model = build(args.n);
    println!("program: {} instructions", model.program.len());

    let config = AnalysisConfig {
        rd: RdConfig {
            remove_locals: !args.keep_locals,
            merge_direction: args.merge.into(),
        },
        ..AnalysisConfig::default()
    };
    let analysis = ReachingDefinitionsAnalysis::analyze(&model, "main", config).map_err(|e| eyre!("{}", e))?;

    if !args.quiet {
        print!("{}", analysis.report(&model));
    }
    println!("iterations: {}", analysis.iterations());
    println!("records: {}", analysis.interner().len());
    println!("{}", analysis.stats());

    let time_total = time_total.elapsed();
    println!("Done in {:.3} s", time_total.as_secs_f64());

    Ok(())
}
