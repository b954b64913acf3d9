//! The program the analysis runs over: types, expressions, instructions and
//! the symbol table.
//!
//! This is a deliberately small goto-program model. All functions live in
//! one flat instruction vector so that a [`Location`] is just an index, the
//! instruction after a call is `call.next()` and the call preceding a
//! return site is `site.prev()`.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use crate::types::{Identifier, Location};

/// Width of every pointer, in bits.
pub const POINTER_WIDTH: u64 = 64;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Type {
    /// `void`, and zero-width objects.
    Empty,
    Bool,
    Signed(u64),
    Unsigned(u64),
    Pointer(Box<Type>),
    /// Arrays with `size == None` have unknown length.
    Array { element: Box<Type>, size: Option<u64> },
    /// Fields are laid out back to back, without padding.
    Struct(Vec<Field>),
    Code(CodeType),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Field {
    pub name: Identifier,
    pub ty: Type,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CodeType {
    pub parameters: Vec<Parameter>,
    pub return_type: Box<Type>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Parameter {
    /// Empty for anonymous parameters.
    pub identifier: Identifier,
    pub ty: Type,
}

impl Parameter {
    pub fn new(identifier: &str, ty: Type) -> Self {
        Self {
            identifier: Identifier::new(identifier),
            ty,
        }
    }
}

impl Type {
    pub fn int() -> Self {
        Type::Signed(32)
    }

    pub fn pointer_to(ty: Type) -> Self {
        Type::Pointer(Box::new(ty))
    }

    pub fn array_of(element: Type, size: Option<u64>) -> Self {
        Type::Array {
            element: Box::new(element),
            size,
        }
    }

    pub fn code(parameters: Vec<Parameter>, return_type: Type) -> Self {
        Type::Code(CodeType {
            parameters,
            return_type: Box::new(return_type),
        })
    }

    /// Size in bits, or `None` when unknown (unsized arrays, code).
    pub fn bit_width(&self) -> Option<u64> {
        match self {
            Type::Empty => Some(0),
            Type::Bool => Some(1),
            Type::Signed(w) | Type::Unsigned(w) => Some(*w),
            Type::Pointer(_) => Some(POINTER_WIDTH),
            Type::Array { element, size } => {
                let size = (*size)?;
                element.bit_width()?.checked_mul(size)
            }
            Type::Struct(fields) => fields.iter().try_fold(0u64, |acc, f| acc.checked_add(f.ty.bit_width()?)),
            Type::Code(_) => None,
        }
    }

    /// Bit offset of `field` inside a struct type.
    pub fn member_offset(&self, field: &Identifier) -> Option<u64> {
        let Type::Struct(fields) = self else {
            return None;
        };
        let mut offset = 0u64;
        for f in fields {
            if &f.name == field {
                return Some(offset);
            }
            offset = offset.checked_add(f.ty.bit_width()?)?;
        }
        None
    }

    pub fn as_code(&self) -> Option<&CodeType> {
        match self {
            Type::Code(code) => Some(code),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Operator {
    Plus,
    Minus,
    Mult,
    Equal,
    NotEqual,
    Less,
    Not,
    And,
    Or,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Expr {
    Symbol { identifier: Identifier, ty: Type },
    Constant { value: i64, ty: Type },
    Nondet { ty: Type },
    Member { compound: Box<Expr>, field: Identifier, ty: Type },
    Index { array: Box<Expr>, index: Box<Expr>, ty: Type },
    Dereference { pointer: Box<Expr>, ty: Type },
    AddressOf { object: Box<Expr>, ty: Type },
    Typecast { op: Box<Expr>, ty: Type },
    Operation { operator: Operator, operands: Vec<Expr>, ty: Type },
}

impl Expr {
    pub fn symbol(identifier: &str, ty: Type) -> Self {
        Expr::Symbol {
            identifier: Identifier::new(identifier),
            ty,
        }
    }

    pub fn constant(value: i64, ty: Type) -> Self {
        Expr::Constant { value, ty }
    }

    pub fn bool(value: bool) -> Self {
        Expr::Constant {
            value: value as i64,
            ty: Type::Bool,
        }
    }

    pub fn nondet(ty: Type) -> Self {
        Expr::Nondet { ty }
    }

    /// `compound.field`; the result type is looked up in the struct type.
    pub fn member(compound: Expr, field: &str) -> Self {
        let field = Identifier::new(field);
        let ty = match compound.ty() {
            Type::Struct(fields) => fields.iter().find(|f| f.name == field).map(|f| f.ty.clone()),
            _ => None,
        }
        .unwrap_or(Type::Empty);
        Expr::Member {
            compound: Box::new(compound),
            field,
            ty,
        }
    }

    pub fn index(array: Expr, index: Expr) -> Self {
        let ty = match array.ty() {
            Type::Array { element, .. } => (**element).clone(),
            _ => Type::Empty,
        };
        Expr::Index {
            array: Box::new(array),
            index: Box::new(index),
            ty,
        }
    }

    pub fn deref(pointer: Expr) -> Self {
        let ty = match pointer.ty() {
            Type::Pointer(target) => (**target).clone(),
            _ => Type::Empty,
        };
        Expr::Dereference {
            pointer: Box::new(pointer),
            ty,
        }
    }

    pub fn address_of(object: Expr) -> Self {
        let ty = Type::pointer_to(object.ty().clone());
        Expr::AddressOf {
            object: Box::new(object),
            ty,
        }
    }

    pub fn typecast(op: Expr, ty: Type) -> Self {
        Expr::Typecast { op: Box::new(op), ty }
    }

    pub fn operation(operator: Operator, operands: Vec<Expr>, ty: Type) -> Self {
        Expr::Operation { operator, operands, ty }
    }

    pub fn ty(&self) -> &Type {
        match self {
            Expr::Symbol { ty, .. }
            | Expr::Constant { ty, .. }
            | Expr::Nondet { ty }
            | Expr::Member { ty, .. }
            | Expr::Index { ty, .. }
            | Expr::Dereference { ty, .. }
            | Expr::AddressOf { ty, .. }
            | Expr::Typecast { ty, .. }
            | Expr::Operation { ty, .. } => ty,
        }
    }

    /// The symbol at the root of an object expression (`s` in `s.f[2]`),
    /// without looking through dereferences.
    pub fn root_object(&self) -> Option<&Identifier> {
        match self {
            Expr::Symbol { identifier, .. } => Some(identifier),
            Expr::Member { compound, .. } => compound.root_object(),
            Expr::Index { array, .. } => array.root_object(),
            Expr::Typecast { op, .. } => op.root_object(),
            _ => None,
        }
    }

    /// Visit this expression and all its subexpressions, pre-order.
    pub fn visit(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Symbol { .. } | Expr::Constant { .. } | Expr::Nondet { .. } => {}
            Expr::Member { compound, .. } => compound.visit(f),
            Expr::Index { array, index, .. } => {
                array.visit(f);
                index.visit(f);
            }
            Expr::Dereference { pointer, .. } => pointer.visit(f),
            Expr::AddressOf { object, .. } => object.visit(f),
            Expr::Typecast { op, .. } => op.visit(f),
            Expr::Operation { operands, .. } => operands.iter().for_each(|e| e.visit(f)),
        }
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Symbol { identifier, .. } => write!(f, "{}", identifier),
            Expr::Constant { value, .. } => write!(f, "{}", value),
            Expr::Nondet { .. } => write!(f, "nondet"),
            Expr::Member { compound, field, .. } => write!(f, "{}.{}", compound, field),
            Expr::Index { array, index, .. } => write!(f, "{}[{}]", array, index),
            Expr::Dereference { pointer, .. } => write!(f, "*{}", pointer),
            Expr::AddressOf { object, .. } => write!(f, "&{}", object),
            Expr::Typecast { op, .. } => write!(f, "({})", op),
            Expr::Operation { operator, operands, .. } => {
                write!(f, "{:?}(", operator)?;
                for (i, op) in operands.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", op)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Call {
    /// Where the result goes, if anywhere.
    pub lhs: Option<Expr>,
    pub function: Identifier,
    pub arguments: Vec<Expr>,
}

impl Call {
    pub fn new(lhs: Option<Expr>, function: &str, arguments: Vec<Expr>) -> Self {
        Self {
            lhs,
            function: Identifier::new(function),
            arguments,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum InstructionKind {
    Decl(Identifier),
    Dead(Identifier),
    Assign { lhs: Expr, rhs: Expr },
    FunctionCall(Call),
    EndFunction,
    /// Jumps to every target when `guard` holds, falls through otherwise.
    Goto { targets: Vec<Location>, guard: Expr },
    Assume(Expr),
    Assert(Expr),
    Skip,
    Location,
    Return(Option<Expr>),
    StartThread(Location),
    EndThread,
    AtomicBegin,
    AtomicEnd,
    Throw,
    Catch,
    Other,
    /// A goto whose target was never resolved.
    IncompleteGoto,
    NoInstructionType,
}

impl InstructionKind {
    pub fn assign(lhs: Expr, rhs: Expr) -> Self {
        InstructionKind::Assign { lhs, rhs }
    }

    pub fn goto(target: Location, guard: Expr) -> Self {
        InstructionKind::Goto {
            targets: vec![target],
            guard,
        }
    }

    pub fn call(call: Call) -> Self {
        InstructionKind::FunctionCall(call)
    }

    /// The instruction type's name as goto programs print it.
    pub fn name(&self) -> &'static str {
        match self {
            InstructionKind::Decl(_) => "DECL",
            InstructionKind::Dead(_) => "DEAD",
            InstructionKind::Assign { .. } => "ASSIGN",
            InstructionKind::FunctionCall(_) => "FUNCTION_CALL",
            InstructionKind::EndFunction => "END_FUNCTION",
            InstructionKind::Goto { .. } => "GOTO",
            InstructionKind::Assume(_) => "ASSUME",
            InstructionKind::Assert(_) => "ASSERT",
            InstructionKind::Skip => "SKIP",
            InstructionKind::Location => "LOCATION",
            InstructionKind::Return(_) => "RETURN",
            InstructionKind::StartThread(_) => "START_THREAD",
            InstructionKind::EndThread => "END_THREAD",
            InstructionKind::AtomicBegin => "ATOMIC_BEGIN",
            InstructionKind::AtomicEnd => "ATOMIC_END",
            InstructionKind::Throw => "THROW",
            InstructionKind::Catch => "CATCH",
            InstructionKind::Other => "OTHER",
            InstructionKind::IncompleteGoto => "INCOMPLETE_GOTO",
            InstructionKind::NoInstructionType => "NO_INSTRUCTION_TYPE",
        }
    }

    /// Every expression the instruction mentions.
    pub fn expressions(&self) -> Vec<&Expr> {
        match self {
            InstructionKind::Assign { lhs, rhs } => vec![lhs, rhs],
            InstructionKind::FunctionCall(call) => call.lhs.iter().chain(call.arguments.iter()).collect(),
            InstructionKind::Goto { guard, .. } | InstructionKind::Assume(guard) | InstructionKind::Assert(guard) => {
                vec![guard]
            }
            InstructionKind::Return(Some(value)) => vec![value],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Instruction {
    pub kind: InstructionKind,
    /// The function this instruction belongs to.
    pub function: Identifier,
}

/// Where a function body sits in the flat instruction vector.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FunctionBody {
    pub entry: Location,
    /// The body's `END_FUNCTION`.
    pub end: Location,
}

#[derive(Debug, Clone, Default)]
pub struct GotoProgram {
    instructions: Vec<Instruction>,
    functions: BTreeMap<Identifier, FunctionBody>,
}

impl GotoProgram {
    pub fn new() -> Self {
        Self::default()
    }

    /// The location the next added instruction will get.
    pub fn next_location(&self) -> Location {
        Location::new(self.instructions.len())
    }

    /// Append a function body, terminated by an added `END_FUNCTION`.
    /// Returns the body's entry location.
    ///
    /// Goto targets inside `body` are absolute; use
    /// [`next_location`][Self::next_location] to compute them.
    pub fn add_function(&mut self, name: &str, body: Vec<InstructionKind>) -> Location {
        let function = Identifier::new(name);
        assert!(!self.functions.contains_key(&function), "Function {} is already defined", name);

        let entry = self.next_location();
        for kind in body {
            self.instructions.push(Instruction {
                kind,
                function: function.clone(),
            });
        }
        let end = self.next_location();
        self.instructions.push(Instruction {
            kind: InstructionKind::EndFunction,
            function: function.clone(),
        });
        self.functions.insert(function, FunctionBody { entry, end });
        entry
    }

    pub fn instruction(&self, location: Location) -> &Instruction {
        &self.instructions[location.index()]
    }

    pub fn get(&self, location: Location) -> Option<&Instruction> {
        self.instructions.get(location.index())
    }

    pub fn body(&self, function: &Identifier) -> Option<FunctionBody> {
        self.functions.get(function).copied()
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn instructions(&self) -> impl Iterator<Item = (Location, &Instruction)> {
        self.instructions.iter().enumerate().map(|(i, inst)| (Location::new(i), inst))
    }

    /// Locations of all calls to `function`.
    pub fn call_sites<'a>(&'a self, function: &'a Identifier) -> impl Iterator<Item = Location> + 'a {
        self.instructions().filter_map(move |(loc, inst)| match &inst.kind {
            InstructionKind::FunctionCall(call) if &call.function == function => Some(loc),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Symbol {
    pub name: Identifier,
    pub ty: Type,
    /// Globals and other objects visible to more than one function activation.
    pub is_shared: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: BTreeMap<Identifier, Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, ty: Type, is_shared: bool) {
        let name = Identifier::new(name);
        self.symbols.insert(name.clone(), Symbol { name, ty, is_shared });
    }

    pub fn add_local(&mut self, name: &str, ty: Type) {
        self.add(name, ty, false);
    }

    pub fn add_global(&mut self, name: &str, ty: Type) {
        self.add(name, ty, true);
    }

    /// Register a function symbol; its parameters become locals.
    pub fn add_function(&mut self, name: &str, parameters: Vec<Parameter>, return_type: Type) {
        for p in &parameters {
            if !p.identifier.is_empty() {
                self.add_local(p.identifier.as_str(), p.ty.clone());
            }
        }
        self.add(name, Type::code(parameters, return_type), true);
    }

    pub fn lookup(&self, name: &Identifier) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    pub fn is_shared(&self, name: &Identifier) -> bool {
        self.lookup(name).is_some_and(|s| s.is_shared)
    }
}

/// A program together with its symbols.
#[derive(Debug, Clone, Default)]
pub struct GotoModel {
    pub symbols: SymbolTable,
    pub program: GotoProgram,
}

impl GotoModel {
    pub fn new(symbols: SymbolTable, program: GotoProgram) -> Self {
        Self { symbols, program }
    }

    /// Formal parameters of `function`, if it has a code type.
    pub fn parameters(&self, function: &Identifier) -> Option<&[Parameter]> {
        let code = self.symbols.lookup(function)?.ty.as_code()?;
        Some(&code.parameters)
    }
}
