//! Statement tree for littlelang programs
//!
//! The tree is immutable input to code generation. Blocks own their nested
//! blocks; the enclosing scope of a block is not stored in it but threaded
//! through compilation (see [`crate::x64::scope`]).

use std::fmt;

/// A translation unit: named functions in declaration order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranslationUnit {
    pub functions: Vec<FunctionDefinition>,
}

/// `fn name() { ... }`
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    pub block: Block,
}

/// Variable types. Every variable occupies one 8-byte stack slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarType {
    Int64,
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarType::Int64 => write!(f, "int64"),
        }
    }
}

/// A declared variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableDefinition {
    pub name: String,
    pub ty: VarType,
}

/// A lexical scope: declarations in declaration order, then statements
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub vars: Vec<VariableDefinition>,
    pub statements: Vec<Statement>,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an `int64` variable
    pub fn declare(mut self, name: &str) -> Self {
        self.vars.push(VariableDefinition {
            name: name.to_string(),
            ty: VarType::Int64,
        });
        self
    }

    /// Append a statement
    pub fn with(mut self, statement: Statement) -> Self {
        self.statements.push(statement);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Call(FunctionCall),
    Assign(Assignment),
    IfChain(IfChain),
    Loop(Loop),
}

/// `name(params...);`
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub params: Vec<Param>,
}

/// `target = value;`
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub target: String,
    pub value: Param,
}

/// `if (..) {..} else if (..) {..} else {..}`
///
/// Only the final arm may lack a condition.
#[derive(Debug, Clone, PartialEq)]
pub struct IfChain {
    pub arms: Vec<ConditionalBlock>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalBlock {
    /// `None` for a trailing `else`
    pub condition: Option<Condition>,
    pub block: Block,
}

/// `while (..) {..}`
#[derive(Debug, Clone, PartialEq)]
pub struct Loop {
    pub condition: Condition,
    pub body: Block,
}

/// `lhs <comparator> rhs`, always signed
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub comparator: Comparator,
    pub lhs: Param,
    pub rhs: Param,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Comparator::Equal => "==",
            Comparator::NotEqual => "!=",
            Comparator::LessThan => "<",
            Comparator::LessThanOrEqual => "<=",
            Comparator::GreaterThan => ">",
            Comparator::GreaterThanOrEqual => ">=",
        };
        write!(f, "{}", symbol)
    }
}

/// An expression
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Int64(i64),
    Str(String),
    Variable(String),
    Calculation(Box<Calculation>),
}

impl Param {
    /// Build a binary expression
    pub fn calc(op: Operation, lhs: Param, rhs: Param) -> Self {
        Param::Calculation(Box::new(Calculation { op, lhs, rhs }))
    }

    pub fn var(name: &str) -> Self {
        Param::Variable(name.to_string())
    }

    pub fn str(text: &str) -> Self {
        Param::Str(text.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Calculation {
    pub op: Operation,
    pub lhs: Param,
    pub rhs: Param,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Add,
    Mod,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Add => write!(f, "+"),
            Operation::Mod => write!(f, "%"),
        }
    }
}

impl Statement {
    pub fn call(name: &str, params: Vec<Param>) -> Self {
        Statement::Call(FunctionCall {
            name: name.to_string(),
            params,
        })
    }

    pub fn assign(target: &str, value: Param) -> Self {
        Statement::Assign(Assignment {
            target: target.to_string(),
            value,
        })
    }
}
