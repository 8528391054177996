//! Typed AST consumed by the pattern extractor.
//!
//! The compiler frontend is an external collaborator: it parses C/C++ and
//! hands over this tree with source locations and computed record layouts
//! already attached. Tests and embedders construct the tree directly.

use crate::source_location::SourceLocation;
use std::fmt;

/// One parsed source file plus the record declarations visible in it.
#[derive(Debug, Clone)]
pub struct TranslationUnit {
    /// The primary file of this unit. Constructs located elsewhere
    /// (headers) are skipped by the extractor.
    pub main_file: String,
    pub stmts: Vec<Stmt>,
    pub records: Vec<RecordDecl>,
    /// Set when the frontend reported a fatal diagnostic; the extractor
    /// refuses the unit and the pipeline continues with the others.
    pub fatal_diagnostic: Option<String>,
}

impl TranslationUnit {
    pub fn new(main_file: impl Into<String>) -> Self {
        Self {
            main_file: main_file.into(),
            stmts: Vec::new(),
            records: Vec::new(),
            fatal_diagnostic: None,
        }
    }

    pub fn with_stmts(mut self, stmts: Vec<Stmt>) -> Self {
        self.stmts = stmts;
        self
    }

    pub fn with_records(mut self, records: Vec<RecordDecl>) -> Self {
        self.records = records;
        self
    }
}

#[derive(Debug, Clone)]
pub enum Stmt {
    For(ForStmt),
    While(WhileStmt),
    DoWhile(WhileStmt),
    Block(Vec<Stmt>),
    Expr(Expr),
    Decl(VarDecl),
}

/// A `for` statement with its three clauses split out the way libclang
/// exposes them.
#[derive(Debug, Clone)]
pub struct ForStmt {
    pub location: SourceLocation,
    /// The single variable declared in the init clause, when there is one.
    pub init: Option<VarDecl>,
    pub condition: Option<Expr>,
    pub increment: Option<Expr>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct WhileStmt {
    pub location: SourceLocation,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct VarDecl {
    pub location: SourceLocation,
    pub name: String,
    pub init: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    PreInc,
    PostInc,
    PreDec,
    PostDec,
    Deref,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    Assign,
    AddAssign,
    SubAssign,
    MulAssign,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Assign => "=",
            BinaryOp::AddAssign => "+=",
            BinaryOp::SubAssign => "-=",
            BinaryOp::MulAssign => "*=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub location: SourceLocation,
    pub kind: ExprKind,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    DeclRef { name: String, is_pointer: bool },
    IntLiteral(i64),
    Subscript { base: Box<Expr>, index: Box<Expr> },
    Member { base: Box<Expr>, field: String, is_arrow: bool },
    Unary { op: UnaryOp, operand: Box<Expr> },
    Binary { op: BinaryOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Call { callee: String, args: Vec<Expr> },
}

impl Expr {
    pub fn new(kind: ExprKind) -> Self {
        Self {
            location: SourceLocation::new("", 0),
            kind,
        }
    }

    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = location;
        self
    }

    pub fn decl_ref(name: impl Into<String>) -> Self {
        Self::new(ExprKind::DeclRef {
            name: name.into(),
            is_pointer: false,
        })
    }

    pub fn pointer_ref(name: impl Into<String>) -> Self {
        Self::new(ExprKind::DeclRef {
            name: name.into(),
            is_pointer: true,
        })
    }

    pub fn int(value: i64) -> Self {
        Self::new(ExprKind::IntLiteral(value))
    }

    pub fn subscript(base: Expr, index: Expr) -> Self {
        Self::new(ExprKind::Subscript {
            base: Box::new(base),
            index: Box::new(index),
        })
    }

    pub fn member(base: Expr, field: impl Into<String>) -> Self {
        Self::new(ExprKind::Member {
            base: Box::new(base),
            field: field.into(),
            is_arrow: false,
        })
    }

    pub fn arrow(base: Expr, field: impl Into<String>) -> Self {
        Self::new(ExprKind::Member {
            base: Box::new(base),
            field: field.into(),
            is_arrow: true,
        })
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Self::new(ExprKind::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Self::new(ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    pub fn call(callee: impl Into<String>, args: Vec<Expr>) -> Self {
        Self::new(ExprKind::Call {
            callee: callee.into(),
            args,
        })
    }

    /// `name` when the expression is a plain variable reference.
    pub fn as_decl_ref(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::DeclRef { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn as_int_literal(&self) -> Option<i64> {
        match &self.kind {
            ExprKind::IntLiteral(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::DeclRef { name, .. } => write!(f, "{}", name),
            ExprKind::IntLiteral(v) => write!(f, "{}", v),
            ExprKind::Subscript { base, index } => write!(f, "{}[{}]", base, index),
            ExprKind::Member { base, field, is_arrow } => {
                write!(f, "{}{}{}", base, if *is_arrow { "->" } else { "." }, field)
            }
            ExprKind::Unary { op, operand } => match op {
                UnaryOp::PreInc => write!(f, "++{}", operand),
                UnaryOp::PostInc => write!(f, "{}++", operand),
                UnaryOp::PreDec => write!(f, "--{}", operand),
                UnaryOp::PostDec => write!(f, "{}--", operand),
                UnaryOp::Deref => write!(f, "*{}", operand),
                UnaryOp::Neg => write!(f, "-{}", operand),
            },
            ExprKind::Binary { op, lhs, rhs } => {
                write!(f, "{} {} {}", lhs, op.symbol(), rhs)
            }
            ExprKind::Call { callee, args } => {
                write!(f, "{}(", callee)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// A record declaration with the layout the frontend computed for it.
#[derive(Debug, Clone)]
pub struct RecordDecl {
    pub name: String,
    pub location: SourceLocation,
    pub fields: Vec<FieldLayout>,
    pub total_size_bytes: u64,
    pub is_packed: bool,
}

#[derive(Debug, Clone)]
pub struct FieldLayout {
    pub name: String,
    pub offset_bytes: u64,
    pub size_bytes: u64,
    pub is_pointer: bool,
}
