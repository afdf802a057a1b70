// AST node types for schedule directive scripts.
//
// A script declares stages and applies chains of scheduling directives to
// them. Every node carries a `SimpleSpan` for error reporting.
//
// Preconditions: produced by the parser from a valid or partially-valid token stream.
// Postconditions: each node's span covers the source range of the construct.
// Failure modes: none (data-only module).
// Side effects: none.

use chumsky::span::SimpleSpan;

use crate::expr::Expr;

/// Byte-offset span (alias for chumsky's `SimpleSpan`).
pub type Span = SimpleSpan;

// ── Root ──

#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    pub statements: Vec<Statement>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Stage(StageDecl),
    Directives(DirectiveChain),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

// ── stage_decl: 'stage' IDENT '(' (IDENT (',' IDENT)*)? ')' ──

#[derive(Debug, Clone, PartialEq)]
pub struct StageDecl {
    pub name: Ident,
    pub args: Vec<Ident>,
}

// ── directive_chain: IDENT ('.' call)+ ──

/// `f.specialize(p == 1).split(y, yo, yi, 4)`
#[derive(Debug, Clone, PartialEq)]
pub struct DirectiveChain {
    pub target: Ident,
    pub calls: Vec<Call>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub name: Ident,
    pub args: Vec<Arg>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Expr(Expr, Span),
    Str(String, Span),
}

impl Arg {
    pub fn span(&self) -> Span {
        match self {
            Arg::Expr(_, span) | Arg::Str(_, span) => *span,
        }
    }
}
