// expr.rs — Expression IR carried by schedules
//
// A tagged-variant expression type plus the two seams global passes use to
// reach expressions embedded in schedule metadata: `IrMutator` (rewrite) and
// `IrVisitor` (read-only). Both are implemented for plain closures so a pass
// can be written as `|e| simplify(e)`.
//
// Preconditions: none.
// Postconditions: `simplify` never changes the value of an expression under
//   any variable binding; it only folds constants and neutral elements.
// Failure modes: none (division by zero folds to 0, overflow is left unfolded).
// Side effects: none.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

// ── Operators ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    /// Binding strength used by `Display`. Higher binds tighter.
    /// `min`/`max` render as calls and never need parentheses.
    fn precedence(self) -> u8 {
        match self {
            BinOp::Or => 1,
            BinOp::And => 2,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => 3,
            BinOp::Add | BinOp::Sub => 4,
            BinOp::Mul | BinOp::Div | BinOp::Mod => 5,
            BinOp::Min | BinOp::Max => 7,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Min => "min",
            BinOp::Max => "max",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

// ── Expression ──────────────────────────────────────────────────────────────

/// An expression node. Fields that may be "undefined" in schedule metadata
/// hold `Option<Expr>`; an `Expr` value itself is always defined.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    Int(i64),
    Bool(bool),
    Var(String),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    pub fn int(value: i64) -> Self {
        Expr::Int(value)
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn eq(lhs: Expr, rhs: Expr) -> Self {
        Expr::binary(BinOp::Eq, lhs, rhs)
    }

    pub fn not(operand: Expr) -> Self {
        Expr::Not(Box::new(operand))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Expr::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Expr::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Rebuild this node with `f` applied to each direct child.
    /// Leaves are returned unchanged.
    pub fn map_children(&self, mut f: impl FnMut(&Expr) -> Expr) -> Expr {
        match self {
            Expr::Int(_) | Expr::Bool(_) | Expr::Var(_) => self.clone(),
            Expr::Binary(op, a, b) => Expr::binary(*op, f(a), f(b)),
            Expr::Not(a) => Expr::not(f(a)),
        }
    }

    /// Call `f` on each direct child.
    pub fn for_each_child(&self, mut f: impl FnMut(&Expr)) {
        match self {
            Expr::Int(_) | Expr::Bool(_) | Expr::Var(_) => {}
            Expr::Binary(_, a, b) => {
                f(a);
                f(b);
            }
            Expr::Not(a) => f(a),
        }
    }

    fn fmt_prec(&self, f: &mut fmt::Formatter<'_>, parent: u8) -> fmt::Result {
        match self {
            Expr::Int(v) => write!(f, "{v}"),
            Expr::Bool(b) => write!(f, "{b}"),
            Expr::Var(name) => write!(f, "{name}"),
            Expr::Not(a) => {
                write!(f, "!")?;
                a.fmt_prec(f, 6)
            }
            Expr::Binary(op @ (BinOp::Min | BinOp::Max), a, b) => {
                write!(f, "{}(", op.symbol())?;
                a.fmt_prec(f, 0)?;
                write!(f, ", ")?;
                b.fmt_prec(f, 0)?;
                write!(f, ")")
            }
            Expr::Binary(op, a, b) => {
                let prec = op.precedence();
                let paren = prec < parent;
                if paren {
                    write!(f, "(")?;
                }
                a.fmt_prec(f, prec)?;
                write!(f, " {} ", op.symbol())?;
                // Left-associative: an equal-precedence right operand needs parens.
                b.fmt_prec(f, prec + 1)?;
                if paren {
                    write!(f, ")")?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_prec(f, 0)
    }
}

// ── Transform / visit seams ─────────────────────────────────────────────────

/// A rewrite applied to one whole expression field at a time.
pub trait IrMutator {
    fn mutate(&mut self, expr: &Expr) -> Expr;
}

impl<F> IrMutator for F
where
    F: FnMut(&Expr) -> Expr,
{
    fn mutate(&mut self, expr: &Expr) -> Expr {
        self(expr)
    }
}

/// A read-only inspection of one whole expression field at a time.
pub trait IrVisitor {
    fn visit(&mut self, expr: &Expr);
}

impl<F> IrVisitor for F
where
    F: FnMut(&Expr),
{
    fn visit(&mut self, expr: &Expr) {
        self(expr)
    }
}

// ── Substitution ────────────────────────────────────────────────────────────

/// Replaces free variables by bound expressions, recursively.
#[derive(Debug, Clone, Default)]
pub struct Substitute {
    bindings: HashMap<String, Expr>,
}

impl Substitute {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, name: impl Into<String>, value: Expr) -> Self {
        self.bindings.insert(name.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn apply(&self, expr: &Expr) -> Expr {
        match expr {
            Expr::Var(name) => match self.bindings.get(name) {
                Some(value) => value.clone(),
                None => expr.clone(),
            },
            _ => expr.map_children(|c| self.apply(c)),
        }
    }
}

impl IrMutator for Substitute {
    fn mutate(&mut self, expr: &Expr) -> Expr {
        self.apply(expr)
    }
}

// ── Constant folding ────────────────────────────────────────────────────────

/// Fold constants and neutral elements bottom-up.
///
/// Integer division and modulo are Euclidean, and a zero divisor folds to 0.
pub fn simplify(expr: &Expr) -> Expr {
    let expr = expr.map_children(simplify);
    let folded = match &expr {
        Expr::Not(a) => match a.as_ref() {
            Expr::Bool(b) => Some(Expr::Bool(!b)),
            Expr::Not(inner) => Some(inner.as_ref().clone()),
            _ => None,
        },
        Expr::Binary(op, a, b) => fold_binary(*op, a, b),
        _ => None,
    };
    folded.unwrap_or(expr)
}

fn fold_binary(op: BinOp, a: &Expr, b: &Expr) -> Option<Expr> {
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return fold_int(op, x, y);
    }
    if let (Some(x), Some(y)) = (a.as_bool(), b.as_bool()) {
        return match op {
            BinOp::And => Some(Expr::Bool(x && y)),
            BinOp::Or => Some(Expr::Bool(x || y)),
            BinOp::Eq => Some(Expr::Bool(x == y)),
            BinOp::Ne => Some(Expr::Bool(x != y)),
            _ => None,
        };
    }
    match (op, a.as_int(), b.as_int()) {
        (BinOp::Add, Some(0), _) | (BinOp::Mul, Some(1), _) => Some(b.clone()),
        (BinOp::Add | BinOp::Sub, _, Some(0)) | (BinOp::Mul | BinOp::Div, _, Some(1)) => {
            Some(a.clone())
        }
        _ => match (op, a.as_bool(), b.as_bool()) {
            (BinOp::And, Some(true), _) | (BinOp::Or, Some(false), _) => Some(b.clone()),
            (BinOp::And, _, Some(true)) | (BinOp::Or, _, Some(false)) => Some(a.clone()),
            (BinOp::And, Some(false), _) | (BinOp::And, _, Some(false)) => Some(Expr::Bool(false)),
            (BinOp::Or, Some(true), _) | (BinOp::Or, _, Some(true)) => Some(Expr::Bool(true)),
            _ => None,
        },
    }
}

fn fold_int(op: BinOp, x: i64, y: i64) -> Option<Expr> {
    let folded = match op {
        BinOp::Add => Expr::Int(x.checked_add(y)?),
        BinOp::Sub => Expr::Int(x.checked_sub(y)?),
        BinOp::Mul => Expr::Int(x.checked_mul(y)?),
        BinOp::Div if y == 0 => Expr::Int(0),
        BinOp::Div => Expr::Int(x.checked_div_euclid(y)?),
        BinOp::Mod if y == 0 => Expr::Int(0),
        BinOp::Mod => Expr::Int(x.checked_rem_euclid(y)?),
        BinOp::Min => Expr::Int(x.min(y)),
        BinOp::Max => Expr::Int(x.max(y)),
        BinOp::Eq => Expr::Bool(x == y),
        BinOp::Ne => Expr::Bool(x != y),
        BinOp::Lt => Expr::Bool(x < y),
        BinOp::Le => Expr::Bool(x <= y),
        BinOp::Gt => Expr::Bool(x > y),
        BinOp::Ge => Expr::Bool(x >= y),
        BinOp::And | BinOp::Or => return None,
    };
    Some(folded)
}

// ── Free variables ──────────────────────────────────────────────────────────

/// Collects the names of free variables across every visited expression.
#[derive(Debug, Clone, Default)]
pub struct FreeVars {
    pub names: BTreeSet<String>,
}

impl FreeVars {
    fn collect(&mut self, expr: &Expr) {
        if let Expr::Var(name) = expr {
            self.names.insert(name.clone());
        }
        expr.for_each_child(|c| self.collect(c));
    }
}

impl IrVisitor for FreeVars {
    fn visit(&mut self, expr: &Expr) {
        self.collect(expr);
    }
}

/// Free variables of a single expression, in name order.
pub fn free_vars(expr: &Expr) -> BTreeSet<String> {
    let mut fv = FreeVars::default();
    fv.visit(expr);
    fv.names
}

// ── Tests ───────────────────────────────────────────────────────────────────
