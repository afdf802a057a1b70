// reduction.rs — Reduction domain shared by a stage's update schedules
//
// A reference-counted iteration-space descriptor. Schedules hold a shared
// reference; copying the handle aliases, `deep_copy` duplicates.
//
// Preconditions: none.
// Postconditions: `deep_copy` of a defined domain shares no storage with
//   the source; `deep_copy` of an undefined domain is undefined.
// Failure modes: none.
// Side effects: none.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::expr::{Expr, IrMutator, IrVisitor};

/// One reduction variable: iterates `var` over `[min, min + extent)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReductionVariable {
    pub var: String,
    pub min: Expr,
    pub extent: Expr,
}

#[derive(Debug, Clone, PartialEq, Default)]
struct ReductionDomainContents {
    domain: Vec<ReductionVariable>,
    predicate: Option<Expr>,
}

/// Handle to a shared reduction domain. The default handle is undefined.
#[derive(Debug, Clone, Default)]
pub struct ReductionDomain {
    contents: Option<Rc<RefCell<ReductionDomainContents>>>,
}

impl ReductionDomain {
    pub fn new(domain: Vec<ReductionVariable>) -> Self {
        ReductionDomain {
            contents: Some(Rc::new(RefCell::new(ReductionDomainContents {
                domain,
                predicate: None,
            }))),
        }
    }

    pub fn defined(&self) -> bool {
        self.contents.is_some()
    }

    /// True if both handles refer to the same underlying domain.
    pub fn same_as(&self, other: &ReductionDomain) -> bool {
        match (&self.contents, &other.contents) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Identity of the underlying domain, for memo maps.
    pub(crate) fn key(&self) -> Option<usize> {
        self.contents.as_ref().map(|c| Rc::as_ptr(c) as *const () as usize)
    }

    pub fn domain(&self) -> Vec<ReductionVariable> {
        self.contents
            .as_ref()
            .map(|c| c.borrow().domain.clone())
            .unwrap_or_default()
    }

    pub fn predicate(&self) -> Option<Expr> {
        self.contents
            .as_ref()
            .and_then(|c| c.borrow().predicate.clone())
    }

    /// Restrict the domain to points where `predicate` holds. Conjoined with
    /// any existing predicate. No-op on an undefined domain.
    pub fn where_(&self, predicate: Expr) {
        if let Some(c) = &self.contents {
            let mut c = c.borrow_mut();
            c.predicate = Some(match c.predicate.take() {
                Some(prev) => Expr::binary(crate::expr::BinOp::And, prev, predicate),
                None => predicate,
            });
        }
    }

    /// Independent copy of the domain. Undefined stays undefined.
    pub fn deep_copy(&self) -> ReductionDomain {
        ReductionDomain {
            contents: self
                .contents
                .as_ref()
                .map(|c| Rc::new(RefCell::new(c.borrow().clone()))),
        }
    }

    /// Rewrite every variable bound, then the predicate.
    pub fn mutate(&self, mutator: &mut dyn IrMutator) {
        if let Some(c) = &self.contents {
            let (mut domain, mut predicate) = {
                let c = c.borrow();
                (c.domain.clone(), c.predicate.clone())
            };
            for rv in domain.iter_mut() {
                rv.min = mutator.mutate(&rv.min);
                rv.extent = mutator.mutate(&rv.extent);
            }
            if let Some(p) = predicate.as_mut() {
                *p = mutator.mutate(p);
            }
            let mut c = c.borrow_mut();
            c.domain = domain;
            c.predicate = predicate;
        }
    }

    /// Read-only counterpart of `mutate`, same order.
    pub fn accept(&self, visitor: &mut dyn IrVisitor) {
        if let Some(c) = &self.contents {
            let c = c.borrow();
            for rv in &c.domain {
                visitor.visit(&rv.min);
                visitor.visit(&rv.extent);
            }
            if let Some(p) = &c.predicate {
                visitor.visit(p);
            }
        }
    }
}

impl fmt::Display for ReductionDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match &self.contents {
            Some(c) => c.borrow(),
            None => return write!(f, "<undefined>"),
        };
        write!(f, "[")?;
        for (i, rv) in c.domain.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} min={} extent={}", rv.var, rv.min, rv.extent)?;
        }
        write!(f, "]")?;
        if let Some(p) = &c.predicate {
            write!(f, " where {p}")?;
        }
        Ok(())
    }
}
