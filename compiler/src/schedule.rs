// schedule.rs — Shared, specializable schedule metadata for one stage
//
// A `Schedule` is a cheap handle to a reference-counted record describing how
// a stage's loop nest is split, ordered, placed, bounded, and specialized.
// Copying the handle aliases the record; `deep_copy` produces a
// storage-disjoint clone, cloning wrapper stages at most once per
// `DeepCopyMap`.
//
// Preconditions: accessors require a defined handle (`Schedule::new` or
//   `Default`); only `Schedule::undefined()` lacks a record.
// Postconditions: `deep_copy` preserves sharing of wrapper stages and
//   reduction domains reachable through the source; `mutate`/`accept` visit
//   splits, bounds, specializations (condition, then nested record), then the
//   reduction domain, each expression once per pass.
// Failure modes: named wrapper redefinition and top-level deep copy of an
//   undefined schedule return `ScheduleError`.
// Side effects: default-wrapper replacement pushes a warning diagnostic and
//   logs it through `tracing`.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::{BTreeMap, HashSet};
use std::fmt::{self, Write as _};
use std::rc::Rc;

use crate::diag::{codes, Diagnostic, ScheduleError};
use crate::expr::{simplify, Expr, IrMutator, IrVisitor, Substitute};
use crate::reduction::ReductionDomain;
use crate::stage::{DeepCopyMap, Stage};

// ── Placement ───────────────────────────────────────────────────────────────

/// Where a stage is computed or stored, relative to another stage's loops.
///
/// `At` names the other stage; it is a reference by name, not ownership, and
/// is copied verbatim by `deep_copy`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoopLevel {
    #[default]
    Inlined,
    Root,
    At { stage: String, var: String },
}

impl LoopLevel {
    pub fn at(stage: impl Into<String>, var: impl Into<String>) -> Self {
        LoopLevel::At {
            stage: stage.into(),
            var: var.into(),
        }
    }

    pub fn is_inlined(&self) -> bool {
        matches!(self, LoopLevel::Inlined)
    }

    pub fn is_root(&self) -> bool {
        matches!(self, LoopLevel::Root)
    }
}

impl fmt::Display for LoopLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopLevel::Inlined => write!(f, "inlined"),
            LoopLevel::Root => write!(f, "root"),
            LoopLevel::At { stage, var } => write!(f, "{stage}.{var}"),
        }
    }
}

// ── Loop transforms ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitKind {
    SplitVar,
    RenameVar,
    FuseVars,
}

/// One loop-splitting transform. Only `SplitVar` carries a factor.
///
/// For `FuseVars`, `old_var` is the fused result and `inner`/`outer` are the
/// loops it replaces.
#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub old_var: String,
    pub outer: String,
    pub inner: String,
    pub factor: Option<Expr>,
    pub exact: bool,
    pub kind: SplitKind,
}

impl Split {
    pub fn split(
        old_var: impl Into<String>,
        outer: impl Into<String>,
        inner: impl Into<String>,
        factor: Expr,
    ) -> Self {
        Split {
            old_var: old_var.into(),
            outer: outer.into(),
            inner: inner.into(),
            factor: Some(factor),
            exact: false,
            kind: SplitKind::SplitVar,
        }
    }

    pub fn rename(old_var: impl Into<String>, new_var: impl Into<String>) -> Self {
        Split {
            old_var: old_var.into(),
            outer: new_var.into(),
            inner: String::new(),
            factor: None,
            exact: false,
            kind: SplitKind::RenameVar,
        }
    }

    pub fn fuse(
        inner: impl Into<String>,
        outer: impl Into<String>,
        fused: impl Into<String>,
    ) -> Self {
        Split {
            old_var: fused.into(),
            outer: outer.into(),
            inner: inner.into(),
            factor: None,
            exact: false,
            kind: SplitKind::FuseVars,
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SplitKind::SplitVar => {
                write!(f, "split {} -> {}, {}", self.old_var, self.outer, self.inner)?;
                if let Some(factor) = &self.factor {
                    write!(f, " by {factor}")?;
                }
                if self.exact {
                    write!(f, " exact")?;
                }
                Ok(())
            }
            SplitKind::RenameVar => write!(f, "rename {} -> {}", self.old_var, self.outer),
            SplitKind::FuseVars => {
                write!(f, "fuse {}, {} -> {}", self.inner, self.outer, self.old_var)
            }
        }
    }
}

// ── Per-dimension descriptors ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForType {
    #[default]
    Serial,
    Parallel,
    Vectorized,
    Unrolled,
}

impl fmt::Display for ForType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ForType::Serial => "serial",
            ForType::Parallel => "parallel",
            ForType::Vectorized => "vectorized",
            ForType::Unrolled => "unrolled",
        };
        write!(f, "{s}")
    }
}

/// One loop of the stage's nest. Dims are ordered innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dim {
    pub var: String,
    pub for_type: ForType,
    pub pure: bool,
}

impl Dim {
    pub fn pure(var: impl Into<String>) -> Self {
        Dim {
            var: var.into(),
            for_type: ForType::Serial,
            pure: true,
        }
    }
}

/// Storage layout of one dimension of the stage's buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDim {
    pub var: String,
    pub alignment: Option<u32>,
    pub fold_factor: Option<u32>,
    pub fold_forward: bool,
}

impl StorageDim {
    pub fn new(var: impl Into<String>) -> Self {
        StorageDim {
            var: var.into(),
            alignment: None,
            fold_factor: None,
            fold_forward: true,
        }
    }
}

/// Explicit min/extent constraint on one dimension. Either side may be absent.
#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
    pub var: String,
    pub min: Option<Expr>,
    pub extent: Option<Expr>,
}

impl Bound {
    pub fn new(var: impl Into<String>, min: Option<Expr>, extent: Option<Expr>) -> Self {
        Bound {
            var: var.into(),
            min,
            extent,
        }
    }
}

// ── Specialization ──────────────────────────────────────────────────────────

/// A condition-gated alternate schedule. Cloning aliases the nested schedule.
#[derive(Debug, Clone)]
pub struct Specialization {
    pub condition: Expr,
    pub schedule: Schedule,
}

// ── Record ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ScheduleContents {
    store_level: LoopLevel,
    compute_level: LoopLevel,
    splits: Vec<Split>,
    dims: Vec<Dim>,
    storage_dims: Vec<StorageDim>,
    bounds: Vec<Bound>,
    specializations: Vec<Specialization>,
    wrappers: BTreeMap<String, Stage>,
    reduction_domain: ReductionDomain,
    memoized: bool,
    touched: bool,
    allow_race_conditions: bool,
}

impl ScheduleContents {
    /// Copy of every top-level field except specializations and wrappers.
    /// The reduction domain is shared, not duplicated.
    fn snapshot(&self) -> ScheduleContents {
        ScheduleContents {
            store_level: self.store_level.clone(),
            compute_level: self.compute_level.clone(),
            splits: self.splits.clone(),
            dims: self.dims.clone(),
            storage_dims: self.storage_dims.clone(),
            bounds: self.bounds.clone(),
            specializations: Vec::new(),
            wrappers: BTreeMap::new(),
            reduction_domain: self.reduction_domain.clone(),
            memoized: self.memoized,
            touched: self.touched,
            allow_race_conditions: self.allow_race_conditions,
        }
    }
}

// ── Handle ──────────────────────────────────────────────────────────────────

/// Reference-counted handle to a schedule record.
#[derive(Debug, Clone)]
pub struct Schedule {
    contents: Option<Rc<RefCell<ScheduleContents>>>,
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::new()
    }
}

impl Schedule {
    /// A defined schedule with an empty record.
    pub fn new() -> Self {
        Schedule::from_contents(ScheduleContents::default())
    }

    /// A handle with no record.
    pub fn undefined() -> Self {
        Schedule { contents: None }
    }

    fn from_contents(contents: ScheduleContents) -> Self {
        Schedule {
            contents: Some(Rc::new(RefCell::new(contents))),
        }
    }

    pub fn defined(&self) -> bool {
        self.contents.is_some()
    }

    /// True if both handles alias the same record (or are both undefined).
    pub fn same_as(&self, other: &Schedule) -> bool {
        match (&self.contents, &other.contents) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Identity of the underlying record, if any.
    pub(crate) fn record_id(&self) -> Option<usize> {
        self.contents.as_ref().map(|c| Rc::as_ptr(c) as *const () as usize)
    }

    fn record(&self) -> &RefCell<ScheduleContents> {
        match &self.contents {
            Some(c) => c,
            None => panic!("internal error: access to the record of an undefined schedule"),
        }
    }

    fn read(&self) -> Ref<'_, ScheduleContents> {
        self.record().borrow()
    }

    fn write(&self) -> RefMut<'_, ScheduleContents> {
        self.record().borrow_mut()
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn store_level(&self) -> Ref<'_, LoopLevel> {
        Ref::map(self.read(), |c| &c.store_level)
    }

    pub fn store_level_mut(&self) -> RefMut<'_, LoopLevel> {
        RefMut::map(self.write(), |c| &mut c.store_level)
    }

    pub fn compute_level(&self) -> Ref<'_, LoopLevel> {
        Ref::map(self.read(), |c| &c.compute_level)
    }

    pub fn compute_level_mut(&self) -> RefMut<'_, LoopLevel> {
        RefMut::map(self.write(), |c| &mut c.compute_level)
    }

    pub fn splits(&self) -> Ref<'_, Vec<Split>> {
        Ref::map(self.read(), |c| &c.splits)
    }

    pub fn splits_mut(&self) -> RefMut<'_, Vec<Split>> {
        RefMut::map(self.write(), |c| &mut c.splits)
    }

    pub fn dims(&self) -> Ref<'_, Vec<Dim>> {
        Ref::map(self.read(), |c| &c.dims)
    }

    pub fn dims_mut(&self) -> RefMut<'_, Vec<Dim>> {
        RefMut::map(self.write(), |c| &mut c.dims)
    }

    pub fn storage_dims(&self) -> Ref<'_, Vec<StorageDim>> {
        Ref::map(self.read(), |c| &c.storage_dims)
    }

    pub fn storage_dims_mut(&self) -> RefMut<'_, Vec<StorageDim>> {
        RefMut::map(self.write(), |c| &mut c.storage_dims)
    }

    pub fn bounds(&self) -> Ref<'_, Vec<Bound>> {
        Ref::map(self.read(), |c| &c.bounds)
    }

    pub fn bounds_mut(&self) -> RefMut<'_, Vec<Bound>> {
        RefMut::map(self.write(), |c| &mut c.bounds)
    }

    /// Specializations in match-priority order.
    pub fn specializations(&self) -> Ref<'_, Vec<Specialization>> {
        Ref::map(self.read(), |c| &c.specializations)
    }

    /// Wrapper stages keyed by callsite name; `""` is the default wrapper.
    pub fn wrappers(&self) -> Ref<'_, BTreeMap<String, Stage>> {
        Ref::map(self.read(), |c| &c.wrappers)
    }

    /// The shared reduction domain (an alias, not a copy).
    pub fn reduction_domain(&self) -> ReductionDomain {
        self.read().reduction_domain.clone()
    }

    pub fn set_reduction_domain(&self, domain: ReductionDomain) {
        self.write().reduction_domain = domain;
    }

    pub fn memoized(&self) -> bool {
        self.read().memoized
    }

    pub fn set_memoized(&self, value: bool) {
        self.write().memoized = value;
    }

    /// Set by directive application; the core never sets it on its own.
    pub fn touched(&self) -> bool {
        self.read().touched
    }

    pub fn set_touched(&self, value: bool) {
        self.write().touched = value;
    }

    pub fn allow_race_conditions(&self) -> bool {
        self.read().allow_race_conditions
    }

    pub fn set_allow_race_conditions(&self, value: bool) {
        self.write().allow_race_conditions = value;
    }

    // ── Specializations ─────────────────────────────────────────────────

    /// Append a specialization whose nested schedule snapshots this record's
    /// current top-level state. The returned entry aliases the stored one.
    pub fn add_specialization(&self, condition: Expr) -> Specialization {
        let nested = Schedule::from_contents(self.read().snapshot());
        let spec = Specialization {
            condition,
            schedule: nested,
        };
        self.write().specializations.push(spec.clone());
        spec
    }

    /// The schedule that applies under `bindings`: the first specialization
    /// whose condition folds to `true`, else this schedule.
    pub fn select(&self, bindings: &Substitute) -> Schedule {
        let specs = self.specializations().clone();
        specs
            .into_iter()
            .find(|s| simplify(&bindings.apply(&s.condition)).as_bool() == Some(true))
            .map(|s| s.schedule)
            .unwrap_or_else(|| self.clone())
    }

    // ── Wrappers ────────────────────────────────────────────────────────

    /// Register `stage` as the wrapper used at callsite `name`.
    ///
    /// Replacing the default (`""`) wrapper is allowed and pushes a warning
    /// into `diags`. Redefining a named wrapper is fatal and leaves the map
    /// unchanged.
    pub fn add_wrapper(
        &self,
        name: &str,
        stage: Stage,
        diags: &mut Vec<Diagnostic>,
    ) -> Result<(), ScheduleError> {
        let mut c = self.write();
        if let Some(previous) = c.wrappers.get(name) {
            if !name.is_empty() {
                return Err(ScheduleError::WrapperRedefinition {
                    name: name.to_string(),
                });
            }
            tracing::warn!(
                previous = %previous.name(),
                replacement = %stage.name(),
                "replacing previous default wrapper"
            );
            diags.push(Diagnostic::warning(
                codes::W0500,
                format!(
                    "replacing previous default wrapper '{}' with '{}'",
                    previous.name(),
                    stage.name()
                ),
            ));
        }
        c.wrappers.insert(name.to_string(), stage);
        Ok(())
    }

    // ── Deep copy ───────────────────────────────────────────────────────

    /// Storage-disjoint clone of this schedule and everything it reaches.
    ///
    /// `memo` is shared with the enclosing graph clone: wrapper stages
    /// already cloned through another path are reused, so each original is
    /// cloned exactly once and wrapper cycles terminate.
    pub fn deep_copy(&self, memo: &mut DeepCopyMap) -> Result<Schedule, ScheduleError> {
        if !self.defined() {
            return Err(ScheduleError::UndefinedSchedule);
        }
        deep_copy_record(self, memo)
    }

    // ── Traversal ───────────────────────────────────────────────────────

    /// Rewrite every defined expression field in place, recursing into
    /// specializations. Undefined fields stay undefined.
    pub fn mutate(&self, mutator: &mut dyn IrMutator) {
        let mut seen_domains = HashSet::new();
        self.mutate_record(mutator, &mut seen_domains);
    }

    pub(crate) fn mutate_record(&self, mutator: &mut dyn IrMutator, seen_domains: &mut HashSet<usize>) {
        if !self.defined() {
            return;
        }
        // No borrow is held while the mutator runs; it may read this record.
        let (mut splits, mut bounds, nested, domain) = {
            let c = self.read();
            (
                c.splits.clone(),
                c.bounds.clone(),
                c.specializations.clone(),
                c.reduction_domain.clone(),
            )
        };
        for split in splits.iter_mut() {
            if let Some(factor) = split.factor.as_mut() {
                *factor = mutator.mutate(factor);
            }
        }
        for bound in bounds.iter_mut() {
            if let Some(min) = bound.min.as_mut() {
                *min = mutator.mutate(min);
            }
            if let Some(extent) = bound.extent.as_mut() {
                *extent = mutator.mutate(extent);
            }
        }
        {
            let mut c = self.write();
            c.splits = splits;
            c.bounds = bounds;
        }
        // Specializations share the parent's domain; the outermost record
        // that reaches a domain rewrites it, after its specializations.
        let owns_domain = domain.key().is_some_and(|key| seen_domains.insert(key));
        for (i, spec) in nested.iter().enumerate() {
            let condition = mutator.mutate(&spec.condition);
            self.write().specializations[i].condition = condition;
            spec.schedule.mutate_record(mutator, seen_domains);
        }
        if owns_domain {
            domain.mutate(mutator);
        }
    }

    /// Read-only counterpart of `mutate`, same fields and order.
    pub fn accept(&self, visitor: &mut dyn IrVisitor) {
        let mut seen_domains = HashSet::new();
        self.accept_record(visitor, &mut seen_domains);
    }

    pub(crate) fn accept_record(&self, visitor: &mut dyn IrVisitor, seen_domains: &mut HashSet<usize>) {
        if !self.defined() {
            return;
        }
        let c = self.read();
        for factor in c.splits.iter().filter_map(|s| s.factor.as_ref()) {
            visitor.visit(factor);
        }
        for bound in &c.bounds {
            if let Some(min) = &bound.min {
                visitor.visit(min);
            }
            if let Some(extent) = &bound.extent {
                visitor.visit(extent);
            }
        }
        let owns_domain = c
            .reduction_domain
            .key()
            .is_some_and(|key| seen_domains.insert(key));
        for spec in &c.specializations {
            visitor.visit(&spec.condition);
            spec.schedule.accept_record(visitor, seen_domains);
        }
        if owns_domain {
            c.reduction_domain.accept(visitor);
        }
    }

    // ── Rendering ───────────────────────────────────────────────────────

    fn render(&self, out: &mut String, depth: usize) -> fmt::Result {
        let pad = "    ".repeat(depth);
        let c = match &self.contents {
            Some(c) => c.borrow(),
            None => return writeln!(out, "{pad}<undefined>"),
        };
        writeln!(out, "{pad}compute_at {}", c.compute_level)?;
        writeln!(out, "{pad}store_at {}", c.store_level)?;
        for split in &c.splits {
            writeln!(out, "{pad}{split}")?;
        }
        for bound in &c.bounds {
            write!(out, "{pad}bound {}", bound.var)?;
            if let Some(min) = &bound.min {
                write!(out, " min={min}")?;
            }
            if let Some(extent) = &bound.extent {
                write!(out, " extent={extent}")?;
            }
            writeln!(out)?;
        }
        for dim in &c.dims {
            let kind = if dim.pure { "" } else { " impure" };
            writeln!(out, "{pad}dim {} {}{kind}", dim.var, dim.for_type)?;
        }
        for sd in &c.storage_dims {
            write!(out, "{pad}storage {}", sd.var)?;
            if let Some(align) = sd.alignment {
                write!(out, " align={align}")?;
            }
            if let Some(fold) = sd.fold_factor {
                let dir = if sd.fold_forward { "" } else { " backward" };
                write!(out, " fold={fold}{dir}")?;
            }
            writeln!(out)?;
        }
        for (name, stage) in &c.wrappers {
            writeln!(out, "{pad}wrap \"{name}\" -> {}", stage.name())?;
        }
        if c.reduction_domain.defined() {
            writeln!(out, "{pad}rdom {}", c.reduction_domain)?;
        }
        let flags: Vec<&str> = [
            (c.memoized, "memoized"),
            (c.touched, "touched"),
            (c.allow_race_conditions, "allow_race_conditions"),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .map(|(_, name)| *name)
        .collect();
        if !flags.is_empty() {
            writeln!(out, "{pad}flags {}", flags.join(" "))?;
        }
        for spec in &c.specializations {
            writeln!(out, "{pad}specialize {} {{", spec.condition)?;
            spec.schedule.render(out, depth + 1)?;
            writeln!(out, "{pad}}}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.render(&mut out, 0)?;
        f.write_str(&out)
    }
}

// ── Deep-copy engine ────────────────────────────────────────────────────────

fn deep_copy_record(src: &Schedule, memo: &mut DeepCopyMap) -> Result<Schedule, ScheduleError> {
    if !src.defined() {
        return Ok(Schedule::undefined());
    }

    // Take what we need under a short borrow; wrapper recursion may come back
    // around to this record through a cycle.
    let (mut dst, domain, wrappers, specializations) = {
        let c = src.read();
        (
            c.snapshot(),
            c.reduction_domain.clone(),
            c.wrappers.clone(),
            c.specializations.clone(),
        )
    };
    dst.reduction_domain = memo.copy_domain(&domain);

    for (name, stage) in &wrappers {
        let copy = match memo.get(stage) {
            Some(copy) => {
                tracing::debug!(stage = %stage.name(), wrapper = %name, "reusing cloned wrapper");
                copy
            }
            None => {
                tracing::debug!(stage = %stage.name(), wrapper = %name, "cloning wrapper");
                let copy = stage.deep_copy(memo)?;
                memo.insert(stage, copy.clone());
                copy
            }
        };
        dst.wrappers.insert(name.clone(), copy);
    }
    assert_eq!(
        dst.wrappers.len(),
        wrappers.len(),
        "internal error: deep copy lost wrapper entries"
    );

    for spec in &specializations {
        dst.specializations.push(Specialization {
            condition: spec.condition.clone(),
            schedule: deep_copy_record(&spec.schedule, memo)?,
        });
    }

    Ok(Schedule::from_contents(dst))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::BinOp;
    use crate::reduction::ReductionVariable;

    fn split_x() -> Split {
        Split::split("x", "xo", "xi", Expr::int(8))
    }

    fn bound_x() -> Bound {
        Bound::new("x", Some(Expr::int(0)), Some(Expr::int(16)))
    }

    fn p_is_one() -> Expr {
        Expr::eq(Expr::var("p"), Expr::int(1))
    }

    fn factors(s: &Schedule) -> Vec<Option<Expr>> {
        s.splits().iter().map(|s| s.factor.clone()).collect()
    }

    // ── Handle semantics ────────────────────────────────────────────────

    #[test]
    fn default_schedule_is_defined_and_empty() {
        let s = Schedule::default();
        assert!(s.defined());
        assert!(s.splits().is_empty());
        assert!(s.compute_level().is_inlined());
        assert!(!s.memoized() && !s.touched() && !s.allow_race_conditions());
        assert!(!s.reduction_domain().defined());
    }

    #[test]
    fn handle_copy_aliases() {
        let s = Schedule::new();
        let alias = s.clone();
        alias.splits_mut().push(split_x());
        alias.set_touched(true);
        assert_eq!(s.splits().len(), 1);
        assert!(s.touched());
        assert!(s.same_as(&alias));
    }

    #[test]
    fn deep_copy_does_not_alias() {
        let s = Schedule::new();
        s.splits_mut().push(split_x());
        let copy = s.deep_copy(&mut DeepCopyMap::new()).unwrap();
        assert!(!copy.same_as(&s));
        copy.splits_mut()[0].factor = Some(Expr::int(2));
        copy.splits_mut().push(Split::rename("y", "y2"));
        assert_eq!(factors(&s), vec![Some(Expr::int(8))]);
        assert_eq!(copy.splits().len(), 2);
    }

    #[test]
    fn deep_copy_of_undefined_is_fatal() {
        let err = Schedule::undefined()
            .deep_copy(&mut DeepCopyMap::new())
            .unwrap_err();
        assert_eq!(err, ScheduleError::UndefinedSchedule);
    }

    #[test]
    #[should_panic(expected = "undefined schedule")]
    fn accessing_undefined_record_panics() {
        let _ = Schedule::undefined().splits().len();
    }

    #[test]
    fn mutate_and_accept_ignore_undefined() {
        let s = Schedule::undefined();
        s.mutate(&mut |_: &Expr| -> Expr { panic!("no fields to visit") });
        s.accept(&mut |_: &Expr| panic!("no fields to visit"));
    }

    #[test]
    fn deep_copy_copies_every_value_field() {
        let s = Schedule::new();
        *s.compute_level_mut() = LoopLevel::at("g", "y");
        *s.store_level_mut() = LoopLevel::Root;
        s.splits_mut().push(split_x());
        s.dims_mut().push(Dim::pure("xi"));
        s.storage_dims_mut().push(StorageDim::new("x"));
        s.bounds_mut().push(bound_x());
        s.set_memoized(true);
        s.set_allow_race_conditions(true);

        let copy = s.deep_copy(&mut DeepCopyMap::new()).unwrap();
        assert_eq!(*copy.compute_level(), LoopLevel::at("g", "y"));
        assert_eq!(*copy.store_level(), LoopLevel::Root);
        assert_eq!(*copy.splits(), *s.splits());
        assert_eq!(*copy.dims(), *s.dims());
        assert_eq!(*copy.storage_dims(), *s.storage_dims());
        assert_eq!(*copy.bounds(), *s.bounds());
        assert!(copy.memoized());
        assert!(!copy.touched());
        assert!(copy.allow_race_conditions());
        assert_eq!(copy.to_string(), s.to_string());
    }

    #[test]
    fn deep_copy_duplicates_reduction_domain_once() {
        let s = Schedule::new();
        s.set_reduction_domain(ReductionDomain::new(vec![ReductionVariable {
            var: "r".into(),
            min: Expr::int(0),
            extent: Expr::int(10),
        }]));
        s.add_specialization(p_is_one());

        let copy = s.deep_copy(&mut DeepCopyMap::new()).unwrap();
        let nested = copy.specializations()[0].schedule.clone();
        assert!(!copy.reduction_domain().same_as(&s.reduction_domain()));
        assert!(copy.reduction_domain().same_as(&nested.reduction_domain()));
    }

    // ── Specializations ─────────────────────────────────────────────────

    #[test]
    fn specialization_snapshots_parent() {
        let s = Schedule::new();
        s.splits_mut().push(split_x());
        s.bounds_mut().push(bound_x());
        *s.compute_level_mut() = LoopLevel::Root;
        s.set_touched(true);
        s.add_specialization(Expr::var("a"));

        let spec = s.add_specialization(p_is_one());
        let nested = &spec.schedule;
        assert_eq!(*nested.splits(), vec![split_x()]);
        assert_eq!(*nested.bounds(), vec![bound_x()]);
        assert!(nested.compute_level().is_root());
        assert!(nested.touched());
        // A nested schedule never inherits specializations.
        assert!(nested.specializations().is_empty());
        assert_eq!(s.specializations().len(), 2);
    }

    #[test]
    fn specialization_is_isolated_from_parent() {
        let s = Schedule::new();
        s.splits_mut().push(split_x());
        let spec = s.add_specialization(p_is_one());

        s.splits_mut().push(Split::rename("y", "y2"));
        assert_eq!(spec.schedule.splits().len(), 1);

        spec.schedule.splits_mut()[0].factor = Some(Expr::int(4));
        assert_eq!(factors(&s)[0], Some(Expr::int(8)));
        assert_eq!(s.splits().len(), 2);
    }

    #[test]
    fn returned_specialization_aliases_stored_entry() {
        let s = Schedule::new();
        let spec = s.add_specialization(p_is_one());
        spec.schedule.set_memoized(true);
        assert!(s.specializations()[0].schedule.memoized());
        assert!(s.specializations()[0].schedule.same_as(&spec.schedule));
    }

    #[test]
    fn specializations_keep_creation_order_without_dedup() {
        let s = Schedule::new();
        s.add_specialization(p_is_one());
        s.add_specialization(Expr::var("q"));
        s.add_specialization(p_is_one());
        let conds: Vec<String> = s
            .specializations()
            .iter()
            .map(|sp| sp.condition.to_string())
            .collect();
        assert_eq!(conds, vec!["p == 1", "q", "p == 1"]);
    }

    #[test]
    fn select_takes_first_true_condition() {
        let s = Schedule::new();
        let a = s.add_specialization(Expr::binary(BinOp::Gt, Expr::var("n"), Expr::int(8)));
        let b = s.add_specialization(Expr::binary(BinOp::Gt, Expr::var("n"), Expr::int(0)));

        let pick = |n: i64| s.select(&Substitute::new().bind("n", Expr::int(n)));
        assert!(pick(100).same_as(&a.schedule));
        assert!(pick(4).same_as(&b.schedule));
        assert!(pick(0).same_as(&s));
        // Unbound variables never match.
        assert!(s.select(&Substitute::new()).same_as(&s));
    }

    // ── Wrappers ────────────────────────────────────────────────────────

    #[test]
    fn default_wrapper_redefinition_warns_once() {
        let s = Schedule::new();
        let mut diags = Vec::new();
        s.add_wrapper("", Stage::new("t1", &["x"]), &mut diags).unwrap();
        assert!(diags.is_empty());
        s.add_wrapper("", Stage::new("t2", &["x"]), &mut diags).unwrap();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, Some(codes::W0500));
        assert!(!diags[0].is_error());
        assert_eq!(s.wrappers()[""].name(), "t2");
    }

    #[test]
    fn named_wrapper_redefinition_is_fatal() {
        let s = Schedule::new();
        let mut diags = Vec::new();
        s.add_wrapper("f", Stage::new("t1", &["x"]), &mut diags).unwrap();
        let err = s
            .add_wrapper("f", Stage::new("t2", &["x"]), &mut diags)
            .unwrap_err();
        assert_eq!(err, ScheduleError::WrapperRedefinition { name: "f".into() });
        assert!(diags.is_empty());
        assert_eq!(s.wrappers().len(), 1);
        assert_eq!(s.wrappers()["f"].name(), "t1");
    }

    #[test]
    fn wrappers_to_same_stage_share_one_clone() {
        let t = Stage::new("t", &["x"]);
        let s = Schedule::new();
        let mut diags = Vec::new();
        s.add_wrapper("a", t.clone(), &mut diags).unwrap();
        s.add_wrapper("b", t.clone(), &mut diags).unwrap();

        let mut memo = DeepCopyMap::new();
        let copy = s.deep_copy(&mut memo).unwrap();
        let wrappers = copy.wrappers();
        assert!(wrappers["a"].same_as(&wrappers["b"]));
        assert!(!wrappers["a"].same_as(&t));
        assert_eq!(memo.len(), 1);
    }

    #[test]
    fn wrapper_in_specialization_reuses_top_level_clone() {
        let t = Stage::new("t", &["x"]);
        let s = Schedule::new();
        let mut diags = Vec::new();
        s.add_wrapper("", t.clone(), &mut diags).unwrap();
        let spec = s.add_specialization(p_is_one());
        spec.schedule.add_wrapper("g", t.clone(), &mut diags).unwrap();

        let copy = s.deep_copy(&mut DeepCopyMap::new()).unwrap();
        let top = copy.wrappers()[""].clone();
        let nested = copy.specializations()[0].schedule.wrappers()["g"].clone();
        assert!(top.same_as(&nested));
    }

    // ── Traversal ───────────────────────────────────────────────────────

    fn populated() -> Schedule {
        let s = Schedule::new();
        s.splits_mut().push(split_x());
        s.splits_mut().push(Split::rename("y", "y2"));
        s.bounds_mut().push(bound_x());
        s.bounds_mut()
            .push(Bound::new("y", None, Some(Expr::var("h"))));
        s.dims_mut().push(Dim::pure("xi"));
        s.storage_dims_mut().push(StorageDim::new("x"));
        s.set_reduction_domain(ReductionDomain::new(vec![ReductionVariable {
            var: "r".into(),
            min: Expr::int(0),
            extent: Expr::var("n"),
        }]));
        let spec = s.add_specialization(p_is_one());
        spec.schedule
            .splits_mut()
            .push(Split::split("y", "yo", "yi", Expr::int(4)));
        let inner = spec.schedule.add_specialization(Expr::var("q"));
        inner.schedule.bounds_mut()[0].min = Some(Expr::var("m"));
        s
    }

    #[test]
    fn identity_mutate_preserves_everything() {
        let s = populated();
        let before = s.to_string();
        s.mutate(&mut |e: &Expr| e.clone());
        assert_eq!(s.to_string(), before);
        assert_eq!(s.splits()[1].factor, None);
        assert_eq!(s.bounds()[1].min, None);
    }

    #[test]
    fn sentinel_mutate_reaches_every_expression() {
        let s = populated();
        let sentinel = Expr::var("SENTINEL");
        s.mutate(&mut |_: &Expr| Expr::var("SENTINEL"));

        assert_eq!(s.splits()[0].factor, Some(sentinel.clone()));
        assert_eq!(s.splits()[1].factor, None);
        assert_eq!(s.bounds()[0].min, Some(sentinel.clone()));
        assert_eq!(s.bounds()[0].extent, Some(sentinel.clone()));
        assert_eq!(s.bounds()[1].min, None);
        assert_eq!(s.bounds()[1].extent, Some(sentinel.clone()));

        let spec = s.specializations()[0].clone();
        assert_eq!(spec.condition, sentinel);
        assert!(spec
            .schedule
            .splits()
            .iter()
            .all(|sp| sp.factor == Some(sentinel.clone())));
        let inner = spec.schedule.specializations()[0].clone();
        assert_eq!(inner.condition, sentinel);
        assert_eq!(inner.schedule.bounds()[0].min, Some(sentinel.clone()));

        let domain = s.reduction_domain().domain();
        assert_eq!(
            (domain[0].min.clone(), domain[0].extent.clone()),
            (sentinel.clone(), sentinel)
        );

        assert_eq!(*s.dims(), vec![Dim::pure("xi")]);
        assert_eq!(*s.storage_dims(), vec![StorageDim::new("x")]);
    }

    #[test]
    fn mutator_may_read_the_schedule_it_rewrites() {
        let s = populated();
        let reader = s.clone();
        let mut reads = 0;
        s.mutate(&mut |e: &Expr| {
            reads += reader.bounds().len() + reader.reduction_domain().domain().len();
            e.clone()
        });
        assert!(reads > 0);
        assert_eq!(s.bounds()[0].min, Some(Expr::int(0)));
    }

    #[test]
    fn mutate_rewrites_shared_domain_once() {
        let s = populated();
        s.mutate(&mut |e: &Expr| Expr::binary(BinOp::Add, e.clone(), Expr::int(1)));
        let domain = s.reduction_domain().domain();
        assert_eq!(domain[0].extent.to_string(), "n + 1");
    }

    #[test]
    fn accept_visits_in_fixed_order() {
        let s = populated();
        let mut seen = Vec::new();
        s.accept(&mut |e: &Expr| seen.push(e.to_string()));
        assert_eq!(
            seen,
            vec![
                // splits
                "8",
                // bounds
                "0",
                "16",
                "h",
                // specialization p == 1
                "p == 1",
                "8",
                "4",
                "0",
                "16",
                "h",
                // nested specialization q
                "q",
                "8",
                "4",
                "m",
                "16",
                "h",
                // reduction domain
                "0",
                "n",
            ]
        );
    }

    #[test]
    fn mutate_and_accept_agree_on_order() {
        let s = populated();
        let mut visited = Vec::new();
        s.accept(&mut |e: &Expr| visited.push(e.clone()));
        let mut mutated = Vec::new();
        s.mutate(&mut |e: &Expr| {
            mutated.push(e.clone());
            e.clone()
        });
        assert_eq!(visited, mutated);
    }

    // ── Scenario ────────────────────────────────────────────────────────

    #[test]
    fn end_to_end_deep_copy_scenario() {
        let s = Schedule::new();
        s.splits_mut().push(split_x());
        s.bounds_mut().push(bound_x());
        let spec = s.add_specialization(p_is_one());
        spec.schedule
            .splits_mut()
            .push(Split::split("y", "yo", "yi", Expr::int(4)));

        let clone = s.deep_copy(&mut DeepCopyMap::new()).unwrap();
        assert_eq!(*clone.splits(), *s.splits());
        assert_eq!(*clone.bounds(), *s.bounds());
        assert_eq!(clone.specializations().len(), 1);
        let nested = clone.specializations()[0].schedule.clone();
        assert_eq!(nested.splits().len(), 2);

        nested.splits_mut()[1].factor = Some(Expr::int(2));
        let source_nested = s.specializations()[0].schedule.clone();
        assert_eq!(source_nested.splits()[1].factor, Some(Expr::int(4)));
    }

    #[test]
    fn display_renders_nested_specializations() {
        let s = Schedule::new();
        s.splits_mut().push(split_x());
        s.bounds_mut().push(bound_x());
        s.set_touched(true);
        let spec = s.add_specialization(p_is_one());
        spec.schedule
            .splits_mut()
            .push(Split::split("y", "yo", "yi", Expr::int(4)));
        assert_eq!(
            s.to_string(),
            "compute_at inlined\n\
             store_at inlined\n\
             split x -> xo, xi by 8\n\
             bound x min=0 extent=16\n\
             flags touched\n\
             specialize p == 1 {\n\
             \x20   compute_at inlined\n\
             \x20   store_at inlined\n\
             \x20   split x -> xo, xi by 8\n\
             \x20   split y -> yo, yi by 4\n\
             \x20   bound x min=0 extent=16\n\
             \x20   flags touched\n\
             }\n"
        );
    }
}
