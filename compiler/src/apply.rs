// apply.rs — Directive interpretation: script AST → scheduled stage graph
//
// Walks a parsed script in order, declaring stages and applying each
// directive chain to the named stage's schedule. A chain keeps a cursor on
// the schedule it is editing: `specialize` moves the cursor into the new
// nested schedule, `rdom` and `update` move it onto an update definition.
//
// Preconditions: `script` is the output of a successful parse.
// Postconditions: every schedule a directive was applied to has `touched`
//   set; directive errors skip the rest of their chain; a fatal scheduling
//   error stops application of the whole script.
// Failure modes: E0200 unknown stage, E0201 malformed directive, E0202
//   duplicate stage, E0500 wrapper redefinition (fatal).
// Side effects: none.

use crate::ast::{Arg, Call, DirectiveChain, Script, Span, StageDecl, StatementKind};
use crate::diag::{codes, Diagnostic};
use crate::expr::{simplify, Expr};
use crate::graph::StageGraph;
use crate::reduction::{ReductionDomain, ReductionVariable};
use crate::schedule::{Bound, Dim, ForType, LoopLevel, Schedule, Split, StorageDim};
use crate::stage::Stage;

const DIRECTIVES: &[&str] = &[
    "split",
    "rename",
    "fuse",
    "reorder",
    "parallel",
    "vectorize",
    "unroll",
    "bound",
    "compute_at",
    "store_at",
    "compute_root",
    "store_root",
    "compute_inline",
    "memoize",
    "allow_race_conditions",
    "fold_storage",
    "align_storage",
    "rdom",
    "where",
    "update",
    "wrap",
    "specialize",
];

// ── Public types ────────────────────────────────────────────────────────────

pub struct ApplyResult {
    pub graph: StageGraph,
    pub diagnostics: Vec<Diagnostic>,
}

enum ApplyError {
    /// Skip the rest of the chain, keep going with the next statement.
    Directive(Diagnostic),
    /// Stop applying the script.
    Fatal(Diagnostic),
}

type ApplyOutcome<T> = Result<T, ApplyError>;

fn directive_error(span: Span, message: impl Into<String>) -> ApplyError {
    ApplyError::Directive(Diagnostic::error(codes::E0201, message).at(span))
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Apply `script` to a fresh stage graph.
pub fn apply_script(script: &Script) -> ApplyResult {
    let mut ctx = ApplyCtx {
        graph: StageGraph::new(),
        diagnostics: Vec::new(),
    };

    for stmt in &script.statements {
        let outcome = match &stmt.kind {
            StatementKind::Stage(decl) => ctx.declare(decl),
            StatementKind::Directives(chain) => ctx.apply_chain(chain),
        };
        match outcome {
            Ok(()) => {}
            Err(ApplyError::Directive(diag)) => ctx.diagnostics.push(diag),
            Err(ApplyError::Fatal(diag)) => {
                ctx.diagnostics.push(diag);
                break;
            }
        }
    }

    ApplyResult {
        graph: ctx.graph,
        diagnostics: ctx.diagnostics,
    }
}

// ── Internal context ────────────────────────────────────────────────────────

struct ApplyCtx {
    graph: StageGraph,
    diagnostics: Vec<Diagnostic>,
}

/// The schedule a chain is currently editing, and the stage that owns it.
struct Cursor {
    stage: Stage,
    schedule: Schedule,
}

impl ApplyCtx {
    fn declare(&mut self, decl: &StageDecl) -> ApplyOutcome<()> {
        let args: Vec<&str> = decl.args.iter().map(|a| a.name.as_str()).collect();
        for (i, arg) in decl.args.iter().enumerate() {
            if decl.args[..i].iter().any(|prev| prev.name == arg.name) {
                return Err(directive_error(
                    arg.span,
                    format!("stage '{}' repeats argument '{}'", decl.name.name, arg.name),
                ));
            }
        }
        if !self.graph.add(Stage::new(decl.name.name.as_str(), &args)) {
            return Err(ApplyError::Directive(
                Diagnostic::error(
                    codes::E0202,
                    format!("stage '{}' is already declared", decl.name.name),
                )
                .at(decl.name.span),
            ));
        }
        Ok(())
    }

    fn lookup(&self, name: &str, span: Span) -> ApplyOutcome<Stage> {
        self.graph.get(name).cloned().ok_or_else(|| {
            ApplyError::Directive(
                Diagnostic::error(codes::E0200, format!("unknown stage '{name}'"))
                    .at(span)
                    .with_hint(format!("declare it first with `stage {name}(...)`")),
            )
        })
    }

    fn apply_chain(&mut self, chain: &DirectiveChain) -> ApplyOutcome<()> {
        let stage = self.lookup(&chain.target.name, chain.target.span)?;
        let mut cursor = Cursor {
            schedule: stage.schedule(),
            stage,
        };
        for call in &chain.calls {
            tracing::debug!(
                stage = %cursor.stage.name(),
                directive = %call.name.name,
                "applying directive"
            );
            self.apply_call(&mut cursor, call)?;
        }
        Ok(())
    }

    fn apply_call(&mut self, cursor: &mut Cursor, call: &Call) -> ApplyOutcome<()> {
        let name = call.name.name.as_str();
        if !DIRECTIVES.contains(&name) {
            return Err(ApplyError::Directive(
                Diagnostic::error(codes::E0201, format!("unknown directive '{name}'"))
                    .at(call.name.span)
                    .with_hint(format!("expected one of: {}", DIRECTIVES.join(", "))),
            ));
        }
        let schedule = cursor.schedule.clone();

        match name {
            "split" => {
                arity(call, 4, 4)?;
                let old = var_arg(call, 0)?;
                let outer = var_arg(call, 1)?;
                let inner = var_arg(call, 2)?;
                let factor = expr_arg(call, 3)?;
                if outer == inner {
                    return Err(directive_error(
                        call.span,
                        format!("split of '{old}' needs distinct outer and inner names"),
                    ));
                }
                let idx = dim_index(cursor, &old, arg_span(call, 0))?;
                fresh_loop_name(cursor, &outer, Some(&old), arg_span(call, 1))?;
                fresh_loop_name(cursor, &inner, Some(&old), arg_span(call, 2))?;
                {
                    let mut dims = schedule.dims_mut();
                    let pure = dims[idx].pure;
                    dims[idx].var = inner.clone();
                    dims.insert(
                        idx + 1,
                        Dim {
                            var: outer.clone(),
                            for_type: ForType::Serial,
                            pure,
                        },
                    );
                }
                schedule
                    .splits_mut()
                    .push(Split::split(old, outer, inner, factor));
            }
            "rename" => {
                arity(call, 2, 2)?;
                let old = var_arg(call, 0)?;
                let new = var_arg(call, 1)?;
                let idx = dim_index(cursor, &old, arg_span(call, 0))?;
                fresh_loop_name(cursor, &new, Some(&old), arg_span(call, 1))?;
                schedule.dims_mut()[idx].var = new.clone();
                schedule.splits_mut().push(Split::rename(old, new));
            }
            "fuse" => {
                arity(call, 3, 3)?;
                let inner = var_arg(call, 0)?;
                let outer = var_arg(call, 1)?;
                let fused = var_arg(call, 2)?;
                let i = dim_index(cursor, &inner, arg_span(call, 0))?;
                let o = dim_index(cursor, &outer, arg_span(call, 1))?;
                if i == o {
                    return Err(directive_error(call.span, "cannot fuse a loop with itself"));
                }
                if fused != inner && fused != outer {
                    fresh_loop_name(cursor, &fused, None, arg_span(call, 2))?;
                }
                {
                    let mut dims = schedule.dims_mut();
                    let pure = dims[i].pure && dims[o].pure;
                    dims[i].var = fused.clone();
                    dims[i].pure = pure;
                    dims.remove(o);
                }
                schedule.splits_mut().push(Split::fuse(inner, outer, fused));
            }
            "reorder" => {
                arity(call, 2, usize::MAX)?;
                let mut positions = Vec::with_capacity(call.args.len());
                for i in 0..call.args.len() {
                    let var = var_arg(call, i)?;
                    let idx = dim_index(cursor, &var, arg_span(call, i))?;
                    if positions.contains(&idx) {
                        return Err(directive_error(
                            arg_span(call, i),
                            format!("loop '{var}' appears twice in reorder"),
                        ));
                    }
                    positions.push(idx);
                }
                let mut dims = schedule.dims_mut();
                let moved: Vec<Dim> = positions.iter().map(|&i| dims[i].clone()).collect();
                let mut slots = positions;
                slots.sort_unstable();
                for (slot, dim) in slots.into_iter().zip(moved) {
                    dims[slot] = dim;
                }
            }
            "parallel" | "vectorize" | "unroll" => {
                arity(call, 1, 1)?;
                let var = var_arg(call, 0)?;
                let idx = dim_index(cursor, &var, arg_span(call, 0))?;
                schedule.dims_mut()[idx].for_type = match name {
                    "parallel" => ForType::Parallel,
                    "vectorize" => ForType::Vectorized,
                    _ => ForType::Unrolled,
                };
            }
            "bound" => {
                arity(call, 3, 3)?;
                let var = pure_arg(cursor, call, 0)?;
                let min = expr_arg(call, 1)?;
                let extent = expr_arg(call, 2)?;
                schedule
                    .bounds_mut()
                    .push(Bound::new(var, Some(min), Some(extent)));
            }
            "compute_at" | "store_at" => {
                arity(call, 2, 2)?;
                let level = self.loop_level(call)?;
                if name == "compute_at" {
                    *schedule.compute_level_mut() = level.clone();
                }
                *schedule.store_level_mut() = level;
            }
            "compute_root" => {
                arity(call, 0, 0)?;
                *schedule.compute_level_mut() = LoopLevel::Root;
                *schedule.store_level_mut() = LoopLevel::Root;
            }
            "store_root" => {
                arity(call, 0, 0)?;
                *schedule.store_level_mut() = LoopLevel::Root;
            }
            "compute_inline" => {
                arity(call, 0, 0)?;
                *schedule.compute_level_mut() = LoopLevel::Inlined;
                *schedule.store_level_mut() = LoopLevel::Inlined;
            }
            "memoize" => {
                arity(call, 0, 0)?;
                schedule.set_memoized(true);
            }
            "allow_race_conditions" => {
                arity(call, 0, 0)?;
                schedule.set_allow_race_conditions(true);
            }
            "fold_storage" => {
                arity(call, 2, 3)?;
                let var = pure_arg(cursor, call, 0)?;
                let factor = positive_int_arg(call, 1)?;
                let forward = if call.args.len() == 3 {
                    bool_arg(call, 2)?
                } else {
                    true
                };
                let mut storage = schedule.storage_dims_mut();
                let sd = storage_dim(&mut storage, &var);
                sd.fold_factor = Some(factor);
                sd.fold_forward = forward;
            }
            "align_storage" => {
                arity(call, 2, 2)?;
                let var = pure_arg(cursor, call, 0)?;
                let alignment = positive_int_arg(call, 1)?;
                let mut storage = schedule.storage_dims_mut();
                storage_dim(&mut storage, &var).alignment = Some(alignment);
            }
            "rdom" => {
                arity(call, 3, usize::MAX)?;
                if call.args.len() % 3 != 0 {
                    return Err(directive_error(
                        call.span,
                        "rdom takes (variable, min, extent) triples",
                    ));
                }
                let mut domain = Vec::with_capacity(call.args.len() / 3);
                for i in (0..call.args.len()).step_by(3) {
                    let var = var_arg(call, i)?;
                    if cursor.stage.args().contains(&var)
                        || domain.iter().any(|rv: &ReductionVariable| rv.var == var)
                    {
                        return Err(directive_error(
                            arg_span(call, i),
                            format!("reduction variable '{var}' shadows another variable"),
                        ));
                    }
                    domain.push(ReductionVariable {
                        var,
                        min: expr_arg(call, i + 1)?,
                        extent: expr_arg(call, i + 2)?,
                    });
                }
                let update = cursor.stage.add_update(ReductionDomain::new(domain));
                update.set_touched(true);
                cursor.schedule = update;
            }
            "where" => {
                arity(call, 1, 1)?;
                let predicate = expr_arg(call, 0)?;
                let domain = schedule.reduction_domain();
                if !domain.defined() {
                    return Err(directive_error(
                        call.span,
                        "'where' needs a reduction domain; start the chain with rdom or update",
                    ));
                }
                domain.where_(predicate);
            }
            "update" => {
                arity(call, 1, 1)?;
                let index = expr_arg(call, 0)?;
                let updates = cursor.stage.updates();
                let picked = simplify(&index)
                    .as_int()
                    .and_then(|i| usize::try_from(i).ok())
                    .and_then(|i| updates.get(i).cloned());
                match picked {
                    Some(update) => cursor.schedule = update,
                    None => {
                        return Err(directive_error(
                            arg_span(call, 0),
                            format!(
                                "stage '{}' has {} update definition(s); '{}' is not one of them",
                                cursor.stage.name(),
                                updates.len(),
                                index
                            ),
                        ))
                    }
                }
            }
            "wrap" => {
                arity(call, 2, 2)?;
                let callsite = str_arg(call, 0)?;
                let target = var_arg(call, 1)?;
                let wrapper = self.lookup(&target, arg_span(call, 1))?;
                let mut warnings = Vec::new();
                schedule
                    .add_wrapper(&callsite, wrapper, &mut warnings)
                    .map_err(|e| ApplyError::Fatal(e.to_diagnostic().at(call.span)))?;
                self.diagnostics
                    .extend(warnings.into_iter().map(|w| w.at(call.span)));
            }
            "specialize" => {
                arity(call, 1, 1)?;
                let condition = expr_arg(call, 0)?;
                // The nested snapshot inherits the flag.
                schedule.set_touched(true);
                cursor.schedule = schedule.add_specialization(condition).schedule;
            }
            _ => unreachable!("directive table and dispatch disagree on '{name}'"),
        }
        // Navigation directives pick a schedule; everything else edits one.
        if name != "update" && name != "rdom" {
            schedule.set_touched(true);
        }
        Ok(())
    }

    /// `(stage, var)` arguments of compute_at/store_at.
    fn loop_level(&self, call: &Call) -> ApplyOutcome<LoopLevel> {
        let stage_name = var_arg(call, 0)?;
        let var = var_arg(call, 1)?;
        let stage = self.lookup(&stage_name, arg_span(call, 0))?;
        let known = stage.schedule().dims().iter().any(|d| d.var == var);
        if !known {
            return Err(directive_error(
                arg_span(call, 1),
                format!("stage '{stage_name}' has no loop named '{var}'"),
            ));
        }
        Ok(LoopLevel::at(stage_name, var))
    }
}

// ── Argument helpers ────────────────────────────────────────────────────────

fn arity(call: &Call, min: usize, max: usize) -> ApplyOutcome<()> {
    let n = call.args.len();
    if n >= min && n <= max {
        return Ok(());
    }
    let expected = if min == max {
        format!("{min}")
    } else if max == usize::MAX {
        format!("at least {min}")
    } else {
        format!("{min} to {max}")
    };
    Err(directive_error(
        call.span,
        format!(
            "'{}' expects {expected} argument(s), found {n}",
            call.name.name
        ),
    ))
}

fn arg_span(call: &Call, i: usize) -> Span {
    call.args.get(i).map(Arg::span).unwrap_or(call.span)
}

fn expr_arg(call: &Call, i: usize) -> ApplyOutcome<Expr> {
    match &call.args[i] {
        Arg::Expr(e, _) => Ok(e.clone()),
        Arg::Str(_, span) => Err(directive_error(
            *span,
            format!(
                "argument {} of '{}' must be an expression",
                i + 1,
                call.name.name
            ),
        )),
    }
}

fn var_arg(call: &Call, i: usize) -> ApplyOutcome<String> {
    match &call.args[i] {
        Arg::Expr(Expr::Var(name), _) => Ok(name.clone()),
        other => Err(directive_error(
            other.span(),
            format!("argument {} of '{}' must be a name", i + 1, call.name.name),
        )),
    }
}

fn str_arg(call: &Call, i: usize) -> ApplyOutcome<String> {
    match &call.args[i] {
        Arg::Str(s, _) => Ok(s.clone()),
        Arg::Expr(_, span) => Err(directive_error(
            *span,
            format!(
                "argument {} of '{}' must be a string literal",
                i + 1,
                call.name.name
            ),
        )),
    }
}

fn positive_int_arg(call: &Call, i: usize) -> ApplyOutcome<u32> {
    let value = simplify(&expr_arg(call, i)?).as_int();
    value
        .and_then(|v| u32::try_from(v).ok())
        .filter(|&v| v > 0)
        .ok_or_else(|| {
            directive_error(
                arg_span(call, i),
                format!(
                    "argument {} of '{}' must be a positive integer constant",
                    i + 1,
                    call.name.name
                ),
            )
        })
}

fn bool_arg(call: &Call, i: usize) -> ApplyOutcome<bool> {
    simplify(&expr_arg(call, i)?).as_bool().ok_or_else(|| {
        directive_error(
            arg_span(call, i),
            format!(
                "argument {} of '{}' must be a boolean constant",
                i + 1,
                call.name.name
            ),
        )
    })
}

/// A name that must be one of the stage's pure arguments.
fn pure_arg(cursor: &Cursor, call: &Call, i: usize) -> ApplyOutcome<String> {
    let var = var_arg(call, i)?;
    if !cursor.stage.args().contains(&var) {
        return Err(directive_error(
            arg_span(call, i),
            format!(
                "'{}' is not a pure argument of stage '{}'",
                var,
                cursor.stage.name()
            ),
        ));
    }
    Ok(var)
}

// ── Loop-nest helpers ───────────────────────────────────────────────────────

fn dim_index(cursor: &Cursor, var: &str, span: Span) -> ApplyOutcome<usize> {
    cursor
        .schedule
        .dims()
        .iter()
        .position(|d| d.var == var)
        .ok_or_else(|| {
            directive_error(
                span,
                format!("stage '{}' has no loop named '{var}'", cursor.stage.name()),
            )
        })
}

/// `name` must not collide with an existing loop, other than `replacing`.
fn fresh_loop_name(
    cursor: &Cursor,
    name: &str,
    replacing: Option<&str>,
    span: Span,
) -> ApplyOutcome<()> {
    let taken = cursor
        .schedule
        .dims()
        .iter()
        .any(|d| d.var == name && Some(d.var.as_str()) != replacing);
    if taken {
        return Err(directive_error(
            span,
            format!(
                "stage '{}' already has a loop named '{name}'",
                cursor.stage.name()
            ),
        ));
    }
    Ok(())
}

fn storage_dim<'a>(storage: &'a mut Vec<StorageDim>, var: &str) -> &'a mut StorageDim {
    let idx = match storage.iter().position(|sd| sd.var == var) {
        Some(idx) => idx,
        None => {
            storage.push(StorageDim::new(var));
            storage.len() - 1
        }
    };
    &mut storage[idx]
}

// ── Tests ───────────────────────────────────────────────────────────────────
