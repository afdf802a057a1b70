// pipeline.rs — Compilation state and pass orchestration
//
// Runs a directive script through parse → apply → (clone → verify) →
// rewrite → emit, accumulating diagnostics and stopping at the first pass
// that reports an error.
//
// Preconditions: none; `source` may be any text.
// Postconditions: on success the emitted text is returned and
//   `state.diagnostics` holds only warnings; otherwise `state.has_error` is set.
// Failure modes: any pass emitting error-level diagnostics; a clone that
//   fails its certificate (E0600).
// Side effects: calls `on_pass_complete` after each pass; prints pass timing
//   to stderr in verbose mode.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::time::Instant;

use crate::ast::Script;
use crate::diag::{codes, DiagLevel, Diagnostic};
use crate::expr::{simplify, Expr, Substitute};
use crate::graph::StageGraph;
use crate::schedule::Schedule;

// ── Options ────────────────────────────────────────────────────────────────

/// What the driver prints on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmitTarget {
    /// Canonical rendering of every scheduled stage.
    #[default]
    Schedule,
    /// Rendering of a deep copy of the whole stage graph.
    Clone,
    /// SHA-256 of the canonical rendering.
    Fingerprint,
    /// Free variables referenced by each stage's schedules.
    Deps,
}

#[derive(Debug, Clone, Default)]
pub struct DriverOptions {
    pub emit: EmitTarget,
    /// Fold constants in every schedule expression after binding.
    pub simplify: bool,
    /// `name = value` substitutions applied to every schedule expression.
    pub bindings: Vec<(String, i64)>,
    pub verbose: bool,
}

// ── Passes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassId {
    Parse,
    Apply,
    Clone,
    Verify,
    Rewrite,
    Emit,
}

impl PassId {
    pub fn name(self) -> &'static str {
        match self {
            PassId::Parse => "parse",
            PassId::Apply => "apply",
            PassId::Clone => "clone",
            PassId::Verify => "verify",
            PassId::Rewrite => "rewrite",
            PassId::Emit => "emit",
        }
    }
}

/// Passes needed to produce `options`' output, in execution order.
pub fn required_passes(options: &DriverOptions) -> Vec<PassId> {
    let mut passes = vec![PassId::Parse, PassId::Apply];
    if options.emit == EmitTarget::Clone {
        passes.extend([PassId::Clone, PassId::Verify]);
    }
    if options.simplify || !options.bindings.is_empty() {
        passes.push(PassId::Rewrite);
    }
    passes.push(PassId::Emit);
    passes
}

// ── Clone certificate ──────────────────────────────────────────────────────

/// Obligations a whole-graph clone must meet before it is emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneCert {
    /// C1: Same stages, same order.
    pub c1_same_roots: bool,
    /// C2: Canonical renderings hash identically.
    pub c2_same_fingerprint: bool,
    /// C3: No schedule record is shared between source and clone.
    pub c3_storage_disjoint: bool,
}

impl CloneCert {
    pub fn check(source: &StageGraph, clone: &StageGraph) -> Self {
        let source_names: Vec<String> = source.stages().iter().map(|s| s.name()).collect();
        let clone_names: Vec<String> = clone.stages().iter().map(|s| s.name()).collect();
        let roots_disjoint = source
            .stages()
            .iter()
            .zip(clone.stages())
            .all(|(a, b)| !a.same_as(b));

        let source_records: HashSet<usize> = all_schedules(source).iter().map(record_id).collect();
        let records_disjoint = all_schedules(clone)
            .iter()
            .all(|s| !source_records.contains(&record_id(s)));

        CloneCert {
            c1_same_roots: source_names == clone_names,
            c2_same_fingerprint: source.fingerprint() == clone.fingerprint(),
            c3_storage_disjoint: roots_disjoint && records_disjoint,
        }
    }

    /// True if all obligations pass.
    pub fn all_pass(&self) -> bool {
        self.c1_same_roots && self.c2_same_fingerprint && self.c3_storage_disjoint
    }

    fn failures(&self) -> Vec<&'static str> {
        [
            (self.c1_same_roots, "C1 stage list differs"),
            (self.c2_same_fingerprint, "C2 fingerprint differs"),
            (self.c3_storage_disjoint, "C3 clone shares storage with source"),
        ]
        .iter()
        .filter(|(ok, _)| !ok)
        .map(|(_, what)| *what)
        .collect()
    }
}

/// Every schedule record reachable from the roots, including nested
/// specializations.
fn all_schedules(graph: &StageGraph) -> Vec<Schedule> {
    let mut out = Vec::new();
    let mut stack: Vec<Schedule> = graph
        .stages()
        .iter()
        .flat_map(|s| std::iter::once(s.schedule()).chain(s.updates()))
        .collect();
    while let Some(s) = stack.pop() {
        if !s.defined() {
            continue;
        }
        stack.extend(s.specializations().iter().map(|sp| sp.schedule.clone()));
        out.push(s);
    }
    out
}

fn record_id(schedule: &Schedule) -> usize {
    schedule.record_id().unwrap_or(0)
}

// ── Compilation state ──────────────────────────────────────────────────────

/// Holds all pass artifacts and accumulated diagnostics.
#[derive(Default)]
pub struct CompilationState {
    pub script: Option<Script>,
    /// The graph built by applying the script.
    pub graph: Option<StageGraph>,
    /// The graph that is rewritten and emitted: `graph` or its clone.
    pub output: Option<StageGraph>,
    pub cert: Option<CloneCert>,
    pub emitted: Option<String>,
    pub diagnostics: Vec<Diagnostic>,
    pub has_error: bool,
}

impl CompilationState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Pipeline execution failed due to error-level diagnostics in a pass.
/// The specific diagnostics are available in `CompilationState.diagnostics`.
#[derive(Debug)]
pub struct PipelineError {
    pub failing_pass: PassId,
}

fn has_error_diags(diags: &[Diagnostic]) -> bool {
    diags.iter().any(|d| d.level == DiagLevel::Error)
}

/// Per-pass post-processing: callback, accumulate, verbose, error check.
fn finish_pass(
    state: &mut CompilationState,
    pass_id: PassId,
    diags: Vec<Diagnostic>,
    elapsed: std::time::Duration,
    verbose: bool,
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    on_pass_complete(pass_id, &diags);
    let is_err = has_error_diags(&diags);
    state.diagnostics.extend(diags);
    if verbose {
        eprintln!(
            "schedc: {} complete, {:.1}ms",
            pass_id.name(),
            elapsed.as_secs_f64() * 1000.0
        );
    }
    if is_err {
        state.has_error = true;
        return Err(PipelineError {
            failing_pass: pass_id,
        });
    }
    Ok(())
}

/// Fetch an artifact an earlier pass must have produced.
fn artifact<T>(slot: Option<T>, pass_id: PassId) -> Result<T, PipelineError> {
    slot.ok_or(PipelineError {
        failing_pass: pass_id,
    })
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run every pass `options` requires over `source`.
///
/// Per-pass sequence: execute → on_pass_complete(callback) → verbose → error check.
pub fn run_pipeline(
    state: &mut CompilationState,
    source: &str,
    options: &DriverOptions,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    for pass_id in required_passes(options) {
        let t = Instant::now();
        let diags = match pass_id {
            PassId::Parse => {
                let result = crate::parser::parse(source);
                let mut diags: Vec<Diagnostic> = result
                    .errors
                    .iter()
                    .map(|e| Diagnostic::error(codes::E0100, e.to_string()).at(*e.span()))
                    .collect();
                if result.script.is_none() && diags.is_empty() {
                    diags.push(Diagnostic::error(codes::E0100, "script could not be parsed"));
                }
                state.script = result.script;
                diags
            }
            PassId::Apply => {
                let script = artifact(state.script.as_ref(), PassId::Parse)?;
                let result = crate::apply::apply_script(script);
                state.output = Some(result.graph.clone());
                state.graph = Some(result.graph);
                result.diagnostics
            }
            PassId::Clone => {
                let graph = artifact(state.graph.as_ref(), PassId::Apply)?;
                match graph.deep_copy() {
                    Ok(copy) => {
                        state.output = Some(copy);
                        Vec::new()
                    }
                    Err(e) => vec![e.to_diagnostic()],
                }
            }
            PassId::Verify => {
                let graph = artifact(state.graph.as_ref(), PassId::Apply)?;
                let output = artifact(state.output.as_ref(), PassId::Clone)?;
                let cert = CloneCert::check(graph, output);
                let diags = if cert.all_pass() {
                    Vec::new()
                } else {
                    vec![Diagnostic::error(
                        codes::E0600,
                        format!("clone verification failed: {}", cert.failures().join("; ")),
                    )]
                };
                state.cert = Some(cert);
                diags
            }
            PassId::Rewrite => {
                let output = artifact(state.output.as_ref(), PassId::Apply)?;
                if !options.bindings.is_empty() {
                    let mut bindings = Substitute::new();
                    for (name, value) in &options.bindings {
                        bindings = bindings.bind(name.as_str(), Expr::int(*value));
                    }
                    output.mutate(&mut bindings);
                }
                if options.simplify {
                    output.mutate(&mut |e: &Expr| simplify(e));
                }
                Vec::new()
            }
            PassId::Emit => {
                let output = artifact(state.output.as_ref(), PassId::Apply)?;
                state.emitted = Some(emit(output, options.emit));
                Vec::new()
            }
        };
        finish_pass(
            state,
            pass_id,
            diags,
            t.elapsed(),
            options.verbose,
            &mut on_pass_complete,
        )?;
    }
    Ok(())
}

fn emit(graph: &StageGraph, target: EmitTarget) -> String {
    match target {
        EmitTarget::Schedule | EmitTarget::Clone => graph.to_string(),
        EmitTarget::Fingerprint => format!("{}\n", graph.fingerprint_hex()),
        EmitTarget::Deps => {
            let mut out = String::new();
            for (stage, vars) in graph.dependencies() {
                let vars: Vec<String> = vars.into_iter().collect();
                let _ = writeln!(out, "{stage}: {}", vars.join(", "));
            }
            out
        }
    }
}

/// 1-based line and column of byte `offset` in `source`.
pub fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let col = before.rfind('\n').map_or(offset, |nl| offset - nl - 1) + 1;
    (line, col)
}

// ── Tests ──────────────────────────────────────────────────────────────────
