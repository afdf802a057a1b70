// graph.rs — The set of declared stages, cloned and rewritten as a unit
//
// A `StageGraph` owns the stages declared by a script, in declaration order.
// Edges between stages live inside schedules (wrapper maps), so the graph
// itself is just the ordered root set. Whole-graph operations thread one
// `DeepCopyMap` (clone) or one shared-domain set (mutate/accept) through
// every root.
//
// Preconditions: stage names are unique (enforced by `add`).
// Postconditions: `deep_copy` returns a graph whose roots are the memoized
//   clones of this graph's roots, in the same order.
// Failure modes: `deep_copy` propagates `ScheduleError`.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::{self, Write as _};

use sha2::{Digest, Sha256};

use crate::diag::ScheduleError;
use crate::expr::{FreeVars, IrMutator, IrVisitor};
use crate::schedule::Schedule;
use crate::stage::{DeepCopyMap, Stage};

#[derive(Debug, Clone, Default)]
pub struct StageGraph {
    stages: Vec<Stage>,
}

impl StageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `stage`. Returns false (and leaves the graph unchanged) if a
    /// stage with the same name is already present.
    pub fn add(&mut self, stage: Stage) -> bool {
        if self.get(&stage.name()).is_some() {
            return false;
        }
        self.stages.push(stage);
        true
    }

    pub fn get(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name() == name)
    }

    /// Stages in declaration order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Every schedule owned by a root stage: pure definition, then updates.
    fn schedules(&self) -> Vec<Schedule> {
        self.stages
            .iter()
            .flat_map(|s| std::iter::once(s.schedule()).chain(s.updates()))
            .collect()
    }

    /// Clone every stage with one shared memo map, so stages reached through
    /// several wrappers (or through a cycle) are cloned once.
    pub fn deep_copy(&self) -> Result<StageGraph, ScheduleError> {
        let mut memo = DeepCopyMap::new();
        let stages = self
            .stages
            .iter()
            .map(|s| s.deep_copy(&mut memo))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(roots = stages.len(), cloned = memo.len(), "graph deep copy");
        Ok(StageGraph { stages })
    }

    /// Rewrite every expression reachable from the roots' schedules. A
    /// reduction domain shared between update schedules is rewritten once.
    pub fn mutate(&self, mutator: &mut dyn IrMutator) {
        let mut seen_domains = HashSet::new();
        for schedule in self.schedules() {
            schedule.mutate_record(mutator, &mut seen_domains);
        }
    }

    pub fn accept(&self, visitor: &mut dyn IrVisitor) {
        let mut seen_domains = HashSet::new();
        for schedule in self.schedules() {
            schedule.accept_record(visitor, &mut seen_domains);
        }
    }

    /// Free variables referenced by each stage's schedules, keyed by stage.
    pub fn dependencies(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.stages
            .iter()
            .map(|stage| {
                let mut fv = FreeVars::default();
                let mut seen_domains = HashSet::new();
                for schedule in std::iter::once(stage.schedule()).chain(stage.updates()) {
                    schedule.accept_record(&mut fv, &mut seen_domains);
                }
                (stage.name(), fv.names)
            })
            .collect()
    }

    /// SHA-256 of the canonical rendering. Two graphs with the same
    /// fingerprint are structurally identical.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        hash
    }

    /// Hex string of the fingerprint (64 characters).
    pub fn fingerprint_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in self.fingerprint() {
            let _ = write!(s, "{:02x}", b);
        }
        s
    }
}

impl fmt::Display for StageGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{stage}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use crate::reduction::{ReductionDomain, ReductionVariable};
    use crate::schedule::{Bound, Split};

    fn graph_with_cycle() -> StageGraph {
        let f = Stage::new("f", &["x"]);
        let g = Stage::new("g", &["x"]);
        let mut diags = Vec::new();
        f.schedule().add_wrapper("", g.clone(), &mut diags).unwrap();
        g.schedule().add_wrapper("f", f.clone(), &mut diags).unwrap();
        f.schedule()
            .splits_mut()
            .push(Split::split("x", "xo", "xi", Expr::var("n")));
        let mut graph = StageGraph::new();
        assert!(graph.add(f));
        assert!(graph.add(g));
        graph
    }

    #[test]
    fn add_rejects_duplicate_names() {
        let mut graph = StageGraph::new();
        assert!(graph.add(Stage::new("f", &["x"])));
        assert!(!graph.add(Stage::new("f", &["y"])));
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.get("f").unwrap().args(), vec!["x"]);
    }

    #[test]
    fn deep_copy_roots_are_the_wrapper_clones() {
        let graph = graph_with_cycle();
        let copy = graph.deep_copy().unwrap();
        let f2 = copy.get("f").unwrap();
        let g2 = copy.get("g").unwrap();
        assert!(f2.schedule().wrappers()[""].same_as(g2));
        assert!(g2.schedule().wrappers()["f"].same_as(f2));
        assert!(!f2.same_as(graph.get("f").unwrap()));
    }

    #[test]
    fn deep_copy_preserves_fingerprint() {
        let graph = graph_with_cycle();
        let copy = graph.deep_copy().unwrap();
        assert_eq!(copy.fingerprint(), graph.fingerprint());
        copy.get("f").unwrap().schedule().set_memoized(true);
        assert_ne!(copy.fingerprint(), graph.fingerprint());
    }

    #[test]
    fn mutate_rewrites_clone_only() {
        let graph = graph_with_cycle();
        let copy = graph.deep_copy().unwrap();
        copy.mutate(&mut |_: &Expr| Expr::int(8));
        let factor = |g: &StageGraph| g.get("f").unwrap().schedule().splits()[0].factor.clone();
        assert_eq!(factor(&copy), Some(Expr::int(8)));
        assert_eq!(factor(&graph), Some(Expr::var("n")));
    }

    #[test]
    fn mutate_visits_shared_domain_once_across_updates() {
        let f = Stage::new("f", &["x"]);
        let r = ReductionDomain::new(vec![ReductionVariable {
            var: "r".into(),
            min: Expr::int(0),
            extent: Expr::var("n"),
        }]);
        f.add_update(r.clone());
        f.add_update(r.clone());
        let mut graph = StageGraph::new();
        graph.add(f);

        let mut count = 0;
        graph.mutate(&mut |e: &Expr| {
            count += 1;
            e.clone()
        });
        assert_eq!(count, 2);
    }

    #[test]
    fn dependencies_collect_free_vars_per_stage() {
        let graph = graph_with_cycle();
        graph
            .get("g")
            .unwrap()
            .schedule()
            .bounds_mut()
            .push(Bound::new("x", Some(Expr::var("lo")), Some(Expr::var("w"))));
        let deps = graph.dependencies();
        assert_eq!(deps["f"].iter().collect::<Vec<_>>(), vec!["n"]);
        assert_eq!(deps["g"].iter().collect::<Vec<_>>(), vec!["lo", "w"]);
    }

    #[test]
    fn fingerprint_hex_is_64_chars() {
        let hex = graph_with_cycle().fingerprint_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
