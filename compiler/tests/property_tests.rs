// Property-based tests for schedule invariants.
//
// Generated directive scripts are applied to a small stage set, then the
// resulting graph is checked for:
// 1. Deep copy: structurally equal, storage-disjoint, certificate passes
// 2. Traversal: identity mutate is a no-op; mutate and accept agree
// 3. Isolation: rewriting the clone never changes the source
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use proptest::prelude::*;
use schedc::expr::Expr;
use schedc::graph::StageGraph;
use schedc::pipeline::CloneCert;
use schedc::schedule::Schedule;

// ── Script generator ────────────────────────────────────────────────────────

const STAGES: usize = 3;

/// One directive line against stage `target`. Callsite names embed the line
/// index so named wrappers are never redefined.
fn arb_directive() -> impl Strategy<Value = (usize, String)> {
    let small = 0i64..64;
    let op = prop_oneof![
        (small.clone(), small.clone()).prop_map(|(a, b)| format!("bound(x, {a}, {b})")),
        (small.clone(), small.clone())
            .prop_map(|(k, b)| format!("specialize(p == {k}).bound(y, 0, {b} + n)")),
        (small.clone(), small.clone())
            .prop_map(|(k, j)| format!("specialize(p > {k}).specialize(q < {j}).memoize()")),
        small
            .clone()
            .prop_map(|n| format!("rdom(r, 0, {n}).where(r < m)")),
        Just("memoize()".to_string()),
        Just("compute_root()".to_string()),
        Just("allow_race_conditions()".to_string()),
        (0..STAGES).prop_map(|s| format!("wrap(\"\", s{s})")),
        (0..STAGES).prop_map(|s| format!("wrap(\"CALLSITE\", s{s})")),
    ];
    (0..STAGES, op)
}

fn arb_script() -> impl Strategy<Value = String> {
    prop::collection::vec(arb_directive(), 0..12).prop_map(|lines| {
        let mut script = String::new();
        for s in 0..STAGES {
            script.push_str(&format!("stage s{s}(x, y)\n"));
        }
        for (i, (target, op)) in lines.into_iter().enumerate() {
            let op = op.replace("CALLSITE", &format!("c{i}"));
            script.push_str(&format!("s{target}.{op}\n"));
        }
        script
    })
}

fn build(source: &str) -> StageGraph {
    let parsed = schedc::parser::parse(source);
    assert!(parsed.errors.is_empty(), "parse errors: {:?}", parsed.errors);
    let result = schedc::apply::apply_script(&parsed.script.unwrap());
    assert!(
        result.diagnostics.iter().all(|d| !d.is_error()),
        "diagnostics for\n{source}\n{:?}",
        result.diagnostics
    );
    result.graph
}

fn pure_schedules(graph: &StageGraph) -> Vec<Schedule> {
    graph.stages().iter().map(|s| s.schedule()).collect()
}

// ── Deep copy ───────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn deep_copy_is_equal_and_disjoint(source in arb_script()) {
        let graph = build(&source);
        let copy = graph.deep_copy().unwrap();

        prop_assert_eq!(copy.to_string(), graph.to_string());
        prop_assert!(CloneCert::check(&graph, &copy).all_pass());
        for (a, b) in pure_schedules(&graph).iter().zip(pure_schedules(&copy)) {
            prop_assert!(!a.same_as(&b));
            for (sa, sb) in a.specializations().iter().zip(b.specializations().iter()) {
                prop_assert!(!sa.schedule.same_as(&sb.schedule));
            }
        }
    }

    #[test]
    fn wrapper_targets_stay_inside_the_clone(source in arb_script()) {
        let graph = build(&source);
        let copy = graph.deep_copy().unwrap();
        for stage in copy.stages() {
            for target in stage.schedule().wrappers().values() {
                let root = copy.get(&target.name()).unwrap();
                prop_assert!(target.same_as(root));
            }
        }
    }
}

// ── Traversal ───────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn identity_mutate_is_a_no_op(source in arb_script()) {
        let graph = build(&source);
        let before = graph.to_string();
        graph.mutate(&mut |e: &Expr| e.clone());
        prop_assert_eq!(graph.to_string(), before);
    }

    #[test]
    fn mutate_and_accept_see_the_same_fields(source in arb_script()) {
        let graph = build(&source);
        let mut visited = Vec::new();
        graph.accept(&mut |e: &Expr| visited.push(e.clone()));
        let mut mutated = Vec::new();
        graph.mutate(&mut |e: &Expr| {
            mutated.push(e.clone());
            e.clone()
        });
        prop_assert_eq!(visited, mutated);
    }

    #[test]
    fn sentinel_mutate_leaves_only_sentinels(source in arb_script()) {
        let graph = build(&source);
        graph.mutate(&mut |_: &Expr| Expr::var("SENTINEL"));
        let mut others = 0;
        graph.accept(&mut |e: &Expr| {
            if *e != Expr::var("SENTINEL") {
                others += 1;
            }
        });
        prop_assert_eq!(others, 0);
    }

    #[test]
    fn rewriting_the_clone_never_touches_the_source(source in arb_script()) {
        let graph = build(&source);
        let before = graph.to_string();
        let copy = graph.deep_copy().unwrap();
        copy.mutate(&mut |_: &Expr| Expr::int(0));
        for stage in copy.stages() {
            stage.schedule().set_memoized(!stage.schedule().memoized());
        }
        prop_assert_eq!(graph.to_string(), before);
    }
}
