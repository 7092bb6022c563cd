//! Property tests for dependency graph construction and ordering.

use issue_swarm::graph::{DependencyGraph, GraphError};
use issue_swarm::issue::Issue;
use proptest::prelude::*;

/// Random DAGs: each issue may depend only on lower-indexed issues, so the
/// generated set is acyclic by construction.
fn arb_dag(max_issues: usize) -> impl Strategy<Value = Vec<Issue>> {
    (2..=max_issues).prop_flat_map(|n| {
        let edges = proptest::collection::vec(
            (1..n, any::<proptest::sample::Index>()),
            0..n * 2,
        );
        edges.prop_map(move |edges| {
            let mut issues: Vec<Issue> =
                (0..n).map(|i| Issue::new(format!("ISSUE-{i:03}"))).collect();
            for (to, from_idx) in edges {
                let from = from_idx.index(to);
                let dep = format!("ISSUE-{from:03}");
                issues[to].depends_on.insert(dep);
            }
            issues
        })
    })
}

proptest! {
    #[test]
    fn topological_order_places_dependencies_first(issues in arb_dag(12)) {
        let graph = DependencyGraph::new(issues).unwrap();
        let order = graph.topological_sort();
        let pos: std::collections::HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, issue)| (issue.id.as_str(), i))
            .collect();

        prop_assert_eq!(order.len(), graph.len());
        for issue in graph.issues() {
            for dep in &issue.depends_on {
                prop_assert!(pos[dep.as_str()] < pos[issue.id.as_str()]);
            }
        }
    }

    #[test]
    fn dependency_cycles_are_always_rejected(len in 2usize..10) {
        // A ring: each issue depends on the next, closing back on itself.
        let issues: Vec<Issue> = (0..len)
            .map(|i| {
                Issue::new(format!("RING-{i}"))
                    .with_dependency(format!("RING-{}", (i + 1) % len))
            })
            .collect();
        prop_assert!(matches!(
            DependencyGraph::new(issues),
            Err(GraphError::CyclicDependency(_))
        ));
    }
}
