//! Dependency graph over the issue set.
//!
//! Validates dependency declarations at build time, orders issues
//! topologically, and answers which issues are currently dispatchable
//! given the set of already-merged identifiers.

use crate::issue::Issue;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("issue '{issue}' depends on unknown issue '{dependency}'")]
    UnknownDependency { issue: String, dependency: String },
    #[error("cyclic dependency detected involving '{0}'")]
    CyclicDependency(String),
    #[error("duplicate issue identifier '{0}'")]
    DuplicateId(String),
}

pub struct DependencyGraph {
    issues: Vec<Issue>,
    index: HashMap<String, usize>,
}

impl DependencyGraph {
    /// Build the graph, validating that every declared dependency exists
    /// and that the dependency relation is acyclic.
    pub fn new(issues: Vec<Issue>) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(issues.len());
        for (i, issue) in issues.iter().enumerate() {
            if index.insert(issue.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateId(issue.id.clone()));
            }
        }

        for issue in &issues {
            for dep in &issue.depends_on {
                if !index.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        issue: issue.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let graph = Self { issues, index };
        graph.check_cycles()?;
        Ok(graph)
    }

    /// DFS with a recursion-stack check. Runs once at construction so every
    /// later operation can assume an acyclic graph.
    fn check_cycles(&self) -> Result<(), GraphError> {
        let n = self.issues.len();
        let mut visited = vec![false; n];
        let mut on_stack = vec![false; n];

        for start in 0..n {
            if !visited[start] {
                self.dfs_visit(start, &mut visited, &mut on_stack)?;
            }
        }
        Ok(())
    }

    fn dfs_visit(
        &self,
        node: usize,
        visited: &mut [bool],
        on_stack: &mut [bool],
    ) -> Result<(), GraphError> {
        visited[node] = true;
        on_stack[node] = true;

        for dep in &self.issues[node].depends_on {
            let dep_idx = self.index[dep];
            if on_stack[dep_idx] {
                return Err(GraphError::CyclicDependency(dep.clone()));
            }
            if !visited[dep_idx] {
                self.dfs_visit(dep_idx, visited, on_stack)?;
            }
        }

        on_stack[node] = false;
        Ok(())
    }

    /// Total order consistent with dependencies. Ties broken by priority
    /// (higher first) then identifier, so the order is deterministic.
    pub fn topological_sort(&self) -> Vec<&Issue> {
        let mut remaining_deps: HashMap<&str, BTreeSet<&str>> = self
            .issues
            .iter()
            .map(|i| {
                (
                    i.id.as_str(),
                    i.depends_on.iter().map(|d| d.as_str()).collect(),
                )
            })
            .collect();

        // dependents[id] = issues that declare id as a dependency
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for issue in &self.issues {
            for dep in &issue.depends_on {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(issue.id.as_str());
            }
        }

        // Ordered frontier keyed by (priority desc, id asc)
        let mut frontier: BTreeSet<(Reverse<u32>, &str)> = self
            .issues
            .iter()
            .filter(|i| i.depends_on.is_empty())
            .map(|i| (Reverse(i.priority.value()), i.id.as_str()))
            .collect();

        let mut order = Vec::with_capacity(self.issues.len());
        while let Some(&(prio, id)) = frontier.iter().next() {
            frontier.remove(&(prio, id));
            let issue = &self.issues[self.index[id]];
            order.push(issue);

            for &dependent in dependents.get(id).into_iter().flatten() {
                if let Some(deps) = remaining_deps.get_mut(dependent) {
                    deps.remove(id);
                    if deps.is_empty() {
                        let dep_issue = &self.issues[self.index[dependent]];
                        frontier.insert((Reverse(dep_issue.priority.value()), dependent));
                    }
                }
            }
        }

        debug_assert_eq!(order.len(), self.issues.len());
        order
    }

    /// All issues whose dependency set is a subset of `merged` and which are
    /// neither merged nor currently in flight. Returned in dispatch order
    /// (priority desc, id asc).
    pub fn ready(&self, merged: &HashSet<String>, in_flight: &HashSet<String>) -> Vec<&Issue> {
        let mut out: Vec<&Issue> = self
            .issues
            .iter()
            .filter(|i| !merged.contains(&i.id) && !in_flight.contains(&i.id))
            .filter(|i| i.depends_on.iter().all(|d| merged.contains(d)))
            .collect();
        out.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Issue> {
        self.index.get(id).map(|&i| &self.issues[i])
    }

    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::Priority;

    fn ids(issues: &[&Issue]) -> Vec<String> {
        issues.iter().map(|i| i.id.clone()).collect()
    }

    #[test]
    fn rejects_unknown_dependency() {
        let issues = vec![Issue::new("A").with_dependency("MISSING")];
        match DependencyGraph::new(issues) {
            Err(GraphError::UnknownDependency { issue, dependency }) => {
                assert_eq!(issue, "A");
                assert_eq!(dependency, "MISSING");
            }
            other => panic!("expected UnknownDependency, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn rejects_cycle() {
        let issues = vec![
            Issue::new("A").with_dependency("B"),
            Issue::new("B").with_dependency("C"),
            Issue::new("C").with_dependency("A"),
        ];
        assert!(matches!(
            DependencyGraph::new(issues),
            Err(GraphError::CyclicDependency(_))
        ));
    }

    #[test]
    fn rejects_self_cycle() {
        let issues = vec![Issue::new("A").with_dependency("A")];
        assert!(matches!(
            DependencyGraph::new(issues),
            Err(GraphError::CyclicDependency(_))
        ));
    }

    #[test]
    fn rejects_duplicate_id() {
        let issues = vec![Issue::new("A"), Issue::new("A")];
        assert!(matches!(
            DependencyGraph::new(issues),
            Err(GraphError::DuplicateId(_))
        ));
    }

    #[test]
    fn topological_sort_respects_dependencies() {
        let issues = vec![
            Issue::new("ENH-010").with_dependency("BUG-001"),
            Issue::new("BUG-001"),
            Issue::new("ENH-011").with_dependency("ENH-010"),
        ];
        let graph = DependencyGraph::new(issues).unwrap();
        let order = ids(&graph.topological_sort());
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("BUG-001") < pos("ENH-010"));
        assert!(pos("ENH-010") < pos("ENH-011"));
    }

    #[test]
    fn topological_sort_breaks_ties_by_priority_then_id() {
        let issues = vec![
            Issue::new("C"),
            Issue::new("B").with_priority(Priority::High),
            Issue::new("A"),
        ];
        let graph = DependencyGraph::new(issues).unwrap();
        assert_eq!(ids(&graph.topological_sort()), vec!["B", "A", "C"]);
    }

    #[test]
    fn ready_requires_dependency_subset_of_merged() {
        let issues = vec![
            Issue::new("BUG-001"),
            Issue::new("ENH-010").with_dependency("BUG-001"),
        ];
        let graph = DependencyGraph::new(issues).unwrap();

        let merged = HashSet::new();
        let in_flight = HashSet::new();
        assert_eq!(ids(&graph.ready(&merged, &in_flight)), vec!["BUG-001"]);

        let merged: HashSet<String> = ["BUG-001".to_string()].into();
        assert_eq!(ids(&graph.ready(&merged, &in_flight)), vec!["ENH-010"]);
    }

    #[test]
    fn ready_excludes_in_flight_and_merged() {
        let issues = vec![Issue::new("A"), Issue::new("B")];
        let graph = DependencyGraph::new(issues).unwrap();

        let merged: HashSet<String> = ["A".to_string()].into();
        let in_flight: HashSet<String> = ["B".to_string()].into();
        assert!(graph.ready(&merged, &in_flight).is_empty());
    }
}
