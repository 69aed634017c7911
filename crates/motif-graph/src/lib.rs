//! Component G — pure, immutable operations over a workflow's DAG.
//!
//! Built once per `reconcile(run)` call from the workflow definition;
//! never mutated. Grounded on the wave-based DAG model of the external
//! `dag_executor` service (predecessor/successor adjacency built once,
//! then walked repeatedly) and on the orchestrator's `depends_on`
//! dependency-edge shape.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("workflow graph contains a cycle")]
    Cyclic,
}

#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub is_conditional: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    All,
    SpecifiedStarts,
    IsolatedNodes,
}

pub struct Graph {
    node_ids: Vec<String>,
    predecessors: HashMap<String, Vec<String>>,
    successors: HashMap<String, Vec<String>>,
    out_edges: HashMap<String, Vec<GraphEdge>>,
}

impl Graph {
    /// `node_ids` and `edges` are taken in the workflow definition's own
    /// order so that `outEdges` iteration stays deterministic.
    pub fn new(node_ids: Vec<String>, edges: Vec<GraphEdge>) -> Self {
        let mut predecessors: HashMap<String, Vec<String>> =
            node_ids.iter().map(|id| (id.clone(), Vec::new())).collect();
        let mut successors: HashMap<String, Vec<String>> =
            node_ids.iter().map(|id| (id.clone(), Vec::new())).collect();
        let mut out_edges: HashMap<String, Vec<GraphEdge>> =
            node_ids.iter().map(|id| (id.clone(), Vec::new())).collect();

        for edge in edges {
            successors.entry(edge.source.clone()).or_default().push(edge.target.clone());
            predecessors.entry(edge.target.clone()).or_default().push(edge.source.clone());
            out_edges.entry(edge.source.clone()).or_default().push(edge);
        }

        Self {
            node_ids,
            predecessors,
            successors,
            out_edges,
        }
    }

    pub fn node_ids(&self) -> &[String] {
        &self.node_ids
    }

    pub fn predecessors(&self, node_id: &str) -> &[String] {
        self.predecessors.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn successors(&self, node_id: &str) -> &[String] {
        self.successors.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn out_edges(&self, node_id: &str) -> &[GraphEdge] {
        self.out_edges.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// DFS-based cycle detection over the whole graph, not just the
    /// reachable subset — a disconnected cyclic island is still invalid.
    pub fn has_cycle(&self) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: HashMap<&str, Mark> = HashMap::new();

        fn visit<'a>(
            node: &'a str,
            graph: &'a Graph,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> bool {
            match marks.get(node) {
                Some(Mark::Visiting) => return true,
                Some(Mark::Done) => return false,
                None => {}
            }
            marks.insert(node, Mark::Visiting);
            for next in graph.successors(node) {
                if visit(next.as_str(), graph, marks) {
                    return true;
                }
            }
            marks.insert(node, Mark::Done);
            false
        }

        self.node_ids.iter().any(|id| visit(id.as_str(), self, &mut marks))
    }

    pub fn validate_acyclic(&self) -> Result<(), GraphError> {
        if self.has_cycle() {
            Err(GraphError::Cyclic)
        } else {
            Ok(())
        }
    }

    /// The forward closure of `seeds`: used by the reconcile loop to
    /// decide whether a run is complete.
    pub fn reachable_from(&self, seeds: &[String]) -> HashSet<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut stack: Vec<String> = seeds.to_vec();
        while let Some(node) = stack.pop() {
            if !seen.insert(node.clone()) {
                continue;
            }
            for next in self.successors(&node) {
                if !seen.contains(next) {
                    stack.push(next.clone());
                }
            }
        }
        seen
    }

    /// `all` → every node with no predecessors (isolated nodes included).
    /// `specified_starts` → `start_node_ids` verbatim.
    /// `isolated_nodes` → nodes with neither predecessors nor successors.
    pub fn execution_starts(&self, mode: StartMode, start_node_ids: &[String]) -> Vec<String> {
        match mode {
            StartMode::All => self
                .node_ids
                .iter()
                .filter(|id| self.predecessors(id).is_empty())
                .cloned()
                .collect(),
            StartMode::SpecifiedStarts => start_node_ids.to_vec(),
            StartMode::IsolatedNodes => self
                .node_ids
                .iter()
                .filter(|id| self.predecessors(id).is_empty() && self.successors(id).is_empty())
                .cloned()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(id: &str, source: &str, target: &str) -> GraphEdge {
        GraphEdge {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            is_conditional: false,
        }
    }

    #[test]
    fn linear_chain_has_one_start_and_full_reachability() {
        let nodes = vec!["a".into(), "b".into(), "c".into()];
        let graph = Graph::new(nodes, vec![edge("e1", "a", "b"), edge("e2", "b", "c")]);

        assert!(!graph.has_cycle());
        assert_eq!(graph.execution_starts(StartMode::All, &[]), vec!["a".to_string()]);
        let reachable = graph.reachable_from(&["a".to_string()]);
        assert_eq!(reachable.len(), 3);
    }

    #[test]
    fn detects_cycle() {
        let nodes = vec!["a".into(), "b".into()];
        let graph = Graph::new(nodes, vec![edge("e1", "a", "b"), edge("e2", "b", "a")]);
        assert!(graph.has_cycle());
        assert!(graph.validate_acyclic().is_err());
    }

    #[test]
    fn isolated_nodes_have_no_predecessors_or_successors() {
        let nodes = vec!["a".into(), "b".into(), "isolated".into()];
        let graph = Graph::new(nodes, vec![edge("e1", "a", "b")]);
        assert_eq!(
            graph.execution_starts(StartMode::IsolatedNodes, &[]),
            vec!["isolated".to_string()]
        );
        assert_eq!(graph.execution_starts(StartMode::All, &[]), vec!["a".to_string()]);
    }

    #[test]
    fn specified_starts_returned_verbatim() {
        let nodes = vec!["a".into(), "b".into()];
        let graph = Graph::new(nodes, vec![edge("e1", "a", "b")]);
        let starts = vec!["b".to_string()];
        assert_eq!(graph.execution_starts(StartMode::SpecifiedStarts, &starts), starts);
    }
}
