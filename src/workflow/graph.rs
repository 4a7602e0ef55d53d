use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::{
    Direction::{Incoming, Outgoing},
    graph::{DiGraph, NodeIndex},
    visit::EdgeRef,
};

use super::{WorkflowError, definition::WorkflowDefinition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Dependency,
    Data,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// The enabled part of a workflow as a graph.
///
/// Dependency edges (`dep → node`) and connection edges (`from → to`) live
/// in one graph. Node indices follow declaration order, which is what every
/// ordering below uses to break ties.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    graph: DiGraph<String, EdgeKind>,
    index: HashMap<String, NodeIndex>,
}

impl WorkflowGraph {
    /// Disabled nodes, repeated ids and edges to unknown nodes are left out;
    /// `WorkflowDefinition::validate` reports those.
    pub fn build(def: &WorkflowDefinition) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for node in def.nodes.iter().filter(|n| n.enabled) {
            if !index.contains_key(&node.id) {
                let ix = graph.add_node(node.id.clone());
                index.insert(node.id.clone(), ix);
            }
        }
        for node in def.nodes.iter().filter(|n| n.enabled) {
            let Some(&to) = index.get(&node.id) else { continue };
            for dep in &node.depends_on {
                if let Some(&from) = index.get(dep) {
                    graph.add_edge(from, to, EdgeKind::Dependency);
                }
            }
        }
        for conn in &def.connections {
            if let (Some(&from), Some(&to)) = (index.get(&conn.from_node), index.get(&conn.to_node)) {
                graph.add_edge(from, to, EdgeKind::Data);
            }
        }
        Self { graph, index }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    fn name(&self, ix: NodeIndex) -> String {
        self.graph[ix].clone()
    }

    fn successors(&self, ix: NodeIndex) -> Vec<NodeIndex> {
        self.graph.neighbors_directed(ix, Outgoing).collect()
    }

    /// Every node this one waits for, dependency or data source, deduplicated
    /// and in declaration order.
    pub fn upstream(&self, id: &str) -> Vec<String> {
        let Some(&ix) = self.index.get(id) else {
            return vec![];
        };
        let set: BTreeSet<NodeIndex> = self.graph.neighbors_directed(ix, Incoming).collect();
        set.into_iter().map(|i| self.name(i)).collect()
    }

    /// Depth-first search with white/gray/black marking; the first edge that
    /// reaches a gray node closes a cycle.
    pub fn back_edge(&self) -> Option<(String, String)> {
        let mut color = vec![Color::White; self.graph.node_count()];
        for start in self.graph.node_indices() {
            if color[start.index()] != Color::White {
                continue;
            }
            color[start.index()] = Color::Gray;
            let mut stack = vec![(start, self.successors(start))];
            loop {
                let Some((node, pending)) = stack.last_mut() else { break };
                let node = *node;
                let next = pending.pop();
                match next {
                    Some(next) => match color[next.index()] {
                        Color::Gray => return Some((self.name(node), self.name(next))),
                        Color::White => {
                            color[next.index()] = Color::Gray;
                            stack.push((next, self.successors(next)));
                        }
                        Color::Black => {}
                    },
                    None => {
                        color[node.index()] = Color::Black;
                        stack.pop();
                    }
                }
            }
        }
        None
    }

    pub fn has_cycle(&self) -> bool {
        self.back_edge().is_some()
    }

    fn in_degrees(&self) -> Vec<usize> {
        self.graph.node_indices().map(|n| self.graph.edges_directed(n, Incoming).count()).collect()
    }

    /// Repeatedly take the earliest-declared node whose inputs are all
    /// scheduled. Fails on a cycle.
    pub fn topological_order(&self) -> Result<Vec<String>, WorkflowError> {
        let mut indegree = self.in_degrees();
        let mut ready: BTreeSet<usize> =
            indegree.iter().enumerate().filter(|(_, d)| **d == 0).map(|(i, _)| i).collect();
        let mut order = Vec::with_capacity(self.node_count());
        while let Some(i) = ready.pop_first() {
            let ix = NodeIndex::new(i);
            order.push(self.name(ix));
            for edge in self.graph.edges_directed(ix, Outgoing) {
                let t = edge.target().index();
                indegree[t] -= 1;
                if indegree[t] == 0 {
                    ready.insert(t);
                }
            }
        }
        if order.len() != self.node_count() {
            return Err(WorkflowError::Cycle);
        }
        Ok(order)
    }

    /// Waves of nodes that can run together; each wave only needs the
    /// waves before it.
    pub fn levels(&self) -> Result<Vec<Vec<String>>, WorkflowError> {
        let mut indegree = self.in_degrees();
        let mut current: Vec<usize> =
            indegree.iter().enumerate().filter(|(_, d)| **d == 0).map(|(i, _)| i).collect();
        let mut levels = Vec::new();
        let mut placed = 0;
        while !current.is_empty() {
            let mut next = Vec::new();
            for &i in &current {
                for edge in self.graph.edges_directed(NodeIndex::new(i), Outgoing) {
                    let t = edge.target().index();
                    indegree[t] -= 1;
                    if indegree[t] == 0 {
                        next.push(t);
                    }
                }
            }
            placed += current.len();
            levels.push(current.iter().map(|&i| self.name(NodeIndex::new(i))).collect());
            next.sort_unstable();
            current = next;
        }
        if placed != self.node_count() {
            return Err(WorkflowError::Cycle);
        }
        Ok(levels)
    }

    /// Level number of every node.
    pub fn depths(&self) -> Result<BTreeMap<String, usize>, WorkflowError> {
        Ok(self
            .levels()?
            .into_iter()
            .enumerate()
            .flat_map(|(depth, ids)| ids.into_iter().map(move |id| (id, depth)))
            .collect())
    }

    /// Nodes with no edge at all, in declaration order.
    pub fn isolated(&self) -> Vec<String> {
        self.graph
            .node_indices()
            .filter(|&n| self.graph.neighbors_undirected(n).next().is_none())
            .map(|n| self.name(n))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::{NodeConnection, WorkflowNode};

    /// `deps` is a comma separated list.
    fn wf(nodes: &[(&str, &str)], conns: &[(&str, &str)]) -> WorkflowDefinition {
        let mut def = WorkflowDefinition::new("wf", "test");
        for (id, deps) in nodes {
            let mut n = WorkflowNode::new(*id, "echo");
            n.depends_on = deps.split(',').filter(|d| !d.is_empty()).map(String::from).collect();
            def.add_node(n);
        }
        for (from, to) in conns {
            def.add_connection(NodeConnection::new(*from, "output", *to, "input"));
        }
        def
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|o| o == id).unwrap()
    }

    #[test]
    fn chain_orders_by_dependency_not_declaration() {
        let def = wf(&[("C", "B"), ("B", "A"), ("A", "")], &[]);
        let g = WorkflowGraph::build(&def);
        assert_eq!(g.topological_order().unwrap(), vec!["A", "B", "C"]);
        assert!(!g.has_cycle());
    }

    #[test]
    fn diamond_keeps_endpoints_fixed() {
        let def = wf(
            &[("input", ""), ("process_a", ""), ("process_b", ""), ("combine", "")],
            &[("input", "process_a"), ("input", "process_b"), ("process_a", "combine"), ("process_b", "combine")],
        );
        let g = WorkflowGraph::build(&def);
        let order = g.topological_order().unwrap();
        assert_eq!(order.first().map(String::as_str), Some("input"));
        assert_eq!(order.last().map(String::as_str), Some("combine"));
        assert_eq!(
            g.levels().unwrap(),
            vec![vec!["input".to_string()], vec!["process_a".into(), "process_b".into()], vec!["combine".into()]]
        );
        assert_eq!(g.depths().unwrap().get("combine"), Some(&2));
        assert_eq!(g.upstream("combine"), vec!["process_a", "process_b"]);
    }

    #[test]
    fn ties_follow_declaration_order() {
        let def = wf(&[("z", ""), ("m", ""), ("a", "z")], &[]);
        let g = WorkflowGraph::build(&def);
        assert_eq!(g.topological_order().unwrap(), vec!["z", "m", "a"]);
    }

    #[test]
    fn every_edge_points_forward() {
        let def = wf(
            &[("e", "d"), ("b", "a"), ("d", "b,c"), ("c", "a"), ("a", ""), ("f", "")],
            &[("a", "f"), ("f", "e")],
        );
        let g = WorkflowGraph::build(&def);
        let order = g.topological_order().unwrap();
        for n in &def.nodes {
            for dep in &n.depends_on {
                assert!(position(&order, dep) < position(&order, &n.id));
            }
        }
        for c in &def.connections {
            assert!(position(&order, &c.from_node) < position(&order, &c.to_node));
        }
    }

    #[test]
    fn cycles_through_either_edge_kind_are_found() {
        let deps_only = wf(&[("a", "c"), ("b", "a"), ("c", "b")], &[]);
        let g = WorkflowGraph::build(&deps_only);
        assert!(g.has_cycle());
        assert!(matches!(g.topological_order(), Err(WorkflowError::Cycle)));
        assert!(matches!(g.levels(), Err(WorkflowError::Cycle)));

        let mixed = wf(&[("a", ""), ("b", "a")], &[("b", "a")]);
        assert!(WorkflowGraph::build(&mixed).has_cycle());

        let self_loop = wf(&[("a", "a")], &[]);
        assert!(WorkflowGraph::build(&self_loop).back_edge().is_some());
    }

    #[test]
    fn disabled_nodes_drop_out() {
        let mut def = wf(&[("a", ""), ("b", ""), ("c", "")], &[("a", "b")]);
        def.node_mut("b").unwrap().enabled = false;
        let g = WorkflowGraph::build(&def);
        assert_eq!(g.node_count(), 2);
        assert_eq!(g.edge_count(), 0);
        assert_eq!(g.isolated(), vec!["a", "c"]);
    }
}
