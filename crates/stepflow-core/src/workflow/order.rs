//! Ordering and reachability over the forward edges of a workflow.
//!
//! Loop-back edges and edges naming unknown steps are ignored everywhere in
//! this module; validation reports those separately.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, VecDeque};

use super::graph::WorkflowGraph;
use crate::error::{Result, StepflowError};
use crate::types::StepId;

struct Adjacency<'a> {
    ids: Vec<&'a StepId>,
    index: HashMap<&'a StepId, usize>,
    succ: Vec<Vec<usize>>,
    pred: Vec<Vec<usize>>,
}

impl<'a> Adjacency<'a> {
    fn forward(graph: &'a WorkflowGraph) -> Self {
        let ids: Vec<&StepId> = graph.steps.iter().map(|s| &s.id).collect();
        let mut index = HashMap::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            index.entry(*id).or_insert(i);
        }
        let mut succ = vec![Vec::new(); ids.len()];
        let mut pred = vec![Vec::new(); ids.len()];
        for c in graph.connections.iter().filter(|c| !c.is_loop_back()) {
            if let (Some(&f), Some(&t)) = (index.get(&c.from), index.get(&c.to)) {
                succ[f].push(t);
                pred[t].push(f);
            }
        }
        Self {
            ids,
            index,
            succ,
            pred,
        }
    }

    fn walk(&self, start: usize, edges: &[Vec<usize>]) -> Vec<bool> {
        let mut seen = vec![false; self.ids.len()];
        let mut queue = VecDeque::from([start]);
        seen[start] = true;
        while let Some(v) = queue.pop_front() {
            for &w in &edges[v] {
                if !seen[w] {
                    seen[w] = true;
                    queue.push_back(w);
                }
            }
        }
        seen
    }
}

/// Kahn's algorithm. Ties are broken by step position so the order is stable.
pub fn topological_order(graph: &WorkflowGraph) -> Result<Vec<StepId>> {
    let adj = Adjacency::forward(graph);
    let n = adj.ids.len();
    let mut indegree: Vec<usize> = adj.pred.iter().map(Vec::len).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| indegree[i] == 0)
        .map(Reverse)
        .collect();

    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(v)) = ready.pop() {
        order.push(adj.ids[v].clone());
        for &w in &adj.succ[v] {
            indegree[w] -= 1;
            if indegree[w] == 0 {
                ready.push(Reverse(w));
            }
        }
    }

    if order.len() < n {
        let stuck = (0..n).find(|&i| indegree[i] > 0).unwrap_or(0);
        return Err(StepflowError::Cycle {
            step: adj.ids[stuck].to_string(),
        });
    }
    Ok(order)
}

/// Depth-first search for a cycle. Returns the path, first step repeated last.
pub fn find_cycle(graph: &WorkflowGraph) -> Option<Vec<StepId>> {
    let adj = Adjacency::forward(graph);
    let n = adj.ids.len();
    let mut color = vec![Color::White; n];
    let mut path = Vec::new();

    for start in 0..n {
        if color[start] == Color::White {
            if let Some(cycle) = dfs(start, &adj.succ, &mut color, &mut path) {
                return Some(cycle.into_iter().map(|i| adj.ids[i].clone()).collect());
            }
        }
    }
    None
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Grey,
    Black,
}

fn dfs(
    v: usize,
    succ: &[Vec<usize>],
    color: &mut [Color],
    path: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    color[v] = Color::Grey;
    path.push(v);
    for &w in &succ[v] {
        match color[w] {
            Color::Grey => {
                let pos = path.iter().position(|&x| x == w).unwrap_or(0);
                let mut cycle = path[pos..].to_vec();
                cycle.push(w);
                return Some(cycle);
            }
            Color::White => {
                if let Some(cycle) = dfs(w, succ, color, path) {
                    return Some(cycle);
                }
            }
            Color::Black => {}
        }
    }
    path.pop();
    color[v] = Color::Black;
    None
}

/// Whether `to` can be reached from `from` along forward edges.
pub fn reaches(graph: &WorkflowGraph, from: &StepId, to: &StepId) -> bool {
    let adj = Adjacency::forward(graph);
    match (adj.index.get(from), adj.index.get(to)) {
        (Some(&f), Some(&t)) => adj.walk(f, &adj.succ)[t],
        _ => false,
    }
}

/// Steps on some forward path from `head` to `tail`, both ends included.
/// This is the body re-run when a loop-back edge `tail -> head` fires.
pub fn loop_body(graph: &WorkflowGraph, head: &StepId, tail: &StepId) -> BTreeSet<StepId> {
    let adj = Adjacency::forward(graph);
    let (Some(&h), Some(&t)) = (adj.index.get(head), adj.index.get(tail)) else {
        return BTreeSet::new();
    };
    let down = adj.walk(h, &adj.succ);
    let up = adj.walk(t, &adj.pred);
    (0..adj.ids.len())
        .filter(|&i| down[i] && up[i])
        .map(|i| adj.ids[i].clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StepSpec;

    fn graph(ids: &[&str], edges: &[(&str, &str)]) -> WorkflowGraph {
        let mut g = WorkflowGraph::new();
        for id in ids {
            g.add_step(StepSpec::new("agent", "role").with_id(*id));
        }
        for (f, t) in edges {
            g.add_connection(*f, *t, None);
        }
        g
    }

    fn ids(v: &[StepId]) -> Vec<&str> {
        v.iter().map(StepId::as_str).collect()
    }

    #[test]
    fn topo_respects_edges_and_position() {
        let g = graph(&["c", "a", "b"], &[("a", "b"), ("b", "c")]);
        assert_eq!(ids(&topological_order(&g).unwrap()), vec!["a", "b", "c"]);

        let parallel = graph(&["x", "y", "z"], &[]);
        assert_eq!(ids(&topological_order(&parallel).unwrap()), vec!["x", "y", "z"]);
    }

    #[test]
    fn topo_rejects_cycle() {
        let g = graph(&["a", "b"], &[("a", "b"), ("b", "a")]);
        assert!(matches!(
            topological_order(&g),
            Err(StepflowError::Cycle { .. })
        ));
    }

    #[test]
    fn loop_back_edges_are_ignored() {
        let mut g = graph(&["a", "b"], &[("a", "b")]);
        g.add_loop_connection("b", "a", Some("retry"), 3);
        assert!(topological_order(&g).is_ok());
        assert!(find_cycle(&g).is_none());
    }

    #[test]
    fn find_cycle_reports_path() {
        let g = graph(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "b")]);
        let cycle = find_cycle(&g).unwrap();
        assert_eq!(ids(&cycle), vec!["b", "c", "b"]);
    }

    #[test]
    fn reachability_and_body() {
        let g = graph(
            &["a", "b", "c", "d", "side"],
            &[("a", "b"), ("b", "c"), ("a", "side"), ("c", "d")],
        );
        assert!(reaches(&g, &"a".into(), &"d".into()));
        assert!(!reaches(&g, &"d".into(), &"a".into()));

        let body = loop_body(&g, &"a".into(), &"c".into());
        let body: Vec<_> = body.iter().map(StepId::as_str).collect();
        assert_eq!(body, vec!["a", "b", "c"]);
    }
}
