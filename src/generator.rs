use std::collections::BTreeSet;

use rand::{seq::SliceRandom, Rng};

use crate::graph::{GraphError, GraphInfo};

/// Attempts before giving up on drawing a graph without isolated nodes.
const MAX_ATTEMPTS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RandomGraph {
    /// Watts-Strogatz small world: ring of `k` nearest neighbours, rewired with probability `p`.
    WattsStrogatz { k: usize, p: f64 },
    /// Erdos-Renyi: every edge present with probability `p`.
    ErdosRenyi { p: f64 },
    /// Barabasi-Albert preferential attachment with `m` edges per new node.
    BarabasiAlbert { m: usize },
}

impl RandomGraph {
    pub fn generate<R: Rng>(
        &self,
        node_count: usize,
        rng: &mut R,
    ) -> Result<GraphInfo, GraphError> {
        self.check(node_count)?;

        for _ in 0..MAX_ATTEMPTS {
            let edges = match *self {
                RandomGraph::WattsStrogatz { k, p } => watts_strogatz(node_count, k, p, rng),
                RandomGraph::ErdosRenyi { p } => erdos_renyi(node_count, p, rng),
                RandomGraph::BarabasiAlbert { m } => barabasi_albert(node_count, m, rng),
            };
            let edges: Vec<_> = edges.into_iter().collect();

            if let Ok(graph) = GraphInfo::from_undirected(node_count, &edges) {
                return Ok(graph);
            }
        }

        Err(GraphError::Invalid(format!(
            "no connected wiring found for {self:?} after {MAX_ATTEMPTS} attempts"
        )))
    }

    fn check(&self, node_count: usize) -> Result<(), GraphError> {
        let invalid = |message: String| Err(GraphError::Invalid(message));

        if node_count < 2 {
            return invalid(format!("need at least 2 nodes, got {node_count}"));
        }
        match *self {
            RandomGraph::WattsStrogatz { k, p } => {
                if k < 2 || k % 2 != 0 || k >= node_count {
                    return invalid(format!("k must be even and in [2, {node_count}), got {k}"));
                }
                check_probability(p)
            }
            RandomGraph::ErdosRenyi { p } => check_probability(p),
            RandomGraph::BarabasiAlbert { m } => {
                if m < 1 || m >= node_count {
                    return invalid(format!("m must be in [1, {node_count}), got {m}"));
                }
                Ok(())
            }
        }
    }
}

fn check_probability(p: f64) -> Result<(), GraphError> {
    if (0.0..=1.0).contains(&p) {
        Ok(())
    } else {
        Err(GraphError::Invalid(format!("probability must be in [0, 1], got {p}")))
    }
}

fn edge(a: usize, b: usize) -> (usize, usize) {
    (a.min(b), a.max(b))
}

fn watts_strogatz<R: Rng>(n: usize, k: usize, p: f64, rng: &mut R) -> BTreeSet<(usize, usize)> {
    let mut edges = BTreeSet::new();
    for node in 0..n {
        for offset in 1..=k / 2 {
            edges.insert(edge(node, (node + offset) % n));
        }
    }

    for offset in 1..=k / 2 {
        for node in 0..n {
            let current = edge(node, (node + offset) % n);
            if !rng.gen_bool(p) || !edges.contains(&current) {
                continue;
            }

            let candidates: Vec<usize> = (0..n)
                .filter(|&other| other != node && !edges.contains(&edge(node, other)))
                .collect();
            if let Some(&target) = candidates.choose(rng) {
                edges.remove(&current);
                edges.insert(edge(node, target));
            }
        }
    }

    edges
}

fn erdos_renyi<R: Rng>(n: usize, p: f64, rng: &mut R) -> BTreeSet<(usize, usize)> {
    let mut edges = BTreeSet::new();
    for a in 0..n {
        for b in a + 1..n {
            if rng.gen_bool(p) {
                edges.insert((a, b));
            }
        }
    }
    edges
}

fn barabasi_albert<R: Rng>(n: usize, m: usize, rng: &mut R) -> BTreeSet<(usize, usize)> {
    let mut edges = BTreeSet::new();
    // every endpoint once per incident edge, so sampling is degree-proportional
    let mut repeated: Vec<usize> = vec![];
    let mut targets: Vec<usize> = (0..m).collect();

    for source in m..n {
        for &target in &targets {
            edges.insert(edge(source, target));
            repeated.push(source);
            repeated.push(target);
        }

        let mut next = BTreeSet::new();
        while next.len() < m {
            if let Some(&picked) = repeated.choose(rng) {
                next.insert(picked);
            }
        }
        targets = next.into_iter().collect();
    }

    edges
}
