use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("failed to access graph file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("invalid graph: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Inner,
    Input,
    Output,
}

impl NodeKind {
    fn code(self) -> i32 {
        match self {
            NodeKind::Inner => -1,
            NodeKind::Input => 0,
            NodeKind::Output => 1,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(NodeKind::Inner),
            0 => Some(NodeKind::Input),
            1 => Some(NodeKind::Output),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: usize,
    pub kind: NodeKind,
    /// Predecessors, all with a smaller id.
    pub inputs: Vec<usize>,
}

/// Wiring of one random stage, nodes stored in topological order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphInfo {
    pub nodes: Vec<Node>,
    pub input_nodes: Vec<usize>,
    pub output_nodes: Vec<usize>,
}

impl GraphInfo {
    /// Orients an undirected graph from lower to higher ids.
    ///
    /// A node without lower neighbours becomes an input node, one without
    /// higher neighbours an output node. Isolated nodes are rejected.
    pub fn from_undirected(
        node_count: usize,
        edges: &[(usize, usize)],
    ) -> Result<Self, GraphError> {
        let mut neighbours = vec![Vec::new(); node_count];
        for &(a, b) in edges {
            if a >= node_count || b >= node_count {
                return Err(GraphError::Invalid(format!(
                    "edge ({a}, {b}) out of range for {node_count} nodes"
                )));
            }
            if a == b {
                return Err(GraphError::Invalid(format!("self loop on node {a}")));
            }
            neighbours[a].push(b);
            neighbours[b].push(a);
        }

        let mut nodes = Vec::with_capacity(node_count);
        let mut input_nodes = vec![];
        let mut output_nodes = vec![];

        for (id, adjacent) in neighbours.iter_mut().enumerate() {
            adjacent.sort_unstable();
            adjacent.dedup();

            let (Some(&first), Some(&last)) = (adjacent.first(), adjacent.last()) else {
                return Err(GraphError::Invalid(format!("node {id} is isolated")));
            };

            let kind = if id < first {
                input_nodes.push(id);
                NodeKind::Input
            } else if id > last {
                output_nodes.push(id);
                NodeKind::Output
            } else {
                NodeKind::Inner
            };

            nodes.push(Node {
                id,
                kind,
                inputs: adjacent.iter().copied().filter(|&n| n < id).collect(),
            });
        }

        let graph = GraphInfo {
            nodes,
            input_nodes,
            output_nodes,
        };
        graph.validate()?;
        Ok(graph)
    }

    pub fn parse(text: &str) -> Result<Self, GraphError> {
        let mut lines = text.lines().enumerate().map(|(i, line)| (i + 1, line.trim()));

        let (line_no, header) = lines.next().ok_or_else(|| GraphError::Parse {
            line: 1,
            message: "empty graph file".to_string(),
        })?;
        let node_count: usize = header.parse().map_err(|_| GraphError::Parse {
            line: line_no,
            message: format!("expected node count, found `{header}`"),
        })?;

        let mut nodes = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            let (line_no, line) = lines.next().ok_or_else(|| GraphError::Parse {
                line: nodes.len() + 2,
                message: format!("expected {node_count} node lines, found {}", nodes.len()),
            })?;
            let fields = parse_numbers::<i64>(line, line_no)?;

            let [id, kind, inputs @ ..] = fields.as_slice() else {
                return Err(GraphError::Parse {
                    line: line_no,
                    message: "node line needs an id and a kind".to_string(),
                });
            };
            let kind = i32::try_from(*kind)
                .ok()
                .and_then(NodeKind::from_code)
                .ok_or_else(|| GraphError::Parse {
                    line: line_no,
                    message: format!("unknown node kind {kind}"),
                })?;
            let id = to_index(*id, line_no)?;
            let inputs = inputs
                .iter()
                .map(|&input| to_index(input, line_no))
                .collect::<Result<Vec<_>, _>>()?;

            nodes.push(Node { id, kind, inputs });
        }

        let input_nodes = next_id_list(&mut lines, "input node list")?;
        let output_nodes = next_id_list(&mut lines, "output node list")?;

        let graph = GraphInfo {
            nodes,
            input_nodes,
            output_nodes,
        };
        graph.validate()?;
        Ok(graph)
    }

    pub fn validate(&self) -> Result<(), GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::Invalid("graph has no nodes".to_string()));
        }

        for (index, node) in self.nodes.iter().enumerate() {
            if node.id != index {
                return Err(GraphError::Invalid(format!(
                    "node at position {index} has id {}",
                    node.id
                )));
            }
            if let Some(&bad) = node.inputs.iter().find(|&&input| input >= node.id) {
                return Err(GraphError::Invalid(format!(
                    "node {} takes input from later node {bad}",
                    node.id
                )));
            }
            match (node.kind, node.inputs.is_empty()) {
                (NodeKind::Input, false) => {
                    return Err(GraphError::Invalid(format!("input node {} has inputs", node.id)))
                }
                (NodeKind::Inner | NodeKind::Output, true) => {
                    return Err(GraphError::Invalid(format!("node {} has no inputs", node.id)))
                }
                _ => {}
            }
        }

        let expected = |kind: NodeKind| -> Vec<usize> {
            self.nodes
                .iter()
                .filter(|node| node.kind == kind)
                .map(|node| node.id)
                .collect()
        };
        if self.input_nodes != expected(NodeKind::Input) {
            return Err(GraphError::Invalid(
                "input node list does not match node kinds".to_string(),
            ));
        }
        if self.output_nodes != expected(NodeKind::Output) {
            return Err(GraphError::Invalid(
                "output node list does not match node kinds".to_string(),
            ));
        }
        if self.output_nodes.is_empty() {
            return Err(GraphError::Invalid("graph has no output nodes".to_string()));
        }

        Ok(())
    }

    pub fn to_text(&self) -> String {
        let mut text = String::new();
        let join = |ids: &[usize]| {
            ids.iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        };

        // writing to a String cannot fail
        let _ = writeln!(text, "{}", self.nodes.len());
        for node in &self.nodes {
            let _ = write!(text, "{} {}", node.id, node.kind.code());
            for input in &node.inputs {
                let _ = write!(text, " {input}");
            }
            text.push('\n');
        }
        let _ = writeln!(text, "{}", join(&self.input_nodes));
        let _ = writeln!(text, "{}", join(&self.output_nodes));

        text
    }

    pub fn edge_count(&self) -> usize {
        self.nodes.iter().map(|node| node.inputs.len()).sum()
    }
}

fn parse_numbers<T: std::str::FromStr>(line: &str, line_no: usize) -> Result<Vec<T>, GraphError> {
    line.split_whitespace()
        .map(|token| {
            token.parse().map_err(|_| GraphError::Parse {
                line: line_no,
                message: format!("`{token}` is not a number"),
            })
        })
        .collect()
}

fn to_index(value: i64, line_no: usize) -> Result<usize, GraphError> {
    usize::try_from(value).map_err(|_| GraphError::Parse {
        line: line_no,
        message: format!("negative node id {value}"),
    })
}

fn next_id_list<'a>(
    lines: &mut impl Iterator<Item = (usize, &'a str)>,
    what: &str,
) -> Result<Vec<usize>, GraphError> {
    match lines.next() {
        Some((line_no, line)) => parse_numbers(line, line_no),
        None => Err(GraphError::Invalid(format!("missing {what}"))),
    }
}

pub fn read_graph_info(path: impl AsRef<Path>) -> Result<GraphInfo, GraphError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| GraphError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    GraphInfo::parse(&text)
}

pub fn write_graph_info(graph: &GraphInfo, path: impl AsRef<Path>) -> Result<(), GraphError> {
    let path = path.as_ref();
    fs::write(path, graph.to_text()).map_err(|source| GraphError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Stage indices wired by random graphs in each regime.
pub fn stage_indices(small_regime: bool) -> &'static [usize] {
    if small_regime {
        &[3, 4, 5]
    } else {
        &[2, 3, 4, 5]
    }
}

pub fn graph_files(prefix: &str, small_regime: bool) -> Vec<PathBuf> {
    stage_indices(small_regime)
        .iter()
        .map(|stage| PathBuf::from(format!("{prefix}{stage}.txt")))
        .collect()
}
