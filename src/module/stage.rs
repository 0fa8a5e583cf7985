use burn::{
    module::Param,
    prelude::*,
    tensor::activation::{relu, sigmoid},
};
use nn::{BatchNorm, BatchNormConfig};

use super::separable_conv::{SeparableConv2d, SeparableConv2dConfig};
use crate::graph::{GraphError, GraphInfo, NodeKind};

/// One graph node: weighted aggregation of its inputs, then ReLU-SepConv-BN.
#[derive(Module, Debug)]
pub struct NodeOp<B: Backend> {
    /// Aggregation weights, present when the node has more than one input.
    weights: Option<Param<Tensor<B, 1>>>,
    conv: SeparableConv2d<B>,
    norm: BatchNorm<B, 2>,
}

impl<B: Backend> NodeOp<B> {
    pub fn forward(&self, inputs: Vec<Tensor<B, 4>>) -> Tensor<B, 4> {
        let x = match &self.weights {
            Some(weights) => {
                let weights = sigmoid(weights.val());
                inputs
                    .into_iter()
                    .enumerate()
                    .map(|(i, input)| {
                        input * weights.clone().slice([i..i + 1]).reshape([1, 1, 1, 1])
                    })
                    .reduce(|acc, x| acc + x)
                    .expect("node has at least one input")
            }
            None => inputs
                .into_iter()
                .next()
                .expect("node has at least one input"),
        };

        let x = self.conv.forward(relu(x));
        self.norm.forward(x)
    }
}

#[derive(Module, Debug)]
pub struct RandWireStage<B: Backend> {
    nodes: Vec<NodeOp<B>>,
    /// Per node, the predecessors it aggregates. Input nodes read the stage input.
    wiring: Vec<Vec<usize>>,
    output_nodes: Vec<usize>,
}

impl<B: Backend> RandWireStage<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut results: Vec<Tensor<B, 4>> = Vec::with_capacity(self.nodes.len());

        for (node, inputs) in self.nodes.iter().zip(&self.wiring) {
            let inputs = if inputs.is_empty() {
                vec![x.clone()]
            } else {
                inputs.iter().map(|&input| results[input].clone()).collect()
            };
            results.push(node.forward(inputs));
        }

        let count = self.output_nodes.len();
        let sum = self
            .output_nodes
            .iter()
            .map(|&id| results[id].clone())
            .reduce(|acc, x| acc + x)
            .expect("stage has at least one output node");
        sum / count as f64
    }
}

#[derive(Config, Debug)]
pub struct RandWireStageConfig {
    pub channels: [usize; 2],
}

impl RandWireStageConfig {
    fn node_conv(&self, kind: NodeKind) -> SeparableConv2dConfig {
        let [input, output] = self.channels;
        match kind {
            NodeKind::Input => SeparableConv2dConfig::new([input, output]).with_stride(2),
            NodeKind::Inner | NodeKind::Output => SeparableConv2dConfig::new([output, output]),
        }
    }

    /// Validates `graph` so that every node has an input and the stage has an output.
    pub fn init<B: Backend>(
        &self,
        graph: &GraphInfo,
        device: &B::Device,
    ) -> Result<RandWireStage<B>, GraphError> {
        graph.validate()?;
        let output = self.channels[1];

        let nodes = graph
            .nodes
            .iter()
            .map(|node| NodeOp {
                weights: (node.inputs.len() > 1)
                    .then(|| Param::from_tensor(Tensor::ones([node.inputs.len()], device))),
                conv: self.node_conv(node.kind).init(device),
                norm: BatchNormConfig::new(output).init(device),
            })
            .collect();

        Ok(RandWireStage {
            nodes,
            wiring: graph.nodes.iter().map(|node| node.inputs.clone()).collect(),
            output_nodes: graph.output_nodes.clone(),
        })
    }

    pub fn output_size(&self, size: [usize; 2]) -> [usize; 2] {
        self.node_conv(NodeKind::Input).output_size(size)
    }

    pub fn flops(&self, graph: &GraphInfo, size: [usize; 2]) -> u64 {
        let reduced = self.output_size(size);
        graph
            .nodes
            .iter()
            .map(|node| match node.kind {
                NodeKind::Input => self.node_conv(node.kind).flops(size),
                _ => self.node_conv(node.kind).flops(reduced),
            })
            .sum()
    }
}
