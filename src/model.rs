use anyhow::{anyhow, ensure, Context, Result};
use burn::{
    prelude::*,
    record::CompactRecorder,
    tensor::activation::relu,
};
use nn::{
    loss::CrossEntropyLossConfig,
    pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
    Linear, LinearConfig,
};
use std::path::Path;

use crate::{
    data::ImageBatch,
    graph::{stage_indices, GraphInfo},
    module::{
        conv2d_norm::{Conv2dNorm, Conv2dNormConfig},
        stage::{RandWireStage, RandWireStageConfig},
    },
};

#[derive(Module, Debug)]
struct Classifier<B: Backend> {
    conv: Conv2dNorm<B>,
    avg_pool: AdaptiveAvgPool2d,
    linear: Linear<B>,
}

impl<B: Backend> Classifier<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = relu(self.conv.forward(x));
        let x = self.avg_pool.forward(x);
        let x = x.flatten(1, 3);
        self.linear.forward(x)
    }
}

#[derive(Module, Debug)]
enum Block<B: Backend> {
    Conv(Conv2dNorm<B>),
    Stage(RandWireStage<B>),
}

impl<B: Backend> Block<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Block::Conv(conv2d_norm) => conv2d_norm.forward(x),
            Block::Stage(stage) => stage.forward(x),
        }
    }
}

/// Randomly wired network: a convolutional stem, one random stage per graph,
/// and a 1x1 conv classifier head.
#[derive(Module, Debug)]
pub struct RandWire<B: Backend> {
    blocks: Vec<Block<B>>,
    classifier: Classifier<B>,
}

/// Loss and logits of one evaluated batch.
pub struct EvalOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub logits: Tensor<B, 2>,
}

impl<B: Backend> RandWire<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.blocks.iter().fold(x, |x, block| block.forward(x));
        self.classifier.forward(x)
    }

    pub fn forward_classification(&self, batch: ImageBatch<B>) -> EvalOutput<B> {
        let logits = self.forward(batch.images);

        let loss = CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits.clone(), batch.targets);

        EvalOutput { loss, logits }
    }

    /// Parameter count in millions, the way it is usually reported.
    pub fn param_size_mb(&self) -> f64 {
        self.num_params() as f64 / 1e6
    }

    pub fn load_checkpoint(self, path: &Path, device: &B::Device) -> Result<Self> {
        self.load_file(path.to_path_buf(), &CompactRecorder::new(), device)
            .map_err(|err| anyhow!("{err:?}"))
            .with_context(|| format!("failed to load checkpoint {}", path.display()))
    }
}

#[derive(Config, Debug)]
pub struct RandWireConfig {
    pub base_channels: usize,

    pub num_classes: usize,

    #[config(default = 1280)]
    pub output_channels: usize,

    #[config(default = true)]
    pub small_regime: bool,
}

enum Layer {
    Conv(Conv2dNormConfig),
    Stage(RandWireStageConfig),
}

impl RandWireConfig {
    /// Stem and stage layout; stages consume the graphs in order.
    fn layers(&self) -> Vec<Layer> {
        let c = self.base_channels;
        let stem = Conv2dNormConfig::new([3, c / 2], [3, 3], [2, 2], [1, 1]);

        if self.small_regime {
            vec![
                Layer::Conv(stem),
                Layer::Conv(
                    Conv2dNormConfig::new([c / 2, c], [3, 3], [2, 2], [1, 1])
                        .with_pre_activation(true),
                ),
                Layer::Stage(RandWireStageConfig::new([c, c])),
                Layer::Stage(RandWireStageConfig::new([c, 2 * c])),
                Layer::Stage(RandWireStageConfig::new([2 * c, 4 * c])),
            ]
        } else {
            vec![
                Layer::Conv(stem),
                Layer::Stage(RandWireStageConfig::new([c / 2, c])),
                Layer::Stage(RandWireStageConfig::new([c, 2 * c])),
                Layer::Stage(RandWireStageConfig::new([2 * c, 4 * c])),
                Layer::Stage(RandWireStageConfig::new([4 * c, 8 * c])),
            ]
        }
    }

    fn head(&self) -> Conv2dNormConfig {
        let last = if self.small_regime { 4 } else { 8 } * self.base_channels;
        Conv2dNormConfig::new([last, self.output_channels], [1, 1], [1, 1], [0, 0])
            .with_pre_activation(true)
    }

    fn check(&self, graphs: &[GraphInfo]) -> Result<()> {
        ensure!(self.base_channels >= 2, "base channels must be at least 2");
        ensure!(self.num_classes > 0, "model needs at least one class");

        let expected = stage_indices(self.small_regime).len();
        ensure!(
            graphs.len() == expected,
            "{} regime needs {expected} stage graphs, got {}",
            if self.small_regime { "small" } else { "regular" },
            graphs.len()
        );
        for graph in graphs {
            graph.validate()?;
        }
        Ok(())
    }

    pub fn init<B: Backend>(
        &self,
        graphs: &[GraphInfo],
        device: &B::Device,
    ) -> Result<RandWire<B>> {
        self.check(graphs)?;

        let mut graphs = graphs.iter();
        let mut blocks = vec![];
        for layer in self.layers() {
            blocks.push(match layer {
                Layer::Conv(config) => Block::Conv(config.init(device)),
                Layer::Stage(config) => {
                    let graph = graphs.next().context("missing stage graph")?;
                    Block::Stage(config.init(graph, device)?)
                }
            });
        }

        let classifier = Classifier {
            conv: self.head().init(device),
            avg_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            linear: LinearConfig::new(self.output_channels, self.num_classes).init(device),
        };

        Ok(RandWire { blocks, classifier })
    }

    /// Multiplications for one square image, ignoring batch norm, activations and pooling.
    pub fn flops(&self, graphs: &[GraphInfo], image_size: usize) -> Result<u64> {
        self.check(graphs)?;

        let mut graphs = graphs.iter();
        let mut size = [image_size, image_size];
        let mut total = 0;

        for layer in self.layers() {
            match layer {
                Layer::Conv(config) => {
                    total += config.flops(size);
                    size = config.output_size(size);
                }
                Layer::Stage(config) => {
                    let graph = graphs.next().context("missing stage graph")?;
                    total += config.flops(graph, size);
                    size = config.output_size(size);
                }
            }
        }

        total += self.head().flops(size);
        total += (self.output_channels * self.num_classes) as u64;

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    fn chain(len: usize) -> GraphInfo {
        let edges: Vec<_> = (1..len).map(|i| (i - 1, i)).collect();
        GraphInfo::from_undirected(len, &edges).unwrap()
    }

    #[test]
    fn test_small_regime_forward() {
        let device = Default::default();
        let graphs = vec![chain(3); 3];
        let config = RandWireConfig::new(4, 10).with_output_channels(16);
        let model = config.init::<NdArray>(&graphs, &device).unwrap();

        let x = Tensor::<NdArray, 4>::zeros([2, 3, 32, 32], &device);
        assert_eq!(model.forward(x).dims(), [2, 10]);
    }

    #[test]
    fn test_regular_regime_forward() {
        let device = Default::default();
        let graphs = vec![chain(2); 4];
        let config = RandWireConfig::new(4, 5)
            .with_output_channels(8)
            .with_small_regime(false);
        let model = config.init::<NdArray>(&graphs, &device).unwrap();

        let x = Tensor::<NdArray, 4>::zeros([1, 3, 32, 32], &device);
        assert_eq!(model.forward(x).dims(), [1, 5]);
    }

    #[test]
    fn test_graph_count_must_match_regime() {
        let device = Default::default();
        let config = RandWireConfig::new(4, 10);

        assert!(config.init::<NdArray>(&vec![chain(3); 4], &device).is_err());
        assert!(config.flops(&vec![chain(3); 2], 224).is_err());
    }

    #[test]
    fn test_flops_grow_with_channels() {
        let graphs = vec![chain(4); 3];
        let narrow = RandWireConfig::new(8, 10).flops(&graphs, 224).unwrap();
        let wide = RandWireConfig::new(16, 10).flops(&graphs, 224).unwrap();

        assert!(narrow > 0);
        assert!(wide > narrow);
    }

    #[test]
    fn test_loss_on_batch() {
        let device = Default::default();
        let graphs = vec![chain(2); 3];
        let model = RandWireConfig::new(4, 3)
            .with_output_channels(8)
            .init::<NdArray>(&graphs, &device)
            .unwrap();

        let batch = ImageBatch {
            images: Tensor::zeros([2, 3, 16, 16], &device),
            targets: Tensor::from_ints([0, 2], &device),
            labels: vec![0, 2],
        };
        let output = model.forward_classification(batch);

        assert_eq!(output.logits.dims(), [2, 3]);
        assert!(output.loss.into_scalar() > 0.0);
    }

    fn max_difference(a: Tensor<NdArray, 2>, b: Tensor<NdArray, 2>) -> f32 {
        (a - b).abs().max().into_scalar()
    }

    #[test]
    fn test_checkpoint_restores_weights() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model");
        let graphs = vec![chain(3); 3];
        let config = RandWireConfig::new(4, 6).with_output_channels(8);

        let saved = config.init::<NdArray>(&graphs, &device).unwrap();
        saved
            .clone()
            .save_file(path.clone(), &CompactRecorder::new())
            .unwrap();

        let fresh = config.init::<NdArray>(&graphs, &device).unwrap();
        let loaded = config
            .init::<NdArray>(&graphs, &device)
            .unwrap()
            .load_checkpoint(&path, &device)
            .unwrap();

        let x = Tensor::<NdArray, 4>::ones([2, 3, 16, 16], &device);
        let expected = saved.forward(x.clone());

        // the compact recorder stores half precision
        assert!(max_difference(loaded.forward(x.clone()), expected.clone()) < 1e-3);
        assert!(max_difference(fresh.forward(x), expected) > 1e-3);
    }

    #[test]
    fn test_checkpoint_missing_file() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let model = RandWireConfig::new(4, 6)
            .with_output_channels(8)
            .init::<NdArray>(&vec![chain(3); 3], &device)
            .unwrap();

        let err = model
            .load_checkpoint(&dir.path().join("absent"), &device)
            .unwrap_err();
        assert!(format!("{err:#}").contains("failed to load checkpoint"));
    }
}
