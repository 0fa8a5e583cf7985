use burn::{nn::conv::Conv2d, prelude::*};
use nn::{conv::Conv2dConfig, PaddingConfig2d};

use super::conv2d_norm::conv_output_size;

/// Depthwise 3x3 convolution followed by a pointwise 1x1 convolution.
#[derive(Module, Debug)]
pub struct SeparableConv2d<B: Backend> {
    depthwise: Conv2d<B>,
    pointwise: Conv2d<B>,
}

impl<B: Backend> SeparableConv2d<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.depthwise.forward(x);
        self.pointwise.forward(x)
    }
}

#[derive(Config, Debug)]
pub struct SeparableConv2dConfig {
    pub channels: [usize; 2],

    #[config(default = 1)]
    pub stride: usize,
}

impl SeparableConv2dConfig {
    const KERNEL: usize = 3;

    pub fn init<B: Backend>(&self, device: &B::Device) -> SeparableConv2d<B> {
        let [input, output] = self.channels;

        SeparableConv2d {
            depthwise: Conv2dConfig::new([input, input], [Self::KERNEL, Self::KERNEL])
                .with_stride([self.stride, self.stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_groups(input)
                .with_bias(false)
                .init(device),
            pointwise: Conv2dConfig::new([input, output], [1, 1])
                .with_bias(false)
                .init(device),
        }
    }

    pub fn output_size(&self, size: [usize; 2]) -> [usize; 2] {
        size.map(|side| conv_output_size(side, Self::KERNEL, self.stride, 1))
    }

    pub fn flops(&self, size: [usize; 2]) -> u64 {
        let [input, output] = self.channels;
        let [h, w] = self.output_size(size);
        let depthwise = h * w * Self::KERNEL * Self::KERNEL * input;
        let pointwise = h * w * input * output;
        (depthwise + pointwise) as u64
    }
}
