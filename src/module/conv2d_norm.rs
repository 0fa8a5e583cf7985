use burn::{module::Module, nn::conv::Conv2d, prelude::*, tensor::activation::relu};
use nn::{conv::Conv2dConfig, BatchNorm, BatchNormConfig, PaddingConfig2d};

/// Plain convolution followed by batch norm, optionally preceded by a ReLU.
#[derive(Module, Debug)]
pub struct Conv2dNorm<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    pre_activation: bool,
}

impl<B: Backend> Conv2dNorm<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = if self.pre_activation { relu(x) } else { x };
        let x = self.conv.forward(x);

        self.norm.forward(x)
    }
}

#[derive(Config, Debug)]
pub struct Conv2dNormConfig {
    pub channels: [usize; 2],

    pub kernel_size: [usize; 2],

    pub stride: [usize; 2],

    pub padding: [usize; 2],

    #[config(default = false)]
    pub pre_activation: bool,
}

impl Conv2dNormConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Conv2dNorm<B> {
        Conv2dNorm {
            conv: Conv2dConfig::new(self.channels, self.kernel_size)
                .with_stride(self.stride)
                .with_padding(PaddingConfig2d::Explicit(self.padding[0], self.padding[1]))
                .with_bias(false)
                .init(device),
            norm: BatchNormConfig::new(self.channels[1]).init(device),
            pre_activation: self.pre_activation,
        }
    }

    pub fn output_size(&self, size: [usize; 2]) -> [usize; 2] {
        [0, 1].map(|i| {
            conv_output_size(size[i], self.kernel_size[i], self.stride[i], self.padding[i])
        })
    }

    /// Multiplications needed for an input of `size`.
    pub fn flops(&self, size: [usize; 2]) -> u64 {
        let [h, w] = self.output_size(size);
        let [kh, kw] = self.kernel_size;
        (h * w * kh * kw * self.channels[0] * self.channels[1]) as u64
    }
}

pub fn conv_output_size(size: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    (size + 2 * padding).saturating_sub(kernel) / stride + 1
}
