use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu};
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleNetConfig {
    pub num_classes: usize,
    /// Output channels of the three convolution blocks.
    pub channels: [usize; 3],
    pub dropout: f64,
}

impl Default for StyleNetConfig {
    fn default() -> Self {
        Self {
            num_classes: 2,
            channels: [32, 64, 128],
            dropout: 0.5,
        }
    }
}

impl StyleNetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_classes < 2 {
            return Err(Error::Config("num_classes must be >= 2".to_string()));
        }
        if self.channels.contains(&0) {
            return Err(Error::Config("channels must be > 0".to_string()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Config("dropout must be within [0,1)".to_string()));
        }
        Ok(())
    }
}

/// Convolutional classifier mapping `[N, 3, H, W]` images to `[N, K]` logits.
#[derive(Module, Debug)]
pub struct StyleNet<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    pool: MaxPool2d,
    global_pool: AdaptiveAvgPool2d,
    dropout: Dropout,
    activation: Relu,
    head: Linear<B>,
}

impl<B: Backend> StyleNet<B> {
    pub fn new(config: &StyleNetConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let [c1, c2, c3] = config.channels;

        let conv = |input: usize, output: usize| -> Conv2d<B> {
            Conv2dConfig::new([input, output], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device)
        };

        Ok(Self {
            conv1: conv(3, c1),
            conv2: conv(c1, c2),
            conv3: conv(c2, c3),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout: DropoutConfig::new(config.dropout).init(),
            activation: Relu::new(),
            head: LinearConfig::new(c3, config.num_classes).init(device),
        })
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.pool.forward(self.activation.forward(self.conv1.forward(images)));
        let x = self.pool.forward(self.activation.forward(self.conv2.forward(x)));
        let x = self.activation.forward(self.conv3.forward(x));

        let x = self.global_pool.forward(x);
        let [batch, channels, _, _] = x.dims();
        let x = self.dropout.forward(x.reshape([batch, channels]));

        self.head.forward(x)
    }
}
