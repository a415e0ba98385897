use crate::data::ClassificationBatch;
use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
    tensor::{activation::softmax, backend::AutodiffBackend},
    train::{ClassificationOutput, TrainOutput, TrainStep, ValidStep},
};
use thiserror::Error;

const KERNEL_SIZE: usize = 3;
const POOL_SIZE: usize = 2;

/// Error type for [model](Model) construction.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ModelError {
    /// The input collapses to an empty feature map before the dense layers.
    #[error("Input {height}x{width} is too small for two convolution and pooling stages")]
    InputTooSmall { height: usize, width: usize },

    /// The output layer needs at least one class.
    #[error("The model needs at least one class")]
    NoClasses,
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    pub num_classes: usize,
    pub height: usize,
    pub width: usize,
    #[config(default = 32)]
    pub conv1_channels: usize,
    #[config(default = 64)]
    pub conv2_channels: usize,
    #[config(default = 256)]
    pub hidden_size: usize,
    #[config(default = 0.5)]
    pub dropout: f64,
}

/// Side length after one valid 3x3 convolution followed by a 2x2 pooling.
fn reduce(size: usize) -> Option<usize> {
    let convolved = size.checked_sub(KERNEL_SIZE - 1)?;
    let pooled = convolved / POOL_SIZE;
    (pooled > 0).then_some(pooled)
}

impl ModelConfig {
    /// Spatial size `[height, width]` of the last feature map.
    pub fn feature_map_size(&self) -> Result<[usize; 2], ModelError> {
        let too_small = || ModelError::InputTooSmall {
            height: self.height,
            width: self.width,
        };

        let height = reduce(self.height).and_then(reduce).ok_or_else(too_small)?;
        let width = reduce(self.width).and_then(reduce).ok_or_else(too_small)?;

        Ok([height, width])
    }

    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Model<B>, ModelError> {
        if self.num_classes == 0 {
            return Err(ModelError::NoClasses);
        }
        let [height, width] = self.feature_map_size()?;
        let flattened = self.conv2_channels * height * width;

        let conv = |channels: [usize; 2]| -> Conv2d<B> {
            Conv2dConfig::new(channels, [KERNEL_SIZE, KERNEL_SIZE])
                .with_padding(PaddingConfig2d::Valid)
                .init(device)
        };

        Ok(Model {
            conv1: conv([3, self.conv1_channels]),
            conv2: conv([self.conv1_channels, self.conv2_channels]),
            pool: MaxPool2dConfig::new([POOL_SIZE, POOL_SIZE])
                .with_strides([POOL_SIZE, POOL_SIZE])
                .with_padding(PaddingConfig2d::Valid)
                .init(),
            hidden: LinearConfig::new(flattened, self.hidden_size).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            output: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            activation: Relu::new(),
        })
    }
}

/// Two convolution and pooling stages followed by two dense layers.
#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    pool: MaxPool2d,
    hidden: Linear<B>,
    dropout: Dropout,
    output: Linear<B>,
    activation: Relu,
}

impl<B: Backend> Model<B> {
    /// # Shapes
    ///   - Images [batch_size, 3, height, width]
    ///   - Output [batch_size, num_classes]
    ///
    /// The output holds unnormalized logits; see [infer](Model::infer) for probabilities.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.conv1.forward(images);
        let x = self.activation.forward(x);
        let x = self.pool.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool.forward(x);

        let x: Tensor<B, 2> = x.flatten(1, 3);

        let x = self.hidden.forward(x);
        let x = self.activation.forward(x);
        let x = self.dropout.forward(x);

        self.output.forward(x)
    }

    /// Class probabilities: the softmax of [forward](Model::forward).
    pub fn infer(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// Cross-entropy on the logits against integer class targets.
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

impl<B: AutodiffBackend> TrainStep<ClassificationBatch<B>, ClassificationOutput<B>> for Model<B> {
    fn step(&self, batch: ClassificationBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch.images, batch.targets);

        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<ClassificationBatch<B>, ClassificationOutput<B>> for Model<B> {
    fn step(&self, batch: ClassificationBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets)
    }
}
