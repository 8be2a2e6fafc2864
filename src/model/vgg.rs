//! VGG-style convolutional network
//!
//! `features` stacks convolutional stages (3x3 convolutions with ReLU, then a
//! 2x2 max pool) followed by an adaptive average pool. The classifier head is
//! three linear layers with ReLU and dropout between them, as in VGG-16.

use std::path::Path;

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{backend::Backend, Tensor},
};
use tracing::info;

use crate::model::{Classify, FeatureExtractor};
use crate::utils::error;

/// Named MessagePack records at f32, so a saved model reloads bit for bit
pub type WeightsRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Configuration for [`VggNet`]
#[derive(Config, Debug)]
pub struct VggConfig {
    /// `(convolutions, output channels)` of each stage
    pub stages: Vec<(usize, usize)>,

    #[config(default = "3")]
    pub in_channels: usize,

    /// Side of the adaptive average pool output
    #[config(default = "7")]
    pub pool_size: usize,

    #[config(default = "4096")]
    pub hidden_size: usize,

    #[config(default = "0.5")]
    pub dropout: f64,

    #[config(default = "1000")]
    pub num_classes: usize,
}

impl VggConfig {
    /// The VGG-16 layout with an ImageNet-sized head
    pub fn vgg16() -> Self {
        Self::new(vec![(2, 64), (2, 128), (3, 256), (3, 512), (3, 512)])
    }

    /// Channels produced by the last stage
    pub fn feature_channels(&self) -> usize {
        self.stages
            .last()
            .map(|&(_, channels)| channels)
            .unwrap_or(self.in_channels)
    }

    /// Length of a flattened feature vector
    pub fn feature_len(&self) -> usize {
        self.feature_channels() * self.pool_size * self.pool_size
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> VggNet<B> {
        let mut in_channels = self.in_channels;
        let features = self
            .stages
            .iter()
            .map(|&(convs, out_channels)| {
                let stage = ConvStage::new(in_channels, out_channels, convs, device);
                in_channels = out_channels;
                stage
            })
            .collect();

        VggNet {
            features,
            pool: AdaptiveAvgPool2dConfig::new([self.pool_size, self.pool_size]).init(),
            classifier: ClassifierHead::new(
                self.feature_len(),
                self.hidden_size,
                self.num_classes,
                self.dropout,
                device,
            ),
        }
    }
}

/// Convolutions sharing one output width, then a 2x2 max pool
#[derive(Module, Debug)]
pub struct ConvStage<B: Backend> {
    pub convs: Vec<Conv2d<B>>,
    relu: Relu,
    pool: MaxPool2d,
}

impl<B: Backend> ConvStage<B> {
    pub fn new(in_channels: usize, out_channels: usize, convs: usize, device: &B::Device) -> Self {
        let convs = (0..convs)
            .map(|i| {
                let input = if i == 0 { in_channels } else { out_channels };
                Conv2dConfig::new([input, out_channels], [3, 3])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device)
            })
            .collect();

        Self {
            convs,
            relu: Relu::new(),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self
            .convs
            .iter()
            .fold(x, |x, conv| self.relu.forward(conv.forward(x)));
        self.pool.forward(x)
    }
}

/// Fully connected classifier over flattened features
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    pub fc1: Linear<B>,
    pub fc2: Linear<B>,
    pub fc3: Linear<B>,
    relu: Relu,
    dropout: Dropout,
    hidden_size: usize,
    num_classes: usize,
}

impl<B: Backend> ClassifierHead<B> {
    pub fn new(
        in_features: usize,
        hidden_size: usize,
        num_classes: usize,
        dropout: f64,
        device: &B::Device,
    ) -> Self {
        Self {
            fc1: LinearConfig::new(in_features, hidden_size).init(device),
            fc2: LinearConfig::new(hidden_size, hidden_size).init(device),
            fc3: LinearConfig::new(hidden_size, num_classes).init(device),
            relu: Relu::new(),
            dropout: DropoutConfig::new(dropout).init(),
            hidden_size,
            num_classes,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Replace the output layer with a freshly initialized one
    pub fn with_num_classes(mut self, num_classes: usize, device: &B::Device) -> Self {
        self.fc3 = LinearConfig::new(self.hidden_size, num_classes).init(device);
        self.num_classes = num_classes;
        self
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.dropout.forward(self.relu.forward(self.fc1.forward(x)));
        let x = self.dropout.forward(self.relu.forward(self.fc2.forward(x)));
        self.fc3.forward(x)
    }
}

impl<B: Backend> Classify<B, 2> for ClassifierHead<B> {
    fn classify(&self, inputs: Tensor<B, 2>) -> Tensor<B, 2> {
        self.forward(inputs)
    }
}

/// VGG network: convolutional features plus classifier head
#[derive(Module, Debug)]
pub struct VggNet<B: Backend> {
    pub features: Vec<ConvStage<B>>,
    pub pool: AdaptiveAvgPool2d,
    pub classifier: ClassifierHead<B>,
}

impl<B: Backend> VggNet<B> {
    /// Run the backbone: `[batch, 3, H, W]` to `[batch, C, pool, pool]`
    pub fn features(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.features.iter().fold(x, |x, stage| stage.forward(x));
        self.pool.forward(x)
    }

    /// Class scores `[batch, num_classes]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x: Tensor<B, 2> = self.features(x).flatten(1, 3);
        self.classifier.forward(x)
    }

    pub fn num_classes(&self) -> usize {
        self.classifier.num_classes()
    }

    /// Load weights from a record written by [`VggNet::save`]
    pub fn load_pretrained<P: AsRef<Path>>(
        self,
        path: P,
        device: &B::Device,
    ) -> error::Result<Self> {
        let path = path.as_ref();
        let model = self.load_file(path.to_path_buf(), &WeightsRecorder::new(), device)?;
        info!("Loaded pretrained weights from {:?}", path);
        Ok(model)
    }

    /// Write the weights in full precision; the recorder adds the `.mpk` extension
    pub fn save<P: AsRef<Path>>(&self, path: P) -> error::Result<()> {
        self.clone()
            .save_file(path.as_ref().to_path_buf(), &WeightsRecorder::new())?;
        Ok(())
    }

    /// Swap in a new output layer for `num_classes` classes
    pub fn with_num_classes(mut self, num_classes: usize, device: &B::Device) -> Self {
        self.classifier = self.classifier.with_num_classes(num_classes, device);
        self
    }

    /// Stop gradients through the convolutional stages
    pub fn freeze_features(mut self) -> Self {
        self.features = self.features.into_iter().map(|stage| stage.no_grad()).collect();
        self
    }
}

impl<B: Backend> Classify<B, 4> for VggNet<B> {
    fn classify(&self, inputs: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward(inputs)
    }
}

impl<B: Backend> FeatureExtractor<B> for VggNet<B> {
    fn features(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        VggNet::features(self, images)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn::module::AutodiffModule;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    /// Two stages on 8x8 inputs, 8-wide hidden layers
    pub(crate) fn tiny_config(num_classes: usize) -> VggConfig {
        VggConfig::new(vec![(1, 4), (1, 8)])
            .with_pool_size(1)
            .with_hidden_size(8)
            .with_dropout(0.0)
            .with_num_classes(num_classes)
    }

    #[test]
    fn test_vgg16_layout() {
        let config = VggConfig::vgg16();
        assert_eq!(config.stages.len(), 5);
        assert_eq!(config.stages.iter().map(|s| s.0).sum::<usize>(), 13);
        assert_eq!(config.feature_len(), 512 * 7 * 7);
        assert_eq!(config.num_classes, 1000);
    }

    #[test]
    fn test_forward_shapes() {
        let device = Default::default();
        let model = tiny_config(3).init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 4>::zeros([2, 3, 8, 8], &device);

        assert_eq!(model.features(input.clone()).dims(), [2, 8, 1, 1]);
        assert_eq!(model.classify(input).dims(), [2, 3]);
    }

    #[test]
    fn test_head_on_flattened_features() {
        let device = Default::default();
        let model = tiny_config(2).init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 4>::ones([3, 3, 8, 8], &device);

        let direct = model.classify(input.clone());
        let flat: Tensor<TestBackend, 2> = model.features(input).flatten(1, 3);
        let via_head = model.classifier.classify(flat);

        let a = direct.into_data().convert::<f32>().to_vec::<f32>().unwrap();
        let b = via_head.into_data().convert::<f32>().to_vec::<f32>().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_with_num_classes() {
        let device = Default::default();
        let model = tiny_config(10)
            .init::<TestBackend>(&device)
            .with_num_classes(2, &device);

        assert_eq!(model.num_classes(), 2);
        let out = model.classify(Tensor::zeros([1, 3, 8, 8], &device));
        assert_eq!(out.dims(), [1, 2]);
    }

    #[test]
    fn test_save_and_load_pretrained() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tiny");
        let device = Default::default();

        let original = tiny_config(2).init::<TestBackend>(&device);
        original.save(&path).unwrap();

        let loaded = tiny_config(2)
            .init::<TestBackend>(&device)
            .load_pretrained(&path, &device)
            .unwrap();

        let input = Tensor::<TestBackend, 4>::ones([1, 3, 8, 8], &device);
        let a = original.classify(input.clone()).into_data().convert::<f32>().to_vec::<f32>().unwrap();
        let b = loaded.classify(input).into_data().convert::<f32>().to_vec::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_load_missing_record_fails() {
        let device = Default::default();
        let result = tiny_config(2)
            .init::<TestBackend>(&device)
            .load_pretrained("/nonexistent/record", &device);
        assert!(result.is_err());
    }

    #[test]
    fn test_frozen_features_get_no_gradients() {
        type AB = Autodiff<NdArray>;
        let device = Default::default();
        let model = tiny_config(2).init::<AB>(&device).freeze_features();

        let out = model.classify(Tensor::ones([1, 3, 8, 8], &device));
        let grads = out.sum().backward();

        let conv_weight = model.features[0].convs[0].weight.val();
        assert!(conv_weight.grad(&grads).is_none());
        assert!(model.classifier.fc3.weight.val().grad(&grads).is_some());

        // The inner model still evaluates
        let _ = model.valid().classify(Tensor::ones([1, 3, 8, 8], &device));
    }
}
