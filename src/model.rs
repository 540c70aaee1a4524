//! The convolutional classifier
//!
//! Three conv → batch-norm → ReLU → max-pool blocks with growing channel
//! width, then Flatten, Linear → ReLU → Linear and a column-wise softmax:
//!
//! ```text
//! (N, 3, 32, 32) ─ block1 ─> (N, 16, 16, 16) ─ block2 ─> (N, 32, 8, 8)
//!                ─ block3 ─> (N, 64, 4, 4) ─ flatten ─> (1024, N)
//!                ─ fc1 + relu ─> (512, N) ─ fc2 + softmax ─> (10, N)
//! ```
//!
//! The model owns every parameter. The optimizer is handed named mutable
//! views for the duration of an update and keeps only its velocity buffers.

use crate::config::{ModelConfig, CONV_BLOCKS};
use crate::error::{NetworkError, Result};
use crate::layers::{BatchNorm2D, Conv2DLayer, Flatten, Layer, LinearLayer, MaxPool2D};
use crate::losses::{CrossEntropyLoss, L2RegularizationLoss};
use crate::optimizers::{MomentumSgd, Optimizer};
use crate::utils::{relu, relu_backward, softmax_columns, ChannelStats};
use ndarray::{Array2, Array4, ArrayD, ArrayViewD, ArrayViewMutD};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fmt;

/// Name of every learnable parameter of [`Cnn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamName {
    Conv1W,
    Conv1B,
    Bn1Gamma,
    Bn1Beta,
    Conv2W,
    Conv2B,
    Bn2Gamma,
    Bn2Beta,
    Conv3W,
    Conv3B,
    Bn3Gamma,
    Bn3Beta,
    Fc1W,
    Fc1B,
    Fc2W,
    Fc2B,
}

// Conv weight, conv bias, bn gamma, bn beta of each block
const BLOCK_PARAMS: [[ParamName; 4]; CONV_BLOCKS] = [
    [ParamName::Conv1W, ParamName::Conv1B, ParamName::Bn1Gamma, ParamName::Bn1Beta],
    [ParamName::Conv2W, ParamName::Conv2B, ParamName::Bn2Gamma, ParamName::Bn2Beta],
    [ParamName::Conv3W, ParamName::Conv3B, ParamName::Bn3Gamma, ParamName::Bn3Beta],
];

impl ParamName {
    /// All parameters in registration order.
    pub const ALL: [ParamName; 16] = [
        ParamName::Conv1W,
        ParamName::Conv1B,
        ParamName::Bn1Gamma,
        ParamName::Bn1Beta,
        ParamName::Conv2W,
        ParamName::Conv2B,
        ParamName::Bn2Gamma,
        ParamName::Bn2Beta,
        ParamName::Conv3W,
        ParamName::Conv3B,
        ParamName::Bn3Gamma,
        ParamName::Bn3Beta,
        ParamName::Fc1W,
        ParamName::Fc1B,
        ParamName::Fc2W,
        ParamName::Fc2B,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ParamName::Conv1W => "conv1_w",
            ParamName::Conv1B => "conv1_b",
            ParamName::Bn1Gamma => "bn1_gamma",
            ParamName::Bn1Beta => "bn1_beta",
            ParamName::Conv2W => "conv2_w",
            ParamName::Conv2B => "conv2_b",
            ParamName::Bn2Gamma => "bn2_gamma",
            ParamName::Bn2Beta => "bn2_beta",
            ParamName::Conv3W => "conv3_w",
            ParamName::Conv3B => "conv3_b",
            ParamName::Bn3Gamma => "bn3_gamma",
            ParamName::Bn3Beta => "bn3_beta",
            ParamName::Fc1W => "fc1_w",
            ParamName::Fc1B => "fc1_b",
            ParamName::Fc2W => "fc2_w",
            ParamName::Fc2B => "fc2_b",
        }
    }

    /// True for convolution and linear weights, the only L2-penalized tensors.
    pub fn is_regularized(self) -> bool {
        matches!(
            self,
            ParamName::Conv1W
                | ParamName::Conv2W
                | ParamName::Conv3W
                | ParamName::Fc1W
                | ParamName::Fc2W
        )
    }
}

impl fmt::Display for ParamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gradient of the loss for each parameter, keyed by name.
pub type Gradients = BTreeMap<ParamName, ArrayD<f32>>;

/// Outputs of every stage of one conv block.
#[derive(Debug, Clone)]
pub struct BlockActivations {
    pub conv: Array4<f32>,
    pub normalized: Array4<f32>,
    /// Post-ReLU values; their sign is the ReLU backward mask
    pub relu: Array4<f32>,
    pub pooled: Array4<f32>,
}

/// Intermediate values recorded by one forward pass.
#[derive(Debug, Clone)]
pub struct Activations {
    /// Input after per-batch channel normalization
    pub input: Array4<f32>,
    pub blocks: [BlockActivations; CONV_BLOCKS],
    /// (features, batch)
    pub flatten: Array2<f32>,
    pub fc1: Array2<f32>,
    pub relu4: Array2<f32>,
    pub logits: Array2<f32>,
    pub probs: Array2<f32>,
    training: bool,
}

impl Activations {
    /// Whether the recording forward pass ran in training mode.
    pub fn training(&self) -> bool {
        self.training
    }
}

/// Convolution, batch normalization, ReLU and max pooling.
#[derive(Debug, Clone)]
pub struct ConvBlock {
    conv: Conv2DLayer,
    bn: BatchNorm2D,
    pool: MaxPool2D,
    names: [ParamName; 4],
}

impl ConvBlock {
    fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        config: &ModelConfig,
        names: [ParamName; 4],
        rng: &mut R,
    ) -> Result<Self> {
        Ok(Self {
            conv: Conv2DLayer::new(
                in_channels,
                out_channels,
                config.kernel_size,
                config.padding,
                rng,
            )?,
            bn: BatchNorm2D::new(out_channels, config.bn_epsilon, config.bn_momentum)?,
            pool: MaxPool2D::new(config.pool_size, config.pool_size)?,
            names,
        })
    }

    pub fn conv(&self) -> &Conv2DLayer {
        &self.conv
    }

    pub fn bn(&self) -> &BatchNorm2D {
        &self.bn
    }

    pub fn pool(&self) -> &MaxPool2D {
        &self.pool
    }

    fn forward(&mut self, input: &Array4<f32>, training: bool) -> Result<BlockActivations> {
        self.bn.set_training(training);
        let conv = self.conv.forward(input)?;
        let normalized = self.bn.forward(&conv)?;
        let relu = relu(&normalized);
        let pooled = self.pool.forward(&relu)?;
        Ok(BlockActivations {
            conv,
            normalized,
            relu,
            pooled,
        })
    }

    fn backward(
        &mut self,
        grad_output: &Array4<f32>,
        activations: &BlockActivations,
        grads: &mut Gradients,
    ) -> Result<Array4<f32>> {
        let grad = self.pool.backward(grad_output)?;
        let grad = relu_backward(&grad, &activations.relu)?;
        let (grad, grad_gamma, grad_beta) = self.bn.backward_full(&grad)?;
        let grad = self.conv.backward(&grad)?;

        let [w, b, gamma, beta] = self.names;
        let missing = || NetworkError::StaleCache("conv2d gradients missing after backward");
        let grad_weights = self.conv.grad_weights().ok_or_else(missing)?;
        let grad_biases = self.conv.grad_biases().ok_or_else(missing)?;
        grads.insert(w, grad_weights.clone().into_dyn());
        grads.insert(b, grad_biases.clone().into_dyn());
        grads.insert(gamma, grad_gamma.into_dyn());
        grads.insert(beta, grad_beta.into_dyn());
        Ok(grad)
    }

    fn parameters(&self) -> Vec<(ParamName, ArrayViewD<'_, f32>)> {
        let views = self.conv.parameters().into_iter().chain(self.bn.parameters());
        self.names.into_iter().zip(views).collect()
    }

    fn parameters_mut(&mut self) -> Vec<(ParamName, ArrayViewMutD<'_, f32>)> {
        let views = self
            .conv
            .parameters_mut()
            .into_iter()
            .chain(self.bn.parameters_mut());
        self.names.into_iter().zip(views).collect()
    }
}

fn named_parameters<'a>(
    blocks: &'a [ConvBlock; CONV_BLOCKS],
    fc1: &'a LinearLayer,
    fc2: &'a LinearLayer,
) -> Vec<(ParamName, ArrayViewD<'a, f32>)> {
    let mut params = Vec::with_capacity(ParamName::ALL.len());
    for block in blocks {
        params.extend(block.parameters());
    }
    params.extend([ParamName::Fc1W, ParamName::Fc1B].into_iter().zip(fc1.parameters()));
    params.extend([ParamName::Fc2W, ParamName::Fc2B].into_iter().zip(fc2.parameters()));
    params
}

fn named_parameters_mut<'a>(
    blocks: &'a mut [ConvBlock; CONV_BLOCKS],
    fc1: &'a mut LinearLayer,
    fc2: &'a mut LinearLayer,
) -> Vec<(ParamName, ArrayViewMutD<'a, f32>)> {
    let mut params = Vec::with_capacity(ParamName::ALL.len());
    for block in blocks.iter_mut() {
        params.extend(block.parameters_mut());
    }
    params.extend(
        [ParamName::Fc1W, ParamName::Fc1B]
            .into_iter()
            .zip(fc1.parameters_mut()),
    );
    params.extend(
        [ParamName::Fc2W, ParamName::Fc2B]
            .into_iter()
            .zip(fc2.parameters_mut()),
    );
    params
}

/// Three-block CNN with a two-layer classifier head.
///
/// One training step is `forward(x, true)` → `compute_loss` (optional) →
/// `backward(y)` → `update_parameters`. `backward` consumes the activations of
/// the preceding forward pass, so calling it twice is a `StaleCache` error.
///
/// # Example
///
/// ```
/// use cnn_sgd::config::ModelConfig;
/// use cnn_sgd::Cnn;
/// use ndarray::Array4;
///
/// let config = ModelConfig {
///     image_size: 8,
///     conv_channels: [4, 4, 4],
///     hidden_units: 8,
///     num_classes: 2,
///     seed: Some(1),
///     ..ModelConfig::default()
/// };
/// let mut model = Cnn::new(&config).unwrap();
/// let x = Array4::from_shape_fn((2, 3, 8, 8), |(b, c, i, j)| (b + c + i * j) as f32);
/// let probs = model.forward(&x, false).unwrap();
/// assert_eq!(probs.dim(), (2, 2));
/// ```
#[derive(Debug, Clone)]
pub struct Cnn {
    config: ModelConfig,
    blocks: [ConvBlock; CONV_BLOCKS],
    flatten: Flatten,
    fc1: LinearLayer,
    fc2: LinearLayer,
    cross_entropy: CrossEntropyLoss,
    l2: L2RegularizationLoss,
    optimizer: MomentumSgd<ParamName>,
    activations: Option<Activations>,
}

impl Cnn {
    /// Builds the network with He-initialized weights and registers every
    /// parameter with the optimizer.
    pub fn new(config: &ModelConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let [c1, c2, c3] = config.conv_channels;
        let blocks = [
            ConvBlock::new(config.in_channels, c1, config, BLOCK_PARAMS[0], &mut rng)?,
            ConvBlock::new(c1, c2, config, BLOCK_PARAMS[1], &mut rng)?,
            ConvBlock::new(c2, c3, config, BLOCK_PARAMS[2], &mut rng)?,
        ];
        let fc1 = LinearLayer::new(config.flattened_features()?, config.hidden_units, &mut rng)?;
        let fc2 = LinearLayer::new(config.hidden_units, config.num_classes, &mut rng)?;

        let mut optimizer = MomentumSgd::new(config.momentum);
        optimizer.initialize(&named_parameters(&blocks, &fc1, &fc2))?;

        let model = Self {
            config: config.clone(),
            blocks,
            flatten: Flatten::new(),
            fc1,
            fc2,
            cross_entropy: CrossEntropyLoss::default(),
            l2: L2RegularizationLoss::new(),
            optimizer,
            activations: None,
        };
        log::info!(
            "built cnn: conv channels {:?}, hidden {}, classes {}, {} parameters",
            config.conv_channels,
            config.hidden_units,
            config.num_classes,
            model.parameter_count()
        );
        Ok(model)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn blocks(&self) -> &[ConvBlock] {
        &self.blocks
    }

    pub fn fc1(&self) -> &LinearLayer {
        &self.fc1
    }

    pub fn fc2(&self) -> &LinearLayer {
        &self.fc2
    }

    pub fn optimizer(&self) -> &MomentumSgd<ParamName> {
        &self.optimizer
    }

    /// Activations recorded by the last forward pass, until `backward` consumes them.
    pub fn activations(&self) -> Option<&Activations> {
        self.activations.as_ref()
    }

    /// Named views of every parameter, in registration order.
    pub fn parameters(&self) -> Vec<(ParamName, ArrayViewD<'_, f32>)> {
        named_parameters(&self.blocks, &self.fc1, &self.fc2)
    }

    /// Named mutable views of every parameter, in registration order.
    pub fn parameters_mut(&mut self) -> Vec<(ParamName, ArrayViewMutD<'_, f32>)> {
        named_parameters_mut(&mut self.blocks, &mut self.fc1, &mut self.fc2)
    }

    /// The three convolution filter banks, (out, in, k, k) each.
    pub fn conv_weights(&self) -> [&Array4<f32>; CONV_BLOCKS] {
        let [b1, b2, b3] = &self.blocks;
        [b1.conv.weights(), b2.conv.weights(), b3.conv.weights()]
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|(_, p)| p.len()).sum()
    }

    /// Forward pass over a (batch, C, H, W) image batch.
    ///
    /// The batch is first normalized with its own per-channel mean and std.
    /// With `training` the batch-norm layers use batch statistics and update
    /// their running statistics; otherwise they use the running statistics.
    /// Returns the (classes, batch) softmax probabilities.
    pub fn forward(&mut self, x: &Array4<f32>, training: bool) -> Result<Array2<f32>> {
        let (n, c, h, w) = x.dim();
        let size = self.config.image_size;
        if (c, h, w) != (self.config.in_channels, size, size) {
            return Err(NetworkError::shape(
                "model input",
                &[n, self.config.in_channels, size, size],
                x.shape(),
            ));
        }

        let input = ChannelStats::from_batch(x)?.normalize(x)?;

        let [b1, b2, b3] = &mut self.blocks;
        let a1 = b1.forward(&input, training)?;
        let a2 = b2.forward(&a1.pooled, training)?;
        let a3 = b3.forward(&a2.pooled, training)?;

        let flatten = self.flatten.forward(&a3.pooled)?;
        let fc1 = self.fc1.forward(&flatten)?;
        let relu4 = relu(&fc1);
        let logits = self.fc2.forward(&relu4)?;
        let probs = softmax_columns(&logits);
        if probs.iter().any(|p| !p.is_finite()) {
            return Err(NetworkError::NumericInstability(
                "softmax produced non-finite probabilities".to_string(),
            ));
        }

        self.activations = Some(Activations {
            input,
            blocks: [a1, a2, a3],
            flatten,
            fc1,
            relu4,
            logits,
            probs: probs.clone(),
            training,
        });
        Ok(probs)
    }

    /// Cross-entropy of `output` against one-hot `targets` plus the L2
    /// penalty over the convolution and linear weights.
    pub fn compute_loss(&self, output: &Array2<f32>, targets: &Array2<f32>) -> Result<f32> {
        let data_loss = self.cross_entropy.forward(output, targets)?;
        let weights = self
            .parameters()
            .into_iter()
            .filter(|(name, _)| name.is_regularized())
            .map(|(_, w)| w);
        let loss = data_loss + self.l2.forward(weights, self.config.lambda_reg);
        if !loss.is_finite() {
            return Err(NetworkError::NumericInstability(format!(
                "loss is {loss}"
            )));
        }
        Ok(loss)
    }

    /// Gradients of the loss for every parameter, given the targets of the
    /// batch seen by the last training-mode forward pass.
    pub fn backward(&mut self, targets: &Array2<f32>) -> Result<Gradients> {
        let activations = self.activations.take().ok_or(NetworkError::StaleCache(
            "model backward called without a preceding forward",
        ))?;
        if !activations.training {
            return Err(NetworkError::StaleCache(
                "model backward requires a training-mode forward",
            ));
        }

        let mut grads = Gradients::new();
        let missing = || NetworkError::StaleCache("linear gradients missing after backward");

        let grad_logits = self.cross_entropy.backward(&activations.probs, targets)?;
        let grad = self.fc2.backward(&grad_logits)?;
        let weights = self.fc2.grad_weights().ok_or_else(missing)?;
        let biases = self.fc2.grad_biases().ok_or_else(missing)?;
        grads.insert(ParamName::Fc2W, weights.clone().into_dyn());
        grads.insert(ParamName::Fc2B, biases.clone().into_dyn());

        let grad = relu_backward(&grad, &activations.relu4)?;
        let grad = self.fc1.backward(&grad)?;
        let weights = self.fc1.grad_weights().ok_or_else(missing)?;
        let biases = self.fc1.grad_biases().ok_or_else(missing)?;
        grads.insert(ParamName::Fc1W, weights.clone().into_dyn());
        grads.insert(ParamName::Fc1B, biases.clone().into_dyn());

        let mut grad = self.flatten.backward(&grad)?;
        for (block, block_activations) in self.blocks.iter_mut().zip(&activations.blocks).rev() {
            grad = block.backward(&grad, block_activations, &mut grads)?;
        }

        let lambda = self.config.lambda_reg;
        if lambda != 0.0 {
            for (name, weights) in named_parameters(&self.blocks, &self.fc1, &self.fc2) {
                if !name.is_regularized() {
                    continue;
                }
                if let Some(grad) = grads.get_mut(&name) {
                    *grad += &self.l2.backward(&weights, lambda);
                }
            }
        }
        Ok(grads)
    }

    /// Applies one momentum SGD step with learning rate `learning_rate`.
    pub fn update_parameters(&mut self, grads: &Gradients, learning_rate: f32) -> Result<()> {
        let Self {
            blocks,
            fc1,
            fc2,
            optimizer,
            ..
        } = self;
        let mut params = named_parameters_mut(blocks, fc1, fc2);
        optimizer.update(&mut params, grads, learning_rate)
    }
}
