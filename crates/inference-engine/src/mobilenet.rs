//! MobileNetV3 (Large / Small) in candle
//!
//! Parameter names follow the torchvision layout (`features.N.block.M...`,
//! `classifier.0`, `classifier.3`) so a PyTorch state dictionary maps onto
//! the network without renaming. The network is built for evaluation only:
//! batch norm uses its running statistics and dropout is omitted.

use std::fmt;

use candle_core::{Device, Module, ModuleT, Result, Tensor, D};
use candle_nn::{
    batch_norm, conv2d, conv2d_no_bias, linear, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig,
    Linear, VarBuilder,
};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::classifier::{check_input_shape, ImageClassifier};
use crate::InferenceError;

const BN_EPS: f64 = 1e-3;

/// Candidate architecture for a state dictionary checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    MobileNetV3Large,
    MobileNetV3Small,
}

impl Architecture {
    /// Fallback order used when a checkpoint is a bare state dictionary
    pub const CANDIDATES: [Architecture; 2] =
        [Architecture::MobileNetV3Large, Architecture::MobileNetV3Small];

    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::MobileNetV3Large => "MobileNetV3-Large",
            Architecture::MobileNetV3Small => "MobileNetV3-Small",
        }
    }

    fn blocks(&self) -> &'static [BlockConfig] {
        match self {
            Architecture::MobileNetV3Large => &LARGE_BLOCKS,
            Architecture::MobileNetV3Small => &SMALL_BLOCKS,
        }
    }

    /// Width of the hidden classifier layer (`classifier.0`)
    fn last_channel(&self) -> usize {
        match self {
            Architecture::MobileNetV3Large => 1280,
            Architecture::MobileNetV3Small => 1024,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activation {
    Relu,
    HardSwish,
    Identity,
}

impl Activation {
    fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Relu => xs.relu(),
            Activation::HardSwish => hard_swish(xs),
            Activation::Identity => Ok(xs.clone()),
        }
    }
}

/// relu6(x + 3) / 6
fn hard_sigmoid(xs: &Tensor) -> Result<Tensor> {
    xs.affine(1.0 / 6.0, 0.5)?.clamp(0f32, 1f32)
}

fn hard_swish(xs: &Tensor) -> Result<Tensor> {
    xs.mul(&hard_sigmoid(xs)?)
}

/// torchvision's `_make_divisible`
fn make_divisible(value: usize, divisor: usize) -> usize {
    let rounded = ((value + divisor / 2) / divisor * divisor).max(divisor);
    if (rounded as f64) < 0.9 * value as f64 {
        rounded + divisor
    } else {
        rounded
    }
}

/// Inverted residual block settings
#[derive(Debug, Clone, Copy)]
struct BlockConfig {
    input: usize,
    kernel: usize,
    expanded: usize,
    output: usize,
    use_se: bool,
    activation: Activation,
    stride: usize,
}

const fn block(
    input: usize,
    kernel: usize,
    expanded: usize,
    output: usize,
    use_se: bool,
    hard_swish: bool,
    stride: usize,
) -> BlockConfig {
    BlockConfig {
        input,
        kernel,
        expanded,
        output,
        use_se,
        activation: if hard_swish {
            Activation::HardSwish
        } else {
            Activation::Relu
        },
        stride,
    }
}

#[rustfmt::skip]
const LARGE_BLOCKS: [BlockConfig; 15] = [
    block(16, 3, 16, 16, false, false, 1),
    block(16, 3, 64, 24, false, false, 2),
    block(24, 3, 72, 24, false, false, 1),
    block(24, 5, 72, 40, true, false, 2),
    block(40, 5, 120, 40, true, false, 1),
    block(40, 5, 120, 40, true, false, 1),
    block(40, 3, 240, 80, false, true, 2),
    block(80, 3, 200, 80, false, true, 1),
    block(80, 3, 184, 80, false, true, 1),
    block(80, 3, 184, 80, false, true, 1),
    block(80, 3, 480, 112, true, true, 1),
    block(112, 3, 672, 112, true, true, 1),
    block(112, 5, 672, 160, true, true, 2),
    block(160, 5, 960, 160, true, true, 1),
    block(160, 5, 960, 160, true, true, 1),
];

#[rustfmt::skip]
const SMALL_BLOCKS: [BlockConfig; 11] = [
    block(16, 3, 16, 16, true, false, 2),
    block(16, 3, 72, 24, false, false, 2),
    block(24, 3, 88, 24, false, false, 1),
    block(24, 5, 96, 40, true, true, 2),
    block(40, 5, 240, 40, true, true, 1),
    block(40, 5, 240, 40, true, true, 1),
    block(40, 5, 120, 48, true, true, 1),
    block(48, 5, 144, 48, true, true, 1),
    block(48, 5, 288, 96, true, true, 2),
    block(96, 5, 576, 96, true, true, 1),
    block(96, 5, 576, 96, true, true, 1),
];

/// Conv2d -> BatchNorm2d -> activation (`N.0`, `N.1`)
#[derive(Debug, Clone)]
struct ConvNormActivation {
    conv: Conv2d,
    norm: BatchNorm,
    activation: Activation,
}

impl ConvNormActivation {
    fn new(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        groups: usize,
        activation: Activation,
    ) -> Result<Self> {
        let config = Conv2dConfig {
            padding: (kernel - 1) / 2,
            stride,
            groups,
            ..Default::default()
        };
        let conv = conv2d_no_bias(in_channels, out_channels, kernel, config, vb.pp("0"))?;
        let norm = batch_norm(
            out_channels,
            BatchNormConfig {
                eps: BN_EPS,
                ..Default::default()
            },
            vb.pp("1"),
        )?;
        Ok(Self {
            conv,
            norm,
            activation,
        })
    }
}

impl Module for ConvNormActivation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.conv.forward(xs)?;
        let xs = self.norm.forward_t(&xs, false)?;
        self.activation.apply(&xs)
    }
}

#[derive(Debug, Clone)]
struct SqueezeExcitation {
    fc1: Conv2d,
    fc2: Conv2d,
}

impl SqueezeExcitation {
    fn new(vb: VarBuilder, channels: usize, squeeze: usize) -> Result<Self> {
        let fc1 = conv2d(channels, squeeze, 1, Default::default(), vb.pp("fc1"))?;
        let fc2 = conv2d(squeeze, channels, 1, Default::default(), vb.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }
}

impl Module for SqueezeExcitation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let scale = xs.mean_keepdim(D::Minus1)?.mean_keepdim(D::Minus2)?;
        let scale = self.fc1.forward(&scale)?.relu()?;
        let scale = hard_sigmoid(&self.fc2.forward(&scale)?)?;
        xs.broadcast_mul(&scale)
    }
}

#[derive(Debug, Clone)]
struct InvertedResidual {
    expand: Option<ConvNormActivation>,
    depthwise: ConvNormActivation,
    se: Option<SqueezeExcitation>,
    project: ConvNormActivation,
    use_residual: bool,
}

impl InvertedResidual {
    fn new(vb: VarBuilder, cfg: &BlockConfig) -> Result<Self> {
        let vb = vb.pp("block");
        let mut index = 0;

        let expand = if cfg.expanded != cfg.input {
            let layer = ConvNormActivation::new(
                vb.pp(index),
                cfg.input,
                cfg.expanded,
                1,
                1,
                1,
                cfg.activation,
            )?;
            index += 1;
            Some(layer)
        } else {
            None
        };

        let depthwise = ConvNormActivation::new(
            vb.pp(index),
            cfg.expanded,
            cfg.expanded,
            cfg.kernel,
            cfg.stride,
            cfg.expanded,
            cfg.activation,
        )?;
        index += 1;

        let se = if cfg.use_se {
            let squeeze = make_divisible(cfg.expanded / 4, 8);
            let layer = SqueezeExcitation::new(vb.pp(index), cfg.expanded, squeeze)?;
            index += 1;
            Some(layer)
        } else {
            None
        };

        let project = ConvNormActivation::new(
            vb.pp(index),
            cfg.expanded,
            cfg.output,
            1,
            1,
            1,
            Activation::Identity,
        )?;

        Ok(Self {
            expand,
            depthwise,
            se,
            project,
            use_residual: cfg.stride == 1 && cfg.input == cfg.output,
        })
    }
}

impl Module for InvertedResidual {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut ys = match &self.expand {
            Some(expand) => expand.forward(xs)?,
            None => xs.clone(),
        };
        ys = self.depthwise.forward(&ys)?;
        if let Some(se) = &self.se {
            ys = se.forward(&ys)?;
        }
        ys = self.project.forward(&ys)?;
        if self.use_residual {
            ys = (ys + xs)?;
        }
        Ok(ys)
    }
}

/// MobileNetV3 with a replaceable classification head
#[derive(Debug, Clone)]
pub struct MobileNetV3 {
    architecture: Architecture,
    device: Device,
    stem: ConvNormActivation,
    blocks: Vec<InvertedResidual>,
    last_conv: ConvNormActivation,
    hidden: Linear,
    head: Linear,
}

impl MobileNetV3 {
    /// Build the network, pulling every parameter from `vb`.
    ///
    /// `classifier.3` is sized to `num_classes` outputs.
    pub fn new(architecture: Architecture, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let device = vb.device().clone();
        let features = vb.pp("features");
        let configs = architecture.blocks();

        let stem = ConvNormActivation::new(
            features.pp(0),
            3,
            configs[0].input,
            3,
            2,
            1,
            Activation::HardSwish,
        )?;

        let blocks = configs
            .iter()
            .enumerate()
            .map(|(i, cfg)| InvertedResidual::new(features.pp(i + 1), cfg))
            .collect::<Result<Vec<_>>>()?;

        let last_input = configs[configs.len() - 1].output;
        let last_output = 6 * last_input;
        let last_conv = ConvNormActivation::new(
            features.pp(configs.len() + 1),
            last_input,
            last_output,
            1,
            1,
            1,
            Activation::HardSwish,
        )?;

        let classifier = vb.pp("classifier");
        let hidden = linear(last_output, architecture.last_channel(), classifier.pp(0))?;
        let head = linear(architecture.last_channel(), num_classes, classifier.pp(3))?;

        Ok(Self {
            architecture,
            device,
            stem,
            blocks,
            last_conv,
            hidden,
            head,
        })
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }
}

impl Module for MobileNetV3 {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = self.stem.forward(xs)?;
        for block in &self.blocks {
            xs = block.forward(&xs)?;
        }
        let xs = self.last_conv.forward(&xs)?;
        // Global average pool to (batch, channels)
        let xs = xs.mean(D::Minus1)?.mean(D::Minus1)?;
        let xs = hard_swish(&self.hidden.forward(&xs)?)?;
        self.head.forward(&xs)
    }
}

impl ImageClassifier for MobileNetV3 {
    fn name(&self) -> &str {
        self.architecture.as_str()
    }

    fn logits(&self, input: &Array4<f32>) -> std::result::Result<Vec<f32>, InferenceError> {
        check_input_shape(input)?;

        let data: Vec<f32> = input.iter().copied().collect();
        let xs = Tensor::from_vec(data, input.dim(), &self.device)?;
        let logits = self.forward(&xs)?;
        Ok(logits.flatten_all()?.to_vec1::<f32>()?)
    }
}
