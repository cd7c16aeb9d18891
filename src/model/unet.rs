//! Encoder–decoder colorization network.
//!
//! Variable names follow the PyTorch module tree of the reference model
//! (`inc.double_conv.0.weight`, `down1.maxpool_conv.1.double_conv.3.weight`,
//! `up1.up.weight`, `outc.conv.bias`, ...) so an exported state dict can be
//! loaded into the [`nn::VarStore`] as is.

use tch::{Tensor, nn, nn::ModuleT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UNetConfig {
    pub in_channels: i64,
    pub out_channels: i64,
    /// Width of the input stage; each downsampling stage doubles it.
    pub base_channels: i64,
    /// Use align-corners bilinear upsampling instead of transposed convolutions.
    pub bilinear: bool,
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            out_channels: 3,
            base_channels: 64,
            bilinear: false,
        }
    }
}

/// (conv 3x3 -> batch norm -> relu) twice.
#[derive(Debug)]
struct DoubleConv {
    conv1: nn::Conv2D,
    bn1: nn::BatchNorm,
    conv2: nn::Conv2D,
    bn2: nn::BatchNorm,
}

impl DoubleConv {
    fn new(p: &nn::Path, in_channels: i64, out_channels: i64, mid_channels: Option<i64>) -> Self {
        let mid_channels = mid_channels.unwrap_or(out_channels);
        let seq = p / "double_conv";

        Self {
            conv1: nn::conv2d(&seq / "0", in_channels, mid_channels, 3, conv3x3()),
            bn1: nn::batch_norm2d(&seq / "1", mid_channels, Default::default()),
            conv2: nn::conv2d(&seq / "3", mid_channels, out_channels, 3, conv3x3()),
            bn2: nn::batch_norm2d(&seq / "4", out_channels, Default::default()),
        }
    }
}

fn conv3x3() -> nn::ConvConfig {
    nn::ConvConfig {
        padding: 1,
        bias: false,
        ..Default::default()
    }
}

impl ModuleT for DoubleConv {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.apply(&self.conv1)
            .apply_t(&self.bn1, train)
            .relu()
            .apply(&self.conv2)
            .apply_t(&self.bn2, train)
            .relu()
    }
}

/// 2x2 max pooling followed by a double convolution.
#[derive(Debug)]
struct Down {
    conv: DoubleConv,
}

impl Down {
    fn new(p: &nn::Path, in_channels: i64, out_channels: i64) -> Self {
        Self {
            conv: DoubleConv::new(&(p / "maxpool_conv" / "1"), in_channels, out_channels, None),
        }
    }
}

impl ModuleT for Down {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.max_pool2d_default(2).apply_t(&self.conv, train)
    }
}

#[derive(Debug)]
enum Upsample {
    Transposed(nn::ConvTranspose2D),
    Bilinear,
}

/// Upsample x2, align with the skip tensor, concatenate, double convolution.
#[derive(Debug)]
struct Up {
    up: Upsample,
    conv: DoubleConv,
}

impl Up {
    fn new(p: &nn::Path, in_channels: i64, out_channels: i64, bilinear: bool) -> Self {
        if bilinear {
            Self {
                up: Upsample::Bilinear,
                conv: DoubleConv::new(
                    &(p / "conv"),
                    in_channels,
                    out_channels,
                    Some(in_channels / 2),
                ),
            }
        } else {
            let config = nn::ConvTransposeConfig {
                stride: 2,
                ..Default::default()
            };
            Self {
                up: Upsample::Transposed(nn::conv_transpose2d(
                    p / "up",
                    in_channels,
                    in_channels / 2,
                    2,
                    config,
                )),
                conv: DoubleConv::new(&(p / "conv"), in_channels, out_channels, None),
            }
        }
    }

    fn forward(&self, below: &Tensor, skip: &Tensor, train: bool) -> Tensor {
        let upsampled = match &self.up {
            Upsample::Transposed(conv) => below.apply(conv),
            Upsample::Bilinear => {
                let size = below.size();
                below.upsample_bilinear2d([size[2] * 2, size[3] * 2], true, None, None)
            }
        };

        let skip_size = skip.size();
        let up_size = upsampled.size();
        let pad = alignment_padding((skip_size[2], skip_size[3]), (up_size[2], up_size[3]));
        let upsampled = if pad == [0; 4] {
            upsampled
        } else {
            upsampled.constant_pad_nd(pad)
        };

        Tensor::cat(&[skip, &upsampled], 1).apply_t(&self.conv, train)
    }
}

/// Padding `[left, right, top, bottom]` that grows a `(height, width)` tensor
/// to `target`. Odd differences put the extra row/column on the trailing edge.
pub fn alignment_padding(target: (i64, i64), actual: (i64, i64)) -> [i64; 4] {
    let diff_y = target.0 - actual.0;
    let diff_x = target.1 - actual.1;
    let left = diff_x.div_euclid(2);
    let top = diff_y.div_euclid(2);
    [left, diff_x - left, top, diff_y - top]
}

#[derive(Debug)]
pub struct UNet {
    config: UNetConfig,
    inc: DoubleConv,
    down1: Down,
    down2: Down,
    down3: Down,
    down4: Down,
    up1: Up,
    up2: Up,
    up3: Up,
    up4: Up,
    outc: nn::Conv2D,
}

impl UNet {
    pub fn new(p: &nn::Path, config: UNetConfig) -> Self {
        let c = config.base_channels;
        let factor = if config.bilinear { 2 } else { 1 };
        let bilinear = config.bilinear;

        Self {
            config,
            inc: DoubleConv::new(&(p / "inc"), config.in_channels, c, None),
            down1: Down::new(&(p / "down1"), c, c * 2),
            down2: Down::new(&(p / "down2"), c * 2, c * 4),
            down3: Down::new(&(p / "down3"), c * 4, c * 8),
            down4: Down::new(&(p / "down4"), c * 8, c * 16 / factor),
            up1: Up::new(&(p / "up1"), c * 16, c * 8 / factor, bilinear),
            up2: Up::new(&(p / "up2"), c * 8, c * 4 / factor, bilinear),
            up3: Up::new(&(p / "up3"), c * 4, c * 2 / factor, bilinear),
            up4: Up::new(&(p / "up4"), c * 2, c, bilinear),
            outc: nn::conv2d(p / "outc" / "conv", c, config.out_channels, 1, Default::default()),
        }
    }

    pub fn config(&self) -> &UNetConfig {
        &self.config
    }
}

impl ModuleT for UNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let x1 = xs.apply_t(&self.inc, train);
        let x2 = x1.apply_t(&self.down1, train);
        let x3 = x2.apply_t(&self.down2, train);
        let x4 = x3.apply_t(&self.down3, train);
        let x5 = x4.apply_t(&self.down4, train);

        let x = self.up1.forward(&x5, &x4, train);
        let x = self.up2.forward(&x, &x3, train);
        let x = self.up3.forward(&x, &x2, train);
        let x = self.up4.forward(&x, &x1, train);
        // No output activation: values are unconstrained.
        x.apply(&self.outc)
    }
}

pub fn parameter_count(vs: &nn::VarStore) -> u64 {
    vs.variables().values().map(|t| t.numel() as u64).sum()
}
