//! Convolutions with "same" padding for any spatial rank.
//!
//! libtorch only pads symmetrically, so even kernels and strided layers
//! would not keep the `ceil(n / s)` (or `n * s` when transposed) output
//! sizes the decoders rely on. These layers compute the padding from the
//! actual input at forward time.
use tch::{nn, Tensor};

#[derive(Debug, Clone, PartialEq)]
pub struct ConvSpec {
    pub kernel: Vec<i64>,
    pub stride: Vec<i64>,
    pub dilation: Vec<i64>,
    pub groups: i64,
    pub bias: bool,
}

impl ConvSpec {
    pub fn new(kernel: &[i64]) -> ConvSpec {
        let rank = kernel.len();
        ConvSpec {
            kernel: kernel.to_vec(),
            stride: vec![1; rank],
            dilation: vec![1; rank],
            groups: 1,
            bias: true,
        }
    }

    /// Same kernel size along every axis.
    pub fn cube(rank: usize, k: i64) -> ConvSpec {
        ConvSpec::new(&vec![k; rank])
    }

    pub fn stride(mut self, stride: &[i64]) -> ConvSpec {
        self.stride = stride.to_vec();
        self
    }

    pub fn uniform_stride(mut self, s: i64) -> ConvSpec {
        self.stride = vec![s; self.kernel.len()];
        self
    }

    pub fn dilation(mut self, d: i64) -> ConvSpec {
        self.dilation = vec![d; self.kernel.len()];
        self
    }

    pub fn groups(mut self, groups: i64) -> ConvSpec {
        self.groups = groups;
        self
    }

    pub fn no_bias(mut self) -> ConvSpec {
        self.bias = false;
        self
    }

    fn rank(&self) -> usize {
        self.kernel.len()
    }

    fn effective_kernel(&self, axis: usize) -> i64 {
        (self.kernel[axis] - 1) * self.dilation[axis] + 1
    }
}

pub fn same_conv_output(n: i64, stride: i64) -> i64 {
    (n + stride - 1) / stride
}

/// Padding `(before, after)` that makes a strided convolution produce `ceil(n / s)`.
pub fn same_conv_padding(n: i64, kernel: i64, stride: i64, dilation: i64) -> (i64, i64) {
    let out = same_conv_output(n, stride);
    let k_eff = (kernel - 1) * dilation + 1;
    let total = ((out - 1) * stride + k_eff - n).max(0);
    (total / 2, total - total / 2)
}

fn uniform_bound(fan_in: i64) -> nn::Init {
    let bound = 1.0 / (fan_in.max(1) as f64).sqrt();
    nn::Init::Uniform { lo: -bound, up: bound }
}

#[derive(Debug)]
pub struct SameConv {
    ws: Tensor,
    bs: Option<Tensor>,
    spec: ConvSpec,
}

pub fn same_conv(p: nn::Path, c_in: i64, c_out: i64, spec: ConvSpec) -> SameConv {
    let fan_in = c_in / spec.groups * spec.kernel.iter().product::<i64>();
    let mut dims = vec![c_out, c_in / spec.groups];
    dims.extend_from_slice(&spec.kernel);
    let ws = p.var("weight", &dims, uniform_bound(fan_in));
    let bs = spec.bias.then(|| p.var("bias", &[c_out], uniform_bound(fan_in)));
    SameConv { ws, bs, spec }
}

impl nn::Module for SameConv {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let spec = &self.spec;
        let size = xs.size();
        let mut pads = Vec::with_capacity(2 * spec.rank());
        for axis in (0..spec.rank()).rev() {
            let (before, after) =
                same_conv_padding(size[2 + axis], spec.kernel[axis], spec.stride[axis], spec.dilation[axis]);
            pads.push(before);
            pads.push(after);
        }
        let xs = if pads.iter().any(|&p| p != 0) {
            xs.constant_pad_nd(pads.as_slice())
        } else {
            xs.shallow_clone()
        };
        let zeros = vec![0i64; spec.rank()];
        xs.convolution(
            &self.ws,
            self.bs.as_ref(),
            spec.stride.as_slice(),
            zeros.as_slice(),
            spec.dilation.as_slice(),
            false,
            zeros.as_slice(),
            spec.groups,
        )
    }
}

#[derive(Debug)]
pub struct SameConvTranspose {
    ws: Tensor,
    bs: Option<Tensor>,
    spec: ConvSpec,
}

pub fn same_conv_transpose(p: nn::Path, c_in: i64, c_out: i64, spec: ConvSpec) -> SameConvTranspose {
    let fan_in = c_out / spec.groups * spec.kernel.iter().product::<i64>();
    let mut dims = vec![c_in, c_out / spec.groups];
    dims.extend_from_slice(&spec.kernel);
    let ws = p.var("weight", &dims, uniform_bound(fan_in));
    let bs = spec.bias.then(|| p.var("bias", &[c_out], uniform_bound(fan_in)));
    SameConvTranspose { ws, bs, spec }
}

impl nn::Module for SameConvTranspose {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let spec = &self.spec;
        let size = xs.size();
        let mut output_padding = Vec::with_capacity(spec.rank());
        let mut crops = Vec::with_capacity(spec.rank());
        for axis in 0..spec.rank() {
            let n = size[2 + axis];
            let target = n * spec.stride[axis];
            let raw = (n - 1) * spec.stride[axis] + spec.effective_kernel(axis);
            output_padding.push((target - raw).max(0));
            let excess = (raw - target).max(0);
            crops.push((excess / 2, target));
        }
        let zeros = vec![0i64; spec.rank()];
        let mut ys = xs.convolution(
            &self.ws,
            self.bs.as_ref(),
            spec.stride.as_slice(),
            zeros.as_slice(),
            spec.dilation.as_slice(),
            true,
            output_padding.as_slice(),
            spec.groups,
        );
        for (axis, (start, len)) in crops.into_iter().enumerate() {
            let dim = 2 + axis as i64;
            if ys.size()[2 + axis] != len {
                ys = ys.narrow(dim, start, len);
            }
        }
        ys
    }
}

/// Batch normalization over `[B, C, ...spatial]`; `rank` is 0 for dense features.
///
/// `momentum` is the weight kept by the running statistics at each update.
pub fn batch_norm(p: nn::Path, rank: usize, channels: i64, momentum: f64, eps: f64) -> nn::BatchNorm {
    let config = nn::BatchNormConfig { momentum: 1.0 - momentum, eps, ..Default::default() };
    match rank {
        0 | 1 => nn::batch_norm1d(p, channels, config),
        2 => nn::batch_norm2d(p, channels, config),
        _ => nn::batch_norm3d(p, channels, config),
    }
}

pub fn relu6(xs: &Tensor) -> Tensor {
    xs.clamp(0.0, 6.0)
}

/// Bilinear (or trilinear for volumes) resize with aligned corners.
pub fn resize(xs: &Tensor, size: &[i64]) -> Tensor {
    if xs.size()[2..] == size[..] {
        return xs.shallow_clone();
    }
    match size.len() {
        2 => xs.upsample_bilinear2d(size, true, None::<f64>, None::<f64>),
        _ => xs.upsample_trilinear3d(size, true, None::<f64>, None::<f64>, None::<f64>),
    }
}

pub fn upsample_nearest(xs: &Tensor, size: &[i64]) -> Tensor {
    xs.upsample_nearest2d(size, None::<f64>, None::<f64>)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn::Module, Device, Kind};

    fn input(dims: &[i64]) -> Tensor {
        Tensor::randn(dims, (Kind::Float, Device::Cpu))
    }

    #[test]
    fn same_padding_puts_the_odd_pixel_after() {
        assert_eq!(same_conv_padding(45, 2, 1, 1), (0, 1));
        assert_eq!(same_conv_padding(45, 3, 2, 1), (1, 1));
        assert_eq!(same_conv_padding(46, 3, 2, 1), (0, 1));
        assert_eq!(same_conv_padding(10, 3, 1, 4), (4, 4));
        assert_eq!(same_conv_padding(5, 1, 4, 1), (0, 0));
        assert_eq!(same_conv_output(45, 2), 23);
    }

    #[test]
    fn strided_conv_rounds_up() {
        let vs = nn::VarStore::new(Device::Cpu);
        let conv = same_conv(vs.root() / "c", 2, 4, ConvSpec::cube(2, 3).uniform_stride(2));
        assert_eq!(conv.forward(&input(&[3, 2, 45, 44])).size(), [3, 4, 23, 22]);

        let even = same_conv(vs.root() / "e", 2, 4, ConvSpec::cube(2, 2));
        assert_eq!(even.forward(&input(&[1, 2, 45, 45])).size(), [1, 4, 45, 45]);
    }

    #[test]
    fn column_kernels_keep_width() {
        let vs = nn::VarStore::new(Device::Cpu);
        let conv = same_conv(vs.root() / "c", 1, 3, ConvSpec::new(&[3, 1]).stride(&[2, 1]));
        assert_eq!(conv.forward(&input(&[2, 1, 9, 7])).size(), [2, 3, 5, 7]);
    }

    #[test]
    fn transposed_conv_multiplies_by_stride() {
        let vs = nn::VarStore::new(Device::Cpu);
        let cases = [(2, 1), (3, 2), (1, 2), (4, 4), (2, 2)];
        for (i, (k, s)) in cases.into_iter().enumerate() {
            let conv = same_conv_transpose(vs.root() / i, 3, 5, ConvSpec::cube(2, k).uniform_stride(s));
            let ys = conv.forward(&input(&[2, 3, 7, 6]));
            assert_eq!(ys.size(), [2, 5, 7 * s, 6 * s], "kernel {k} stride {s}");
        }
    }

    #[test]
    fn volumes_and_depthwise() {
        let vs = nn::VarStore::new(Device::Cpu);
        let conv = same_conv(vs.root() / "v", 2, 4, ConvSpec::cube(3, 3).stride(&[2, 2, 1]));
        assert_eq!(conv.forward(&input(&[1, 2, 9, 8, 5])).size(), [1, 4, 5, 4, 5]);

        let up = same_conv_transpose(vs.root() / "u", 4, 2, ConvSpec::cube(3, 3).uniform_stride(2));
        assert_eq!(up.forward(&input(&[1, 4, 3, 3, 2])).size(), [1, 2, 6, 6, 4]);

        let depthwise = same_conv(vs.root() / "d", 6, 6, ConvSpec::cube(2, 3).groups(6).dilation(2).no_bias());
        assert_eq!(depthwise.forward(&input(&[1, 6, 10, 10])).size(), [1, 6, 10, 10]);
    }

    #[test]
    fn relu6_clips_both_sides() {
        let xs = Tensor::from_slice(&[-1.0f32, 3.0, 9.0]);
        let ys: Vec<f32> = Vec::try_from(relu6(&xs)).unwrap();
        assert_eq!(ys, [0.0, 3.0, 6.0]);
    }

    #[test]
    fn resize_hits_target() {
        assert_eq!(resize(&input(&[1, 2, 48, 48]), &[45, 45]).size(), [1, 2, 45, 45]);
        assert_eq!(resize(&input(&[1, 2, 12, 12, 4]), &[10, 10, 3]).size(), [1, 2, 10, 10, 3]);
        assert_eq!(upsample_nearest(&input(&[1, 2, 1, 1]), &[7, 6]).size(), [1, 2, 7, 6]);
    }
}
