//! Built-in separable-convolution filter bank.
//!
//! All filters run on purely spatial f32 slices with reflect boundary
//! handling. Kernels are truncated at `ceil(sigma * window)` taps per side
//! and renormalized, so results near a requested region's interior match a
//! full-array computation. A sigma of zero degrades to the identity kernel
//! for smoothing and to central differences for derivatives.

use common::nd_buffer::NdBuffer;

use crate::error::{EngineError, Result};
use crate::filter::{FilterBank, FilterCaps, FilterId};
use crate::roi::Roi;

/// Order of a 1D kernel applied along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KernelOrder {
    Smooth,
    FirstDerivative,
    SecondDerivative,
}

fn kernel_radius(sigma: f32, window: f32) -> usize {
    ((sigma * window).ceil() as usize).max(1)
}

/// Truncated sampled Gaussian, normalized to unit sum.
fn gaussian_kernel(sigma: f32, window: f32) -> Vec<f32> {
    if sigma <= 0.0 {
        return vec![1.0];
    }
    let radius = kernel_radius(sigma, window) as isize;
    let s2 = (sigma as f64) * (sigma as f64);
    let mut taps: Vec<f64> = (-radius..=radius)
        .map(|t| (-(t as f64) * (t as f64) / (2.0 * s2)).exp())
        .collect();
    let sum: f64 = taps.iter().sum();
    for tap in taps.iter_mut() {
        *tap /= sum;
    }
    taps.into_iter().map(|t| t as f32).collect()
}

/// Sampled Gaussian first derivative, normalized so a unit ramp maps to 1.
fn gaussian_derivative_kernel(sigma: f32, window: f32) -> Vec<f32> {
    if sigma <= 0.0 {
        return vec![-0.5, 0.0, 0.5];
    }
    let radius = kernel_radius(sigma, window) as isize;
    let s2 = (sigma as f64) * (sigma as f64);
    let mut taps: Vec<f64> = (-radius..=radius)
        .map(|t| {
            let t = t as f64;
            t * (-t * t / (2.0 * s2)).exp()
        })
        .collect();
    // Enforce zero DC response, then unit response to a ramp.
    let mean: f64 = taps.iter().sum::<f64>() / taps.len() as f64;
    for tap in taps.iter_mut() {
        *tap -= mean;
    }
    let ramp: f64 = taps
        .iter()
        .enumerate()
        .map(|(i, tap)| tap * (i as f64 - radius as f64))
        .sum();
    taps.into_iter().map(|t| (t / ramp) as f32).collect()
}

/// Sampled Gaussian second derivative, normalized so t^2/2 maps to 1.
fn gaussian_second_derivative_kernel(sigma: f32, window: f32) -> Vec<f32> {
    if sigma <= 0.0 {
        return vec![1.0, -2.0, 1.0];
    }
    let radius = kernel_radius(sigma, window) as isize;
    let s2 = (sigma as f64) * (sigma as f64);
    let mut taps: Vec<f64> = (-radius..=radius)
        .map(|t| {
            let t = t as f64;
            (t * t / (s2 * s2) - 1.0 / s2) * (-t * t / (2.0 * s2)).exp()
        })
        .collect();
    let mean: f64 = taps.iter().sum::<f64>() / taps.len() as f64;
    for tap in taps.iter_mut() {
        *tap -= mean;
    }
    let parabola: f64 = taps
        .iter()
        .enumerate()
        .map(|(i, tap)| {
            let t = i as f64 - radius as f64;
            tap * t * t / 2.0
        })
        .sum();
    taps.into_iter().map(|t| (t / parabola) as f32).collect()
}

/// Reflect an out-of-range index back into `[0, n)` without repeating the
/// border sample.
fn reflect(index: isize, n: isize) -> usize {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n - 1);
    let mut i = index.rem_euclid(period);
    if i >= n {
        i = period - i;
    }
    i as usize
}

/// Correlates `kernel` along `axis` of a row-major array.
fn convolve_axis(data: &[f32], shape: &[usize], axis: usize, kernel: &[f32]) -> Vec<f32> {
    let n = shape[axis] as isize;
    let radius = (kernel.len() / 2) as isize;
    let mut strides = vec![1usize; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    let stride = strides[axis];

    let mut out = vec![0.0f32; data.len()];
    let mut lane_in = vec![0.0f32; n as usize];

    // Odometer over every line along `axis`.
    let mut coords = vec![0usize; shape.len()];
    loop {
        let base: usize = coords
            .iter()
            .zip(strides.iter())
            .enumerate()
            .filter(|(ax, _)| *ax != axis)
            .map(|(_, (c, s))| c * s)
            .sum();

        for (i, lane) in lane_in.iter_mut().enumerate() {
            *lane = data[base + i * stride];
        }
        for i in 0..n {
            let mut acc = 0.0f64;
            for (k, tap) in kernel.iter().enumerate() {
                let src = reflect(i + k as isize - radius, n);
                acc += *tap as f64 * lane_in[src] as f64;
            }
            out[base + i as usize * stride] = acc as f32;
        }

        // Advance the odometer, skipping the convolved axis.
        let mut done = true;
        for ax in (0..shape.len()).rev() {
            if ax == axis {
                continue;
            }
            coords[ax] += 1;
            if coords[ax] < shape[ax] {
                done = false;
                break;
            }
            coords[ax] = 0;
        }
        if done {
            break;
        }
    }
    out
}

/// Separable Gaussian derivative: the given order along each axis, applied
/// at `sigma` with the given truncation window.
fn separable_pass(
    input: &[f32],
    shape: &[usize],
    orders: &[KernelOrder],
    sigma: f32,
    window: f32,
) -> Vec<f32> {
    debug_assert_eq!(orders.len(), shape.len());
    let mut current = input.to_vec();
    for (axis, order) in orders.iter().enumerate() {
        let kernel = match order {
            KernelOrder::Smooth => gaussian_kernel(sigma, window),
            KernelOrder::FirstDerivative => gaussian_derivative_kernel(sigma, window),
            KernelOrder::SecondDerivative => gaussian_second_derivative_kernel(sigma, window),
        };
        current = convolve_axis(&current, shape, axis, &kernel);
    }
    current
}

fn smooth_all(input: &[f32], shape: &[usize], sigma: f32, window: f32) -> Vec<f32> {
    separable_pass(
        input,
        shape,
        &vec![KernelOrder::Smooth; shape.len()],
        sigma,
        window,
    )
}

/// First derivative along `axis`, smoothed along every other axis.
fn gradient_component(
    input: &[f32],
    shape: &[usize],
    axis: usize,
    sigma: f32,
    window: f32,
) -> Vec<f32> {
    let mut orders = vec![KernelOrder::Smooth; shape.len()];
    orders[axis] = KernelOrder::FirstDerivative;
    separable_pass(input, shape, &orders, sigma, window)
}

/// Descending eigenvalues of a symmetric 2x2 matrix.
fn sym2_eigenvalues(a11: f64, a12: f64, a22: f64) -> [f64; 2] {
    let mean = (a11 + a22) / 2.0;
    let gap = ((a11 - a22) / 2.0).hypot(a12);
    [mean + gap, mean - gap]
}

/// Descending eigenvalues of a symmetric 3x3 matrix (trigonometric method).
fn sym3_eigenvalues(a11: f64, a12: f64, a13: f64, a22: f64, a23: f64, a33: f64) -> [f64; 3] {
    let p1 = a12 * a12 + a13 * a13 + a23 * a23;
    if p1 == 0.0 {
        let mut eig = [a11, a22, a33];
        eig.sort_by(|a, b| b.total_cmp(a));
        return eig;
    }
    let q = (a11 + a22 + a33) / 3.0;
    let p2 = (a11 - q).powi(2) + (a22 - q).powi(2) + (a33 - q).powi(2) + 2.0 * p1;
    let p = (p2 / 6.0).sqrt();
    let b11 = (a11 - q) / p;
    let b22 = (a22 - q) / p;
    let b33 = (a33 - q) / p;
    let b12 = a12 / p;
    let b13 = a13 / p;
    let b23 = a23 / p;
    let det_b = b11 * (b22 * b33 - b23 * b23) - b12 * (b12 * b33 - b23 * b13)
        + b13 * (b12 * b23 - b22 * b13);
    let r = (det_b / 2.0).clamp(-1.0, 1.0);
    let phi = r.acos() / 3.0;
    let eig1 = q + 2.0 * p * phi.cos();
    let eig3 = q + 2.0 * p * (phi + 2.0 * std::f64::consts::PI / 3.0).cos();
    let eig2 = 3.0 * q - eig1 - eig3;
    [eig1, eig2, eig3]
}

/// Per-voxel descending eigenvalues of a field of symmetric matrices given
/// as upper-triangle component planes in row-major (i <= j) order.
fn eigenvalue_planes(components: &[Vec<f32>], dims: usize, len: usize) -> Vec<Vec<f32>> {
    let mut out = vec![vec![0.0f32; len]; dims];
    match dims {
        2 => {
            for v in 0..len {
                let eig = sym2_eigenvalues(
                    components[0][v] as f64,
                    components[1][v] as f64,
                    components[2][v] as f64,
                );
                out[0][v] = eig[0] as f32;
                out[1][v] = eig[1] as f32;
            }
        }
        3 => {
            for v in 0..len {
                let eig = sym3_eigenvalues(
                    components[0][v] as f64,
                    components[1][v] as f64,
                    components[2][v] as f64,
                    components[3][v] as f64,
                    components[4][v] as f64,
                    components[5][v] as f64,
                );
                out[0][v] = eig[0] as f32;
                out[1][v] = eig[1] as f32;
                out[2][v] = eig[2] as f32;
            }
        }
        _ => unreachable!("eigenvalue filters are defined for 2 and 3 spatial dims"),
    }
    out
}

/// Upper-triangle index pairs (i <= j) for a `dims`-dimensional symmetric
/// matrix, row-major.
fn upper_triangle(dims: usize) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for i in 0..dims {
        for j in i..dims {
            pairs.push((i, j));
        }
    }
    pairs
}

/// The built-in bank. Computes on the full provided slice and crops to the
/// requested region itself, so it declares ROI support but no direct
/// destination writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SeparableFilterBank;

impl SeparableFilterBank {
    pub fn new() -> Self {
        Self
    }

    /// Runs the filter over the whole spatial slice; one output plane per
    /// output channel.
    fn compute_planes(
        &self,
        filter: FilterId,
        input: &NdBuffer<f32>,
        sigma: f32,
        window: f32,
    ) -> Result<Vec<Vec<f32>>> {
        let shape = input.shape().to_vec();
        let dims = shape.len();
        let data = input.as_slice();

        if sigma < 0.0 {
            return Err(EngineError::filter(filter, "negative sigma"));
        }

        let planes = match filter {
            FilterId::GaussianSmoothing => vec![smooth_all(data, &shape, sigma, window)],
            FilterId::LaplacianOfGaussian => {
                let mut acc = vec![0.0f32; data.len()];
                for axis in 0..dims {
                    let mut orders = vec![KernelOrder::Smooth; dims];
                    orders[axis] = KernelOrder::SecondDerivative;
                    let plane = separable_pass(data, &shape, &orders, sigma, window);
                    for (a, p) in acc.iter_mut().zip(plane.iter()) {
                        *a += *p;
                    }
                }
                vec![acc]
            }
            FilterId::GaussianGradientMagnitude => {
                let mut acc = vec![0.0f32; data.len()];
                for axis in 0..dims {
                    let plane = gradient_component(data, &shape, axis, sigma, window);
                    for (a, p) in acc.iter_mut().zip(plane.iter()) {
                        *a += *p * *p;
                    }
                }
                for a in acc.iter_mut() {
                    *a = a.sqrt();
                }
                vec![acc]
            }
            FilterId::DifferenceOfGaussians => {
                let wide = smooth_all(data, &shape, sigma, window);
                let narrow = smooth_all(data, &shape, 0.66 * sigma, window);
                vec![wide
                    .iter()
                    .zip(narrow.iter())
                    .map(|(w, n)| w - n)
                    .collect()]
            }
            FilterId::HessianOfGaussianEigenvalues => {
                if !(2..=3).contains(&dims) {
                    return Err(EngineError::filter(
                        filter,
                        format!("unsupported spatial dimensionality {dims}"),
                    ));
                }
                let mut components = Vec::new();
                for (i, j) in upper_triangle(dims) {
                    let mut orders = vec![KernelOrder::Smooth; dims];
                    if i == j {
                        orders[i] = KernelOrder::SecondDerivative;
                    } else {
                        orders[i] = KernelOrder::FirstDerivative;
                        orders[j] = KernelOrder::FirstDerivative;
                    }
                    components.push(separable_pass(data, &shape, &orders, sigma, window));
                }
                eigenvalue_planes(&components, dims, data.len())
            }
            FilterId::StructureTensorEigenvalues => {
                if !(2..=3).contains(&dims) {
                    return Err(EngineError::filter(
                        filter,
                        format!("unsupported spatial dimensionality {dims}"),
                    ));
                }
                let outer = 0.5 * sigma;
                let gradients: Vec<Vec<f32>> = (0..dims)
                    .map(|axis| gradient_component(data, &shape, axis, sigma, window))
                    .collect();
                let mut components = Vec::new();
                for (i, j) in upper_triangle(dims) {
                    let product: Vec<f32> = gradients[i]
                        .iter()
                        .zip(gradients[j].iter())
                        .map(|(a, b)| a * b)
                        .collect();
                    components.push(smooth_all(&product, &shape, outer, window));
                }
                eigenvalue_planes(&components, dims, data.len())
            }
        };
        Ok(planes)
    }
}

impl FilterBank for SeparableFilterBank {
    fn caps(&self, _filter: FilterId) -> FilterCaps {
        FilterCaps {
            supports_roi: true,
            supports_out: false,
            window_multiplier: 2.0,
        }
    }

    fn apply(
        &self,
        filter: FilterId,
        input: &NdBuffer<f32>,
        sigma: f32,
        window: f32,
        roi: Option<&Roi>,
    ) -> Result<NdBuffer<f32>> {
        let spatial_shape = input.shape().to_vec();
        let dims = spatial_shape.len();
        let channels = filter.channels_per_input(dims);
        let planes = self.compute_planes(filter, input, sigma, window)?;
        debug_assert_eq!(planes.len(), channels);

        // Interleave planes into a trailing channel axis.
        let plane_len = input.len();
        let mut full = vec![0.0f32; plane_len * channels];
        for (c, plane) in planes.iter().enumerate() {
            for (v, value) in plane.iter().enumerate() {
                full[v * channels + c] = *value;
            }
        }
        let mut out_shape = spatial_shape.clone();
        out_shape.push(channels);
        let full = NdBuffer::new(out_shape, full);

        match roi {
            None => Ok(full),
            Some(roi) => {
                if roi.ndim() != dims || !roi.fits(&spatial_shape) {
                    return Err(EngineError::filter(filter, "region exceeds slice bounds"));
                }
                let mut start = roi.start.clone();
                start.push(0);
                let mut size = roi.shape();
                size.push(channels);
                Ok(full.sub_window(&start, &size))
            }
        }
    }

    fn apply_into(
        &self,
        filter: FilterId,
        _input: &NdBuffer<f32>,
        _sigma: f32,
        _window: f32,
        _out: &mut [f32],
    ) -> Result<()> {
        Err(EngineError::filter(
            filter,
            "direct destination writes are not supported",
        ))
    }
}
