use common::nd_buffer::NdBuffer;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

use crate::error::Result;
use crate::roi::Roi;

/// Identity of a derived feature filter. Variant order is the default
/// feature ordering of the stacked output.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter,
)]
pub enum FilterId {
    GaussianSmoothing,
    LaplacianOfGaussian,
    StructureTensorEigenvalues,
    HessianOfGaussianEigenvalues,
    GaussianGradientMagnitude,
    DifferenceOfGaussians,
}

impl FilterId {
    pub fn default_order() -> Vec<FilterId> {
        FilterId::iter().collect()
    }

    /// Output channels produced per input channel.
    pub fn channels_per_input(&self, spatial_dims: usize) -> usize {
        match self {
            FilterId::GaussianSmoothing
            | FilterId::LaplacianOfGaussian
            | FilterId::GaussianGradientMagnitude
            | FilterId::DifferenceOfGaussians => 1,
            FilterId::StructureTensorEigenvalues | FilterId::HessianOfGaussianEigenvalues => {
                spatial_dims
            }
        }
    }

    /// Largest smoothing sigma the filter applies internally for a given
    /// sigma, which drives halo sizing. The structure tensor smooths its
    /// gradient products with an extra outer scale of half the inner one,
    /// and derivative stencils keep one sample of context even at sigma
    /// zero.
    pub fn support_radius(&self, sigma: f32) -> f32 {
        match self {
            FilterId::GaussianSmoothing | FilterId::DifferenceOfGaussians => sigma,
            FilterId::StructureTensorEigenvalues => (sigma + 0.5 * sigma).max(0.5),
            FilterId::LaplacianOfGaussian
            | FilterId::HessianOfGaussianEigenvalues
            | FilterId::GaussianGradientMagnitude => sigma.max(0.5),
        }
    }

    /// Human-readable feature label carried in published descriptors.
    pub fn feature_name(&self, scale: f32) -> String {
        let base = match self {
            FilterId::GaussianSmoothing => "Gaussian Smoothing",
            FilterId::LaplacianOfGaussian => "Laplacian of Gaussian",
            FilterId::StructureTensorEigenvalues => "Structure Tensor Eigenvalues",
            FilterId::HessianOfGaussianEigenvalues => "Hessian of Gaussian Eigenvalues",
            FilterId::GaussianGradientMagnitude => "Gaussian Gradient Magnitude",
            FilterId::DifferenceOfGaussians => "Difference of Gaussians",
        };
        format!("{base} (s={scale:.1})")
    }
}

/// Per-filter capability flags declared by a bank.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterCaps {
    /// The bank can restrict its computation to a sub-region of the input.
    pub supports_roi: bool,
    /// The bank can write results directly into a caller-provided buffer.
    pub supports_out: bool,
    /// Kernel truncation window in sigmas.
    pub window_multiplier: f32,
}

/// Numeric filter capability. Inputs are purely spatial slices; the caller
/// strips Channel and Time axes and reinserts them around each call. The
/// output carries the (possibly ROI-restricted) spatial shape plus a trailing
/// channel axis of extent `channels_per_input`.
pub trait FilterBank: Send + Sync {
    fn caps(&self, filter: FilterId) -> FilterCaps;

    fn apply(
        &self,
        filter: FilterId,
        input: &NdBuffer<f32>,
        sigma: f32,
        window: f32,
        roi: Option<&Roi>,
    ) -> Result<NdBuffer<f32>>;

    /// Direct-to-destination variant; only valid when
    /// `caps(filter).supports_out` holds. `out` must have room for the full
    /// input's spatial shape times `channels_per_input`.
    fn apply_into(
        &self,
        filter: FilterId,
        input: &NdBuffer<f32>,
        sigma: f32,
        window: f32,
        out: &mut [f32],
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_order() {
        assert_eq!(
            FilterId::default_order(),
            vec![
                FilterId::GaussianSmoothing,
                FilterId::LaplacianOfGaussian,
                FilterId::StructureTensorEigenvalues,
                FilterId::HessianOfGaussianEigenvalues,
                FilterId::GaussianGradientMagnitude,
                FilterId::DifferenceOfGaussians,
            ]
        );
    }

    #[test]
    fn test_channel_multiplicity() {
        assert_eq!(FilterId::GaussianSmoothing.channels_per_input(3), 1);
        assert_eq!(FilterId::HessianOfGaussianEigenvalues.channels_per_input(2), 2);
        assert_eq!(FilterId::StructureTensorEigenvalues.channels_per_input(3), 3);
    }

    #[test]
    fn test_support_radius() {
        assert_eq!(FilterId::GaussianSmoothing.support_radius(2.0), 2.0);
        assert_eq!(FilterId::GaussianSmoothing.support_radius(0.0), 0.0);
        assert_eq!(FilterId::StructureTensorEigenvalues.support_radius(2.0), 3.0);
        assert_eq!(FilterId::LaplacianOfGaussian.support_radius(0.0), 0.5);
    }

    #[test]
    fn test_feature_name() {
        assert_eq!(
            FilterId::GaussianSmoothing.feature_name(1.0),
            "Gaussian Smoothing (s=1.0)"
        );
    }
}
