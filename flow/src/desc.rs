use serde::{Deserialize, Serialize};

use crate::axes::Axes;

/// Element type of a stored or published array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    U8,
    U16,
    F32,
}

impl DType {
    #[inline]
    pub fn byte_count(&self) -> usize {
        match self {
            DType::U8 => 1,
            DType::U16 => 2,
            DType::F32 => 4,
        }
    }
}

/// Published metadata of an array: shape, axis roles, element type, and an
/// optional valid-value range. Immutable once published for a given
/// configuration; rebuilt whenever upstream configuration changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayDescriptor {
    pub shape: Vec<usize>,
    pub axes: Axes,
    pub dtype: DType,
    pub drange: Option<(f32, f32)>,
}

impl ArrayDescriptor {
    pub fn new(shape: Vec<usize>, axes: Axes, dtype: DType) -> Self {
        assert_eq!(shape.len(), axes.len(), "shape/axes rank mismatch");
        Self {
            shape,
            axes,
            dtype,
            drange: None,
        }
    }

    pub fn with_drange(mut self, min: f32, max: f32) -> Self {
        self.drange = Some((min, max));
        self
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Extent of the Channel axis, or 1 when there is none.
    pub fn channel_count(&self) -> usize {
        self.axes
            .channel_index()
            .map(|idx| self.shape[idx])
            .unwrap_or(1)
    }

    pub fn spatial_shape(&self) -> Vec<usize> {
        self.axes.keep_spatial(&self.shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axes::AxisRole;

    #[test]
    fn test_descriptor_basics() {
        let desc = ArrayDescriptor::new(vec![100, 80, 3], Axes::yxc(), DType::U8);
        assert_eq!(desc.ndim(), 3);
        assert_eq!(desc.num_elements(), 100 * 80 * 3);
        assert_eq!(desc.channel_count(), 3);
        assert_eq!(desc.spatial_shape(), vec![100, 80]);
        assert_eq!(desc.dtype.byte_count(), 1);
    }

    #[test]
    fn test_channel_count_defaults_to_one() {
        let axes = Axes::new(vec![AxisRole::Y, AxisRole::X]).unwrap();
        let desc = ArrayDescriptor::new(vec![10, 10], axes, DType::F32);
        assert_eq!(desc.channel_count(), 1);
    }

    #[test]
    #[should_panic(expected = "shape/axes rank mismatch")]
    fn test_rank_mismatch_panics() {
        ArrayDescriptor::new(vec![10, 10], Axes::yxc(), DType::F32);
    }

    #[test]
    fn test_serde_roundtrip() {
        let desc = ArrayDescriptor::new(vec![5, 6, 2], Axes::yxc(), DType::F32)
            .with_drange(0.0, 255.0);
        let json = serde_json::to_string(&desc).unwrap();
        let back: ArrayDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, desc);
    }
}
