use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Role of one array axis. Axis order is fixed per array and shared by every
/// ROI and shape that refers to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AxisRole {
    X,
    Y,
    Z,
    Time,
    Channel,
}

impl AxisRole {
    #[inline]
    pub fn is_spatial(&self) -> bool {
        matches!(self, AxisRole::X | AxisRole::Y | AxisRole::Z)
    }
}

/// Ordered axis roles of an array. At most one Channel and one Time axis;
/// any number of spatial axes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Axes {
    roles: Vec<AxisRole>,
}

impl Axes {
    pub fn new(roles: Vec<AxisRole>) -> Result<Self> {
        let channels = roles.iter().filter(|r| **r == AxisRole::Channel).count();
        let times = roles.iter().filter(|r| **r == AxisRole::Time).count();
        if channels > 1 {
            return Err(EngineError::config("more than one Channel axis"));
        }
        if times > 1 {
            return Err(EngineError::config("more than one Time axis"));
        }
        Ok(Self { roles })
    }

    /// Common 2D layout: y, x, c.
    pub fn yxc() -> Self {
        Self {
            roles: vec![AxisRole::Y, AxisRole::X, AxisRole::Channel],
        }
    }

    /// Common 3D layout: z, y, x, c.
    pub fn zyxc() -> Self {
        Self {
            roles: vec![AxisRole::Z, AxisRole::Y, AxisRole::X, AxisRole::Channel],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.roles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    #[inline]
    pub fn role(&self, axis: usize) -> AxisRole {
        self.roles[axis]
    }

    #[inline]
    pub fn roles(&self) -> &[AxisRole] {
        &self.roles
    }

    pub fn channel_index(&self) -> Option<usize> {
        self.roles.iter().position(|r| *r == AxisRole::Channel)
    }

    pub fn time_index(&self) -> Option<usize> {
        self.roles.iter().position(|r| *r == AxisRole::Time)
    }

    pub fn spatial_indices(&self) -> Vec<usize> {
        self.roles
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_spatial())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn spatial_dims(&self) -> usize {
        self.roles.iter().filter(|r| r.is_spatial()).count()
    }

    /// Returns these axes with a Channel axis appended if absent, plus the
    /// channel axis index in the result.
    pub fn with_channel(&self) -> (Axes, usize) {
        match self.channel_index() {
            Some(idx) => (self.clone(), idx),
            None => {
                let mut roles = self.roles.clone();
                roles.push(AxisRole::Channel);
                let idx = roles.len() - 1;
                (Axes { roles }, idx)
            }
        }
    }

    /// Drops the given axis components from `values` (e.g. to reduce a full
    /// coordinate vector to its spatial components).
    pub fn keep_spatial<T: Copy>(&self, values: &[T]) -> Vec<T> {
        assert_eq!(values.len(), self.roles.len());
        values
            .iter()
            .zip(self.roles.iter())
            .filter(|(_, r)| r.is_spatial())
            .map(|(v, _)| *v)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_axes() {
        let axes = Axes::new(vec![
            AxisRole::Time,
            AxisRole::Y,
            AxisRole::X,
            AxisRole::Channel,
        ])
        .unwrap();
        assert_eq!(axes.len(), 4);
        assert_eq!(axes.channel_index(), Some(3));
        assert_eq!(axes.time_index(), Some(0));
        assert_eq!(axes.spatial_indices(), vec![1, 2]);
        assert_eq!(axes.spatial_dims(), 2);
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let err = Axes::new(vec![AxisRole::Channel, AxisRole::X, AxisRole::Channel]).unwrap_err();
        assert!(matches!(err, EngineError::Config { .. }));
    }

    #[test]
    fn test_duplicate_time_rejected() {
        let err = Axes::new(vec![AxisRole::Time, AxisRole::Time]).unwrap_err();
        assert!(matches!(err, EngineError::Config { .. }));
    }

    #[test]
    fn test_with_channel_appends() {
        let axes = Axes::new(vec![AxisRole::Y, AxisRole::X]).unwrap();
        let (with_c, c_idx) = axes.with_channel();
        assert_eq!(c_idx, 2);
        assert_eq!(with_c.role(2), AxisRole::Channel);

        let (same, c_idx) = Axes::yxc().with_channel();
        assert_eq!(c_idx, 2);
        assert_eq!(same, Axes::yxc());
    }

    #[test]
    fn test_keep_spatial() {
        let axes = Axes::new(vec![
            AxisRole::Time,
            AxisRole::Y,
            AxisRole::X,
            AxisRole::Channel,
        ])
        .unwrap();
        assert_eq!(axes.keep_spatial(&[9, 20, 30, 2]), vec![20, 30]);
    }
}
