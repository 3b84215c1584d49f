use serde::{Deserialize, Serialize};

/// Half-open axis-aligned region of interest: `start <= stop` component-wise,
/// in the axis order of the array it addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub start: Vec<usize>,
    pub stop: Vec<usize>,
}

impl Roi {
    pub fn new(start: Vec<usize>, stop: Vec<usize>) -> Self {
        assert_eq!(start.len(), stop.len(), "start/stop rank mismatch");
        assert!(
            start.iter().zip(stop.iter()).all(|(a, b)| a <= b),
            "start must not exceed stop"
        );
        Self { start, stop }
    }

    /// The whole array: `[0, shape)` on every axis.
    pub fn full(shape: &[usize]) -> Self {
        Self {
            start: vec![0; shape.len()],
            stop: shape.to_vec(),
        }
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.start.len()
    }

    pub fn shape(&self) -> Vec<usize> {
        self.start
            .iter()
            .zip(self.stop.iter())
            .map(|(a, b)| b - a)
            .collect()
    }

    pub fn num_elements(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.start.iter().zip(self.stop.iter()).any(|(a, b)| a == b)
    }

    /// True if this region lies within an array of the given shape.
    pub fn fits(&self, shape: &[usize]) -> bool {
        self.ndim() == shape.len()
            && self.stop.iter().zip(shape.iter()).all(|(s, dim)| s <= dim)
    }

    pub fn contains(&self, other: &Roi) -> bool {
        self.ndim() == other.ndim()
            && self
                .start
                .iter()
                .zip(other.start.iter())
                .all(|(a, b)| a <= b)
            && self.stop.iter().zip(other.stop.iter()).all(|(a, b)| b <= a)
    }

    pub fn intersect(&self, other: &Roi) -> Option<Roi> {
        assert_eq!(self.ndim(), other.ndim());
        let start: Vec<usize> = self
            .start
            .iter()
            .zip(other.start.iter())
            .map(|(a, b)| *a.max(b))
            .collect();
        let stop: Vec<usize> = self
            .stop
            .iter()
            .zip(other.stop.iter())
            .map(|(a, b)| *a.min(b))
            .collect();
        if start.iter().zip(stop.iter()).any(|(a, b)| a >= b) {
            return None;
        }
        Some(Roi { start, stop })
    }

    /// Returns a copy with the given axis replaced by `[start, stop)`.
    pub fn with_axis(&self, axis: usize, start: usize, stop: usize) -> Roi {
        let mut out = self.clone();
        out.start[axis] = start;
        out.stop[axis] = stop;
        assert!(start <= stop);
        out
    }

    /// Returns a copy with the given axis removed.
    pub fn drop_axis(&self, axis: usize) -> Roi {
        let mut out = self.clone();
        out.start.remove(axis);
        out.stop.remove(axis);
        out
    }

    /// Returns a copy with `[start, stop)` inserted as a new axis at `axis`.
    pub fn insert_axis(&self, axis: usize, start: usize, stop: usize) -> Roi {
        let mut out = self.clone();
        out.start.insert(axis, start);
        out.stop.insert(axis, stop);
        out
    }
}

/// Enlarges a spatial region by the context a filter of the given support
/// radius needs, clamped to the array bounds.
///
/// `start`, `stop` and `shape` carry spatial axes only; Channel and Time axes
/// are never extended and must be stripped by the caller. The margin per axis
/// is `ceil(support_radius * window)`. For `support_radius <= 0` the region
/// is returned unchanged. The offset of the original region within the halo
/// is `start - halo_start`.
pub fn extend_spatial(
    start: &[usize],
    stop: &[usize],
    shape: &[usize],
    support_radius: f32,
    window: f32,
) -> (Vec<usize>, Vec<usize>) {
    assert_eq!(start.len(), stop.len());
    assert_eq!(start.len(), shape.len());
    debug_assert!(start
        .iter()
        .zip(stop.iter())
        .zip(shape.iter())
        .all(|((a, b), s)| a <= b && b <= s));

    if support_radius <= 0.0 {
        return (start.to_vec(), stop.to_vec());
    }

    let margin = (support_radius * window).ceil() as usize;
    let halo_start = start.iter().map(|s| s.saturating_sub(margin)).collect();
    let halo_stop = stop
        .iter()
        .zip(shape.iter())
        .map(|(s, dim)| (s + margin).min(*dim))
        .collect();
    (halo_start, halo_stop)
}
