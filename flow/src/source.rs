use common::nd_buffer::NdBuffer;
use num_traits::ToPrimitive;
use parking_lot::Mutex;

use crate::desc::ArrayDescriptor;
use crate::error::{EngineError, Result};
use crate::roi::Roi;

pub type DirtyCallback = Box<dyn Fn(&Roi) + Send + Sync>;

/// Fan-out list of dirty-region subscribers. Callbacks run synchronously on
/// the emitting thread, in subscription order.
#[derive(Default)]
pub struct DirtySignal {
    subscribers: Mutex<Vec<DirtyCallback>>,
}

impl DirtySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: DirtyCallback) {
        self.subscribers.lock().push(callback);
    }

    pub fn emit(&self, roi: &Roi) {
        let subscribers = self.subscribers.lock();
        for callback in subscribers.iter() {
            callback(roi);
        }
    }
}

/// Upstream array provider. The data plane is f32 throughout; sources with
/// narrower storage types convert on read.
pub trait ArraySource: Send + Sync {
    fn descriptor(&self) -> ArrayDescriptor;

    /// Reads the given region into a freshly allocated buffer whose shape is
    /// the region's shape.
    fn read_region(&self, roi: &Roi) -> Result<NdBuffer<f32>>;

    /// Registers a callback invoked whenever a region of this source becomes
    /// invalid.
    fn on_dirty(&self, callback: DirtyCallback);
}

/// In-memory source backed by a single owned buffer.
pub struct MemorySource {
    descriptor: ArrayDescriptor,
    data: NdBuffer<f32>,
    dirty: DirtySignal,
}

impl MemorySource {
    pub fn new(descriptor: ArrayDescriptor, data: NdBuffer<f32>) -> Result<Self> {
        if data.shape() != descriptor.shape.as_slice() {
            return Err(EngineError::config(format!(
                "data shape {:?} does not match descriptor shape {:?}",
                data.shape(),
                descriptor.shape
            )));
        }
        Ok(Self {
            descriptor,
            data,
            dirty: DirtySignal::new(),
        })
    }

    /// Builds a source from raw elements of any numeric type, converting to
    /// f32.
    pub fn from_elements<T: ToPrimitive>(
        descriptor: ArrayDescriptor,
        elements: &[T],
    ) -> Result<Self> {
        let converted: Vec<f32> = elements
            .iter()
            .map(|v| v.to_f32().unwrap_or(0.0))
            .collect();
        let data = NdBuffer::new(descriptor.shape.clone(), converted);
        Self::new(descriptor, data)
    }

    /// Replaces the region's contents and notifies dirty subscribers.
    pub fn write_region(&mut self, roi: &Roi, values: &NdBuffer<f32>) -> Result<()> {
        if !roi.fits(&self.descriptor.shape) {
            return Err(EngineError::config("write region exceeds array bounds"));
        }
        let shape = roi.shape();
        if values.shape() != shape.as_slice() {
            return Err(EngineError::config("value shape does not match region"));
        }
        self.data
            .copy_window_from(values, &vec![0; shape.len()], &roi.start, &shape);
        self.dirty.emit(roi);
        Ok(())
    }

    /// Marks a region invalid without changing its contents.
    pub fn mark_dirty(&self, roi: &Roi) {
        self.dirty.emit(roi);
    }
}

impl ArraySource for MemorySource {
    fn descriptor(&self) -> ArrayDescriptor {
        self.descriptor.clone()
    }

    fn read_region(&self, roi: &Roi) -> Result<NdBuffer<f32>> {
        if !roi.fits(&self.descriptor.shape) {
            return Err(EngineError::upstream(format!(
                "read region {:?}..{:?} exceeds array shape {:?}",
                roi.start, roi.stop, self.descriptor.shape
            )));
        }
        Ok(self.data.sub_window(&roi.start, &roi.shape()))
    }

    fn on_dirty(&self, callback: DirtyCallback) {
        self.dirty.subscribe(callback);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::axes::Axes;
    use crate::desc::DType;

    fn test_source() -> MemorySource {
        let descriptor = ArrayDescriptor::new(vec![4, 4, 1], Axes::yxc(), DType::F32);
        let elements: Vec<f32> = (0..16).map(|v| v as f32).collect();
        MemorySource::from_elements(descriptor, &elements).unwrap()
    }

    #[test]
    fn test_read_region() {
        let source = test_source();
        let roi = Roi::new(vec![1, 1, 0], vec![3, 3, 1]);
        let window = source.read_region(&roi).unwrap();
        assert_eq!(window.shape(), &[2, 2, 1]);
        assert_eq!(window.as_slice(), &[5.0, 6.0, 9.0, 10.0]);
    }

    #[test]
    fn test_read_out_of_bounds_fails() {
        let source = test_source();
        let roi = Roi::new(vec![0, 0, 0], vec![5, 4, 1]);
        assert!(source.read_region(&roi).is_err());
    }

    #[test]
    fn test_from_elements_converts() {
        let descriptor = ArrayDescriptor::new(vec![2, 2, 1], Axes::yxc(), DType::U8);
        let source = MemorySource::from_elements(descriptor, &[1u8, 2, 3, 4]).unwrap();
        let full = source
            .read_region(&Roi::full(&[2, 2, 1]))
            .unwrap();
        assert_eq!(full.as_slice(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_write_region_notifies_subscribers() {
        let mut source = test_source();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        source.on_dirty(Box::new(move |roi| {
            seen_cb.lock().push(roi.clone());
        }));

        let roi = Roi::new(vec![0, 0, 0], vec![2, 2, 1]);
        let values = NdBuffer::new(vec![2, 2, 1], vec![9.0; 4]);
        source.write_region(&roi, &values).unwrap();

        let window = source.read_region(&roi).unwrap();
        assert_eq!(window.as_slice(), &[9.0; 4]);
        assert_eq!(seen.lock().as_slice(), &[roi]);
    }

    #[test]
    fn test_dirty_signal_order_and_count() {
        let signal = DirtySignal::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for expected in 0..3usize {
            let counter = counter.clone();
            signal.subscribe(Box::new(move |_| {
                let seen = counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(seen % 3, expected);
            }));
        }
        let roi = Roi::new(vec![0], vec![1]);
        signal.emit(&roi);
        signal.emit(&roi);
        assert_eq!(counter.load(Ordering::SeqCst), 6);
    }
}
