//! Chunked persistent writer.
//!
//! Streams a (possibly lazily computed) array into a chunk store under a
//! bounded memory budget: the array is tiled into chunk-aligned request
//! blocks which are read through a fixed-depth pipeline and written in
//! strict issuance order.

use std::collections::VecDeque;
use std::sync::Arc;

use common::nd_buffer::NdBuffer;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::axes::AxisRole;
use crate::cancel::CancelToken;
use crate::desc::{ArrayDescriptor, DType};
use crate::error::{EngineError, Result};
use crate::roi::Roi;
use crate::source::ArraySource;
use crate::store::{ChunkStore, Compression, Dataset};

/// Target byte size of one storage chunk.
pub const DEFAULT_CHUNK_BYTE_BUDGET: usize = 300_000;

/// Upper bound on simultaneously outstanding upstream reads.
const MAX_IN_FLIGHT: usize = 10;

/// Chunk shape for the default byte budget.
pub fn chunk_shape(descriptor: &ArrayDescriptor) -> Vec<usize> {
    chunk_shape_for_budget(descriptor, DEFAULT_CHUNK_BYTE_BUDGET)
}

/// Splits the byte budget evenly over the spatial axes; the Time extent is
/// one step per chunk and the Channel extent spans all channels.
pub fn chunk_shape_for_budget(descriptor: &ArrayDescriptor, budget_bytes: usize) -> Vec<usize> {
    let channels = descriptor.channel_count();
    let elem = descriptor.dtype.byte_count();
    let spatial_dims = descriptor.axes.spatial_dims().max(1);
    let budget_elems = (budget_bytes / (channels.max(1) * elem)).max(1);
    let per_axis = ((budget_elems as f64).powf(1.0 / spatial_dims as f64).floor() as usize).max(1);

    descriptor
        .shape
        .iter()
        .zip(descriptor.axes.roles().iter())
        .map(|(&dim, role)| match role {
            AxisRole::Channel => dim,
            AxisRole::Time => dim.min(1),
            _ => per_axis.min(dim),
        })
        .collect()
}

/// Per-axis factor by which request blocks exceed the chunk shape: larger
/// requests mean fewer round trips while staying chunk-boundary aligned.
fn request_multiplier(role: AxisRole) -> usize {
    match role {
        AxisRole::Channel => 10,
        AxisRole::Time => 1,
        _ => 2,
    }
}

/// Tiles the whole array into chunk-aligned request blocks, row-major.
pub fn request_blocks(descriptor: &ArrayDescriptor, chunk_shape: &[usize]) -> Vec<Roi> {
    let shape = &descriptor.shape;
    let steps: Vec<usize> = chunk_shape
        .iter()
        .zip(descriptor.axes.roles().iter())
        .map(|(&c, &role)| (c * request_multiplier(role)).max(1))
        .collect();

    let mut blocks: Vec<(Vec<usize>, Vec<usize>)> = vec![(Vec::new(), Vec::new())];
    for (axis, &dim) in shape.iter().enumerate() {
        let mut extended = Vec::new();
        for (start, stop) in &blocks {
            for axis_start in (0..dim).step_by(steps[axis]) {
                let mut start = start.clone();
                let mut stop = stop.clone();
                start.push(axis_start);
                stop.push((axis_start + steps[axis]).min(dim));
                extended.push((start, stop));
            }
        }
        blocks = extended;
    }
    blocks
        .into_iter()
        .map(|(start, stop)| Roi::new(start, stop))
        .collect()
}

type ProgressFn = Box<dyn Fn(u32) + Send + Sync>;

/// Streams one source array into one dataset of a chunk store.
pub struct ChunkedWriter {
    source: Arc<dyn ArraySource>,
    store: Arc<dyn ChunkStore>,
    path: String,
    compression: Compression,
    budget_bytes: usize,
    progress: Option<ProgressFn>,
    cancel: CancelToken,
}

impl ChunkedWriter {
    pub fn new(
        source: Arc<dyn ArraySource>,
        store: Arc<dyn ChunkStore>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            source,
            store,
            path: path.into(),
            compression: Compression::Gzip,
            budget_bytes: DEFAULT_CHUNK_BYTE_BUDGET,
            progress: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_chunk_budget(mut self, budget_bytes: usize) -> Self {
        self.budget_bytes = budget_bytes;
        self
    }

    pub fn with_progress(mut self, callback: ProgressFn) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Writes the whole source array. An upstream read failure aborts the
    /// write; already written blocks are left in place.
    pub async fn write(&self) -> Result<()> {
        let mut descriptor = self.source.descriptor();
        descriptor.dtype = DType::F32;
        let chunks = chunk_shape_for_budget(&descriptor, self.budget_bytes);
        let dataset =
            self.store
                .create_dataset(&self.path, &descriptor, &chunks, self.compression)?;
        let blocks = request_blocks(&descriptor, &chunks);
        let total = blocks.len();
        debug!(total, ?chunks, path = %self.path, "starting chunked write");
        self.report(0);

        let mut pending: VecDeque<(Roi, JoinHandle<Result<NdBuffer<f32>>>)> = VecDeque::new();
        let result = self
            .pump_blocks(&blocks, dataset.as_ref(), &mut pending)
            .await;
        if let Err(err) = result {
            // Outstanding reads are abandoned; freeing them is best-effort.
            for (_, handle) in pending {
                handle.abort();
            }
            warn!(%err, path = %self.path, "chunked write aborted");
            return Err(err);
        }

        dataset.set_attr("axes", serde_json::to_value(&descriptor.axes)?)?;
        if let Some((lo, hi)) = descriptor.drange {
            dataset.set_attr("drange", serde_json::json!([lo, hi]))?;
        }
        self.report(100);
        Ok(())
    }

    /// Issues reads up to the pipeline depth and always consumes the oldest
    /// outstanding request first, so blocks land in issuance order.
    async fn pump_blocks(
        &self,
        blocks: &[Roi],
        dataset: &dyn Dataset,
        pending: &mut VecDeque<(Roi, JoinHandle<Result<NdBuffer<f32>>>)>,
    ) -> Result<()> {
        let total = blocks.len();
        let mut next = 0usize;
        let mut completed = 0usize;
        let mut last_percent = 0u32;

        while completed < total {
            while pending.len() < MAX_IN_FLIGHT && next < total {
                let roi = blocks[next].clone();
                let source = self.source.clone();
                let read_roi = roi.clone();
                let handle = tokio::task::spawn_blocking(move || source.read_region(&read_roi));
                pending.push_back((roi, handle));
                next += 1;
            }

            self.cancel.check()?;
            let Some((roi, handle)) = pending.pop_front() else {
                break;
            };
            let data = handle
                .await
                .map_err(|e| EngineError::upstream(format!("read task failed: {e}")))??;
            dataset.write_block(&roi, &data)?;
            completed += 1;

            let percent = (100 * completed / total) as u32;
            if percent > last_percent {
                last_percent = percent;
                self.report(percent);
                debug!(percent, completed, total, "block written");
            }
        }
        Ok(())
    }

    fn report(&self, percent: u32) {
        if let Some(callback) = &self.progress {
            callback(percent);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::axes::Axes;
    use crate::source::{DirtyCallback, MemorySource};
    use crate::store::MemChunkStore;

    fn source_3ch(height: usize, width: usize) -> Arc<MemorySource> {
        let desc = ArrayDescriptor::new(vec![height, width, 3], Axes::yxc(), DType::F32);
        let data: Vec<f32> = (0..height * width * 3).map(|v| v as f32).collect();
        Arc::new(MemorySource::from_elements(desc, &data).unwrap())
    }

    #[test]
    fn test_chunk_shape_for_large_volume() {
        let desc = ArrayDescriptor::new(vec![1000, 1000, 3], Axes::yxc(), DType::F32);
        let chunks = chunk_shape(&desc);
        assert_eq!(chunks, vec![158, 158, 3]);
        let bytes: usize = chunks.iter().product::<usize>() * desc.dtype.byte_count();
        assert!(bytes <= DEFAULT_CHUNK_BYTE_BUDGET);
        assert!(chunks[0] <= 1000 && chunks[1] <= 1000);
    }

    #[test]
    fn test_chunk_shape_caps_at_array_extent() {
        let desc = ArrayDescriptor::new(vec![20, 20, 2], Axes::yxc(), DType::F32);
        let chunks = chunk_shape(&desc);
        assert_eq!(chunks, vec![20, 20, 2]);
    }

    #[test]
    fn test_chunk_shape_time_extent_is_one() {
        let axes = Axes::new(vec![
            crate::axes::AxisRole::Time,
            crate::axes::AxisRole::Y,
            crate::axes::AxisRole::X,
            crate::axes::AxisRole::Channel,
        ])
        .unwrap();
        let desc = ArrayDescriptor::new(vec![5, 100, 100, 2], axes, DType::F32);
        let chunks = chunk_shape(&desc);
        assert_eq!(chunks[0], 1);
        assert_eq!(chunks[3], 2);
    }

    #[test]
    fn test_request_blocks_tile_exactly() {
        let desc = ArrayDescriptor::new(vec![1000, 1000, 3], Axes::yxc(), DType::F32);
        let chunks = chunk_shape(&desc);
        let blocks = request_blocks(&desc, &chunks);
        assert_eq!(blocks.len(), 16);
        assert_eq!(blocks[0], Roi::new(vec![0, 0, 0], vec![316, 316, 3]));
        assert_eq!(
            blocks[15],
            Roi::new(vec![948, 948, 0], vec![1000, 1000, 3])
        );
        // Chunk-boundary aligned and covering every element exactly once.
        let mut covered = 0usize;
        for block in &blocks {
            assert_eq!(block.start[0] % chunks[0], 0);
            assert_eq!(block.start[1] % chunks[1], 0);
            covered += block.num_elements();
        }
        assert_eq!(covered, desc.num_elements());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_roundtrip_with_progress() {
        let source = source_3ch(40, 40);
        let store = Arc::new(MemChunkStore::new());
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        let writer = ChunkedWriter::new(source.clone(), store.clone(), "export/features")
            .with_chunk_budget(4_000)
            .with_compression(Compression::Gzip)
            .with_progress(Box::new(move |p| sink.lock().push(p)));
        writer.write().await.unwrap();

        let dataset = store.dataset("export/features").unwrap();
        let expected = source.read_region(&Roi::full(&[40, 40, 3])).unwrap();
        assert_eq!(dataset.assemble().as_slice(), expected.as_slice());

        let meta = dataset.meta.lock();
        assert_eq!(meta.compression, Compression::Gzip);
        assert!(meta.attributes.contains_key("axes"));

        let reports = reports.lock();
        assert_eq!(*reports.first().unwrap(), 0);
        assert_eq!(*reports.last().unwrap(), 100);
        assert!(reports.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_streams_cascade_output() {
        use crate::cascade::FeatureCascade;
        use crate::filter::FilterId;
        use crate::kernels::SeparableFilterBank;

        let desc = ArrayDescriptor::new(vec![32, 32, 1], Axes::yxc(), DType::F32);
        let data: Vec<f32> = (0..32 * 32).map(|v| ((v % 13) as f32).sin()).collect();
        let source = Arc::new(MemorySource::from_elements(desc, &data).unwrap());
        let cascade = Arc::new(FeatureCascade::new(
            source,
            Arc::new(SeparableFilterBank::new()),
        ));
        cascade
            .configure(vec![FilterId::GaussianSmoothing], vec![1.0], vec![vec![true]])
            .unwrap();

        let store = Arc::new(MemChunkStore::new());
        let writer =
            ChunkedWriter::new(cascade.clone(), store.clone(), "features").with_chunk_budget(256);
        writer.write().await.unwrap();

        let expected = cascade.compute_region(&Roi::full(&[32, 32, 1])).unwrap();
        let dataset = store.dataset("features").unwrap();
        assert_eq!(dataset.assemble().as_slice(), expected.as_slice());
    }

    /// Source wrapper that tracks how many reads are live at once.
    struct CountingSource {
        inner: Arc<MemorySource>,
        live: AtomicUsize,
        max_live: AtomicUsize,
    }

    impl ArraySource for CountingSource {
        fn descriptor(&self) -> ArrayDescriptor {
            self.inner.descriptor()
        }

        fn read_region(&self, roi: &Roi) -> Result<NdBuffer<f32>> {
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_live.fetch_max(live, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(2));
            let result = self.inner.read_region(roi);
            self.live.fetch_sub(1, Ordering::SeqCst);
            result
        }

        fn on_dirty(&self, callback: DirtyCallback) {
            self.inner.on_dirty(callback);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_at_most_ten_outstanding_reads() {
        let desc = ArrayDescriptor::new(vec![64, 64, 1], Axes::yxc(), DType::F32);
        let data: Vec<f32> = (0..64 * 64).map(|v| v as f32).collect();
        let source = Arc::new(CountingSource {
            inner: Arc::new(MemorySource::from_elements(desc, &data).unwrap()),
            live: AtomicUsize::new(0),
            max_live: AtomicUsize::new(0),
        });
        let store = Arc::new(MemChunkStore::new());
        let writer = ChunkedWriter::new(source.clone(), store.clone(), "data")
            .with_chunk_budget(256);
        writer.write().await.unwrap();

        // 16 blocks issued through a depth-10 pipeline.
        assert_eq!(store.dataset("data").unwrap().blocks.lock().len(), 16);
        assert!(source.max_live.load(Ordering::SeqCst) <= 10);
    }

    /// Source whose reads start failing after a fixed number of successes.
    struct FlakySource {
        inner: Arc<MemorySource>,
        reads_left: AtomicUsize,
    }

    impl ArraySource for FlakySource {
        fn descriptor(&self) -> ArrayDescriptor {
            self.inner.descriptor()
        }

        fn read_region(&self, roi: &Roi) -> Result<NdBuffer<f32>> {
            if self.reads_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1)).is_err() {
                return Err(EngineError::upstream("device unplugged"));
            }
            self.inner.read_region(roi)
        }

        fn on_dirty(&self, callback: DirtyCallback) {
            self.inner.on_dirty(callback);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upstream_failure_aborts_write() {
        let desc = ArrayDescriptor::new(vec![64, 64, 1], Axes::yxc(), DType::F32);
        let data: Vec<f32> = vec![1.0; 64 * 64];
        let source = Arc::new(FlakySource {
            inner: Arc::new(MemorySource::from_elements(desc, &data).unwrap()),
            reads_left: AtomicUsize::new(3),
        });
        let store = Arc::new(MemChunkStore::new());
        let writer = ChunkedWriter::new(source, store.clone(), "data").with_chunk_budget(256);
        let err = writer.write().await.unwrap_err();
        assert!(matches!(err, EngineError::UpstreamRead { .. }));
        assert!(store.dataset("data").unwrap().blocks.lock().len() < 16);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_write_aborts() {
        let source = source_3ch(40, 40);
        let store = Arc::new(MemChunkStore::new());
        let token = CancelToken::new();
        token.cancel();
        let writer = ChunkedWriter::new(source, store, "data").with_cancel(token);
        let err = writer.write().await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }
}
