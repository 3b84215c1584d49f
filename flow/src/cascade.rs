//! Multi-scale feature cascade.
//!
//! A configuration matrix selects (filter, scale) pairs. For a requested
//! region of the stacked output the cascade reads one combined input halo,
//! presmooths it once per distinct scale, then fans the per-feature filter
//! applications out to a bounded worker pool, each task writing its own
//! channel block of the destination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common::nd_buffer::NdBuffer;
use common::parallel::{try_run_limited, Task};
use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::{debug, error};

use crate::cancel::CancelToken;
use crate::desc::{ArrayDescriptor, DType};
use crate::error::{EngineError, Result};
use crate::exec::{DestView, FilterExec, HaloArray};
use crate::filter::{FilterBank, FilterId};
use crate::roi::{extend_spatial, Roi};
use crate::source::{ArraySource, DirtyCallback, DirtySignal};

/// Floor on the sigma used for combined halo sizing.
pub const MIN_HALO_SIGMA: f32 = 0.7;
/// Truncation window of the shared presmoothing passes, wider than the
/// per-filter window so later filters keep full context.
pub const SMOOTHER_WINDOW: f32 = 3.5;

const MAX_CONCURRENT_TASKS: usize = 8;

/// Splits a nominal scale into the sigma applied by the feature filter and
/// the residual applied by the shared presmoothing pass.
pub fn presmooth_split(scale: f32) -> (f32, f32) {
    let dest = scale.min(1.0);
    if scale > dest {
        (dest, (scale * scale - dest * dest).sqrt())
    } else {
        (0.0, scale)
    }
}

/// One feature's contiguous channel range in the stacked output.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelBlock {
    pub filter: FilterId,
    pub scale_index: usize,
    pub scale: f32,
    pub start: usize,
    pub stop: usize,
    pub name: String,
}

/// Ordered channel ranges of every enabled (filter, scale) pair, row-major
/// over (filter, then scale).
#[derive(Debug, Clone, Default)]
pub struct ChannelTable {
    blocks: Vec<ChannelBlock>,
    total: usize,
}

impl ChannelTable {
    fn new(blocks: Vec<ChannelBlock>) -> Self {
        let total = blocks.last().map(|b| b.stop).unwrap_or(0);
        Self { blocks, total }
    }

    pub fn blocks(&self) -> &[ChannelBlock] {
        &self.blocks
    }

    pub fn total_channels(&self) -> usize {
        self.total
    }

    pub fn block_for(&self, filter: FilterId, scale_index: usize) -> Option<&ChannelBlock> {
        self.blocks
            .iter()
            .find(|b| b.filter == filter && b.scale_index == scale_index)
    }
}

/// One enabled (filter, scale) execution unit.
pub struct CascadeUnit {
    pub exec: FilterExec,
    pub scale_index: usize,
    pub block: ChannelBlock,
}

/// Immutable derived configuration, rebuilt as a whole whenever the matrix,
/// scale list, filter list, or input descriptor changes. In-flight compute
/// calls keep the epoch they started with.
pub struct CascadeConfig {
    pub epoch: u64,
    pub input_desc: ArrayDescriptor,
    pub output_desc: ArrayDescriptor,
    pub scales: Vec<f32>,
    pub residuals: Vec<f32>,
    pub units: Vec<CascadeUnit>,
    pub table: ChannelTable,
    pub in_channels: usize,
    pub max_enabled_scale: f32,
}

struct CascadeState {
    config: RwLock<Option<Arc<CascadeConfig>>>,
    epoch: AtomicU64,
    dirty: DirtySignal,
}

impl CascadeState {
    fn propagate_input_dirty(&self, input_roi: &Roi) -> Result<()> {
        let cfg = match self.config.read().clone() {
            Some(cfg) => cfg,
            None => return Ok(()),
        };
        if input_roi.ndim() != cfg.input_desc.ndim()
            || !input_roi.fits(&cfg.input_desc.shape)
        {
            // A notification shaped unlike the wired input is a wiring error.
            return Err(EngineError::UnknownDirtySource);
        }
        let total = cfg.table.total_channels();
        if total == 0 {
            return Ok(());
        }
        let c_axis = cfg.output_desc.ndim() - 1;
        match cfg.input_desc.axes.channel_index() {
            None => {
                self.dirty.emit(&input_roi.insert_axis(c_axis, 0, total));
            }
            Some(ci) => {
                let (a, b) = (input_roi.start[ci], input_roi.stop[ci]);
                if a == 0 && b == cfg.in_channels {
                    let mut out = input_roi.clone();
                    out.start[c_axis] = 0;
                    out.stop[c_axis] = total;
                    self.dirty.emit(&out);
                } else {
                    // A channel subset touches a sub-range of every feature
                    // block, offset by that block's start.
                    for block in cfg.table.blocks() {
                        let multiplicity = (block.stop - block.start) / cfg.in_channels;
                        let mut out = input_roi.clone();
                        out.start[c_axis] = block.start + a * multiplicity;
                        out.stop[c_axis] = block.start + b * multiplicity;
                        self.dirty.emit(&out);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Lazy stacked-feature operator over one upstream source.
pub struct FeatureCascade {
    source: Arc<dyn ArraySource>,
    bank: Arc<dyn FilterBank>,
    state: Arc<CascadeState>,
}

impl FeatureCascade {
    pub fn new(source: Arc<dyn ArraySource>, bank: Arc<dyn FilterBank>) -> Self {
        let state = Arc::new(CascadeState {
            config: RwLock::new(None),
            epoch: AtomicU64::new(0),
            dirty: DirtySignal::new(),
        });
        let weak = Arc::downgrade(&state);
        source.on_dirty(Box::new(move |roi| {
            if let Some(state) = weak.upgrade() {
                if let Err(err) = state.propagate_input_dirty(roi) {
                    error!(%err, ?roi, "dropping dirty notification");
                }
            }
        }));
        Self {
            source,
            bank,
            state,
        }
    }

    /// Rebuilds the derived configuration and marks the full output dirty.
    pub fn configure(
        &self,
        filter_ids: Vec<FilterId>,
        scales: Vec<f32>,
        matrix: Vec<Vec<bool>>,
    ) -> Result<()> {
        if matrix.len() != filter_ids.len() {
            return Err(EngineError::config(format!(
                "matrix has {} rows for {} filters",
                matrix.len(),
                filter_ids.len()
            )));
        }
        if let Some(row) = matrix.iter().find(|row| row.len() != scales.len()) {
            return Err(EngineError::config(format!(
                "matrix row has {} columns for {} scales",
                row.len(),
                scales.len()
            )));
        }
        if let Some(s) = scales.iter().find(|s| !(**s > 0.0) || !s.is_finite()) {
            return Err(EngineError::config(format!("invalid scale {s}")));
        }

        let input_desc = self.source.descriptor();
        let in_channels = input_desc.channel_count();
        let spatial_dims = input_desc.axes.spatial_dims();

        let mut units = Vec::new();
        let mut blocks = Vec::new();
        let mut next_channel = 0usize;
        let mut max_enabled_scale = 0.0f32;
        for (fi, &filter) in filter_ids.iter().enumerate() {
            for (si, &scale) in scales.iter().enumerate() {
                if !matrix[fi][si] {
                    continue;
                }
                max_enabled_scale = max_enabled_scale.max(scale);
                let (dest_sigma, _) = presmooth_split(scale);
                let exec =
                    FilterExec::new(filter, dest_sigma, self.bank.clone(), self.source.clone())?;
                let width = in_channels * filter.channels_per_input(spatial_dims);
                let block = ChannelBlock {
                    filter,
                    scale_index: si,
                    scale,
                    start: next_channel,
                    stop: next_channel + width,
                    name: filter.feature_name(scale),
                };
                next_channel += width;
                blocks.push(block.clone());
                units.push(CascadeUnit {
                    exec,
                    scale_index: si,
                    block,
                });
            }
        }
        let table = ChannelTable::new(blocks);

        let (out_axes, c_idx) = input_desc.axes.with_channel();
        let mut out_shape = input_desc.shape.clone();
        if c_idx < out_shape.len() {
            out_shape[c_idx] = table.total_channels();
        } else {
            out_shape.push(table.total_channels());
        }
        let output_desc = ArrayDescriptor::new(out_shape, out_axes, DType::F32);

        let residuals = scales.iter().map(|&s| presmooth_split(s).1).collect();
        let epoch = self.state.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            epoch,
            units = units.len(),
            channels = table.total_channels(),
            "cascade reconfigured"
        );
        let config = Arc::new(CascadeConfig {
            epoch,
            input_desc,
            output_desc: output_desc.clone(),
            scales,
            residuals,
            units,
            table,
            in_channels,
            max_enabled_scale,
        });
        *self.state.config.write() = Some(config);

        if output_desc.num_elements() > 0 {
            self.state.dirty.emit(&Roi::full(&output_desc.shape));
        }
        Ok(())
    }

    pub fn epoch(&self) -> u64 {
        self.state.epoch.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> Result<Arc<CascadeConfig>> {
        self.current_config()
    }

    pub fn on_dirty(&self, callback: DirtyCallback) {
        self.state.dirty.subscribe(callback);
    }

    pub fn compute_region(&self, roi: &Roi) -> Result<NdBuffer<f32>> {
        self.compute_region_cancellable(roi, &CancelToken::new())
    }

    pub fn compute_region_cancellable(
        &self,
        roi: &Roi,
        token: &CancelToken,
    ) -> Result<NdBuffer<f32>> {
        let cfg = self.current_config()?;
        let mut out = NdBuffer::new_default(roi.shape());
        let dest = DestView::new(&mut out);
        self.compute_into(&cfg, roi, &dest, token)?;
        drop(dest);
        Ok(out)
    }

    /// Computes a region given in one feature's own channel numbering by
    /// translating it through the channel table.
    pub fn compute_feature(
        &self,
        filter: FilterId,
        scale_index: usize,
        roi: &Roi,
    ) -> Result<NdBuffer<f32>> {
        let cfg = self.current_config()?;
        let block = cfg
            .table
            .block_for(filter, scale_index)
            .ok_or_else(|| EngineError::config("feature is not enabled"))?;
        let c_axis = cfg.output_desc.ndim() - 1;
        if roi.stop[c_axis] > block.stop - block.start {
            return Err(EngineError::config(
                "feature channel range exceeds the feature's width",
            ));
        }
        let stacked = roi.with_axis(
            c_axis,
            roi.start[c_axis] + block.start,
            roi.stop[c_axis] + block.start,
        );
        self.compute_region(&stacked)
    }

    fn current_config(&self) -> Result<Arc<CascadeConfig>> {
        self.state
            .config
            .read()
            .clone()
            .ok_or_else(|| EngineError::config("cascade has not been configured"))
    }

    fn compute_into(
        &self,
        cfg: &CascadeConfig,
        roi: &Roi,
        dest: &DestView<'_>,
        token: &CancelToken,
    ) -> Result<()> {
        token.check()?;
        if !roi.fits(&cfg.output_desc.shape) {
            return Err(EngineError::config(format!(
                "requested region {:?}..{:?} exceeds output shape {:?}",
                roi.start, roi.stop, cfg.output_desc.shape
            )));
        }
        assert_eq!(
            dest.window_shape(),
            roi.shape().as_slice(),
            "destination window must match the requested region"
        );
        if roi.is_empty() || cfg.table.total_channels() == 0 {
            return Ok(());
        }

        let c_axis = cfg.output_desc.ndim() - 1;
        let (c0, c1) = (roi.start[c_axis], roi.stop[c_axis]);
        let active: Vec<&CascadeUnit> = cfg
            .units
            .iter()
            .filter(|u| u.block.start < c1 && u.block.stop > c0)
            .collect();
        if active.is_empty() {
            return Ok(());
        }

        // One combined halo, sized for the largest enabled scale with the
        // wide presmoothing window.
        let out_axes = &cfg.output_desc.axes;
        let spatial_axes = out_axes.spatial_indices();
        let sp_start: Vec<usize> = spatial_axes.iter().map(|&a| roi.start[a]).collect();
        let sp_stop: Vec<usize> = spatial_axes.iter().map(|&a| roi.stop[a]).collect();
        let sp_shape: Vec<usize> = spatial_axes
            .iter()
            .map(|&a| cfg.output_desc.shape[a])
            .collect();
        let radius = cfg.max_enabled_scale.max(MIN_HALO_SIGMA);
        let (halo_start, halo_stop) =
            extend_spatial(&sp_start, &sp_stop, &sp_shape, radius, SMOOTHER_WINDOW);
        debug!(
            ?halo_start,
            ?halo_stop,
            active = active.len(),
            "computing cascade region"
        );

        let mut input_roi = roi.clone();
        for (i, &axis) in spatial_axes.iter().enumerate() {
            input_roi.start[axis] = halo_start[i];
            input_roi.stop[axis] = halo_stop[i];
        }
        if cfg.input_desc.axes.channel_index().is_some() {
            input_roi.start[c_axis] = 0;
            input_roi.stop[c_axis] = cfg.in_channels;
        } else {
            input_roi = input_roi.drop_axis(c_axis);
        }

        token.check()?;
        let raw = self.source.read_region(&input_roi)?;

        let mut needed_scales: Vec<usize> = active.iter().map(|u| u.scale_index).collect();
        needed_scales.sort_unstable();
        needed_scales.dedup();

        let mut shared: HashMap<usize, HaloArray> = HashMap::new();
        for scale_index in needed_scales {
            token.check()?;
            let data =
                self.presmooth_halo(&raw, &cfg.input_desc.axes, cfg.residuals[scale_index])?;
            shared.insert(
                scale_index,
                HaloArray {
                    data,
                    start: input_roi.start.clone(),
                },
            );
        }
        // The raw halo is no longer needed once every shared array exists.
        drop(raw);

        token.check()?;
        let mut tasks: Vec<Task<'_, EngineError>> = Vec::with_capacity(active.len());
        for unit in active {
            let block_start = unit.block.start.max(c0);
            let block_stop = unit.block.stop.min(c1);
            let mut local = roi.clone();
            local.start[c_axis] = block_start - unit.block.start;
            local.stop[c_axis] = block_stop - unit.block.start;
            let sub = dest.restrict(c_axis, block_start - c0, block_stop - c0);
            let pre = &shared[&unit.scale_index];
            let task_token = token.clone();
            tasks.push(Box::new(move || {
                task_token.check()?;
                unit.exec.compute(&local, &sub, Some(pre))
            }));
        }
        try_run_limited(tasks, MAX_CONCURRENT_TASKS)?;
        token.check()
    }

    /// Smooths every (channel, time) spatial slice of a raw halo with the
    /// scale's residual sigma.
    fn presmooth_halo(
        &self,
        raw: &NdBuffer<f32>,
        input_axes: &crate::axes::Axes,
        residual: f32,
    ) -> Result<NdBuffer<f32>> {
        let shape = raw.shape().to_vec();
        let rank = shape.len();
        let has_time = input_axes.time_index().is_some();
        let has_channel = input_axes.channel_index().is_some();
        let time_extent = if has_time { shape[0] } else { 1 };
        let channel_extent = if has_channel { shape[rank - 1] } else { 1 };
        let spatial_shape = input_axes.keep_spatial(&shape);

        let mut out = NdBuffer::new_default(shape.clone());
        for c in 0..channel_extent {
            for t in 0..time_extent {
                let mut start = vec![0usize; rank];
                let mut size = shape.clone();
                if has_time {
                    start[0] = t;
                    size[0] = 1;
                }
                if has_channel {
                    start[rank - 1] = c;
                    size[rank - 1] = 1;
                }
                let slice = raw.sub_window(&start, &size).reshape(spatial_shape.clone());
                let smoothed = self
                    .bank
                    .apply(
                        FilterId::GaussianSmoothing,
                        &slice,
                        residual,
                        SMOOTHER_WINDOW,
                        None,
                    )?
                    .reshape(size.clone());
                out.copy_window_from(&smoothed, &vec![0; rank], &start, &size);
            }
        }
        Ok(out)
    }
}

/// A cascade is itself an array source, so a writer (or another cascade)
/// can consume its stacked output.
impl ArraySource for FeatureCascade {
    fn descriptor(&self) -> ArrayDescriptor {
        match self.current_config() {
            Ok(cfg) => cfg.output_desc.clone(),
            // Not configured yet: publish the zero-channel degenerate shape.
            Err(_) => {
                let input = self.source.descriptor();
                let (axes, c_idx) = input.axes.with_channel();
                let mut shape = input.shape.clone();
                if c_idx < shape.len() {
                    shape[c_idx] = 0;
                } else {
                    shape.push(0);
                }
                ArrayDescriptor::new(shape, axes, DType::F32)
            }
        }
    }

    fn read_region(&self, roi: &Roi) -> Result<NdBuffer<f32>> {
        self.compute_region(roi)
    }

    fn on_dirty(&self, callback: DirtyCallback) {
        self.state.dirty.subscribe(callback);
    }
}
