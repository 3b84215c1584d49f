use std::marker::PhantomData;
use std::sync::Arc;

use common::nd_buffer::{row_major_strides, NdBuffer};
use tracing::warn;

use crate::desc::{ArrayDescriptor, DType};
use crate::error::{EngineError, Result};
use crate::filter::{FilterBank, FilterId};
use crate::roi::{extend_spatial, Roi};
use crate::source::ArraySource;

/// Above this support radius a bank without region-restricted compute gets a
/// performance warning; the call still proceeds via whole-slice fallback.
const ROI_SUPPORT_WARN_RADIUS: f32 = 5.0;

/// A halo-sized input array prepared upstream (typically presmoothed), in
/// the input array's full axis order, anchored at `start`.
pub struct HaloArray {
    pub data: NdBuffer<f32>,
    pub start: Vec<usize>,
}

impl HaloArray {
    pub fn region(&self) -> Roi {
        let stop = self
            .start
            .iter()
            .zip(self.data.shape().iter())
            .map(|(a, s)| a + s)
            .collect();
        Roi::new(self.start.clone(), stop)
    }
}

/// Write-only window into a destination buffer. Several views over one
/// buffer may coexist so parallel tasks can fill disjoint channel ranges;
/// all writes go through raw pointers, no `&mut` aliases are formed.
///
/// Safety contract: concurrent views over the same buffer must write
/// disjoint element sets.
pub struct DestView<'a> {
    ptr: *mut f32,
    full_shape: Vec<usize>,
    offset: Vec<usize>,
    window: Vec<usize>,
    _marker: PhantomData<&'a mut [f32]>,
}

unsafe impl Send for DestView<'_> {}
unsafe impl Sync for DestView<'_> {}

impl<'a> DestView<'a> {
    pub fn new(buffer: &'a mut NdBuffer<f32>) -> Self {
        let full_shape = buffer.shape().to_vec();
        Self {
            ptr: buffer.as_mut_slice().as_mut_ptr(),
            offset: vec![0; full_shape.len()],
            window: full_shape.clone(),
            full_shape,
            _marker: PhantomData,
        }
    }

    /// Narrows the view to `[start, stop)` along one axis. Coordinates of
    /// the result are local to the narrowed window.
    pub fn restrict(&self, axis: usize, start: usize, stop: usize) -> DestView<'a> {
        assert!(start <= stop && stop <= self.window[axis]);
        let mut offset = self.offset.clone();
        let mut window = self.window.clone();
        offset[axis] += start;
        window[axis] = stop - start;
        DestView {
            ptr: self.ptr,
            full_shape: self.full_shape.clone(),
            offset,
            window,
            _marker: PhantomData,
        }
    }

    pub fn window_shape(&self) -> &[usize] {
        &self.window
    }

    /// Copies the window `[src_start, src_start + size)` of a row-major
    /// source into this view at `local_start`.
    pub fn write_window(
        &self,
        local_start: &[usize],
        src: &[f32],
        src_shape: &[usize],
        src_start: &[usize],
        size: &[usize],
    ) {
        assert_eq!(local_start.len(), self.window.len());
        assert_eq!(src_shape.len(), size.len());
        assert_eq!(src_shape.len(), self.window.len());
        assert!(local_start
            .iter()
            .zip(size.iter())
            .zip(self.window.iter())
            .all(|((st, sz), dim)| st + sz <= *dim));
        assert!(src_start
            .iter()
            .zip(size.iter())
            .zip(src_shape.iter())
            .all(|((st, sz), dim)| st + sz <= *dim));
        if size.iter().any(|&s| s == 0) {
            return;
        }

        let src_strides = row_major_strides(src_shape);
        let dst_strides = row_major_strides(&self.full_shape);
        let src_base: usize = src_start
            .iter()
            .zip(src_strides.iter())
            .map(|(c, s)| c * s)
            .sum();
        let dst_base: usize = local_start
            .iter()
            .zip(self.offset.iter())
            .zip(dst_strides.iter())
            .map(|((l, o), s)| (l + o) * s)
            .sum();
        self.scatter(src, &src_strides, src_base, &dst_strides, dst_base, size);
    }

    fn scatter(
        &self,
        src: &[f32],
        src_strides: &[usize],
        src_base: usize,
        dst_strides: &[usize],
        dst_base: usize,
        size: &[usize],
    ) {
        if size.len() == 1 {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr().add(src_base),
                    self.ptr.add(dst_base),
                    size[0],
                );
            }
            return;
        }
        for i in 0..size[0] {
            self.scatter(
                src,
                &src_strides[1..],
                src_base + i * src_strides[0],
                &dst_strides[1..],
                dst_base + i * dst_strides[0],
                &size[1..],
            );
        }
    }

    /// The whole underlying buffer as one mutable slice, available only when
    /// the view is the full unnarrowed buffer.
    ///
    /// # Safety
    /// The caller must be the only live view over the buffer.
    pub unsafe fn contiguous_slice_mut(&self) -> Option<&mut [f32]> {
        let whole =
            self.offset.iter().all(|&o| o == 0) && self.window == self.full_shape;
        if !whole {
            return None;
        }
        let len = self.full_shape.iter().product();
        Some(std::slice::from_raw_parts_mut(self.ptr, len))
    }
}

/// Applies one filter at one sigma over requested regions of an upstream
/// source, handling Channel and Time axes the bank itself cannot batch.
pub struct FilterExec {
    filter: FilterId,
    sigma: f32,
    bank: Arc<dyn FilterBank>,
    source: Arc<dyn ArraySource>,
    input_desc: ArrayDescriptor,
    output_desc: ArrayDescriptor,
}

impl FilterExec {
    pub fn new(
        filter: FilterId,
        sigma: f32,
        bank: Arc<dyn FilterBank>,
        source: Arc<dyn ArraySource>,
    ) -> Result<Self> {
        let input_desc = source.descriptor();
        let axes = &input_desc.axes;
        if let Some(ci) = axes.channel_index() {
            if ci != axes.len() - 1 {
                return Err(EngineError::config("Channel axis must be last"));
            }
        }
        if let Some(ti) = axes.time_index() {
            if ti != 0 {
                return Err(EngineError::config("Time axis must be first"));
            }
        }
        if axes.spatial_dims() == 0 {
            return Err(EngineError::config("input has no spatial axes"));
        }

        let multiplicity = filter.channels_per_input(axes.spatial_dims());
        let (out_axes, c_idx) = axes.with_channel();
        let mut out_shape = input_desc.shape.clone();
        let in_channels = input_desc.channel_count();
        if c_idx < out_shape.len() {
            out_shape[c_idx] = in_channels * multiplicity;
        } else {
            out_shape.push(in_channels * multiplicity);
        }
        let output_desc = ArrayDescriptor::new(out_shape, out_axes, DType::F32);

        Ok(Self {
            filter,
            sigma,
            bank,
            source,
            input_desc,
            output_desc,
        })
    }

    pub fn descriptor(&self) -> &ArrayDescriptor {
        &self.output_desc
    }

    pub fn filter(&self) -> FilterId {
        self.filter
    }

    pub fn sigma(&self) -> f32 {
        self.sigma
    }

    /// Support radius driving halo sizing for this unit.
    pub fn support_radius(&self) -> f32 {
        self.filter.support_radius(self.sigma)
    }

    /// Computes the requested output region into `dest`, whose window shape
    /// must equal the region's shape. `precomputed` replaces upstream reads
    /// when the needed halo is already available.
    pub fn compute(
        &self,
        roi: &Roi,
        dest: &DestView<'_>,
        precomputed: Option<&HaloArray>,
    ) -> Result<()> {
        if !roi.fits(&self.output_desc.shape) {
            return Err(EngineError::config(format!(
                "requested region {:?}..{:?} exceeds output shape {:?}",
                roi.start, roi.stop, self.output_desc.shape
            )));
        }
        assert_eq!(
            dest.window_shape(),
            roi.shape().as_slice(),
            "destination window must match the requested region"
        );
        if roi.is_empty() {
            return Ok(());
        }

        let caps = self.bank.caps(self.filter);
        let radius = self.support_radius();
        if !caps.supports_roi && radius > ROI_SUPPORT_WARN_RADIUS {
            warn!(
                filter = ?self.filter,
                radius,
                "large support radius without region-restricted compute, \
                 whole slices will be computed and cropped"
            );
        }

        let out_axes = &self.output_desc.axes;
        let out_rank = out_axes.len();
        let c_axis = out_rank - 1;
        let multiplicity = self.filter.channels_per_input(out_axes.spatial_dims());
        let (c0, c1) = (roi.start[c_axis], roi.stop[c_axis]);

        let spatial_axes = out_axes.spatial_indices();
        let sp_start: Vec<usize> = spatial_axes.iter().map(|&a| roi.start[a]).collect();
        let sp_stop: Vec<usize> = spatial_axes.iter().map(|&a| roi.stop[a]).collect();
        let sp_shape: Vec<usize> = spatial_axes
            .iter()
            .map(|&a| self.output_desc.shape[a])
            .collect();
        let (halo_start, halo_stop) =
            extend_spatial(&sp_start, &sp_stop, &sp_shape, radius, caps.window_multiplier);
        let halo_shape: Vec<usize> = halo_start
            .iter()
            .zip(halo_stop.iter())
            .map(|(a, b)| b - a)
            .collect();
        let req_spatial: Vec<usize> = sp_start
            .iter()
            .zip(sp_stop.iter())
            .map(|(a, b)| b - a)
            .collect();

        let time_axis = out_axes.time_index();
        let time_extent = time_axis.map(|t| roi.stop[t] - roi.start[t]).unwrap_or(1);

        let first_channel = c0 / multiplicity;
        let last_channel = c1.div_ceil(multiplicity);
        for in_channel in first_channel..last_channel {
            let block_start = (in_channel * multiplicity).max(c0);
            let block_stop = ((in_channel + 1) * multiplicity).min(c1);

            let input_roi = self.input_region(roi, &halo_start, &halo_stop, in_channel);
            let halo_buf = match precomputed {
                Some(pre) => self.slice_precomputed(pre, &input_roi)?,
                None => self.source.read_region(&input_roi)?,
            };

            for t in 0..time_extent {
                let slice = self.spatial_slice(&halo_buf, time_axis.is_some(), t, &halo_shape);

                let direct = caps.supports_out
                    && halo_start == sp_start
                    && halo_stop == sp_stop
                    && block_start == c0
                    && block_stop == c1
                    && block_stop - block_start == multiplicity
                    && time_extent == 1;
                if direct {
                    // Only one channel block and no time steps: this task is
                    // the sole writer of the view.
                    if let Some(out) = unsafe { dest.contiguous_slice_mut() } {
                        self.bank.apply_into(
                            self.filter,
                            &slice,
                            self.sigma,
                            caps.window_multiplier,
                            out,
                        )?;
                        continue;
                    }
                }

                let inner_start: Vec<usize> = sp_start
                    .iter()
                    .zip(halo_start.iter())
                    .map(|(a, b)| a - b)
                    .collect();
                let inner = Roi::new(
                    inner_start.clone(),
                    inner_start
                        .iter()
                        .zip(req_spatial.iter())
                        .map(|(a, s)| a + s)
                        .collect(),
                );

                let mut result = self.bank.apply(
                    self.filter,
                    &slice,
                    self.sigma,
                    caps.window_multiplier,
                    if caps.supports_roi { Some(&inner) } else { None },
                )?;
                if !caps.supports_roi {
                    let mut crop_start = inner_start.clone();
                    crop_start.push(0);
                    let mut crop_size = req_spatial.clone();
                    crop_size.push(multiplicity);
                    result = result.sub_window(&crop_start, &crop_size);
                }

                self.scatter_result(
                    dest,
                    &result,
                    &req_spatial,
                    time_axis.is_some(),
                    t,
                    in_channel,
                    multiplicity,
                    c0,
                    block_start,
                    block_stop,
                );
            }
        }
        Ok(())
    }

    /// Input-axes region for one input channel's halo read.
    fn input_region(
        &self,
        roi: &Roi,
        halo_start: &[usize],
        halo_stop: &[usize],
        in_channel: usize,
    ) -> Roi {
        let out_axes = &self.output_desc.axes;
        let c_axis = out_axes.len() - 1;
        let mut region = roi.clone();
        for (i, &axis) in out_axes.spatial_indices().iter().enumerate() {
            region.start[axis] = halo_start[i];
            region.stop[axis] = halo_stop[i];
        }
        if self.input_desc.axes.channel_index().is_some() {
            region.start[c_axis] = in_channel;
            region.stop[c_axis] = in_channel + 1;
            region
        } else {
            region.drop_axis(c_axis)
        }
    }

    fn slice_precomputed(&self, pre: &HaloArray, input_roi: &Roi) -> Result<NdBuffer<f32>> {
        if !pre.region().contains(input_roi) {
            return Err(EngineError::config(format!(
                "prepared halo {:?} does not cover required region {:?}..{:?}",
                pre.region(),
                input_roi.start,
                input_roi.stop
            )));
        }
        let local_start: Vec<usize> = input_roi
            .start
            .iter()
            .zip(pre.start.iter())
            .map(|(a, b)| a - b)
            .collect();
        Ok(pre.data.sub_window(&local_start, &input_roi.shape()))
    }

    /// Extracts one purely spatial slice (single channel, single time step)
    /// from a halo buffer in input axis order.
    fn spatial_slice(
        &self,
        halo_buf: &NdBuffer<f32>,
        has_time: bool,
        t: usize,
        halo_shape: &[usize],
    ) -> NdBuffer<f32> {
        let rank = halo_buf.ndim();
        let mut start = vec![0usize; rank];
        let mut size = halo_buf.shape().to_vec();
        if has_time {
            start[0] = t;
            size[0] = 1;
        }
        if self.input_desc.axes.channel_index().is_some() {
            size[rank - 1] = 1;
        }
        halo_buf
            .sub_window(&start, &size)
            .reshape(halo_shape.to_vec())
    }

    #[allow(clippy::too_many_arguments)]
    fn scatter_result(
        &self,
        dest: &DestView<'_>,
        result: &NdBuffer<f32>,
        req_spatial: &[usize],
        has_time: bool,
        t: usize,
        in_channel: usize,
        multiplicity: usize,
        c0: usize,
        block_start: usize,
        block_stop: usize,
    ) {
        let out_rank = self.output_desc.ndim();
        let mut src_shape = Vec::with_capacity(out_rank);
        if has_time {
            src_shape.push(1);
        }
        src_shape.extend_from_slice(req_spatial);
        src_shape.push(multiplicity);

        let mut src_start = vec![0usize; out_rank];
        src_start[out_rank - 1] = block_start - in_channel * multiplicity;

        let mut dst_start = vec![0usize; out_rank];
        if has_time {
            dst_start[0] = t;
        }
        dst_start[out_rank - 1] = block_start - c0;

        let mut size = Vec::with_capacity(out_rank);
        if has_time {
            size.push(1);
        }
        size.extend_from_slice(req_spatial);
        size.push(block_stop - block_start);

        dest.write_window(&dst_start, result.as_slice(), &src_shape, &src_start, &size);
    }
}
