use std::ops::Range;

use burn::{
    prelude::Backend,
    tensor::{Tensor, TensorData, s},
};
use serde::{Deserialize, Serialize};

use crate::error::RFCNError;

/// How the feature-map positions inside one grid cell are reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PoolingMode {
    #[default]
    Average,
    Max,
}

/// Position-sensitive RoI pooling.
///
/// “R-FCN: Object Detection via Region-based Fully Convolutional Networks”
/// Authors: Jifeng Dai, Yi Li, Kaiming He, Jian Sun
/// Link (official): https://arxiv.org/abs/1605.06409
///
/// Each region is split into a `k x k` grid. Unlike ordinary RoI pooling, grid cell `(i, j)`
/// only reads its own bank of `channels_per_cell` channels,
///
/// ```text
///  channels [ (i*k + j) * cpc , (i*k + j + 1) * cpc )
///
///  ┌─────┬─────┬─────┐
///  │ 0,0 │ 0,1 │ 0,2 │   cell (0,0) -> bank 0
///  ├─────┼─────┼─────┤   cell (0,1) -> bank 1
///  │ 1,0 │ 1,1 │ 1,2 │   ...
///  ├─────┼─────┼─────┤   cell (2,2) -> bank 8
///  │ 2,0 │ 2,1 │ 2,2 │
///  └─────┴─────┴─────┘
/// ```
///
/// so a bank learns to respond to one relative position of the object (top-left corner,
/// center, ...), and the pooled grid encodes *where* inside the region each response sits.
///
/// # Arguments
///
/// * `score_map` - Tensor of shape `[batch, cpc * k * k, height, width]`.
/// * `rois` - Regions of shape `[num_rois, 4]` in xyxy image coordinates.
/// * `image` - Batch entry of `score_map` the regions belong to.
/// * `roi_size` - Grid size `k`.
/// * `stride` - Input image pixels per feature-map cell.
/// * `mode` - Reduction applied inside each grid cell.
///
/// # Returns
///
/// * `Tensor<B, 4>` - Pooled grid of shape `[num_rois, cpc, k, k]`. Cells whose footprint is
///   empty (degenerate regions, regions outside the map) are `0`.
pub fn ps_roi_pool<B: Backend>(
    score_map: Tensor<B, 4>,
    rois: Tensor<B, 2>,
    image: usize,
    roi_size: usize,
    stride: f32,
    mode: PoolingMode,
) -> Result<Tensor<B, 4>, RFCNError> {
    let [batch, channels, height, width] = score_map.dims();
    let [num_rois, _] = rois.dims();
    let cells = roi_size * roi_size;

    if cells == 0 || channels % cells != 0 {
        return Err(RFCNError::ChannelMismatch { channels, cells });
    }

    if image >= batch {
        return Err(RFCNError::BatchMismatch {
            features: batch,
            proposals: image + 1,
        });
    }

    if num_rois == 0 {
        return Err(RFCNError::DegenerateInput { image });
    }

    let channels_per_cell = channels / cells;
    let device = score_map.device();

    let map = score_map
        .slice(s![image..image + 1])
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()?;
    let regions = rois.into_data().convert::<f32>().to_vec::<f32>()?;

    let plane = height * width;
    let mut pooled = vec![0.0f32; num_rois * channels_per_cell * cells];

    for (r, roi) in regions.chunks_exact(4).enumerate() {
        // project the region onto the feature map
        let x1 = roi[0] / stride;
        let y1 = roi[1] / stride;
        let roi_w = roi[2] / stride - x1;
        let roi_h = roi[3] / stride - y1;

        // also rejects NaN coordinates
        if !(roi_w > 0.0 && roi_h > 0.0) {
            continue;
        }

        let bin_w = roi_w / roi_size as f32;
        let bin_h = roi_h / roi_size as f32;

        for i in 0..roi_size {
            let rows = bin_bounds(
                y1 + i as f32 * bin_h,
                y1 + (i + 1) as f32 * bin_h,
                height,
            );

            for j in 0..roi_size {
                let cols = bin_bounds(
                    x1 + j as f32 * bin_w,
                    x1 + (j + 1) as f32 * bin_w,
                    width,
                );

                if rows.is_empty() || cols.is_empty() {
                    continue;
                }

                let cell = i * roi_size + j;

                for c in 0..channels_per_cell {
                    let channel = cell * channels_per_cell + c;
                    let values = &map[channel * plane..(channel + 1) * plane];

                    pooled[(r * channels_per_cell + c) * cells + cell] =
                        pool_window(values, width, rows.clone(), cols.clone(), mode);
                }
            }
        }
    }

    Ok(Tensor::from_data(
        TensorData::new(pooled, [num_rois, channels_per_cell, roi_size, roi_size]),
        &device,
    ))
}

/// Averages the `k x k` grid of every region into one score per channel.
///
/// `[num_rois, cpc, k, k]` -> `[num_rois, cpc]`
pub fn vote<B: Backend>(pooled: Tensor<B, 4>) -> Tensor<B, 2> {
    let [num_rois, channels, kh, kw] = pooled.dims();

    pooled
        .reshape([num_rois, channels, kh * kw])
        .mean_dim(2)
        .reshape([num_rois, channels])
}

/// Keeps the grid positions, laid out channel-major.
///
/// `[num_rois, cpc, k, k]` -> `[num_rois, cpc * k * k]`
pub fn flatten_cells<B: Backend>(pooled: Tensor<B, 4>) -> Tensor<B, 2> {
    let [num_rois, channels, kh, kw] = pooled.dims();
    pooled.reshape([num_rois, channels * kh * kw])
}

// Integer footprint of a bin: floor of the start, ceil of the end, clamped to the map.
fn bin_bounds(start: f32, end: f32, size: usize) -> Range<usize> {
    let size = size as f32;
    let lo = start.floor().clamp(0.0, size) as usize;
    let hi = end.ceil().clamp(0.0, size) as usize;
    lo..hi.max(lo)
}

fn pool_window(
    values: &[f32],
    width: usize,
    rows: Range<usize>,
    cols: Range<usize>,
    mode: PoolingMode,
) -> f32 {
    let count = (rows.len() * cols.len()) as f32;
    let window = rows.flat_map(|y| values[y * width + cols.start..y * width + cols.end].iter());

    match mode {
        PoolingMode::Average => window.sum::<f32>() / count,
        PoolingMode::Max => window.fold(f32::NEG_INFINITY, |acc, v| acc.max(*v)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::{NdArray, ndarray::NdArrayDevice},
        tensor::{Tolerance, ops::FloatElem},
    };

    type B = NdArray<f32>;
    type FT = FloatElem<B>;

    const K: usize = 3;
    const CPC: usize = 2;

    // Every channel bank holds `10 * cell + c` inside its own cell footprint and a large
    // distractor everywhere else, so reading the wrong bank or the wrong pixels shows up.
    fn banked_map(device: &NdArrayDevice, cell_px: usize) -> Tensor<B, 4> {
        let side = K * cell_px;
        let mut data = vec![1000.0f32; K * K * CPC * side * side];

        for i in 0..K {
            for j in 0..K {
                let cell = i * K + j;
                for c in 0..CPC {
                    let channel = cell * CPC + c;
                    for y in i * cell_px..(i + 1) * cell_px {
                        for x in j * cell_px..(j + 1) * cell_px {
                            data[channel * side * side + y * side + x] = (10 * cell + c) as f32;
                        }
                    }
                }
            }
        }

        Tensor::from_data(TensorData::new(data, [1, K * K * CPC, side, side]), device)
    }

    fn expected_grid() -> Vec<f32> {
        let mut expected = vec![];
        for c in 0..CPC {
            for cell in 0..K * K {
                expected.push((10 * cell + c) as f32);
            }
        }
        expected
    }

    #[test]
    fn test_channel_binding_per_cell() {
        let device = &NdArrayDevice::default();
        let map = banked_map(device, 3);
        let rois = Tensor::<B, 2>::from_data([[0.0, 0.0, 9.0, 9.0]], device);

        let pooled = ps_roi_pool(map, rois, 0, K, 1.0, PoolingMode::Average).unwrap();

        assert_eq!(pooled.dims(), [1, CPC, K, K]);
        Tensor::<B, 4>::from_data(TensorData::new(expected_grid(), [1, CPC, K, K]), device)
            .into_data()
            .assert_approx_eq::<FT>(&pooled.to_data(), Tolerance::absolute(1e-5));
    }

    #[test]
    fn test_stride_projects_region() {
        let device = &NdArrayDevice::default();
        let map = banked_map(device, 2);

        // 6x6 map at stride 8 covers a 48x48 image
        let rois = Tensor::<B, 2>::from_data([[0.0, 0.0, 48.0, 48.0]], device);
        let pooled = ps_roi_pool(map, rois, 0, K, 8.0, PoolingMode::Max).unwrap();

        Tensor::<B, 4>::from_data(TensorData::new(expected_grid(), [1, CPC, K, K]), device)
            .into_data()
            .assert_approx_eq::<FT>(&pooled.to_data(), Tolerance::absolute(1e-5));
    }

    #[test]
    fn test_vote_and_flatten() {
        let device = &NdArrayDevice::default();
        let map = banked_map(device, 3);
        let rois = Tensor::<B, 2>::from_data([[0.0, 0.0, 9.0, 9.0]], device);

        let pooled = ps_roi_pool(map, rois, 0, K, 1.0, PoolingMode::Average).unwrap();

        // mean of 10 * cell over 9 cells is 40
        Tensor::<B, 2>::from_data([[40.0, 41.0]], device)
            .into_data()
            .assert_approx_eq::<FT>(&vote(pooled.clone()).to_data(), Tolerance::absolute(1e-4));

        let flat = flatten_cells(pooled);
        assert_eq!(flat.dims(), [1, CPC * K * K]);
        Tensor::<B, 2>::from_data(TensorData::new(expected_grid(), [1, CPC * K * K]), device)
            .into_data()
            .assert_approx_eq::<FT>(&flat.to_data(), Tolerance::absolute(1e-5));
    }

    #[test]
    fn test_max_picks_hot_pixel() {
        let device = &NdArrayDevice::default();
        let mut data = vec![0.0f32; 4 * 4 * 4];
        // channel 3 belongs to cell (1, 1) of a 2x2 grid; hot pixel at y=3, x=2
        data[3 * 16 + 3 * 4 + 2] = 7.5;
        // same pixel in channel 0 (cell (0, 0)) is outside that cell's footprint
        data[3 * 4 + 2] = 99.0;

        let map = Tensor::<B, 4>::from_data(TensorData::new(data, [1, 4, 4, 4]), device);
        let rois = Tensor::<B, 2>::from_data([[0.0, 0.0, 4.0, 4.0]], device);

        let pooled = ps_roi_pool(map, rois, 0, 2, 1.0, PoolingMode::Max)
            .unwrap()
            .to_data()
            .to_vec::<f32>()
            .unwrap();

        assert_eq!(pooled, vec![0.0, 0.0, 0.0, 7.5]);
    }

    #[test]
    fn test_degenerate_region_is_zero() {
        let device = &NdArrayDevice::default();
        let map = banked_map(device, 3);
        let rois = Tensor::<B, 2>::from_data(
            [[5.0, 5.0, 5.0, 5.0], [8.0, 2.0, 3.0, 6.0], [200.0, 200.0, 300.0, 300.0]],
            device,
        );

        let pooled = ps_roi_pool(map, rois, 0, K, 1.0, PoolingMode::Average)
            .unwrap()
            .to_data()
            .to_vec::<f32>()
            .unwrap();

        assert_eq!(pooled.len(), 3 * CPC * K * K);
        assert!(pooled.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_channel_count_must_match_grid() {
        let device = &NdArrayDevice::default();
        let map = Tensor::<B, 4>::zeros([1, 10, 4, 4], device);
        let rois = Tensor::<B, 2>::from_data([[0.0, 0.0, 4.0, 4.0]], device);

        let err = ps_roi_pool(map, rois, 0, 3, 1.0, PoolingMode::Average).unwrap_err();
        assert!(matches!(
            err,
            RFCNError::ChannelMismatch {
                channels: 10,
                cells: 9
            }
        ));
    }

    #[test]
    fn test_bin_bounds_clamp_to_map() {
        assert_eq!(bin_bounds(-2.5, 1.2, 8), 0..2);
        assert_eq!(bin_bounds(6.5, 9.7, 8), 6..8);
        assert_eq!(bin_bounds(10.0, 12.0, 8), 8..8);
    }
}
