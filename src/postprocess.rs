// 该文件是 Zhulong （烛龙） 项目的一部分。
// src/postprocess.rs - 检测后处理（过滤 → 排序 → NMS → 输出）
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use thiserror::Error;
use tracing::debug;

use crate::buffer::{Detection, DetectionBuffer, TensorBuffer};
use crate::config::{ConfigError, PipelineConfig};
use crate::device::DeviceError;

/// 候选行宽度: cx, cy, w, h, conf, class
const ROW_FLOATS: usize = 6;

#[derive(Error, Debug)]
pub enum PostprocessError {
  #[error("原始输出长度 {actual} 与期望 {expected} 不符 ({anchors} 锚点 × {channels} 通道)")]
  OutputShapeMismatch {
    expected: usize,
    actual: usize,
    anchors: usize,
    channels: usize,
  },
  #[error("检测输出缓冲容量 {capacity} 小于 max_detections {max}")]
  OutputCapacityTooSmall { capacity: usize, max: usize },
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
  #[error("设备错误: {0}")]
  Device(#[from] DeviceError),
}

/// 把原始输出张量约简为有界的检测列表。
///
/// 原始输出为通道主序 `[1, 5 + num_classes, N]`：
/// 前四个通道是中心格式包围盒 (cx, cy, w, h)，第五个通道是 objectness，
/// 其后是各类别分数；候选置信度取 objectness × 最高类别分数。
///
/// NMS 是类别感知的：只在同类别候选之间做抑制，
/// 不同类别的重叠框彼此保留。
///
/// 暂存区按 `feature_map_size` 在构造时分配一次，逐帧复用，
/// 释放随 `Drop` 完成。
pub struct PostProcessor {
  max_detections: u16,
  confidence_threshold: f32,
  iou_threshold: f32,
  feature_map_size: u16,
  num_classes: usize,
  width: u32,
  height: u32,
  #[cfg(not(feature = "cuda"))]
  transformed: Vec<f32>,
  #[cfg(not(feature = "cuda"))]
  indices: Vec<usize>,
  /// 核函数直接写出的主机可见行缓冲
  #[cfg(feature = "cuda")]
  emitted: TensorBuffer,
}

impl PostProcessor {
  pub fn new(config: &PipelineConfig) -> Result<Self, PostprocessError> {
    if !(0.0..=1.0).contains(&config.confidence_threshold) {
      return Err(
        ConfigError::ThresholdOutOfRange("confidence_threshold", config.confidence_threshold)
          .into(),
      );
    }
    if !(0.0..=1.0).contains(&config.iou_threshold) {
      return Err(ConfigError::ThresholdOutOfRange("iou_threshold", config.iou_threshold).into());
    }
    if config.feature_map_size == 0 {
      return Err(ConfigError::ZeroFeatureMap.into());
    }
    if config.num_classes == 0 {
      return Err(ConfigError::ZeroClasses.into());
    }

    let anchors = config.feature_map_size as usize;
    debug!(
      "后处理暂存区: {} 锚点 × {} 列, 最多输出 {} 个检测",
      anchors, ROW_FLOATS, config.max_detections
    );

    #[cfg(feature = "cuda")]
    let emitted = TensorBuffer::new(vec![config.max_detections as usize, ROW_FLOATS])?;

    #[cfg(feature = "cuda")]
    {
      crate::device::cuda::check(unsafe {
        crate::device::cuda::ffi::postprocess_init(
          config.max_detections,
          config.confidence_threshold,
          config.iou_threshold,
          config.feature_map_size,
          config.num_classes as u16,
        )
      })?;
    }

    Ok(PostProcessor {
      max_detections: config.max_detections,
      confidence_threshold: config.confidence_threshold,
      iou_threshold: config.iou_threshold,
      feature_map_size: config.feature_map_size,
      num_classes: config.num_classes,
      width: config.width,
      height: config.height,
      #[cfg(not(feature = "cuda"))]
      transformed: vec![0.0; anchors * ROW_FLOATS],
      #[cfg(not(feature = "cuda"))]
      indices: Vec::with_capacity(anchors),
      #[cfg(feature = "cuda")]
      emitted,
    })
  }

  /// 每个锚点的通道数。
  fn channels(&self) -> usize {
    5 + self.num_classes
  }

  /// 处理一帧原始输出，检测写入 `out` 并返回数量。
  ///
  /// `raw` 的长度必须等于 `(5 + num_classes) × feature_map_size`，
  /// 违反视为调用方契约错误并被拒绝。
  pub fn post_process(
    &mut self,
    raw: &mut TensorBuffer,
    out: &mut DetectionBuffer,
  ) -> Result<usize, PostprocessError> {
    let anchors = self.feature_map_size as usize;
    let expected = self.channels() * anchors;
    if raw.len() != expected {
      return Err(PostprocessError::OutputShapeMismatch {
        expected,
        actual: raw.len(),
        anchors,
        channels: self.channels(),
      });
    }
    if out.capacity() < self.max_detections as usize {
      return Err(PostprocessError::OutputCapacityTooSmall {
        capacity: out.capacity(),
        max: self.max_detections as usize,
      });
    }

    let count = self.reduce(raw, out)?;
    out.set_count(count);
    out.timestamp = raw.timestamp;
    debug!("本帧检测数: {}", count);
    Ok(count)
  }

  #[cfg(feature = "cuda")]
  fn reduce(
    &mut self,
    raw: &mut TensorBuffer,
    out: &mut DetectionBuffer,
  ) -> Result<usize, PostprocessError> {
    use crate::device::UnifiedTrait;

    let input = raw.device()?;
    let mut num_detections: u16 = 0;
    crate::device::cuda::check(unsafe {
      crate::device::cuda::ffi::postprocess(input, self.emitted.host(), &mut num_detections)
    })?;

    let count = (num_detections as usize).min(self.max_detections as usize);
    let rows = self.emitted.as_slice();
    for i in 0..count {
      let row = &rows[i * ROW_FLOATS..(i + 1) * ROW_FLOATS];
      *out.slot_mut(i) = emit_pixel_box(
        self.width,
        self.height,
        row[0],
        row[1],
        row[2],
        row[3],
        row[4],
        row[5] as u32,
      );
    }
    Ok(count)
  }

  #[cfg(not(feature = "cuda"))]
  fn reduce(
    &mut self,
    raw: &mut TensorBuffer,
    out: &mut DetectionBuffer,
  ) -> Result<usize, PostprocessError> {
    use crate::device::UnifiedTrait;

    raw.to_host()?;
    let anchors = self.feature_map_size as usize;
    let num_classes = self.num_classes;
    let confidence_threshold = self.confidence_threshold;
    let iou_threshold = self.iou_threshold;
    let max_detections = self.max_detections as usize;
    let (width, height) = (self.width, self.height);
    let transformed = &mut self.transformed;
    let indices = &mut self.indices;
    let values = raw.as_slice();

    // 1) 变换与过滤：各锚点相互独立
    for anchor in 0..anchors {
      let objectness = values[4 * anchors + anchor];
      let mut best_score = f32::MIN;
      let mut best_class = 0usize;
      for class in 0..num_classes {
        let score = values[(5 + class) * anchors + anchor];
        if score > best_score {
          best_score = score;
          best_class = class;
        }
      }
      let conf = objectness * best_score;

      let row = &mut transformed[anchor * ROW_FLOATS..(anchor + 1) * ROW_FLOATS];
      row[0] = values[anchor];
      row[1] = values[anchors + anchor];
      row[2] = values[2 * anchors + anchor];
      row[3] = values[3 * anchors + anchor];
      // 低于阈值的锚点直接标记为无效
      row[4] = if conf < confidence_threshold { -1.0 } else { conf };
      row[5] = best_class as f32;
    }

    // 2) 对存活锚点按置信度降序建立索引；并列时次序不作保证
    indices.clear();
    for anchor in 0..anchors {
      if transformed[anchor * ROW_FLOATS + 4] >= 0.0 {
        indices.push(anchor);
      }
    }
    indices.sort_unstable_by(|&a, &b| {
      let conf_a = transformed[a * ROW_FLOATS + 4];
      let conf_b = transformed[b * ROW_FLOATS + 4];
      conf_b
        .partial_cmp(&conf_a)
        .unwrap_or(std::cmp::Ordering::Equal)
    });

    // 3) 贪心 NMS：接受当前最高者，抑制同类别中重叠过大的后继
    let mut count = 0usize;
    for pos in 0..indices.len() {
      if count >= max_detections {
        break;
      }
      let anchor = indices[pos];
      let base = anchor * ROW_FLOATS;
      let conf = transformed[base + 4];
      if conf < 0.0 {
        continue;
      }

      let accepted: [f32; 4] = transformed[base..base + 4].try_into().unwrap();
      let accepted_class = transformed[base + 5];

      // 4) 接受即转换为像素坐标写出
      *out.slot_mut(count) = emit_pixel_box(
        width,
        height,
        accepted[0],
        accepted[1],
        accepted[2],
        accepted[3],
        conf,
        accepted_class as u32,
      );
      count += 1;

      for &other in &indices[pos + 1..] {
        let other_base = other * ROW_FLOATS;
        if transformed[other_base + 4] < 0.0 {
          continue;
        }
        if transformed[other_base + 5] != accepted_class {
          continue;
        }
        let candidate: [f32; 4] = transformed[other_base..other_base + 4].try_into().unwrap();
        if iou(&accepted, &candidate) > iou_threshold {
          transformed[other_base + 4] = -1.0;
        }
      }
    }

    Ok(count)
  }
}

/// 中心格式模型坐标 → 裁剪到图像范围内的左上角像素框。
#[allow(clippy::too_many_arguments)]
fn emit_pixel_box(
  width: u32,
  height: u32,
  cx: f32,
  cy: f32,
  w: f32,
  h: f32,
  conf: f32,
  class_id: u32,
) -> Detection {
  let max_w = width as f32;
  let max_h = height as f32;
  let x1 = (cx - w / 2.0).clamp(0.0, max_w);
  let y1 = (cy - h / 2.0).clamp(0.0, max_h);
  let x2 = (cx + w / 2.0).clamp(0.0, max_w);
  let y2 = (cy + h / 2.0).clamp(0.0, max_h);
  Detection {
    x: x1,
    y: y1,
    w: x2 - x1,
    h: y2 - y1,
    conf,
    class_id,
  }
}

#[cfg(feature = "cuda")]
impl Drop for PostProcessor {
  fn drop(&mut self) {
    if let Err(err) =
      crate::device::cuda::check(unsafe { crate::device::cuda::ffi::postprocess_destroy() })
    {
      tracing::error!("释放后处理暂存区失败: {}", err);
    }
  }
}

/// 标准交并比。任一框面积退化为零时返回 0，不做除零。
fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let (ax1, ay1, ax2, ay2) = corners(a);
  let (bx1, by1, bx2, by2) = corners(b);

  let inter_w = (ax2.min(bx2) - ax1.max(bx1)).max(0.0);
  let inter_h = (ay2.min(by2) - ay1.max(by1)).max(0.0);
  let intersection = inter_w * inter_h;

  let area_a = (ax2 - ax1) * (ay2 - ay1);
  let area_b = (bx2 - bx1) * (by2 - by1);
  let union = area_a + area_b - intersection;

  if union > 0.0 { intersection / union } else { 0.0 }
}

fn corners(bbox: &[f32; 4]) -> (f32, f32, f32, f32) {
  let [cx, cy, w, h] = *bbox;
  (cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
}
