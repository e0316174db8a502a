// 该文件是 Zhulong （烛龙） 项目的一部分。
// src/buffer.rs - 图像/张量/检测缓冲定义
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

use std::ops::{Deref, DerefMut};
use std::time::Instant;

use crate::device::{DeviceError, UnifiedItem};

pub const RGB_CHANNELS: usize = 3;

/// 单个检测结果，坐标为图像像素系下的左上角框。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
  pub x: f32,
  pub y: f32,
  pub w: f32,
  pub h: f32,
  pub conf: f32,
  pub class_id: u32,
}

/// 一帧的检测输出，容量固定为 max_detections，按置信度降序排列。
/// 消费者只读，内容在下一帧被覆盖。
#[derive(Debug, Clone)]
pub struct DetectionBuffer {
  detections: Vec<Detection>,
  count: usize,
  pub timestamp: Instant,
}

impl DetectionBuffer {
  pub fn new(capacity: usize) -> Self {
    DetectionBuffer {
      detections: vec![Detection::default(); capacity],
      count: 0,
      timestamp: Instant::now(),
    }
  }

  pub fn capacity(&self) -> usize {
    self.detections.len()
  }

  pub fn count(&self) -> usize {
    self.count
  }

  /// 本帧有效的检测，长度等于 `count`。
  pub fn as_slice(&self) -> &[Detection] {
    &self.detections[..self.count]
  }

  pub(crate) fn set_count(&mut self, count: usize) {
    self.count = count.min(self.detections.len());
  }

  pub(crate) fn slot_mut(&mut self, index: usize) -> &mut Detection {
    &mut self.detections[index]
  }
}

/// 相机帧：宽 × 高 × 3 字节，RGB8 交错，行主序。
pub struct ImageBuffer {
  pub width: u32,
  pub height: u32,
  data: UnifiedItem<u8>,
  pub timestamp: Instant,
}

impl ImageBuffer {
  pub fn new(width: u32, height: u32) -> Result<Self, DeviceError> {
    Ok(ImageBuffer {
      width,
      height,
      data: UnifiedItem::new(width as usize * height as usize * RGB_CHANNELS)?,
      timestamp: Instant::now(),
    })
  }
}

impl Deref for ImageBuffer {
  type Target = UnifiedItem<u8>;
  fn deref(&self) -> &Self::Target {
    &self.data
  }
}

impl DerefMut for ImageBuffer {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.data
  }
}

impl Clone for ImageBuffer {
  fn clone(&self) -> Self {
    let mut data =
      UnifiedItem::new(self.data.len()).expect("克隆 ImageBuffer 时主机内存分配失败");
    data
      .iter_mut()
      .zip(self.data.iter())
      .for_each(|(dst, src)| *dst = *src);
    ImageBuffer {
      width: self.width,
      height: self.height,
      data,
      timestamp: self.timestamp,
    }
  }
}

/// 浮点张量缓冲，形状在构造后不再改变。
pub struct TensorBuffer {
  shape: Vec<usize>,
  data: UnifiedItem<f32>,
  pub timestamp: Instant,
}

impl TensorBuffer {
  pub fn new(shape: Vec<usize>) -> Result<Self, DeviceError> {
    Ok(TensorBuffer {
      data: UnifiedItem::new(shape.iter().product())?,
      shape,
      timestamp: Instant::now(),
    })
  }

  pub fn shape(&self) -> &[usize] {
    &self.shape
  }
}

impl Deref for TensorBuffer {
  type Target = UnifiedItem<f32>;
  fn deref(&self) -> &Self::Target {
    &self.data
  }
}

impl DerefMut for TensorBuffer {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.data
  }
}

impl Clone for TensorBuffer {
  fn clone(&self) -> Self {
    let mut data =
      UnifiedItem::new(self.data.len()).expect("克隆 TensorBuffer 时主机内存分配失败");
    data
      .iter_mut()
      .zip(self.data.iter())
      .for_each(|(dst, src)| *dst = *src);
    TensorBuffer {
      shape: self.shape.clone(),
      data,
      timestamp: self.timestamp,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_image_buffer_size() {
    let image = ImageBuffer::new(640, 480).unwrap();
    assert_eq!(image.len(), 640 * 480 * 3);
  }

  #[test]
  fn test_tensor_buffer_shape() {
    let tensor = TensorBuffer::new(vec![1, 3, 480, 640]).unwrap();
    assert_eq!(tensor.shape(), &[1, 3, 480, 640]);
    assert_eq!(tensor.len(), 3 * 480 * 640);
  }

  #[test]
  fn test_tensor_buffer_clone_copies_host_data() {
    let mut tensor = TensorBuffer::new(vec![4]).unwrap();
    tensor
      .iter_mut()
      .enumerate()
      .for_each(|(i, num)| *num = i as f32);
    let cloned = tensor.clone();
    for (a, b) in tensor.iter().zip(cloned.iter()) {
      assert_eq!(a, b);
    }
  }

  #[test]
  fn test_detection_buffer_bounds() {
    let mut buffer = DetectionBuffer::new(4);
    assert_eq!(buffer.capacity(), 4);
    assert_eq!(buffer.count(), 0);
    buffer.set_count(9);
    assert!(buffer.count() <= buffer.capacity());
  }
}
