// 该文件是 Zhulong （烛龙） 项目的一部分。
// src/stage.rs - 张量装填（像素缓冲 → 归一化平面张量）
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

use crate::buffer::{ImageBuffer, RGB_CHANNELS, TensorBuffer};
use crate::device::{DeviceError, UnifiedTrait};

#[derive(Error, Debug)]
pub enum StageError {
  #[error("图像尺寸不匹配: 期望 {expected_width}x{expected_height}, 实际 {width}x{height}")]
  DimensionMismatch {
    expected_width: u32,
    expected_height: u32,
    width: u32,
    height: u32,
  },
  #[error("设备错误: {0}")]
  Device(#[from] DeviceError),
}

/// 把交错的 RGB8 像素缓冲转换为 `[1, 3, H, W]` 平面 float32 张量，
/// 取值归一化到 `[0, 1]`。输入张量由装填器持有，绑定进引擎时不拷贝。
///
/// 像素缓冲的尺寸必须与配置完全一致，不做隐式缩放。
pub struct TensorStager {
  width: u32,
  height: u32,
  tensor: TensorBuffer,
}

impl TensorStager {
  pub fn new(width: u32, height: u32) -> Result<Self, StageError> {
    let mut tensor = TensorBuffer::new(vec![
      1,
      RGB_CHANNELS,
      height as usize,
      width as usize,
    ])?;
    // 设备镜像在构造期建立，stage 热路径内不再分配
    tensor.reserve_device()?;
    debug!("输入张量形状: {:?}", tensor.shape());
    Ok(TensorStager {
      width,
      height,
      tensor,
    })
  }

  /// 供引擎绑定输入张量地址。
  pub fn tensor_mut(&mut self) -> &mut TensorBuffer {
    &mut self.tensor
  }

  /// 装填一帧。每像素三个交错字节按通道拆分到三个连续平面并归一化。
  pub fn stage(&mut self, image: &mut ImageBuffer) -> Result<&mut TensorBuffer, StageError> {
    if image.width != self.width || image.height != self.height {
      return Err(StageError::DimensionMismatch {
        expected_width: self.width,
        expected_height: self.height,
        width: image.width,
        height: image.height,
      });
    }

    self.convert(image)?;
    self.tensor.timestamp = image.timestamp;
    Ok(&mut self.tensor)
  }

  #[cfg(feature = "cuda")]
  fn convert(&mut self, image: &mut ImageBuffer) -> Result<(), StageError> {
    let input = image.to_device()?;
    let output = self.tensor.device()?;
    crate::device::cuda::convert_rgb888_3dtensor(input, output, self.width, self.height)?;
    Ok(())
  }

  #[cfg(not(feature = "cuda"))]
  fn convert(&mut self, image: &mut ImageBuffer) -> Result<(), StageError> {
    let plane = self.width as usize * self.height as usize;
    let dst = self.tensor.as_mut_slice();
    for (i, pixel) in image.as_slice().chunks_exact(RGB_CHANNELS).enumerate() {
      dst[i] = pixel[0] as f32 / 255.0;
      dst[plane + i] = pixel[1] as f32 / 255.0;
      dst[2 * plane + i] = pixel[2] as f32 / 255.0;
    }
    // 刷新设备镜像，保证绑定的地址看到的是本帧数据
    self.tensor.to_device()?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn filled_image(width: u32, height: u32, rgb: [u8; 3]) -> ImageBuffer {
    let mut image = ImageBuffer::new(width, height).unwrap();
    for pixel in image.as_mut_slice().chunks_exact_mut(RGB_CHANNELS) {
      pixel.copy_from_slice(&rgb);
    }
    image
  }

  #[test]
  fn test_dimension_mismatch_is_error() {
    let mut stager = TensorStager::new(8, 8).unwrap();
    let mut image = ImageBuffer::new(4, 8).unwrap();
    assert!(matches!(
      stager.stage(&mut image),
      Err(StageError::DimensionMismatch {
        expected_width: 8,
        expected_height: 8,
        width: 4,
        height: 8,
      })
    ));
  }

  #[test]
  fn test_normalization_and_planar_layout() {
    let mut stager = TensorStager::new(2, 2).unwrap();
    let mut image = ImageBuffer::new(2, 2).unwrap();
    // 第一个像素 (255, 0, 128)，其余为零
    let data = image.as_mut_slice();
    data[0] = 255;
    data[1] = 0;
    data[2] = 128;

    let tensor = stager.stage(&mut image).unwrap();
    let plane = 4;
    let values = tensor.as_slice();
    assert_eq!(values[0], 1.0);
    assert_eq!(values[plane], 0.0);
    assert_eq!(values[2 * plane], 128.0 / 255.0);
    // 其余位置保持 0
    assert_eq!(values[1], 0.0);
    assert_eq!(values[plane + 1], 0.0);
  }

  #[test]
  fn test_staging_is_deterministic() {
    let mut stager = TensorStager::new(4, 4).unwrap();
    let mut image = filled_image(4, 4, [10, 20, 30]);

    let first: Vec<f32> = stager.stage(&mut image).unwrap().as_slice().to_vec();
    let second: Vec<f32> = stager.stage(&mut image).unwrap().as_slice().to_vec();
    assert_eq!(first, second);
  }

  #[test]
  fn test_full_white_maps_to_one() {
    let mut stager = TensorStager::new(4, 2).unwrap();
    let mut image = filled_image(4, 2, [255, 255, 255]);
    let tensor = stager.stage(&mut image).unwrap();
    assert!(tensor.as_slice().iter().all(|v| *v == 1.0));
  }
}
