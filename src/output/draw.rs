// 该文件是 Zhulong （烛龙） 项目的一部分。
// src/output/draw.rs - 检测结果绘制
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

use ab_glyph::FontVec;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use thiserror::Error;

use crate::buffer::{DetectionBuffer, ImageBuffer};

// 按类别轮换的边框颜色
const BOX_PALETTE: [[u8; 3]; 6] = [
  [255, 56, 56],
  [56, 255, 56],
  [56, 56, 255],
  [255, 200, 0],
  [0, 200, 255],
  [255, 0, 200],
];
const BORDER_WIDTH: i32 = 2;
const LABEL_FONT_SIZE: f32 = 18.0;

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("字体文件无效: {0}")]
  InvalidFont(String),
}

/// 把像素缓冲拷出为 `RgbImage`。
pub fn to_rgb_image(frame: &ImageBuffer) -> RgbImage {
  RgbImage::from_raw(frame.width, frame.height, frame.as_slice().to_vec())
    .expect("像素缓冲长度与宽高不一致")
}

/// 在帧上绘制检测框；提供字体文件时叠加 “类别:置信度” 标签。
pub struct Draw {
  font: Option<FontVec>,
  font_size: f32,
}

impl Default for Draw {
  fn default() -> Self {
    Draw {
      font: None,
      font_size: LABEL_FONT_SIZE,
    }
  }
}

impl Draw {
  pub fn with_font_path(path: &str) -> Result<Self, DrawError> {
    let data = std::fs::read(path)?;
    let font =
      FontVec::try_from_vec(data).map_err(|err| DrawError::InvalidFont(err.to_string()))?;
    Ok(Draw {
      font: Some(font),
      font_size: LABEL_FONT_SIZE,
    })
  }

  pub fn draw_detections(&self, frame: &ImageBuffer, result: &DetectionBuffer) -> RgbImage {
    let mut image = to_rgb_image(frame);

    for det in result.as_slice() {
      let color = BOX_PALETTE[det.class_id as usize % BOX_PALETTE.len()];
      let w = det.w as u32;
      let h = det.h as u32;
      if w == 0 || h == 0 {
        continue;
      }
      let x = det.x as i32;
      let y = det.y as i32;

      for i in 0..BORDER_WIDTH {
        let rect_w = w.saturating_sub(2 * i as u32);
        let rect_h = h.saturating_sub(2 * i as u32);
        if rect_w == 0 || rect_h == 0 {
          break;
        }
        draw_hollow_rect_mut(
          &mut image,
          Rect::at(x + i, y + i).of_size(rect_w, rect_h),
          Rgb(color),
        );
      }

      if let Some(font) = &self.font {
        let label = format!("{}:{:.0}%", det.class_id, det.conf * 100.0);
        let text_y = (y - self.font_size as i32).max(0);
        draw_text_mut(
          &mut image,
          Rgb(color),
          x,
          text_y,
          self.font_size,
          font,
          &label,
        );
      }
    }

    image
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::buffer::Detection;

  #[test]
  fn test_draw_marks_box_border() {
    let mut frame = ImageBuffer::new(32, 32).unwrap();
    frame.as_mut_slice().fill(0);
    let mut result = DetectionBuffer::new(4);
    *result.slot_mut(0) = Detection {
      x: 8.0,
      y: 8.0,
      w: 10.0,
      h: 10.0,
      conf: 0.9,
      class_id: 0,
    };
    result.set_count(1);

    let image = Draw::default().draw_detections(&frame, &result);
    // 边框左上角像素应被染色
    assert_ne!(image.get_pixel(8, 8).0, [0, 0, 0]);
    // 框内部保持原样
    assert_eq!(image.get_pixel(13, 13).0, [0, 0, 0]);
  }

  #[test]
  fn test_to_rgb_image_preserves_pixels() {
    let mut frame = ImageBuffer::new(4, 4).unwrap();
    frame.as_mut_slice()[0] = 200;
    frame.as_mut_slice()[1] = 100;
    frame.as_mut_slice()[2] = 50;
    let image = to_rgb_image(&frame);
    assert_eq!(image.get_pixel(0, 0).0, [200, 100, 50]);
  }
}
