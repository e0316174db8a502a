// 该文件是 Zhulong （烛龙） 项目的一部分。
// src/output/save_image_file.rs - 保存标注图像文件
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

use std::path::Path;

use thiserror::Error;
use tracing::info;
use url::Url;

use crate::buffer::{DetectionBuffer, ImageBuffer};
use crate::output::Render;
use crate::output::draw::{Draw, DrawError};
use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("绘制错误: {0}")]
  DrawError(#[from] DrawError),
  #[error("URI 方案不匹配: 期望保存方式 '{expected}', 实际保存方式 '{actual}'")]
  SchemeMismatch {
    expected: &'static str,
    actual: String,
  },
}

/// 把带检测框的帧保存为图像文件。
///
/// `image:///tmp/result.png?font=/usr/share/fonts/DejaVuSans.ttf`
pub struct SaveImageFileOutput {
  path: String,
  draw: Draw,
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch {
        expected: Self::SCHEME,
        actual: url.scheme().to_string(),
      });
    }

    let mut draw = Draw::default();
    for (key, value) in url.query_pairs() {
      if key == "font" {
        draw = Draw::with_font_path(value.as_ref())?;
      }
    }

    Ok(SaveImageFileOutput {
      path: url.path().to_string(),
      draw,
    })
  }
}

impl Render<ImageBuffer, DetectionBuffer> for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_result(
    &self,
    frame: &ImageBuffer,
    result: &DetectionBuffer,
  ) -> Result<(), Self::Error> {
    if let Some(parent) = Path::new(&self.path).parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    let image = self.draw.draw_detections(frame, result);
    image.save(&self.path)?;
    info!("保存图像到文件: {}", self.path);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::buffer::Detection;

  #[test]
  fn test_save_and_scheme() {
    let url = Url::parse("file:///tmp/out.png").unwrap();
    assert!(matches!(
      SaveImageFileOutput::from_url(&url),
      Err(SaveImageFileError::SchemeMismatch { .. })
    ));

    let path = std::env::temp_dir().join(format!("zhulong-save-{}.png", std::process::id()));
    let url = Url::parse(&format!("image://{}", path.display())).unwrap();
    let output = SaveImageFileOutput::from_url(&url).unwrap();

    let frame = ImageBuffer::new(16, 16).unwrap();
    let mut result = DetectionBuffer::new(4);
    *result.slot_mut(0) = Detection {
      x: 2.0,
      y: 2.0,
      w: 8.0,
      h: 8.0,
      conf: 0.8,
      class_id: 1,
    };
    result.set_count(1);
    output.render_result(&frame, &result).unwrap();
    assert!(path.exists());
  }
}
