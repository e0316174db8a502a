// 该文件是 Zhulong （烛龙） 项目的一部分。
// src/output/directory_record.rs - 按目录记录帧与检测
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

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::buffer::{DetectionBuffer, ImageBuffer};
use crate::output::Render;
use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum DirectoryRecordError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("记录序列化失败: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 把帧图像与检测记录落盘到一个目录。
///
/// `folder:///data/record` 默认只记录有检测的帧，
/// `folder:///data/record?always` 记录所有帧。
/// 帧文件按时间与序号命名，检测追加到 `detections.jsonl`。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  frame_counter: Mutex<u64>,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(DirectoryRecordError::SchemeMismatch);
    }

    let always = url.query_pairs().any(|(key, _)| key == "always");
    let directory = PathBuf::from(url.path());
    std::fs::create_dir_all(&directory)?;

    Ok(DirectoryRecordOutput {
      directory,
      frame_counter: Mutex::new(0),
      always,
    })
  }
}

impl Render<ImageBuffer, DetectionBuffer> for DirectoryRecordOutput {
  type Error = DirectoryRecordError;

  fn render_result(
    &self,
    frame: &ImageBuffer,
    result: &DetectionBuffer,
  ) -> Result<(), Self::Error> {
    if result.count() == 0 && !self.always {
      return Ok(());
    }

    let index = {
      let mut counter = self.frame_counter.lock().unwrap_or_else(|err| err.into_inner());
      *counter += 1;
      *counter
    };

    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let file_name = format!("{}-{:06}.png", stamp, index);
    let image_path = self.directory.join(&file_name);

    let image = image::RgbImage::from_raw(frame.width, frame.height, frame.as_slice().to_vec())
      .expect("像素缓冲长度与宽高不一致");
    image.save(&image_path)?;

    let record = serde_json::json!({
      "frame": file_name,
      "detections": result
        .as_slice()
        .iter()
        .map(|det| {
          serde_json::json!({
            "class_id": det.class_id,
            "conf": det.conf,
            "bbox": [det.x, det.y, det.w, det.h],
          })
        })
        .collect::<Vec<_>>(),
    });

    let mut file = std::fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(self.directory.join("detections.jsonl"))?;
    serde_json::to_writer(&mut file, &record)?;
    writeln!(file)?;

    debug!("记录帧 {} 与 {} 条检测", file_name, result.count());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::buffer::Detection;

  #[test]
  fn test_record_skips_empty_frames_by_default() {
    let dir = std::env::temp_dir().join(format!("zhulong-rec-{}", std::process::id()));
    let url = Url::parse(&format!("folder://{}", dir.display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();

    let frame = ImageBuffer::new(8, 8).unwrap();
    let empty = DetectionBuffer::new(4);
    output.render_result(&frame, &empty).unwrap();
    assert!(!dir.join("detections.jsonl").exists());

    let mut result = DetectionBuffer::new(4);
    *result.slot_mut(0) = Detection {
      x: 1.0,
      y: 1.0,
      w: 4.0,
      h: 4.0,
      conf: 0.7,
      class_id: 2,
    };
    result.set_count(1);
    output.render_result(&frame, &result).unwrap();
    assert!(dir.join("detections.jsonl").exists());

    let content = std::fs::read_to_string(dir.join("detections.jsonl")).unwrap();
    let record: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
    assert_eq!(record["detections"][0]["class_id"], 2);

    std::fs::remove_dir_all(&dir).ok();
  }
}
