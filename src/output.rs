// 该文件是 Zhulong （烛龙） 项目的一部分。
// src/output.rs - 展示层接口
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

use tracing::info;

use crate::buffer::{DetectionBuffer, ImageBuffer};

/// 展示层是检测输出的纯消费者。
/// 检测缓冲只读，且仅在下一帧覆盖之前有效。
pub trait Render<Frame, Output> {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

#[cfg(feature = "save_image_file")]
pub mod draw;

#[cfg(feature = "save_image_file")]
mod save_image_file;
#[cfg(feature = "save_image_file")]
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

#[cfg(feature = "directory_record")]
mod directory_record;
#[cfg(feature = "directory_record")]
pub use self::directory_record::{DirectoryRecordError, DirectoryRecordOutput};

/// 只写日志的消费者，任何构建都可用。
#[derive(Debug, Default)]
pub struct LogOutput;

impl Render<ImageBuffer, DetectionBuffer> for LogOutput {
  type Error = std::convert::Infallible;

  fn render_result(
    &self,
    _frame: &ImageBuffer,
    result: &DetectionBuffer,
  ) -> Result<(), Self::Error> {
    info!("检测到 {} 个目标", result.count());
    for det in result.as_slice() {
      info!(
        "  - 类别 {}: {:.2}% at ({:.0}, {:.0}, {:.0}x{:.0})",
        det.class_id,
        det.conf * 100.0,
        det.x,
        det.y,
        det.w,
        det.h
      );
    }
    Ok(())
  }
}
