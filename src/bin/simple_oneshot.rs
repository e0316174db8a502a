// 该文件是 Zhulong （烛龙） 项目的一部分。
// src/bin/simple_oneshot.rs - 单帧推理测试程序
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

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use url::Url;

use zhulong::{
  FromUrl,
  capture::{CaptureSource, ImageFileCapture},
  config::PipelineConfig,
  output::{Render, SaveImageFileOutput},
  pipeline::DetectPipeline,
};

/// Zhulong 单帧推理
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 引擎产物文件路径
  #[arg(long, value_name = "FILE")]
  pub model: String,

  /// 输入图像 (image:///path/to.png)
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,

  /// 输出图像 (image:///path/out.png?font=/path/font.ttf)
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,

  /// 引擎输入张量名
  #[arg(long, default_value = "images", value_name = "NAME")]
  pub input_name: String,

  /// 引擎输出张量名
  #[arg(long, default_value = "output0", value_name = "NAME")]
  pub output_name: String,

  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.5", value_name = "THRESHOLD")]
  pub confidence: f32,

  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.5", value_name = "THRESHOLD")]
  pub nms_threshold: f32,

  /// 单帧最多输出的检测数
  #[arg(long, default_value = "25", value_name = "COUNT")]
  pub max_detections: u16,

  /// 特征图锚点总数
  #[arg(long, default_value = "6300", value_name = "COUNT")]
  pub feature_map_size: u16,

  /// 类别数量
  #[arg(long, default_value = "80", value_name = "COUNT")]
  pub classes: usize,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("引擎文件路径: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let capture = ImageFileCapture::from_url(&args.input)?;
  let (width, height) = capture.dimensions();
  info!("输入图像尺寸: {}x{}", width, height);

  let config = PipelineConfig {
    engine_path: args.model,
    input_name: args.input_name,
    output_name: args.output_name,
    width,
    height,
    max_detections: args.max_detections,
    confidence_threshold: args.confidence,
    iou_threshold: args.nms_threshold,
    feature_map_size: args.feature_map_size,
    num_classes: args.classes,
  };

  let output = SaveImageFileOutput::from_url(&args.output)?;
  let mut pipeline = DetectPipeline::new(config, capture)?;

  info!("开始推理...");
  let now = std::time::Instant::now();
  pipeline.run(
    |frame, detections| {
      info!("检测到 {} 个目标, 耗时 {:.2?}", detections.count(), now.elapsed());
      for det in detections.as_slice() {
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
      if let Err(err) = output.render_result(frame, detections) {
        error!("渲染失败: {}", err);
      }
    },
    Some(1),
  )?;

  Ok(())
}
