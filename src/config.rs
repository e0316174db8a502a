// 该文件是 Zhulong （烛龙） 项目的一部分。
// src/config.rs - 流水线配置
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

pub const DEFAULT_INPUT_NAME: &str = "images";
pub const DEFAULT_OUTPUT_NAME: &str = "output0";
pub const DEFAULT_WIDTH: u32 = 640;
pub const DEFAULT_HEIGHT: u32 = 480;
pub const DEFAULT_MAX_DETECTIONS: u16 = 25;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.5;
pub const DEFAULT_FEATURE_MAP_SIZE: u16 = 6300;
pub const DEFAULT_NUM_CLASSES: usize = 80;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("阈值 {0} 超出范围 [0, 1]: {1}")]
  ThresholdOutOfRange(&'static str, f32),
  #[error("图像尺寸不能为零: {0}x{1}")]
  ZeroDimension(u32, u32),
  #[error("特征图锚点数不能为零")]
  ZeroFeatureMap,
  #[error("类别数不能为零")]
  ZeroClasses,
  #[error("张量名不能为空: {0}")]
  EmptyTensorName(&'static str),
}

/// 流水线配置。启动时构造一次，之后不可变。
///
/// 引擎文件被视为不透明的序列化产物，仅以路径标识；
/// 输入输出张量槽按名称绑定，名称须与产物内的张量一致。
#[derive(Debug, Clone)]
pub struct PipelineConfig {
  /// 引擎产物文件路径
  pub engine_path: String,
  /// 输入张量名
  pub input_name: String,
  /// 输出张量名
  pub output_name: String,
  /// 模型输入（亦即相机帧）宽度
  pub width: u32,
  /// 模型输入（亦即相机帧）高度
  pub height: u32,
  /// 单帧最多输出的检测数
  pub max_detections: u16,
  /// 置信度阈值 (0.0 - 1.0)
  pub confidence_threshold: f32,
  /// NMS IOU 阈值 (0.0 - 1.0)
  pub iou_threshold: f32,
  /// 特征图锚点总数
  pub feature_map_size: u16,
  /// 类别数量
  pub num_classes: usize,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    PipelineConfig {
      engine_path: "model.trt".to_string(),
      input_name: DEFAULT_INPUT_NAME.to_string(),
      output_name: DEFAULT_OUTPUT_NAME.to_string(),
      width: DEFAULT_WIDTH,
      height: DEFAULT_HEIGHT,
      max_detections: DEFAULT_MAX_DETECTIONS,
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      iou_threshold: DEFAULT_IOU_THRESHOLD,
      feature_map_size: DEFAULT_FEATURE_MAP_SIZE,
      num_classes: DEFAULT_NUM_CLASSES,
    }
  }
}

impl PipelineConfig {
  /// 每个锚点的通道数: cx, cy, w, h, objectness 加上各类别分数。
  pub fn channels_per_anchor(&self) -> usize {
    5 + self.num_classes
  }

  /// 原始输出张量的元素总数。
  pub fn raw_output_len(&self) -> usize {
    self.channels_per_anchor() * self.feature_map_size as usize
  }

  /// 校验配置。配置错误属于编程缺陷，应当让进程尽快失败。
  pub fn validate(&self) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&self.confidence_threshold) {
      return Err(ConfigError::ThresholdOutOfRange(
        "confidence_threshold",
        self.confidence_threshold,
      ));
    }
    if !(0.0..=1.0).contains(&self.iou_threshold) {
      return Err(ConfigError::ThresholdOutOfRange(
        "iou_threshold",
        self.iou_threshold,
      ));
    }
    if self.width == 0 || self.height == 0 {
      return Err(ConfigError::ZeroDimension(self.width, self.height));
    }
    if self.feature_map_size == 0 {
      return Err(ConfigError::ZeroFeatureMap);
    }
    if self.num_classes == 0 {
      return Err(ConfigError::ZeroClasses);
    }
    if self.input_name.is_empty() {
      return Err(ConfigError::EmptyTensorName("input_name"));
    }
    if self.output_name.is_empty() {
      return Err(ConfigError::EmptyTensorName("output_name"));
    }
    Ok(())
  }
}
