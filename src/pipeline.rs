// 该文件是 Zhulong （烛龙） 项目的一部分。
// src/pipeline.rs - 单相机推理流水线
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

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::buffer::{DetectionBuffer, ImageBuffer, TensorBuffer};
use crate::capture::{CaptureError, CaptureSource};
use crate::config::{ConfigError, PipelineConfig};
use crate::device::DeviceError;
use crate::engine::{EngineBuilder, EngineError, InferEngine};
use crate::postprocess::{PostProcessor, PostprocessError};
use crate::stage::{StageError, TensorStager};

pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_millis(500);

/// 连续资源/设备错误达到该值后不再静默丢帧，把错误交给操作者。
pub const MAX_CONSECUTIVE_RESOURCE_ERRORS: u32 = 5;

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
  #[error("采集错误: {0}")]
  Capture(#[from] CaptureError),
  #[error("装填错误: {0}")]
  Stage(#[from] StageError),
  #[error("引擎错误: {0}")]
  Engine(#[from] EngineError),
  #[error("后处理错误: {0}")]
  Postprocess(#[from] PostprocessError),
  #[error("设备错误: {0}")]
  Device(#[from] DeviceError),
  #[error("设备持续出错, 流水线中止: {0}")]
  ResourceExhausted(String),
}

impl PipelineError {
  /// 配置与生命周期类错误表明程序缺陷，不应继续处理下一帧；
  /// 其余错误只作废当前帧。
  pub fn is_fatal(&self) -> bool {
    match self {
      PipelineError::Config(_) => true,
      PipelineError::ResourceExhausted(_) => true,
      PipelineError::Stage(err) => matches!(err, StageError::DimensionMismatch { .. }),
      PipelineError::Engine(err) => !matches!(
        err,
        EngineError::InferenceEnqueueFailed | EngineError::Device(_)
      ),
      PipelineError::Postprocess(err) => !matches!(err, PostprocessError::Device(_)),
      PipelineError::Capture(_) => false,
      PipelineError::Device(_) => false,
    }
  }
}

/// 每路相机一条流水线：采集 → 装填 → 推理 → 后处理，严格串行，
/// 任一时刻只有一帧在途。第 N 帧的检测完整产出（或失败）之后
/// 才会开始第 N+1 帧的装填。
///
/// 引擎与上下文由流水线独占；多路相机各建各的流水线，
/// 不跨线程共享本结构。
pub struct DetectPipeline<S: CaptureSource> {
  capture: S,
  stager: TensorStager,
  engine: InferEngine,
  postprocessor: PostProcessor,
  image: ImageBuffer,
  raw_output: TensorBuffer,
  detections: DetectionBuffer,
  frame_timeout: Duration,
}

impl<S: CaptureSource> DetectPipeline<S> {
  /// 构建整条流水线：分配全部缓冲、加载引擎、创建上下文并完成绑定。
  /// 缓冲地址此后不再变化，绑定只做一次。
  pub fn new(config: PipelineConfig, capture: S) -> Result<Self, PipelineError> {
    config.validate()?;

    let mut stager = TensorStager::new(config.width, config.height)?;
    let mut raw_output = TensorBuffer::new(vec![
      1,
      config.channels_per_anchor(),
      config.feature_map_size as usize,
    ])?;

    let mut engine = EngineBuilder::from_config(&config).build()?;
    engine.create_context()?;
    engine.bind_input(stager.tensor_mut())?;
    engine.bind_output(&mut raw_output)?;

    let postprocessor = PostProcessor::new(&config)?;
    let detections = DetectionBuffer::new(config.max_detections as usize);
    let image = ImageBuffer::new(config.width, config.height)?;

    info!(
      "流水线就绪: {}x{}, {} 锚点, 最多 {} 个检测",
      config.width, config.height, config.feature_map_size, config.max_detections
    );

    Ok(DetectPipeline {
      capture,
      stager,
      engine,
      postprocessor,
      image,
      raw_output,
      detections,
      frame_timeout: DEFAULT_FRAME_TIMEOUT,
    })
  }

  pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
    self.frame_timeout = timeout;
    self
  }

  /// 处理一帧。返回本帧像素缓冲与检测结果的借用，
  /// 二者在下一次调用时被覆盖。
  pub fn cycle(&mut self) -> Result<(&ImageBuffer, &DetectionBuffer), PipelineError> {
    self.capture.get_frame(self.frame_timeout, &mut self.image)?;
    self.stager.stage(&mut self.image)?;
    self.engine.infer()?;
    self
      .postprocessor
      .post_process(&mut self.raw_output, &mut self.detections)?;
    Ok((&self.image, &self.detections))
  }

  /// 循环处理帧并把每帧结果交给消费者。
  ///
  /// 瞬态错误只丢弃当前帧；配置/生命周期错误立即返回；
  /// 连续 [`MAX_CONSECUTIVE_RESOURCE_ERRORS`] 次失败后以
  /// [`PipelineError::ResourceExhausted`] 浮出。
  /// 输入源结束时正常返回已处理的帧数。
  pub fn run<F>(&mut self, consumer: F, max_frames: Option<u64>) -> Result<u64, PipelineError>
  where
    F: FnMut(&ImageBuffer, &DetectionBuffer),
  {
    self.run_with_stop(consumer, max_frames, || false)
  }

  /// 同 [`run`](Self::run)，另接受一个停止查询。
  /// 推理中途没有取消点，停止只发生在两帧之间。
  pub fn run_with_stop<F, C>(
    &mut self,
    mut consumer: F,
    max_frames: Option<u64>,
    mut stop: C,
  ) -> Result<u64, PipelineError>
  where
    F: FnMut(&ImageBuffer, &DetectionBuffer),
    C: FnMut() -> bool,
  {
    let mut frame_index = 0u64;
    let mut consecutive_failures = 0u32;

    loop {
      if stop() {
        info!("收到停止请求, 共处理 {} 帧", frame_index);
        break;
      }
      if max_frames.map(|limit| frame_index >= limit).unwrap_or(false) {
        info!("达到指定帧数 {}, 退出处理循环", frame_index);
        break;
      }

      let started = Instant::now();
      match self.cycle() {
        Ok((image, detections)) => {
          consumer(image, detections);
          frame_index += 1;
          consecutive_failures = 0;
          debug!(
            "第 {} 帧处理完成, 检测 {} 个, 耗时 {:.2?}",
            frame_index,
            detections.count(),
            started.elapsed()
          );
        }
        Err(PipelineError::Capture(CaptureError::EndOfStream)) => {
          info!("输入源结束, 共处理 {} 帧", frame_index);
          break;
        }
        Err(err) if err.is_fatal() => return Err(err),
        Err(err) => {
          consecutive_failures += 1;
          warn!("丢弃当前帧 ({}/{} 次连续失败): {}", consecutive_failures,
            MAX_CONSECUTIVE_RESOURCE_ERRORS, err);
          if consecutive_failures >= MAX_CONSECUTIVE_RESOURCE_ERRORS {
            return Err(PipelineError::ResourceExhausted(err.to_string()));
          }
        }
      }
    }

    Ok(frame_index)
  }
}
