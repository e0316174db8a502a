// 该文件是 Zhulong （烛龙） 项目的一部分。
// tests/pipeline_test.rs - 流水线集成测试
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
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use zhulong::buffer::ImageBuffer;
use zhulong::capture::{CaptureError, CaptureSource};
use zhulong::config::PipelineConfig;
use zhulong::pipeline::{DetectPipeline, PipelineError};

/// 引擎存活标志是进程级的，构建流水线的测试串行执行。
static TEST_LOCK: Mutex<()> = Mutex::new(());

fn lock() -> MutexGuard<'static, ()> {
  TEST_LOCK.lock().unwrap_or_else(|err| err.into_inner())
}

fn artifact_path(name: &str) -> String {
  let path = std::env::temp_dir().join(format!(
    "zhulong-pipeline-{}-{}.trt",
    std::process::id(),
    name
  ));
  let mut file = std::fs::File::create(&path).unwrap();
  file.write_all(b"opaque engine bytes").unwrap();
  path.to_str().unwrap().to_string()
}

fn small_config(name: &str) -> PipelineConfig {
  PipelineConfig {
    engine_path: artifact_path(name),
    width: 16,
    height: 12,
    max_detections: 4,
    feature_map_size: 32,
    num_classes: 2,
    ..Default::default()
  }
}

/// 产出固定灰度帧的采集桩。
struct SyntheticCapture {
  width: u32,
  height: u32,
  frames_left: u64,
}

impl CaptureSource for SyntheticCapture {
  fn dimensions(&self) -> (u32, u32) {
    (self.width, self.height)
  }

  fn get_frame(
    &mut self,
    _timeout: Duration,
    out: &mut ImageBuffer,
  ) -> Result<(), CaptureError> {
    if self.frames_left == 0 {
      return Err(CaptureError::EndOfStream);
    }
    self.frames_left -= 1;
    out.as_mut_slice().fill(128);
    Ok(())
  }
}

/// 每次取帧都报设备错误的采集桩。
struct FailingCapture {
  width: u32,
  height: u32,
}

impl CaptureSource for FailingCapture {
  fn dimensions(&self) -> (u32, u32) {
    (self.width, self.height)
  }

  fn get_frame(
    &mut self,
    _timeout: Duration,
    _out: &mut ImageBuffer,
  ) -> Result<(), CaptureError> {
    Err(CaptureError::Device("模拟设备故障".to_string()))
  }
}

#[test]
fn test_pipeline_construction_binds_everything() {
  let _guard = lock();
  let config = small_config("construct");
  let capture = SyntheticCapture {
    width: 16,
    height: 12,
    frames_left: 0,
  };
  let pipeline = DetectPipeline::new(config, capture).unwrap();
  drop(pipeline);
}

#[test]
fn test_end_of_stream_ends_run_cleanly() {
  let _guard = lock();
  let config = small_config("eos");
  let capture = SyntheticCapture {
    width: 16,
    height: 12,
    frames_left: 0,
  };
  let mut pipeline = DetectPipeline::new(config, capture).unwrap();
  let processed = pipeline.run(|_, _| {}, None).unwrap();
  assert_eq!(processed, 0);
}

#[test]
fn test_repeated_capture_failures_surface_to_operator() {
  let _guard = lock();
  let config = small_config("failing");
  let capture = FailingCapture {
    width: 16,
    height: 12,
  };
  let mut pipeline = DetectPipeline::new(config, capture).unwrap();
  let mut consumed = 0u64;
  let result = pipeline.run(|_, _| consumed += 1, Some(100));
  // 采集持续失败：丢帧而不崩溃，最终以资源耗尽浮出
  assert!(matches!(result, Err(PipelineError::ResourceExhausted(_))));
  assert_eq!(consumed, 0);
}

#[test]
fn test_stop_request_ends_run_between_cycles() {
  let _guard = lock();
  let config = small_config("stop");
  let capture = SyntheticCapture {
    width: 16,
    height: 12,
    frames_left: 1000,
  };
  let mut pipeline = DetectPipeline::new(config, capture).unwrap();
  let processed = pipeline
    .run_with_stop(|_, _| {}, None, || true)
    .unwrap();
  assert_eq!(processed, 0);
}

#[cfg(not(feature = "cuda"))]
#[test]
fn test_frames_survive_transient_device_errors() {
  let _guard = lock();
  // 主机回退后端没有推理设备：infer 报 NoDevice，
  // 流水线按瞬态错误逐帧丢弃，最终浮出而非崩溃。
  let config = small_config("no-device");
  let capture = SyntheticCapture {
    width: 16,
    height: 12,
    frames_left: 1000,
  };
  let mut pipeline = DetectPipeline::new(config, capture).unwrap();
  let result = pipeline.run(|_, _| {}, Some(10));
  assert!(matches!(result, Err(PipelineError::ResourceExhausted(_))));
}
