// 该文件是 Zhulong （烛龙） 项目的一部分。
// src/engine.rs - TensorRT 推理引擎生命周期管理
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

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::FromUrl;
use crate::buffer::{RGB_CHANNELS, TensorBuffer};
use crate::config::{DEFAULT_HEIGHT, DEFAULT_INPUT_NAME, DEFAULT_OUTPUT_NAME, DEFAULT_WIDTH, PipelineConfig};
use crate::device::{DeviceError, UnifiedTrait};

/// 进程内最多允许一个活动引擎。该标志由 `EngineBuilder::build`
/// 置位、由 `InferEngine::drop` 复位，使重复创建成为可检查的错误
/// 而非未定义行为。
static ENGINE_LIVE: AtomicBool = AtomicBool::new(false);

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("引擎文件不可读: {path}: {source}")]
  EngineFileUnreadable {
    path: String,
    source: std::io::Error,
  },
  #[error("已存在活动的推理引擎")]
  EngineAlreadyCreated,
  #[error("创建 CUDA 流失败")]
  StreamCreationFailed,
  #[error("创建 TensorRT 运行时失败")]
  RuntimeCreationFailed,
  #[error("反序列化引擎产物失败")]
  EngineDeserializationFailed,
  #[error("引擎尚未创建执行上下文")]
  EngineNotInitialized,
  #[error("执行上下文已存在")]
  ContextAlreadyCreated,
  #[error("创建执行上下文失败")]
  ContextCreationFailed,
  #[error("张量绑定失败: {0}")]
  TensorBindingFailed(String),
  #[error("输入/输出张量尚未绑定")]
  TensorNotBound,
  #[error("推理入队失败")]
  InferenceEnqueueFailed,
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{actual}'")]
  SchemeMismatch {
    expected: &'static str,
    actual: String,
  },
  #[error("引擎 URL 无效: {0}")]
  InvalidUrl(String),
  #[error("设备错误: {0}")]
  Device(#[from] DeviceError),
}

const ENGINE_SCHEME: &str = "trt";

/// 引擎构造参数。
///
/// 也可从 URL 构造：`trt:///path/to/model.trt?input=images&output=output0&width=640&height=480`
pub struct EngineBuilder {
  engine_path: String,
  input_name: String,
  output_name: String,
  width: u32,
  height: u32,
}

impl EngineBuilder {
  pub fn new(engine_path: impl Into<String>) -> Self {
    EngineBuilder {
      engine_path: engine_path.into(),
      input_name: DEFAULT_INPUT_NAME.to_string(),
      output_name: DEFAULT_OUTPUT_NAME.to_string(),
      width: DEFAULT_WIDTH,
      height: DEFAULT_HEIGHT,
    }
  }

  pub fn from_config(config: &PipelineConfig) -> Self {
    EngineBuilder {
      engine_path: config.engine_path.clone(),
      input_name: config.input_name.clone(),
      output_name: config.output_name.clone(),
      width: config.width,
      height: config.height,
    }
  }

  pub fn input_name(mut self, name: impl Into<String>) -> Self {
    self.input_name = name.into();
    self
  }

  pub fn output_name(mut self, name: impl Into<String>) -> Self {
    self.output_name = name.into();
    self
  }

  pub fn dimensions(mut self, width: u32, height: u32) -> Self {
    self.width = width;
    self.height = height;
    self
  }

  /// 读取引擎产物并完成 流 → 运行时 → 引擎反序列化 三步初始化。
  ///
  /// 产物文件整体读入内存；路径不可读时返回
  /// [`EngineError::EngineFileUnreadable`]，不留下任何半初始化状态。
  pub fn build(self) -> Result<InferEngine, EngineError> {
    info!("加载引擎产物: {}", self.engine_path);
    let engine_data =
      std::fs::read(&self.engine_path).map_err(|source| EngineError::EngineFileUnreadable {
        path: self.engine_path.clone(),
        source,
      })?;
    debug!(
      "引擎产物大小: {:.2} MB",
      engine_data.len() as f64 / (1024.0 * 1024.0)
    );

    if ENGINE_LIVE.swap(true, Ordering::SeqCst) {
      return Err(EngineError::EngineAlreadyCreated);
    }

    match sys::create_engine(
      &engine_data,
      &self.input_name,
      &self.output_name,
      self.width,
      self.height,
    ) {
      Ok(()) => {
        info!("引擎反序列化完成");
        Ok(InferEngine {
          input_name: self.input_name,
          output_name: self.output_name,
          width: self.width,
          height: self.height,
          context_created: false,
          input_bound: false,
          output_bound: false,
          _not_sync: std::marker::PhantomData,
        })
      }
      Err(err) => {
        ENGINE_LIVE.store(false, Ordering::SeqCst);
        Err(err)
      }
    }
  }
}

impl FromUrl for EngineBuilder {
  type Error = EngineError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != ENGINE_SCHEME {
      return Err(EngineError::SchemeMismatch {
        expected: ENGINE_SCHEME,
        actual: url.scheme().to_string(),
      });
    }

    let path = urlencoding::decode(url.path())
      .map_err(|err| EngineError::InvalidUrl(format!("路径解码失败: {}", err)))?
      .into_owned();
    let mut builder = EngineBuilder::new(path);

    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "input" => builder.input_name = value.into_owned(),
        "output" => builder.output_name = value.into_owned(),
        "width" => {
          builder.width = value
            .parse()
            .map_err(|_| EngineError::InvalidUrl(format!("width 无效: {}", value)))?;
        }
        "height" => {
          builder.height = value
            .parse()
            .map_err(|_| EngineError::InvalidUrl(format!("height 无效: {}", value)))?;
        }
        _ => {}
      }
    }

    Ok(builder)
  }
}

/// 已反序列化的推理引擎与其执行状态。
///
/// 状态迁移: 引擎就绪 → `create_context` → `bind_input`/`bind_output` → `infer`。
/// 引擎与上下文由单一线程独占使用；多路相机应各自复制上下文，
/// 而不是跨线程共享同一个（本类型有意不实现 `Sync`）。
pub struct InferEngine {
  input_name: String,
  output_name: String,
  width: u32,
  height: u32,
  context_created: bool,
  input_bound: bool,
  output_bound: bool,
  // 上下文不可跨线程共享
  _not_sync: std::marker::PhantomData<std::cell::Cell<()>>,
}

impl InferEngine {
  /// 创建执行上下文。每个引擎实例只允许一个活动上下文。
  pub fn create_context(&mut self) -> Result<(), EngineError> {
    if self.context_created {
      return Err(EngineError::ContextAlreadyCreated);
    }
    sys::create_context()?;
    self.context_created = true;
    info!("执行上下文创建完成");
    Ok(())
  }

  /// 把输入张量的设备地址绑定到命名输入槽。
  ///
  /// 绑定记录的是地址：缓冲区地址变化后必须重新绑定，
  /// 过期绑定不会被自动发现。
  pub fn bind_input(&mut self, tensor: &mut TensorBuffer) -> Result<(), EngineError> {
    if !self.context_created {
      return Err(EngineError::EngineNotInitialized);
    }
    let expected = [
      1,
      RGB_CHANNELS,
      self.height as usize,
      self.width as usize,
    ];
    if tensor.shape() != expected.as_slice() {
      return Err(EngineError::TensorBindingFailed(format!(
        "输入张量形状 {:?} 与引擎输入 {:?} 不符",
        tensor.shape(),
        expected
      )));
    }
    let ptr = tensor.device()?;
    sys::set_input(ptr, &self.input_name)?;
    self.input_bound = true;
    debug!("输入张量已绑定: {}", self.input_name);
    Ok(())
  }

  /// 把输出张量的设备地址绑定到命名输出槽。
  pub fn bind_output(&mut self, tensor: &mut TensorBuffer) -> Result<(), EngineError> {
    if !self.context_created {
      return Err(EngineError::EngineNotInitialized);
    }
    let ptr = tensor.device()?;
    sys::set_output(ptr, &self.output_name)?;
    self.output_bound = true;
    debug!("输出张量已绑定: {}", self.output_name);
    Ok(())
  }

  /// 在执行流上入队一次推理并等待流完成。
  ///
  /// 推理是 (输入张量, 引擎权重) 的纯函数，调用之间不残留内部状态。
  pub fn infer(&mut self) -> Result<(), EngineError> {
    if !self.context_created {
      return Err(EngineError::EngineNotInitialized);
    }
    if !self.input_bound || !self.output_bound {
      return Err(EngineError::TensorNotBound);
    }
    sys::infer()
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }
}

impl Drop for InferEngine {
  fn drop(&mut self) {
    // 按依赖序释放：上下文 → 引擎 → 运行时 → 流
    if let Err(err) = sys::release() {
      error!("释放引擎资源失败: {}", err);
    }
    ENGINE_LIVE.store(false, Ordering::SeqCst);
  }
}

#[cfg(feature = "cuda")]
mod sys {
  //! `zhulong_gpu` 包装库的 TensorRT 入口。包装库内部持有
  //! 流/运行时/引擎/上下文四个句柄，状态码在此处统一转换，
  //! 不向其余模块泄漏数字。

  use super::EngineError;
  use crate::device::cuda::{self, ffi};

  const TRT_CREATE_ENGINE_FAIL: u16 = 10000;
  const TRT_CREATE_RUNTIME_FAIL: u16 = 10001;
  const TRT_CREATE_CONTEXT_FAIL: u16 = 10002;
  const TRT_INFER_FAIL: u16 = 10004;
  const TRT_CREATE_CUDASTREAM_FAIL: u16 = 10006;
  const TRT_ENGINE_NOT_INITIALIZED: u16 = 10007;
  const TRT_ENGINE_ALREADY_CREATED: u16 = 10008;
  const TRT_SET_TENSOR_FAIL: u16 = 10009;

  fn map(code: u16, bind_target: Option<&str>) -> EngineError {
    match code {
      TRT_CREATE_ENGINE_FAIL => EngineError::EngineDeserializationFailed,
      TRT_CREATE_RUNTIME_FAIL => EngineError::RuntimeCreationFailed,
      TRT_CREATE_CONTEXT_FAIL => EngineError::ContextCreationFailed,
      TRT_INFER_FAIL => EngineError::InferenceEnqueueFailed,
      TRT_CREATE_CUDASTREAM_FAIL => EngineError::StreamCreationFailed,
      TRT_ENGINE_NOT_INITIALIZED => EngineError::EngineNotInitialized,
      TRT_ENGINE_ALREADY_CREATED => EngineError::EngineAlreadyCreated,
      TRT_SET_TENSOR_FAIL => EngineError::TensorBindingFailed(
        bind_target.unwrap_or("<未知张量>").to_string(),
      ),
      _ => EngineError::Device(cuda::status_to_error(code)),
    }
  }

  fn check(code: u16, bind_target: Option<&str>) -> Result<(), EngineError> {
    if code == 0 {
      Ok(())
    } else {
      Err(map(code, bind_target))
    }
  }

  pub(super) fn create_engine(
    data: &[u8],
    input_name: &str,
    output_name: &str,
    width: u32,
    height: u32,
  ) -> Result<(), EngineError> {
    let input_name = cuda::cstring(input_name)?;
    let output_name = cuda::cstring(output_name)?;
    check(
      unsafe {
        ffi::trt_create_engine(
          data.as_ptr(),
          data.len() as u32,
          input_name.as_ptr(),
          output_name.as_ptr(),
          width,
          height,
        )
      },
      None,
    )
  }

  pub(super) fn create_context() -> Result<(), EngineError> {
    check(unsafe { ffi::trt_create_context() }, None)
  }

  pub(super) fn set_input(ptr: *mut f32, name: &str) -> Result<(), EngineError> {
    check(unsafe { ffi::trt_set_input(ptr) }, Some(name))
  }

  pub(super) fn set_output(ptr: *mut f32, name: &str) -> Result<(), EngineError> {
    check(unsafe { ffi::trt_set_output(ptr) }, Some(name))
  }

  pub(super) fn infer() -> Result<(), EngineError> {
    check(unsafe { ffi::trt_infer() }, None)
  }

  pub(super) fn release() -> Result<(), EngineError> {
    check(unsafe { ffi::trt_release_resources() }, None)
  }
}

#[cfg(not(feature = "cuda"))]
mod sys {
  //! 主机回退实现：产物按不透明字节持有，生命周期检查照常生效；
  //! 没有可执行推理的设备，`infer` 报告 [`DeviceError::NoDevice`]。

  use super::EngineError;
  use crate::device::DeviceError;

  pub(super) fn create_engine(
    data: &[u8],
    _input_name: &str,
    _output_name: &str,
    _width: u32,
    _height: u32,
  ) -> Result<(), EngineError> {
    if data.is_empty() {
      return Err(EngineError::EngineDeserializationFailed);
    }
    Ok(())
  }

  pub(super) fn create_context() -> Result<(), EngineError> {
    Ok(())
  }

  pub(super) fn set_input(ptr: *mut f32, name: &str) -> Result<(), EngineError> {
    if ptr.is_null() {
      return Err(EngineError::TensorBindingFailed(name.to_string()));
    }
    Ok(())
  }

  pub(super) fn set_output(ptr: *mut f32, name: &str) -> Result<(), EngineError> {
    if ptr.is_null() {
      return Err(EngineError::TensorBindingFailed(name.to_string()));
    }
    Ok(())
  }

  pub(super) fn infer() -> Result<(), EngineError> {
    Err(EngineError::Device(DeviceError::NoDevice))
  }

  pub(super) fn release() -> Result<(), EngineError> {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;
  use std::sync::{Mutex, MutexGuard};

  /// 引擎存活标志是进程级的，相关测试串行执行。
  static TEST_LOCK: Mutex<()> = Mutex::new(());

  fn lock() -> MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|err| err.into_inner())
  }

  fn write_artifact(name: &str, content: &[u8]) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("zhulong-test-{}-{}", std::process::id(), name));
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content).unwrap();
    path
  }

  fn build_engine(name: &str) -> InferEngine {
    let path = write_artifact(name, b"opaque engine bytes");
    EngineBuilder::new(path.to_str().unwrap()).build().unwrap()
  }

  #[test]
  fn test_nonexistent_file_is_unreadable_and_leaves_no_state() {
    let _guard = lock();
    let result = EngineBuilder::new("/nonexistent/zhulong/model.trt").build();
    assert!(matches!(
      result,
      Err(EngineError::EngineFileUnreadable { .. })
    ));
    // 失败的创建不得留下存活标志
    let engine = build_engine("after-unreadable");
    drop(engine);
  }

  #[test]
  fn test_double_create_fails() {
    let _guard = lock();
    let engine = build_engine("double-a");
    let path = write_artifact("double-b", b"opaque engine bytes");
    let result = EngineBuilder::new(path.to_str().unwrap()).build();
    assert!(matches!(result, Err(EngineError::EngineAlreadyCreated)));
    drop(engine);
  }

  #[test]
  fn test_release_then_recreate_succeeds() {
    let _guard = lock();
    let mut engine = build_engine("recreate-a");
    engine.create_context().unwrap();
    drop(engine);
    let engine = build_engine("recreate-b");
    drop(engine);
  }

  #[test]
  fn test_empty_artifact_fails_deserialization() {
    let _guard = lock();
    let path = write_artifact("empty", b"");
    let result = EngineBuilder::new(path.to_str().unwrap()).build();
    assert!(matches!(
      result,
      Err(EngineError::EngineDeserializationFailed)
    ));
    // 失败后仍可正常创建
    let engine = build_engine("after-empty");
    drop(engine);
  }

  #[test]
  fn test_bind_before_context_fails() {
    let _guard = lock();
    let mut engine = build_engine("bind-early");
    let mut tensor = TensorBuffer::new(vec![
      1,
      RGB_CHANNELS,
      engine.height() as usize,
      engine.width() as usize,
    ])
    .unwrap();
    assert!(matches!(
      engine.bind_input(&mut tensor),
      Err(EngineError::EngineNotInitialized)
    ));
    drop(engine);
  }

  #[test]
  fn test_double_context_fails() {
    let _guard = lock();
    let mut engine = build_engine("double-context");
    engine.create_context().unwrap();
    assert!(matches!(
      engine.create_context(),
      Err(EngineError::ContextAlreadyCreated)
    ));
    drop(engine);
  }

  #[test]
  fn test_infer_requires_bindings() {
    let _guard = lock();
    let mut engine = build_engine("unbound-infer");
    engine.create_context().unwrap();
    assert!(matches!(engine.infer(), Err(EngineError::TensorNotBound)));
    drop(engine);
  }

  #[test]
  fn test_bind_rejects_wrong_input_shape() {
    let _guard = lock();
    let mut engine = build_engine("wrong-shape");
    engine.create_context().unwrap();
    let mut tensor = TensorBuffer::new(vec![1, RGB_CHANNELS, 10, 10]).unwrap();
    assert!(matches!(
      engine.bind_input(&mut tensor),
      Err(EngineError::TensorBindingFailed(_))
    ));
    drop(engine);
  }

  #[cfg(not(feature = "cuda"))]
  #[test]
  fn test_infer_without_device_reports_no_device() {
    let _guard = lock();
    let mut engine = build_engine("no-device");
    engine.create_context().unwrap();
    let mut input = TensorBuffer::new(vec![
      1,
      RGB_CHANNELS,
      engine.height() as usize,
      engine.width() as usize,
    ])
    .unwrap();
    let mut output = TensorBuffer::new(vec![1, 85, 100]).unwrap();
    engine.bind_input(&mut input).unwrap();
    engine.bind_output(&mut output).unwrap();
    assert!(matches!(
      engine.infer(),
      Err(EngineError::Device(DeviceError::NoDevice))
    ));
    drop(engine);
  }

  #[test]
  fn test_builder_from_url() {
    let url = Url::parse("trt:///models/armor.trt?input=images&output=output0&width=416&height=416")
      .unwrap();
    let builder = EngineBuilder::from_url(&url).unwrap();
    assert_eq!(builder.engine_path, "/models/armor.trt");
    assert_eq!(builder.input_name, "images");
    assert_eq!(builder.output_name, "output0");
    assert_eq!(builder.width, 416);
    assert_eq!(builder.height, 416);
  }

  #[test]
  fn test_builder_from_url_rejects_other_scheme() {
    let url = Url::parse("file:///models/armor.trt").unwrap();
    assert!(matches!(
      EngineBuilder::from_url(&url),
      Err(EngineError::SchemeMismatch { .. })
    ));
  }
}
