// 该文件是 Zhulong （烛龙） 项目的一部分。
// src/device/cuda.rs - CUDA 内存后端与包装库 FFI
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

//! 通过 `zhulong_gpu` 包装库访问 CUDA 运行时与 TensorRT。
//!
//! 包装库返回 `u16` 状态码：0 表示成功，1..=9999 为 CUDA 运行时错误码，
//! 10000 起为包装库自定义错误码（引擎子系统在各自边界转换）。
//! 本模块只把 CUDA 错误码翻译为 [`DeviceError`]，绝不向上传递裸数字。

use std::mem;

use tracing::error;

use crate::device::DeviceError;

pub(crate) mod ffi {
  use std::ffi::c_char;

  unsafe extern "C" {
    pub fn cuda_malloc(size: u32, ptr: *mut *mut u8) -> u16;
    pub fn cuda_malloc_host(size: u32, ptr: *mut *mut u8) -> u16;
    pub fn cuda_free(ptr: *mut u8) -> u16;
    pub fn cuda_free_host(ptr: *mut u8) -> u16;
    pub fn transfer_host_to_device(
      host_buffer: *const u8,
      device_buffer: *mut u8,
      size: u32,
    ) -> u16;
    pub fn transfer_device_to_host(
      host_buffer: *mut u8,
      device_buffer: *const u8,
      size: u32,
    ) -> u16;
    pub fn convert_rgb888_3dtensor(
      input_buffer: *const u8,
      output_buffer: *mut f32,
      width: u32,
      height: u32,
    ) -> u16;

    pub fn trt_create_engine(
      engine_data: *const u8,
      engine_size: u32,
      input_name: *const c_char,
      output_name: *const c_char,
      width: u32,
      height: u32,
    ) -> u16;
    pub fn trt_create_context() -> u16;
    pub fn trt_set_input(input_buffer: *mut f32) -> u16;
    pub fn trt_set_output(output_buffer: *mut f32) -> u16;
    pub fn trt_infer() -> u16;
    pub fn trt_release_resources() -> u16;

    pub fn postprocess_init(
      max_detect: u16,
      conf_threshold: f32,
      iou_threshold: f32,
      feature_map_size: u16,
      num_classes: u16,
    ) -> u16;
    pub fn postprocess(
      input_buffer: *const f32,
      output_buffer: *mut f32,
      num_detections: *mut u16,
    ) -> u16;
    pub fn postprocess_destroy() -> u16;
  }
}

/// CUDA 运行时错误码对应的名称，仅保留诊断常见的条目。
const CUDA_ERR_NAME: &[(u16, &str)] = &[
  (1, "cudaErrorInvalidValue"),
  (2, "cudaErrorMemoryAllocation"),
  (3, "cudaErrorInitializationError"),
  (4, "cudaErrorCudartUnloading"),
  (35, "cudaErrorInsufficientDriver"),
  (46, "cudaErrorDevicesUnavailable"),
  (100, "cudaErrorNoDevice"),
  (101, "cudaErrorInvalidDevice"),
  (201, "cudaErrorDeviceUninitialized"),
  (214, "cudaErrorECCUncorrectable"),
  (400, "cudaErrorInvalidResourceHandle"),
  (401, "cudaErrorIllegalState"),
  (600, "cudaErrorNotReady"),
  (700, "cudaErrorIllegalAddress"),
  (701, "cudaErrorLaunchOutOfResources"),
  (702, "cudaErrorLaunchTimeout"),
  (709, "cudaErrorContextIsDestroyed"),
  (716, "cudaErrorMisalignedAddress"),
  (719, "cudaErrorLaunchFailure"),
  (802, "cudaErrorSystemNotReady"),
  (999, "cudaErrorUnknown"),
];

fn cuda_err_name(code: u16) -> &'static str {
  CUDA_ERR_NAME
    .iter()
    .find(|(c, _)| *c == code)
    .map(|(_, name)| *name)
    .unwrap_or("err code unknown")
}

/// 把非零 CUDA 状态码翻译为 [`DeviceError`]。
pub(crate) fn status_to_error(code: u16) -> DeviceError {
  match code {
    2 => DeviceError::AllocationFailed(cuda_err_name(code).to_string()),
    _ => DeviceError::Cuda {
      code,
      name: cuda_err_name(code),
    },
  }
}

pub(crate) fn check(code: u16) -> Result<(), DeviceError> {
  if code == 0 {
    Ok(())
  } else {
    Err(status_to_error(code))
  }
}

fn byte_len<T>(len: usize) -> u32 {
  (len * mem::size_of::<T>()) as u32
}

/// 页锁定主机内存，保证主机/设备拷贝走 DMA 快速路径。
pub struct HostArray<T> {
  ptr: *mut T,
  size: usize,
}

unsafe impl<T: Send> Send for HostArray<T> {}

impl<T: Default + Copy> HostArray<T> {
  pub fn new(size: usize) -> Result<Self, DeviceError> {
    let mut ptr = std::ptr::null_mut();
    let code = unsafe {
      ffi::cuda_malloc_host(byte_len::<T>(size), &mut ptr as *mut *mut T as *mut *mut u8)
    };
    if code != 0 {
      return Err(match code {
        2 => DeviceError::OutOfDeviceMemory(size),
        _ => status_to_error(code),
      });
    }
    let mut array = HostArray { ptr, size };
    array.as_mut_slice().fill(T::default());
    Ok(array)
  }
}

impl<T> HostArray<T> {
  pub fn len(&self) -> usize {
    self.size
  }

  pub fn is_empty(&self) -> bool {
    self.size == 0
  }

  pub fn as_slice(&self) -> &[T] {
    unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
  }

  pub fn as_mut_slice(&mut self) -> &mut [T] {
    unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
  }

  pub fn iter(&self) -> std::slice::Iter<'_, T> {
    self.as_slice().iter()
  }

  pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
    self.as_mut_slice().iter_mut()
  }

  pub fn as_ptr(&self) -> *const T {
    self.ptr
  }

  pub fn as_mut_ptr(&mut self) -> *mut T {
    self.ptr
  }
}

impl<T> Drop for HostArray<T> {
  fn drop(&mut self) {
    let code = unsafe { ffi::cuda_free_host(self.ptr as *mut u8) };
    if code != 0 {
      error!("释放页锁定内存失败: {}", status_to_error(code));
    }
  }
}

/// 设备内存，随所有者 `Drop` 释放。
pub struct DeviceArray<T> {
  ptr: *mut T,
  size: usize,
}

unsafe impl<T: Send> Send for DeviceArray<T> {}

impl<T: Default + Copy> DeviceArray<T> {
  pub fn new(size: usize) -> Result<Self, DeviceError> {
    let mut ptr = std::ptr::null_mut();
    let code =
      unsafe { ffi::cuda_malloc(byte_len::<T>(size), &mut ptr as *mut *mut T as *mut *mut u8) };
    if code != 0 {
      return Err(match code {
        2 => DeviceError::OutOfDeviceMemory(size),
        _ => status_to_error(code),
      });
    }
    Ok(DeviceArray { ptr, size })
  }
}

impl<T> DeviceArray<T> {
  pub fn len(&self) -> usize {
    self.size
  }

  pub fn as_ptr(&self) -> *const T {
    self.ptr
  }

  pub fn as_mut_ptr(&mut self) -> *mut T {
    self.ptr
  }
}

impl<T> Drop for DeviceArray<T> {
  fn drop(&mut self) {
    let code = unsafe { ffi::cuda_free(self.ptr as *mut u8) };
    if code != 0 {
      error!("释放设备内存失败: {}", status_to_error(code));
    }
  }
}

pub(crate) fn copy_host_to_device<T: Copy>(
  host: &HostArray<T>,
  device: &mut DeviceArray<T>,
  len: usize,
) -> Result<(), DeviceError> {
  check(unsafe {
    ffi::transfer_host_to_device(
      host.as_ptr() as *const u8,
      device.as_mut_ptr() as *mut u8,
      byte_len::<T>(len),
    )
  })
  .map_err(|err| DeviceError::TransferFailed(err.to_string()))
}

pub(crate) fn copy_device_to_host<T: Copy>(
  host: &mut HostArray<T>,
  device: &DeviceArray<T>,
  len: usize,
) -> Result<(), DeviceError> {
  check(unsafe {
    ffi::transfer_device_to_host(
      host.as_mut_ptr() as *mut u8,
      device.as_ptr() as *const u8,
      byte_len::<T>(len),
    )
  })
  .map_err(|err| DeviceError::TransferFailed(err.to_string()))
}

/// 启动 RGB888 转张量核函数，输入输出均为设备地址。
pub(crate) fn convert_rgb888_3dtensor(
  input: *const u8,
  output: *mut f32,
  width: u32,
  height: u32,
) -> Result<(), DeviceError> {
  check(unsafe { ffi::convert_rgb888_3dtensor(input, output, width, height) })
}

pub(crate) fn cstring(value: &str) -> Result<std::ffi::CString, DeviceError> {
  std::ffi::CString::new(value)
    .map_err(|_| DeviceError::AllocationFailed(format!("张量名含有内嵌 NUL: {:?}", value)))
}
