// 该文件是 Zhulong （烛龙） 项目的一部分。
// src/device.rs - 设备内存管理
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

use std::ops::{Deref, DerefMut};

use thiserror::Error;

#[cfg(feature = "cuda")]
pub(crate) mod cuda;
#[cfg(feature = "cuda")]
pub use self::cuda::{DeviceArray, HostArray};
#[cfg(feature = "cuda")]
pub(crate) use self::cuda::{copy_device_to_host, copy_host_to_device};

#[cfg(not(feature = "cuda"))]
mod host;
#[cfg(not(feature = "cuda"))]
pub use self::host::{DeviceArray, HostArray};
#[cfg(not(feature = "cuda"))]
pub(crate) use self::host::{copy_device_to_host, copy_host_to_device};

#[derive(Error, Debug)]
pub enum DeviceError {
  #[error("设备内存不足: 申请 {0} 个元素失败")]
  OutOfDeviceMemory(usize),
  #[error("内存分配失败: {0}")]
  AllocationFailed(String),
  #[error("主机与设备间拷贝失败: {0}")]
  TransferFailed(String),
  #[error("拷贝长度越界: 需要 {required} 个元素, 缓冲区只有 {actual} 个")]
  TransferSizeMismatch { required: usize, actual: usize },
  #[error("未启用 CUDA 设备, 操作不可用")]
  NoDevice,
  #[error("CUDA 错误 {code} ({name})")]
  Cuda { code: u16, name: &'static str },
}

/// 主机/设备双视图缓冲的统一访问接口。
///
/// `to_device`/`to_host` 执行显式拷贝；`device` 只返回设备地址，
/// 首次调用时建立设备镜像。热路径上不应出现首次调用。
pub trait UnifiedTrait<T> {
  fn to_device(&mut self) -> Result<*mut T, DeviceError>;
  fn to_host(&mut self) -> Result<*mut T, DeviceError>;
  fn device(&mut self) -> Result<*mut T, DeviceError>;
  fn host(&mut self) -> *mut T;
  fn len(&self) -> usize;
  fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// 对主机与设备同时可见的缓冲。
///
/// 主机侧使用页锁定内存（cuda 后端）以保证拷贝带宽，
/// 设备镜像按需建立一次，之后复用。两侧分配都在 `Drop` 时释放。
pub struct UnifiedItem<T> {
  host_array: HostArray<T>,
  device_array: Option<DeviceArray<T>>,
  size: usize,
}

impl<T> UnifiedItem<T>
where
  T: Default + Copy,
{
  pub fn new(size: usize) -> Result<Self, DeviceError> {
    Ok(UnifiedItem {
      host_array: HostArray::new(size)?,
      device_array: None,
      size,
    })
  }

  /// 建立设备镜像但不拷贝内容，用于在构造期完成全部分配。
  pub fn reserve_device(&mut self) -> Result<(), DeviceError> {
    if self.device_array.is_none() {
      self.device_array = Some(DeviceArray::new(self.size)?);
    }
    Ok(())
  }
}

impl<T> Deref for UnifiedItem<T> {
  type Target = HostArray<T>;
  fn deref(&self) -> &Self::Target {
    &self.host_array
  }
}

impl<T> DerefMut for UnifiedItem<T> {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.host_array
  }
}

impl<T: Default + Copy> UnifiedTrait<T> for UnifiedItem<T> {
  fn to_device(&mut self) -> Result<*mut T, DeviceError> {
    if self.device_array.is_none() {
      self.device_array = Some(DeviceArray::new(self.size)?);
    }
    let device_array = self.device_array.as_mut().unwrap();
    transfer_host_to_device(&self.host_array, device_array, self.size)?;
    Ok(device_array.as_mut_ptr())
  }

  fn to_host(&mut self) -> Result<*mut T, DeviceError> {
    let Some(device_array) = self.device_array.as_ref() else {
      return Ok(self.host_array.as_mut_ptr());
    };
    transfer_device_to_host(&mut self.host_array, device_array, self.size)?;
    Ok(self.host_array.as_mut_ptr())
  }

  fn device(&mut self) -> Result<*mut T, DeviceError> {
    if self.device_array.is_none() {
      self.to_device()
    } else {
      Ok(self.device_array.as_mut().unwrap().as_mut_ptr())
    }
  }

  fn host(&mut self) -> *mut T {
    self.host_array.as_mut_ptr()
  }

  fn len(&self) -> usize {
    self.size
  }
}

/// 主机到设备的显式拷贝，拷贝 `len` 个元素。
/// 两侧容量不足时返回 `TransferSizeMismatch`，不做隐式扩容。
pub fn transfer_host_to_device<T: Copy>(
  host: &HostArray<T>,
  device: &mut DeviceArray<T>,
  len: usize,
) -> Result<(), DeviceError> {
  if host.len() < len {
    return Err(DeviceError::TransferSizeMismatch {
      required: len,
      actual: host.len(),
    });
  }
  if device.len() < len {
    return Err(DeviceError::TransferSizeMismatch {
      required: len,
      actual: device.len(),
    });
  }
  copy_host_to_device(host, device, len)
}

/// 设备到主机的显式拷贝，拷贝 `len` 个元素。
pub fn transfer_device_to_host<T: Copy>(
  host: &mut HostArray<T>,
  device: &DeviceArray<T>,
  len: usize,
) -> Result<(), DeviceError> {
  if host.len() < len {
    return Err(DeviceError::TransferSizeMismatch {
      required: len,
      actual: host.len(),
    });
  }
  if device.len() < len {
    return Err(DeviceError::TransferSizeMismatch {
      required: len,
      actual: device.len(),
    });
  }
  copy_device_to_host(host, device, len)
}
