// 该文件是 Zhulong （烛龙） 项目的一部分。
// src/device/host.rs - 主机回退内存后端
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

//! 未启用 `cuda` 特性时的回退后端。
//!
//! “设备”镜像同样驻留主机内存，拷贝即 `copy_from_slice`，
//! 分配、所有权与传输语义同 cuda 后端保持一致，
//! 以便在无 GPU 的机器上构建与测试全部控制逻辑。

use crate::device::DeviceError;

pub struct HostArray<T> {
  data: Box<[T]>,
}

impl<T: Default + Copy> HostArray<T> {
  pub fn new(size: usize) -> Result<Self, DeviceError> {
    Ok(HostArray {
      data: vec![T::default(); size].into_boxed_slice(),
    })
  }
}

impl<T> HostArray<T> {
  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn as_slice(&self) -> &[T] {
    &self.data
  }

  pub fn as_mut_slice(&mut self) -> &mut [T] {
    &mut self.data
  }

  pub fn iter(&self) -> std::slice::Iter<'_, T> {
    self.data.iter()
  }

  pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
    self.data.iter_mut()
  }

  pub fn as_ptr(&self) -> *const T {
    self.data.as_ptr()
  }

  pub fn as_mut_ptr(&mut self) -> *mut T {
    self.data.as_mut_ptr()
  }
}

pub struct DeviceArray<T> {
  data: Box<[T]>,
}

impl<T: Default + Copy> DeviceArray<T> {
  pub fn new(size: usize) -> Result<Self, DeviceError> {
    Ok(DeviceArray {
      data: vec![T::default(); size].into_boxed_slice(),
    })
  }
}

impl<T> DeviceArray<T> {
  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn as_ptr(&self) -> *const T {
    self.data.as_ptr()
  }

  pub fn as_mut_ptr(&mut self) -> *mut T {
    self.data.as_mut_ptr()
  }
}

pub(crate) fn copy_host_to_device<T: Copy>(
  host: &HostArray<T>,
  device: &mut DeviceArray<T>,
  len: usize,
) -> Result<(), DeviceError> {
  device.data[..len].copy_from_slice(&host.data[..len]);
  Ok(())
}

pub(crate) fn copy_device_to_host<T: Copy>(
  host: &mut HostArray<T>,
  device: &DeviceArray<T>,
  len: usize,
) -> Result<(), DeviceError> {
  host.data[..len].copy_from_slice(&device.data[..len]);
  Ok(())
}
