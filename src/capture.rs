// 该文件是 Zhulong （烛龙） 项目的一部分。
// src/capture.rs - 相机采集协作方接口与实现
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
use tracing::{debug, error};
use url::Url;

use crate::FromUrl;
use crate::buffer::ImageBuffer;

#[derive(Error, Debug)]
pub enum CaptureError {
  #[error("等待帧超时 ({0:?})")]
  Timeout(Duration),
  #[error("采集设备错误: {0}")]
  Device(String),
  #[error("不支持的像素格式: {0}")]
  UnsupportedPixelFormat(String),
  #[error("帧大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("输入源已结束")]
  EndOfStream,
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{actual}'")]
  SchemeMismatch {
    expected: &'static str,
    actual: String,
  },
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[cfg(feature = "read_image_file")]
  #[error("图像读取错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

/// 相机采集协作方。按需产出 RGB8 像素缓冲，或报告失败。
///
/// 宽高在首帧成功之后视为进程生命周期内稳定。
pub trait CaptureSource {
  /// (宽, 高)
  fn dimensions(&self) -> (u32, u32);

  /// 取一帧写入 `out`，阻塞不超过 `timeout`。
  fn get_frame(&mut self, timeout: Duration, out: &mut ImageBuffer)
  -> Result<(), CaptureError>;
}

const V4L_SCHEME: &str = "v4l";

/// V4L2 摄像头采集源，要求设备输出 RGB3 格式。
///
/// `v4l:///dev/video0?width=640&height=480`
pub struct V4lCapture {
  // Stream 引用 Device，Pin<Box> 固定其地址
  device: std::pin::Pin<Box<v4l::Device>>,
  stream: Option<v4l::io::mmap::Stream<'static>>,
  width: u32,
  height: u32,
}

impl V4lCapture {
  pub fn new(device_path: &str, width: u32, height: u32) -> Result<Self, CaptureError> {
    use v4l::video::Capture;

    let device = Box::pin(
      v4l::Device::with_path(device_path)
        .map_err(|err| CaptureError::Device(format!("无法打开设备 {}: {}", device_path, err)))?,
    );

    let mut format = device
      .format()
      .map_err(|err| CaptureError::Device(err.to_string()))?;
    format.width = width;
    format.height = height;
    format.fourcc = v4l::FourCC::new(b"RGB3");
    let format = device
      .set_format(&format)
      .map_err(|err| CaptureError::Device(err.to_string()))?;

    if format.fourcc != v4l::FourCC::new(b"RGB3") {
      return Err(CaptureError::UnsupportedPixelFormat(
        format.fourcc.to_string(),
      ));
    }
    debug!("V4L2 采集格式: {}x{} RGB3", format.width, format.height);

    let mut capture = V4lCapture {
      device,
      stream: None,
      width: format.width,
      height: format.height,
    };

    // SAFETY: device 被 Pin<Box> 固定不会移动；stream 与 device 存于
    // 同一结构体，并在 Drop 中先于 device 释放。
    let stream = unsafe {
      let device_static: &'static v4l::Device = std::mem::transmute(&*capture.device);
      v4l::io::mmap::Stream::with_buffers(device_static, v4l::buffer::Type::VideoCapture, 4)
        .map_err(|err| CaptureError::Device(format!("无法创建捕获流: {}", err)))?
    };
    capture.stream = Some(stream);

    Ok(capture)
  }
}

impl Drop for V4lCapture {
  fn drop(&mut self) {
    // stream 必须先于 device 释放
    self.stream.take();
  }
}

impl CaptureSource for V4lCapture {
  fn dimensions(&self) -> (u32, u32) {
    (self.width, self.height)
  }

  fn get_frame(
    &mut self,
    timeout: Duration,
    out: &mut ImageBuffer,
  ) -> Result<(), CaptureError> {
    use v4l::io::traits::CaptureStream;

    let stream = self
      .stream
      .as_mut()
      .ok_or_else(|| CaptureError::Device("捕获流已关闭".to_string()))?;

    let start = Instant::now();
    let (buf, _meta) = stream
      .next()
      .map_err(|err| CaptureError::Device(err.to_string()))?;
    // 驱动阻塞超过期限的帧按超时丢弃
    if start.elapsed() > timeout {
      return Err(CaptureError::Timeout(timeout));
    }

    let expected = out.len();
    if buf.len() < expected {
      return Err(CaptureError::BufferSizeMismatch {
        expected,
        actual: buf.len(),
      });
    }
    out.as_mut_slice().copy_from_slice(&buf[..expected]);
    out.timestamp = Instant::now();
    Ok(())
  }
}

impl FromUrl for V4lCapture {
  type Error = CaptureError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != V4L_SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        V4L_SCHEME,
        url.scheme()
      );
      return Err(CaptureError::SchemeMismatch {
        expected: V4L_SCHEME,
        actual: url.scheme().to_string(),
      });
    }

    let device_path = if url.path().is_empty() {
      "/dev/video0".to_string()
    } else {
      url.path().to_string()
    };

    let mut width = crate::config::DEFAULT_WIDTH;
    let mut height = crate::config::DEFAULT_HEIGHT;
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "width" => {
          width = value
            .parse()
            .map_err(|_| CaptureError::Device(format!("width 无效: {}", value)))?;
        }
        "height" => {
          height = value
            .parse()
            .map_err(|_| CaptureError::Device(format!("height 无效: {}", value)))?;
        }
        _ => {}
      }
    }

    V4lCapture::new(&device_path, width, height)
  }
}

#[cfg(feature = "read_image_file")]
const IMAGE_SCHEME: &str = "image";

/// 图像文件采集源：产出一帧后报告流结束。
/// 用于离线验证与 simple-oneshot。
#[cfg(feature = "read_image_file")]
pub struct ImageFileCapture {
  image: Option<image::RgbImage>,
  width: u32,
  height: u32,
}

#[cfg(feature = "read_image_file")]
impl ImageFileCapture {
  pub fn new(path: &str) -> Result<Self, CaptureError> {
    let image = image::ImageReader::open(path)?.decode()?.into_rgb8();
    let (width, height) = image.dimensions();
    debug!("图像文件输入: {} ({}x{})", path, width, height);
    Ok(ImageFileCapture {
      image: Some(image),
      width,
      height,
    })
  }
}

#[cfg(feature = "read_image_file")]
impl CaptureSource for ImageFileCapture {
  fn dimensions(&self) -> (u32, u32) {
    (self.width, self.height)
  }

  fn get_frame(
    &mut self,
    _timeout: Duration,
    out: &mut ImageBuffer,
  ) -> Result<(), CaptureError> {
    let image = self.image.take().ok_or(CaptureError::EndOfStream)?;
    let data = image.into_raw();
    if data.len() != out.len() {
      return Err(CaptureError::BufferSizeMismatch {
        expected: out.len(),
        actual: data.len(),
      });
    }
    out.as_mut_slice().copy_from_slice(&data);
    out.timestamp = Instant::now();
    Ok(())
  }
}

#[cfg(feature = "read_image_file")]
impl FromUrl for ImageFileCapture {
  type Error = CaptureError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != IMAGE_SCHEME {
      return Err(CaptureError::SchemeMismatch {
        expected: IMAGE_SCHEME,
        actual: url.scheme().to_string(),
      });
    }
    ImageFileCapture::new(url.path())
  }
}

#[cfg(all(test, feature = "read_image_file"))]
mod tests {
  use super::*;

  fn temp_png(name: &str, width: u32, height: u32) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("zhulong-cap-{}-{}.png", std::process::id(), name));
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([120, 60, 30]));
    img.save(&path).unwrap();
    path
  }

  #[test]
  fn test_image_file_capture_single_frame() {
    let path = temp_png("single", 8, 6);
    let mut source = ImageFileCapture::new(path.to_str().unwrap()).unwrap();
    assert_eq!(source.dimensions(), (8, 6));

    let mut image = ImageBuffer::new(8, 6).unwrap();
    source
      .get_frame(Duration::from_millis(100), &mut image)
      .unwrap();
    assert_eq!(image.as_slice()[0], 120);
    assert_eq!(image.as_slice()[1], 60);
    assert_eq!(image.as_slice()[2], 30);

    assert!(matches!(
      source.get_frame(Duration::from_millis(100), &mut image),
      Err(CaptureError::EndOfStream)
    ));
  }

  #[test]
  fn test_image_file_capture_size_mismatch() {
    let path = temp_png("mismatch", 8, 6);
    let mut source = ImageFileCapture::new(path.to_str().unwrap()).unwrap();
    let mut image = ImageBuffer::new(4, 4).unwrap();
    assert!(matches!(
      source.get_frame(Duration::from_millis(100), &mut image),
      Err(CaptureError::BufferSizeMismatch { .. })
    ));
  }

  #[test]
  fn test_from_url_scheme_mismatch() {
    let url = Url::parse("file:///tmp/a.png").unwrap();
    assert!(matches!(
      ImageFileCapture::from_url(&url),
      Err(CaptureError::SchemeMismatch { .. })
    ));
  }
}
