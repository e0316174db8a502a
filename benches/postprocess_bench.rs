// 该文件是 Zhulong （烛龙） 项目的一部分。
// benches/postprocess_bench.rs - 后处理热路径基准
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

use criterion::{Criterion, criterion_group, criterion_main};

use zhulong::buffer::{DetectionBuffer, TensorBuffer};
use zhulong::config::PipelineConfig;
use zhulong::postprocess::PostProcessor;

fn postprocess_bench(c: &mut Criterion) {
  let config = PipelineConfig::default();
  let mut processor = PostProcessor::new(&config).unwrap();

  let mut input = TensorBuffer::new(vec![
    1,
    config.channels_per_anchor(),
    config.feature_map_size as usize,
  ])
  .unwrap();
  input.iter_mut().for_each(|num| *num = 0.9);
  let mut output = DetectionBuffer::new(config.max_detections as usize);

  c.bench_function("post process", |b| {
    b.iter(|| {
      criterion::black_box(processor.post_process(&mut input, &mut output).unwrap());
    })
  });
}

criterion_group!(benches, postprocess_bench);
criterion_main!(benches);
