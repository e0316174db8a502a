use std::env;

fn main() {
  // 仅在启用 cuda 特性时链接本地包装库；
  // 默认构建使用主机回退后端，不依赖任何本地库。
  if env::var_os("CARGO_FEATURE_CUDA").is_none() {
    return;
  }

  println!("cargo:rerun-if-env-changed=ZHULONG_GPU_LIB_DIR");

  if let Ok(dir) = env::var("ZHULONG_GPU_LIB_DIR") {
    println!("cargo:rustc-link-search=native={}", dir);
  }

  println!("cargo:rustc-link-lib=dylib=zhulong_gpu");
  println!("cargo:rustc-link-lib=dylib=cudart");
  println!("cargo:rustc-link-lib=dylib=nvinfer");
}
