use std::{env, path::PathBuf};

fn main() {
    // Link with kernel.ld when cross-building for RISC-V; host builds
    // (cargo check, rust-analyzer) skip it.
    let target_arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap();
    if target_arch == "riscv64" {
        let script = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("kernel.ld");
        println!("cargo:rerun-if-changed={}", script.display());
        println!("cargo::rustc-link-arg=-T{}", script.display());
    }
}
