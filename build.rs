use std::env;
use std::path::PathBuf;
use std::process::Command;

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap();
    let os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();

    // Host builds (unit/integration tests) never link the EL2 entry code.
    if arch != "aarch64" || os != "none" {
        return;
    }

    let entry_s = "arch/aarch64/entry.S";
    let entry_o = out_dir.join("entry.o");

    println!("cargo:rerun-if-changed={}", entry_s);

    let status = Command::new("aarch64-linux-gnu-gcc")
        .args(&[
            "-c",
            entry_s,
            "-o",
            entry_o.to_str().unwrap(),
            "-nostdlib",
            "-ffreestanding",
        ])
        .status()
        .expect("Failed to compile entry.S");

    assert!(status.success(), "Failed to compile entry.S");

    let entry_a = out_dir.join("libentry.a");
    let status = Command::new("aarch64-linux-gnu-ar")
        .args(&["crs", entry_a.to_str().unwrap(), entry_o.to_str().unwrap()])
        .status()
        .expect("Failed to create archive");

    assert!(status.success(), "Failed to create archive");

    println!("cargo:rustc-link-search=native={}", out_dir.display());
    println!("cargo:rustc-link-lib=static=entry");

    let linker_script = "arch/aarch64/linker.ld";
    println!("cargo:rerun-if-changed={}", linker_script);
    println!("cargo:rustc-link-arg-bins=-T{}", linker_script);
}
