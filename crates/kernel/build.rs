fn main() {
    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap();
    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap();
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
    let script_path = std::path::Path::new(&manifest_dir).join(format!("linker-{}.ld", arch));
    // Host builds (clippy, docs) link normally.
    if os == "none" {
        println!("cargo:rustc-link-arg-bins=-T{}", script_path.display());
    }
    println!("cargo:rerun-if-changed={}", script_path.display());
}
