fn main() {
    #[cfg(feature = "caencomm")]
    generate_caencomm_bindings();
}

#[cfg(feature = "caencomm")]
fn generate_caencomm_bindings() {
    use std::{env, path::PathBuf};

    let include_dir =
        env::var("CAENCOMM_INCLUDE_DIR").unwrap_or_else(|_| "/usr/include".to_string());
    let header = PathBuf::from(&include_dir).join("CAENComm.h");

    println!("cargo:rerun-if-env-changed=CAENCOMM_INCLUDE_DIR");
    println!("cargo:rerun-if-env-changed=CAENCOMM_LIB_DIR");
    println!("cargo:rerun-if-changed={}", header.display());

    if let Ok(lib_dir) = env::var("CAENCOMM_LIB_DIR") {
        println!("cargo:rustc-link-search=native={lib_dir}");
    }
    println!("cargo:rustc-link-lib=CAENComm");

    let bindings = bindgen::Builder::default()
        .header(header.to_string_lossy())
        .clang_arg(format!("-I{include_dir}"))
        .clang_arg("-DLINUX")
        .allowlist_function("CAENComm_.*")
        .allowlist_type("CAENComm_.*")
        .allowlist_var("CAENComm_.*")
        .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
        .generate()
        .expect("unable to generate CAENComm bindings");

    let out_path = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
    bindings
        .write_to_file(out_path.join("bindings.rs"))
        .expect("couldn't write bindings");
}
