//! Build script for rdna-stack.
//!
//! Exposes the cargo profile to the crate so diagnostics can report whether
//! the library was built in debug or release mode.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let profile = std::env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=RDNA_BUILD_PROFILE={profile}");
}
