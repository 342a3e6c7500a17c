//! Build script for kscope-core
//!
//! Checks the toolchain before compilation:
//! - Minimum Rust version (let-else and `Option::is_some_and` need 1.70)

fn main()
{
    let Ok(found) = rustc_version::version() else {
        // Some build environments hide the compiler version
        println!("cargo:warning=could not verify Rust version");
        return;
    };
    if let Ok(minimum) = rustc_version::Version::parse("1.70.0") {
        if found < minimum {
            panic!("kscope-core requires Rust {minimum} or newer, found {found}");
        }
    }
}
