fn main() {
    let sqlite = std::env::var_os("CARGO_FEATURE_SQLITE").is_some();
    let postgres = std::env::var_os("CARGO_FEATURE_POSTGRES").is_some();
    if !sqlite && !postgres {
        println!(
            "cargo:warning=neither feature \"sqlite\" nor feature \"postgres\" is enabled; only the memory storage backend is available"
        );
    }

    println!("cargo:rerun-if-changed=migrations");
}
