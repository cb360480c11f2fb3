fn main() {
    // The D2XX transport links against FTDI's vendor library (ftd2xx.dll / libftd2xx).
    if std::env::var_os("CARGO_FEATURE_D2XX").is_some() {
        println!("cargo:rustc-link-lib=dylib=ftd2xx");
    }
}
