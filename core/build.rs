fn main() {
    println!("cargo:rerun-if-changed=proto/market_update.proto");
    prost_build::compile_protos(&["proto/market_update.proto"], &["proto/"])
        .expect("failed to compile market_update.proto");
}
