fn main() {
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path().unwrap());
    prost_build::compile_protos(&["proto/heater.proto"], &["proto/"])
        .expect("failed to compile protobuf schema");
}
