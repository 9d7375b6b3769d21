/// Builds the gRPC client and server code for `proto/greeter.proto`.
///
/// The proto is compiled in-process with `protox`, so no `protoc` binary is
/// needed. The encoded descriptor set is written next to the generated code as
/// `greeter_descriptor.bin`; the reflection service and the descriptor-set
/// tests load it from there.
///
/// # Panics
///
/// This function will `panic!` if the proto fails to compile or code
/// generation fails.
use prost::Message;
use std::{env, fs, path::PathBuf};

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("greeter_descriptor.bin");

    println!("cargo:rerun-if-changed=proto/greeter.proto");

    let fds = protox::compile(["proto/greeter.proto"], ["proto"]).unwrap();
    fs::write(&descriptor_path, fds.encode_to_vec()).unwrap();

    tonic_prost_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_fds(fds)
        .unwrap();
}
