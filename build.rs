fn main() {
    // The gateway carries a single JSON string each way, so the service is
    // described by hand instead of through a .proto file (no protoc needed).
    let gateway = tonic_build::manual::Service::builder()
        .name("Gateway")
        .package("synego")
        .method(
            tonic_build::manual::Method::builder()
                .name("dispatch")
                .route_name("Dispatch")
                .input_type("crate::transport::rpc::EnvelopeRequest")
                .output_type("crate::transport::rpc::EnvelopeReply")
                .codec_path("tonic::codec::ProstCodec")
                .build(),
        )
        .build();

    println!("cargo:rerun-if-changed=build.rs");

    tonic_build::manual::Builder::new().compile(&[gateway]);
}
