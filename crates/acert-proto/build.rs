fn main() {
    // Messages are declared with prost derives in src/lib.rs; only the service
    // stubs are generated here, so no protoc is needed at build time.
    let poll = tonic_build::manual::Method::builder()
        .name("poll")
        .route_name("Poll")
        .input_type("crate::AgentRequest")
        .output_type("crate::ServerResponse")
        .codec_path("tonic::codec::ProstCodec")
        .client_streaming()
        .server_streaming()
        .build();

    let service = tonic_build::manual::Service::builder()
        .name("AgentService")
        .package("acert.agent.v1")
        .method(poll)
        .build();

    tonic_build::manual::Builder::new().compile(&[service]);

    println!("cargo:rerun-if-changed=build.rs");
}
