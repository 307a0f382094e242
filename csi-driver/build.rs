fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile CSI proto (Identity and Controller services)
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_protos(&["../proto/csi.proto"], &["../proto"])?;

    Ok(())
}
