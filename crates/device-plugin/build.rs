fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Both sides of each service are generated: the plugin serves DevicePlugin and
    // dials Registration, the integration tests do the reverse.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/api.proto"], &["proto"])?;
    Ok(())
}
