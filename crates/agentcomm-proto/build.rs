// ABOUTME: Build script generating Rust code from the agent communication protos.
// ABOUTME: Uses tonic-build to compile the schema into prost types and a gRPC client.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Any and Status are compiled from proto-src along with the service.
    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_well_known_types(true)
        .compile_protos(
            &["proto-src/google/cloud/agentcommunication/v1/agent_communication.proto"],
            &["proto-src"],
        )?;

    println!("cargo:rerun-if-changed=proto-src");

    Ok(())
}
