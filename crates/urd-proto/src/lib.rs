pub mod v1 {
    tonic::include_proto!("urd.v1");
}

/// Encoded descriptors of every `urd.v1` service, for gRPC reflection.
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("descriptor");
