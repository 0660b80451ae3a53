// Greeter is open-source under the Apache License 2.0; see LICENSE for usage and contributions.
// Generated protobuf and gRPC bindings.

pub mod helloworld {
    pub mod v1 {
        tonic::include_proto!("helloworld.v1");
    }
}
