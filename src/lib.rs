pub mod agent;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod isolation;
pub mod resources;
pub mod security;
pub mod shutdown;
pub mod standby;
pub mod tls;
pub mod upstream;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("worker");
}
