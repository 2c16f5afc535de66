// Container backends: the abstract provider of image / container / network
// operations, a docker-CLI implementation, and a host implementation for
// platforms that run without a container.

pub mod backend;
pub mod docker_cli;
pub mod host;

pub use backend::{ContainerBackend, ContainerSpec, ExecSpec};
pub use docker_cli::DockerCliBackend;
pub use host::HostBackend;
