mod docker;
mod native;

pub use docker::{DockerInfo, DockerRunner};
pub use native::NativeRunner;
