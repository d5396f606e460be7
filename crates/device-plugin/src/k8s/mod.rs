//! Kubelet device plugin protocol.
//!
//! The main components are:
//! - [`PluginServer`]: serves the `DevicePlugin` gRPC service on a Unix socket
//! - [`RegistrationClient`]: announces a plugin to kubelet and re-registers after kubelet restarts

pub mod api;
pub mod registration;
pub mod server;

use std::path::Path;
use std::path::PathBuf;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;

pub use registration::RegistrationClient;
pub use registration::RegistrationState;
pub use server::PluginServer;

/// Device plugin API version announced on registration.
pub const API_VERSION: &str = "v1beta1";

/// Creates a gRPC channel over a Unix domain socket.
pub async fn connect_uds(socket_path: &Path) -> Result<Channel, tonic::transport::Error> {
    let socket_path: PathBuf = socket_path.to_path_buf();

    // The URI is a placeholder, the connector ignores it.
    Endpoint::from_static("http://[::]:50051")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move { UnixStream::connect(socket_path).await.map(TokioIo::new) }
        }))
        .await
}
