use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use futures::Stream;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::api::device_plugin_server::DevicePlugin;
use super::api::device_plugin_server::DevicePluginServer;
use super::api::AllocateRequest;
use super::api::AllocateResponse;
use super::api::ContainerPreferredAllocationResponse;
use super::api::DevicePluginOptions;
use super::api::Empty;
use super::api::ListAndWatchResponse;
use super::api::PreStartContainerRequest;
use super::api::PreStartContainerResponse;
use super::api::PreferredAllocationRequest;
use super::api::PreferredAllocationResponse;
use crate::error::PluginError;
use crate::resource::AllocationRequest;
use crate::resource::Resource;

/// Handle of a running server task, resolving when the server stops.
pub type ServerHandle = JoinHandle<Result<(), Report<PluginError>>>;

/// Hosts the `DevicePlugin` service of one resource on its socket.
pub struct PluginServer {
    resource: Arc<dyn Resource>,
    options: DevicePluginOptions,
    cancellation_token: CancellationToken,
}

impl PluginServer {
    pub fn new(resource: Arc<dyn Resource>, cancellation_token: CancellationToken) -> Self {
        Self {
            resource,
            options: Self::default_options(),
            cancellation_token,
        }
    }

    /// Options announced on registration and served by `GetDevicePluginOptions`.
    pub fn default_options() -> DevicePluginOptions {
        DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: true,
        }
    }

    pub fn options(&self) -> DevicePluginOptions {
        self.options
    }

    /// Binds the socket, replacing a stale one, and starts serving.
    pub async fn start(&self) -> Result<ServerHandle, Report<PluginError>> {
        let socket_path = self.resource.socket_path().to_path_buf();
        info!(
            resource = %self.resource.resource_name(),
            "start device plugin server: {:?}", socket_path
        );

        let bind_failed = |message: &str| PluginError::SocketBindFailure {
            path: socket_path.display().to_string(),
            message: message.to_string(),
        };

        remove_stale_socket(&socket_path)
            .change_context_lazy(|| bind_failed("failed to remove stale socket"))?;
        let listener = UnixListener::bind(&socket_path)
            .change_context_lazy(|| bind_failed("failed to bind unix socket"))?;

        let service = DevicePluginService::new(
            self.resource.clone(),
            self.options,
            self.cancellation_token.clone(),
        );
        let resource_name = self.resource.resource_name().to_string();
        let cancellation_token = self.cancellation_token.clone();

        let handle = tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    cancellation_token.cancelled().await;
                    info!("shutting down gRPC server");
                })
                .await;

            if let Err(e) = remove_stale_socket(&socket_path) {
                warn!("failed to remove socket {:?}: {e}", socket_path);
            }

            result.change_context(PluginError::ServerTerminated {
                resource_name,
                message: "gRPC server failed".to_string(),
            })
        });

        Ok(handle)
    }

    /// Stops accepting and terminates every `ListAndWatch` stream.
    /// In-flight `Allocate` calls run to completion.
    pub fn stop(&self) {
        self.cancellation_token.cancel();
    }
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("removed stale socket {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// `DevicePlugin` service implementation.
pub struct DevicePluginService {
    resource: Arc<dyn Resource>,
    options: DevicePluginOptions,
    cancellation_token: CancellationToken,
}

impl DevicePluginService {
    pub fn new(
        resource: Arc<dyn Resource>,
        options: DevicePluginOptions,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            resource,
            options,
            cancellation_token,
        }
    }

    fn socket_path(&self) -> PathBuf {
        self.resource.socket_path().to_path_buf()
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");
        Ok(Response::new(self.options))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!(
            resource = %self.resource.resource_name(),
            "kubelet started watching devices on {:?}",
            self.socket_path()
        );

        let mut snapshots = self.resource.watch();
        let (tx, rx) = mpsc::channel(4);
        // each stream owns a token so it can end independently of its siblings
        let stream_token = self.cancellation_token.child_token();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stream_token.cancelled() => {
                        debug!("{}: server shutting down", PluginError::StreamTerminated);
                        break;
                    }
                    _ = tx.closed() => {
                        debug!("{}: kubelet disconnected", PluginError::StreamTerminated);
                        break;
                    }
                    snapshot = snapshots.recv() => {
                        let Some(snapshot) = snapshot else {
                            debug!("{}: tracker dropped", PluginError::StreamTerminated);
                            break;
                        };
                        let response = ListAndWatchResponse::from(snapshot.as_ref());
                        tokio::select! {
                            _ = stream_token.cancelled() => break,
                            sent = tx.send(Ok(response)) => {
                                if sent.is_err() {
                                    break;
                                }
                                debug!(generation = snapshot.generation, "sent device list");
                            }
                        }
                    }
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        let req = request.into_inner();
        debug!("getting preferred device allocation: {:?}", req);

        let container_responses = req
            .container_requests
            .iter()
            .map(|c| ContainerPreferredAllocationResponse {
                device_i_ds: self.resource.preferred_allocation(
                    &c.available_device_i_ds,
                    &c.must_include_device_i_ds,
                    usize::try_from(c.allocation_size).unwrap_or(0),
                ),
            })
            .collect();

        Ok(Response::new(PreferredAllocationResponse {
            container_responses,
        }))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        info!(
            resource = %self.resource.resource_name(),
            "allocating devices to containers: {:?}",
            req.container_requests
        );

        let requests: Vec<AllocationRequest> = req
            .container_requests
            .into_iter()
            .map(|c| AllocationRequest {
                device_ids: c.devices_ids,
            })
            .collect();

        let resource = self.resource.clone();
        let result = tokio::task::spawn_blocking(move || resource.allocate(&requests))
            .await
            .map_err(|e| Status::internal(format!("allocation task failed: {e}")))?;

        match result {
            Ok(directives) => Ok(Response::new(AllocateResponse {
                container_responses: directives.into_iter().map(Into::into).collect(),
            })),
            Err(report) => {
                warn!("allocation failed: {report:?}");
                Err(Status::from(report.current_context()))
            }
        }
    }

    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!("pre-start container: {:?}", request.into_inner());
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
