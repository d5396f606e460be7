use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use device_plugin::config::BackoffConfig;
use device_plugin::config::PluginManagerConfig;
use device_plugin::device::DeviceBindings;
use device_plugin::device::DeviceInfo;
use device_plugin::device::DeviceNode;
use device_plugin::device::Health;
use device_plugin::error::BackendError;
use device_plugin::k8s::api::device_plugin_client::DevicePluginClient;
use device_plugin::k8s::api::registration_server::Registration;
use device_plugin::k8s::api::registration_server::RegistrationServer;
use device_plugin::k8s::api::AllocateRequest;
use device_plugin::k8s::api::ContainerAllocateRequest;
use device_plugin::k8s::api::Empty;
use device_plugin::k8s::api::ListAndWatchResponse;
use device_plugin::k8s::api::RegisterRequest;
use device_plugin::k8s::connect_uds;
use device_plugin::DeviceBackend;
use device_plugin::PluginManager;
use device_plugin::ResourceKind;
use error_stack::Report;
use parking_lot::Mutex;
use similar_asserts::assert_eq;
use tempfile::TempDir;
use test_log::test;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tonic::Streaming;

const RESOURCE: &str = "vendor.com/accelerator";
const SOCKET: &str = "vendor-com-accelerator.sock";

/// Three devices with switchable health.
struct TestBackend {
    health: Mutex<HashMap<String, Health>>,
}

impl TestBackend {
    fn new() -> Arc<Self> {
        let health = [
            ("dev0", Health::Healthy),
            ("dev1", Health::Healthy),
            ("dev2", Health::Unhealthy),
        ]
        .into_iter()
        .map(|(id, h)| (id.to_string(), h))
        .collect();
        Arc::new(Self {
            health: Mutex::new(health),
        })
    }

    fn set_health(&self, id: &str, health: Health) {
        self.health.lock().insert(id.to_string(), health);
    }
}

impl DeviceBackend for TestBackend {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, Report<BackendError>> {
        let mut ids: Vec<String> = self.health.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids.into_iter().map(DeviceInfo::new).collect())
    }

    fn check_health(&self, device: &DeviceInfo) -> Result<Health, Report<BackendError>> {
        Ok(self
            .health
            .lock()
            .get(&device.id)
            .copied()
            .unwrap_or(Health::Unhealthy))
    }

    fn bindings(&self, device: &DeviceInfo) -> Result<DeviceBindings, Report<BackendError>> {
        Ok(DeviceBindings {
            device_nodes: vec![DeviceNode {
                host_path: format!("/dev/test/{}", device.id),
                container_path: format!("/dev/test/{}", device.id),
                permissions: "rw".to_string(),
            }],
            ..Default::default()
        })
    }
}

#[derive(Clone, Default)]
struct FakeKubelet {
    registrations: Arc<AtomicUsize>,
    last: Arc<Mutex<Option<RegisterRequest>>>,
}

#[tonic::async_trait]
impl Registration for FakeKubelet {
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<Empty>, Status> {
        *self.last.lock() = Some(request.into_inner());
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(Response::new(Empty {}))
    }
}

impl FakeKubelet {
    fn serve(&self, socket: &Path) -> CancellationToken {
        let listener = UnixListener::bind(socket).expect("should bind kubelet socket");
        let token = CancellationToken::new();
        let shutdown = token.clone();
        let service = RegistrationServer::new(self.clone());
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    shutdown.cancelled().await
                })
                .await
        });
        token
    }

    async fn wait_for_registrations(&self, expected: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.registrations.load(Ordering::SeqCst) < expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {expected} registrations"));
    }
}

fn config(plugin_dir: &Path) -> PluginManagerConfig {
    let fast = BackoffConfig {
        initial_interval: Duration::from_millis(20),
        max_interval: Duration::from_millis(100),
    };
    PluginManagerConfig {
        poll_interval: Duration::from_millis(50),
        registration_backoff: fast,
        socket_watch_interval: Duration::from_millis(20),
        restart_backoff: fast,
        ..PluginManagerConfig::new(plugin_dir)
    }
}

fn health_of(response: &ListAndWatchResponse) -> Vec<(String, String)> {
    response
        .devices
        .iter()
        .map(|d| (d.id.clone(), d.health.clone()))
        .collect()
}

async fn next_update(stream: &mut Streaming<ListAndWatchResponse>) -> ListAndWatchResponse {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("should receive an update")
        .expect("stream should stay open")
        .expect("update should not be an error")
}

fn wipe_dir(dir: &Path) {
    for entry in std::fs::read_dir(dir).expect("should list plugin dir") {
        let path = entry.expect("should read dir entry").path();
        std::fs::remove_file(&path).expect("should remove socket");
    }
}

fn allocate_request(ids: &[&str]) -> AllocateRequest {
    AllocateRequest {
        container_requests: vec![ContainerAllocateRequest {
            devices_ids: ids.iter().map(|id| id.to_string()).collect(),
        }],
    }
}

#[test(tokio::test)]
async fn plugin_lifecycle() {
    let dir = TempDir::new().expect("should create temp dir");
    let config = config(dir.path());
    let kubelet_socket = config.kubelet_socket.clone();
    let plugin_socket = dir.path().join(SOCKET);

    let kubelet = FakeKubelet::default();
    let kubelet_server = kubelet.serve(&kubelet_socket);

    let backend = TestBackend::new();
    let kind = ResourceKind {
        resource_name: RESOURCE.to_string(),
        socket_name: SOCKET.to_string(),
        backend: backend.clone(),
        visible_devices_env: Some("ACCEL_VISIBLE_DEVICES".to_string()),
    };
    let manager = Arc::new(PluginManager::new(config, vec![kind]));
    let token = CancellationToken::new();
    let manager_handle = {
        let manager = manager.clone();
        let token = token.clone();
        tokio::spawn(async move { manager.run(token).await })
    };

    // registration
    kubelet.wait_for_registrations(1).await;
    let request = kubelet.last.lock().clone().expect("should record request");
    assert_eq!(request.version, "v1beta1");
    assert_eq!(request.endpoint, SOCKET);
    assert_eq!(request.resource_name, RESOURCE);
    let options = request.options.expect("should carry options");
    assert!(!options.pre_start_required);
    assert!(options.get_preferred_allocation_available);

    // initial snapshot
    let channel = connect_uds(&plugin_socket)
        .await
        .expect("should connect to plugin");
    let mut client = DevicePluginClient::new(channel);
    let mut stream = client
        .list_and_watch(Empty {})
        .await
        .expect("should open stream")
        .into_inner();
    let initial = next_update(&mut stream).await;
    assert_eq!(
        health_of(&initial),
        vec![
            ("dev0".to_string(), "Healthy".to_string()),
            ("dev1".to_string(), "Healthy".to_string()),
            ("dev2".to_string(), "Unhealthy".to_string()),
        ]
    );

    // allocation
    let response = client
        .allocate(allocate_request(&["dev0"]))
        .await
        .expect("healthy device should be allocatable")
        .into_inner();
    assert_eq!(response.container_responses.len(), 1);
    let container = &response.container_responses[0];
    assert_eq!(
        container.envs.get("ACCEL_VISIBLE_DEVICES").map(String::as_str),
        Some("dev0")
    );
    assert_eq!(container.devices.len(), 1);
    assert_eq!(container.devices[0].host_path, "/dev/test/dev0");

    let status = client
        .allocate(allocate_request(&["dev2"]))
        .await
        .expect_err("unhealthy device should be rejected");
    assert_eq!(status.code(), Code::FailedPrecondition);

    // health change is pushed
    backend.set_health("dev1", Health::Unhealthy);
    let update = next_update(&mut stream).await;
    assert_eq!(
        health_of(&update),
        vec![
            ("dev0".to_string(), "Healthy".to_string()),
            ("dev1".to_string(), "Unhealthy".to_string()),
            ("dev2".to_string(), "Unhealthy".to_string()),
        ]
    );

    // kubelet socket replaced while the plugin socket survives
    kubelet_server.cancel();
    std::fs::remove_file(&kubelet_socket).expect("should remove kubelet socket");
    tokio::time::sleep(Duration::from_millis(100)).await;
    let restarted = FakeKubelet::default();
    let restarted_server = restarted.serve(&kubelet_socket);
    restarted.wait_for_registrations(1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(kubelet.registrations.load(Ordering::SeqCst), 1);
    assert_eq!(restarted.registrations.load(Ordering::SeqCst), 1);

    // kubelet restart wiping the whole plugin directory
    drop(stream);
    drop(client);
    restarted_server.cancel();
    wipe_dir(dir.path());
    tokio::time::sleep(Duration::from_millis(100)).await;
    let rebuilt = FakeKubelet::default();
    let _rebuilt_server = rebuilt.serve(&kubelet_socket);
    rebuilt.wait_for_registrations(1).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(restarted.registrations.load(Ordering::SeqCst), 1);
    assert_eq!(rebuilt.registrations.load(Ordering::SeqCst), 1);

    let channel = connect_uds(&plugin_socket)
        .await
        .expect("should connect to the rebuilt plugin");
    let mut client = DevicePluginClient::new(channel);
    let mut stream = client
        .list_and_watch(Empty {})
        .await
        .expect("should open stream")
        .into_inner();
    assert_eq!(next_update(&mut stream).await.devices.len(), 3);

    // shutdown
    drop(stream);
    drop(client);
    token.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), manager_handle)
        .await
        .expect("manager should stop")
        .expect("manager task should not panic");
    assert!(result.is_ok());
    assert!(!plugin_socket.exists());
}
