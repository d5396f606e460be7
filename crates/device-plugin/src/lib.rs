//! Kubernetes device plugin runtime.
//!
//! Advertises hardware devices to kubelet, keeps their health current over
//! `ListAndWatch` and answers `Allocate` with container runtime directives.

pub mod config;
pub mod device;
pub mod error;
pub mod k8s;
pub mod manager;
pub mod resource;

pub use device::DeviceBackend;
pub use error::PluginError;
pub use manager::PluginManager;
pub use manager::ResourceKind;
pub use resource::Resource;
pub use resource::ResourcePlugin;
