use core::error::Error;

use tonic::Status;

/// Errors surfaced by the device plugin runtime.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum PluginError {
    /// Requested IDs are absent from, or unhealthy in, the current snapshot.
    #[display("device unavailable: {}", ids.join(", "))]
    DeviceUnavailable { ids: Vec<String> },
    #[display("invalid allocation request: {message}")]
    InvalidRequest { message: String },
    #[display("failed to look up bindings for devices: {}", ids.join(", "))]
    BindingLookupFailed { ids: Vec<String> },
    #[display("registration with kubelet failed: {message}")]
    RegistrationFailed { message: String },
    #[display("stream terminated")]
    StreamTerminated,
    #[display("device enumeration failed: {message}")]
    EnumerationFailure { message: String },
    #[display("failed to bind plugin socket {path}: {message}")]
    SocketBindFailure { path: String, message: String },
    #[display("plugin server for {resource_name} terminated unexpectedly: {message}")]
    ServerTerminated {
        resource_name: String,
        message: String,
    },
}

impl Error for PluginError {}

/// Errors reported by a hardware backend.
#[derive(Debug, derive_more::Display)]
pub enum BackendError {
    #[display("failed to enumerate devices: {message}")]
    Enumeration { message: String },
    #[display("failed to read state of device {id}: {message}")]
    DeviceRead { id: String, message: String },
    #[display("failed to load inventory: {message}")]
    Inventory { message: String },
}

impl Error for BackendError {}

impl From<&PluginError> for Status {
    fn from(err: &PluginError) -> Self {
        match err {
            PluginError::DeviceUnavailable { .. } => Status::failed_precondition(err.to_string()),
            PluginError::InvalidRequest { .. } => Status::invalid_argument(err.to_string()),
            PluginError::StreamTerminated => Status::cancelled(err.to_string()),
            _ => Status::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use tonic::Code;

    use super::*;

    #[test]
    fn device_unavailable_maps_to_failed_precondition() {
        let err = PluginError::DeviceUnavailable {
            ids: vec!["dev2".to_string(), "dev3".to_string()],
        };
        let status = Status::from(&err);
        assert_eq!(status.code(), Code::FailedPrecondition);
        assert_eq!(status.message(), "device unavailable: dev2, dev3");
    }

    #[test]
    fn internal_errors_map_to_internal() {
        let err = PluginError::BindingLookupFailed {
            ids: vec!["dev0".to_string()],
        };
        assert_eq!(Status::from(&err).code(), Code::Internal);

        let err = PluginError::InvalidRequest {
            message: "empty".to_string(),
        };
        assert_eq!(Status::from(&err).code(), Code::InvalidArgument);
    }
}
