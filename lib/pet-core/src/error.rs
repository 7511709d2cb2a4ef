use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Didn't see a {0} ConfigMap, it is required to do anything")]
    MissingClusterConfig(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to locate unallocated address space in any available router")]
    AllocationExhausted,

    #[error("BUG: allocation references router {0} which is not in the cluster config")]
    UnknownRouter(String),

    #[error("Invalid WireGuard key: {0}")]
    InvalidKey(String),

    #[error("API data error: {0}")]
    ApiError(#[from] pet_api::ApiError),

    #[error("Kubernetes error: {0}")]
    KubernetesError(#[from] kube::error::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    MetricsError(#[from] prometheus::Error),
}
