pub mod broker;
pub mod cache;
pub mod config;
pub mod envelope;
pub mod error;
pub mod http;
pub mod metrics;
pub mod store;
pub mod traits;
pub mod transport;
pub mod worker;

pub use broker::{spawn_health_monitor, LoadBalancer, WorkerState};
pub use cache::{Cache, Namespace};
pub use config::ServiceConfig;
pub use envelope::{validate_params, ServiceRequest, ServiceResponse, SUPPORTED_METHODS};
pub use error::TacoreError;
pub use http::{router, MonitoringState};
pub use metrics::{spawn_flush_task, MetricsCollector};
pub use store::Store;
pub use traits::{DefaultMethodHandler, MethodHandler};
pub use transport::Transport;
pub use worker::TacoreWorker;
