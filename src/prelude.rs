pub use crate::bridge::Bridge;
pub use crate::config::{
    CloudKind, MqttConfig, ReadinessConfig, Settings, SocketConfig, SocketProtocol, SystemConfig,
    UartConfig,
};
pub use crate::error::{PutError, QueueError, SyncError, SyncResult, TaskError};
pub use crate::network::{AlwaysReady, NetworkReadiness};
pub use crate::serial::{SerialEndpoint, UartSerial};
pub use crate::sync::{
    BoundedQueue, Condition, Deferred, Event, Mutex, MutexGuard, Waiter, DEFAULT_QUEUE_CAPACITY,
};
pub use crate::thread::{ManagedThread, ThreadPool};
pub use crate::transport::{
    CloudLink, Connection, Connector, Inbound, LinkOptions, LinkStatus, Outbound, Transport,
};
pub use crate::utils::logger::LoggerConfig;
pub use crate::utils::{CancelToken, HealthFlag, SecretValue};
