//! Gateway Server core: connection registry and lifecycle, per-connection task
//! orchestration, upstream fan-out and the downlink scheduling gate.

pub mod clock;
pub mod connection;
pub mod context;
pub mod entity;
pub mod frequency_plans;
pub mod lifecycle;
pub mod observability;
pub mod random;
pub mod registry;
pub mod scheduling;
pub mod server;
pub mod stats_registry;
pub mod task;
pub mod upstream;

pub use clock::{Clock, MockClock, SystemClock};
pub use connection::{Connection, Frontend};
pub use context::{RequestContext, RequestValues};
pub use entity::{EntityRegistry, EntityRegistryClient};
pub use frequency_plans::{FrequencyPlansStore, InMemoryFrequencyPlans};
pub use observability::{GatewayEvent, Observability};
pub use server::{GatewayServer, GatewayServerParams};
pub use stats_registry::{GatewayConnectionStatsRegistry, InMemoryStatsRegistry};
pub use task::{start_task, BackoffConfig, RestartPolicy, TaskConfig};
pub use upstream::{NetworkServerClient, PacketBrokerClient, UpstreamHandler};
