//! The Container Resource Manager core: a leader-elected control plane that
//! brokers a pool of compute instances across user-named services backed by
//! a pluggable operator.

pub mod broker;
pub mod details;
pub mod error;
pub mod handler;
pub mod lock;
pub mod pool;
pub mod shared;
pub mod state_machine;
pub mod supervisor;
pub mod tracer;

pub use broker::{Broker, BrokerStrategy, BrokerSet, ConstStrategy};
pub use details::{AppDetails, ResourceDetails};
pub use error::CrmError;
pub use handler::UserHandler;
pub use pool::{BlockDetail, Condition, NodeInfoPool, PoolStats};
pub use shared::Shared;
pub use state_machine::ResourceManager;
pub use supervisor::{ManagerSupervisor, RoleSource, RoleStream, RoleToken};
