//! Provisioning core: allocators, hypervisor driving, guest agent protocol,
//! edge publication and the saga that ties them together.

pub mod agent;
pub mod agent_status;
pub mod compensation;
pub mod config;
pub mod edge;
pub mod error;
pub mod hypervisor;
pub mod identifiers;
pub mod lifecycle;
pub mod orchestrator;
pub mod payload;
pub mod poller;
pub mod ports;
pub mod publish_queue;
pub mod retry;
pub mod store;
pub mod teardown;
pub mod templates;
pub mod workloads;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{PublishMode, Settings};
pub use error::{ProvisionError, Result};
pub use orchestrator::{Orchestrator, ProvisionRequest, Provisioned, SagaTrace};
pub use retry::RetryPolicy;
pub use teardown::{Decommissioner, TeardownReport};
