pub mod application;
pub mod application_client;
pub mod client;
pub mod config;
pub mod container;
pub mod definition;
pub mod driver;
pub mod error;
pub mod key_value;
pub mod local_cluster;
pub mod master;
pub mod proto;
pub mod resource_manager;
pub mod scaling;
pub mod security;
pub mod server;

pub use application::{ApplicationReport, ApplicationState, FinalStatus};
pub use application_client::{ApplicationClient, KeyValue};
pub use client::{Client, ClientBuilder};
pub use container::{Container, ContainerId, ContainerState};
pub use definition::{ApplicationSpec, Resources, ServiceSpec};
pub use error::{Error, Result};
pub use security::Security;

#[cfg(test)]
mod config_test;
#[cfg(test)]
mod master_test;
#[cfg(test)]
mod security_test;
