use async_trait::async_trait;

use crate::{
    container::{ContainerId, ContainerState},
    definition::ServiceSpec,
};

/// Ask for one container per entry in `instances`, all running `spec`.
#[derive(Debug, Clone)]
pub struct ContainerRequest {
    pub service: String,
    pub spec: ServiceSpec,
    pub instances: Vec<u32>,
}

impl ContainerRequest {
    pub fn container_ids(&self) -> impl Iterator<Item = ContainerId> + '_ {
        self.instances
            .iter()
            .map(|instance| ContainerId::new(self.service.clone(), *instance))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerOutcome {
    Succeeded,
    Failed { message: String },
    Killed,
}

impl ContainerOutcome {
    pub fn state(&self) -> ContainerState {
        match self {
            ContainerOutcome::Succeeded => ContainerState::Succeeded,
            ContainerOutcome::Failed { .. } => ContainerState::Failed,
            ContainerOutcome::Killed => ContainerState::Killed,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ContainerOutcome::Failed { message } => message,
            _ => "",
        }
    }
}

/// Notifications sent back by a resource manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    Running { id: ContainerId },
    Completed { id: ContainerId, outcome: ContainerOutcome },
}

/// The cluster side of container placement. Requests are fire and forget,
/// everything that happens afterwards arrives as a [`ResourceEvent`].
#[async_trait]
pub trait ResourceManager: Send + Sync {
    async fn request_containers(&self, request: ContainerRequest);

    /// Cancels a pending request or stops a running container.
    async fn release_container(&self, id: ContainerId);
}
