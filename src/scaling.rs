use chrono::Utc;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    container::{Container, ContainerId, ContainerState},
    definition::{ApplicationSpec, ServiceSpec},
    error::{Error, Result},
    resource_manager::{ContainerRequest, ResourceEvent, ResourceManager},
};

pub const DEFAULT_MAX_CONTAINERS: usize = 1000;

/// Every container a service ever had. The position in `containers` is the
/// instance number, so the next instance is always `containers.len()`.
#[derive(Debug)]
struct ServiceContainers {
    spec: ServiceSpec,
    containers: Vec<Container>,
}

impl ServiceContainers {
    fn active(&self) -> impl Iterator<Item = &Container> {
        self.containers.iter().filter(|c| !c.state.is_terminal())
    }

    fn active_count(&self) -> usize {
        self.active().count()
    }
}

/// What a resource notification changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventEffect {
    Ignored,
    Started,
    /// A container reached a terminal state on its own.
    Completed { state: ContainerState },
}

/// Tracks the containers of one application and applies scaling decisions
/// against a [`ResourceManager`].
///
/// All mutations go through a single lock that stays held while the resource
/// manager is called, so concurrent `scale`/`kill_container` calls observe
/// each other's instance numbers.
pub struct ScalingEngine {
    services: Mutex<BTreeMap<String, ServiceContainers>>,
    resource_manager: Arc<dyn ResourceManager>,
    max_containers: usize,
}

impl ScalingEngine {
    pub fn new(spec: &ApplicationSpec, resource_manager: Arc<dyn ResourceManager>) -> Self {
        let services = spec
            .services
            .iter()
            .map(|(name, service)| {
                (
                    name.clone(),
                    ServiceContainers {
                        spec: service.clone(),
                        containers: Vec::new(),
                    },
                )
            })
            .collect();

        Self {
            services: Mutex::new(services),
            resource_manager,
            max_containers: DEFAULT_MAX_CONTAINERS,
        }
    }

    /// Caps the live containers of each service. Larger scale targets are
    /// rejected.
    pub fn with_max_containers(mut self, max_containers: usize) -> Self {
        self.max_containers = max_containers;
        self
    }

    /// Brings the number of non-terminal containers of `service` to `target`.
    ///
    /// Returns the containers that were requested or killed, in ascending
    /// instance order. Scaling down kills the oldest containers first.
    #[tracing::instrument(name = "ScalingEngine::scale", skip_all, fields(
        service = %service,
        target = target
    ))]
    pub async fn scale(&self, service: &str, target: i32) -> Result<Vec<Container>> {
        let mut services = self.services.lock().await;

        let entry = services
            .get_mut(service)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown service {service:?}")))?;

        let target = usize::try_from(target)
            .ok()
            .filter(|target| *target <= self.max_containers)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "cannot scale {service:?} to {target} containers, the limit is {}",
                    self.max_containers
                ))
            })?;

        let current = entry.active_count();

        if target == current {
            debug!(current, "service already at target");
            return Ok(Vec::new());
        }

        if target > current {
            let first = entry.containers.len() as u32;
            let instances: Vec<u32> = (first..first + (target - current) as u32).collect();

            for instance in instances.iter() {
                entry
                    .containers
                    .push(Container::requested(service, *instance));
            }

            let requested = entry.containers[first as usize..].to_vec();

            info!(current, ?instances, "requesting containers");

            self.resource_manager
                .request_containers(ContainerRequest {
                    service: service.to_owned(),
                    spec: entry.spec.clone(),
                    instances,
                })
                .await;

            return Ok(requested);
        }

        let mut killed = Vec::with_capacity(current - target);
        for container in entry
            .containers
            .iter_mut()
            .filter(|c| !c.state.is_terminal())
            .take(current - target)
        {
            container.finish(ContainerState::Killed, "killed by scaling down");
            killed.push(container.clone());
        }

        info!(
            current,
            killed = ?killed.iter().map(|c| c.instance).collect::<Vec<_>>(),
            "killing containers"
        );

        for container in killed.iter() {
            self.resource_manager.release_container(container.id()).await;
        }

        Ok(killed)
    }

    /// Kills one container by its textual id. Killing a container that has
    /// already terminated is a no-op.
    #[tracing::instrument(name = "ScalingEngine::kill_container", skip_all, fields(
        container_id = %container_id
    ))]
    pub async fn kill_container(&self, container_id: &str) -> Result<()> {
        let id: ContainerId = container_id.parse()?;

        let mut services = self.services.lock().await;

        let entry = services.get_mut(&id.service).ok_or_else(|| {
            Error::InvalidArgument(format!("unknown service {:?}", id.service))
        })?;

        let container = entry
            .containers
            .get_mut(id.instance as usize)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown container {id}")))?;

        if container.state.is_terminal() {
            debug!(state = %container.state, "container already terminated");
            return Ok(());
        }

        container.finish(ContainerState::Killed, "killed by user");
        info!("killing container");

        self.resource_manager.release_container(id).await;

        Ok(())
    }

    /// Containers of `services` whose state is in `states`. An empty filter
    /// matches everything on that axis.
    pub async fn get_containers(
        &self,
        services: &[String],
        states: &[ContainerState],
    ) -> Result<Vec<Container>> {
        let all = self.services.lock().await;

        if let Some(unknown) = services.iter().find(|s| !all.contains_key(s.as_str())) {
            return Err(Error::InvalidArgument(format!("unknown service {unknown:?}")));
        }

        let containers = all
            .iter()
            .filter(|(name, _)| services.is_empty() || services.contains(name))
            .flat_map(|(_, entry)| entry.containers.iter())
            .filter(|c| states.is_empty() || states.contains(&c.state))
            .cloned()
            .collect();

        Ok(containers)
    }

    /// Applies a notification from the resource manager.
    #[tracing::instrument(name = "ScalingEngine::handle_event", skip_all, fields(
        event = ?event
    ))]
    pub async fn handle_event(&self, event: ResourceEvent) -> EventEffect {
        let mut services = self.services.lock().await;

        let id = match &event {
            ResourceEvent::Running { id } | ResourceEvent::Completed { id, .. } => id,
        };

        let Some(container) = services
            .get_mut(&id.service)
            .and_then(|entry| entry.containers.get_mut(id.instance as usize))
        else {
            warn!("notification for a container that was never requested");
            return EventEffect::Ignored;
        };

        match event {
            ResourceEvent::Running { .. } => {
                if container.state != ContainerState::Requested {
                    return EventEffect::Ignored;
                }
                container.state = ContainerState::Running;
                container.start_time = Some(Utc::now());
                info!("container running");
                EventEffect::Started
            }
            ResourceEvent::Completed { outcome, .. } => {
                if container.state.is_terminal() {
                    return EventEffect::Ignored;
                }
                container.finish(outcome.state(), outcome.message());
                info!(state = %container.state, "container completed");
                EventEffect::Completed {
                    state: container.state,
                }
            }
        }
    }

    /// Kills every non-terminal container of every service.
    #[tracing::instrument(name = "ScalingEngine::kill_all", skip_all)]
    pub async fn kill_all(&self, reason: &str) -> Vec<Container> {
        let mut services = self.services.lock().await;

        let mut killed = Vec::new();
        for entry in services.values_mut() {
            for container in entry.containers.iter_mut().filter(|c| !c.state.is_terminal()) {
                container.finish(ContainerState::Killed, reason);
                killed.push(container.clone());
            }
        }

        for container in killed.iter() {
            self.resource_manager.release_container(container.id()).await;
        }

        killed
    }

    pub async fn has_active_containers(&self) -> bool {
        let services = self.services.lock().await;
        services.values().any(|entry| entry.active_count() > 0)
    }

    pub async fn any_failed(&self) -> bool {
        let services = self.services.lock().await;
        services
            .values()
            .flat_map(|entry| entry.containers.iter())
            .any(|c| c.state == ContainerState::Failed)
    }
}
