use chrono::{DateTime, Utc};
use std::{collections::BTreeMap, sync::Arc};
use tokio::{
    net::TcpListener,
    select,
    sync::mpsc::{self, Receiver},
};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{error, info};

use crate::{
    application::{terminated, ApplicationReport, FinalStatus, StateTracker},
    config::Config,
    definition::ApplicationSpec,
    error::{Error, Result},
    key_value::KeyValueStore,
    local_cluster::LocalResourceManager,
    proto::master_server::MasterServer,
    resource_manager::{ResourceEvent, ResourceManager},
    scaling::{EventEffect, ScalingEngine},
    security::Security,
    server::MasterService,
};

pub const APPLICATION_ID_ENV: &str = "FLOTILLA_APPLICATION_ID";
pub const MASTER_ADDRESS_ENV: &str = "FLOTILLA_MASTER_ADDRESS";
pub const SECURITY_DIR_ENV: &str = "FLOTILLA_SECURITY_DIR";

/// Control endpoint of one application. Owns its containers, its
/// coordination store and its state; nothing here is shared with other
/// applications.
pub struct ApplicationMaster {
    id: String,
    spec: ApplicationSpec,
    engine: ScalingEngine,
    key_value: KeyValueStore,
    tracker: StateTracker,
    start_time: DateTime<Utc>,
}

impl ApplicationMaster {
    pub fn new(
        id: impl Into<String>,
        spec: ApplicationSpec,
        resource_manager: Arc<dyn ResourceManager>,
    ) -> Self {
        Self {
            id: id.into(),
            engine: ScalingEngine::new(&spec, resource_manager),
            spec,
            key_value: KeyValueStore::new(),
            tracker: StateTracker::new(),
            start_time: Utc::now(),
        }
    }

    /// Starts a master for `spec` on an ephemeral loopback address, backed by
    /// local container processes.
    #[tracing::instrument(name = "ApplicationMaster::launch", skip_all, fields(
        id = %id,
        name = %spec.name
    ))]
    pub async fn launch(
        id: &str,
        spec: ApplicationSpec,
        security: &Security,
        config: &Config,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();

        let (events_tx, events_rx) = mpsc::channel(config.master.event_buffer_size);

        let env = BTreeMap::from([
            (APPLICATION_ID_ENV.to_owned(), id.to_owned()),
            (MASTER_ADDRESS_ENV.to_owned(), address.clone()),
            (
                SECURITY_DIR_ENV.to_owned(),
                security.directory().display().to_string(),
            ),
        ]);

        let resource_manager = Arc::new(LocalResourceManager::new(
            config.container.shell.clone(),
            env,
            config
                .container
                .log_directory
                .as_ref()
                .map(|directory| directory.join(id)),
            events_tx,
        ));

        let mut master = Self::new(id, spec, resource_manager);
        master.engine = master
            .engine
            .with_max_containers(config.master.max_containers_per_service);
        let master = Arc::new(master);
        master.tracker.accepted();

        let router = Server::builder()
            .tls_config(security.server_tls_config())
            .map_err(|error| Error::Internal(format!("invalid tls configuration: {error}")))?
            .add_service(MasterServer::new(MasterService::new(Arc::clone(&master))));

        let shutdown = terminated(master.tracker.subscribe());
        let server_id = id.to_owned();
        tokio::spawn(async move {
            if let Err(error) = router
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
                .await
            {
                error!(?error, id = %server_id, "application master server failed");
            }
            info!(id = %server_id, "application master server stopped");
        });

        master.tracker.running(&address);

        tokio::spawn(Arc::clone(&master).run_events(events_rx));

        if let Err(error) = master.start_services().await {
            master
                .shutdown(FinalStatus::Failed, &error.to_string())
                .await?;
            return Err(error);
        }

        Ok(master)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn spec(&self) -> &ApplicationSpec {
        &self.spec
    }

    pub fn engine(&self) -> &ScalingEngine {
        &self.engine
    }

    pub fn key_value(&self) -> &KeyValueStore {
        &self.key_value
    }

    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    pub fn report(&self) -> ApplicationReport {
        let status = self.tracker.status();

        ApplicationReport {
            id: self.id.clone(),
            name: self.spec.name.clone(),
            queue: self.spec.queue.clone(),
            tags: self.spec.tags.clone(),
            state: status.state,
            final_status: status.final_status,
            address: status.address,
            start_time: self.start_time,
            finish_time: status.finish_time,
            diagnostics: status.diagnostics,
        }
    }

    /// Requests the initial containers of every service.
    #[tracing::instrument(name = "ApplicationMaster::start_services", skip_all, fields(
        id = %self.id
    ))]
    pub async fn start_services(&self) -> Result<()> {
        for (name, service) in self.spec.services.iter() {
            let instances = i32::try_from(service.instances).map_err(|_| {
                Error::InvalidArgument(format!("too many instances for service {name:?}"))
            })?;
            self.engine.scale(name, instances).await?;
        }

        Ok(())
    }

    /// Applies a resource manager notification. Once every container has
    /// stopped on its own, the application finishes.
    pub async fn handle_event(&self, event: ResourceEvent) -> Result<()> {
        let EventEffect::Completed { .. } = self.engine.handle_event(event).await else {
            return Ok(());
        };

        if self.engine.has_active_containers().await {
            return Ok(());
        }

        if self.engine.any_failed().await {
            self.shutdown(FinalStatus::Failed, "a container failed").await
        } else {
            self.shutdown(FinalStatus::Succeeded, "all containers completed")
                .await
        }
    }

    /// Finishes the application, kills its containers and discards the
    /// coordination store. Later calls are no-ops.
    #[tracing::instrument(name = "ApplicationMaster::shutdown", skip_all, fields(
        id = %self.id,
        final_status = %final_status
    ))]
    pub async fn shutdown(&self, final_status: FinalStatus, diagnostics: &str) -> Result<()> {
        if !self.tracker.finish(final_status, diagnostics)? {
            return Ok(());
        }

        let killed = self.engine.kill_all("application shut down").await;
        self.key_value.close();

        info!(killed = killed.len(), "application master shut down");

        Ok(())
    }

    #[tracing::instrument(name = "ApplicationMaster::run_events", skip_all, fields(
        id = %self.id
    ))]
    pub async fn run_events(self: Arc<Self>, mut events: Receiver<ResourceEvent>) {
        let terminated = terminated(self.tracker.subscribe());
        tokio::pin!(terminated);

        loop {
            select! {
                event = events.recv() => {
                    let event = match event {
                        None => {
                            info!("resource manager event channel closed");
                            return;
                        }
                        Some(v) => v,
                    };

                    if let Err(error) = self.handle_event(event).await {
                        error!(?error, "unable to handle resource event");
                    }
                },
                _ = &mut terminated => {
                    info!("application terminated, stopping event loop");
                    return;
                }
            }
        }
    }
}
