use futures_util::future::join_all;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    application::{ApplicationReport, ApplicationState, FinalStatus},
    config::Config,
    definition::ApplicationSpec,
    error::{Error, Result},
    master::ApplicationMaster,
    security::Security,
};

/// Registry of every application submitted to this daemon.
pub struct Driver {
    security: Security,
    config: Config,
    applications: RwLock<HashMap<String, Arc<ApplicationMaster>>>,
}

impl Driver {
    pub fn new(security: Security, config: Config) -> Self {
        Self {
            security,
            config,
            applications: RwLock::new(HashMap::new()),
        }
    }

    #[tracing::instrument(name = "Driver::submit", skip_all, fields(
        name = %spec.name
    ))]
    pub async fn submit(&self, spec: ApplicationSpec) -> Result<String> {
        spec.validate()?;

        let id = format!("application_{}", Uuid::new_v4().simple());

        let master = match ApplicationMaster::launch(&id, spec, &self.security, &self.config).await
        {
            Ok(v) => v,
            Err(error) => {
                error!(?error, %id, "unable to start application");
                return Err(error);
            }
        };

        self.applications
            .write()
            .await
            .insert(id.clone(), master);

        info!(%id, "application submitted");

        Ok(id)
    }

    /// Reports of the applications in any of `states`, oldest first. An empty
    /// filter selects the active applications.
    pub async fn get_applications(&self, states: &[ApplicationState]) -> Vec<ApplicationReport> {
        let states = if states.is_empty() {
            &ApplicationState::ACTIVE[..]
        } else {
            states
        };

        let applications = self.applications.read().await;

        let mut reports: Vec<ApplicationReport> = applications
            .values()
            .map(|master| master.report())
            .filter(|report| states.contains(&report.state))
            .collect();

        reports.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));

        reports
    }

    pub async fn application_report(&self, id: &str) -> Result<ApplicationReport> {
        Ok(self.master(id).await?.report())
    }

    #[tracing::instrument(name = "Driver::kill_application", skip(self))]
    pub async fn kill_application(&self, id: &str) -> Result<()> {
        self.master(id)
            .await?
            .shutdown(FinalStatus::Killed, "killed by user")
            .await
    }

    /// Kills every application that is still active.
    #[tracing::instrument(name = "Driver::shutdown", skip_all)]
    pub async fn shutdown(&self) {
        let masters: Vec<Arc<ApplicationMaster>> =
            self.applications.read().await.values().cloned().collect();

        let results = join_all(
            masters
                .iter()
                .map(|master| master.shutdown(FinalStatus::Killed, "daemon shut down")),
        )
        .await;

        for (master, result) in masters.iter().zip(results) {
            if let Err(error) = result {
                error!(?error, id = %master.id(), "unable to shut down application");
            }
        }

        info!(applications = masters.len(), "driver shut down");
    }

    async fn master(&self, id: &str) -> Result<Arc<ApplicationMaster>> {
        self.applications
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("unknown application {id:?}")))
    }
}
