use anyhow::Result;
use std::sync::Arc;

use crate::{
    container::ContainerId,
    master::ApplicationMaster,
    resource_manager::{ContainerOutcome, ResourceEvent, ResourceManager},
    scaling_test::{spec, RecordingResourceManager},
};

fn master(services: &[(&str, u32)]) -> (Arc<RecordingResourceManager>, ApplicationMaster) {
    let resource_manager = Arc::new(RecordingResourceManager::default());
    let master = ApplicationMaster::new(
        "application_test",
        spec(services),
        Arc::clone(&resource_manager) as Arc<dyn ResourceManager>,
    );
    (resource_manager, master)
}

fn completed(service: &str, instance: u32, outcome: ContainerOutcome) -> ResourceEvent {
    ResourceEvent::Completed {
        id: ContainerId::new(service, instance),
        outcome,
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::{
        application::{ApplicationState, FinalStatus},
        error::Error,
    };

    use super::*;

    #[tokio::test]
    async fn starts_the_declared_instances() -> Result<()> {
        let (resource_manager, master) = master(&[("web", 2), ("worker", 1)]);

        master.start_services().await?;

        assert_eq!(vec![0, 1], resource_manager.requested_instances("web"));
        assert_eq!(vec![0], resource_manager.requested_instances("worker"));

        Ok(())
    }

    #[tokio::test]
    async fn finishes_when_every_container_succeeds() -> Result<()> {
        let (_resource_manager, master) = master(&[("web", 2)]);
        master.start_services().await?;

        master
            .handle_event(completed("web", 0, ContainerOutcome::Succeeded))
            .await?;
        assert_eq!(ApplicationState::Submitted, master.report().state);

        master
            .handle_event(completed("web", 1, ContainerOutcome::Succeeded))
            .await?;

        let report = master.report();
        assert_eq!(ApplicationState::Finished, report.state);
        assert_eq!(FinalStatus::Succeeded, report.final_status);
        assert!(report.finish_time.is_some());

        Ok(())
    }

    #[tokio::test]
    async fn fails_when_any_container_failed() -> Result<()> {
        let (_resource_manager, master) = master(&[("web", 1), ("worker", 1)]);
        master.start_services().await?;

        master
            .handle_event(completed(
                "web",
                0,
                ContainerOutcome::Failed {
                    message: "exit status 1".to_owned(),
                },
            ))
            .await?;
        master
            .handle_event(completed("worker", 0, ContainerOutcome::Succeeded))
            .await?;

        let report = master.report();
        assert_eq!(ApplicationState::Failed, report.state);
        assert_eq!(FinalStatus::Failed, report.final_status);

        Ok(())
    }

    #[tokio::test]
    async fn shutdown_kills_containers_and_closes_the_store() -> Result<()> {
        let (resource_manager, master) = master(&[("web", 2)]);
        master.start_services().await?;
        master.key_value().set("key", "value")?;

        master.shutdown(FinalStatus::Killed, "stopped").await?;

        let report = master.report();
        assert_eq!(ApplicationState::Killed, report.state);
        assert_eq!("stopped", report.diagnostics);
        assert!(report.address.is_none());
        assert_eq!(2, resource_manager.released().len());
        assert!(matches!(
            master.key_value().get("key"),
            Err(Error::Connection(_))
        ));

        // The first shutdown wins.
        master.shutdown(FinalStatus::Succeeded, "again").await?;
        assert_eq!(ApplicationState::Killed, master.report().state);
        assert_eq!(2, resource_manager.released().len());

        Ok(())
    }

    #[tokio::test]
    async fn shutdown_rejects_undefined_status() -> Result<()> {
        let (_resource_manager, master) = master(&[("web", 1)]);

        assert!(matches!(
            master.shutdown(FinalStatus::Undefined, "").await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(!master.tracker().is_terminal());

        Ok(())
    }

    #[tokio::test]
    async fn event_loop_stops_once_terminated() -> Result<()> {
        let (_resource_manager, master) = master(&[("web", 1)]);
        let master = Arc::new(master);
        master.start_services().await?;

        let (events_tx, events_rx) = mpsc::channel(8);
        let handle = tokio::spawn(Arc::clone(&master).run_events(events_rx));

        events_tx
            .send(ResourceEvent::Running {
                id: ContainerId::new("web", 0),
            })
            .await?;
        events_tx
            .send(completed("web", 0, ContainerOutcome::Succeeded))
            .await?;

        tokio::time::timeout(Duration::from_secs(5), handle).await??;

        assert_eq!(ApplicationState::Finished, master.report().state);

        Ok(())
    }

    #[tokio::test]
    async fn report_describes_the_application() -> Result<()> {
        let (_resource_manager, master) = master(&[("web", 1)]);

        master.tracker().accepted();
        master.tracker().running("127.0.0.1:4000");

        let report = master.report();
        assert_eq!("application_test", report.id);
        assert_eq!("test", report.name);
        assert_eq!("default", report.queue);
        assert_eq!(ApplicationState::Running, report.state);
        assert_eq!(Some("127.0.0.1:4000".to_owned()), report.address);
        assert_eq!(FinalStatus::Undefined, report.final_status);

        Ok(())
    }
}
