use anyhow::Result;
use flotilla::{
    ApplicationSpec, ApplicationState, Client, ContainerState, Error, FinalStatus, Security,
};
use nix::{sys::signal::kill, unistd::Pid};
use std::{future::Future, time::Duration};
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(30);

async fn start_client(dir: &TempDir) -> Result<Client> {
    let security = Security::from_new_directory(dir.path().join("security"), false)?;

    let client = Client::builder()
        .security(security)
        .daemon_binary(env!("CARGO_BIN_EXE_flotillad"))
        .log(dir.path().join("daemon.log"))
        .poll_interval(Duration::from_millis(50))
        .build()
        .await?;

    Ok(client)
}

fn spec(yaml: &str) -> Result<ApplicationSpec> {
    Ok(serde_yaml::from_str(yaml)?)
}

/// Polls `check` until it returns true.
async fn eventually<F, Fut>(mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    tokio::time::timeout(TIMEOUT, async {
        loop {
            if check().await? {
                return Ok::<(), anyhow::Error>(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await??;

    Ok(())
}

async fn wait_for_state(client: &Client, id: &str, state: ApplicationState) -> Result<()> {
    eventually(|| async move {
        Ok::<_, anyhow::Error>(client.application_report(id).await?.state == state)
    })
    .await
}

fn process_exists(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

const SLEEPER: &str = r#"
name: sleeper
tags: [test]
services:
  sleeper:
    instances: 1
    resources:
      memory: 32
      vcores: 1
    commands:
      - sleep 600
"#;

#[tokio::test]
async fn client_owns_its_daemon() -> Result<()> {
    let dir = TempDir::new()?;
    let mut client = start_client(&dir).await?;

    let pid = client.daemon_pid().expect("client started a daemon");
    assert!(process_exists(pid));
    assert!(client.get_applications(&[]).await?.is_empty());

    let address = client.address().to_owned();
    let security = client.security().clone();

    client.close().await?;
    assert!(!process_exists(pid));

    // Closing twice is fine, calls after closing are not.
    client.close().await?;
    assert!(matches!(
        client.get_applications(&[]).await,
        Err(Error::Connection(_))
    ));

    assert!(matches!(
        Client::builder()
            .security(security)
            .address(address)
            .build()
            .await,
        Err(Error::Connection(_))
    ));

    let log = std::fs::metadata(dir.path().join("daemon.log"))?;
    assert!(log.len() > 0);

    Ok(())
}

#[tokio::test]
async fn clients_can_share_a_daemon() -> Result<()> {
    let dir = TempDir::new()?;
    let mut owner = start_client(&dir).await?;

    let attached = Client::builder()
        .security(owner.security().clone())
        .address(owner.address())
        .build()
        .await?;
    assert!(attached.daemon_pid().is_none());

    let id = owner.submit(&spec(SLEEPER)?).await?;
    let reports = attached.get_applications(&[]).await?;
    assert_eq!(vec![id.clone()], reports.iter().map(|r| r.id.clone()).collect::<Vec<_>>());

    let app = attached.connect(&id, true).await?;
    app.kv().set("key", "value").await?;

    owner.close().await?;

    // Every handle on the daemon fails once its owner closes it.
    assert!(matches!(
        attached.get_applications(&[]).await,
        Err(Error::Connection(_))
    ));
    assert!(matches!(app.kv().get("key").await, Err(Error::Connection(_))));

    Ok(())
}

#[tokio::test]
async fn rejects_invalid_and_unknown_applications() -> Result<()> {
    let dir = TempDir::new()?;
    let mut client = start_client(&dir).await?;

    let mut invalid = spec(SLEEPER)?;
    invalid.services.clear();
    assert!(matches!(
        client.submit(&invalid).await,
        Err(Error::InvalidArgument(_))
    ));

    assert!(matches!(
        client.application_report("application_missing").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        client.kill_application("application_missing").await,
        Err(Error::NotFound(_))
    ));

    client.close().await?;

    Ok(())
}

#[tokio::test]
async fn scales_containers_of_a_running_application() -> Result<()> {
    let dir = TempDir::new()?;
    let mut client = start_client(&dir).await?;

    let id = client.submit(&spec(SLEEPER)?).await?;
    let app = client.connect(&id, true).await?;

    let report = client.application_report(&id).await?;
    assert_eq!(ApplicationState::Running, report.state);
    assert_eq!("sleeper", report.name);
    assert_eq!(Some(app.address().to_owned()), report.address);

    assert_eq!(1, app.specification().await?.services.len());
    assert_eq!(vec!["sleep 600".to_owned()], app.service("sleeper").await?.commands);

    let started = app.scale("sleeper", 3).await?;
    assert_eq!(vec![1, 2], started.iter().map(|c| c.instance).collect::<Vec<_>>());

    let running = &app;
    eventually(|| async move {
        Ok::<_, anyhow::Error>(running.containers(&[], &[ContainerState::Running]).await?.len() == 3)
    })
    .await?;

    app.kill_container("sleeper_1").await?;
    let killed = app.containers(&["sleeper"], &[ContainerState::Killed]).await?;
    assert_eq!(vec![1], killed.iter().map(|c| c.instance).collect::<Vec<_>>());

    let stopped = app.scale("sleeper", 1).await?;
    assert_eq!(vec![0], stopped.iter().map(|c| c.instance).collect::<Vec<_>>());

    let active = app
        .containers(&[], &[ContainerState::Requested, ContainerState::Running])
        .await?;
    assert_eq!(vec![2], active.iter().map(|c| c.instance).collect::<Vec<_>>());

    assert!(matches!(
        app.scale("sleeper", -1).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        app.scale("missing", 1).await,
        Err(Error::InvalidArgument(_))
    ));

    app.shutdown(FinalStatus::Succeeded, "done").await?;

    let report = client.application_report(&id).await?;
    assert_eq!(ApplicationState::Finished, report.state);
    assert_eq!(FinalStatus::Succeeded, report.final_status);
    assert_eq!("done", report.diagnostics);
    assert!(report.address.is_none());

    assert!(matches!(
        app.containers(&[], &[]).await,
        Err(Error::Connection(_))
    ));
    assert!(matches!(
        client.connect(&id, true).await,
        Err(Error::Connection(_))
    ));

    client.close().await?;

    Ok(())
}

#[tokio::test]
async fn coordinates_through_the_key_value_store() -> Result<()> {
    let dir = TempDir::new()?;
    let mut client = start_client(&dir).await?;

    let id = client.submit(&spec(SLEEPER)?).await?;
    let app = client.connect(&id, true).await?;
    let kv = app.kv();

    assert!(kv.is_empty().await?);
    assert!(matches!(kv.get("address").await, Err(Error::NotFound(_))));

    let waiter = {
        let kv = kv.clone();
        tokio::spawn(async move { kv.wait("address").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());

    kv.set("address", "10.0.0.1:8080").await?;
    let value = tokio::time::timeout(TIMEOUT, waiter).await???;
    assert_eq!("10.0.0.1:8080", value);

    kv.set("other", "value").await?;
    assert_eq!(2, kv.len().await?);
    kv.delete("other").await?;
    assert_eq!(
        vec!["address".to_owned()],
        kv.to_map().await?.into_keys().collect::<Vec<_>>()
    );

    // A pending wait fails once the application goes away.
    let waiter = {
        let kv = kv.clone();
        tokio::spawn(async move { kv.wait("never").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.kill_application(&id).await?;

    let result = tokio::time::timeout(TIMEOUT, waiter).await??;
    assert!(result.is_err());

    client.close().await?;

    Ok(())
}

#[tokio::test]
async fn applications_finish_when_their_containers_do() -> Result<()> {
    let dir = TempDir::new()?;
    let mut client = start_client(&dir).await?;

    let succeeding = client
        .submit(&spec(
            r#"
name: env-check
services:
  check:
    instances: 2
    resources:
      memory: 32
      vcores: 1
    env:
      GREETING: hello
    commands:
      - test "$GREETING" = hello
      - test -n "$FLOTILLA_APPLICATION_ID"
      - test -n "$FLOTILLA_MASTER_ADDRESS"
      - test -f "$FLOTILLA_SECURITY_DIR/flotilla.crt"
"#,
        )?)
        .await?;

    let failing = client
        .submit(&spec(
            r#"
name: failing
services:
  ok:
    resources:
      memory: 32
      vcores: 1
    commands:
      - "true"
  broken:
    resources:
      memory: 32
      vcores: 1
    commands:
      - exit 3
      - echo unreachable
"#,
        )?)
        .await?;

    wait_for_state(&client, &succeeding, ApplicationState::Finished).await?;
    wait_for_state(&client, &failing, ApplicationState::Failed).await?;

    let report = client.application_report(&succeeding).await?;
    assert_eq!(FinalStatus::Succeeded, report.final_status);
    assert!(report.finish_time.is_some());

    let report = client.application_report(&failing).await?;
    assert_eq!(FinalStatus::Failed, report.final_status);

    assert!(client.get_applications(&[]).await?.is_empty());
    assert_eq!(
        2,
        client
            .get_applications(&[ApplicationState::Finished, ApplicationState::Failed])
            .await?
            .len()
    );

    client.close().await?;

    Ok(())
}

#[tokio::test]
async fn killed_applications_leave_the_active_list() -> Result<()> {
    let dir = TempDir::new()?;
    let mut client = start_client(&dir).await?;

    let id = client.submit(&spec(SLEEPER)?).await?;
    let app = client.connect(&id, true).await?;
    let running = &app;
    eventually(|| async move {
        Ok::<_, anyhow::Error>(running.containers(&[], &[ContainerState::Running]).await?.len() == 1)
    })
    .await?;

    client.kill_application(&id).await?;
    // Killing twice keeps the first outcome.
    client.kill_application(&id).await?;

    let report = client.application_report(&id).await?;
    assert_eq!(ApplicationState::Killed, report.state);
    assert_eq!(FinalStatus::Killed, report.final_status);

    assert!(client.get_applications(&[]).await?.is_empty());
    let killed = client.get_applications(&[ApplicationState::Killed]).await?;
    assert_eq!(1, killed.len());
    assert!(killed[0].tags.contains("test"));

    assert!(matches!(
        client.connect(&id, false).await,
        Err(Error::Connection(_))
    ));

    client.close().await?;

    Ok(())
}
