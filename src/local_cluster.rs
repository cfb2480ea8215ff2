use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    process::Stdio,
    sync::{Arc, Mutex},
};
use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use tokio::{
    process::{Child, Command},
    sync::{
        mpsc::Sender,
        oneshot::{self, error::TryRecvError},
    },
};
use tracing::{debug, error, info, warn};

use crate::{
    container::ContainerId,
    resource_manager::{ContainerOutcome, ContainerRequest, ResourceEvent, ResourceManager},
};

pub const CONTAINER_ID_ENV: &str = "FLOTILLA_CONTAINER_ID";

/// A started or pending container. `process_group` is set once the process
/// exists.
#[derive(Debug)]
struct Registration {
    kill: oneshot::Sender<()>,
    process_group: Option<Pid>,
}

type Registrations = Arc<Mutex<HashMap<ContainerId, Registration>>>;

/// Runs every container as a shell process on the local machine.
pub struct LocalResourceManager {
    shell: String,
    /// Environment shared by every container of the application.
    env: BTreeMap<String, String>,
    log_directory: Option<PathBuf>,
    events: Sender<ResourceEvent>,
    registrations: Registrations,
}

impl LocalResourceManager {
    pub fn new(
        shell: impl Into<String>,
        env: BTreeMap<String, String>,
        log_directory: Option<PathBuf>,
        events: Sender<ResourceEvent>,
    ) -> Self {
        Self {
            shell: shell.into(),
            env,
            log_directory,
            events,
            registrations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn command(&self, id: &ContainerId, request: &ContainerRequest) -> std::io::Result<Command> {
        let mut script = String::from("set -e\n");
        for line in request.spec.commands.iter() {
            script.push_str(line);
            script.push('\n');
        }

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(script)
            .envs(self.env.iter())
            .envs(request.spec.env.iter())
            .env(CONTAINER_ID_ENV, id.to_string())
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);

        match &self.log_directory {
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
            Some(directory) => {
                std::fs::create_dir_all(directory)?;
                let log = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(directory.join(format!("{id}.log")))?;
                command.stdout(Stdio::from(log.try_clone()?)).stderr(Stdio::from(log));
            }
        }

        Ok(command)
    }
}

#[async_trait]
impl ResourceManager for LocalResourceManager {
    #[tracing::instrument(name = "LocalResourceManager::request_containers", skip_all, fields(
        service = %request.service,
        instances = ?request.instances
    ))]
    async fn request_containers(&self, request: ContainerRequest) {
        debug!(
            memory = request.spec.resources.memory,
            vcores = request.spec.resources.vcores,
            "resources are not enforced locally"
        );

        for id in request.container_ids() {
            let (kill_tx, kill_rx) = oneshot::channel();

            let command = match self.command(&id, &request) {
                Ok(command) => command,
                Err(error) => {
                    error!(?error, %id, "unable to prepare container");
                    // The caller may hold the lock the event consumer needs.
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        send_event(
                            &events,
                            ResourceEvent::Completed {
                                id,
                                outcome: ContainerOutcome::Failed {
                                    message: error.to_string(),
                                },
                            },
                        )
                        .await
                    });
                    continue;
                }
            };

            if let Ok(mut registrations) = self.registrations.lock() {
                registrations.insert(
                    id.clone(),
                    Registration {
                        kill: kill_tx,
                        process_group: None,
                    },
                );
            }

            tokio::spawn(run_container(
                id,
                command,
                kill_rx,
                self.events.clone(),
                Arc::clone(&self.registrations),
            ));
        }
    }

    #[tracing::instrument(name = "LocalResourceManager::release_container", skip_all, fields(
        id = %id
    ))]
    async fn release_container(&self, id: ContainerId) {
        let registration = match self.registrations.lock() {
            Ok(mut registrations) => registrations.remove(&id),
            Err(_) => None,
        };

        let Some(registration) = registration else {
            debug!("container already gone");
            return;
        };

        info!("releasing container");

        // Killed here rather than in the container's task, which may never
        // run again if the runtime is shutting down.
        if let Some(process_group) = registration.process_group {
            kill_process_group(process_group, &id);
        }

        let _ = registration.kill.send(());
    }
}

/// Drives one container process until it exits or is released.
async fn run_container(
    id: ContainerId,
    mut command: Command,
    mut kill_rx: oneshot::Receiver<()>,
    events: Sender<ResourceEvent>,
    registrations: Registrations,
) {
    // Released before it was ever started.
    if !matches!(kill_rx.try_recv(), Err(TryRecvError::Empty)) {
        send_event(
            &events,
            ResourceEvent::Completed {
                id,
                outcome: ContainerOutcome::Killed,
            },
        )
        .await;
        return;
    }

    let mut process = match command.spawn() {
        Ok(process) => process,
        Err(error) => {
            error!(?error, %id, "unable to spawn container process");
            unregister(&registrations, &id);
            send_event(
                &events,
                ResourceEvent::Completed {
                    id,
                    outcome: ContainerOutcome::Failed {
                        message: error.to_string(),
                    },
                },
            )
            .await;
            return;
        }
    };

    info!(%id, pid = ?process.id(), "container process spawned");

    if let Some(pid) = process.id().and_then(|pid| i32::try_from(pid).ok()) {
        if let Ok(mut registrations) = registrations.lock() {
            if let Some(registration) = registrations.get_mut(&id) {
                registration.process_group = Some(Pid::from_raw(pid));
            }
        }
    }

    send_event(&events, ResourceEvent::Running { id: id.clone() }).await;

    let outcome = tokio::select! {
        status = process.wait() => match status {
            Ok(status) if status.success() => ContainerOutcome::Succeeded,
            Ok(status) => ContainerOutcome::Failed {
                message: format!("container exited with {status}"),
            },
            Err(error) => ContainerOutcome::Failed {
                message: error.to_string(),
            },
        },
        // Either an explicit release or the resource manager going away.
        _ = &mut kill_rx => {
            terminate(&mut process, &id).await;
            ContainerOutcome::Killed
        }
    };

    unregister(&registrations, &id);
    send_event(&events, ResourceEvent::Completed { id, outcome }).await;
}

/// Kills the whole process group so commands started by the shell go too.
async fn terminate(process: &mut Child, id: &ContainerId) {
    if let Some(pid) = process.id().and_then(|pid| i32::try_from(pid).ok()) {
        kill_process_group(Pid::from_raw(pid), id);
    }

    if let Err(error) = process.kill().await {
        warn!(?error, %id, "unable to kill container process");
    }
}

fn kill_process_group(process_group: Pid, id: &ContainerId) {
    if let Err(error) = killpg(process_group, Signal::SIGKILL) {
        debug!(?error, %id, "unable to signal container process group");
    }
}

fn unregister(registrations: &Registrations, id: &ContainerId) {
    if let Ok(mut registrations) = registrations.lock() {
        registrations.remove(id);
    }
}

async fn send_event(events: &Sender<ResourceEvent>, event: ResourceEvent) {
    if let Err(error) = events.send(event).await {
        debug!(?error, "event receiver closed");
    }
}
