use anyhow::Result;
use tempfile::TempDir;

use crate::{error::Error, security::Security};

#[cfg(test)]
mod credential_tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn creates_and_loads_a_pair() -> Result<()> {
        let dir = TempDir::new()?;

        let created = Security::from_new_directory(dir.path().join("nested"), false)?;
        assert!(created.cert_path().exists());
        assert!(created.key_path().exists());
        assert!(String::from_utf8_lossy(created.cert_pem()).contains("BEGIN CERTIFICATE"));

        let loaded = Security::from_directory(dir.path().join("nested"))?;
        assert_eq!(created, loaded);

        Ok(())
    }

    #[test]
    fn refuses_to_overwrite_without_force() -> Result<()> {
        let dir = TempDir::new()?;
        let first = Security::from_new_directory(dir.path(), false)?;

        assert!(matches!(
            Security::from_new_directory(dir.path(), false),
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(first, Security::from_directory(dir.path())?);

        let forced = Security::from_new_directory(dir.path(), true)?;
        assert_ne!(first, forced);
        assert_eq!(forced, Security::from_directory(dir.path())?);

        Ok(())
    }

    #[test]
    fn a_lone_key_blocks_generation() -> Result<()> {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join(crate::security::KEY_FILE), "stale")?;

        assert!(matches!(
            Security::from_new_directory(dir.path(), false),
            Err(Error::AlreadyExists(_))
        ));

        Ok(())
    }

    #[test]
    fn missing_files_are_not_found() -> Result<()> {
        let dir = TempDir::new()?;

        assert!(matches!(
            Security::from_directory(dir.path()),
            Err(Error::NotFound(_))
        ));

        Ok(())
    }

    #[test]
    fn concurrent_first_use_agrees_on_one_pair() -> Result<()> {
        let dir = Arc::new(TempDir::new()?);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dir = Arc::clone(&dir);
                thread::spawn(move || Security::load_or_create(dir.path()))
            })
            .collect();

        let mut pairs = Vec::new();
        let mut created = 0;
        for handle in handles {
            let (security, was_created) = handle.join().expect("thread panicked")?;
            if was_created {
                created += 1;
            }
            pairs.push(security);
        }

        assert_eq!(1, created);
        let on_disk = Security::from_directory(dir.path())?;
        assert!(pairs.iter().all(|pair| *pair == on_disk));

        Ok(())
    }

    #[test]
    fn readers_never_see_a_mixed_pair_during_regeneration() -> Result<()> {
        let dir = Arc::new(TempDir::new()?);
        let initial = Security::from_new_directory(dir.path(), false)?;

        let writer = {
            let dir = Arc::clone(&dir);
            thread::spawn(move || {
                (0..100)
                    .map(|_| Security::from_new_directory(dir.path(), true))
                    .collect::<crate::error::Result<Vec<_>>>()
            })
        };

        let mut observed = Vec::new();
        loop {
            match Security::from_directory(dir.path()) {
                Ok(security) => observed.push(security),
                // Regenerations can outpace every retry.
                Err(Error::Internal(_)) => {}
                Err(error) => return Err(error.into()),
            }
            if writer.is_finished() {
                break;
            }
        }

        let mut generated = writer.join().expect("writer panicked")?;
        generated.push(initial);

        assert!(!observed.is_empty());
        let mixed = observed
            .iter()
            .filter(|pair| !generated.contains(pair))
            .count();
        assert_eq!(0, mixed);

        Ok(())
    }

    #[test]
    fn failed_regeneration_leaves_no_lone_key() -> Result<()> {
        let dir = TempDir::new()?;
        std::fs::create_dir(dir.path().join(crate::security::CERT_FILE))?;

        assert!(Security::from_new_directory(dir.path(), true).is_err());
        assert!(!dir.path().join(crate::security::KEY_FILE).exists());

        Ok(())
    }
}

#[cfg(test)]
mod default_credential_tests {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use crate::security::CONFIG_DIR_ENV;

    use super::*;

    #[derive(Clone, Default)]
    struct CapturedOutput(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedOutput {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("lock poisoned").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CapturedOutput {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().expect("lock poisoned")).into_owned()
        }
    }

    // The only test touching the per-user pair, which is cached for the
    // whole process.
    #[test]
    fn first_use_creates_the_pair_and_warns_once() -> Result<()> {
        let dir = TempDir::new()?;
        std::env::set_var(CONFIG_DIR_ENV, dir.path().join("credentials"));
        assert_eq!(dir.path().join("credentials"), Security::default_directory()?);

        let output = CapturedOutput::default();
        let subscriber = {
            let output = output.clone();
            tracing_subscriber::fmt()
                .with_ansi(false)
                .with_max_level(tracing::Level::WARN)
                .with_writer(move || output.clone())
                .finish()
        };

        let (first, second) = tracing::subscriber::with_default(subscriber, || {
            Ok::<_, Error>((Security::from_default()?, Security::from_default()?))
        })?;

        assert_eq!(dir.path().join("credentials"), first.directory());
        assert!(first.cert_path().exists());
        assert!(first.key_path().exists());
        assert_eq!(first, second);
        assert_eq!(first, Security::from_directory(first.directory())?);

        let logs = output.contents();
        assert_eq!(1, logs.matches("WARN").count(), "{logs}");
        assert!(logs.contains("no credentials found"));

        Ok(())
    }
}

#[cfg(test)]
mod mutual_tls_tests {
    use std::{sync::Arc, time::Duration};

    use tokio::net::TcpListener;
    use tokio_stream::wrappers::TcpListenerStream;
    use tonic::transport::Server;

    use crate::{
        config::Config,
        driver::Driver,
        proto::{driver_client::DriverClient, driver_server::DriverServer, Empty},
        server::DriverService,
    };

    use super::*;

    async fn serve(security: &Security) -> Result<String> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();

        let driver = Arc::new(Driver::new(security.clone(), Config::default()));
        let router = Server::builder()
            .tls_config(security.server_tls_config())?
            .add_service(DriverServer::new(DriverService::new(driver)));

        tokio::spawn(router.serve_with_incoming(TcpListenerStream::new(listener)));

        Ok(address)
    }

    async fn ping(security: &Security, address: &str) -> crate::error::Result<()> {
        let channel = security.connect(address).await?;
        DriverClient::new(channel).ping(Empty {}).await?;
        Ok(())
    }

    #[tokio::test]
    async fn accepts_clients_with_the_same_pair() -> Result<()> {
        let dir = TempDir::new()?;
        let security = Security::from_new_directory(dir.path(), false)?;
        let address = serve(&security).await?;

        ping(&security, &address).await?;

        Ok(())
    }

    #[tokio::test]
    async fn rejects_clients_with_another_pair() -> Result<()> {
        let server_dir = TempDir::new()?;
        let client_dir = TempDir::new()?;
        let server = Security::from_new_directory(server_dir.path(), false)?;
        let client = Security::from_new_directory(client_dir.path(), false)?;
        let address = serve(&server).await?;

        let result = tokio::time::timeout(Duration::from_secs(10), ping(&client, &address)).await?;

        assert!(result.is_err());

        Ok(())
    }
}
