use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tempfile::NamedTempFile;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity, ServerTlsConfig};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub const CERT_FILE: &str = "flotilla.crt";
pub const KEY_FILE: &str = "flotilla.pem";

/// Name every daemon certificate is issued for. Clients verify against it
/// instead of the address they dialed.
pub const SERVER_NAME: &str = "flotilla-internal";

/// Overrides the per-user credential directory.
pub const CONFIG_DIR_ENV: &str = "FLOTILLA_CONFIG_DIR";

const DEFAULT_DIR_NAME: &str = ".flotilla";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const LOAD_ATTEMPTS: usize = 20;
const LOAD_RETRY_DELAY: Duration = Duration::from_millis(25);

static DEFAULT_SECURITY: OnceLock<Security> = OnceLock::new();

/// A certificate/key pair used as both identity and trust root for every
/// connection between clients and daemons.
#[derive(Debug, Clone)]
pub struct Security {
    directory: PathBuf,
    cert: Vec<u8>,
    key: Vec<u8>,
}

impl PartialEq for Security {
    fn eq(&self, other: &Self) -> bool {
        self.cert == other.cert && self.key == other.key
    }
}

impl Eq for Security {}

impl Security {
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn cert_path(&self) -> PathBuf {
        self.directory.join(CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.directory.join(KEY_FILE)
    }

    pub fn cert_pem(&self) -> &[u8] {
        &self.cert
    }

    pub fn key_pem(&self) -> &[u8] {
        &self.key
    }

    /// Generates a fresh pair under `path`.
    ///
    /// Fails with [`Error::AlreadyExists`] if either file is already there,
    /// unless `force` is set, in which case both are replaced by newly
    /// generated ones.
    #[tracing::instrument(name = "Security::from_new_directory", skip_all, fields(
        path = ?path.as_ref(),
        force = force
    ))]
    pub fn from_new_directory(path: impl AsRef<Path>, force: bool) -> Result<Self> {
        let directory = path.as_ref();
        fs::create_dir_all(directory)?;

        let cert_path = directory.join(CERT_FILE);
        let key_path = directory.join(KEY_FILE);

        if !force && (cert_path.exists() || key_path.exists()) {
            return Err(Error::AlreadyExists(format!(
                "credentials already exist in {}",
                directory.display()
            )));
        }

        let (cert, key) = generate_pair()?;

        // Readers retry until the key matches the certificate, so the files
        // may land one at a time.
        write_atomically(&key_path, &key, force)?;
        if let Err(error) = write_atomically(&cert_path, &cert, force) {
            // A lone key would block every later non-forced generation.
            if let Err(remove_error) = fs::remove_file(&key_path) {
                warn!(?remove_error, "unable to remove orphaned key");
            }
            return Err(error);
        }

        info!("generated new credentials");

        Ok(Self {
            directory: directory.to_path_buf(),
            cert,
            key,
        })
    }

    /// Loads an existing pair. Fails with [`Error::NotFound`] if either file
    /// is missing.
    #[tracing::instrument(name = "Security::from_directory", skip_all, fields(
        path = ?path.as_ref()
    ))]
    pub fn from_directory(path: impl AsRef<Path>) -> Result<Self> {
        let directory = path.as_ref();
        let cert_path = directory.join(CERT_FILE);
        let key_path = directory.join(KEY_FILE);

        for _ in 0..LOAD_ATTEMPTS {
            let cert = read_credential(&cert_path)?;
            let key = read_credential(&key_path)?;

            // A forced regeneration replaces the key before the certificate.
            if key_matches_certificate(&cert, &key)? {
                return Ok(Self {
                    directory: directory.to_path_buf(),
                    cert,
                    key,
                });
            }

            debug!("key does not match certificate, retrying");
            std::thread::sleep(LOAD_RETRY_DELAY);
        }

        Err(Error::Internal(format!(
            "credentials in {} kept changing while being loaded",
            directory.display()
        )))
    }

    /// Loads the per-user pair, creating it on first use.
    pub fn from_default() -> Result<Self> {
        if let Some(security) = DEFAULT_SECURITY.get() {
            return Ok(security.clone());
        }

        let directory = Self::default_directory()?;
        let (security, _created) = Self::load_or_create(&directory)?;

        Ok(DEFAULT_SECURITY.get_or_init(|| security).clone())
    }

    pub fn default_directory() -> Result<PathBuf> {
        if let Some(directory) = std::env::var_os(CONFIG_DIR_ENV) {
            return Ok(PathBuf::from(directory));
        }

        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(DEFAULT_DIR_NAME))
            .ok_or_else(|| Error::NotFound("unable to resolve the home directory".to_owned()))
    }

    /// Returns the pair in `directory` and whether this call created it.
    #[tracing::instrument(name = "Security::load_or_create", skip_all, fields(
        directory = ?directory
    ))]
    pub(crate) fn load_or_create(directory: &Path) -> Result<(Self, bool)> {
        match Self::from_directory(directory) {
            Ok(security) => return Ok((security, false)),
            Err(Error::NotFound(_)) => {}
            Err(error) => return Err(error),
        }

        match Self::from_new_directory(directory, false) {
            Ok(security) => {
                warn!(
                    ?directory,
                    "no credentials found, generated a new certificate and key"
                );
                Ok((security, true))
            }
            Err(Error::AlreadyExists(_)) => {
                // Another process won the race. Its certificate may not be in
                // place yet.
                let mut last_error = None;
                for _ in 0..LOAD_ATTEMPTS {
                    match Self::from_directory(directory) {
                        Ok(security) => return Ok((security, false)),
                        Err(error) => last_error = Some(error),
                    }
                    std::thread::sleep(LOAD_RETRY_DELAY);
                }
                Err(last_error.unwrap_or_else(|| {
                    Error::NotFound(format!("no credentials in {}", directory.display()))
                }))
            }
            Err(error) => Err(error),
        }
    }

    pub fn identity(&self) -> Identity {
        Identity::from_pem(&self.cert, &self.key)
    }

    /// Requires clients to present this same certificate.
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity())
            .client_ca_root(Certificate::from_pem(&self.cert))
    }

    pub fn client_tls_config(&self) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(&self.cert))
            .identity(self.identity())
            .domain_name(SERVER_NAME)
    }

    /// Opens an authenticated channel to a daemon listening on `address`.
    #[tracing::instrument(name = "Security::connect", skip_all, fields(
        address = %address
    ))]
    pub async fn connect(&self, address: &str) -> Result<Channel> {
        let endpoint = Endpoint::from_shared(format!("https://{address}"))
            .map_err(|error| Error::InvalidArgument(format!("bad address {address}: {error}")))?
            .tls_config(self.client_tls_config())?
            .connect_timeout(CONNECT_TIMEOUT);

        endpoint
            .connect()
            .await
            .map_err(|error| Error::Connection(format!("unable to connect to {address}: {error}")))
    }
}

fn generate_pair() -> Result<(Vec<u8>, Vec<u8>)> {
    let key_pair = KeyPair::generate()?;

    let mut params = CertificateParams::new(vec![SERVER_NAME.to_owned(), "localhost".to_owned()])?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "flotilla");
    dn.push(DnType::CommonName, SERVER_NAME);
    params.distinguished_name = dn;

    let cert = params.self_signed(&key_pair)?;

    Ok((cert.pem().into_bytes(), key_pair.serialize_pem().into_bytes()))
}

/// Whether the certificate in `cert` was issued for the key in `key`.
fn key_matches_certificate(cert: &[u8], key: &[u8]) -> Result<bool> {
    let key = std::str::from_utf8(key)
        .map_err(|error| Error::Internal(format!("key is not valid PEM: {error}")))?;
    // Each file is replaced whole, so both always parse.
    let key_pair = KeyPair::from_pem(key)?;
    let public_key = key_pair.public_key_raw();

    let mut reader = cert;
    let der = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| Error::Internal("no certificate found".to_owned()))??;

    Ok(der
        .as_ref()
        .windows(public_key.len())
        .any(|window| window == public_key))
}

fn read_credential(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|error| match error.kind() {
        io::ErrorKind::NotFound => Error::NotFound(format!("{} does not exist", path.display())),
        _ => Error::Io(error),
    })
}

fn write_atomically(path: &Path, contents: &[u8], overwrite: bool) -> Result<()> {
    let directory = path
        .parent()
        .ok_or_else(|| Error::InvalidArgument(format!("{} has no parent", path.display())))?;

    let mut file = NamedTempFile::new_in(directory)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;

    let persisted = if overwrite {
        file.persist(path)
    } else {
        file.persist_noclobber(path)
    };

    persisted.map_err(|error| match error.error.kind() {
        io::ErrorKind::AlreadyExists => {
            Error::AlreadyExists(format!("{} already exists", path.display()))
        }
        _ => Error::Io(error.error),
    })?;

    Ok(())
}
