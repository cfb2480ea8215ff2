use anyhow::Result;
use std::io::Write;

#[cfg(test)]
mod config_from_file_tests {
    use std::path::PathBuf;

    use tempfile::NamedTempFile;

    use crate::config::Config;

    use super::*;

    #[tokio::test]
    async fn reads_config_file() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        write!(
            &mut file,
            r#"
container:
  shell: /bin/bash
  log_directory: /tmp/flotilla-logs
master:
  event_buffer_size: 16
  max_containers_per_service: 50
"#
        )?;

        let config = Config::from_file(file.path()).await?;

        assert_eq!("/bin/bash", config.container.shell);
        assert_eq!(
            Some(PathBuf::from("/tmp/flotilla-logs")),
            config.container.log_directory
        );
        assert_eq!(16, config.master.event_buffer_size);
        assert_eq!(50, config.master.max_containers_per_service);

        Ok(())
    }

    #[tokio::test]
    async fn missing_fields_use_defaults() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        write!(
            &mut file,
            r#"
container:
  log_directory: /tmp/flotilla-logs
"#
        )?;

        let config = Config::from_file(file.path()).await?;

        assert_eq!("/bin/sh", config.container.shell);
        assert_eq!(100, config.master.event_buffer_size);
        assert_eq!(1000, config.master.max_containers_per_service);

        Ok(())
    }

    #[tokio::test]
    async fn empty_file_is_valid() -> Result<()> {
        let file = NamedTempFile::new()?;

        let config = Config::from_file(file.path()).await?;

        assert!(config.container.log_directory.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn event_buffer_size_must_be_positive() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        write!(
            &mut file,
            r#"
master:
  event_buffer_size: 0
"#
        )?;

        let error = Config::from_file(file.path()).await.unwrap_err();

        assert!(error.to_string().contains("event_buffer_size"));

        Ok(())
    }

    #[tokio::test]
    async fn container_limit_must_be_positive() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        write!(
            &mut file,
            r#"
master:
  max_containers_per_service: 0
"#
        )?;

        let error = Config::from_file(file.path()).await.unwrap_err();

        assert!(error.to_string().contains("max_containers_per_service"));

        Ok(())
    }
}
