//! Remote endpoint support for zsync tools
//!
//! - [`endpoint`]: parsing `ssh://user@host[:port]:pool/fs` locators and wrapping commands
//!   so they execute on the endpoint
//! - [`relay`]: `mbuffer` relay commands, listener readiness and coordination port cleanup
//! - [`read_catalog`]: listing the snapshots of an endpoint's filesystem

use anyhow::{Context, anyhow};
use tracing::instrument;

pub mod endpoint;
pub mod relay;

pub use endpoint::{Endpoint, EndpointParseError, SshSession};

pub const DEFAULT_ZFS: &str = "/sbin/zfs";

#[derive(Debug, thiserror::Error)]
#[error("failed reading snapshot catalog from {endpoint}")]
pub struct CatalogReadFailure {
    pub endpoint: String,
    #[source]
    pub source: anyhow::Error,
}

/// `zfs get` query listing the creation time of the filesystem and everything one level below
pub fn catalog_query_args(zfs: &str, filesystem: &str) -> Vec<String> {
    vec![
        zfs.to_string(),
        "get".to_string(),
        "-Hpd".to_string(),
        "1".to_string(),
        "creation".to_string(),
        filesystem.to_string(),
    ]
}

/// Read the snapshot catalog of `endpoint`'s filesystem.
///
/// A query exiting unsuccessfully fails the whole read; malformed lines in a successful
/// output are skipped.
#[instrument(skip_all, fields(endpoint = %endpoint))]
pub async fn read_catalog(
    endpoint: &Endpoint,
    zfs: &str,
) -> Result<common::catalog::SnapshotCatalog, CatalogReadFailure> {
    let query = async {
        let command = endpoint.build_command(catalog_query_args(zfs, endpoint.filesystem()));
        tracing::debug!("catalog query: {:?}", command);
        let (status, output) = common::pipeline::Pipeline::new(command).output().await?;
        if let Some(failed) = status.failed() {
            return Err(anyhow!("{}", failed));
        }
        let output = String::from_utf8(output).context("catalog output is not valid UTF-8")?;
        Ok::<_, anyhow::Error>(common::catalog::SnapshotCatalog::parse(&output))
    };
    let catalog = query.await.map_err(|source| CatalogReadFailure {
        endpoint: endpoint.to_string(),
        source,
    })?;
    tracing::info!("{} snapshots found on {}", catalog.len(), endpoint);
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn fake_zfs(dir: &std::path::Path, script: &str) -> String {
        let path = dir.join("zfs");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[test]
    fn catalog_query_is_depth_one_creation() {
        assert_eq!(
            catalog_query_args(DEFAULT_ZFS, "tank/fs"),
            vec!["/sbin/zfs", "get", "-Hpd", "1", "creation", "tank/fs"]
        );
    }

    #[tokio::test]
    async fn read_catalog_parses_query_output() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let zfs = fake_zfs(
            dir.path(),
            r#"[ "$1 $2 $3 $4 $5" = "get -Hpd 1 creation tank/fs" ] || exit 2
printf 'tank/fs\tcreation\t10\t-\n'
printf 'tank/fs@a\tcreation\t100\t-\n'
printf 'not a catalog line\n'
printf 'tank/fs@b\tcreation\t200\t-\n'"#,
        );
        let catalog = read_catalog(&Endpoint::local("tank/fs"), &zfs).await?;
        let entries: Vec<(u64, &str)> = catalog
            .iter()
            .map(|record| (record.creation, record.name.as_str()))
            .collect();
        assert_eq!(entries, vec![(100, "a"), (200, "b")]);
        Ok(())
    }

    #[tokio::test]
    async fn read_catalog_fails_on_query_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let zfs = fake_zfs(
            dir.path(),
            "echo \"cannot open '$5': dataset does not exist\" >&2\nexit 1",
        );
        let error = read_catalog(&Endpoint::local("tank/missing"), &zfs)
            .await
            .unwrap_err();
        assert_eq!(error.endpoint, "tank/missing");
        assert_eq!(
            error.to_string(),
            "failed reading snapshot catalog from tank/missing"
        );
        assert!(error.source.to_string().contains("exit status: 1"));
        // the cause is reported once when the error is rendered as a chain
        let chain = format!("{:#}", anyhow::Error::from(error));
        assert_eq!(chain.matches("exit status: 1").count(), 1);
        Ok(())
    }
}
