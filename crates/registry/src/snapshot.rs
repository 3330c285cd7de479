//! JSON snapshots in the backup directory.
//!
//! Every snapshot is one `{name}.json` file, replaced atomically on write so
//! a crash never leaves a half-written snapshot behind.

use crate::error::{RegistryError, RegistryResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Named JSON snapshots under a fixed directory.
#[derive(Clone, Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> RegistryResult<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(format!("{name}.json")))
    }

    /// Serialize `value` and atomically replace the snapshot `name`.
    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        name: &str,
        value: &T,
    ) -> RegistryResult<PathBuf> {
        let path = self.path(name)?;
        let data = serde_json::to_vec_pretty(value)?;
        fs::create_dir_all(&self.dir).await?;

        // Unique temp name so concurrent writers of the same snapshot never share a file
        let temp_path = self.dir.join(format!("{name}.json.tmp.{}", Uuid::new_v4()));
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
        }
        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        tracing::debug!(path = %path.display(), bytes = data.len(), "Snapshot written");
        Ok(path)
    }

    /// Read the snapshot `name`, or `None` when it was never written.
    pub async fn read_json<T: DeserializeOwned>(&self, name: &str) -> RegistryResult<Option<T>> {
        let path = self.path(name)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the snapshot `name` exists.
    pub async fn exists(&self, name: &str) -> RegistryResult<bool> {
        let path = self.path(name)?;
        Ok(fs::try_exists(&path).await?)
    }
}

/// `{base}-{YYYYMMDD}-{HHMMSS}-{mmm}-{suffix}`, lowercase and safe as a file
/// name on every platform. The random suffix keeps names taken within the
/// same millisecond apart.
pub fn timestamped_name(base: &str, at: OffsetDateTime) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{base}-{:04}{:02}{:02}-{:02}{:02}{:02}-{:03}-{}",
        at.year(),
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute(),
        at.second(),
        at.millisecond(),
        &suffix[..8]
    )
}

fn validate_name(name: &str) -> RegistryResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(RegistryError::Config(format!("invalid snapshot name: {name:?}")))
    }
}
