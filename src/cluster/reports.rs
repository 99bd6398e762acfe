//! Node-local report files.
//!
//! Names are validated before any filesystem access: a name must be a
//! single normal path component. Anything else, and any directory, is
//! forbidden.

use std::path::{Component, Path, PathBuf};

use crate::error::{EngineError, Result};

/// Directory holding report artifacts served to other nodes.
#[derive(Debug, Clone)]
pub struct ReportDirectory {
    root: PathBuf,
}

/// Rejects empty names, separators, `.`/`..` and absolute paths.
///
/// ```
/// use taskweave::cluster::reports::validate_name;
///
/// assert!(validate_name("heap-2024.txt").is_ok());
/// assert!(validate_name("../../etc/passwd").is_err());
/// assert!(validate_name("/etc/passwd").is_err());
/// assert!(validate_name("..").is_err());
/// ```
pub fn validate_name(name: &str) -> Result<()> {
    let forbidden = || EngineError::ForbiddenFile {
        name: name.to_string(),
    };
    if name.is_empty() || name.contains(['/', '\\', '\0']) {
        return Err(forbidden());
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(forbidden()),
    }
}

impl ReportDirectory {
    /// Serves files under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn resolve(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        let path = self.root.join(name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Err(EngineError::ForbiddenFile {
                name: name.to_string(),
            }),
            Ok(_) => Ok(path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(EngineError::FileNotFound {
                name: name.to_string(),
            }),
            Err(e) => Err(EngineError::Io(e)),
        }
    }

    /// Reads a report file.
    pub async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.resolve(name).await?;
        Ok(tokio::fs::read(path).await?)
    }

    /// Deletes a report file.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let path = self.resolve(name).await?;
        tokio::fs::remove_file(path).await?;
        tracing::info!(file = name, "report file deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn reads_and_deletes_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dump.txt"), b"state").unwrap();
        let reports = ReportDirectory::new(dir.path());

        assert_eq!(reports.read("dump.txt").await.unwrap(), b"state".to_vec());
        reports.delete("dump.txt").await.unwrap();
        assert!(matches!(
            reports.read("dump.txt").await,
            Err(EngineError::FileNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn directories_are_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        let reports = ReportDirectory::new(dir.path());

        assert!(matches!(
            reports.delete("nested").await,
            Err(EngineError::ForbiddenFile { .. })
        ));
        assert!(dir.path().join("nested").exists());
    }

    #[tokio::test]
    async fn traversal_is_rejected_before_lookup() {
        let reports = ReportDirectory::new("/definitely/not/here");
        assert!(matches!(
            reports.read("../../etc/passwd").await,
            Err(EngineError::ForbiddenFile { .. })
        ));
        assert!(matches!(
            reports.read("missing.txt").await,
            Err(EngineError::FileNotFound { .. })
        ));
    }

    proptest! {
        #[test]
        fn names_with_separators_never_validate(a in "[a-z.]{0,8}", b in "[a-z.]{0,8}") {
            prop_assert!(validate_name(&format!("{a}/{b}")).is_err(), "separator name validated");
            prop_assert!(validate_name(&format!("{a}\\{b}")).is_err(), "separator name validated");
        }

        #[test]
        fn plain_names_validate(name in "[a-zA-Z0-9_-][a-zA-Z0-9_.-]{0,20}") {
            prop_assert!(validate_name(&name).is_ok());
        }
    }
}
