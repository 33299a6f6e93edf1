//! Writing into the copy destination

use anyhow::Context;

/// Destination of the copy
///
/// Target paths are relative, with forward slashes, as produced by
/// [`crate::path::adjust_target_path`]. Both operations must be idempotent: work items are
/// delivered at least once.
#[async_trait::async_trait]
pub trait TargetWriter: Send + Sync + std::fmt::Debug {
    /// Returns false if the folder could not be created
    async fn create_folder(&self, target_path: &str) -> anyhow::Result<bool>;
    /// Copies `source_path` into the folder `target_folder`, returns false if the copy failed
    async fn copy_file(&self, source_path: &str, target_folder: &str) -> anyhow::Result<bool>;
}

/// Target rooted at a local (or mounted) directory
#[derive(Debug, Clone)]
pub struct FsTarget {
    root: std::path::PathBuf,
}

impl FsTarget {
    pub fn new(root: &std::path::Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn resolve(&self, target_path: &str) -> std::path::PathBuf {
        let mut path = self.root.clone();
        for part in target_path.split('/').filter(|part| !part.is_empty()) {
            path.push(part);
        }
        path
    }
}

#[async_trait::async_trait]
impl TargetWriter for FsTarget {
    async fn create_folder(&self, target_path: &str) -> anyhow::Result<bool> {
        let path = self.resolve(target_path);
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("cannot create directory {path:?}"))?;
        Ok(true)
    }

    async fn copy_file(&self, source_path: &str, target_folder: &str) -> anyhow::Result<bool> {
        let source = std::path::Path::new(source_path);
        let Some(file_name) = source.file_name() else {
            return Err(anyhow::anyhow!("source {source_path:?} has no file name"));
        };
        let folder = self.resolve(target_folder);
        tokio::fs::create_dir_all(&folder)
            .await
            .with_context(|| format!("cannot create directory {folder:?}"))?;
        let destination = folder.join(file_name);
        // overwrite, a redelivered copy must converge to the same result
        let bytes = tokio::fs::copy(source, &destination)
            .await
            .with_context(|| format!("failed copying {source:?} to {destination:?}"))?;
        tracing::debug!("copied {:?} to {:?} ({} bytes)", source, destination, bytes);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copy_creates_parents_and_overwrites() -> anyhow::Result<()> {
        let src = tempfile::tempdir()?;
        let dst = tempfile::tempdir()?;
        let file = src.path().join("data.txt");
        std::fs::write(&file, "first")?;
        let target = FsTarget::new(dst.path());
        let file_str = file.to_string_lossy().to_string();
        assert!(target.copy_file(&file_str, "archive/x").await?);
        let copied = dst.path().join("archive").join("x").join("data.txt");
        assert_eq!(std::fs::read_to_string(&copied)?, "first");
        std::fs::write(&file, "second")?;
        assert!(target.copy_file(&file_str, "archive/x").await?);
        assert_eq!(std::fs::read_to_string(&copied)?, "second");
        Ok(())
    }

    #[tokio::test]
    async fn create_folder_is_idempotent() -> anyhow::Result<()> {
        let dst = tempfile::tempdir()?;
        let target = FsTarget::new(dst.path());
        assert!(target.create_folder("a/b/c").await?);
        assert!(target.create_folder("a/b/c").await?);
        assert!(dst.path().join("a/b/c").is_dir());
        // empty target path is the root itself
        assert!(target.create_folder("").await?);
        Ok(())
    }

    #[tokio::test]
    async fn missing_source_is_an_error() -> anyhow::Result<()> {
        let dst = tempfile::tempdir()?;
        let target = FsTarget::new(dst.path());
        assert!(target.copy_file("/nonexistent/file", "a").await.is_err());
        Ok(())
    }
}
