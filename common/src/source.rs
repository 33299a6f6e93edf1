//! Enumeration of the source tree

use anyhow::Context;

use crate::filter::ExcludeFilter;

/// Lists folders and files of the source tree
#[async_trait::async_trait]
pub trait SourceEnumerator: Send + Sync + std::fmt::Debug {
    /// Sub-folders of `path`, sorted, exclusions applied
    async fn enumerate_folders(&self, path: &str) -> anyhow::Result<Vec<String>>;
    /// Files directly under `path`, exclusions applied, in no particular order
    async fn enumerate_files(&self, path: &str) -> anyhow::Result<Vec<String>>;
    async fn file_size(&self, path: &str) -> anyhow::Result<u64>;
}

/// Local filesystem tree rooted at `root`
#[derive(Debug, Clone)]
pub struct LocalSource {
    root: std::path::PathBuf,
    folder_filter: ExcludeFilter,
    file_filter: ExcludeFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Folder,
    File,
}

impl LocalSource {
    pub fn new(
        root: &std::path::Path,
        folder_filter: ExcludeFilter,
        file_filter: ExcludeFilter,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            folder_filter,
            file_filter,
        }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Path relative to the root with forward slashes, used for pattern matching
    fn relative(&self, path: &std::path::Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    async fn list(&self, path: &str, kind: EntryKind) -> anyhow::Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(path)
            .await
            .with_context(|| format!("cannot open directory {path:?} for reading"))?;
        let mut found = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed traversing directory {path:?}"))?
        {
            let entry_path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .with_context(|| format!("failed reading file type of {entry_path:?}"))?;
            let entry_kind = if file_type.is_dir() {
                EntryKind::Folder
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                tracing::debug!("skipping {:?}, not a folder or a regular file", entry_path);
                continue;
            };
            if entry_kind != kind {
                continue;
            }
            let Some(entry_str) = entry_path.to_str() else {
                tracing::warn!("skipping {:?}, name is not valid UTF-8", entry_path);
                continue;
            };
            let filter = match kind {
                EntryKind::Folder => &self.folder_filter,
                EntryKind::File => &self.file_filter,
            };
            if let Some(pattern) = filter.excluded_by(&self.relative(&entry_path)) {
                tracing::info!("excluding {:?} (matched '{}')", entry_path, pattern);
                continue;
            }
            found.push(entry_str.to_string());
        }
        if kind == EntryKind::Folder {
            found.sort();
        }
        Ok(found)
    }
}

#[async_trait::async_trait]
impl SourceEnumerator for LocalSource {
    async fn enumerate_folders(&self, path: &str) -> anyhow::Result<Vec<String>> {
        self.list(path, EntryKind::Folder).await
    }

    async fn enumerate_files(&self, path: &str) -> anyhow::Result<Vec<String>> {
        self.list(path, EntryKind::File).await
    }

    async fn file_size(&self, path: &str) -> anyhow::Result<u64> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("failed reading metadata of {path:?}"))?;
        Ok(metadata.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> anyhow::Result<tempfile::TempDir> {
        // root
        // |- 0.txt
        // |- b
        //    |- 1.txt
        //    |- 2.tmp
        // |- a
        // |- scratch
        let tmp = tempfile::tempdir()?;
        let root = tmp.path();
        std::fs::write(root.join("0.txt"), "0")?;
        std::fs::create_dir(root.join("b"))?;
        std::fs::write(root.join("b").join("1.txt"), "11")?;
        std::fs::write(root.join("b").join("2.tmp"), "222")?;
        std::fs::create_dir(root.join("a"))?;
        std::fs::create_dir(root.join("scratch"))?;
        Ok(tmp)
    }

    fn path_str(path: &std::path::Path) -> String {
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn folders_are_sorted_and_filtered() -> anyhow::Result<()> {
        let tmp = setup()?;
        let root = tmp.path();
        let source = LocalSource::new(
            root,
            ExcludeFilter::parse_list("/scratch")?,
            ExcludeFilter::new(),
        );
        let folders = source.enumerate_folders(&path_str(root)).await?;
        assert_eq!(
            folders,
            vec![path_str(&root.join("a")), path_str(&root.join("b"))]
        );
        Ok(())
    }

    #[tokio::test]
    async fn files_are_filtered_by_name() -> anyhow::Result<()> {
        let tmp = setup()?;
        let root = tmp.path();
        let source = LocalSource::new(
            root,
            ExcludeFilter::new(),
            ExcludeFilter::parse_list("*.tmp")?,
        );
        let files = source.enumerate_files(&path_str(&root.join("b"))).await?;
        assert_eq!(files, vec![path_str(&root.join("b").join("1.txt"))]);
        let root_files = source.enumerate_files(&path_str(root)).await?;
        assert_eq!(root_files, vec![path_str(&root.join("0.txt"))]);
        assert_eq!(source.file_size(&files[0]).await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn missing_folder_is_an_error() {
        let source = LocalSource::new(
            std::path::Path::new("/nonexistent"),
            ExcludeFilter::new(),
            ExcludeFilter::new(),
        );
        assert!(source.enumerate_folders("/nonexistent/dir").await.is_err());
    }
}
