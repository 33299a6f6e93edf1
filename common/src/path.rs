//! Mapping of source paths onto target paths

/// Target path adjustments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathSettings {
    /// Prepended to every target path
    pub destination_subfolder: String,
    /// Leading part of the source path dropped from the target path
    pub path_to_remove: String,
}

fn components(path: &str) -> Vec<&str> {
    path.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect()
}

fn strip_drive(path: &str) -> &str {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return &path[2..];
    }
    path
}

/// Computes the target path of `source_path`
///
/// The root (drive letter and leading separators) is stripped, then `path_to_remove`: as a leading
/// prefix if the path starts with it, otherwise everything up to and including its first
/// occurrence as a sequence of whole components. Backslashes become forward slashes, the result is
/// placed under `destination_subfolder` and never starts with a slash.
pub fn adjust_target_path(source_path: &str, settings: &PathSettings) -> String {
    let normalized = source_path.replace('\\', "/");
    let mut parts = components(strip_drive(&normalized));
    let remove_normalized = settings.path_to_remove.replace('\\', "/");
    let remove = components(strip_drive(&remove_normalized));
    if !remove.is_empty() {
        if parts.starts_with(&remove) {
            parts.drain(..remove.len());
        } else if let Some(position) = parts
            .windows(remove.len())
            .position(|window| window == remove.as_slice())
        {
            parts.drain(..position + remove.len());
        }
    }
    let subfolder = settings.destination_subfolder.replace('\\', "/");
    let mut joined = components(&subfolder);
    joined.extend(parts);
    joined.join("/")
}
