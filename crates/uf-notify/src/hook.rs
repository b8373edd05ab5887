use std::path::{Path, PathBuf};

/// Called by the filesystem dispatch layer at each mutation's commit point.
///
/// Implementations append to queues and return; they never wait on
/// consumers.
pub trait MutationHook: Send + Sync {
    fn created(&self, path: &Path);
    fn modified(&self, path: &Path);
    fn deleted(&self, path: &Path);
    fn accessed(&self, path: &Path);
    fn renamed(&self, from: &Path, to: &Path);
}

/// Watch keys a mutation of `path` is delivered to, paired with the name
/// reported to each: the path itself, then its directory. Both report the
/// basename.
pub(crate) fn watch_keys(path: &Path) -> Vec<(PathBuf, String)> {
    let Some(name) = path.file_name() else {
        return vec![(path.to_path_buf(), String::new())];
    };
    let name = name.to_string_lossy().into_owned();
    let mut keys = vec![(path.to_path_buf(), name.clone())];
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        keys.push((parent.to_path_buf(), name));
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_cover_file_and_directory() {
        let keys = watch_keys(Path::new("/tmp/dir/a.txt"));
        assert_eq!(
            keys,
            vec![
                (PathBuf::from("/tmp/dir/a.txt"), "a.txt".to_owned()),
                (PathBuf::from("/tmp/dir"), "a.txt".to_owned()),
            ]
        );
    }

    #[test]
    fn root_has_no_parent_key() {
        assert_eq!(
            watch_keys(Path::new("/")),
            vec![(PathBuf::from("/"), String::new())]
        );
    }
}
