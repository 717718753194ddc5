// ── Path helpers ─────────────────────────────────────────────────────────────
//
// Remote paths are plain `/`-separated strings and never go through
// `std::path`. Local paths are native `PathBuf`s.

use std::path::{Path, PathBuf};

/// Suffix of in-progress transfer targets.
pub const PART_SUFFIX: &str = ".part";

const APP_DIR: &str = "openscp";

/// Join a remote directory and a child name.
pub fn remote_join(dir: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if dir.is_empty() {
        return format!("/{}", name);
    }
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Parent of a remote path; the root is its own parent.
pub fn remote_parent(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
    }
}

/// Last component of a remote path.
pub fn remote_file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Collapse duplicate separators and `.` segments and resolve `..`
/// lexically. Relative input stays relative.
pub fn normalize_remote(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if parts.last().map_or(false, |p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            s => parts.push(s),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Remote `<path>.part` sibling.
pub fn remote_part_path(path: &str) -> String {
    format!("{}{}", path, PART_SUFFIX)
}

/// Local `<path>.part` sibling.
pub fn local_part_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(PART_SUFFIX);
    PathBuf::from(os)
}

/// Render a local path as a `/`-separated string, e.g. for display next to
/// remote paths or for mirroring a local tree onto the server.
pub fn local_to_remote_style(path: &Path) -> String {
    let s = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

/// Append a `/`-separated relative remote path to a local directory.
pub fn local_join_remote_relative(base: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .fold(base.to_path_buf(), |acc, seg| acc.join(seg))
}

/// `<config_dir>/openscp`, falling back to `~/.config/openscp`.
pub fn user_config_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Directory for audit logs and other runtime state.
pub fn user_state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("state")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_and_split() {
        assert_eq!(remote_join("/srv/data", "a.txt"), "/srv/data/a.txt");
        assert_eq!(remote_join("/srv/data/", "/a.txt"), "/srv/data/a.txt");
        assert_eq!(remote_join("", "a"), "/a");
        assert_eq!(remote_parent("/srv/data/a.txt"), "/srv/data");
        assert_eq!(remote_parent("/srv"), "/");
        assert_eq!(remote_parent("/"), "/");
        assert_eq!(remote_file_name("/srv/data/a.txt"), "a.txt");
        assert_eq!(remote_file_name("/srv/data/"), "data");
    }

    #[test]
    fn normalization() {
        assert_eq!(normalize_remote("/srv//data/./x/../y"), "/srv/data/y");
        assert_eq!(normalize_remote("/../.."), "/");
        assert_eq!(normalize_remote("a/../../b"), "../b");
        assert_eq!(normalize_remote("./"), ".");
    }

    #[test]
    fn part_suffixes() {
        assert_eq!(remote_part_path("/srv/x.bin"), "/srv/x.bin.part");
        assert_eq!(
            local_part_path(Path::new("/tmp/out.txt")),
            PathBuf::from("/tmp/out.txt.part")
        );
    }

    #[test]
    fn relative_remote_onto_local() {
        let base = Path::new("base");
        assert_eq!(
            local_join_remote_relative(base, "a/./b//c.txt"),
            base.join("a").join("b").join("c.txt")
        );
    }
}
