//! Canonical file-path keys for lock comparison.
//!
//! Pure string manipulation (no filesystem I/O), so a Windows-style path and a
//! POSIX path are handled the same way on every host:
//! - separators are unified to `/`
//! - `.` and `..` segments are resolved
//! - relative paths are rooted at the task's project path
//! - the result is case-folded

/// Normalize `raw_path` into the canonical key used by the lock table.
///
/// Absolute inputs normalize independently of `project_path`, so two projects
/// referencing the same absolute file collide. Relative inputs are resolved
/// against `project_path` first, so the same relative path in two projects
/// stays distinct.
pub fn normalize_path(raw_path: &str, project_path: &str) -> String {
    let raw = to_forward_slashes(raw_path.trim());

    let joined = if is_absolute(&raw) || project_path.trim().is_empty() {
        raw
    } else {
        let project = to_forward_slashes(project_path.trim());
        format!("{}/{}", project.trim_end_matches('/'), raw)
    };

    normalize_components(&joined).to_lowercase()
}

/// Whether the path is rooted (`/x`, `//server/share`, `C:/x`, `C:`).
pub fn is_absolute(path: &str) -> bool {
    let path = to_forward_slashes(path);
    if path.starts_with('/') {
        return true;
    }
    drive_prefix(&path).is_some()
}

/// `Some("c:")`-style prefix when the path starts with a drive letter.
fn drive_prefix(path: &str) -> Option<&str> {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        Some(&path[..2])
    } else {
        None
    }
}

/// Resolve `.` and `..` segments and collapse repeated separators.
fn normalize_components(path: &str) -> String {
    let (prefix, rest) = match drive_prefix(path) {
        Some(drive) => (drive.to_string(), &path[2..]),
        None => (String::new(), path),
    };
    let rooted = rest.starts_with('/') || !prefix.is_empty();
    let unc = prefix.is_empty() && rest.starts_with("//");

    let mut components: Vec<&str> = Vec::new();
    for segment in rest.split('/') {
        match segment {
            "" | "." => {
                // Skip empty (repeated separator) and current-directory segments
            }
            ".." => {
                // Go up one directory if possible
                if matches!(components.last(), Some(last) if *last != "..") {
                    components.pop();
                } else if !rooted {
                    // Relative path climbing above its start keeps the `..`
                    components.push("..");
                }
            }
            name => components.push(name),
        }
    }

    let body = components.join("/");
    if unc {
        format!("//{}", body)
    } else if rooted {
        format!("{}/{}", prefix, body)
    } else {
        body
    }
}

fn to_forward_slashes(path: &str) -> String {
    path.replace('\\', "/")
}
