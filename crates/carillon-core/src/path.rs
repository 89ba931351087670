//! Path normalization for VFS lookups.

/// Whether `c` separates path components on this platform.
const fn is_separator(c: char) -> bool {
    c == '/' || (cfg!(windows) && c == '\\')
}

/// Normalize a VFS path.
///
/// Collapses repeated separators and `.` components, and folds `..` into the
/// preceding component where there is one. Leading `..` components that
/// cannot be resolved are kept. Separators are emitted as `/`.
pub fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with(is_separator);
    let mut components: Vec<&str> = Vec::new();

    for component in path.split(is_separator) {
        match component {
            "" | "." => {}
            ".." => match components.last() {
                Some(&last) if last != ".." => {
                    components.pop();
                }
                _ if absolute => {}
                _ => components.push(".."),
            },
            other => components.push(other),
        }
    }

    let joined = components.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}
