//! Finding executables and turning them into descriptors.

use crate::command::Command;
use crate::error::{Error, Result};
use std::borrow::Cow;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Descriptor for the executable called `name`.
///
/// The name is resolved against `PATH` the way a shell would. If nothing is
/// found and the name contains underscores, the hyphenated spelling is
/// tried as well, so `lookup("apt_get")` finds `apt-get`.
pub fn lookup(name: &str) -> Result<Command> {
    lookup_in(&std::env::var_os("PATH").unwrap_or_default(), name)
}

fn lookup_in(search_paths: &OsStr, name: &str) -> Result<Command> {
    let hyphenated = name.replace('_', "-");
    let candidates = std::iter::once(name).chain((hyphenated != name).then_some(hyphenated.as_str()));
    for candidate in candidates {
        if find_command_path(search_paths, Path::new(candidate)).is_some() {
            tracing::trace!(name, resolved = candidate, "found executable");
            return Ok(Command::new(candidate));
        }
    }
    Err(Error::NotFound(name.to_string()))
}

/// Resolve a command path the way a typical shell would.
///
/// Behavior:
/// - Absolute path: returns it if it exists.
/// - Relative with multiple components (e.g., `bin/sh`): returns it if it exists.
/// - `./foo` on Unix or any `./`-prefixed path on other platforms: returns it if it exists.
/// - Single path component (no separators): search each directory in `search_paths` (PATH)
///   and return the first existing match.
/// - Empty path: returns `None`.
pub fn find_command_path<'a>(search_paths: &OsStr, path: &'a Path) -> Option<Cow<'a, Path>> {
    if path.is_absolute() {
        return find_by_path(path).map(Cow::Borrowed);
    }

    let search_in_current_dir = cfg!(not(unix)) || path.starts_with("./");
    if search_in_current_dir && path.exists() {
        return Some(Cow::Borrowed(path));
    }

    let mut components = path.components();
    match (components.next(), components.next()) {
        (None, None) => None,
        (Some(x), None) => find_in_path(search_paths, x.as_os_str()).map(Cow::Owned),
        _ => find_by_path(path).map(Cow::Borrowed),
    }
}

fn find_in_path(search_paths: &OsStr, cmd: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(search_paths)
        .map(|dir| dir.join(cmd))
        .find(|path| find_by_path(path).is_some())
}

fn find_by_path(path: &Path) -> Option<&Path> {
    if is_executable(path) { Some(path) } else { None }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::tests::lock_current_dir;
    use std::fs::{self, File};

    #[cfg(unix)]
    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        File::create(path).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    #[cfg(unix)]
    fn absolute_existing_true() {
        let path = Path::new("/bin/sh");
        let found = find_command_path(OsStr::new("/bin"), path).expect("Expected to find /bin/sh via absolute path");
        assert_eq!(found.as_ref(), path);
    }

    #[test]
    #[cfg(unix)]
    fn absolute_nonexisting() {
        let res = find_command_path(OsStr::new("/bin"), Path::new("/bin/nonexisting"));
        assert!(res.is_none(), "Expected not to find /bin/nonexisting via absolute path");
    }

    #[test]
    #[cfg(unix)]
    fn single_component_found_in_path() {
        let found = find_command_path(OsStr::new("/bin"), Path::new("sh"))
            .expect("Expected to find 'sh' in /bin via PATH search");
        assert!(found.as_ref().ends_with("sh"));
        assert!(found.as_ref().starts_with("/bin"), "Expected path in /bin, got {:?}", found);
    }

    #[test]
    #[cfg(unix)]
    fn plain_files_are_not_commands() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("data")).unwrap();
        let res = find_command_path(dir.path().as_os_str(), Path::new("data"));
        assert!(res.is_none());
    }

    #[test]
    #[cfg(unix)]
    fn multiple_components_relative_existing() {
        let _lock = lock_current_dir();
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("bin")).unwrap();
        make_executable(&tmp.path().join("bin").join("sh"));

        let cwd_before = std::env::current_dir().unwrap();
        std::env::set_current_dir(tmp.path()).unwrap();
        let res = find_command_path(OsStr::new("/does/not/matter"), Path::new("bin/sh")).map(Cow::into_owned);
        std::env::set_current_dir(&cwd_before).ok();

        assert!(res.expect("Expected to find relative 'bin/sh'").ends_with("bin/sh"));
    }

    #[test]
    #[cfg(unix)]
    fn current_dir_with_dot_prefix() {
        let _lock = lock_current_dir();
        let tmp = tempfile::tempdir().unwrap();
        make_executable(&tmp.path().join("foo"));

        let cwd_before = std::env::current_dir().unwrap();
        std::env::set_current_dir(tmp.path()).unwrap();
        let res = find_command_path(OsStr::new("/bin"), Path::new("./foo")).map(Cow::into_owned);
        std::env::set_current_dir(&cwd_before).ok();

        assert_eq!(res.expect("Expected to find './foo'"), Path::new("./foo"));
    }

    #[test]
    fn empty_path_is_none() {
        assert!(find_command_path(OsStr::new("/bin"), Path::new("")).is_none());
    }

    #[test]
    fn lookup_finds_commands() {
        let echo = lookup("echo").unwrap();
        assert_eq!(echo.argv(), vec!["echo"]);
        assert_eq!(echo.arg("hi").to_string(), "hi\n");
        assert!(matches!(lookup("no_such_command_here"), Err(Error::NotFound(_))));
    }

    #[test]
    #[cfg(unix)]
    fn lookup_falls_back_to_hyphens() {
        let dir = tempfile::tempdir().unwrap();
        make_executable(&dir.path().join("my-tool"));
        let tool = lookup_in(dir.path().as_os_str(), "my_tool").unwrap();
        assert_eq!(tool.argv(), vec!["my-tool"]);
        assert!(lookup_in(dir.path().as_os_str(), "other_tool").is_err());
    }
}
