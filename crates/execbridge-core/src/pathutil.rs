//! Path and environment-variable helpers.
//!
//! Used to resolve user-supplied paths such as `~/bin/${TOOL}` or
//! `${EXEPATH}/settings.json` before they reach the filesystem.

use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use crate::error::{Error, Result};

#[allow(clippy::expect_used)]
static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("static regex is valid"));

/// Pseudo-variable expanding to the directory of the running executable.
const EXEPATH_VAR: &str = "EXEPATH";

/// Whether `path` exists. Errors other than "not found" (e.g. permission
/// denied on a parent) count as existing.
pub fn exists(path: impl AsRef<Path>) -> bool {
    match std::fs::metadata(path) {
        Ok(_) => true,
        Err(e) => e.kind() != std::io::ErrorKind::NotFound,
    }
}

/// Whether `path` is an existing directory.
pub fn is_dir(path: impl AsRef<Path>) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_dir())
}

/// The current user's home directory.
pub fn user_home() -> Option<PathBuf> {
    dirs::home_dir()
        .filter(|h| !h.as_os_str().is_empty())
        .or_else(|| {
            ["HOME", "HomePath"]
                .iter()
                .filter_map(|k| std::env::var(k).ok())
                .find(|v| !v.is_empty())
                .map(PathBuf::from)
        })
}

/// Resolve `~/` and `${VAR}` references in `s` and clean the result.
///
/// `${EXEPATH}` expands to the directory of the current executable. An
/// undefined (or empty) variable is an error, except `HOME` on Windows which
/// falls back to the user profile directory.
pub fn resolve_env_vars(s: &str) -> Result<PathBuf> {
    resolve_with(s, |name| std::env::var(name).ok())
}

fn resolve_with<F>(s: &str, lookup: F) -> Result<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if s.is_empty() {
        return Ok(PathBuf::new());
    }

    let mut res = match (s.strip_prefix("~/"), user_home()) {
        (Some(rest), Some(home)) => home.join(rest).to_string_lossy().into_owned(),
        _ => s.to_string(),
    };

    let names: Vec<String> = ENV_VAR_RE
        .captures_iter(&res)
        .map(|c| c[1].to_string())
        .collect();
    for name in names {
        let value = if name == EXEPATH_VAR {
            exe_dir()?
        } else {
            match lookup(&name).filter(|v| !v.is_empty()) {
                Some(v) => v,
                None if cfg!(windows) && name == "HOME" => user_home()
                    .map(|h| h.to_string_lossy().into_owned())
                    .ok_or_else(|| Error::UndefinedEnvVar(name.clone()))?,
                None => return Err(Error::UndefinedEnvVar(name)),
            }
        };
        res = res.replace(&format!("${{{name}}}"), &value);
    }

    Ok(clean(Path::new(&res)))
}

fn exe_dir() -> Result<String> {
    let exe = std::env::current_exe()?;
    let resolved = std::fs::canonicalize(&exe).unwrap_or(exe);
    Ok(resolved
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default())
}

/// Normalize a Linux- or Windows-style path for use on a `/`-separated host.
///
/// A drive prefix such as `C:` becomes `C/` and backslashes become slashes.
/// On hosts using another separator the input is returned unchanged.
pub fn normalize_path(p: &str) -> PathBuf {
    if std::path::MAIN_SEPARATOR != '/' {
        return PathBuf::from(p);
    }
    let mut res = p.to_string();
    if p.len() >= 2 && p.as_bytes()[1] == b':' {
        res = format!("{}/{}", &p[..1], &p[2..]);
    }
    clean(Path::new(&res.replace('\\', "/")))
}

/// Lexically clean a path: drop `.` components and fold `..` into the
/// preceding component where possible.
pub fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn vars(name: &str) -> Option<String> {
        match name {
            "TOOLS" => Some("/opt/tools".to_string()),
            "EMPTY" => Some(String::new()),
            _ => None,
        }
    }

    #[test]
    fn clean_folds_dots() {
        assert_eq!(clean(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(clean(Path::new("a/../../b")), PathBuf::from("../b"));
        assert_eq!(clean(Path::new("/../x")), PathBuf::from("/x"));
        assert_eq!(clean(Path::new("./")), PathBuf::from("."));
    }

    #[test]
    fn resolves_braced_variables() {
        let p = resolve_with("${TOOLS}/bin/../sbin", vars).unwrap();
        assert_eq!(p, PathBuf::from("/opt/tools/sbin"));
    }

    #[test]
    fn undefined_variable_is_an_error() {
        let err = resolve_with("${NOPE}/x", vars).unwrap_err();
        assert!(matches!(err, Error::UndefinedEnvVar(ref n) if n == "NOPE"));
    }

    #[cfg(unix)]
    #[test]
    fn empty_variable_counts_as_undefined() {
        assert!(resolve_with("${EMPTY}/x", vars).is_err());
    }

    #[test]
    fn empty_input_resolves_to_empty_path() {
        assert_eq!(resolve_with("", vars).unwrap(), PathBuf::new());
    }

    #[test]
    fn exepath_resolves_to_existing_directory() {
        let p = resolve_with("${EXEPATH}", vars).unwrap();
        assert!(is_dir(&p), "{} should be a directory", p.display());
    }

    #[test]
    fn tilde_expands_to_home() {
        let Some(home) = user_home() else { return };
        let p = resolve_with("~/projects", vars).unwrap();
        assert_eq!(p, clean(&home.join("projects")));
    }

    #[cfg(unix)]
    #[test]
    fn normalize_windows_style_path() {
        assert_eq!(
            normalize_path(r"C:\Users\dev\.\src"),
            PathBuf::from("C/Users/dev/src")
        );
        assert_eq!(normalize_path("/already/unix"), PathBuf::from("/already/unix"));
    }

    #[test]
    fn exists_and_is_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, "x").unwrap();

        assert!(exists(dir.path()));
        assert!(is_dir(dir.path()));
        assert!(exists(&file));
        assert!(!is_dir(&file));
        assert!(!exists(dir.path().join("missing")));
    }
}
