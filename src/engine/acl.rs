//! Role-based path access control.
//!
//! A role may write a path only if one of its configured prefixes is a
//! prefix of the normalised path. Roles without prefixes are denied
//! everything.

use std::collections::HashMap;

use super::models::Role;
use crate::errors::SliceError;

#[derive(Debug, Clone, Default)]
pub struct PathAcl {
    prefixes: HashMap<Role, Vec<String>>,
}

impl PathAcl {
    pub fn new(prefixes: HashMap<Role, Vec<String>>) -> Self {
        let prefixes = prefixes
            .into_iter()
            .map(|(role, list)| (role, list.iter().map(|p| normalize_prefix(p)).collect()))
            .collect();
        Self { prefixes }
    }

    pub fn prefixes(&self, role: Role) -> &[String] {
        self.prefixes.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_allowed(&self, role: Role, path: &str) -> bool {
        let Some(path) = normalize_path(path) else {
            return false;
        };
        self.prefixes(role)
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// `Ok(())` if allowed, otherwise `PathAccessDenied` naming `path`.
    pub fn check(&self, role: Role, path: &str) -> Result<(), SliceError> {
        if self.is_allowed(role, path) {
            Ok(())
        } else {
            Err(SliceError::PathAccessDenied {
                role: role.as_str().to_string(),
                path: path.to_string(),
            })
        }
    }

    /// Validate every path; the first violation is returned.
    pub fn check_all<'a, I>(&self, role: Role, paths: I) -> Result<(), SliceError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        paths
            .into_iter()
            .try_for_each(|path| self.check(role, path))
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let prefix = prefix.replace('\\', "/");
    prefix.trim_start_matches("./").to_string()
}

/// Normalise a repository-relative path. `None` for absolute paths or
/// anything containing a `..` segment.
pub fn normalize_path(path: &str) -> Option<String> {
    let path = path.replace('\\', "/");
    let mut path = path.as_str();
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    if path.is_empty() || path.starts_with('/') || path.contains(':') {
        return None;
    }
    if path.split('/').any(|segment| segment == "..") {
        return None;
    }
    Some(path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acl() -> PathAcl {
        let mut map = HashMap::new();
        map.insert(Role::Dev, vec!["src/".to_string(), "tests/unit/".to_string()]);
        map.insert(Role::Pm, vec!["docs/".to_string(), "tasks/".to_string()]);
        map.insert(Role::Qa, vec![]);
        PathAcl::new(map)
    }

    #[test]
    fn allows_paths_under_a_prefix() {
        let acl = acl();
        assert!(acl.is_allowed(Role::Dev, "src/app.py"));
        assert!(acl.is_allowed(Role::Dev, "tests/unit/test_app.py"));
        assert!(acl.is_allowed(Role::Pm, "docs/PRD.md"));
    }

    #[test]
    fn denies_paths_outside_prefixes() {
        let acl = acl();
        assert!(!acl.is_allowed(Role::Dev, "docs/x.md"));
        assert!(!acl.is_allowed(Role::Dev, "tests/integration/a.py"));
        assert!(!acl.is_allowed(Role::Pm, "src/app.py"));
    }

    #[test]
    fn deny_by_default_for_empty_and_missing_roles() {
        let acl = acl();
        assert!(!acl.is_allowed(Role::Qa, "tests/a.py"));
        assert!(!acl.is_allowed(Role::Ops, "docs/RUNBOOK.md"));
    }

    #[test]
    fn normalises_separators_and_dot_prefix() {
        let acl = acl();
        assert!(acl.is_allowed(Role::Dev, "src\\app.py"));
        assert!(acl.is_allowed(Role::Dev, "./src/app.py"));
    }

    #[test]
    fn rejects_traversal_and_absolute_paths() {
        let acl = acl();
        assert!(!acl.is_allowed(Role::Dev, "src/../docs/x.md"));
        assert!(!acl.is_allowed(Role::Dev, "/src/app.py"));
        assert!(!acl.is_allowed(Role::Dev, "C:/src/app.py"));
    }

    #[test]
    fn prefix_match_is_textual() {
        // "src/" does not cover "srcx/", but a prefix without slash would.
        let mut map = HashMap::new();
        map.insert(Role::Ops, vec!["reports".to_string()]);
        let acl = PathAcl::new(map);
        assert!(acl.is_allowed(Role::Ops, "reports_old/a.md"));
        assert!(!self::acl().is_allowed(Role::Dev, "srcx/a.rs"));
    }

    #[test]
    fn check_all_names_first_offending_path() {
        let acl = acl();
        let err = acl
            .check_all(Role::Dev, ["src/app.py", "docs/x.md", "docs/y.md"])
            .unwrap_err();
        match err {
            SliceError::PathAccessDenied { role, path } => {
                assert_eq!(role, "dev");
                assert_eq!(path, "docs/x.md");
            }
            other => panic!("Expected PathAccessDenied, got {:?}", other),
        }
    }

    #[test]
    fn exhaustive_iff_property_over_sample_grid() {
        let acl = acl();
        let paths = ["src/a", "docs/b", "tasks/c", "tests/unit/d", "tests/e", "README.md"];
        for role in Role::ALL {
            for path in paths {
                let expected = acl.prefixes(role).iter().any(|p| path.starts_with(p.as_str()));
                assert_eq!(acl.check(role, path).is_ok(), expected, "{role} {path}");
            }
        }
    }
}
