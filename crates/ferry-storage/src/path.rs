use std::collections::BTreeMap;

use ferry_types::{StorageError, StorageResult};

/// Resolves a symbolic path prefix such as `<REPO:BACKUP>` to a concrete
/// path relative to the storage root.
///
/// `rest` is whatever followed the expression, without its leading `/`.
pub trait PathExpression: Send + Sync + std::fmt::Debug {
    fn resolve(&self, expression: &str, rest: Option<&str>) -> StorageResult<String>;
}

/// Fixed table of expressions, each mapped to a relative path.
#[derive(Clone, Debug, Default)]
pub struct ExpressionMap {
    entries: BTreeMap<String, String>,
}

impl ExpressionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, expression: impl Into<String>, path: impl Into<String>) -> Self {
        self.entries.insert(expression.into(), path.into());
        self
    }
}

impl PathExpression for ExpressionMap {
    fn resolve(&self, expression: &str, rest: Option<&str>) -> StorageResult<String> {
        let base = self.entries.get(expression).ok_or_else(|| {
            StorageError::PathValidation(format!("invalid expression '{expression}'"))
        })?;
        Ok(match rest {
            Some(rest) if base.is_empty() => rest.to_string(),
            Some(rest) => format!("{base}/{rest}"),
            None => base.clone(),
        })
    }
}

/// Split `<EXPR>/rest` into the expression and the remainder.
fn split_expression(path: &str) -> StorageResult<(&str, Option<&str>)> {
    let end = path.find('>').ok_or_else(|| {
        StorageError::PathValidation(format!("end > not found in path expression '{path}'"))
    })?;
    let (expression, tail) = path.split_at(end + 1);
    match tail {
        "" => Ok((expression, None)),
        _ => match tail.strip_prefix('/') {
            Some(rest) if !rest.is_empty() => Ok((expression, Some(rest))),
            _ => Err(StorageError::PathValidation(format!(
                "'/' should separate expression and path '{path}'"
            ))),
        },
    }
}

/// Reject paths with repeated or trailing separators and `.`/`..` components.
pub fn validate(path: &str) -> StorageResult<()> {
    if path.contains("//") {
        return Err(StorageError::PathValidation(format!(
            "path '{path}' cannot contain //"
        )));
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err(StorageError::PathValidation(format!(
            "path '{path}' cannot end with /"
        )));
    }
    if path.split('/').any(|part| part == "." || part == "..") {
        return Err(StorageError::PathValidation(format!(
            "path '{path}' cannot contain . or .. components"
        )));
    }
    Ok(())
}

/// True when absolute `path` is `root` or lies below it.
pub fn within_root(root: &str, path: &str) -> bool {
    if root == "/" {
        return path.starts_with('/');
    }
    path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Resolve a caller path against `root`: expand an expression, validate, and
/// confine the result to the root.
pub fn resolve(
    root: &str,
    path: &str,
    expression: Option<&dyn PathExpression>,
) -> StorageResult<String> {
    let expanded;
    let path = if path.starts_with('<') {
        let (expr, rest) = split_expression(path)?;
        let resolver = expression.ok_or_else(|| {
            StorageError::PathValidation(format!(
                "expression '{expr}' not valid without a path expression resolver"
            ))
        })?;
        expanded = resolver.resolve(expr, rest)?;
        expanded.as_str()
    } else {
        path
    };

    validate(path)?;

    if path.starts_with('/') {
        if !within_root(root, path) {
            return Err(StorageError::PathValidation(format!(
                "absolute path '{path}' is not in base path '{root}'"
            )));
        }
        return Ok(path.to_string());
    }
    Ok(join(root, path))
}

/// Join a relative path onto an absolute base.
pub fn join(base: &str, relative: &str) -> String {
    match (base, relative) {
        (_, "") => base.to_string(),
        ("/", _) => format!("/{relative}"),
        _ => format!("{base}/{relative}"),
    }
}

/// Parent of an absolute path, `None` for the filesystem root.
pub fn parent(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(index) => Some(&path[..index]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_types::ErrorKind;
    use proptest::prelude::*;

    fn kind(result: StorageResult<String>) -> ErrorKind {
        result.unwrap_err().kind()
    }

    #[test]
    fn relative_paths_join_root() {
        assert_eq!(resolve("/repo", "backup/db", None).unwrap(), "/repo/backup/db");
        assert_eq!(resolve("/repo", "", None).unwrap(), "/repo");
        assert_eq!(resolve("/", "tmp", None).unwrap(), "/tmp");
        assert_eq!(resolve("/repo", "/repo/a", None).unwrap(), "/repo/a");
        assert_eq!(resolve("/repo", "/repo", None).unwrap(), "/repo");
    }

    #[test]
    fn malformed_paths_rejected() {
        assert_eq!(kind(resolve("/repo", "a//b", None)), ErrorKind::PathValidation);
        assert_eq!(kind(resolve("/repo", "a/b/", None)), ErrorKind::PathValidation);
        assert_eq!(kind(resolve("/repo", "a/../../etc", None)), ErrorKind::PathValidation);
        assert_eq!(kind(resolve("/repo", "/etc/passwd", None)), ErrorKind::PathValidation);
        assert_eq!(kind(resolve("/repo", "/repository", None)), ErrorKind::PathValidation);
    }

    #[test]
    fn expressions_resolve_before_validation() {
        let map = ExpressionMap::new()
            .with("<REPO:BACKUP>", "backup/main")
            .with("<REPO>", "");
        assert_eq!(
            resolve("/repo", "<REPO:BACKUP>/20240101F", Some(&map)).unwrap(),
            "/repo/backup/main/20240101F"
        );
        assert_eq!(resolve("/repo", "<REPO:BACKUP>", Some(&map)).unwrap(), "/repo/backup/main");
        assert_eq!(resolve("/repo", "<REPO>/x", Some(&map)).unwrap(), "/repo/x");
        assert_eq!(kind(resolve("/repo", "<REPO:ARCHIVE>", Some(&map))), ErrorKind::PathValidation);
        assert_eq!(kind(resolve("/repo", "<REPO:BACKUP>x", Some(&map))), ErrorKind::PathValidation);
        assert_eq!(kind(resolve("/repo", "<REPO:BACKUP", Some(&map))), ErrorKind::PathValidation);
        assert_eq!(kind(resolve("/repo", "<REPO:BACKUP>", None)), ErrorKind::PathValidation);
    }

    #[test]
    fn parents() {
        assert_eq!(parent("/repo/a/b"), Some("/repo/a"));
        assert_eq!(parent("/repo"), Some("/"));
        assert_eq!(parent("/"), None);
    }

    proptest! {
        #[test]
        fn resolved_paths_stay_in_root(parts in proptest::collection::vec("[a-z0-9._-]{1,8}", 0..5)) {
            let path = parts.join("/");
            if let Ok(resolved) = resolve("/repo", &path, None) {
                prop_assert!(within_root("/repo", &resolved));
                prop_assert!(!resolved.contains("//"));
            }
        }
    }
}
