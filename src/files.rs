use std::path::{Component, Path};
use std::sync::Arc;

use tracing::debug;

use crate::errors::{SandboxError, SandboxResult};
use crate::executor::{argv, CommandExecutor};
use crate::models::SandboxKey;

const WRITE_FILE: &str = r#"mkdir -p "$(dirname "$1")" && cat > "$1""#;

/// Checks that `path` stays inside the project directory and returns it without a leading `./`.
pub fn validate_path(path: &str) -> SandboxResult<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(SandboxError::InvalidRequest("path must not be empty".into()));
    }
    if trimmed.contains('\0') {
        return Err(SandboxError::Forbidden(format!("{path:?} is not a valid path")));
    }

    let mut parts = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::Forbidden(format!(
                    "{path:?} points outside the project"
                )))
            }
        }
    }
    if parts.is_empty() {
        return Err(SandboxError::InvalidRequest(format!("{path:?} names no file")));
    }
    Ok(parts.join("/"))
}

/// File access inside a project's working directory.
pub struct ProjectFiles {
    executor: Arc<CommandExecutor>,
}

impl ProjectFiles {
    pub fn new(executor: Arc<CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Every regular file in the project, skipping dot-files and dot-directories.
    pub async fn list(&self, key: &SandboxKey) -> SandboxResult<Vec<String>> {
        let output = self
            .executor
            .run(
                key,
                &argv(["find", ".", "-type", "f", "-not", "-path", "*/.*"]),
                None,
                &[],
            )
            .await?;
        let mut paths: Vec<String> = output
            .stdout
            .lines()
            .map(|line| line.trim().trim_start_matches("./").to_string())
            .filter(|line| !line.is_empty())
            .collect();
        paths.sort();
        Ok(paths)
    }

    pub async fn exists(&self, key: &SandboxKey, path: &str) -> SandboxResult<bool> {
        let path = validate_path(path)?;
        self.executor
            .probe(key, &argv(["test", "-f", path.as_str()]))
            .await
    }

    pub async fn read(&self, key: &SandboxKey, path: &str) -> SandboxResult<String> {
        let path = validate_path(path)?;
        match self
            .executor
            .run_raw(key, &argv(["cat", "--", path.as_str()]), None, &[])
            .await
        {
            Ok(output) => Ok(output.stdout),
            Err(SandboxError::CommandFailed { stderr, .. })
                if stderr.contains("No such file") =>
            {
                Err(SandboxError::NotFound(format!("file {path}")))
            }
            Err(error) => Err(error),
        }
    }

    /// Writes `content` through stdin, creating parent directories as needed.
    pub async fn write(&self, key: &SandboxKey, path: &str, content: &str) -> SandboxResult<()> {
        let path = validate_path(path)?;
        self.executor
            .run(
                key,
                &argv(["sh", "-c", WRITE_FILE, "sh", path.as_str()]),
                Some(content.as_bytes()),
                &[],
            )
            .await?;
        debug!("wrote {} bytes to {path} for {key}", content.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_relative_paths() {
        assert_eq!(validate_path("main.tex").unwrap(), "main.tex");
        assert_eq!(validate_path("./chapters/intro.tex").unwrap(), "chapters/intro.tex");
        assert_eq!(validate_path("figures//plot.pdf").unwrap(), "figures/plot.pdf");
    }

    #[test]
    fn rejects_escaping_paths() {
        for path in ["../secret", "/etc/passwd", "chapters/../../x", "a\0b"] {
            assert!(
                matches!(validate_path(path), Err(SandboxError::Forbidden(_))),
                "{path:?} should be forbidden"
            );
        }
        assert!(matches!(
            validate_path("  "),
            Err(SandboxError::InvalidRequest(_))
        ));
        assert!(matches!(
            validate_path("."),
            Err(SandboxError::InvalidRequest(_))
        ));
    }
}
