//! Command resolution for native steps.

use crate::engine::EngineError;
use crate::pipeline::Step;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable carrying an inline script body.
pub const SCRIPT_BODY_ENV: &str = "CI_SCRIPT";
/// Environment variable naming the file the script body is written to.
pub const SCRIPT_NAME_ENV: &str = "CI_SCRIPT_FILE";
/// Prefix of executables standing in for plugin images.
pub const PLUGIN_PREFIX: &str = "tool-";

const DEFAULT_SHELL: &str = "/bin/sh";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Plugin name of an image following `prefix/name[:tag]`.
pub(crate) fn plugin_name(image: &str) -> Option<&str> {
    let (_, rest) = image.rsplit_once('/')?;
    let name = match rest.split_once(':') {
        Some((name, _tag)) => name,
        None => rest,
    };
    (!name.is_empty()).then_some(name)
}

/// Look up an executable on a `PATH`-style search list.
pub(crate) fn lookup(program: &str, search_path: Option<&str>) -> Option<PathBuf> {
    if program.contains('/') {
        let p = PathBuf::from(program);
        return is_executable(&p).then_some(p);
    }
    let search = search_path
        .map(std::ffi::OsString::from)
        .or_else(|| std::env::var_os("PATH"))?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Write the step's inline script (if any) into `workdir`.
pub(crate) fn materialize_script(
    step: &Step,
    env: &BTreeMap<String, String>,
    workdir: &Path,
) -> Result<Option<PathBuf>, EngineError> {
    let (Some(body), Some(name)) = (env.get(SCRIPT_BODY_ENV), env.get(SCRIPT_NAME_ENV)) else {
        return Ok(None);
    };
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(EngineError::Backend(format!(
            "step {:?}: script file name {name:?} must be a plain file name",
            step.name
        )));
    }
    let path = workdir.join(name);
    std::fs::write(&path, body)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(Some(path))
}

/// Decide what to run: explicit entrypoint/command, then the plugin
/// convention, then the materialized script.
pub(crate) fn resolve(
    step: &Step,
    env: &BTreeMap<String, String>,
    script: Option<&Path>,
) -> Result<Invocation, EngineError> {
    let mut argv = step.entrypoint.iter().chain(step.command.iter());
    if let Some(first) = argv.next() {
        let program = lookup(first, env.get("PATH").map(String::as_str)).ok_or_else(|| {
            EngineError::CommandNotFound {
                step: step.name.clone(),
                command: first.clone(),
            }
        })?;
        return Ok(Invocation {
            program,
            args: argv.cloned().collect(),
        });
    }

    if let Some(plugin) = plugin_name(&step.image) {
        let tool = format!("{PLUGIN_PREFIX}{plugin}");
        let program = lookup(&tool, env.get("PATH").map(String::as_str)).ok_or_else(|| {
            EngineError::CommandNotFound {
                step: step.name.clone(),
                command: tool.clone(),
            }
        })?;
        return Ok(Invocation {
            program,
            args: Vec::new(),
        });
    }

    if let Some(script) = script {
        return Ok(Invocation {
            program: PathBuf::from(DEFAULT_SHELL),
            args: vec![script.to_string_lossy().into_owned()],
        });
    }

    Err(EngineError::CommandNotFound {
        step: step.name.clone(),
        command: step.image.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn plugin_names_follow_image_convention() {
        assert_eq!(plugin_name("plugins/s3"), Some("s3"));
        assert_eq!(plugin_name("plugins/slack:1.2"), Some("slack"));
        assert_eq!(plugin_name("registry.local/org/git:latest"), Some("git"));
        assert_eq!(plugin_name("alpine"), None);
        assert_eq!(plugin_name("alpine:3.19"), None);
    }

    #[cfg(unix)]
    #[test]
    fn resolves_plugin_tool_on_search_path() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let tool = dir.path().join("tool-s3");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let step = Step {
            name: "upload".into(),
            image: "plugins/s3:1".into(),
            ..Default::default()
        };
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), dir.path().display().to_string());

        let inv = resolve(&step, &env, None).unwrap();
        assert_eq!(inv.program, tool);
        assert!(inv.args.is_empty());
    }

    #[test]
    fn missing_plugin_tool_is_command_not_found() {
        let dir = TempDir::new().unwrap();
        let step = Step {
            name: "upload".into(),
            image: "plugins/nonexistent".into(),
            ..Default::default()
        };
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), dir.path().display().to_string());
        let err = resolve(&step, &env, None).unwrap_err();
        assert!(
            matches!(err, EngineError::CommandNotFound { ref command, .. } if command == "tool-nonexistent")
        );
    }

    #[cfg(unix)]
    #[test]
    fn explicit_command_wins_over_plugin() {
        let step = Step {
            name: "x".into(),
            image: "plugins/s3".into(),
            command: vec!["sh".into(), "-c".into(), "true".into()],
            ..Default::default()
        };
        let env = BTreeMap::new();
        let inv = resolve(&step, &env, None).unwrap();
        assert!(inv.program.ends_with("sh"));
        assert_eq!(inv.args, vec!["-c".to_string(), "true".to_string()]);
    }

    #[test]
    fn script_is_materialized_in_workdir() {
        let dir = TempDir::new().unwrap();
        let step = Step {
            name: "script".into(),
            ..Default::default()
        };
        let mut env = BTreeMap::new();
        env.insert(SCRIPT_BODY_ENV.to_string(), "echo hi\n".to_string());
        env.insert(SCRIPT_NAME_ENV.to_string(), "build.sh".to_string());

        let path = materialize_script(&step, &env, dir.path()).unwrap().unwrap();
        assert_eq!(path, dir.path().join("build.sh"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "echo hi\n");

        let inv = resolve(&step, &env, Some(&path)).unwrap();
        assert_eq!(inv.program, PathBuf::from("/bin/sh"));
        assert_eq!(inv.args, vec![path.display().to_string()]);
    }

    #[test]
    fn script_name_cannot_escape_workdir() {
        let dir = TempDir::new().unwrap();
        let step = Step::default();
        let mut env = BTreeMap::new();
        env.insert(SCRIPT_BODY_ENV.to_string(), "x".to_string());
        env.insert(SCRIPT_NAME_ENV.to_string(), "../evil.sh".to_string());
        assert!(materialize_script(&step, &env, dir.path()).is_err());
    }
}
