//! External hook protocols: the pre-build hook that grants extra sandbox
//! paths, and the diff hook invoked on check-mode divergence.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use slog_scope::{debug, error};

use super::ChrootPath;
use crate::prelude::*;
use crate::store::build::error::ExecError;

#[derive(Copy, Clone, PartialEq, Eq)]
enum HookState {
  Begin,
  ExtraChrootDirs,
}

/// Parse the pre-build hook's stdout. In the initial state only the
/// `extra-sandbox-paths` / `extra-chroot-dirs` commands are understood; in
/// that mode, `target=source` lines (or bare `target` lines) accumulate
/// chroot entries until a blank line.
pub fn parse_pre_build_hook_output(output: &str) -> Result<BTreeMap<PathBuf, ChrootPath>> {
  let mut state = HookState::Begin;
  let mut dirs = BTreeMap::new();

  for line in output.lines() {
    match state {
      HookState::Begin => {
        if line == "extra-sandbox-paths" || line == "extra-chroot-dirs" {
          state = HookState::ExtraChrootDirs;
        } else {
          bail!("unknown pre-build hook command '{}'", line);
        }
      }
      HookState::ExtraChrootDirs => {
        if line.is_empty() {
          state = HookState::Begin;
        } else {
          let (target, source) = match break_str(line, '=') {
            Some((t, s)) => (t, s),
            None => (line, line),
          };
          dirs.insert(
            PathBuf::from(target),
            ChrootPath {
              path: PathBuf::from(source),
              optional: false,
            },
          );
        }
      }
    }
  }

  Ok(dirs)
}

/// Run the pre-build hook, if configured, and return the sandbox paths it
/// grants. The hook receives the derivation path and, when sandboxing, the
/// chroot root.
pub fn run_pre_build_hook(
  hook: &Path,
  drv_path: &str,
  chroot_root: Option<&Path>,
) -> Result<BTreeMap<PathBuf, ChrootPath>> {
  debug!("executing pre-build hook '{}'", hook.display());

  let mut cmd = Command::new(hook);
  cmd.arg(drv_path);
  if let Some(root) = chroot_root {
    cmd.arg(root);
  }

  let out = cmd
    .output()
    .with_context(|| format!("while running pre-build hook '{}'", hook.display()))?;
  if !out.status.success() {
    return Err(
      ExecError {
        program: hook.display().to_string(),
        status: out.status.code().unwrap_or(-1),
      }
      .into(),
    );
  }

  parse_pre_build_hook_output(&String::from_utf8_lossy(&out.stdout))
}

/// Invoke the diff hook on a determinism mismatch. A failing diff hook is
/// reported but never aborts the check.
pub fn run_diff_hook(hook: &Path, path_a: &Path, path_b: &Path, drv_path: &str, tmp_dir: &Path) {
  let res = Command::new(hook)
    .arg(path_a)
    .arg(path_b)
    .arg(drv_path)
    .arg(tmp_dir)
    .current_dir("/")
    .output();

  match res {
    Ok(out) => {
      if !out.stdout.is_empty() {
        error!("{}", String::from_utf8_lossy(&out.stdout).trim_end());
      }
      if !out.status.success() {
        error!(
          "diff hook '{}' exited with status {}",
          hook.display(),
          out.status.code().unwrap_or(-1)
        );
      }
    }
    Err(e) => error!("diff hook execution failed: {}", e),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_extra_paths() {
    let out = "extra-sandbox-paths\n/foo=/bar\n/baz\n\nextra-chroot-dirs\n/qux=/quux\n";
    let dirs = parse_pre_build_hook_output(out).unwrap();
    assert_eq!(dirs.len(), 3);
    assert_eq!(dirs[Path::new("/foo")].path, PathBuf::from("/bar"));
    assert_eq!(dirs[Path::new("/baz")].path, PathBuf::from("/baz"));
    assert_eq!(dirs[Path::new("/qux")].path, PathBuf::from("/quux"));
  }

  #[test]
  fn rejects_unknown_commands() {
    assert!(parse_pre_build_hook_output("frobnicate\n").is_err());
  }

  #[test]
  fn blank_line_resets_state() {
    // a path line after the blank must be treated as a command again
    assert!(parse_pre_build_hook_output("extra-sandbox-paths\n\n/foo\n").is_err());
  }
}
