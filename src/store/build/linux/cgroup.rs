//! Cgroup (v2) handling: one cgroup per build, used both to contain the
//! builder's process tree and to harvest CPU accounting on teardown.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use slog_scope::debug;

use crate::prelude::*;

#[derive(Debug, Default, Clone, Copy)]
pub struct CgroupStats {
  pub cpu_user: Option<Duration>,
  pub cpu_system: Option<Duration>,
}

/// Where this process's cgroup lives in the unified hierarchy.
pub fn root_cgroup_path() -> Result<PathBuf> {
  let own = fs::read_to_string("/proc/self/cgroup")
    .context("cannot determine the cgroups file system")?;
  for line in own.lines() {
    // unified hierarchy entries look like `0::/user.slice/...`
    let mut fields = line.splitn(3, ':');
    if fields.next() == Some("0") && fields.next() == Some("") {
      let rel = fields.next().unwrap_or("/");
      let path = Path::new("/sys/fs/cgroup").join(rel.trim_start_matches('/'));
      ensure!(
        path.exists(),
        "expected cgroup directory '{}'",
        path.display()
      );
      return Ok(path);
    }
  }
  bail!("cannot determine this process's cgroup")
}

/// `cpu.stat` reports `usage_usec`, `user_usec` and `system_usec`, all in
/// microseconds on cgroup v2.
fn parse_cpu_stat(contents: &str) -> CgroupStats {
  let mut stats = CgroupStats::default();
  for line in contents.lines() {
    let mut fields = line.split_ascii_whitespace();
    match (fields.next(), fields.next().and_then(|x| x.parse::<u64>().ok())) {
      (Some("user_usec"), Some(n)) => stats.cpu_user = Some(Duration::from_micros(n)),
      (Some("system_usec"), Some(n)) => stats.cpu_system = Some(Duration::from_micros(n)),
      _ => {}
    }
  }
  stats
}

fn kill_cgroup(cgroup: &Path) -> Result<()> {
  // cgroup.kill takes out the whole subtree atomically
  let kill_file = cgroup.join("cgroup.kill");
  if kill_file.exists() {
    fs::write(&kill_file, "1")?;
    return Ok(());
  }

  // older kernels: SIGKILL every pid until the group stays empty
  loop {
    let procs = fs::read_to_string(cgroup.join("cgroup.procs"))?;
    if procs.trim().is_empty() {
      return Ok(());
    }
    for pid in procs.split_ascii_whitespace() {
      if let Ok(pid) = pid.parse::<i32>() {
        let _ = nix::sys::signal::kill(
          nix::unistd::Pid::from_raw(pid),
          nix::sys::signal::Signal::SIGKILL,
        );
      }
    }
    std::thread::sleep(Duration::from_millis(10));
  }
}

/// Kill every process in the cgroup, collect its CPU statistics, and remove
/// it. Harmless to call for a cgroup that does not exist.
pub fn destroy_cgroup(cgroup: &Path) -> Result<CgroupStats> {
  if !cgroup.exists() {
    return Ok(Default::default());
  }

  kill_cgroup(cgroup)?;

  let stats = fs::read_to_string(cgroup.join("cpu.stat"))
    .map(|s| parse_cpu_stat(&s))
    .unwrap_or_default();

  // children must go before the parent can be removed
  let mut subdirs = vec![];
  for entry in fs::read_dir(cgroup)? {
    let entry = entry?;
    if entry.file_type()?.is_dir() {
      subdirs.push(entry.path());
    }
  }
  for dir in subdirs {
    destroy_cgroup(&dir)?;
  }

  debug!("destroying cgroup '{}'", cgroup.display());
  fs::remove_dir(cgroup)
    .with_context(|| format!("deleting cgroup '{}'", cgroup.display()))?;

  Ok(stats)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cpu_stat_units_are_microseconds() {
    let stats = parse_cpu_stat("usage_usec 5000000\nuser_usec 3000000\nsystem_usec 2000000\n");
    assert_eq!(stats.cpu_user, Some(Duration::from_secs(3)));
    assert_eq!(stats.cpu_system, Some(Duration::from_secs(2)));
  }

  #[test]
  fn cpu_stat_tolerates_missing_fields() {
    let stats = parse_cpu_stat("usage_usec 1\n");
    assert_eq!(stats.cpu_user, None);
    assert_eq!(stats.cpu_system, None);
  }

  #[test]
  fn missing_cgroup_is_not_an_error() {
    let stats = destroy_cgroup(Path::new("/no/such/cgroup")).unwrap();
    assert!(stats.cpu_user.is_none());
  }
}
