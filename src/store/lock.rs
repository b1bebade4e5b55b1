use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::os::unix::prelude::RawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, setuid, ForkResult, Gid, Pid, Uid};
use slog_scope::debug;
use users::os::unix::GroupExt;

use crate::prelude::*;
use crate::store::settings::settings;

/// A lease on a UID (or a contiguous range of them) under which exactly one
/// build may run at a time.
pub struct UserLock {
  uid: Uid,
  gid: Gid,
  uid_count: u32,
  supplementary: Vec<Gid>,
  _lock: FileWriteLock,
}

impl UserLock {
  pub fn uid(&self) -> Uid {
    self.uid
  }

  pub fn gid(&self) -> Gid {
    self.gid
  }

  pub fn uid_count(&self) -> u32 {
    self.uid_count
  }

  pub fn supplementary_gids(&self) -> &[Gid] {
    &self.supplementary
  }

  /// Kill every process running under the leased UID. Runs in a forked child
  /// so that the setuid() doesn't poison the caller.
  pub fn kill(&self) -> Result<()> {
    debug!("killing all processes running under uid '{}'", self.uid());

    ensure!(
      !self.uid().is_root(),
      "kill() does the wrong thing for uid 0"
    );

    match unsafe { fork()? } {
      ForkResult::Child => {
        let code = if setuid(self.uid()).is_err() {
          1
        } else {
          loop {
            match kill(Pid::from_raw(-1), Signal::SIGKILL) {
              Err(Errno::ESRCH) | Err(Errno::EPERM) | Ok(_) => break 0,
              Err(Errno::EINTR) => continue,
              Err(_) => break 1,
            }
          }
        };
        std::process::exit(code);
      }
      ForkResult::Parent { child } => match waitpid(child, None) {
        Ok(WaitStatus::Exited(_, 0)) => Ok(()),
        Ok(w) => bail!("cannot kill processes for uid '{}': {:?}", self.uid(), w),
        Err(e) => Err(e.into()),
      },
    }
  }
}

fn userpool_dir() -> PathBuf {
  settings().state_dir().join("userpool")
}

/// Find a free build user. With auto-allocation enabled (always the case for
/// `nr_ids > 1`), a UID range is leased from the allocation pool instead of a
/// member of the build group.
pub fn acquire_user_lock(nr_ids: u32) -> Result<Option<UserLock>> {
  if nr_ids > 1 || settings().auto_allocate_uids {
    return acquire_uid_range(nr_ids);
  }

  let group_name = match settings().build_users_group() {
    Some(g) => g.to_string(),
    None => return Ok(None),
  };

  let gr = users::get_group_by_name(&group_name)
    .ok_or_else(|| anyhow!("the group specified in build-users-group does not exist"))?;
  if gr.members().is_empty() {
    bail!("the build users group '{}' has no members", group_name);
  }

  for m in gr.members() {
    let userinfo = users::get_user_by_name(m).ok_or_else(|| {
      anyhow!(
        "the user {:?} in the group '{}' does not exist",
        m,
        group_name
      )
    })?;
    if userinfo.uid() == 0 {
      bail!("the build user should not be root");
    }
    if let Some(userlock) = FileWriteLock::try_lock(userpool_dir().join(userinfo.uid().to_string()))?
    {
      let supplementary = users::get_user_groups(m, userinfo.primary_group_id())
        .unwrap_or_default()
        .into_iter()
        .map(|g| Gid::from_raw(g.gid()))
        .collect();
      return Ok(Some(UserLock {
        uid: Uid::from_raw(userinfo.uid()),
        gid: Gid::from_raw(userinfo.primary_group_id()),
        uid_count: 1,
        supplementary,
        _lock: userlock,
      }));
    }
  }
  Ok(None)
}

fn acquire_uid_range(nr_ids: u32) -> Result<Option<UserLock>> {
  ensure!(
    settings().auto_allocate_uids,
    "UID ranges require the auto-allocate-uids setting"
  );
  ensure!(
    nr_ids <= settings().uid_count,
    "requested UID range is larger than the allocation pool"
  );

  let nr_slots = settings().uid_count / nr_ids;
  for slot in 0..nr_slots {
    if let Some(lock) = FileWriteLock::try_lock(userpool_dir().join(format!("slot-{}", slot)))? {
      let first = settings().start_id + slot * nr_ids;
      return Ok(Some(UserLock {
        uid: Uid::from_raw(first),
        // group kilnbld-like allocation: the range's first id doubles as gid
        gid: Gid::from_raw(first),
        uid_count: nr_ids,
        supplementary: vec![],
        _lock: lock,
      }));
    }
  }
  Ok(None)
}

pub struct FileWriteLock {
  _fd: File,
}

impl FileWriteLock {
  pub fn try_lock<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
    let path = path.as_ref();
    std::fs::create_dir_all(path.parent().expect("path cannot be empty"))?;
    let file =
      File::create(path).with_context(|| format!("while creating path {}", path.display()))?;
    if lock_file(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)? {
      Ok(Some(Self { _fd: file }))
    } else {
      Ok(None)
    }
  }

  pub fn lock<P: AsRef<Path>>(path: P) -> Result<Self> {
    let path = path.as_ref();
    let file = File::create(path)?;
    lock_file(file.as_raw_fd(), FlockArg::LockExclusive)?;
    Ok(Self { _fd: file })
  }
}

/// Exclusive locks over a set of store paths, taken via `<path>.lock` files.
/// Used while a dynamically computed output path is being moved into place.
#[derive(Default)]
pub struct PathLocks {
  locks: Vec<(PathBuf, FileWriteLock)>,
  delete_on_release: bool,
}

impl PathLocks {
  pub fn new() -> Self {
    Default::default()
  }

  pub fn set_deletion(&mut self, delete: bool) {
    self.delete_on_release = delete;
  }

  pub fn lock_paths<I: IntoIterator<Item = PathBuf>>(&mut self, paths: I) -> Result<()> {
    for path in paths {
      let lock_path = PathBuf::from(format!("{}.lock", path.display()));
      let lock = FileWriteLock::lock(&lock_path)?;
      self.locks.push((lock_path, lock));
    }
    Ok(())
  }
}

impl Drop for PathLocks {
  fn drop(&mut self) {
    for (path, lock) in self.locks.drain(..) {
      if self.delete_on_release {
        let _ = std::fs::remove_file(&path);
      }
      drop(lock);
    }
  }
}

fn lock_file(fd: RawFd, ty: FlockArg) -> Result<bool> {
  if let Err(e) = flock(fd, ty) {
    if e == Errno::EWOULDBLOCK {
      Ok(false)
    } else {
      Err(e.into())
    }
  } else {
    Ok(true)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn write_lock_excludes() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("l");
    let first = FileWriteLock::try_lock(&p).unwrap();
    assert!(first.is_some());
    assert!(FileWriteLock::try_lock(&p).unwrap().is_none());
    drop(first);
    assert!(FileWriteLock::try_lock(&p).unwrap().is_some());
  }

  #[test]
  fn path_locks_delete_on_release() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("out");
    let mut locks = PathLocks::new();
    locks.set_deletion(true);
    locks.lock_paths(vec![target.clone()]).unwrap();
    let lock_file = dir.path().join("out.lock");
    assert!(lock_file.exists());
    drop(locks);
    assert!(!lock_file.exists());
  }
}
