//! Parent-side construction of the sandbox filesystem: deciding which host
//! paths are visible inside, and staging the chroot skeleton next to the
//! store so outputs can later be renamed into place without crossing
//! filesystems.

use std::fs;
use std::path::{Path, PathBuf};

use nix::sys::stat::{fchmodat, FchmodatFlags, Mode};
use nix::unistd::chown;
use slog_scope::debug;

use super::{ChrootPath, DerivationBuilder};
use crate::prelude::*;
use crate::store::settings::settings;
use crate::store::StorePathSet;

pub(crate) fn chmod<P: AsRef<Path>>(path: P, mode: u32) -> Result<()> {
  fchmodat(
    None,
    path.as_ref(),
    Mode::from_bits_truncate(mode),
    FchmodatFlags::FollowSymlink,
  )
  .with_context(|| format!("setting permissions on '{}'", path.as_ref().display()))
}

impl DerivationBuilder {
  pub(crate) fn prepare_chroot(&mut self) -> Result<()> {
    self.paths_in_chroot.clear();

    // user-configurable host paths, `target=source` with optional `?`
    for entry in &settings().sandbox_paths {
      if entry.is_empty() {
        continue;
      }
      let mut optional = false;
      let entry = match entry.strip_suffix('?') {
        Some(e) => {
          optional = true;
          e
        }
        None => entry.as_str(),
      };
      let (target, source) = match break_str(entry, '=') {
        Some((t, s)) => (t, s),
        None => (entry, entry),
      };
      self.paths_in_chroot.insert(
        PathBuf::from(target),
        ChrootPath {
          path: PathBuf::from(source),
          optional,
        },
      );
    }

    if self
      .store
      .store_path()
      .starts_with(&self.tmp_dir_in_sandbox)
    {
      bail!("`sandbox-build-dir` must not contain the store directory");
    }

    let tmp_dir = self.tmp_dir.clone().expect("tmp dir not yet created");
    self.paths_in_chroot.insert(
      self.tmp_dir_in_sandbox.clone(),
      ChrootPath {
        path: tmp_dir,
        optional: false,
      },
    );

    // whatever store paths appear as sources come with their closure
    let mut closure = StorePathSet::new();
    for dir in self.paths_in_chroot.values() {
      if self.store.is_in_store(&dir.path) {
        if let Ok((store_path, _)) = self.store.to_store_path(&dir.path) {
          self
            .store
            .compute_fs_closure(&store_path, &mut closure)
            .context("while processing 'sandbox-paths'")?;
        }
      }
    }
    for path in closure {
      let printed = self.store.print_store_path(&path);
      self.paths_in_chroot.insert(
        PathBuf::from(&printed),
        ChrootPath {
          path: printed.into(),
          optional: false,
        },
      );
    }

    // per-derivation impure host paths, checked against the allow list
    for dep in &self.drv.options.impure_host_deps {
      let dep_path = Path::new(dep);
      let allowed = settings()
        .allowed_impure_host_prefixes
        .iter()
        .any(|prefix| dep_path.starts_with(prefix));
      if !allowed {
        bail!(
          "derivation '{}' requested impure path '{}', but it was not in allowed-impure-host-deps",
          self.store.print_store_path(&self.drv_path),
          dep
        );
      }
      // such paths may legitimately be missing on newer hosts
      self.paths_in_chroot.insert(
        dep_path.to_path_buf(),
        ChrootPath {
          path: dep_path.to_path_buf(),
          optional: true,
        },
      );
    }

    // the inputs themselves, rather than the whole store
    for input in &self.input_paths {
      let printed = self.store.print_store_path(input);
      self.paths_in_chroot.insert(
        PathBuf::from(&printed),
        ChrootPath {
          path: self.store.to_real_path(input),
          optional: false,
        },
      );
    }

    // When repairing or checking a multiple-output derivation we may be
    // rebuilding a path granted via sandbox-paths (e.g. a dependency of
    // /bin/sh). Those must not leak in.
    for (_, (_, known_path)) in self.drv.outputs_and_opt_paths(&*self.store)? {
      if let Some(path) = known_path {
        self
          .paths_in_chroot
          .remove(Path::new(&self.store.print_store_path(&path)));
      }
    }

    self.build_chroot_tree()
  }

  #[cfg(target_os = "linux")]
  fn build_chroot_tree(&mut self) -> Result<()> {
    // Adjacent to the outputs' final location, so register_outputs can move
    // results by rename.
    let chroot_parent = PathBuf::from(format!(
      "{}.chroot",
      self.store.to_real_path(&self.drv_path).display()
    ));
    rm_rf::ensure_removed(&chroot_parent)?;

    debug!("setting up chroot environment in '{}'", chroot_parent.display());

    fs::create_dir(&chroot_parent)
      .with_context(|| format!("cannot create '{}'", chroot_parent.display()))?;
    chmod(&chroot_parent, 0o700)?;

    let chroot_root = chroot_parent.join("root");
    let uid_range = self.build_user.as_ref().map_or(false, |u| u.uid_count() != 1);
    fs::create_dir(&chroot_root)?;
    chmod(&chroot_root, if uid_range { 0o755 } else { 0o750 })?;

    if let Some(user) = &self.build_user {
      let owner = if uid_range { Some(user.uid()) } else { None };
      chown(&chroot_root, owner, Some(user.gid()))
        .with_context(|| format!("cannot change ownership of '{}'", chroot_root.display()))?;
    }

    // many builders expect a writable /tmp regardless of $TMPDIR
    let chroot_tmp = chroot_root.join("tmp");
    fs::create_dir_all(&chroot_tmp)?;
    chmod(&chroot_tmp, 0o1777)?;

    fs::create_dir_all(chroot_root.join("etc"))?;
    if uid_range {
      self.chown_to_builder(chroot_root.join("etc"))?;
    }

    fs::write(
      chroot_root.join("etc/group"),
      format!(
        "root:x:0:\nkilnbld:!:{}:\nnogroup:x:65534:\n",
        self.sandbox_gid()
      ),
    )?;

    // /etc/passwd is written once the uid map is known

    if self.drv.is_sandboxed() {
      fs::write(
        chroot_root.join("etc/hosts"),
        "127.0.0.1 localhost\n::1 localhost\n",
      )?;
    }

    // A fake store, only writable by the build user. Inputs get bind-mounted
    // beneath it in the child.
    let chroot_store = chroot_root.append(self.store.store_path());
    fs::create_dir_all(&chroot_store)?;
    chmod(&chroot_store, 0o1775)?;
    if let Some(user) = &self.build_user {
      chown(&chroot_store, None, Some(user.gid()))
        .with_context(|| format!("cannot change ownership of '{}'", chroot_store.display()))?;
    }

    if let Some(cgroup) = &self.cgroup {
      fs::create_dir_all(cgroup)?;
      self.chown_to_builder(cgroup)?;
      self.chown_to_builder(cgroup.join("cgroup.procs"))?;
      self.chown_to_builder(cgroup.join("cgroup.threads"))?;
    }

    self.chroot_root = Some(chroot_root);
    Ok(())
  }

  #[cfg(not(target_os = "linux"))]
  fn build_chroot_tree(&mut self) -> Result<()> {
    // There is no chroot on Darwin; confinement comes from the generated
    // sandbox profile. The path set assembled above still feeds it.
    Ok(())
  }
}

/// Materialise one sandbox path. Directories are bind-mounted recursively,
/// symlinks are copied since a bind mount of a symlink is not portable, and
/// regular files are bind-mounted over a zero-byte stub.
#[cfg(target_os = "linux")]
pub(crate) fn do_bind<P: AsRef<Path>, Q: AsRef<Path>>(
  source: P,
  target: Q,
  optional: bool,
) -> Result<()> {
  use nix::mount::{mount, MsFlags};
  use nix::sys::stat::lstat;

  let source = source.as_ref();
  let target = target.as_ref();

  let st = match lstat(source) {
    Ok(st) => st,
    Err(nix::errno::Errno::ENOENT) if optional => return Ok(()),
    Err(e) => {
      return Err(
        anyhow::Error::from(e)
          .context(format!("getting attributes of path '{}'", source.display())),
      )
    }
  };

  debug!(
    "bind mounting '{}' to '{}'",
    source.display(),
    target.display()
  );

  let fmt = st.st_mode & libc::S_IFMT;
  let bind = || -> Result<()> {
    mount(
      Some(source),
      target,
      None::<&str>,
      MsFlags::MS_BIND | MsFlags::MS_REC,
      None::<&str>,
    )
    .with_context(|| {
      format!(
        "bind mount from '{}' to '{}' failed",
        source.display(),
        target.display()
      )
    })
  };

  if fmt == libc::S_IFDIR {
    fs::create_dir_all(target)?;
    bind()?;
  } else if fmt == libc::S_IFLNK {
    fs::create_dir_all(target.parent().expect("target must have a parent"))?;
    let link = fs::read_link(source)?;
    std::os::unix::fs::symlink(link, target)?;
  } else {
    fs::create_dir_all(target.parent().expect("target must have a parent"))?;
    fs::write(target, "")?;
    bind()?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::build::{make_derivation_builder, DerivationBuilderParams, NoopCallbacks};
  use crate::store::derivation::Derivation;
  use crate::store::settings::BuildMode;
  use crate::store::test::TestStore;
  use crate::store::Store;
  use std::sync::Arc;

  #[cfg(target_os = "linux")]
  #[test]
  fn optional_bind_of_missing_source_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("sandbox/usr/lib/libSystem.B.dylib");

    do_bind("/no/such/library", &target, true).unwrap();
    assert!(!target.exists());

    assert!(do_bind("/no/such/library", &target, false).is_err());
  }

  #[test]
  fn chroot_skeleton_is_staged_next_to_the_store() {
    let store = Arc::new(TestStore::new());

    let mut drv = Derivation::default();
    drv.name = "skel".into();

    let h = Hash::hash("skel", HashType::SHA256);
    let drv_path = StorePath::from_parts(&h.as_bytes()[..20], "skel.drv").unwrap();

    let mut b = make_derivation_builder(
      store.clone(),
      Box::new(NoopCallbacks),
      DerivationBuilderParams {
        drv_path,
        drv,
        build_mode: BuildMode::Normal,
        input_paths: Default::default(),
      },
    );
    b.use_chroot = true;
    let tmp = tempfile::tempdir().unwrap();
    b.tmp_dir = Some(tmp.path().to_path_buf());

    b.prepare_chroot().unwrap();

    // configured sandbox paths and the in-sandbox build dir are granted
    assert!(b.paths_in_chroot.contains_key(Path::new("/bin/sh")));
    assert_eq!(
      b.paths_in_chroot[&b.tmp_dir_in_sandbox.clone()].path,
      tmp.path()
    );

    if cfg!(target_os = "linux") {
      let root = b.chroot_root.clone().unwrap();
      assert!(root.starts_with(store.to_real_path(&b.drv_path).parent().unwrap()));
      assert!(root.join("etc/group").exists());
      assert!(root.join("tmp").exists());
      assert!(root.append(store.store_path()).exists());
      // hosts is only written for sandboxed derivations
      assert!(root.join("etc/hosts").exists());
    }

    b.delete_chroot();
    if cfg!(target_os = "linux") {
      assert!(b.chroot_root.is_none());
    }
  }
}
