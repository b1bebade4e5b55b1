//! Executes one derivation build inside a sandbox and certifies the results.
//!
//! The `DerivationBuilder` drives four phases: `prepare_build` acquires a
//! build user and decides on sandboxing, `start_builder` constructs the
//! environment and spawns the builder process, the caller then waits for the
//! builder to exit (its stderr arrives on the fd passed to `child_started`),
//! and `unprepare_build` tears everything down and registers the outputs.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::os::unix::prelude::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::sys::statvfs::statvfs;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chown, Pid};
use parking_lot::Mutex;
use slog_scope::{debug, info, warn};

use crate::prelude::*;
use crate::store::derivation::DerivationType;
use crate::store::lock::{acquire_user_lock, UserLock};
use crate::store::settings::{settings, BuildMode, SandboxMode};
use crate::store::{Derivation, Realisation, Store, StorePathSet};

pub mod builtins;
pub mod check;
pub mod chroot;
pub mod daemon;
mod env;
pub mod error;
pub mod hook;
pub mod register;
pub mod rewrite;

cfg_if::cfg_if! {
  if #[cfg(target_os = "linux")] {
    pub mod linux;
    use self::linux as sys;
  } else if #[cfg(target_os = "macos")] {
    pub mod macos;
    use self::macos as sys;
  } else {
    compile_error!("sandboxed builds are not supported on this platform.");
  }
}

use error::{read_child_error, BuildError, NotDeterministic, CHILD_ERROR, CHILD_READY};

pub use daemon::DaemonHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
  Built,
  PermanentFailure,
  TransientFailure,
  OutputRejected,
  NotDeterministic,
}

/// Timing and resource usage of one build attempt.
#[derive(Debug, Default, Clone)]
pub struct BuildResult {
  pub times_built: u32,
  pub start_time: Option<SystemTime>,
  pub stop_time: Option<SystemTime>,
  pub cpu_user: Option<Duration>,
  pub cpu_system: Option<Duration>,
}

/// What `unprepare_build` hands back to the scheduler.
pub enum BuildOutcome {
  Failed(BuildStatus, anyhow::Error),
  Finished(BTreeMap<String, Realisation>),
}

/// Notifications and services the enclosing worker provides to the builder.
pub trait DerivationBuilderCallbacks: Send + Sync {
  fn open_log_file(&self) -> Result<()>;
  fn close_log_file(&self);
  /// Amend a failure message with the tail of the build log.
  fn append_log_tail_error_msg(&self, msg: &mut String);
  /// The builder process is running; its stderr can be read from `fd`.
  fn child_started(&self, fd: RawFd);
  fn child_terminated(&self);
  fn mark_contents_good(&self, path: &StorePath);
  fn note_hash_mismatch(&self);
  fn note_check_mismatch(&self);
  /// In check mode, produce the realisations recorded by the original build.
  fn assert_path_validity(&self) -> Result<BTreeMap<String, Realisation>>;
}

/// Callbacks that do nothing. Useful for tests and one-shot tools.
pub struct NoopCallbacks;

impl DerivationBuilderCallbacks for NoopCallbacks {
  fn open_log_file(&self) -> Result<()> {
    Ok(())
  }

  fn close_log_file(&self) {}

  fn append_log_tail_error_msg(&self, _msg: &mut String) {}

  fn child_started(&self, _fd: RawFd) {}

  fn child_terminated(&self) {}

  fn mark_contents_good(&self, _path: &StorePath) {}

  fn note_hash_mismatch(&self) {}

  fn note_check_mismatch(&self) {}

  fn assert_path_validity(&self) -> Result<BTreeMap<String, Realisation>> {
    Ok(Default::default())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PathStatus {
  Corrupt,
  Absent,
  Valid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialOutputStatus {
  pub path: StorePath,
  pub status: PathStatus,
}

impl InitialOutputStatus {
  pub fn is_present(&self) -> bool {
    matches!(self.status, PathStatus::Corrupt | PathStatus::Valid)
  }

  pub fn is_valid(&self) -> bool {
    self.status == PathStatus::Valid
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialOutput {
  pub wanted: bool,
  pub known: Option<InitialOutputStatus>,
}

/// One entry of the sandbox filesystem: target inside the sandbox mapped from
/// a source on the host. Optional entries are skipped when the source is
/// missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChrootPath {
  pub path: PathBuf,
  pub optional: bool,
}

pub struct DerivationBuilderParams {
  pub drv_path: StorePath,
  pub drv: Derivation,
  pub build_mode: BuildMode,
  /// The resolved closure of every input, computed by the scheduler.
  pub input_paths: StorePathSet,
}

pub struct DerivationBuilder {
  pub(crate) store: Arc<dyn Store>,
  pub(crate) callbacks: Box<dyn DerivationBuilderCallbacks>,
  pub(crate) drv_path: StorePath,
  pub(crate) drv: Derivation,
  pub(crate) build_mode: BuildMode,
  pub(crate) input_paths: StorePathSet,

  pub(crate) derivation_type: Option<DerivationType>,
  pub(crate) build_user: Option<UserLock>,
  pub(crate) use_chroot: bool,
  pub(crate) using_user_ns: bool,
  pub(crate) chroot_root: Option<PathBuf>,
  pub(crate) cgroup: Option<PathBuf>,
  pub(crate) top_tmp_dir: Option<PathBuf>,
  pub(crate) tmp_dir: Option<PathBuf>,
  pub(crate) tmp_dir_in_sandbox: PathBuf,
  pub(crate) env: BTreeMap<String, String>,
  pub(crate) initial_outputs: BTreeMap<String, InitialOutput>,
  pub(crate) scratch_outputs: BTreeMap<String, StorePath>,
  pub(crate) redirected_outputs: BTreeMap<StorePath, StorePath>,
  pub(crate) input_rewrites: HashMap<String, String>,
  pub(crate) output_rewrites: HashMap<String, String>,
  pub(crate) paths_in_chroot: BTreeMap<PathBuf, ChrootPath>,
  pub(crate) pid: Option<Pid>,
  pub(crate) builder_out: Option<fs::File>,
  pub(crate) sandbox_mount_ns: Option<fs::File>,
  pub(crate) sandbox_user_ns: Option<fs::File>,
  pub(crate) daemon: Option<DaemonHandle>,
  pub(crate) added_paths: Arc<Mutex<StorePathSet>>,
  pub(crate) sandbox_handles: Arc<Mutex<Option<daemon::SandboxRef>>>,
  pub(crate) build_result: BuildResult,
}

pub fn make_derivation_builder(
  store: Arc<dyn Store>,
  callbacks: Box<dyn DerivationBuilderCallbacks>,
  params: DerivationBuilderParams,
) -> DerivationBuilder {
  DerivationBuilder {
    store,
    callbacks,
    drv_path: params.drv_path,
    drv: params.drv,
    build_mode: params.build_mode,
    input_paths: params.input_paths,
    derivation_type: None,
    build_user: None,
    use_chroot: false,
    using_user_ns: false,
    chroot_root: None,
    cgroup: None,
    top_tmp_dir: None,
    tmp_dir: None,
    tmp_dir_in_sandbox: settings().sandbox_build_dir().to_path_buf(),
    env: Default::default(),
    initial_outputs: Default::default(),
    scratch_outputs: Default::default(),
    redirected_outputs: Default::default(),
    input_rewrites: Default::default(),
    output_rewrites: Default::default(),
    paths_in_chroot: Default::default(),
    pid: None,
    builder_out: None,
    sandbox_mount_ns: None,
    sandbox_user_ns: None,
    daemon: None,
    added_paths: Arc::new(Mutex::new(Default::default())),
    sandbox_handles: Arc::new(Mutex::new(None)),
    build_result: Default::default(),
  }
}

impl DerivationBuilder {
  /// Acquire resources and decide how the build will be isolated.
  ///
  /// Returns false if no build user is currently free; the caller should
  /// retry later. No side effects are observable in that case.
  pub fn prepare_build(&mut self) -> Result<bool> {
    self.derivation_type = Some(self.drv.ty);

    self.use_chroot = match settings().sandbox_mode() {
      SandboxMode::On => {
        if self.drv.options.no_chroot {
          bail!(
            "derivation '{}' has '__noChroot' set, but that's not allowed when 'sandbox' is \
             'true'",
            self.store.print_store_path(&self.drv_path)
          );
        }
        if cfg!(target_os = "macos") && !self.drv.options.additional_sandbox_profile.is_empty() {
          bail!(
            "derivation '{}' specifies a sandbox profile, but this is only allowed when \
             'sandbox' is 'relaxed'",
            self.store.print_store_path(&self.drv_path)
          );
        }
        true
      }
      SandboxMode::Off => false,
      SandboxMode::Relaxed => self.drv.is_sandboxed() && !self.drv.options.no_chroot,
    };

    if self.store.real_store_dir() != self.store.store_path() {
      if cfg!(target_os = "linux") {
        self.use_chroot = true;
      } else {
        bail!("building using a diverted store is not supported on this platform");
      }
    }

    #[cfg(target_os = "linux")]
    if self.use_chroot && !sys::mount_and_pid_namespaces_supported() {
      if !settings().sandbox_fallback {
        bail!(
          "this system does not support the kernel namespaces that are required for sandboxing; \
           use '--no-sandbox' to disable sandboxing"
        );
      }
      debug!("auto-disabling sandboxing because the prerequisite namespaces are not available");
      self.use_chroot = false;
    }

    if self.use_build_users() && self.build_user.is_none() {
      let nr_ids = if self.drv.options.use_uid_range { 65536 } else { 1 };
      self.build_user = acquire_user_lock(nr_ids)?;
      if self.build_user.is_none() {
        return Ok(false);
      }
    }

    self.initial_outputs = self.compute_initial_outputs()?;

    Ok(true)
  }

  fn use_build_users(&self) -> bool {
    (settings().build_users_group().is_some() && nix::unistd::geteuid().is_root())
      || settings().auto_allocate_uids
  }

  fn compute_initial_outputs(&self) -> Result<BTreeMap<String, InitialOutput>> {
    let mut res = BTreeMap::new();
    for (name, output) in &self.drv.outputs {
      let known = match output.path(&*self.store, &self.drv.name, name)? {
        Some(path) => {
          let status = if self.store.is_valid_path(&path)? {
            PathStatus::Valid
          } else if self.store.to_real_path(&path).exists() {
            PathStatus::Corrupt
          } else {
            PathStatus::Absent
          };
          Some(InitialOutputStatus { path, status })
        }
        None => None,
      };
      res.insert(name.clone(), InitialOutput { wanted: true, known });
    }
    Ok(res)
  }

  pub(crate) fn sandbox_uid(&self) -> u32 {
    if self.using_user_ns {
      match &self.build_user {
        Some(u) if u.uid_count() != 1 => 0,
        _ => 1000,
      }
    } else {
      self.build_user.as_ref().map_or_else(
        || nix::unistd::getuid().as_raw(),
        |u| u.uid().as_raw(),
      )
    }
  }

  pub(crate) fn sandbox_gid(&self) -> u32 {
    if self.using_user_ns {
      match &self.build_user {
        Some(u) if u.uid_count() != 1 => 0,
        _ => 100,
      }
    } else {
      self.build_user.as_ref().map_or_else(
        || nix::unistd::getgid().as_raw(),
        |u| u.gid().as_raw(),
      )
    }
  }

  pub(crate) fn chown_to_builder<P: AsRef<Path>>(&self, path: P) -> Result<()> {
    let user = match &self.build_user {
      Some(u) => u,
      None => return Ok(()),
    };
    let path = path.as_ref();
    chown(path, Some(user.uid()), Some(user.gid()))
      .with_context(|| format!("cannot change ownership of '{}'", path.display()))
  }

  /// Construct the build environment and spawn the builder process. On
  /// return, the sandbox is set up and the builder has been `execve`d.
  pub fn start_builder(&mut self) -> Result<()> {
    // Builtins resolve hostnames in-process; force NSS to load its plugins
    // now, while the real filesystem is still visible.
    static NSS_INIT: parking_lot::Once = parking_lot::Once::new();
    if self.drv.is_builtin() {
      NSS_INIT.call_once(|| {
        let res = dns_lookup::getaddrinfo(Some("invalid-domain.invalid"), Some("http"), None);
        assert!(res.is_err());
      });
    }

    self.setup_cgroup()?;

    // Make sure that no other processes are executing under the sandbox
    // uids before we chown anything to them.
    self.kill_sandbox(false)?;

    if self.drv.platform != settings().this_system && !self.drv.is_builtin() {
      bail!(
        "a '{}' with features {{{}}} is required to build '{}', but I am a '{}'",
        self.drv.platform,
        join_features(&self.drv.options.required_system_features),
        self.store.print_store_path(&self.drv_path),
        settings().this_system
      );
    }
    for feature in &self.drv.options.required_system_features {
      ensure!(
        settings().system_features.contains(feature),
        "derivation '{}' requires the system feature '{}', which this machine does not provide",
        self.store.print_store_path(&self.drv_path),
        feature
      );
    }

    if self.drv.options.use_uid_range {
      ensure!(
        cfg!(target_os = "linux"),
        "feature 'uid-range' is not supported on this platform"
      );
      ensure!(
        self.use_chroot,
        "feature 'uid-range' is only supported in sandboxed builds"
      );
      ensure!(
        self.build_user.as_ref().map_or(0, |u| u.uid_count()) >= 65536,
        "feature 'uid-range' requires auto-allocated UID ranges"
      );
    }

    let top_tmp_dir = tempfile::Builder::new()
      .prefix(&format!("kiln-build-{}-", self.drv.name))
      .tempdir()?
      .into_path();
    let tmp_dir = if self.use_chroot && !cfg!(target_os = "macos") {
      // hide the real TMPDIR under a root-owned directory
      let dir = top_tmp_dir.join("build");
      fs::create_dir(&dir)?;
      let _ = nix::sys::stat::fchmodat(
        None,
        &dir,
        Mode::from_bits_truncate(0o700),
        nix::sys::stat::FchmodatFlags::FollowSymlink,
      );
      dir
    } else {
      top_tmp_dir.clone()
    };
    self.chown_to_builder(&tmp_dir)?;
    if !self.use_chroot {
      self.tmp_dir_in_sandbox = tmp_dir.clone();
    }
    self.top_tmp_dir = Some(top_tmp_dir);
    self.tmp_dir = Some(tmp_dir);

    self.make_scratch_outputs()?;

    self.init_env()?;
    self.write_structured_attrs()?;
    self.export_references_graph()?;

    if self.use_chroot {
      self.prepare_chroot()?;
    }

    if self.needs_hash_rewrite() && Path::new("/homeless-shelter").exists() {
      bail!(
        "home directory '/homeless-shelter' exists; please remove it to assure purity of builds \
         without sandboxing"
      );
    }

    if self.use_chroot {
      if let Some(hook) = &settings().pre_build_hook {
        let extra = hook::run_pre_build_hook(
          hook,
          &self.store.print_store_path(&self.drv_path),
          self.chroot_root.as_deref(),
        )?;
        self.paths_in_chroot.extend(extra);
      }
    }

    if self
      .drv
      .options
      .required_system_features
      .contains("recursive-nix")
    {
      self.start_daemon()?;
    }

    info!("executing builder '{}'", self.drv.builder.display());

    self.callbacks.open_log_file()?;

    self.spawn_builder()?;

    self.build_result.start_time = Some(SystemTime::now());
    if let Some(out) = &self.builder_out {
      use std::os::unix::io::AsRawFd;
      self.callbacks.child_started(out.as_raw_fd());
    }

    self.process_sandbox_setup_messages()
  }

  fn setup_cgroup(&mut self) -> Result<()> {
    let wants_cgroup = self.build_user.as_ref().map_or(false, |u| u.uid_count() != 1)
      || settings().use_cgroups;
    if !wants_cgroup {
      return Ok(());
    }

    cfg_if::cfg_if! {
      if #[cfg(target_os = "linux")] {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);

        let root = linux::cgroup::root_cgroup_path()?;
        let cgroup = match &self.build_user {
          Some(user) => root.join(format!("kiln-build-uid-{}", user.uid())),
          None => root.join(format!(
            "kiln-build-pid-{}-{}",
            nix::unistd::getpid(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
          )),
        };

        debug!("using cgroup '{}'", cgroup.display());

        // remember the cgroup per uid so a later run can clean up leftovers
        if let Some(user) = &self.build_user {
          let cgroups_dir = settings().state_dir().join("cgroups");
          fs::create_dir_all(&cgroups_dir)?;
          let cgroup_file = cgroups_dir.join(user.uid().to_string());
          if cgroup_file.exists() {
            let prev = fs::read_to_string(&cgroup_file)?;
            let _ = linux::cgroup::destroy_cgroup(Path::new(prev.trim()));
          }
          fs::write(&cgroup_file, cgroup.display().to_string())?;
        }

        self.cgroup = Some(cgroup);
        Ok(())
      } else {
        bail!("cgroups are not supported on this platform")
      }
    }
  }

  /// Kill everything belonging to the build: the cgroup if there is one,
  /// otherwise every process under the build UID. Idempotent.
  pub fn kill_sandbox(&mut self, get_stats: bool) -> Result<()> {
    #[cfg(target_os = "linux")]
    if let Some(cgroup) = &self.cgroup {
      let stats = linux::cgroup::destroy_cgroup(cgroup)?;
      if get_stats {
        self.build_result.cpu_user = stats.cpu_user;
        self.build_result.cpu_system = stats.cpu_system;
      }
      return Ok(());
    }

    if let Some(user) = &self.build_user {
      ensure!(!user.uid().is_root(), "refusing to kill uid 0");
      user.kill()?;
    }
    Ok(())
  }

  fn kill_child(&mut self) -> Result<Option<WaitStatus>> {
    let pid = match self.pid.take() {
      Some(p) => p,
      None => return Ok(None),
    };
    // the child is a session leader, so take out its whole group
    let _ = kill(Pid::from_raw(-pid.as_raw()), Signal::SIGKILL);
    let _ = kill(pid, Signal::SIGKILL);
    let status = loop {
      match waitpid(pid, None) {
        Ok(st) => break st,
        Err(Errno::EINTR) => continue,
        Err(e) => return Err(e.into()),
      }
    };
    Ok(Some(status))
  }

  fn process_sandbox_setup_messages(&mut self) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = self
      .builder_out
      .as_ref()
      .expect("builder has not been started")
      .as_raw_fd();

    let mut msgs: Vec<String> = vec![];
    loop {
      let line = match read_pty_line(fd)? {
        Some(line) => line,
        None => {
          let status = self.kill_child()?;
          bail!(
            "while waiting for the build environment for '{}' to initialize ({:?}, previous \
             messages: {})",
            self.store.print_store_path(&self.drv_path),
            status,
            msgs.join("|")
          );
        }
      };
      match line.as_bytes().first() {
        Some(&CHILD_READY) => break,
        Some(&CHILD_ERROR) => {
          let err = read_child_error(&mut error::FdSource(fd))?;
          return Err(err.context("while setting up the build environment"));
        }
        _ => {
          debug!("sandbox setup: {}", line.trim_end());
          msgs.push(line);
        }
      }
    }
    Ok(())
  }

  /// Tear down the build environment after the builder has exited (or been
  /// killed) and either classify the failure or register the outputs.
  pub fn unprepare_build(&mut self) -> Result<BuildOutcome> {
    // the saved namespaces keep the sandbox mounts alive; drop them first
    self.sandbox_mount_ns = None;
    self.sandbox_user_ns = None;

    let status = self.kill_child()?;

    debug!(
      "builder process for '{}' finished",
      self.store.print_store_path(&self.drv_path)
    );

    self.build_result.times_built += 1;
    self.build_result.stop_time = Some(SystemTime::now());

    self.callbacks.child_terminated();

    // closes the master side of the pty
    self.builder_out = None;

    self.callbacks.close_log_file();

    // kill anything the builder left behind before the uid can be reused
    self.kill_sandbox(true)?;

    self.stop_daemon()?;

    if let (Some(user), Some(system)) = (self.build_result.cpu_user, self.build_result.cpu_system)
    {
      debug!(
        "builder for '{}' terminated with status {:?}, user CPU {:.3}s, system CPU {:.3}s",
        self.store.print_store_path(&self.drv_path),
        status,
        user.as_secs_f64(),
        system.as_secs_f64()
      );
    }

    let outcome = self.finish_build(status);

    // don't release the uid until nothing can be running under it
    self.build_user = None;

    outcome
  }

  fn finish_build(&mut self, status: Option<WaitStatus>) -> Result<BuildOutcome> {
    let status_ok = matches!(status, Some(WaitStatus::Exited(_, 0)));
    let mut disk_full = false;

    let attempt: Result<BTreeMap<String, Realisation>> = if status_ok {
      self.register_outputs()
    } else {
      disk_full = self.cleanup_decide_whether_disk_full();
      let mut msg = format!(
        "builder for '{}' {}",
        self.store.print_store_path(&self.drv_path),
        describe_status(status)
      );
      self.callbacks.append_log_tail_error_msg(&mut msg);
      if disk_full {
        msg.push_str("\nnote: build failure may have been caused by lack of free disk space");
      }
      Err(BuildError::new(msg))
    };

    // scratch and sandbox state is removed on both paths
    for scratch in self.redirected_outputs.values() {
      let _ = rm_rf::ensure_removed(self.store.to_real_path(scratch));
    }
    self.redirected_outputs.clear();
    self.delete_chroot();

    match attempt {
      Ok(outputs) => {
        self.delete_tmp_dir(true);
        Ok(BuildOutcome::Finished(outputs))
      }
      Err(e) => {
        self.delete_tmp_dir(false);
        let st = if e.downcast_ref::<NotDeterministic>().is_some() {
          BuildStatus::NotDeterministic
        } else if status_ok {
          BuildStatus::OutputRejected
        } else if !self.drv.is_sandboxed() || disk_full {
          BuildStatus::TransientFailure
        } else {
          BuildStatus::PermanentFailure
        };
        Ok(BuildOutcome::Failed(st, e))
      }
    }
  }

  fn cleanup_decide_whether_disk_full(&mut self) -> bool {
    let mut disk_full = false;

    // We have no way of knowing whether the build got an ENOSPC, so check
    // whether the disk is nearly full now and if so refrain from declaring
    // the failure permanent.
    let required = 8 * 1024 * 1024u64;
    let mut candidates = vec![self.store.real_store_dir()];
    if let Some(tmp) = &self.tmp_dir {
      candidates.push(tmp.clone());
    }
    for path in candidates {
      if let Ok(st) = statvfs(&path) {
        if (st.blocks_available() as u64) * (st.fragment_size() as u64) < required {
          disk_full = true;
        }
      }
    }

    // move interesting outputs out of the chroot so failures can be poked at
    if self.use_chroot && self.build_mode == BuildMode::Normal {
      if let Some(chroot_root) = &self.chroot_root {
        for status in self.initial_outputs.values() {
          if let Some(known) = &status.known {
            if known.is_valid() {
              continue;
            }
            let dest = self.store.to_real_path(&known.path);
            let inside = chroot_root.append(self.store.print_store_path(&known.path));
            if inside.exists() {
              let _ = fs::rename(&inside, &dest);
            }
          }
        }
      }
    }

    disk_full
  }

  pub(crate) fn delete_chroot(&mut self) {
    if let Some(root) = self.chroot_root.take() {
      let parent = root.parent().map(Path::to_path_buf).unwrap_or(root);
      debug!("deleting chroot '{}'", parent.display());
      if let Err(e) = rm_rf::ensure_removed(&parent) {
        warn!("unable to delete chroot '{}': {}", parent.display(), e);
      }
    }
  }

  /// Delete the temporary directory. With `force` false, `keep-failed`
  /// preserves it for debugging unless the builder was a builtin (those may
  /// have copied credentials in).
  pub fn delete_tmp_dir(&mut self, force: bool) {
    let top = match self.top_tmp_dir.take() {
      Some(t) => t,
      None => return,
    };
    let tmp = self.tmp_dir.take().unwrap_or_else(|| top.clone());

    if settings().keep_failed && !force && !self.drv.is_builtin() {
      warn!("note: keeping build directory '{}'", tmp.display());
      for p in [&top, &tmp] {
        let _ = nix::sys::stat::fchmodat(
          None,
          p.as_path(),
          Mode::from_bits_truncate(0o755),
          nix::sys::stat::FchmodatFlags::FollowSymlink,
        );
      }
    } else if let Err(e) = rm_rf::ensure_removed(&top) {
      warn!("unable to delete '{}': {}", top.display(), e);
    }
  }
}

fn describe_status(status: Option<WaitStatus>) -> String {
  match status {
    Some(WaitStatus::Exited(_, code)) => format!("failed with exit code {}", code),
    Some(WaitStatus::Signaled(_, sig, core)) => format!(
      "failed due to signal {}{}",
      sig,
      if core { " (core dumped)" } else { "" }
    ),
    other => format!("died abnormally ({:?})", other),
  }
}

fn join_features(set: &std::collections::BTreeSet<String>) -> String {
  set.iter().cloned().collect::<Vec<_>>().join(", ")
}

/// Read one `\n`-terminated line from a pty master, byte by byte so nothing
/// beyond the newline is consumed. EIO means the slave side is gone, which we
/// treat as end of stream.
pub(crate) fn read_pty_line(fd: RawFd) -> Result<Option<String>> {
  let mut line = Vec::new();
  loop {
    let mut byte = [0u8];
    match nix::unistd::read(fd, &mut byte) {
      Ok(0) => {
        return Ok(if line.is_empty() {
          None
        } else {
          Some(String::from_utf8_lossy(&line).into_owned())
        })
      }
      Ok(_) => {
        if byte[0] == b'\n' {
          return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
        line.push(byte[0]);
      }
      Err(Errno::EIO) => {
        return Ok(if line.is_empty() {
          None
        } else {
          Some(String::from_utf8_lossy(&line).into_owned())
        })
      }
      Err(Errno::EINTR) => continue,
      Err(e) => return Err(e.into()),
    }
  }
}
