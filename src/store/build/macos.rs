//! Darwin confinement. There is no chroot here; the builder is wrapped in a
//! sandbox profile that denies everything and then grants the scratch
//! outputs, the sandbox paths, and the ancestor chains `realpath()` needs.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::{ChrootPath, DerivationBuilder};
use crate::prelude::*;
use crate::store::settings::settings;

/// The profile interpreter chokes on overlong allow groups, so the path list
/// is split at roughly this many bytes.
const PROFILE_GROUP_LIMIT: usize = 1 << 14;

const SANDBOX_DEFAULTS: &str = include_str!("sandbox-defaults.sb");
const SANDBOX_NETWORK: &str = include_str!("sandbox-network.sb");

pub(crate) fn generate_sandbox_profile(
  store_dir: &Path,
  scratch_outputs: &[String],
  paths_in_chroot: &BTreeMap<PathBuf, ChrootPath>,
  sandboxed: bool,
  log_violations: bool,
  additional_profile: &str,
) -> Result<String> {
  let mut profile = String::from("(version 1)\n");

  if log_violations {
    profile.push_str("(deny default)\n");
  } else {
    profile.push_str("(deny default (with no-log))\n");
  }

  profile.push_str(SANDBOX_DEFAULTS);

  if !sandboxed {
    profile.push_str(SANDBOX_NETWORK);
  }

  profile.push_str("(allow file-read* file-write* process-exec\n");
  for path in scratch_outputs {
    profile.push_str(&format!("\t(subpath \"{}\")\n", path));
  }
  profile.push_str(")\n");

  // lots of file functions freak out unless the whole ancestry is readable
  let mut ancestry: BTreeSet<PathBuf> = BTreeSet::new();
  for target in paths_in_chroot.keys() {
    let mut cur = target.as_path();
    while let Some(parent) = cur.parent() {
      if parent == Path::new("/") {
        break;
      }
      ancestry.insert(parent.to_path_buf());
      cur = parent;
    }
  }
  let mut cur = Some(store_dir.to_path_buf());
  while let Some(c) = cur {
    if c == Path::new("/") {
      break;
    }
    cur = c.parent().map(Path::to_path_buf);
    ancestry.insert(c);
  }

  profile.push_str("(allow file-read* file-write* process-exec\n");
  let mut breakpoint = profile.len() + PROFILE_GROUP_LIMIT;
  for (target, entry) in paths_in_chroot {
    if profile.len() >= breakpoint {
      profile.push_str(")\n(allow file-read* file-write* process-exec\n");
      breakpoint = profile.len() + PROFILE_GROUP_LIMIT;
    }

    if target != &entry.path {
      bail!(
        "can't map '{}' to '{}': mismatched impure paths not supported on Darwin",
        target.display(),
        entry.path.display()
      );
    }

    let meta = match std::fs::symlink_metadata(target) {
      Ok(m) => m,
      Err(_) if entry.optional => continue,
      Err(e) => {
        return Err(anyhow::Error::from(e).context(format!(
          "getting attributes of required path '{}'",
          target.display()
        )))
      }
    };
    if meta.is_dir() {
      profile.push_str(&format!("\t(subpath \"{}\")\n", target.display()));
    } else {
      profile.push_str(&format!("\t(literal \"{}\")\n", target.display()));
    }
  }
  profile.push_str(")\n");

  profile.push_str("(allow file-read*\n");
  for path in ancestry {
    profile.push_str(&format!("\t(literal \"{}\")\n", path.display()));
  }
  profile.push_str(")\n");

  profile.push_str(additional_profile);

  Ok(profile)
}

impl DerivationBuilder {
  pub(crate) fn spawn_builder(&mut self) -> Result<()> {
    let scratch: Vec<String> = self
      .scratch_outputs
      .values()
      .map(|p| self.store.print_store_path(p))
      .collect();

    let profile = generate_sandbox_profile(
      self.store.store_path(),
      &scratch,
      &self.paths_in_chroot,
      self.drv.is_sandboxed(),
      settings().darwin_log_sandbox_violations,
      &self.drv.options.additional_sandbox_profile,
    )?;

    slog_scope::debug!("generated sandbox profile:\n{}", profile);

    self.spawn_darwin(profile)
  }

  fn spawn_darwin(&mut self, profile: String) -> Result<()> {
    use nix::fcntl::{open, OFlag};
    use nix::pty::{posix_openpt, ptsname, unlockpt};
    use nix::sys::stat::Mode;
    use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};
    use nix::unistd::{close, fork, ForkResult};
    use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};

    let builder_out =
      posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).context("opening pseudoterminal master")?;
    let slave_name = unsafe { ptsname(&builder_out) }?;

    if let Some(user) = &self.build_user {
      super::chroot::chmod(Path::new(&slave_name), 0o600)?;
      nix::unistd::chown(Path::new(&slave_name), Some(user.uid()), None)?;
    } else {
      unsafe {
        if libc::grantpt(builder_out.as_raw_fd()) != 0 {
          bail!("granting access to pseudoterminal slave");
        }
      }
    }

    unlockpt(&builder_out)?;

    let slave_fd = open(
      Path::new(&slave_name),
      OFlag::O_RDWR | OFlag::O_NOCTTY,
      Mode::empty(),
    )?;
    let mut term = tcgetattr(slave_fd)?;
    cfmakeraw(&mut term);
    tcsetattr(slave_fd, SetArg::TCSANOW, &term)?;

    let master_fd = builder_out.into_raw_fd();
    self.builder_out = Some(unsafe { std::fs::File::from_raw_fd(master_fd) });

    let res = match unsafe { fork() }? {
      ForkResult::Child => {
        let code = match run_darwin_child(self, slave_fd, &profile) {
          Err(e) => {
            super::error::send_child_error(libc::STDERR_FILENO, &e);
            1
          }
          Ok(()) => 0,
        };
        std::process::exit(code)
      }
      ForkResult::Parent { child } => {
        self.pid = Some(child);
        Ok(())
      }
    };

    let _ = close(slave_fd);
    res
  }
}

fn run_darwin_child(
  builder: &DerivationBuilder,
  slave_fd: std::os::unix::prelude::RawFd,
  profile: &str,
) -> Result<()> {
  use super::rewrite::{rewrite_env, rewrite_strings};
  use nix::unistd::{chdir, close, dup2, setgid, setgroups, setsid, setuid};
  use std::ffi::CString;

  // undocumented, but required to escape Rosetta pinning on aarch64
  extern "C" {
    fn sandbox_init_with_parameters(
      profile: *const libc::c_char,
      flags: u64,
      parameters: *const *const libc::c_char,
      errorbuf: *mut *mut libc::c_char,
    ) -> libc::c_int;
    fn sysctlbyname(
      name: *const libc::c_char,
      oldp: *mut libc::c_void,
      oldlenp: *mut libc::size_t,
      newp: *mut libc::c_void,
      newlen: libc::size_t,
    ) -> libc::c_int;
    fn posix_spawnattr_setbinpref_np(
      attr: *mut libc::posix_spawnattr_t,
      count: libc::size_t,
      pref: *mut libc::cpu_type_t,
      ocount: *mut libc::size_t,
    ) -> libc::c_int;
  }

  setsid()?;
  dup2(slave_fd, libc::STDERR_FILENO)?;
  dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO)?;

  chdir(&builder.tmp_dir_in_sandbox)?;

  if let Some(user) = &builder.build_user {
    setgroups(user.supplementary_gids())?;
    setgid(user.gid())?;
    setuid(user.uid())?;
  }

  let global_tmp = std::env::temp_dir();
  let mut params: Vec<CString> = vec![
    CString::new("_GLOBAL_TMP_DIR")?,
    CString::new(global_tmp.display().to_string())?,
  ];
  if builder.drv.options.allow_local_networking {
    params.push(CString::new("_ALLOW_LOCAL_NETWORKING")?);
    params.push(CString::new("1")?);
  }
  let mut param_ptrs: Vec<*const libc::c_char> = params.iter().map(|p| p.as_ptr()).collect();
  param_ptrs.push(std::ptr::null());

  let profile_c = CString::new(profile)?;
  let mut errbuf: *mut libc::c_char = std::ptr::null_mut();
  if unsafe {
    sandbox_init_with_parameters(profile_c.as_ptr(), 0, param_ptrs.as_ptr(), &mut errbuf)
  } != 0
  {
    bail!("failed to configure sandbox");
  }

  nix::unistd::write(libc::STDERR_FILENO, b"\x02\n")?;

  let program = CString::new(builder.drv.builder.display().to_string())?;
  let mut argv = vec![CString::new(
    builder
      .drv
      .builder
      .file_name()
      .map(|x| x.to_string_lossy().into_owned())
      .unwrap_or_default(),
  )?];
  for arg in &builder.drv.args {
    argv.push(CString::new(
      rewrite_strings(arg, &builder.input_rewrites).into_owned(),
    )?);
  }
  let envp: Vec<CString> = rewrite_env(&builder.env, &builder.input_rewrites)
    .into_iter()
    .map(|(k, v)| CString::new(format!("{}={}", k, v)))
    .collect::<Result<_, _>>()?;

  unsafe {
    let mut attr: libc::posix_spawnattr_t = std::mem::zeroed();
    libc::posix_spawnattr_init(&mut attr);
    // POSIX_SPAWN_SETEXEC turns posix_spawn into an exec
    libc::posix_spawnattr_setflags(&mut attr, 0x0040);

    if builder.drv.platform == "aarch64-darwin" {
      let mut affinity: libc::c_int = 0;
      sysctlbyname(
        b"kern.curproc_arch_affinity\0".as_ptr().cast(),
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        (&mut affinity as *mut libc::c_int).cast(),
        std::mem::size_of::<libc::c_int>(),
      );
      let mut cpu: libc::cpu_type_t = libc::CPU_TYPE_ARM64;
      posix_spawnattr_setbinpref_np(&mut attr, 1, &mut cpu, std::ptr::null_mut());
    } else if builder.drv.platform == "x86_64-darwin" {
      let mut cpu: libc::cpu_type_t = libc::CPU_TYPE_X86_64;
      posix_spawnattr_setbinpref_np(&mut attr, 1, &mut cpu, std::ptr::null_mut());
    }

    let argv_ptrs: Vec<*mut libc::c_char> = argv
      .iter()
      .map(|a| a.as_ptr() as *mut _)
      .chain(std::iter::once(std::ptr::null_mut()))
      .collect();
    let envp_ptrs: Vec<*mut libc::c_char> = envp
      .iter()
      .map(|e| e.as_ptr() as *mut _)
      .chain(std::iter::once(std::ptr::null_mut()))
      .collect();

    libc::posix_spawn(
      std::ptr::null_mut(),
      program.as_ptr(),
      std::ptr::null(),
      &attr,
      argv_ptrs.as_ptr(),
      envp_ptrs.as_ptr(),
    );
  }

  let _ = close(slave_fd);
  bail!("executing '{}'", builder.drv.builder.display())
}
