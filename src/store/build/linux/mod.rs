//! Linux process spawning: user/mount/PID/IPC/UTS/net namespaces, the helper
//! double-spawn, and everything the child does between `clone` and `execve`.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{BufRead, BufReader};
use std::os::unix::fs::symlink;
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::os::unix::prelude::RawFd;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::slice;

use ipc_channel::ipc::IpcBytesReceiver;
use libc::SIGCHLD;
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::pty::{posix_openpt, ptsname, unlockpt};
use nix::sched::{unshare, CloneFlags};
use nix::sys::mman::{mmap, MapFlags, ProtFlags};
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
use nix::sys::stat::Mode;
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{
  chdir, chown, chroot, close, dup2, fork, getuid, mkdir, pivot_root, setgid, setgroups,
  sethostname, setsid, setuid, write, ForkResult, Gid, Pid, Uid,
};
use slog_scope::debug;

use super::builtins::builtin_fetchurl;
use super::chroot::{chmod, do_bind};
use super::error::send_child_error;
use super::rewrite::{rewrite_env, rewrite_strings};
use super::{ChrootPath, DerivationBuilder};
use crate::prelude::*;
use crate::store::settings::settings;
use crate::store::Derivation;

pub mod cgroup;
pub mod seccomp;
mod sys_ext;

const NULL: Option<&'static str> = None;

pub(crate) fn mount_and_pid_namespaces_supported() -> bool {
  Path::new("/proc/self/ns/mnt").exists() && Path::new("/proc/self/ns/pid").exists()
}

pub(crate) fn user_namespaces_supported() -> bool {
  if !Path::new("/proc/self/ns/user").exists() {
    return false;
  }
  fs::read_to_string("/proc/sys/user/max_user_namespaces")
    .map(|x| x.trim() != "0")
    .unwrap_or(false)
}

struct ChildCtx<'a> {
  slave_fd: RawFd,
  user_ns_rx: Option<IpcBytesReceiver>,
  use_chroot: bool,
  sandboxed: bool,
  chroot_root: Option<PathBuf>,
  paths_in_chroot: BTreeMap<PathBuf, ChrootPath>,
  tmp_dir_in_sandbox: PathBuf,
  drv: &'a Derivation,
  env: &'a BTreeMap<String, String>,
  input_rewrites: &'a HashMap<String, String>,
  store_dir: PathBuf,
  sandbox_uid: u32,
  sandbox_gid: u32,
  uid_range: bool,
  has_cgroup: bool,
  build_user: Option<(Uid, Gid, Vec<Gid>)>,
}

impl DerivationBuilder {
  /// Create the pseudoterminal and spawn the builder, sandboxed or not.
  pub(crate) fn spawn_builder(&mut self) -> Result<()> {
    let builder_out = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)
      .context("opening pseudoterminal master")?;
    let slave_name = unsafe { ptsname(&builder_out) }?;

    if let Some(user) = &self.build_user {
      chmod(Path::new(&slave_name), 0o600)?;
      chown(Path::new(&slave_name), Some(user.uid()), None)?;
    }

    unlockpt(&builder_out)?;

    let slave_fd = open(
      Path::new(&slave_name),
      OFlag::O_RDWR | OFlag::O_NOCTTY,
      Mode::empty(),
    )?;

    // raw mode, so builder output is not mangled by the line discipline
    let mut term = tcgetattr(slave_fd)?;
    cfmakeraw(&mut term);
    tcsetattr(slave_fd, SetArg::TCSANOW, &term)?;

    let master_fd = builder_out.into_raw_fd();
    self.builder_out = Some(unsafe { fs::File::from_raw_fd(master_fd) });

    let res = if self.use_chroot {
      self.spawn_sandboxed(slave_fd)
    } else {
      self.spawn_unsandboxed(slave_fd)
    };

    let _ = close(slave_fd);
    res
  }

  fn child_ctx(&self, slave_fd: RawFd, user_ns_rx: Option<IpcBytesReceiver>) -> ChildCtx<'_> {
    ChildCtx {
      slave_fd,
      user_ns_rx,
      use_chroot: self.use_chroot,
      sandboxed: self.drv.is_sandboxed(),
      chroot_root: self.chroot_root.clone(),
      paths_in_chroot: self.paths_in_chroot.clone(),
      tmp_dir_in_sandbox: self.tmp_dir_in_sandbox.clone(),
      drv: &self.drv,
      env: &self.env,
      input_rewrites: &self.input_rewrites,
      store_dir: self.store.store_path().to_path_buf(),
      sandbox_uid: self.sandbox_uid(),
      sandbox_gid: self.sandbox_gid(),
      uid_range: self.build_user.as_ref().map_or(false, |u| u.uid_count() != 1),
      has_cgroup: self.cgroup.is_some(),
      build_user: self
        .build_user
        .as_ref()
        .map(|u| (u.uid(), u.gid(), u.supplementary_gids().to_vec())),
    }
  }

  fn spawn_sandboxed(&mut self, slave_fd: RawFd) -> Result<()> {
    self.using_user_ns = user_namespaces_supported();

    let (user_ns_tx, user_ns_rx) = ipc_channel::ipc::bytes_channel()?;
    let (pid_read, pid_write) = crate::util::pipe::new()?;

    let sandboxed = self.drv.is_sandboxed();
    let using_user_ns = self.using_user_ns;

    // A helper process does the clone: clone(2) in a multithreaded program
    // is unsafe since at-fork handlers don't run, and the daemon thread may
    // be live by now. CLONE_PARENT parents the grandchild to us.
    match unsafe { fork() }? {
      ForkResult::Child => {
        drop(pid_read);
        let ctx = self.child_ctx(slave_fd, Some(user_ns_rx));

        // must drop supplementary groups before entering the user namespace
        if getuid().is_root() {
          if let Err(e) = setgroups(&[]) {
            if e != Errno::EPERM || settings().require_drop_supplementary_groups {
              send_child_error(slave_fd, &anyhow!("setgroups failed: {}", e));
              exit(1);
            }
          }
        }

        let stack_size = 1024 * 1024 * 8;
        let stack = match unsafe {
          mmap(
            std::ptr::null_mut(),
            stack_size,
            ProtFlags::PROT_WRITE | ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_STACK,
            -1,
            0,
          )
        } {
          Ok(stack) => stack,
          Err(e) => {
            send_child_error(slave_fd, &anyhow!("unable to allocate stack: {}", e));
            exit(1);
          }
        };
        let stack_slice = unsafe { slice::from_raw_parts_mut(stack.cast::<u8>(), stack_size) };

        let mut clone_flags = CloneFlags::CLONE_NEWPID
          | CloneFlags::CLONE_NEWNS
          | CloneFlags::CLONE_NEWIPC
          | CloneFlags::CLONE_NEWUTS
          | CloneFlags::CLONE_PARENT;
        if sandboxed {
          clone_flags |= CloneFlags::CLONE_NEWNET;
        }
        if using_user_ns {
          clone_flags |= CloneFlags::CLONE_NEWUSER;
        }

        let child_pid = sys_ext::clone(
          move || match run_child(ctx) {
            Err(e) => {
              send_child_error(libc::STDERR_FILENO, &e);
              1
            }
            Ok(_) => 0,
          },
          stack_slice,
          clone_flags,
          Some(SIGCHLD),
        );

        match child_pid {
          Ok(pid) => {
            let mut pid_write = pid_write;
            use std::io::Write as _;
            let _ = writeln!(pid_write, "{}", pid);
            exit(0)
          }
          Err(e) => {
            send_child_error(slave_fd, &anyhow!("unable to spawn build process: {}", e));
            exit(1)
          }
        }
      }
      ForkResult::Parent { child: helper } => {
        drop(pid_write);

        match waitpid(helper, None)? {
          WaitStatus::Exited(_, 0) => {}
          _ => {
            // the helper sent its failure over the pty
            self.process_sandbox_setup_messages()?;
            bail!("unable to start build process");
          }
        }

        let mut line = String::new();
        BufReader::new(pid_read).read_line(&mut line)?;
        let pid = Pid::from_raw(line.trim().parse().context("reading builder pid")?);
        self.pid = Some(pid);

        if self.using_user_ns {
          // The uid/gid map makes the sandbox uid correspond to the build
          // user. setgroups must be denied before writing a gid map from
          // outside the namespace.
          let (host_uid, host_gid, nr_ids) = match &self.build_user {
            Some(u) => (u.uid().as_raw(), u.gid().as_raw(), u.uid_count()),
            None => (
              nix::unistd::getuid().as_raw(),
              nix::unistd::getgid().as_raw(),
              1,
            ),
          };

          fs::write(
            format!("/proc/{}/uid_map", pid),
            format!("{} {} {}", self.sandbox_uid(), host_uid, nr_ids),
          )?;

          if nr_ids == 1 {
            fs::write(format!("/proc/{}/setgroups", pid), "deny")?;
          }

          fs::write(
            format!("/proc/{}/gid_map", pid),
            format!("{} {} {}", self.sandbox_gid(), host_gid, nr_ids),
          )?;
        } else {
          debug!("note: not using a user namespace");
          ensure!(
            self.build_user.is_some(),
            "cannot perform a sandboxed build because user namespaces are not enabled; check \
             /proc/sys/user/max_user_namespaces"
          );
        }

        // now that the sandbox uid is known, /etc/passwd can be written
        if let Some(chroot_root) = &self.chroot_root {
          fs::write(
            chroot_root.join("etc/passwd"),
            format!(
              "root:x:0:0:Build user:{dir}:/noshell\nkilnbld:x:{uid}:{gid}:Build \
               user:{dir}:/noshell\nnobody:x:65534:65534:Nobody:/:/noshell\n",
              dir = self.tmp_dir_in_sandbox.display(),
              uid = self.sandbox_uid(),
              gid = self.sandbox_gid()
            ),
          )?;
        }

        // Save the pre-pivot_root namespaces; addDependency uses them to
        // bind host paths into the running sandbox.
        self.sandbox_mount_ns = Some(
          fs::File::open(format!("/proc/{}/ns/mnt", pid))
            .context("getting sandbox mount namespace")?,
        );
        if self.using_user_ns {
          self.sandbox_user_ns = Some(
            fs::File::open(format!("/proc/{}/ns/user", pid))
              .context("getting sandbox user namespace")?,
          );
        }

        if let Some(cgroup) = &self.cgroup {
          fs::write(cgroup.join("cgroup.procs"), pid.as_raw().to_string())?;
        }

        self.attach_daemon_sandbox()?;

        // one byte: the uid map is in place, the child may continue
        user_ns_tx.send(&[1])?;

        Ok(())
      }
    }
  }

  fn spawn_unsandboxed(&mut self, slave_fd: RawFd) -> Result<()> {
    match unsafe { fork() }? {
      ForkResult::Child => match run_child(self.child_ctx(slave_fd, None)) {
        Err(e) => {
          send_child_error(libc::STDERR_FILENO, &e);
          exit(1)
        }
        Ok(_) => exit(0),
      },
      ForkResult::Parent { child } => {
        self.pid = Some(child);
        Ok(())
      }
    }
  }
}

fn init_loopback() -> Result<()> {
  let sock = socket(
    AddressFamily::Inet,
    SockType::Datagram,
    SockFlag::empty(),
    None,
  )?;
  netdevice::set_flags(
    sock,
    "lo",
    &(netdevice::IFF_UP | netdevice::IFF_LOOPBACK | netdevice::IFF_RUNNING),
  )
  .map_err(|e| anyhow!("cannot set loopback interface flags: {}", e))?;
  close(sock)?;
  Ok(())
}

fn set_personality(platform: &str) -> Result<()> {
  // PER_LINUX32, so 32-bit builds on a 64-bit kernel see an i686 uname
  if platform == "i686-linux" && cfg!(target_arch = "x86_64") {
    const PER_LINUX32: libc::c_ulong = 0x0008;
    unsafe { libc::personality(PER_LINUX32) };
  }

  let cur = linux_personality::get_personality()
    .map_err(|_| anyhow!("couldn't get personality"))?;
  linux_personality::personality(cur | linux_personality::ADDR_NO_RANDOMIZE)
    .map_err(|_| anyhow!("couldn't set personality"))?;
  Ok(())
}

fn close_extra_fds() {
  // close_range covers everything above the standard streams in one shot
  let res = unsafe { libc::syscall(libc::SYS_close_range, 3, libc::c_uint::MAX, 0) };
  if res != 0 {
    for fd in 3..1024 {
      let _ = close(fd);
    }
  }
}

fn setup_chroot(ctx: &mut ChildCtx) -> Result<()> {
  let chroot_root = ctx
    .chroot_root
    .clone()
    .ok_or_else(|| anyhow!("sandbox root was never built"))?;

  if ctx.sandboxed {
    init_loopback()?;
  }

  sethostname("localhost").context("cannot set host name")?;
  if unsafe { libc::setdomainname(b"(none)\0".as_ptr().cast(), 6) } == -1 {
    return Err(anyhow::Error::from(Errno::last()).context("cannot set domain name"));
  }

  // Shared subtrees would propagate our mounts back out of the namespace.
  mount(NULL, "/", NULL, MsFlags::MS_PRIVATE | MsFlags::MS_REC, NULL)
    .context("unable to make '/' private")?;

  // pivot_root needs the new root to be a mount point
  mount(
    Some(&chroot_root),
    &chroot_root,
    NULL,
    MsFlags::MS_BIND,
    NULL,
  )
  .with_context(|| format!("unable to bind mount '{}'", chroot_root.display()))?;

  // Mark the sandbox store as a shared subtree, so bind mounts made from
  // the saved pre-pivot namespace (addDependency) propagate inside. Marking
  // the root itself shared would make pivot_root fail.
  let chroot_store_dir = chroot_root.append(&ctx.store_dir);
  mount(
    Some(&chroot_store_dir),
    &chroot_store_dir,
    NULL,
    MsFlags::MS_BIND,
    NULL,
  )
  .context("unable to bind mount the store")?;
  mount(NULL, &chroot_store_dir, NULL, MsFlags::MS_SHARED, NULL)
    .with_context(|| format!("unable to mount '{}' as shared", chroot_store_dir.display()))?;

  let mut extra_paths: Vec<PathBuf> = vec![];
  if !ctx.paths_in_chroot.contains_key(Path::new("/dev")) {
    fs::create_dir_all(chroot_root.join("dev/shm"))?;
    fs::create_dir_all(chroot_root.join("dev/pts"))?;
    extra_paths.push("/dev/full".into());
    if settings().system_features.contains("kvm") && Path::new("/dev/kvm").exists() {
      extra_paths.push("/dev/kvm".into());
    }
    for dev in &["/dev/null", "/dev/random", "/dev/tty", "/dev/urandom", "/dev/zero"] {
      extra_paths.push(dev.into());
    }
    symlink("/proc/self/fd", chroot_root.join("dev/fd"))?;
    symlink("/proc/self/fd/0", chroot_root.join("dev/stdin"))?;
    symlink("/proc/self/fd/1", chroot_root.join("dev/stdout"))?;
    symlink("/proc/self/fd/2", chroot_root.join("dev/stderr"))?;
  }

  // Fixed-output derivations need working name resolution; restrict NSS to
  // plain files and DNS to bound the impurity.
  if !ctx.sandboxed {
    fs::write(
      chroot_root.join("etc/nsswitch.conf"),
      "hosts: files dns\nservices: files\n",
    )?;
    for path in &["/etc/resolv.conf", "/etc/services", "/etc/hosts"] {
      if Path::new(path).exists() {
        extra_paths.push(path.into());
      }
    }
    if let Some(ca_file) = &settings().ca_file {
      if ca_file.exists() {
        ctx.paths_in_chroot.insert(
          "/etc/ssl/certs/ca-certificates.crt".into(),
          ChrootPath {
            path: fs::canonicalize(ca_file)?,
            optional: true,
          },
        );
      }
    }
  }

  for path in extra_paths {
    let canonical = fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
    ctx.paths_in_chroot.entry(path).or_insert(ChrootPath {
      path: canonical,
      optional: false,
    });
  }

  let has_pts = ctx.paths_in_chroot.contains_key(Path::new("/dev/pts"));

  for (target, source) in std::mem::take(&mut ctx.paths_in_chroot) {
    if source.path == Path::new("/proc") {
      continue;
    }
    do_bind(&source.path, chroot_root.append(&target), source.optional)?;
  }

  // fresh procfs, so the builder sees only its own namespace
  let procfs = chroot_root.join("proc");
  fs::create_dir_all(&procfs)?;
  mount(
    Some("none"),
    &procfs,
    Some("proc"),
    MsFlags::empty(),
    NULL,
  )
  .context("mounting /proc")?;

  if ctx.uid_range {
    let sysfs = chroot_root.join("sys");
    fs::create_dir_all(&sysfs)?;
    mount(
      Some("none"),
      &sysfs,
      Some("sysfs"),
      MsFlags::empty(),
      NULL,
    )
    .context("mounting /sys")?;
  }

  // a private /dev/shm, cleaned up with the namespace
  if Path::new("/dev/shm").exists() {
    mount(
      Some("none"),
      &chroot_root.join("dev/shm"),
      Some("tmpfs"),
      MsFlags::empty(),
      Some(format!("size={}", settings().sandbox_shm_size).as_str()),
    )
    .context("mounting /dev/shm")?;
  }

  // A fresh devpts instance where the kernel supports it. The fallback
  // bind-mounts the host's, without trying to fix up ptmx permissions.
  if Path::new("/dev/pts/ptmx").exists()
    && !chroot_root.join("dev/ptmx").exists()
    && !has_pts
  {
    match mount(
      Some("none"),
      &chroot_root.join("dev/pts"),
      Some("devpts"),
      MsFlags::empty(),
      Some("newinstance,mode=0620"),
    ) {
      Ok(()) => {
        symlink("/dev/pts/ptmx", chroot_root.join("dev/ptmx"))?;
        // some kernels create ptmx with mode 0
        chmod(chroot_root.join("dev/pts/ptmx"), 0o666)?;
      }
      Err(e) => {
        if e != Errno::EINVAL {
          return Err(anyhow::Error::from(e).context("mounting /dev/pts"));
        }
        do_bind("/dev/pts", chroot_root.join("dev/pts"), false)?;
        do_bind("/dev/ptmx", chroot_root.join("dev/ptmx"), false)?;
      }
    }
  }

  if !ctx.uid_range {
    chmod(chroot_root.join("etc"), 0o555)?;
  }

  // Unshare the mount namespace once more: pivot_root changes this
  // namespace's root, and the parent's saved fd must keep pointing at one
  // where the host store is still reachable.
  unshare(CloneFlags::CLONE_NEWNS).context("unsharing mount namespace")?;
  if ctx.has_cgroup {
    unshare(CloneFlags::CLONE_NEWCGROUP).context("unsharing cgroup namespace")?;
  }

  chdir(&chroot_root)
    .with_context(|| format!("cannot change directory to '{}'", chroot_root.display()))?;
  mkdir("real-root", Mode::from_bits_truncate(0o500))?;
  pivot_root(".", "real-root").context("cannot pivot old root directory")?;
  chroot(".").context("cannot change root directory")?;
  umount2("real-root", MntFlags::MNT_DETACH).context("cannot unmount real root filesystem")?;
  fs::remove_dir("real-root")?;

  setgid(Gid::from_raw(ctx.sandbox_gid)).context("setgid failed")?;
  setuid(Uid::from_raw(ctx.sandbox_uid)).context("setuid failed")?;

  Ok(())
}

fn run_child(mut ctx: ChildCtx) -> Result<()> {
  setsid()?;

  dup2(ctx.slave_fd, libc::STDERR_FILENO)?;
  dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO)?;
  let fdnull = open("/dev/null", OFlag::O_RDWR, Mode::empty())?;
  dup2(fdnull, libc::STDIN_FILENO)?;
  close(fdnull)?;

  // seccomp failures are only fatal when there is a build user to protect
  if let Err(e) = seccomp::init_seccomp() {
    if ctx.build_user.is_some() {
      return Err(e);
    }
  }

  let mut switched_user = false;

  if ctx.use_chroot {
    // wait until the parent has written our uid/gid map
    let rx = ctx.user_ns_rx.take().expect("sandbox child needs a sync channel");
    let contents = rx.recv().map_err(|e| anyhow!("{:?}", e))?;
    ensure!(contents == [1], "user namespace initialisation failed");
    drop(rx);

    setup_chroot(&mut ctx)?;
    switched_user = true;
  }

  chdir(&ctx.tmp_dir_in_sandbox).with_context(|| {
    format!("changing into '{}'", ctx.tmp_dir_in_sandbox.display())
  })?;

  close_extra_fds();

  set_personality(&ctx.drv.platform)?;

  // deterministic builds shouldn't leave core files behind
  rlimit::Resource::CORE.set(0, rlimit::INFINITY)?;

  if !switched_user {
    if let Some((uid, gid, supplementary)) = &ctx.build_user {
      // keep groups like "kvm" that the admin granted the build user
      setgroups(supplementary).context("cannot set supplementary groups of build user")?;
      setgid(*gid).context("setgid failed")?;
      setuid(*uid).context("setuid failed")?;
    }
  }

  if let Some(builtin) = ctx.drv.as_builtin() {
    let new_env: BTreeMap<String, String> = ctx
      .drv
      .env
      .iter()
      .map(|(k, v)| (k.clone(), rewrite_strings(v, ctx.input_rewrites).into_owned()))
      .collect();

    write(libc::STDERR_FILENO, b"\x02\n")?;

    match builtin.as_str() {
      "fetchurl" => builtin_fetchurl(&new_env)?,
      x => bail!("unsupported builtin builder '{}'", x),
    }
    exit(0);
  }

  let program = std::ffi::CString::new(ctx.drv.builder.display().to_string())?;

  let mut argv = vec![std::ffi::CString::new(
    ctx
      .drv
      .builder
      .file_name()
      .map(|x| x.to_string_lossy().into_owned())
      .unwrap_or_default(),
  )?];
  for arg in &ctx.drv.args {
    argv.push(std::ffi::CString::new(
      rewrite_strings(arg, ctx.input_rewrites).into_owned(),
    )?);
  }

  let envp: Vec<std::ffi::CString> = rewrite_env(ctx.env, ctx.input_rewrites)
    .into_iter()
    .map(|(k, v)| std::ffi::CString::new(format!("{}={}", k, v)))
    .collect::<Result<_, _>>()?;

  // the environment is ready; everything after this point is the builder's
  write(libc::STDERR_FILENO, b"\x02\n")?;

  nix::unistd::execve(&program, &argv, &envp)?;

  bail!("executing '{}'", ctx.drv.builder.display())
}
