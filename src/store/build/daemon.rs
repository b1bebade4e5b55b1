//! The recursive store daemon: a Unix-socket service inside the build's temp
//! directory through which the builder can talk to a restricted view of the
//! store. Paths added through this channel are materialised in the sandbox
//! and become referenceable by the outputs.

use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::errno::Errno;
use nix::sys::socket::{shutdown, Shutdown};
use parking_lot::Mutex;
use slog_scope::{debug, warn};

use super::chroot::chmod;
use super::error::Interrupted;
use super::DerivationBuilder;
use crate::prelude::*;
use crate::store::{Store, StorePathSet};

pub const OP_IS_VALID_PATH: u64 = 1;
pub const OP_QUERY_REFERENCES: u64 = 2;
pub const OP_ADD_TO_STORE: u64 = 3;
pub const OP_ADD_TEMP_ROOT: u64 = 4;

pub(crate) fn write_u64<W: Write>(w: &mut W, n: u64) -> io::Result<()> {
  w.write_all(&n.to_le_bytes())
}

pub(crate) fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
  let mut buf = [0u8; 8];
  r.read_exact(&mut buf)?;
  Ok(u64::from_le_bytes(buf))
}

pub(crate) fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
  write_u64(w, s.len() as u64)?;
  w.write_all(s.as_bytes())
}

pub(crate) fn read_string<R: Read>(r: &mut R) -> Result<String> {
  let len = read_u64(r)?;
  ensure!(len < 1 << 20, "oversized string in daemon protocol");
  let mut buf = vec![0u8; len as usize];
  r.read_exact(&mut buf)?;
  String::from_utf8(buf).map_err(Into::into)
}

/// What the builder is allowed to see through the daemon: its own inputs,
/// its scratch outputs, and whatever it added during this build.
///
/// The sandbox handles are filled in by the controller once the child is
/// running; the daemon may accept connections before that happens.
pub(crate) struct RestrictedStore {
  pub store: Arc<dyn Store>,
  pub input_paths: StorePathSet,
  pub scratch_outputs: StorePathSet,
  pub added_paths: Arc<Mutex<StorePathSet>>,
  pub sandbox: Arc<Mutex<Option<SandboxRef>>>,
}

/// Handles needed to make a freshly added path appear inside a running
/// sandbox.
pub(crate) struct SandboxRef {
  pub chroot_root: PathBuf,
  pub mount_ns: std::fs::File,
  pub user_ns: Option<std::fs::File>,
}

impl RestrictedStore {
  fn is_allowed(&self, path: &StorePath) -> bool {
    self.input_paths.contains(path)
      || self.scratch_outputs.contains(path)
      || self.added_paths.lock().contains(path)
  }

  /// Grant the builder access to `path`, bind-mounting it into the sandbox
  /// if there is one.
  pub fn add_dependency(&self, path: &StorePath) -> Result<()> {
    if self.is_allowed(path) {
      return Ok(());
    }

    self.added_paths.lock().insert(path.clone());

    let sandbox = self.sandbox.lock();
    if let Some(sandbox) = &*sandbox {
      debug!(
        "materialising '{}' in the sandbox",
        self.store.print_store_path(path)
      );
      self.mount_in_sandbox(sandbox, path)?;
    }
    Ok(())
  }

  #[cfg(target_os = "linux")]
  fn mount_in_sandbox(&self, sandbox: &SandboxRef, path: &StorePath) -> Result<()> {
    use nix::sched::{setns, CloneFlags};
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    let source = self.store.to_real_path(path);
    let target = sandbox
      .chroot_root
      .append(self.store.print_store_path(path));

    if target.exists() {
      bail!(
        "store path '{}' already exists in the sandbox",
        self.store.print_store_path(path)
      );
    }

    // setns(2) into a mount namespace is forbidden for multithreaded
    // processes, so the mount happens in a forked helper.
    match unsafe { fork()? } {
      ForkResult::Child => {
        let ok = (|| -> Result<()> {
          if let Some(user_ns) = &sandbox.user_ns {
            setns(user_ns.as_raw_fd(), CloneFlags::CLONE_NEWUSER)
              .context("entering sandbox user namespace")?;
          }
          setns(sandbox.mount_ns.as_raw_fd(), CloneFlags::CLONE_NEWNS)
            .context("entering sandbox mount namespace")?;
          super::chroot::do_bind(&source, &target, false)
        })()
        .is_ok();
        std::process::exit(if ok { 0 } else { 1 });
      }
      ForkResult::Parent { child } => match waitpid(child, None)? {
        WaitStatus::Exited(_, 0) => Ok(()),
        _ => bail!(
          "could not add path '{}' to sandbox",
          self.store.print_store_path(path)
        ),
      },
    }
  }

  #[cfg(not(target_os = "linux"))]
  fn mount_in_sandbox(&self, _sandbox: &SandboxRef, path: &StorePath) -> Result<()> {
    bail!(
      "don't know how to make path '{}' appear in the sandbox",
      self.store.print_store_path(path)
    )
  }

  fn handle_connection(&self, mut conn: UnixStream) -> Result<()> {
    loop {
      let op = match read_u64(&mut conn) {
        Ok(op) => op,
        // client hung up
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
        Err(e) => return Err(e.into()),
      };

      match op {
        OP_IS_VALID_PATH => {
          let path: StorePath = read_string(&mut conn)?.parse()?;
          let valid = self.is_allowed(&path) && self.store.is_valid_path(&path)?;
          write_u64(&mut conn, valid as u64)?;
        }
        OP_QUERY_REFERENCES => {
          let path: StorePath = read_string(&mut conn)?.parse()?;
          if !self.is_allowed(&path) {
            write_u64(&mut conn, 0)?;
            continue;
          }
          match self.store.query_path_info(&path)? {
            Some(info) => {
              write_u64(&mut conn, 1)?;
              write_u64(&mut conn, info.refs.len() as u64)?;
              for r in &info.refs {
                write_string(&mut conn, &r.to_string())?;
              }
            }
            None => write_u64(&mut conn, 0)?,
          }
        }
        OP_ADD_TO_STORE => {
          let name = read_string(&mut conn)?;
          let method = if read_u64(&mut conn)? == 0 {
            FileIngestionMethod::Flat
          } else {
            FileIngestionMethod::Recursive
          };
          let algo: HashType = read_string(&mut conn)?.parse()?;
          let len = read_u64(&mut conn)?;
          let blob = conn.try_clone()?.take(len);

          let path =
            self
              .store
              .add_dump_to_store(Box::new(blob), &name, method, algo, Repair::Off)?;
          self.add_dependency(&path)?;
          write_string(&mut conn, &path.to_string())?;
        }
        OP_ADD_TEMP_ROOT => {
          let _path = read_string(&mut conn)?;
          write_u64(&mut conn, 1)?;
        }
        op => bail!("unknown daemon operation {}", op),
      }
      conn.flush()?;
    }
  }
}

pub struct DaemonHandle {
  pub(crate) socket_path: PathBuf,
  listener: UnixListener,
  acceptor: Option<JoinHandle<()>>,
  workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl DerivationBuilder {
  /// Fire up the daemon thread processing recursive store calls from the
  /// builder.
  pub(crate) fn start_daemon(&mut self) -> Result<()> {
    let tmp_dir = self.tmp_dir.clone().expect("tmp dir not yet created");

    let socket_name = ".kiln-socket";
    let socket_path = tmp_dir.join(socket_name);
    self.env.insert(
      "NIX_REMOTE".into(),
      format!(
        "unix://{}",
        self.tmp_dir_in_sandbox.join(socket_name).display()
      ),
    );

    self.added_paths.lock().clear();

    let listener = UnixListener::bind(&socket_path)?;
    chmod(&socket_path, 0o600)?;
    self.chown_to_builder(&socket_path)?;

    let view = Arc::new(RestrictedStore {
      store: self.store.clone(),
      input_paths: self.input_paths.clone(),
      scratch_outputs: self.scratch_outputs.values().cloned().collect(),
      added_paths: self.added_paths.clone(),
      sandbox: self.sandbox_handles.clone(),
    });

    let accept_listener = listener.try_clone()?;
    let workers: Arc<Mutex<Vec<JoinHandle<()>>>> = Default::default();
    let workers2 = workers.clone();

    let acceptor = std::thread::spawn(move || loop {
      match accept_listener.accept() {
        Ok((conn, _)) => {
          debug!("received daemon connection");
          let view = view.clone();
          let worker = std::thread::spawn(move || {
            match view.handle_connection(conn) {
              Ok(()) => debug!("terminated daemon connection"),
              Err(e) if e.downcast_ref::<Interrupted>().is_some() => {
                debug!("interrupted daemon connection")
              }
              // worker failures never take down the build
              Err(e) => warn!("daemon connection failed: {:#}", e),
            }
          });
          workers2.lock().push(worker);
        }
        Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
        Err(_) => break,
      }
    });

    self.daemon = Some(DaemonHandle {
      socket_path,
      listener,
      acceptor: Some(acceptor),
      workers,
    });
    Ok(())
  }

  /// Once the sandbox namespaces exist, teach the daemon how to mount added
  /// paths into them.
  #[cfg(target_os = "linux")]
  pub(crate) fn attach_daemon_sandbox(&mut self) -> Result<()> {
    if self.daemon.is_none() {
      return Ok(());
    }
    let chroot_root = match &self.chroot_root {
      Some(r) => r.clone(),
      None => return Ok(()),
    };
    let mount_ns = match &self.sandbox_mount_ns {
      Some(f) => f.try_clone()?,
      None => return Ok(()),
    };
    let user_ns = match &self.sandbox_user_ns {
      Some(f) => Some(f.try_clone()?),
      None => None,
    };

    *self.sandbox_handles.lock() = Some(SandboxRef {
      chroot_root,
      mount_ns,
      user_ns,
    });
    Ok(())
  }

  /// Terminate the daemon: shut the listening socket down, then join the
  /// acceptor and every worker.
  pub fn stop_daemon(&mut self) -> Result<()> {
    let mut daemon = match self.daemon.take() {
      Some(d) => d,
      None => return Ok(()),
    };

    match shutdown(daemon.listener.as_raw_fd(), Shutdown::Both) {
      Ok(()) => {}
      // Some platforms report ENOTCONN for a listening socket that never
      // accepted a peer; that just means there is nothing to wake up.
      Err(Errno::ENOTCONN) => {}
      Err(e) => return Err(anyhow::Error::from(e).context("shutting down daemon socket")),
    }

    if let Some(acceptor) = daemon.acceptor.take() {
      let _ = acceptor.join();
    }
    for worker in daemon.workers.lock().drain(..) {
      let _ = worker.join();
    }

    let _ = std::fs::remove_file(&daemon.socket_path);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::nar;
  use crate::store::test::TestStore;
  use std::fs;

  fn spawn_view(view: Arc<RestrictedStore>) -> (UnixStream, JoinHandle<Result<()>>) {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("socket");
    let listener = UnixListener::bind(&socket_path).unwrap();
    let client = UnixStream::connect(&socket_path).unwrap();
    let handle = std::thread::spawn(move || {
      let (conn, _) = listener.accept()?;
      let res = view.handle_connection(conn);
      drop(dir);
      res
    });
    (client, handle)
  }

  #[test]
  fn add_to_store_grants_access() {
    let store = Arc::new(TestStore::new());
    let added: Arc<Mutex<StorePathSet>> = Default::default();
    let view = Arc::new(RestrictedStore {
      store: store.clone(),
      input_paths: Default::default(),
      scratch_outputs: Default::default(),
      added_paths: added.clone(),
      sandbox: Arc::new(Mutex::new(None)),
    });

    let tree = tempfile::tempdir().unwrap();
    fs::write(tree.path().join("data"), "recursive build artifact").unwrap();
    let mut blob = vec![];
    nar::dump_path(tree.path(), &mut blob, &nar::PathFilter::none()).unwrap();

    let (mut client, server) = spawn_view(view);

    write_u64(&mut client, OP_ADD_TO_STORE).unwrap();
    write_string(&mut client, "artifact").unwrap();
    write_u64(&mut client, 1).unwrap();
    write_string(&mut client, "sha256").unwrap();
    write_u64(&mut client, blob.len() as u64).unwrap();
    client.write_all(&blob).unwrap();

    let path: StorePath = read_string(&mut client).unwrap().parse().unwrap();

    // the added path is immediately part of the referenceable set
    assert!(added.lock().contains(&path));
    assert!(store.to_real_path(&path).join("data").exists());

    // and the daemon now reports it valid
    write_u64(&mut client, OP_IS_VALID_PATH).unwrap();
    write_string(&mut client, &path.to_string()).unwrap();
    assert_eq!(read_u64(&mut client).unwrap(), 1);

    drop(client);
    server.join().unwrap().unwrap();
  }

  #[test]
  fn undeclared_paths_are_invisible() {
    let store = Arc::new(TestStore::new());
    let secret: StorePath = format!("{}-secret", "g".repeat(32)).parse().unwrap();
    store.register_input(&secret, Default::default());

    let view = Arc::new(RestrictedStore {
      store: store.clone(),
      input_paths: Default::default(),
      scratch_outputs: Default::default(),
      added_paths: Default::default(),
      sandbox: Arc::new(Mutex::new(None)),
    });

    let (mut client, server) = spawn_view(view);

    // valid in the real store, but not part of this build's allowed set
    write_u64(&mut client, OP_IS_VALID_PATH).unwrap();
    write_string(&mut client, &secret.to_string()).unwrap();
    assert_eq!(read_u64(&mut client).unwrap(), 0);

    write_u64(&mut client, OP_QUERY_REFERENCES).unwrap();
    write_string(&mut client, &secret.to_string()).unwrap();
    assert_eq!(read_u64(&mut client).unwrap(), 0);

    drop(client);
    server.join().unwrap().unwrap();
  }
}
