use once_cell::sync::OnceCell;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SandboxMode {
  On,
  Off,
  Relaxed,
}

impl Default for SandboxMode {
  #[cfg(target_os = "linux")]
  fn default() -> Self {
    Self::On
  }

  #[cfg(not(target_os = "linux"))]
  fn default() -> Self {
    Self::Off
  }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BuildMode {
  Normal,
  Repair,
  Check,
}

impl Default for BuildMode {
  fn default() -> Self {
    Self::Normal
  }
}

/// Global build configuration. Initialized once at startup; defaults are
/// suitable for tests.
#[derive(Debug)]
pub struct Settings {
  pub build_users_group: Option<String>,
  pub sandbox_mode: SandboxMode,
  /// `src=dst` entries always granted to sandboxes; `?` suffix marks a path
  /// that may be missing on the host.
  pub sandbox_paths: Vec<String>,
  pub sandbox_build_dir: PathBuf,
  pub sandbox_fallback: bool,
  pub sandbox_shm_size: String,
  pub allowed_impure_host_prefixes: Vec<PathBuf>,
  pub build_cores: u32,
  pub state_dir: PathBuf,
  pub use_cgroups: bool,
  pub auto_allocate_uids: bool,
  pub start_id: u32,
  pub uid_count: u32,
  pub pre_build_hook: Option<PathBuf>,
  pub diff_hook: Option<PathBuf>,
  pub run_diff_hook: bool,
  pub keep_failed: bool,
  pub filter_syscalls: bool,
  pub allow_new_privileges: bool,
  pub require_drop_supplementary_groups: bool,
  pub darwin_log_sandbox_violations: bool,
  pub this_system: String,
  pub system_features: BTreeSet<String>,
  pub netrc_file: Option<PathBuf>,
  pub ca_file: Option<PathBuf>,
}

static SETTINGS: OnceCell<Settings> = OnceCell::new();

impl Settings {
  pub fn get() -> &'static Self {
    SETTINGS.get_or_init(Self::default)
  }

  pub fn init_with<F: FnOnce(Self) -> Self>(init_fn: F) {
    if SETTINGS.set(init_fn(Self::default())).is_err() {
      panic!("settings have already been initialized")
    }
  }

  pub fn build_users_group(&self) -> Option<&str> {
    self.build_users_group.as_deref()
  }

  pub fn sandbox_mode(&self) -> SandboxMode {
    self.sandbox_mode
  }

  pub fn sandbox_build_dir(&self) -> &Path {
    &self.sandbox_build_dir
  }

  pub fn state_dir(&self) -> &Path {
    &self.state_dir
  }
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      build_users_group: None,
      sandbox_mode: SandboxMode::default(),
      sandbox_paths: vec!["/bin/sh=/bin/sh".into()],
      sandbox_build_dir: "/build".into(),
      sandbox_fallback: true,
      sandbox_shm_size: "50%".into(),
      allowed_impure_host_prefixes: default_impure_prefixes(),
      build_cores: num_cores(),
      state_dir: "/kiln/var/kiln".into(),
      use_cgroups: false,
      auto_allocate_uids: false,
      start_id: 872_415_232,
      uid_count: 65536 * 8,
      pre_build_hook: None,
      diff_hook: None,
      run_diff_hook: false,
      keep_failed: false,
      filter_syscalls: true,
      allow_new_privileges: false,
      require_drop_supplementary_groups: false,
      darwin_log_sandbox_violations: false,
      this_system: this_system(),
      system_features: default_system_features(),
      netrc_file: None,
      ca_file: Some("/etc/ssl/certs/ca-certificates.crt".into()),
    }
  }
}

pub fn settings() -> &'static Settings {
  Settings::get()
}

fn num_cores() -> u32 {
  std::thread::available_parallelism().map_or(1, |x| x.get() as u32)
}

fn this_system() -> String {
  let arch = match std::env::consts::ARCH {
    "x86" => "i686",
    x => x,
  };
  let os = match std::env::consts::OS {
    "macos" => "darwin",
    x => x,
  };
  format!("{}-{}", arch, os)
}

fn default_system_features() -> BTreeSet<String> {
  let mut features: BTreeSet<String> = ["kiln-command", "benchmark", "big-parallel"]
    .iter()
    .map(|x| x.to_string())
    .collect();
  if cfg!(target_os = "linux") && Path::new("/dev/kvm").exists() {
    features.insert("kvm".into());
  }
  features
}

fn default_impure_prefixes() -> Vec<PathBuf> {
  if cfg!(target_os = "macos") {
    vec![
      "/System/Library".into(),
      "/usr/lib".into(),
      "/dev".into(),
      "/bin/sh".into(),
    ]
  } else {
    vec![]
  }
}
