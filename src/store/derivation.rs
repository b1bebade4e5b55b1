use crate::prelude::*;
use crate::store::Store;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// A fully resolved build recipe. Parsing the on-disk representation is the
/// job of a different subsystem; the builder receives these ready-made.
#[derive(Default, Debug, Clone)]
pub struct Derivation {
  pub name: String,
  pub builder: PathBuf,
  pub platform: String,
  pub args: Vec<String>,
  pub ty: DerivationType,
  pub env: BTreeMap<String, String>,
  pub input_sources: BTreeSet<StorePath>,
  pub outputs: BTreeMap<String, Output>,
  pub input_derivations: BTreeMap<StorePath, BTreeSet<String>>,
  pub options: DerivationOptions,
  pub structured_attrs: Option<serde_json::Value>,
}

impl Derivation {
  pub fn is_builtin(&self) -> bool {
    self.builder.to_string_lossy().starts_with("builtin:")
  }

  pub fn as_builtin(&self) -> Option<String> {
    self
      .builder
      .to_string_lossy()
      .strip_prefix("builtin:")
      .map(|x| x.to_string())
  }

  pub fn is_fixed(&self) -> bool {
    self.ty.is_fixed()
  }

  pub fn is_impure(&self) -> bool {
    self.ty.is_impure()
  }

  pub fn is_sandboxed(&self) -> bool {
    self.ty.is_sandboxed()
  }

  pub fn outputs_and_opt_paths<S: Store + ?Sized>(
    &self,
    store: &S,
  ) -> Result<BTreeMap<String, (Output, Option<StorePath>)>> {
    let mut out = BTreeMap::new();
    for (name, output) in &self.outputs {
      out.insert(
        name.clone(),
        (output.clone(), output.path(store, &self.name, name)?),
      );
    }
    Ok(out)
  }
}

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Debug)]
pub enum DerivationType {
  /// All output paths are known before the build.
  InputAddressed,
  /// Input-addressed, but the final paths depend on floating inputs and have
  /// not been resolved yet.
  DeferredInputAddressed,
  /// Content hash declared up front; the path is known, the contents are
  /// checked afterwards.
  Fixed,
  /// Output path is a function of whatever the build produces.
  Floating,
  /// Like floating, but impure inputs are tolerated and the result is never
  /// cached by derivation hash.
  Impure,
}

impl DerivationType {
  pub fn is_fixed(self) -> bool {
    matches!(self, Self::Fixed)
  }

  pub fn is_impure(self) -> bool {
    matches!(self, Self::Impure)
  }

  /// Sandboxed derivations get no network and fixed /etc contents. Fixed and
  /// impure derivations are exempt since their output is pinned by hash or
  /// declared impure anyway.
  pub fn is_sandboxed(self) -> bool {
    !matches!(self, Self::Fixed | Self::Impure)
  }

  pub fn is_content_addressed(self) -> bool {
    matches!(self, Self::Fixed | Self::Floating | Self::Impure)
  }
}

impl Default for DerivationType {
  fn default() -> Self {
    Self::InputAddressed
  }
}

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub struct FixedOutputHash {
  pub method: FileIngestionMethod,
  pub hash: Hash,
}

impl FixedOutputHash {
  pub fn method_algo(&self) -> String {
    format!("{}{}", self.method.prefix(), self.hash.ty())
  }

  pub fn store_path<S: Store + ?Sized>(
    &self,
    store: &S,
    drv_name: &str,
    output_name: &str,
  ) -> Result<StorePath> {
    store.make_fixed_output_path(
      self.method,
      self.hash,
      &output_path_name(drv_name, output_name),
      &Default::default(),
      false,
    )
  }
}

#[derive(Debug, Eq, PartialEq, Clone, EnumAsInner)]
pub enum Output {
  InputAddressed(StorePath),
  Fixed(FixedOutputHash),
  Floating(FileIngestionMethod, HashType),
  Deferred,
  Impure(FileIngestionMethod, HashType),
}

impl Output {
  /// The statically known final path of this output, if there is one.
  pub fn path<S: Store + ?Sized>(
    &self,
    store: &S,
    drv_name: &str,
    output_name: &str,
  ) -> Result<Option<StorePath>> {
    match self {
      Self::InputAddressed(p) => Ok(Some(p.clone())),
      Self::Fixed(f) => Ok(Some(f.store_path(store, drv_name, output_name)?)),
      _ => Ok(None),
    }
  }
}

pub fn output_path_name(drv_name: impl AsRef<str>, output_name: impl AsRef<str>) -> String {
  let drv_name = drv_name.as_ref();
  let output_name = output_name.as_ref();
  if output_name == "out" {
    drv_name.to_string()
  } else {
    format!("{}-{}", drv_name, output_name)
  }
}

/// The placeholder string substituted by the build environment for an output
/// whose path is not known until the build is set up.
pub fn hash_placeholder(output_name: &str) -> String {
  format!(
    "/{}",
    Hash::hash(format!("nix-output:{}", output_name), HashType::SHA256).encode(Encoding::Base32)
  )
}

/// Reference restrictions on a single output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputChecks {
  pub max_size: Option<u64>,
  pub max_closure_size: Option<u64>,
  pub allowed_references: Option<BTreeSet<String>>,
  pub allowed_requisites: Option<BTreeSet<String>>,
  pub disallowed_references: BTreeSet<String>,
  pub disallowed_requisites: BTreeSet<String>,
  pub ignore_self_refs: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChecksVariant {
  /// Legacy attributes applying to every output.
  ForAllOutputs(OutputChecks),
  /// Structured `outputChecks`, keyed by output name.
  PerOutput(BTreeMap<String, OutputChecks>),
}

impl Default for OutputChecksVariant {
  fn default() -> Self {
    Self::ForAllOutputs(Default::default())
  }
}

/// Builder-relevant options carried by a derivation, orthogonal to the inputs
/// and outputs themselves.
#[derive(Debug, Clone, Default)]
pub struct DerivationOptions {
  pub no_chroot: bool,
  pub impure_host_deps: BTreeSet<String>,
  pub impure_env_vars: BTreeSet<String>,
  pub pass_as_file: BTreeSet<String>,
  pub unsafe_discard_references: BTreeMap<String, bool>,
  pub export_references_graph: BTreeMap<String, Vec<StorePath>>,
  pub required_system_features: BTreeSet<String>,
  pub additional_sandbox_profile: String,
  pub allow_local_networking: bool,
  pub use_uid_range: bool,
  pub output_checks: OutputChecksVariant,
}

impl DerivationOptions {
  pub fn checks_for<'a>(&'a self, output_name: &str) -> Option<&'a OutputChecks> {
    match &self.output_checks {
      OutputChecksVariant::ForAllOutputs(c) => Some(c),
      OutputChecksVariant::PerOutput(m) => m.get(output_name),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn placeholder_is_stable() {
    assert_eq!(hash_placeholder("out"), hash_placeholder("out"));
    assert_ne!(hash_placeholder("out"), hash_placeholder("dev"));
    // placeholders must be exactly one hash-part wide plus the leading slash
    assert_eq!(hash_placeholder("out").len(), 1 + 52);
  }

  #[test]
  fn output_names() {
    assert_eq!(output_path_name("hello", "out"), "hello");
    assert_eq!(output_path_name("hello", "dev"), "hello-dev");
  }
}
