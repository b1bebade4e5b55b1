//! Scratch-path bookkeeping. Outputs whose final location either is unknown
//! or cannot be overwritten are built somewhere else and rewritten afterwards;
//! both substitution tables are managed here.

use std::borrow::Cow;
use std::collections::HashMap;

use super::{DerivationBuilder, PathStatus};
use crate::prelude::*;
use crate::store::build::error::BuildError;
use crate::store::derivation::{hash_placeholder, output_path_name};
use crate::store::settings::BuildMode;

impl DerivationBuilder {
  /// A deterministic scratch location for an output with no known final
  /// path. The bogus path type cannot collide with any real store path.
  pub(crate) fn fallback_from_output(&self, output_name: &str) -> Result<StorePath> {
    self.store.make_store_path(
      &format!("rewrite:{}:name:{}", self.drv_path, output_name),
      Hash::zeroes(HashType::SHA256),
      &output_path_name(&self.drv.name, output_name),
    )
  }

  /// A scratch location displacing a known-but-occupied final path.
  pub(crate) fn fallback_from_path(&self, path: &StorePath) -> Result<StorePath> {
    self.store.make_store_path(
      &format!("rewrite:{}:{}", self.drv_path, path),
      Hash::zeroes(HashType::SHA256),
      path.name(),
    )
  }

  /// Whether valid outputs must be displaced to scratch paths instead of
  /// being hidden by the sandbox.
  pub(crate) fn needs_hash_rewrite(&self) -> bool {
    if cfg!(target_os = "linux") {
      !self.use_chroot
    } else {
      // Darwin rewrites even when sandboxed; the profile cannot hide paths.
      true
    }
  }

  /// Decide the store path each output is built at, install the placeholder
  /// substitutions, and displace outputs whose final paths are occupied.
  pub(crate) fn make_scratch_outputs(&mut self) -> Result<()> {
    for (output_name, status) in &self.initial_outputs {
      let scratch_path = match &status.known {
        None => self.fallback_from_output(output_name)?,
        Some(k) => {
          if !self.needs_hash_rewrite()
            || k.status == PathStatus::Absent
            || (self.build_mode != BuildMode::Repair && k.status != PathStatus::Valid)
          {
            k.path.clone()
          } else {
            self.fallback_from_path(&k.path)?
          }
        }
      };

      self.input_rewrites.insert(
        hash_placeholder(output_name),
        self.store.print_store_path(&scratch_path),
      );
      self
        .scratch_outputs
        .insert(output_name.clone(), scratch_path.clone());

      let fixed_final_path = match &status.known {
        None => continue,
        Some(k) => k.path.clone(),
      };

      if fixed_final_path == scratch_path {
        continue;
      }

      // the scratch location must be ours alone
      rm_rf::ensure_removed(self.store.to_real_path(&scratch_path))?;

      self
        .input_rewrites
        .insert(fixed_final_path.hash_part(), scratch_path.hash_part());

      self
        .redirected_outputs
        .insert(fixed_final_path, scratch_path);
    }
    Ok(())
  }

  /// The scratch path for an output, or a build error naming it.
  pub(crate) fn scratch_output(&self, output_name: &str) -> Result<&StorePath> {
    self.scratch_outputs.get(output_name).ok_or_else(|| {
      BuildError::new(format!(
        "builder for '{}' has no scratch output for '{}'",
        self.store.print_store_path(&self.drv_path),
        output_name
      ))
    })
  }
}

/// Rewrite every value of an environment map, preserving order.
pub(crate) fn rewrite_env(
  env: &std::collections::BTreeMap<String, String>,
  rewrites: &HashMap<String, String>,
) -> Vec<(String, String)> {
  env
    .iter()
    .map(|(k, v)| (k.clone(), rewrite_strings(v, rewrites).into_owned()))
    .collect()
}

/// Apply every substitution to `s`. All hash rewrites map equal-length
/// strings, so offsets into rewritten data stay valid.
pub fn rewrite_strings<'a>(s: &'a str, rewrites: &HashMap<String, String>) -> Cow<'a, str> {
  let mut s = Cow::Borrowed(s);
  for (from, to) in rewrites {
    if from == to || !s.contains(&**from) {
      continue;
    }
    s = Cow::Owned(s.replace(&**from, to));
  }
  s
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rewrites_apply_everywhere() {
    let mut map = HashMap::new();
    map.insert("aaaa".to_string(), "bbbb".to_string());
    map.insert("cccc".to_string(), "dddd".to_string());
    assert_eq!(rewrite_strings("aaaa-cccc-aaaa", &map), "bbbb-dddd-bbbb");
  }

  #[test]
  fn rewriting_preserves_length() {
    let mut map = HashMap::new();
    map.insert("0123456789".to_string(), "abcdefghij".to_string());
    let input = "x0123456789y0123456789z";
    let out = rewrite_strings(input, &map);
    assert_eq!(out.len(), input.len());
  }

  #[test]
  fn borrowed_when_no_match() {
    let map = HashMap::new();
    assert!(matches!(rewrite_strings("unchanged", &map), Cow::Borrowed(_)));
  }
}
