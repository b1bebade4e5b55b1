//! Assembly of the environment handed to the builder: the fixed variables,
//! `passAsFile` spill files, structured attributes, and reference-graph
//! exports. Everything written here goes through the input rewrite table so
//! placeholders and displaced outputs resolve to scratch paths.

use std::collections::HashSet;
use std::fs;

use super::rewrite::rewrite_strings;
use super::DerivationBuilder;
use crate::prelude::*;
use crate::store::build::error::BuildError;
use crate::store::settings::settings;
use crate::store::StorePathSet;

impl DerivationBuilder {
  pub(crate) fn init_env(&mut self) -> Result<()> {
    self.env.clear();

    // Shells fill in PATH with defaults when it's unset, which we don't
    // want, so point it somewhere that doesn't exist.
    self.env.insert("PATH".into(), "/path-not-set".into());

    // HOME must be set but unusable, else tools fall back to /etc/passwd
    // lookups to find a home directory.
    self.env.insert("HOME".into(), "/homeless-shelter".into());

    self.env.insert(
      "NIX_STORE".into(),
      self.store.store_path().display().to_string(),
    );

    self
      .env
      .insert("NIX_BUILD_CORES".into(), settings().build_cores.to_string());

    self.init_tmp_dir()?;

    // Tells fetchers the output hash is checked by us, so they can skip
    // their own verification.
    if self.drv.is_fixed() {
      self.env.insert("NIX_OUTPUT_CHECKED".into(), "1".into());
    }

    // Only non-sandboxed derivations may read impure variables from the
    // caller's environment. Their output is pinned by hash, so impurity
    // cannot leak into the result.
    if !self.drv.is_sandboxed() {
      for var in &self.drv.options.impure_env_vars {
        self
          .env
          .insert(var.clone(), std::env::var(var).unwrap_or_default());
      }
    }

    self.env.insert("NIX_LOG_FD".into(), "2".into());
    self.env.insert("TERM".into(), "xterm-256color".into());

    Ok(())
  }

  fn init_tmp_dir(&mut self) -> Result<()> {
    let tmp_dir = self.tmp_dir.clone().expect("tmp dir not yet created");
    let tmpdir_in_sandbox = self.tmp_dir_in_sandbox.clone();

    if self.drv.structured_attrs.is_none() {
      let pass_as_file: HashSet<&str> = self
        .drv
        .options
        .pass_as_file
        .iter()
        .map(|x| x.as_str())
        .collect();

      for (key, value) in &self.drv.env {
        if pass_as_file.contains(key.as_str()) {
          let h = Hash::hash(key, HashType::SHA256);
          let filename = format!(".attr-{}", h.encode(Encoding::Base32));
          let filepath = tmp_dir.join(&filename);
          fs::write(&filepath, rewrite_strings(value, &self.input_rewrites).as_bytes())?;
          self.chown_to_builder(&filepath)?;
          self.env.insert(
            format!("{}Path", key),
            tmpdir_in_sandbox.join(filename).display().to_string(),
          );
        } else {
          self.env.insert(key.clone(), value.clone());
        }
      }
    }

    self.env.insert(
      "NIX_BUILD_TOP".into(),
      tmpdir_in_sandbox.display().to_string(),
    );
    for tmp in &["TMPDIR", "TEMPDIR", "TMP", "TEMP"] {
      self
        .env
        .insert((*tmp).into(), tmpdir_in_sandbox.display().to_string());
    }

    // Set PWD explicitly: in a chroot the kernel can't always report a
    // usable cwd to the builder.
    self
      .env
      .insert("PWD".into(), tmpdir_in_sandbox.display().to_string());

    Ok(())
  }

  pub(crate) fn write_structured_attrs(&mut self) -> Result<()> {
    let json = match &self.drv.structured_attrs {
      Some(v) => v.clone(),
      None => return Ok(()),
    };

    let mut json = json;
    if let Some(outputs) = json.get_mut("outputs") {
      // the placeholder always has a rewrite, covering both known and
      // unknown output paths
      let mut rewritten = serde_json::Map::new();
      if let Some(map) = outputs.as_object() {
        for (name, v) in map {
          let s = v.as_str().unwrap_or_default();
          rewritten.insert(
            name.clone(),
            serde_json::Value::String(rewrite_strings(s, &self.input_rewrites).into_owned()),
          );
        }
      }
      *outputs = serde_json::Value::Object(rewritten);
    }

    let tmp_dir = self.tmp_dir.clone().expect("tmp dir not yet created");

    let json_sh = structured_attrs_shell(&json)?;
    fs::write(
      tmp_dir.join(".attrs.sh"),
      rewrite_strings(&json_sh, &self.input_rewrites).as_bytes(),
    )?;
    self.chown_to_builder(tmp_dir.join(".attrs.sh"))?;
    self.env.insert(
      "NIX_ATTRS_SH_FILE".into(),
      self.tmp_dir_in_sandbox.join(".attrs.sh").display().to_string(),
    );

    fs::write(
      tmp_dir.join(".attrs.json"),
      rewrite_strings(&json.to_string(), &self.input_rewrites).as_bytes(),
    )?;
    self.chown_to_builder(tmp_dir.join(".attrs.json"))?;
    self.env.insert(
      "NIX_ATTRS_JSON_FILE".into(),
      self
        .tmp_dir_in_sandbox
        .join(".attrs.json")
        .display()
        .to_string(),
    );

    Ok(())
  }

  /// Write closure registration info for each requested reference graph into
  /// the build directory.
  pub(crate) fn export_references_graph(&mut self) -> Result<()> {
    let tmp_dir = self.tmp_dir.clone().expect("tmp dir not yet created");

    for (file_name, roots) in &self.drv.options.export_references_graph {
      if file_name.contains('/') || file_name.is_empty() {
        return Err(BuildError::new(format!(
          "invalid file name '{}' in 'exportReferencesGraph'",
          file_name
        )));
      }
      let mut closure = StorePathSet::new();
      for root in roots {
        self.store.compute_fs_closure(root, &mut closure)?;
      }
      let registration = self.store.make_validity_registration(&closure)?;
      let p = tmp_dir.join(file_name);
      fs::write(&p, registration)?;
      self.chown_to_builder(&p)?;
    }
    Ok(())
  }
}

/// Project structured attributes onto shell syntax. Only shapes that map
/// cleanly are exported: scalars, arrays of scalars, and flat string maps.
fn structured_attrs_shell(json: &serde_json::Value) -> Result<String> {
  use serde_json::Value;

  fn scalar(v: &Value) -> Option<String> {
    match v {
      Value::String(s) => Some(shell_quote(s)),
      Value::Number(n) => Some(n.to_string()),
      Value::Bool(b) => Some(if *b { "1".into() } else { "".into() }),
      _ => None,
    }
  }

  let obj = json
    .as_object()
    .ok_or_else(|| anyhow!("structured attributes must be a JSON object"))?;

  let mut out = String::new();
  for (key, value) in obj {
    if !is_valid_shell_name(key) {
      continue;
    }
    match value {
      Value::String(_) | Value::Number(_) | Value::Bool(_) => {
        out.push_str(&format!(
          "declare {}={}\n",
          key,
          scalar(value).expect("scalar")
        ));
      }
      Value::Array(xs) => {
        let items: Option<Vec<String>> = xs.iter().map(scalar).collect();
        if let Some(items) = items {
          out.push_str(&format!("declare -a {}=({})\n", key, items.join(" ")));
        }
      }
      Value::Object(m) => {
        let items: Option<Vec<String>> = m
          .iter()
          .map(|(k, v)| scalar(v).map(|s| format!("[{}]={}", shell_quote(k), s)))
          .collect();
        if let Some(items) = items {
          out.push_str(&format!("declare -A {}=({})\n", key, items.join(" ")));
        }
      }
      Value::Null => {}
    }
  }
  Ok(out)
}

fn is_valid_shell_name(s: &str) -> bool {
  !s.is_empty()
    && s.chars().next().map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
    && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn shell_quote(s: &str) -> String {
  format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn shell_projection() {
    let json = serde_json::json!({
      "name": "hello",
      "cores": 4,
      "doCheck": true,
      "outputs": ["out", "dev"],
      "env": {"A": "x y", "B": 2},
      "complex": [{"nested": true}],
      "bad-name": "skipped"
    });
    let sh = structured_attrs_shell(&json).unwrap();
    assert!(sh.contains("declare name='hello'\n"));
    assert!(sh.contains("declare cores=4\n"));
    assert!(sh.contains("declare doCheck=1\n"));
    assert!(sh.contains("declare -a outputs=('out' 'dev')\n"));
    assert!(sh.contains("declare -A env=(['A']='x y' ['B']=2)\n"));
    // arrays of objects have no shell shape
    assert!(!sh.contains("complex"));
    assert!(!sh.contains("bad-name"));
  }

  #[test]
  fn quoting_survives_single_quotes() {
    assert_eq!(shell_quote("it's"), r"'it'\''s'");
  }
}
