//! Builders that run in-process instead of being `execve`d. They execute in
//! the sandbox child after privileges have been dropped and `_exit`
//! afterwards, so they may not assume any ambient state.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use curl::easy::Easy;

use crate::nar;
use crate::prelude::*;

/// `builtin:fetchurl`: download `url` into the declared output, optionally
/// unpacking an archive stream or marking the result executable.
pub fn builtin_fetchurl(env: &BTreeMap<String, String>) -> Result<()> {
  let getenv = |x: &'static str| {
    env
      .get(x)
      .ok_or_else(|| anyhow!("attribute '{}' missing", x))
  };

  let out_path = getenv("out")?;
  let url = getenv("url")?.clone();
  let unpack = env.get("unpack").map_or(false, |x| x == "1");

  let mut handle = Easy::new();
  handle.url(&url)?;
  handle.follow_location(true)?;
  handle.fail_on_error(true)?;
  if let Some(netrc) = &crate::store::settings::settings().netrc_file {
    if netrc.exists() {
      handle.netrc(curl::easy::NetRc::Optional)?;
    }
  }

  let mut contents = vec![];
  {
    let mut transfer = handle.transfer();
    transfer.write_function(|data| {
      contents.extend_from_slice(data);
      Ok(data.len())
    })?;
    transfer
      .perform()
      .with_context(|| format!("unable to download '{}'", url))?;
  }

  if unpack {
    nar::restore_path(out_path, &contents[..])?
  } else {
    let mut out = File::create(out_path)?;
    out.write_all(&contents)?;
  }

  if env.get("executable").map_or(false, |x| x == "1") {
    crate::store::build::chroot::chmod(Path::new(out_path), 0o755)?;
  }

  Ok(())
}
