//! Case-directory helpers: recursive copies, atomic writes and `controlDict`
//! editing.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

/// Recursively copy `src` into `dst`, creating `dst` if needed.
///
/// File permissions are preserved, so run scripts stay executable.
pub fn copy_case(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("Failed to create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("Failed to read {}", src.display()))? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_case(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "Failed to copy {} to {}",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }
    }
    Ok(())
}

/// Replace `dst` with a fresh copy of `src`.
pub fn replace_case(src: &Path, dst: &Path) -> Result<()> {
    if dst.exists() {
        fs::remove_dir_all(dst).with_context(|| format!("Failed to remove {}", dst.display()))?;
    }
    copy_case(src, dst)
}

/// Write `contents` to `path` through a sibling temp file and a rename, so
/// readers never observe a half-written file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, contents).with_context(|| format!("Failed to write {}", path.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Value of `key` in an OpenFOAM dictionary file, without the trailing `;`.
pub fn read_dict_entry(path: &Path, key: &str) -> Result<Option<String>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(text.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        (tokens.next() == Some(key))
            .then(|| tokens.collect::<Vec<_>>().join(" "))
            .map(|value| value.trim_end_matches(';').trim().to_string())
    }))
}

/// Set `key` to `value` in an OpenFOAM dictionary file.
///
/// The first line whose first token is `key` is rewritten as `key value;`;
/// a missing key is an error.
pub fn set_dict_entry(path: &Path, key: &str, value: &str) -> Result<()> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;

    let mut found = false;
    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let is_key = line.split_whitespace().next().map(|t| t.trim_end_matches(';')) == Some(key);
        if is_key && !found {
            found = true;
            lines.push(format!("{key:<16}{value};"));
        } else {
            lines.push(line.to_string());
        }
    }
    if !found {
        bail!("entry '{key}' not found in {}", path.display());
    }

    let mut out = lines.join("\n");
    if text.ends_with('\n') {
        out.push('\n');
    }
    write_atomic(path, out.as_bytes())
}
