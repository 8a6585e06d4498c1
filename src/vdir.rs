use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use crate::contact::VCARD_EXTENSION;

/// Map each contact id found in the output directory to the file holding it.
///
/// The id is the last `_`-separated segment of the lowercased file stem. Files are
/// listed non-recursively; if two files decode to the same id the last one listed wins.
pub fn scan(output_dir: &Path) -> Result<HashMap<String, String>> {
    let mut files_on_disk = HashMap::new();

    for path in list_vcf_files(output_dir)? {
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            log::warn!("skipping non UTF-8 file name {}", path.display());
            continue;
        };

        let lowered = file_name.to_lowercase();
        let stem = lowered
            .strip_suffix(VCARD_EXTENSION)
            .unwrap_or(lowered.as_str());
        let id = stem.rsplit('_').next().unwrap_or(stem);

        files_on_disk.insert(id.to_string(), file_name.to_string());
    }

    Ok(files_on_disk)
}

pub fn list_vcf_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("failed to read directory {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_file()
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| !name.starts_with('.') && name.ends_with(VCARD_EXTENSION))
                .unwrap_or(false)
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub fn write_atomic(target: &Path, data: &[u8]) -> Result<()> {
    write_atomic_with(target, data, false)
}

/// Like [`write_atomic`], but the file is readable by its owner only from the moment it exists.
pub fn write_atomic_private(target: &Path, data: &[u8]) -> Result<()> {
    write_atomic_with(target, data, true)
}

fn write_atomic_with(target: &Path, data: &[u8], private: bool) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| anyhow!("target path has no parent: {}", target.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent dir {}", parent.display()))?;

    let mut temp_path = PathBuf::new();
    let mut counter: u32 = 0;
    loop {
        let name = target
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("gcardvault");
        let candidate = if counter == 0 {
            format!(".{name}.tmp")
        } else {
            format!(".{name}.{counter}.tmp")
        };
        temp_path = parent.join(candidate);
        if !temp_path.exists() {
            break;
        }
        counter += 1;
    }

    {
        use std::fs::OpenOptions;
        use std::io::Write;

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        if private {
            owner_only(&mut options);
        }

        let mut file = options
            .open(&temp_path)
            .with_context(|| {
                format!(
                    "failed to create temporary file {} for atomic write",
                    temp_path.display()
                )
            })?;

        file.write_all(data)
            .with_context(|| format!("failed to write temporary file {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync temporary file {}", temp_path.display()))?;
    }

    fs::rename(&temp_path, target).with_context(|| {
        format!(
            "failed to rename temporary file {} to {}",
            temp_path.display(),
            target.display()
        )
    })?;

    if let Ok(dir_file) = fs::File::open(parent) {
        let _ = dir_file.sync_all();
    }

    Ok(())
}

#[cfg(unix)]
fn owner_only(options: &mut fs::OpenOptions) {
    use std::os::unix::fs::OpenOptionsExt;
    options.mode(0o600);
}

#[cfg(not(unix))]
fn owner_only(_options: &mut fs::OpenOptions) {}
