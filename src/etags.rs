//! Persistent id -> etag cache stored as `<id>\t<etag>` lines in the conf dir.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::Error;
use crate::vdir;

const ETAG_CACHE_FILE_NAME: &str = ".etags";

#[derive(Debug)]
pub struct EtagCache {
    path: PathBuf,
    cache: BTreeMap<String, String>,
}

impl EtagCache {
    /// Load the cache from `conf_dir`. A missing file is an empty cache.
    pub fn load(conf_dir: &Path) -> Result<Self> {
        let path = conf_dir.join(ETAG_CACHE_FILE_NAME);
        let cache = read_cache_file(&path)?;
        log::debug!("loaded {} etag(s) from {}", cache.len(), path.display());
        Ok(Self { path, cache })
    }

    /// Whether `etag` differs from the cached value for `id`, without touching the cache.
    pub fn is_changed(&self, id: &str, etag: &str) -> bool {
        self.cache.get(&normalize_key(id)) != Some(&normalize_value(etag))
    }

    /// Record `etag` for `id`, returning whether it differed from the cached value.
    ///
    /// On a change the whole cache is rewritten before returning.
    pub fn test_for_change_and_save(&mut self, id: &str, etag: &str) -> Result<bool> {
        let key = normalize_key(id);
        let value = normalize_value(etag);

        if self.cache.get(&key) == Some(&value) {
            return Ok(false);
        }

        self.cache.insert(key, value);
        self.write_cache_file()?;
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    fn write_cache_file(&self) -> Result<()> {
        let mut buffer = String::new();
        for (key, value) in &self.cache {
            buffer.push_str(key);
            buffer.push('\t');
            buffer.push_str(value);
            buffer.push('\n');
        }
        vdir::write_atomic(&self.path, buffer.as_bytes())
            .with_context(|| format!("failed to save etag cache {}", self.path.display()))
    }
}

fn read_cache_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let mut cache = BTreeMap::new();
    if !path.exists() {
        return Ok(cache);
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read etag cache {}", path.display()))?;

    for (index, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut tokens = line.split_whitespace();
        match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(key), Some(value), None) => {
                cache.insert(key.to_string(), value.to_string());
            }
            _ => {
                return Err(Error::CorruptEtagCache {
                    path: path.to_path_buf(),
                    line: index + 1,
                }
                .into())
            }
        }
    }

    Ok(cache)
}

fn normalize_key(id: &str) -> String {
    collapse_whitespace(id).to_lowercase()
}

fn normalize_value(etag: &str) -> String {
    collapse_whitespace(etag.trim().trim_matches('"'))
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join("_")
}
