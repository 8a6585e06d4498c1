//! Sync engine for incremental Google Contacts export.
//!
//! This module orchestrates one run: enumerate the remote contacts, optionally
//! clean files for contacts that disappeared, download only the vCards whose
//! etag changed (or whose file is missing), write them, and record the result
//! in the snapshot log.

use std::collections::{HashMap, HashSet};
use std::fs;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::Config;
use crate::contact::{Contact, VCARD_EXTENSION};
use crate::etags::EtagCache;
use crate::remote::{carddav, people, ContactsRemote};
use crate::repo::SnapshotLog;
use crate::vdir;

pub const COMMIT_MESSAGE: &str = "gcardvault sync";

/// Result of a sync operation
#[derive(Debug, Default)]
pub struct SyncResult {
    /// Number of contacts enumerated remotely
    pub remote_count: usize,
    /// Number of contacts whose file was already current
    pub up_to_date_count: usize,
    /// Number of vCard files written
    pub saved_count: usize,
    /// Number of files renamed after a display-name change
    pub renamed_count: usize,
    /// Number of files removed by `clean`
    pub removed_count: usize,
    /// Number of paths recorded in the snapshot commit
    pub committed_count: usize,
}

pub struct SyncEngine<'a> {
    config: &'a Config,
    remote: &'a dyn ContactsRemote,
    repo: Option<&'a mut dyn SnapshotLog>,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        config: &'a Config,
        remote: &'a dyn ContactsRemote,
        repo: Option<&'a mut dyn SnapshotLog>,
    ) -> Self {
        Self {
            config,
            remote,
            repo,
        }
    }

    /// Run the sync operation
    pub fn sync(&mut self, token: &str) -> Result<SyncResult> {
        let mut result = SyncResult::default();

        let contacts = people::list_contacts(self.remote, token, &self.config.user)?;
        result.remote_count = contacts.len();
        log::info!("{} contact(s) found for {}", contacts.len(), self.config.user);

        if self.config.clean {
            self.clean_output_dir(&contacts, &mut result)?;
        }

        let mut etags = EtagCache::load(&self.config.conf_dir)?;
        log::debug!("{} etag(s) cached", etags.len());
        let to_update = self.filter_contacts_to_update(&contacts, &etags, &mut result);

        if !to_update.is_empty() {
            let vcards = self.download_vcards(token, &to_update)?;
            self.save_vcards(&to_update, &vcards, &mut etags, &mut result)?;

            if let Some(repo) = self.repo.as_deref_mut() {
                repo.stage_all(VCARD_EXTENSION)?;
            }
        }

        if let Some(repo) = self.repo.as_deref_mut() {
            result.committed_count = repo.commit(COMMIT_MESSAGE)?;
        }

        Ok(result)
    }

    /// Delete files whose contact id is no longer in the remote set.
    fn clean_output_dir(&mut self, contacts: &[Contact], result: &mut SyncResult) -> Result<()> {
        let remote_ids: HashSet<String> = contacts.iter().map(Contact::key).collect();

        let mut stale: Vec<String> = vdir::scan(&self.config.output_dir)?
            .into_iter()
            .filter(|(id, _)| !remote_ids.contains(id))
            .map(|(_, file_name)| file_name)
            .collect();
        stale.sort();

        for file_name in stale {
            let path = self.config.output_dir.join(&file_name);
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
            if let Some(repo) = self.repo.as_deref_mut() {
                repo.unstage(&file_name)?;
            }
            println!("Removed file '{}'", file_name);
            result.removed_count += 1;
        }

        Ok(())
    }

    /// Contacts whose etag changed or whose canonical file is missing.
    ///
    /// The cache is only read here; entries are recorded once the file is written.
    fn filter_contacts_to_update(
        &self,
        contacts: &[Contact],
        etags: &EtagCache,
        result: &mut SyncResult,
    ) -> Vec<Contact> {
        let mut to_update = Vec::new();

        for contact in contacts {
            let path = self.config.output_dir.join(&contact.file_name);
            if path.exists() && !etags.is_changed(&contact.id, &contact.etag) {
                result.up_to_date_count += 1;
                continue;
            }
            to_update.push(contact.clone());
        }

        println!("{} contact(s) are up to date", result.up_to_date_count);
        println!("{} contact(s) need to be updated", to_update.len());

        to_update
    }

    fn download_vcards(
        &self,
        token: &str,
        contacts: &[Contact],
    ) -> Result<HashMap<String, String>> {
        println!("Downloading vCards for {} contact(s)", contacts.len());

        let pb = self.create_progress_bar(contacts.len() as u64, "Downloading");
        let vcards = carddav::fetch_vcards(self.remote, token, &self.config.user, contacts, |n| {
            pb.inc(n as u64)
        });
        pb.finish_and_clear();

        vcards
    }

    fn save_vcards(
        &mut self,
        contacts: &[Contact],
        vcards: &HashMap<String, String>,
        etags: &mut EtagCache,
        result: &mut SyncResult,
    ) -> Result<()> {
        let files_on_disk = vdir::scan(&self.config.output_dir)?;

        for contact in contacts {
            let Some(vcard) = vcards.get(&contact.carddav_href) else {
                continue;
            };
            let target = self.config.output_dir.join(&contact.file_name);

            if let Some(existing) = files_on_disk.get(&contact.key()) {
                if existing != &contact.file_name {
                    let existing_path = self.config.output_dir.join(existing);
                    fs::rename(&existing_path, &target).with_context(|| {
                        format!(
                            "failed to rename {} to {}",
                            existing_path.display(),
                            target.display()
                        )
                    })?;
                    if let Some(repo) = self.repo.as_deref_mut() {
                        repo.unstage(existing)?;
                    }
                    log::info!("renamed {} to {}", existing, contact.file_name);
                    result.renamed_count += 1;
                }
            }

            vdir::write_atomic(&target, vcard.as_bytes())
                .with_context(|| format!("failed to write {}", target.display()))?;
            etags.test_for_change_and_save(&contact.id, &contact.etag)?;

            println!("Saved contact '{}' to {}", contact.name, contact.file_name);
            result.saved_count += 1;
        }

        Ok(())
    }

    /// Create a progress bar
    fn create_progress_bar(&self, total: u64, message: &str) -> ProgressBar {
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        pb.set_message(message.to_string());
        pb
    }
}
