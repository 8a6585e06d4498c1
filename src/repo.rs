//! Git-backed snapshot log for the output directory.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use git2::{Commit, ConfigLevel, ErrorCode, IndexAddOption, Oid, Repository, Signature};

/// Commit-on-demand record of file additions and removals.
pub trait SnapshotLog {
    fn stage(&mut self, file_name: &str) -> Result<()>;

    /// Stage every file ending in `extension`.
    fn stage_all(&mut self, extension: &str) -> Result<()>;

    /// Drop `file_name` from the next snapshot.
    fn unstage(&mut self, file_name: &str) -> Result<()>;

    /// Commit if the index differs from the last snapshot, returning the number of changed paths.
    fn commit(&mut self, message: &str) -> Result<usize>;
}

/// A git repository owned by this tool, or a dry run over one that is not.
pub struct GitVaultRepo {
    repo: Repository,
    name: String,
    dry_run: bool,
    msg_prefix: &'static str,
}

impl GitVaultRepo {
    /// Open the repository in `dir`, creating and marking it if none exists.
    ///
    /// A new repository ignores everything except `.gitignore` and files with one of
    /// `extensions`. An existing repository without the `<name>.vault` marker is never
    /// written to.
    pub fn open(name: &str, dir: &Path, extensions: &[&str]) -> Result<Self> {
        let marker = format!("{name}.vault");

        let repo = match Repository::open(dir) {
            Ok(repo) => repo,
            Err(err) if err.code() == ErrorCode::NotFound => {
                let repo = Repository::init(dir)
                    .with_context(|| format!("failed to create git repository in {}", dir.display()))?;
                repo.config()
                    .and_then(|config| config.open_level(ConfigLevel::Local))
                    .and_then(|mut config| config.set_bool(&marker, true))
                    .context("failed to mark repository")?;
                add_gitignore(&repo, extensions)?;
                println!("Created {name} repository");
                repo
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to open git repository in {}", dir.display()))
            }
        };

        let is_vault = repo
            .config()
            .and_then(|config| config.get_bool(&marker))
            .unwrap_or(false);

        if !is_vault {
            println!(
                "WARNING: current git repository was not created by {name}, no changes will be committed"
            );
        }

        Ok(Self {
            repo,
            name: name.to_string(),
            dry_run: !is_vault,
            msg_prefix: if is_vault { "" } else { "[DRY RUN] " },
        })
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

impl SnapshotLog for GitVaultRepo {
    fn stage(&mut self, file_name: &str) -> Result<()> {
        println!("{}Adding {} to {} repository", self.msg_prefix, file_name, self.name);
        if self.dry_run {
            return Ok(());
        }

        let mut index = self.repo.index()?;
        index
            .add_path(Path::new(file_name))
            .with_context(|| format!("failed to stage {file_name}"))?;
        index.write()?;
        Ok(())
    }

    fn stage_all(&mut self, extension: &str) -> Result<()> {
        println!(
            "{}Adding all {} files to {} repository",
            self.msg_prefix, extension, self.name
        );
        if self.dry_run {
            return Ok(());
        }

        let mut index = self.repo.index()?;
        index
            .add_all([format!("*{extension}")].iter(), IndexAddOption::DEFAULT, None)
            .with_context(|| format!("failed to stage {extension} files"))?;
        index.write()?;
        Ok(())
    }

    fn unstage(&mut self, file_name: &str) -> Result<()> {
        println!(
            "{}Removing {} from {} repository",
            self.msg_prefix, file_name, self.name
        );
        if self.dry_run {
            return Ok(());
        }

        let mut index = self.repo.index()?;
        index
            .remove_path(Path::new(file_name))
            .with_context(|| format!("failed to unstage {file_name}"))?;
        index.write()?;
        Ok(())
    }

    fn commit(&mut self, message: &str) -> Result<usize> {
        if self.dry_run {
            println!("{}Committing revision(s) to {} repository", self.msg_prefix, self.name);
            return Ok(0);
        }

        let index = self.repo.index()?;
        let head = head_commit(&self.repo)?;
        let head_tree = head.as_ref().map(Commit::tree).transpose()?;
        let changes = self
            .repo
            .diff_tree_to_index(head_tree.as_ref(), Some(&index), None)
            .context("failed to compare index with HEAD")?
            .deltas()
            .len();

        if changes == 0 {
            println!("No revisions to commit to {} repository", self.name);
            return Ok(0);
        }

        commit_index(&self.repo, message)?;
        println!("Committed {} revision(s) to {} repository", changes, self.name);
        Ok(changes)
    }
}

fn add_gitignore(repo: &Repository, extensions: &[&str]) -> Result<()> {
    let workdir = repo
        .workdir()
        .ok_or_else(|| anyhow!("repository has no working directory"))?;

    let mut content = String::from("*\n!.gitignore\n");
    for extension in extensions {
        content.push_str(&format!("!*{extension}\n"));
    }
    fs::write(workdir.join(".gitignore"), content).context("failed to write .gitignore")?;

    let mut index = repo.index()?;
    index.add_path(Path::new(".gitignore"))?;
    index.write()?;
    commit_index(repo, "Add .gitignore")?;
    Ok(())
}

fn head_commit(repo: &Repository) -> Result<Option<Commit<'_>>> {
    match repo.head() {
        Ok(head) => Ok(Some(head.peel_to_commit()?)),
        Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => Ok(None),
        Err(err) => Err(err).context("failed to resolve HEAD"),
    }
}

fn commit_index(repo: &Repository, message: &str) -> Result<Oid> {
    let mut index = repo.index()?;
    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;

    let signature = match repo.signature() {
        Ok(signature) => signature,
        Err(_) => Signature::now("gcardvault", "gcardvault@localhost")?,
    };

    let parent = head_commit(repo)?;
    let parents: Vec<&Commit> = parent.iter().collect();

    repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
        .with_context(|| format!("failed to commit '{message}'"))
}
