use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::info;
use walkdir::WalkDir;

use crate::error::{Result, SupervisorError};

pub const VERSION_FILE: &str = "app_version";
pub const GENESIS_FILE: &str = "genesis.json";
pub const CONFIG_FILE: &str = "config.toml";

/// Chains with this id are throwaway local testnets; their genesis is never
/// compared against the template.
pub const LOCAL_CHAIN_ID: &str = "local";

/// Two versions are compatible unless their major component differs.
/// Anything that does not parse as `major.minor.patch` is incompatible.
pub fn versions_compatible(existing: &str, current: &str) -> bool {
    match (major_of(existing), major_of(current)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn major_of(version: &str) -> Option<u64> {
    let version = version.trim().trim_start_matches('v');
    let core = version.split(['-', '+']).next()?;
    let mut parts = core.split('.');
    let major = parts.next()?.parse().ok()?;
    for _ in 0..2 {
        parts.next()?.parse::<u64>().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(major)
}

/// The local state root and the network template it is seeded from.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
    template: PathBuf,
    app_version: String,
}

impl DataDir {
    pub fn new(root: PathBuf, template: PathBuf, app_version: impl Into<String>) -> Self {
        Self {
            root,
            template,
            app_version: app_version.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Makes sure the state root is usable by this app version and network.
    /// Returns `true` when the root was (re)initialized from the template.
    pub fn ensure(&self) -> Result<bool> {
        if !exists(&self.root)? {
            return self.initialize().map(|_| true);
        }
        info!(root = %self.root.display(), "root exists");

        let version_path = self.root.join(VERSION_FILE);
        if !exists(&version_path)? {
            self.backup()?;
            return self.initialize().map(|_| true);
        }

        let existing_version = fs::read_to_string(&version_path)
            .map_err(|err| SupervisorError::io("cannot read app_version", err))?;
        if !versions_compatible(&existing_version, &self.app_version) {
            info!(
                existing = existing_version.trim(),
                current = %self.app_version,
                "data from incompatible app version"
            );
            self.backup()?;
            return self.initialize().map(|_| true);
        }
        info!("configs are compatible with current app version");

        if self.genesis_matches()? {
            return Ok(false);
        }
        info!("genesis has changed");
        self.backup()?;
        self.initialize().map(|_| true)
    }

    fn genesis_matches(&self) -> Result<bool> {
        let existing = fs::read_to_string(self.root.join(GENESIS_FILE))
            .map_err(SupervisorError::GenesisUnreadable)?;
        let parsed: Value = serde_json::from_str(&existing)
            .map_err(|err| SupervisorError::GenesisInvalid(err.to_string()))?;
        if parsed.get("chain_id").and_then(Value::as_str) == Some(LOCAL_CHAIN_ID) {
            return Ok(true);
        }

        let template_genesis = self.template.join(GENESIS_FILE);
        let specified = fs::read_to_string(&template_genesis).map_err(|err| {
            SupervisorError::NetworkTemplate {
                path: template_genesis.clone(),
                reason: err.to_string(),
            }
        })?;
        Ok(existing.trim() == specified.trim())
    }

    /// Moves the root aside to the first free `<root>_backup_<n>`.
    pub fn backup(&self) -> Result<PathBuf> {
        let target = next_backup_path(&self.root)?;
        self.backup_into(&target)?;
        Ok(target)
    }

    /// Claims `target` with an exclusive `create_dir`, then moves the root's
    /// entries into it. An existing target is never merged into.
    fn backup_into(&self, target: &Path) -> Result<()> {
        info!(from = %self.root.display(), to = %target.display(), "backing up data");
        fs::create_dir(target).map_err(|err| match err.kind() {
            io::ErrorKind::AlreadyExists => SupervisorError::BackupExists(target.to_path_buf()),
            _ => SupervisorError::io(format!("cannot create {}", target.display()), err),
        })?;

        let entries = fs::read_dir(&self.root)
            .map_err(|err| SupervisorError::io("cannot read state root", err))?;
        for entry in entries {
            let entry = entry.map_err(|err| SupervisorError::io("cannot read state root", err))?;
            fs::rename(entry.path(), target.join(entry.file_name())).map_err(|err| {
                SupervisorError::io(format!("cannot move data to {}", target.display()), err)
            })?;
        }
        fs::remove_dir(&self.root)
            .map_err(|err| SupervisorError::io("cannot remove old state root", err))
    }

    fn initialize(&self) -> Result<()> {
        info!(root = %self.root.display(), "initializing data directory");
        if !exists(&self.template)? {
            return Err(SupervisorError::NetworkTemplate {
                path: self.template.clone(),
                reason: "directory does not exist".into(),
            });
        }
        fs::create_dir_all(&self.root)
            .map_err(|err| SupervisorError::io("cannot create state root", err))?;
        copy_tree(&self.template, &self.root)?;
        fs::write(self.root.join(VERSION_FILE), &self.app_version)
            .map_err(|err| SupervisorError::io("cannot write app_version", err))?;
        Ok(())
    }
}

pub fn next_backup_path(root: &Path) -> Result<PathBuf> {
    let base = root.as_os_str().to_string_lossy().to_string();
    let mut n = 1u32;
    loop {
        let candidate = PathBuf::from(format!("{base}_backup_{n}"));
        if !exists(&candidate)? {
            return Ok(candidate);
        }
        n += 1;
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from).min_depth(1).follow_links(true) {
        let entry = entry.map_err(|err| SupervisorError::NetworkTemplate {
            path: from.to_path_buf(),
            reason: err.to_string(),
        })?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|err| SupervisorError::NetworkTemplate {
                path: entry.path().to_path_buf(),
                reason: err.to_string(),
            })?;
        let target = to.join(relative);
        let copied = if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
        } else {
            fs::copy(entry.path(), &target).map(|_| ())
        };
        copied.map_err(|err| {
            SupervisorError::io(format!("cannot copy {}", relative.display()), err)
        })?;
    }
    Ok(())
}

fn exists(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(SupervisorError::io(format!("cannot access {}", path.display()), err)),
    }
}
