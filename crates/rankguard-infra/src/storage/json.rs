//! One-file-per-entity JSON backend.
//!
//! Layout under the backend root:
//!
//! ```text
//! groups/<group key>.json
//! users/<storage key>.json
//! ```
//!
//! File stems are escaped with [`file_stem`](super::file_stem). Users are
//! stored under their authoritative key; lookups by the other key form scan
//! the directory.
//!
//! [`Backend::replace_all`] writes the new content to `.staging/` and only
//! then swaps both directories in, so a failed write leaves the live files
//! alone.

use std::path::{Path, PathBuf};

use rankguard_core::repository::{Backend, Dataset};
use rankguard_types::backend::BackendKind;
use rankguard_types::error::BackendError;
use rankguard_types::group::{Group, group_key};
use rankguard_types::user::{IdentityMode, User, UserKey};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{file_stem, write_atomic};

const ENTITY_DIRS: [&str; 2] = ["groups", "users"];
const STAGING_DIR: &str = ".staging";
const RETIRED_DIR: &str = ".retired";

#[derive(Debug)]
pub struct JsonBackend {
    root: PathBuf,
    mode: IdentityMode,
}

impl JsonBackend {
    pub fn open(root: PathBuf, mode: IdentityMode) -> Result<Self, BackendError> {
        for dir in ENTITY_DIRS {
            std::fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self { root, mode })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn group_path(&self, name: &str) -> PathBuf {
        self.root
            .join("groups")
            .join(format!("{}.json", file_stem(&group_key(name))))
    }

    fn user_path(&self, key: &UserKey) -> PathBuf {
        self.root
            .join("users")
            .join(format!("{}.json", file_stem(&key.storage_key())))
    }

    fn users_dir(&self) -> PathBuf {
        self.root.join("users")
    }

    fn groups_dir(&self) -> PathBuf {
        self.root.join("groups")
    }
}

fn read_entity<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, BackendError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| BackendError::Serialization(format!("{}: {e}", path.display())))
}

fn write_entity<T: Serialize>(path: &Path, entity: &T) -> Result<(), BackendError> {
    let content =
        serde_json::to_vec_pretty(entity).map_err(|e| BackendError::Serialization(e.to_string()))?;
    write_atomic(path, &content)
}

fn read_all<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, BackendError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        if let Some(entity) = read_entity(&path)? {
            out.push(entity);
        }
    }
    Ok(out)
}

fn remove_dir(path: &Path) -> Result<(), BackendError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn remove_file(path: &Path) -> Result<(), BackendError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

impl Backend for JsonBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Json
    }

    fn load_groups(&self) -> Result<Vec<Group>, BackendError> {
        read_all(&self.groups_dir())
    }

    fn load_users(&self) -> Result<Vec<User>, BackendError> {
        read_all(&self.users_dir())
    }

    fn load_group(&self, name: &str) -> Result<Option<Group>, BackendError> {
        read_entity(&self.group_path(name))
    }

    fn load_user(&self, key: &UserKey) -> Result<Option<User>, BackendError> {
        if let Some(user) = read_entity::<User>(&self.user_path(key))? {
            return Ok(Some(user));
        }
        Ok(self.load_users()?.into_iter().find(|u| u.matches(key)))
    }

    fn save_group(&self, group: &Group) -> Result<(), BackendError> {
        write_entity(&self.group_path(&group.name), group)
    }

    fn save_user(&self, user: &User, is_new: bool) -> Result<(), BackendError> {
        let path = self.user_path(&user.key(self.mode));
        if is_new {
            tracing::debug!(user = %user.name, path = %path.display(), "writing new user file");
        }
        write_entity(&path, user)
    }

    fn delete_group(&self, name: &str) -> Result<(), BackendError> {
        remove_file(&self.group_path(name))
    }

    fn delete_user(&self, user: &User) -> Result<(), BackendError> {
        remove_file(&self.user_path(&user.key(self.mode)))
    }

    fn clear_database(&self) -> Result<(), BackendError> {
        for dir in [self.groups_dir(), self.users_dir()] {
            remove_dir(&dir)?;
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    fn replace_all(&self, dataset: &Dataset) -> Result<(), BackendError> {
        let staging = self.root.join(STAGING_DIR);
        remove_dir(&staging)?;
        let staged = JsonBackend::open(staging.clone(), self.mode)?;
        for group in &dataset.groups {
            staged.save_group(group)?;
        }
        for user in &dataset.users {
            staged.save_user(user, true)?;
        }

        let retired = self.root.join(RETIRED_DIR);
        remove_dir(&retired)?;
        std::fs::create_dir_all(&retired)?;
        for dir in ENTITY_DIRS {
            std::fs::rename(self.root.join(dir), retired.join(dir))?;
            std::fs::rename(staging.join(dir), self.root.join(dir))?;
        }

        remove_dir(&staging)?;
        if let Err(err) = remove_dir(&retired) {
            tracing::warn!(path = %retired.display(), error = %err, "failed to remove replaced files");
        }
        tracing::debug!(root = %self.root.display(), groups = dataset.groups.len(), users = dataset.users.len(), "replaced all files");
        Ok(())
    }
}
