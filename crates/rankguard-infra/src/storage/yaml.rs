//! Single-document YAML backend.
//!
//! The whole dataset lives in one file (`permissions.yml`). Every write is a
//! read-modify-write of that document under a mutex, finished by an atomic
//! rename.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rankguard_core::repository::{Backend, Dataset};
use rankguard_types::backend::BackendKind;
use rankguard_types::error::BackendError;
use rankguard_types::group::{Group, group_key};
use rankguard_types::user::{IdentityMode, User, UserKey};
use serde::{Deserialize, Serialize};

use super::write_atomic;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    groups: Vec<Group>,
    #[serde(default)]
    users: Vec<User>,
}

pub struct YamlBackend {
    path: PathBuf,
    mode: IdentityMode,
    lock: Mutex<()>,
}

impl std::fmt::Debug for YamlBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YamlBackend")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish()
    }
}

impl YamlBackend {
    /// Open (and create if missing) the document at `path`.
    pub fn open(path: PathBuf, mode: IdentityMode) -> Result<Self, BackendError> {
        let backend = Self {
            path,
            mode,
            lock: Mutex::new(()),
        };
        if !backend.path.exists() {
            backend.write(&Document::default())?;
            tracing::info!(path = %backend.path.display(), "created empty permissions document");
        }
        Ok(backend)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Document, BackendError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Document::default()),
            Err(err) => return Err(err.into()),
        };
        if content.trim().is_empty() {
            return Ok(Document::default());
        }
        serde_yaml_ng::from_str(&content)
            .map_err(|e| BackendError::Serialization(format!("{}: {e}", self.path.display())))
    }

    fn write(&self, document: &Document) -> Result<(), BackendError> {
        let content = serde_yaml_ng::to_string(document)
            .map_err(|e| BackendError::Serialization(e.to_string()))?;
        write_atomic(&self.path, content.as_bytes())
    }

    fn modify(&self, f: impl FnOnce(&mut Document)) -> Result<(), BackendError> {
        let _guard = self.lock.lock();
        let mut document = self.read()?;
        f(&mut document);
        self.write(&document)
    }
}

impl Backend for YamlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Yaml
    }

    fn load(&self) -> Result<Dataset, BackendError> {
        let _guard = self.lock.lock();
        let document = self.read()?;
        Ok(Dataset {
            groups: document.groups,
            users: document.users,
        })
    }

    fn load_groups(&self) -> Result<Vec<Group>, BackendError> {
        let _guard = self.lock.lock();
        Ok(self.read()?.groups)
    }

    fn load_users(&self) -> Result<Vec<User>, BackendError> {
        let _guard = self.lock.lock();
        Ok(self.read()?.users)
    }

    fn load_group(&self, name: &str) -> Result<Option<Group>, BackendError> {
        let key = group_key(name);
        Ok(self.load_groups()?.into_iter().find(|g| g.key() == key))
    }

    fn load_user(&self, key: &UserKey) -> Result<Option<User>, BackendError> {
        Ok(self.load_users()?.into_iter().find(|u| u.matches(key)))
    }

    fn save_group(&self, group: &Group) -> Result<(), BackendError> {
        let key = group.key();
        self.modify(|doc| match doc.groups.iter_mut().find(|g| g.key() == key) {
            Some(existing) => *existing = group.clone(),
            None => doc.groups.push(group.clone()),
        })
    }

    fn save_user(&self, user: &User, _is_new: bool) -> Result<(), BackendError> {
        let key = user.key(self.mode);
        self.modify(|doc| match doc.users.iter_mut().find(|u| u.matches(&key)) {
            Some(existing) => *existing = user.clone(),
            None => doc.users.push(user.clone()),
        })
    }

    fn delete_group(&self, name: &str) -> Result<(), BackendError> {
        let key = group_key(name);
        self.modify(|doc| doc.groups.retain(|g| g.key() != key))
    }

    fn delete_user(&self, user: &User) -> Result<(), BackendError> {
        let key = user.key(self.mode);
        self.modify(|doc| doc.users.retain(|u| !u.matches(&key)))
    }

    fn clear_database(&self) -> Result<(), BackendError> {
        let _guard = self.lock.lock();
        self.write(&Document::default())
    }

    /// One atomic document write; the old document stays on any failure.
    fn replace_all(&self, dataset: &Dataset) -> Result<(), BackendError> {
        let _guard = self.lock.lock();
        self.write(&Document {
            groups: dataset.groups.clone(),
            users: dataset.users.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rankguard_types::scope::{DisplayField, Scope};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn open(dir: &Path) -> YamlBackend {
        YamlBackend::open(dir.join("permissions.yml"), IdentityMode::Uuid).unwrap()
    }

    #[test]
    fn scoped_attributes_survive_a_reopen() {
        let dir = tempdir().unwrap();
        let mut group = Group::new("Admin").with_inheritance("mod").with_rank(10);
        group.scoped.at_mut(&Scope::Global).add_perm("server.stop");
        group.scoped.at_mut(&Scope::server("lobby")).add_perm("-fly");
        group
            .scoped
            .at_mut(&Scope::world("survival", "nether"))
            .set(DisplayField::Prefix, Some("[A]".to_string()));

        open(dir.path()).save_group(&group).unwrap();

        let loaded = open(dir.path()).load_group("admin").unwrap().unwrap();
        assert_eq!(loaded, group);
    }

    #[test]
    fn save_replaces_and_delete_removes() {
        let dir = tempdir().unwrap();
        let backend = open(dir.path());
        let mut user = User::new(Uuid::from_u128(7), "Steve");
        backend.save_user(&user, true).unwrap();

        user.groups.push("vip".to_string());
        backend.save_user(&user, false).unwrap();

        let users = backend.load_users().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].groups, vec!["vip"]);
        assert!(backend.load_user(&UserKey::from("steve")).unwrap().is_some());

        backend.delete_user(&user).unwrap();
        assert!(backend.load_users().unwrap().is_empty());
    }

    #[test]
    fn malformed_document_is_a_serialization_error() {
        let dir = tempdir().unwrap();
        let backend = open(dir.path());
        std::fs::write(backend.path(), "groups: [oops").unwrap();

        let err = backend.load().unwrap_err();
        assert!(matches!(err, BackendError::Serialization(_)));
    }

    #[test]
    fn clear_database_keeps_an_empty_document() {
        let dir = tempdir().unwrap();
        let backend = open(dir.path());
        backend.save_group(&Group::new("vip")).unwrap();
        backend.clear_database().unwrap();

        assert!(backend.path().exists());
        assert!(backend.load_groups().unwrap().is_empty());
    }

    #[test]
    fn failed_replace_all_keeps_the_old_document() {
        let dir = tempdir().unwrap();
        let backend = open(dir.path());
        backend.save_group(&Group::new("vip")).unwrap();

        // The staging file cannot be written while a directory holds its name.
        std::fs::create_dir(dir.path().join("permissions.yml.tmp")).unwrap();
        let dataset = Dataset {
            groups: vec![Group::new("other")],
            users: Vec::new(),
        };
        assert!(backend.replace_all(&dataset).is_err());
        assert!(backend.load_group("vip").unwrap().is_some());
        assert!(backend.load_group("other").unwrap().is_none());
    }
}
