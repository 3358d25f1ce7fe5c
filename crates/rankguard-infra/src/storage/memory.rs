//! Process-memory backend. Nothing survives a restart.

use dashmap::DashMap;
use rankguard_core::repository::Backend;
use rankguard_types::backend::BackendKind;
use rankguard_types::error::BackendError;
use rankguard_types::group::{Group, group_key};
use rankguard_types::user::{IdentityMode, User, UserKey};

#[derive(Debug, Default)]
pub struct MemoryBackend {
    mode: IdentityMode,
    groups: DashMap<String, Group>,
    users: DashMap<String, User>,
}

impl MemoryBackend {
    pub fn new(mode: IdentityMode) -> Self {
        Self {
            mode,
            groups: DashMap::new(),
            users: DashMap::new(),
        }
    }

    fn user_index(&self, key: &UserKey) -> Option<String> {
        let direct = key.storage_key();
        if self.users.contains_key(&direct) {
            return Some(direct);
        }
        self.users
            .iter()
            .find(|entry| entry.value().matches(key))
            .map(|entry| entry.key().clone())
    }
}

impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn load_groups(&self) -> Result<Vec<Group>, BackendError> {
        let mut groups: Vec<Group> = self.groups.iter().map(|e| e.value().clone()).collect();
        groups.sort_by_key(Group::key);
        Ok(groups)
    }

    fn load_users(&self) -> Result<Vec<User>, BackendError> {
        Ok(self.users.iter().map(|e| e.value().clone()).collect())
    }

    fn load_group(&self, name: &str) -> Result<Option<Group>, BackendError> {
        Ok(self.groups.get(&group_key(name)).map(|g| g.value().clone()))
    }

    fn load_user(&self, key: &UserKey) -> Result<Option<User>, BackendError> {
        let Some(index) = self.user_index(key) else {
            return Ok(None);
        };
        Ok(self.users.get(&index).map(|u| u.value().clone()))
    }

    fn save_group(&self, group: &Group) -> Result<(), BackendError> {
        self.groups.insert(group.key(), group.clone());
        Ok(())
    }

    fn save_user(&self, user: &User, _is_new: bool) -> Result<(), BackendError> {
        self.users
            .insert(user.key(self.mode).storage_key(), user.clone());
        Ok(())
    }

    fn delete_group(&self, name: &str) -> Result<(), BackendError> {
        self.groups.remove(&group_key(name));
        Ok(())
    }

    fn delete_user(&self, user: &User) -> Result<(), BackendError> {
        self.users.remove(&user.key(self.mode).storage_key());
        Ok(())
    }

    fn clear_database(&self) -> Result<(), BackendError> {
        self.groups.clear();
        self.users.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn users_load_by_either_key() {
        let backend = MemoryBackend::new(IdentityMode::Uuid);
        let user = User::new(Uuid::now_v7(), "Steve");
        backend.save_user(&user, true).unwrap();

        assert!(backend.load_user(&UserKey::Id(user.id)).unwrap().is_some());
        assert!(backend.load_user(&UserKey::from("STEVE")).unwrap().is_some());
        assert!(backend.load_user(&UserKey::from("alex")).unwrap().is_none());

        backend.delete_user(&user).unwrap();
        assert!(backend.load_users().unwrap().is_empty());
    }

    #[test]
    fn clear_database_empties_everything() {
        let backend = MemoryBackend::new(IdentityMode::Name);
        backend.save_group(&Group::new("b")).unwrap();
        backend.save_group(&Group::new("A")).unwrap();
        let names: Vec<String> = backend.load_groups().unwrap().into_iter().map(|g| g.name).collect();
        assert_eq!(names, vec!["A", "b"]);

        backend.clear_database().unwrap();
        assert!(backend.load().unwrap().groups.is_empty());
    }
}
