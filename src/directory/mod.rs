//! Local user directory and homeserver view collaborators.
//!
//! The directory is where local accounts (uid + 3PIDs) come from; the
//! homeserver view is a read-only window onto the homeserver's own user
//! database and is the single authority on which accounts are live. Real
//! deployments plug LDAP/SQL adapters into [`UserDirectory`]; this crate
//! ships a static implementation fed from configuration, which is also what
//! the tests drive.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;

/// Directory errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory backend error: {0}")]
    Backend(String),
}

/// One local account with its third-party identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    pub uid: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl LocalUser {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            email: None,
            phone: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }
}

/// Source of local accounts.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn list_users(&self) -> Result<Vec<LocalUser>, DirectoryError>;
}

/// Read-only view onto the homeserver's user database.
///
/// Names come back fully qualified (`@uid:domain`).
#[async_trait]
pub trait HomeserverView: Send + Sync {
    async fn user_names(&self) -> Result<Vec<String>, DirectoryError>;
}

/// Fixed user set, fed from configuration or tests. Mutable so tests can
/// simulate accounts appearing and disappearing between job cycles.
#[derive(Default)]
pub struct StaticDirectory {
    users: Mutex<Vec<LocalUser>>,
}

impl StaticDirectory {
    pub fn new(users: Vec<LocalUser>) -> Self {
        Self {
            users: Mutex::new(users),
        }
    }

    /// Replace the user set.
    pub fn set_users(&self, users: Vec<LocalUser>) {
        *self.users.lock().expect("directory lock") = users;
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn list_users(&self) -> Result<Vec<LocalUser>, DirectoryError> {
        Ok(self.users.lock().expect("directory lock").clone())
    }
}

/// Fixed homeserver view, fed from configuration or tests.
#[derive(Default)]
pub struct StaticHomeserverView {
    names: Mutex<Vec<String>>,
}

impl StaticHomeserverView {
    pub fn new(names: Vec<String>) -> Self {
        Self {
            names: Mutex::new(names),
        }
    }

    /// Replace the view's user list.
    pub fn set_names(&self, names: Vec<String>) {
        *self.names.lock().expect("view lock") = names;
    }
}

#[async_trait]
impl HomeserverView for StaticHomeserverView {
    async fn user_names(&self) -> Result<Vec<String>, DirectoryError> {
        Ok(self.names.lock().expect("view lock").clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_directory_list_and_replace() {
        let directory = StaticDirectory::new(vec![LocalUser::new("dwho")
            .with_email("dwho@company.com")
            .with_phone("33612345678")]);

        let users = directory.list_users().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].uid, "dwho");
        assert_eq!(users[0].email.as_deref(), Some("dwho@company.com"));

        directory.set_users(vec![]);
        assert!(directory.list_users().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_static_view_names() {
        let view = StaticHomeserverView::new(vec!["@dwho:example.com".into()]);
        assert_eq!(view.user_names().await.unwrap(), vec!["@dwho:example.com"]);
    }
}
