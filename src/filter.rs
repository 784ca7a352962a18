//! Liveness annotation for local users.
//!
//! When a homeserver view is configured, a user is active iff their uid
//! appears (as the localpart of `@uid:domain`) in the view. Without a view
//! the filter has no authority to say otherwise and everyone is active.
//!
//! Both the full rebuild and the incremental reconciliation source liveness
//! from this filter, so the two jobs can never disagree on who is active.

use crate::directory::{DirectoryError, HomeserverView, LocalUser};
use std::collections::HashSet;
use tracing::debug;

/// A local user annotated with its liveness flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedUser {
    pub user: LocalUser,
    pub active: bool,
}

/// Extract the localpart of a `@localpart:domain` name.
pub fn localpart(name: &str) -> Option<&str> {
    let rest = name.strip_prefix('@')?;
    let (local, _domain) = rest.split_once(':')?;
    if local.is_empty() {
        return None;
    }
    Some(local)
}

/// Snapshot of the homeserver view's liveness knowledge for one job cycle.
pub struct ActiveUserFilter {
    /// `None` when no homeserver view is configured.
    known_localparts: Option<HashSet<String>>,
}

impl ActiveUserFilter {
    /// Build the filter from the optional homeserver view.
    pub async fn from_view(
        view: Option<&dyn HomeserverView>,
    ) -> Result<Self, DirectoryError> {
        let known_localparts = match view {
            Some(view) => {
                let names = view.user_names().await?;
                let localparts: HashSet<String> = names
                    .iter()
                    .filter_map(|name| localpart(name))
                    .map(str::to_string)
                    .collect();
                Some(localparts)
            }
            None => {
                debug!("no homeserver view configured, treating every local user as active");
                None
            }
        };
        Ok(Self { known_localparts })
    }

    /// Whether a homeserver view backs this filter.
    pub fn has_view(&self) -> bool {
        self.known_localparts.is_some()
    }

    /// Liveness of a single uid.
    pub fn is_active(&self, uid: &str) -> bool {
        match &self.known_localparts {
            Some(known) => known.contains(uid),
            None => true,
        }
    }

    /// Annotate a user set with liveness flags.
    pub fn annotate(&self, users: Vec<LocalUser>) -> Vec<AnnotatedUser> {
        users
            .into_iter()
            .map(|user| {
                let active = self.is_active(&user.uid);
                AnnotatedUser { user, active }
            })
            .collect()
    }
}
