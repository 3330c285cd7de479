//! Access control resolver.
//!
//! Two tables are consulted: grants to authenticated users and grants to
//! permalink share tokens (keyed by the token's SHA-256). Rows are flattened
//! at load time into `(principal, scope, resource) -> level`, so every check
//! is a map lookup. A missing row always means no access.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use waffle_core::{AccessControlRow, AccessLevel, AclScope, DatasetControlList, DatasetEntry};
use waffle_registry::ControlSnapshot;

/// Who is asking, as established by the auth middleware.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Requester {
    /// `sub` claim of a verified user token.
    pub user: Option<String>,
    /// SHA-256 hex digest of the `X-Share-Token` header.
    pub permalink_hash: Option<String>,
}

impl Requester {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            user: Some(id.into()),
            permalink_hash: None,
        }
    }
}

/// `(principal, scope, resource)`
type GrantKey = (String, AclScope, String);

fn lookup_key(principal: &str, scope: AclScope, resource: &str) -> GrantKey {
    (principal.to_string(), scope, resource.to_string())
}

fn flatten(rows: &[AccessControlRow]) -> HashMap<GrantKey, AccessLevel> {
    let mut map: HashMap<GrantKey, AccessLevel> = HashMap::with_capacity(rows.len());
    for row in rows {
        let key = lookup_key(&row.principal, row.scope, &row.resource);
        // Duplicate grants keep the strongest level
        map.entry(key)
            .and_modify(|level| *level = (*level).max(row.level))
            .or_insert(row.level);
    }
    map
}

/// Flattened ACL tables.
#[derive(Clone, Debug, Default)]
pub struct AccessControl {
    server_id: String,
    users: HashMap<GrantKey, AccessLevel>,
    permalinks: HashMap<GrantKey, AccessLevel>,
}

impl AccessControl {
    pub fn new(
        server_id: impl Into<String>,
        users: &[AccessControlRow],
        permalinks: &[AccessControlRow],
    ) -> Self {
        Self {
            server_id: server_id.into(),
            users: flatten(users),
            permalinks: flatten(permalinks),
        }
    }

    fn granted(
        table: &HashMap<GrantKey, AccessLevel>,
        principal: &str,
        scope: AclScope,
        resource: &str,
        level: AccessLevel,
    ) -> bool {
        table
            .get(&lookup_key(principal, scope, resource))
            .is_some_and(|granted| granted.implies(&level))
    }

    /// Whether `principal` holds a server-scoped grant of at least `level`.
    pub fn check_server_access(&self, principal: &str, level: AccessLevel) -> bool {
        Self::granted(
            &self.users,
            principal,
            AclScope::Server,
            &self.server_id,
            level,
        )
    }

    /// Whether the user or the permalink token holds a grant on `slug` of at least `level`.
    pub fn check_dataset_access(
        &self,
        user: Option<&str>,
        permalink_hash: Option<&str>,
        slug: &str,
        level: AccessLevel,
    ) -> bool {
        user.is_some_and(|u| Self::granted(&self.users, u, AclScope::Dataset, slug, level))
            || permalink_hash.is_some_and(|h| {
                Self::granted(&self.permalinks, h, AclScope::Dataset, slug, level)
            })
    }

    /// Number of flattened grants, users and permalinks together.
    pub fn len(&self) -> usize {
        self.users.len() + self.permalinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Applies the visibility rules on top of the current [`AccessControl`].
pub struct AccessResolver {
    server_id: String,
    /// Server-scope level every request holds, signed in or not.
    anonymous_level: Option<AccessLevel>,
    table: RwLock<Arc<AccessControl>>,
}

impl AccessResolver {
    pub fn new(server_id: impl Into<String>, anonymous_level: Option<AccessLevel>) -> Self {
        let server_id = server_id.into();
        Self {
            table: RwLock::new(Arc::new(AccessControl::new(server_id.clone(), &[], &[]))),
            server_id,
            anonymous_level,
        }
    }

    /// Rebuild the lookup tables from a refreshed control snapshot.
    pub fn reload(&self, snapshot: &ControlSnapshot) {
        let table = Arc::new(AccessControl::new(
            self.server_id.clone(),
            &snapshot.user_acl,
            &snapshot.permalink_acl,
        ));
        tracing::debug!(grants = table.len(), "Access control list reloaded");
        match self.table.write() {
            Ok(mut guard) => *guard = table,
            Err(poisoned) => *poisoned.into_inner() = table,
        }
    }

    pub fn table(&self) -> Arc<AccessControl> {
        match self.table.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Server-scope check, including the level granted to everyone.
    pub fn has_server_level(&self, requester: &Requester, level: AccessLevel) -> bool {
        if self.anonymous_level.is_some_and(|l| l.implies(&level)) {
            return true;
        }
        requester
            .user
            .as_deref()
            .is_some_and(|user| self.table().check_server_access(user, level))
    }

    /// Visibility of a dataset at `level`.
    ///
    /// Server owners see everything; public datasets need server reader
    /// access; private datasets additionally need a dataset grant.
    pub fn can_access(&self, requester: &Requester, dataset: &DatasetEntry, level: AccessLevel) -> bool {
        if self.has_server_level(requester, AccessLevel::Owner) {
            return true;
        }
        if !self.has_server_level(requester, AccessLevel::Reader) {
            return false;
        }
        if !dataset.is_private && level == AccessLevel::Reader {
            return true;
        }
        self.table().check_dataset_access(
            requester.user.as_deref(),
            requester.permalink_hash.as_deref(),
            &dataset.slug,
            level,
        )
    }

    pub fn can_view(&self, requester: &Requester, dataset: &DatasetEntry) -> bool {
        self.can_access(requester, dataset, AccessLevel::Reader)
    }

    /// Whether `requester` may sync `slug`.
    pub fn can_edit(&self, requester: &Requester, slug: &str) -> bool {
        if self.has_server_level(requester, AccessLevel::Editor) {
            return true;
        }
        self.table().check_dataset_access(
            requester.user.as_deref(),
            requester.permalink_hash.as_deref(),
            slug,
            AccessLevel::Editor,
        )
    }

    /// Datasets `requester` may sync.
    pub fn editable_datasets(
        &self,
        requester: &Requester,
        datasets: &DatasetControlList,
    ) -> DatasetControlList {
        DatasetControlList::new(
            datasets
                .iter()
                .filter(|d| self.can_edit(requester, &d.slug))
                .cloned()
                .collect(),
        )
    }

    /// Datasets `requester` may read.
    pub fn visible_datasets(
        &self,
        requester: &Requester,
        datasets: &DatasetControlList,
    ) -> DatasetControlList {
        DatasetControlList::new(
            datasets
                .iter()
                .filter(|d| self.can_view(requester, d))
                .cloned()
                .collect(),
        )
    }
}
