//! Aggregated record of state changes produced by one engine call.
//!
//! A replication broker forwards these to other instances; the metrics
//! collector turns them into running counts.

use std::sync::Arc;

use crate::message::GroupKey;

/// Kind of entity referenced by a not-found entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Client,
    User,
    Topic,
}

/// An id named in a call that does not exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NotFound {
    pub kind: EntityKind,
    pub id: Arc<str>,
}

/// Net creations and deletions observed during one call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChangeLog {
    pub clients_created: Vec<Arc<str>>,
    pub clients_deleted: Vec<Arc<str>>,
    pub clients_inactivated: Vec<Arc<str>>,
    pub clients_reactivated: Vec<Arc<str>>,
    pub users_created: Vec<Arc<str>>,
    pub users_deleted: Vec<Arc<str>>,
    pub topics_created: Vec<Arc<str>>,
    pub topics_deleted: Vec<Arc<str>>,
    /// Ids referenced by the call that do not exist. The rest of the call
    /// still succeeded.
    pub not_found: Vec<NotFound>,
    /// Groups whose missed traffic could not be replayed on reconnect
    /// because the history gap exceeded retention.
    pub unrecoverable: Vec<GroupKey>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn not_found(&mut self, kind: EntityKind, id: &Arc<str>) {
        self.not_found.push(NotFound {
            kind,
            id: Arc::clone(id),
        });
    }

    /// Whether `id` of `kind` was reported missing.
    pub fn is_not_found(&self, kind: EntityKind, id: &str) -> bool {
        self.not_found
            .iter()
            .any(|nf| nf.kind == kind && &*nf.id == id)
    }

    /// Append another change log (per-shard results are merged in shard order).
    pub fn merge(&mut self, other: ChangeLog) {
        self.clients_created.extend(other.clients_created);
        self.clients_deleted.extend(other.clients_deleted);
        self.clients_inactivated.extend(other.clients_inactivated);
        self.clients_reactivated.extend(other.clients_reactivated);
        self.users_created.extend(other.users_created);
        self.users_deleted.extend(other.users_deleted);
        self.topics_created.extend(other.topics_created);
        self.topics_deleted.extend(other.topics_deleted);
        self.not_found.extend(other.not_found);
        self.unrecoverable.extend(other.unrecoverable);
    }

    /// True when nothing changed and nothing was reported.
    pub fn is_empty(&self) -> bool {
        self.clients_created.is_empty()
            && self.clients_deleted.is_empty()
            && self.clients_inactivated.is_empty()
            && self.clients_reactivated.is_empty()
            && self.users_created.is_empty()
            && self.users_deleted.is_empty()
            && self.topics_created.is_empty()
            && self.topics_deleted.is_empty()
            && self.not_found.is_empty()
            && self.unrecoverable.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_appends_in_order() {
        let mut a = ChangeLog::new();
        a.clients_created.push(Arc::from("c1"));
        let mut b = ChangeLog::new();
        b.clients_created.push(Arc::from("c2"));
        b.not_found(EntityKind::Topic, &Arc::from("t"));

        a.merge(b);
        assert_eq!(
            a.clients_created,
            vec![Arc::<str>::from("c1"), Arc::<str>::from("c2")]
        );
        assert!(a.is_not_found(EntityKind::Topic, "t"));
        assert!(!a.is_not_found(EntityKind::Client, "t"));
    }

    #[test]
    fn test_empty() {
        let mut log = ChangeLog::new();
        assert!(log.is_empty());
        log.unrecoverable.push(GroupKey::topic("t"));
        assert!(!log.is_empty());
    }
}
