//! Ordered record of structural and content changes made during a mount.
//!
//! The journal is append-only while mounted. At unmount the backend replays
//! it (or summarizes it with [`ActionJournal::by_path`]) to build the new
//! container, then the engine clears it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::error::VfsResult;
use super::types::EntryKind;

/// Discriminant of an [`Action`], for counting and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// A node was created.
    Create,
    /// A file's content was replaced by a staged copy.
    Update,
    /// A node was deleted.
    Delete,
    /// A node was moved.
    Move,
}

/// A single journaled change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// `path` was created as an empty file or directory.
    Create { path: String, kind: EntryKind },
    /// `path` now holds the content of the staged file.
    Update { path: String, staged: PathBuf },
    /// `path` was removed. Directory deletes cover the subtree.
    Delete { path: String, kind: EntryKind },
    /// One node moved from `from` to `to`. Moving a directory journals one
    /// `Move` per node in its subtree, parents first.
    Move {
        from: String,
        to: String,
        kind: EntryKind,
    },
}

impl Action {
    /// The discriminant.
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Create { .. } => ActionKind::Create,
            Action::Update { .. } => ActionKind::Update,
            Action::Delete { .. } => ActionKind::Delete,
            Action::Move { .. } => ActionKind::Move,
        }
    }

    /// The path the action leaves behind (the target for moves).
    pub fn path(&self) -> &str {
        match self {
            Action::Create { path, .. }
            | Action::Update { path, .. }
            | Action::Delete { path, .. } => path,
            Action::Move { to, .. } => to,
        }
    }
}

/// Receiver for [`ActionJournal::replay`].
pub trait JournalReplay {
    /// A node was created.
    fn create(&mut self, path: &str, kind: EntryKind) -> VfsResult<()>;

    /// A file's content was replaced.
    fn update(&mut self, path: &str, staged: &Path) -> VfsResult<()>;

    /// A node (and its subtree) was deleted.
    fn delete(&mut self, path: &str, kind: EntryKind) -> VfsResult<()>;

    /// A node moved.
    fn rename(&mut self, from: &str, to: &str, kind: EntryKind) -> VfsResult<()>;
}

/// Append-only action log.
#[derive(Debug, Default, Clone)]
pub struct ActionJournal {
    actions: Vec<Action>,
}

impl ActionJournal {
    /// Create an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action.
    pub fn push(&mut self, action: Action) {
        tracing::trace!(?action, "journal");
        self.actions.push(action);
    }

    /// Actions in the order they were applied.
    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter()
    }

    /// Number of actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns true if nothing was journaled.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Number of actions of one kind.
    pub fn count(&self, kind: ActionKind) -> usize {
        self.actions.iter().filter(|a| a.kind() == kind).count()
    }

    /// Group actions by the path they affect, preserving per-path order.
    /// Moves are listed under both their source and target.
    pub fn by_path(&self) -> BTreeMap<&str, Vec<&Action>> {
        let mut grouped: BTreeMap<&str, Vec<&Action>> = BTreeMap::new();
        for action in &self.actions {
            if let Action::Move { from, .. } = action {
                grouped.entry(from.as_str()).or_default().push(action);
            }
            grouped.entry(action.path()).or_default().push(action);
        }
        grouped
    }

    /// Feed every action, in order, to `target`.
    pub fn replay(&self, target: &mut impl JournalReplay) -> VfsResult<()> {
        for action in &self.actions {
            match action {
                Action::Create { path, kind } => target.create(path, *kind)?,
                Action::Update { path, staged } => target.update(path, staged)?,
                Action::Delete { path, kind } => target.delete(path, *kind)?,
                Action::Move { from, to, kind } => target.rename(from, to, *kind)?,
            }
        }
        Ok(())
    }

    /// Drop every action.
    pub fn clear(&mut self) {
        self.actions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Vec<String>);

    impl JournalReplay for Recorder {
        fn create(&mut self, path: &str, _kind: EntryKind) -> VfsResult<()> {
            self.0.push(format!("create {path}"));
            Ok(())
        }

        fn update(&mut self, path: &str, _staged: &Path) -> VfsResult<()> {
            self.0.push(format!("update {path}"));
            Ok(())
        }

        fn delete(&mut self, path: &str, _kind: EntryKind) -> VfsResult<()> {
            self.0.push(format!("delete {path}"));
            Ok(())
        }

        fn rename(&mut self, from: &str, to: &str, _kind: EntryKind) -> VfsResult<()> {
            self.0.push(format!("move {from} {to}"));
            Ok(())
        }
    }

    fn journal() -> ActionJournal {
        let mut j = ActionJournal::new();
        j.push(Action::Create {
            path: "/n".into(),
            kind: EntryKind::File,
        });
        j.push(Action::Move {
            from: "/a".into(),
            to: "/b".into(),
            kind: EntryKind::Directory,
        });
        j.push(Action::Update {
            path: "/n".into(),
            staged: PathBuf::from("/tmp/staged"),
        });
        j
    }

    #[test]
    fn test_counts() {
        let j = journal();
        assert_eq!(j.len(), 3);
        assert_eq!(j.count(ActionKind::Create), 1);
        assert_eq!(j.count(ActionKind::Delete), 0);
    }

    #[test]
    fn test_replay_preserves_order() {
        let mut rec = Recorder::default();
        journal().replay(&mut rec).unwrap();
        assert_eq!(rec.0, vec!["create /n", "move /a /b", "update /n"]);
    }

    #[test]
    fn test_by_path() {
        let j = journal();
        let grouped = j.by_path();
        assert_eq!(grouped["/n"].len(), 2);
        assert_eq!(grouped["/a"].len(), 1);
        assert_eq!(grouped["/b"].len(), 1);
    }

    #[test]
    fn test_clear() {
        let mut j = journal();
        j.clear();
        assert!(j.is_empty());
    }
}
