//! Durable store for runtime records
//!
//! The control plane only needs create/get/update/delete with
//! read-your-writes consistency, so the trait is synchronous and every
//! implementation serializes access internally.
//!
//! - `MemoryStore`: process-local maps (tests, ephemeral servers)
//! - `SqliteStore`: one SQLite file, records stored as JSON bodies

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::approval::Approval;
use crate::log::LogEntry;
use crate::task::Task;
use pilot_foundation::{ApprovalId, Result, Session, SessionId, TaskId};

/// Persistence collaborator for sessions, tasks, approvals and log lines
///
/// `get_*` return `Error::NotFound` for unknown ids. `create_*` on an existing
/// id returns `Error::Conflict`; `update_*` on a missing id returns
/// `Error::NotFound`. List results are ordered by creation time.
pub trait Store: Send + Sync {
    // Sessions
    fn create_session(&self, session: &Session) -> Result<()>;
    fn get_session(&self, id: SessionId) -> Result<Session>;
    fn update_session(&self, session: &Session) -> Result<()>;
    fn delete_session(&self, id: SessionId) -> Result<()>;
    fn list_sessions(&self) -> Result<Vec<Session>>;

    // Tasks
    fn create_task(&self, task: &Task) -> Result<()>;
    fn get_task(&self, id: TaskId) -> Result<Task>;
    fn update_task(&self, task: &Task) -> Result<()>;
    fn delete_task(&self, id: TaskId) -> Result<()>;
    fn list_tasks(&self, session_id: SessionId) -> Result<Vec<Task>>;

    // Approvals
    fn create_approval(&self, approval: &Approval) -> Result<()>;
    fn get_approval(&self, id: ApprovalId) -> Result<Approval>;
    fn update_approval(&self, approval: &Approval) -> Result<()>;
    fn delete_approval(&self, id: ApprovalId) -> Result<()>;
    fn list_approvals(&self, session_id: SessionId) -> Result<Vec<Approval>>;

    // Log lines
    fn append_log(&self, entry: &LogEntry) -> Result<()>;
    fn list_logs(&self, session_id: SessionId, limit: Option<usize>) -> Result<Vec<LogEntry>>;
    fn delete_logs(&self, session_id: SessionId) -> Result<usize>;
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Shared behaviour checks run against every Store implementation

    use super::*;
    use crate::action::{ActionKind, ActionStep};
    use crate::approval::ApprovalStatus;
    use crate::log::LogLevel;
    use crate::state::TaskStatus;
    use pilot_foundation::Error;

    pub fn sessions(store: &dyn Store) {
        let first = Session::new("first", "/tmp/a");
        let second = Session::new("second", "/tmp/b");
        store.create_session(&first).unwrap();
        store.create_session(&second).unwrap();
        assert!(matches!(store.create_session(&first), Err(Error::Conflict(_))));

        let mut loaded = store.get_session(first.id).unwrap();
        assert_eq!(loaded, first);

        loaded.dry_run_mode = true;
        store.update_session(&loaded).unwrap();
        assert!(store.get_session(first.id).unwrap().dry_run_mode);

        let names: Vec<_> = store
            .list_sessions()
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["first", "second"]);

        store.delete_session(second.id).unwrap();
        assert!(matches!(
            store.get_session(second.id),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            store.update_session(&second),
            Err(Error::NotFound { .. })
        ));
    }

    pub fn tasks(store: &dyn Store) {
        let session = Session::new("s", "/tmp");
        store.create_session(&session).unwrap();

        let mut task = Task::new(session.id, "t", vec![ActionStep::check_tool("git")]).unwrap();
        store.create_task(&task).unwrap();

        task.start();
        store.update_task(&task).unwrap();
        let loaded = store.get_task(task.id).unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);
        assert_eq!(loaded.plan, task.plan);

        let other = Task::new(session.id, "u", vec![ActionStep::check_tool("sh")]).unwrap();
        store.create_task(&other).unwrap();
        assert_eq!(store.list_tasks(session.id).unwrap().len(), 2);
        assert!(store.list_tasks(pilot_foundation::SessionId::new()).unwrap().is_empty());

        store.delete_task(other.id).unwrap();
        assert!(matches!(store.get_task(other.id), Err(Error::NotFound { .. })));
    }

    pub fn approvals(store: &dyn Store) {
        let session = pilot_foundation::SessionId::new();
        let a = Approval::new(session, None, ActionKind::DeleteFile, "rm /x");
        let b = Approval::new(session, None, ActionKind::GitPush, "push");
        store.create_approval(&a).unwrap();
        store.create_approval(&b).unwrap();

        let mut loaded = store.get_approval(a.id).unwrap();
        assert_eq!(loaded.status, ApprovalStatus::Pending);
        loaded.status = ApprovalStatus::Approved;
        store.update_approval(&loaded).unwrap();

        let listed = store.list_approvals(session).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, a.id);
        assert_eq!(listed[0].status, ApprovalStatus::Approved);

        store.delete_approval(b.id).unwrap();
        assert_eq!(store.list_approvals(session).unwrap().len(), 1);
    }

    pub fn logs(store: &dyn Store) {
        let session = pilot_foundation::SessionId::new();
        for i in 0..5 {
            store
                .append_log(&LogEntry::new(session, None, LogLevel::Info, format!("line {}", i)))
                .unwrap();
        }
        let all = store.list_logs(session, None).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].message, "line 0");

        // limit은 가장 최근 N개 (오래된 순)
        let tail = store.list_logs(session, Some(2)).unwrap();
        assert_eq!(
            tail.iter().map(|e| e.message.as_str()).collect::<Vec<_>>(),
            vec!["line 3", "line 4"]
        );

        assert_eq!(store.delete_logs(session).unwrap(), 5);
        assert!(store.list_logs(session, None).unwrap().is_empty());
    }
}
