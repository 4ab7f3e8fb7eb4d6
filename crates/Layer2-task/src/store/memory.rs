//! In-memory Store

use super::Store;
use crate::approval::Approval;
use crate::log::LogEntry;
use crate::task::Task;
use parking_lot::RwLock;
use pilot_foundation::{ApprovalId, Error, Result, Session, SessionId, TaskId};
use std::collections::HashMap;

#[derive(Default)]
struct Tables {
    sessions: HashMap<SessionId, Session>,
    tasks: HashMap<TaskId, Task>,
    approvals: HashMap<ApprovalId, Approval>,
    logs: Vec<LogEntry>,
}

/// Process-local store; every call sees the writes of the previous ones
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn create_session(&self, session: &Session) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.sessions.contains_key(&session.id) {
            return Err(Error::Conflict(format!("session {} already exists", session.id)));
        }
        tables.sessions.insert(session.id, session.clone());
        Ok(())
    }

    fn get_session(&self, id: SessionId) -> Result<Session> {
        self.tables
            .read()
            .sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("session", id))
    }

    fn update_session(&self, session: &Session) -> Result<()> {
        let mut tables = self.tables.write();
        let slot = tables
            .sessions
            .get_mut(&session.id)
            .ok_or_else(|| Error::not_found("session", session.id))?;
        *slot = session.clone();
        Ok(())
    }

    fn delete_session(&self, id: SessionId) -> Result<()> {
        self.tables
            .write()
            .sessions
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("session", id))
    }

    fn list_sessions(&self) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self.tables.read().sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    fn create_task(&self, task: &Task) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.tasks.contains_key(&task.id) {
            return Err(Error::Conflict(format!("task {} already exists", task.id)));
        }
        tables.tasks.insert(task.id, task.clone());
        Ok(())
    }

    fn get_task(&self, id: TaskId) -> Result<Task> {
        self.tables
            .read()
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("task", id))
    }

    fn update_task(&self, task: &Task) -> Result<()> {
        let mut tables = self.tables.write();
        let slot = tables
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| Error::not_found("task", task.id))?;
        *slot = task.clone();
        Ok(())
    }

    fn delete_task(&self, id: TaskId) -> Result<()> {
        self.tables
            .write()
            .tasks
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("task", id))
    }

    fn list_tasks(&self, session_id: SessionId) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tables
            .read()
            .tasks
            .values()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    fn create_approval(&self, approval: &Approval) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.approvals.contains_key(&approval.id) {
            return Err(Error::Conflict(format!(
                "approval {} already exists",
                approval.id
            )));
        }
        tables.approvals.insert(approval.id, approval.clone());
        Ok(())
    }

    fn get_approval(&self, id: ApprovalId) -> Result<Approval> {
        self.tables
            .read()
            .approvals
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("approval", id))
    }

    fn update_approval(&self, approval: &Approval) -> Result<()> {
        let mut tables = self.tables.write();
        let slot = tables
            .approvals
            .get_mut(&approval.id)
            .ok_or_else(|| Error::not_found("approval", approval.id))?;
        *slot = approval.clone();
        Ok(())
    }

    fn delete_approval(&self, id: ApprovalId) -> Result<()> {
        self.tables
            .write()
            .approvals
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("approval", id))
    }

    fn list_approvals(&self, session_id: SessionId) -> Result<Vec<Approval>> {
        let mut approvals: Vec<Approval> = self
            .tables
            .read()
            .approvals
            .values()
            .filter(|a| a.session_id == session_id)
            .cloned()
            .collect();
        approvals.sort_by_key(|a| a.created_at);
        Ok(approvals)
    }

    fn append_log(&self, entry: &LogEntry) -> Result<()> {
        self.tables.write().logs.push(entry.clone());
        Ok(())
    }

    fn list_logs(&self, session_id: SessionId, limit: Option<usize>) -> Result<Vec<LogEntry>> {
        let tables = self.tables.read();
        let matching: Vec<&LogEntry> = tables
            .logs
            .iter()
            .filter(|e| e.session_id == session_id)
            .collect();
        let skip = limit.map_or(0, |n| matching.len().saturating_sub(n));
        Ok(matching.into_iter().skip(skip).cloned().collect())
    }

    fn delete_logs(&self, session_id: SessionId) -> Result<usize> {
        let mut tables = self.tables.write();
        let before = tables.logs.len();
        tables.logs.retain(|e| e.session_id != session_id);
        Ok(before - tables.logs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;

    #[test]
    fn test_sessions() {
        conformance::sessions(&MemoryStore::new());
    }

    #[test]
    fn test_tasks() {
        conformance::tasks(&MemoryStore::new());
    }

    #[test]
    fn test_approvals() {
        conformance::approvals(&MemoryStore::new());
    }

    #[test]
    fn test_logs() {
        conformance::logs(&MemoryStore::new());
    }
}
