use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{RecordStore, StoreError, StoreResult};
use crate::capacity::CapacityPolicy;
use crate::models::{
    ConnectionStatus, Session, Student, StudentTutorConnection, Tutor, TutorStudent, UpdateStudent,
};

#[derive(Debug, Default)]
struct Tables {
    tutors: HashMap<Uuid, Tutor>,
    students: HashMap<Uuid, Student>,
    links: Vec<TutorStudent>,
    connections: Vec<StudentTutorConnection>,
    sessions: Vec<Session>,
}

impl Tables {
    fn owner_id(&self, student_id: Uuid) -> Option<Uuid> {
        self.links
            .iter()
            .find(|l| l.student_id == student_id && l.is_primary)
            .map(|l| l.tutor_id)
    }

    fn roster(&self, tutor_id: Uuid) -> Vec<&Student> {
        self.links
            .iter()
            .filter(|l| l.tutor_id == tutor_id && l.is_primary)
            .filter_map(|l| self.students.get(&l.student_id))
            .collect()
    }

    fn check_student_unique(&self, student: &Student) -> StoreResult<()> {
        for other in self.students.values() {
            if other.id == student.id {
                continue;
            }
            if other.parent_link_token == student.parent_link_token {
                return Err(StoreError::Conflict("parent link token already issued".into()));
            }
            if student.email.is_some() && other.email == student.email {
                return Err(StoreError::Conflict("student email already registered".into()));
            }
            if student.auth_subject.is_some() && other.auth_subject == student.auth_subject {
                return Err(StoreError::Conflict("student account already registered".into()));
            }
        }
        Ok(())
    }

    fn check_link_unique(&self, link: &TutorStudent) -> StoreResult<()> {
        if self
            .links
            .iter()
            .any(|l| l.tutor_id == link.tutor_id && l.student_id == link.student_id)
        {
            return Err(StoreError::Conflict("tutor and student are already linked".into()));
        }
        Ok(())
    }
}

fn newest_first<T, F>(rows: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> chrono::DateTime<Utc>,
{
    let mut rows: Vec<T> = rows.into_iter().rev().collect();
    rows.sort_by(|a, b| key(b).cmp(&key(a)));
    rows
}

/// Process-local store used by tests and by deployments without a database.
/// A single lock guards every table, which makes each trait call atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_tutor(&self, tutor: Tutor) -> StoreResult<Tutor> {
        let mut tables = self.tables.lock().await;
        if tables
            .tutors
            .values()
            .any(|t| t.auth_subject == tutor.auth_subject)
        {
            return Err(StoreError::Conflict("tutor already registered".into()));
        }
        tables.tutors.insert(tutor.id, tutor.clone());
        Ok(tutor)
    }

    async fn tutor(&self, id: Uuid) -> StoreResult<Option<Tutor>> {
        Ok(self.tables.lock().await.tutors.get(&id).cloned())
    }

    async fn tutor_by_subject(&self, auth_subject: &str) -> StoreResult<Option<Tutor>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .tutors
            .values()
            .find(|t| t.auth_subject == auth_subject)
            .cloned())
    }

    async fn insert_student(&self, student: Student) -> StoreResult<Student> {
        let mut tables = self.tables.lock().await;
        tables.check_student_unique(&student)?;
        tables.students.insert(student.id, student.clone());
        Ok(student)
    }

    async fn insert_owned_student(
        &self,
        tutor_id: Uuid,
        student: Student,
        policy: CapacityPolicy,
    ) -> StoreResult<Student> {
        let mut tables = self.tables.lock().await;
        if !tables.tutors.contains_key(&tutor_id) {
            return Err(StoreError::Missing("tutor"));
        }
        policy
            .check_transition(tables.roster(tutor_id), None, student.active)
            .into_result()
            .map_err(StoreError::Capacity)?;
        tables.check_student_unique(&student)?;

        let link = TutorStudent {
            id: Uuid::new_v4(),
            tutor_id,
            student_id: student.id,
            subject: student.subject.clone(),
            notes: None,
            active: true,
            is_primary: true,
            started_at: student.created_at,
        };
        tables.students.insert(student.id, student.clone());
        tables.links.push(link);
        Ok(student)
    }

    async fn student(&self, id: Uuid) -> StoreResult<Option<Student>> {
        Ok(self.tables.lock().await.students.get(&id).cloned())
    }

    async fn student_by_subject(&self, auth_subject: &str) -> StoreResult<Option<Student>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .students
            .values()
            .find(|s| s.auth_subject.as_deref() == Some(auth_subject))
            .cloned())
    }

    async fn student_by_token(&self, token: &str) -> StoreResult<Option<Student>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .students
            .values()
            .find(|s| s.parent_link_token == token)
            .cloned())
    }

    async fn owner_of(&self, student_id: Uuid) -> StoreResult<Option<Tutor>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .owner_id(student_id)
            .and_then(|id| tables.tutors.get(&id))
            .cloned())
    }

    async fn roster(&self, tutor_id: Uuid) -> StoreResult<Vec<Student>> {
        let tables = self.tables.lock().await;
        let students = tables.roster(tutor_id).into_iter().cloned().collect();
        Ok(newest_first(students, |s| s.created_at))
    }

    async fn update_student(
        &self,
        tutor_id: Uuid,
        student_id: Uuid,
        patch: UpdateStudent,
        policy: CapacityPolicy,
    ) -> StoreResult<Student> {
        let mut tables = self.tables.lock().await;
        if tables.owner_id(student_id) != Some(tutor_id) {
            return Err(StoreError::Missing("student"));
        }
        let mut student = tables
            .students
            .get(&student_id)
            .cloned()
            .ok_or(StoreError::Missing("student"))?;
        let activating = patch.active == Some(true);
        patch.apply(&mut student);
        policy
            .check_transition(tables.roster(tutor_id), Some(student_id), activating)
            .into_result()
            .map_err(StoreError::Capacity)?;
        tables.students.insert(student_id, student.clone());
        Ok(student)
    }

    async fn delete_student(&self, student_id: Uuid) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        if tables.students.remove(&student_id).is_none() {
            return Ok(false);
        }
        tables.links.retain(|l| l.student_id != student_id);
        tables.connections.retain(|c| c.student_id != student_id);
        tables.sessions.retain(|s| s.student_id != student_id);
        Ok(true)
    }

    async fn link(&self, tutor_id: Uuid, student_id: Uuid) -> StoreResult<Option<TutorStudent>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .links
            .iter()
            .find(|l| l.tutor_id == tutor_id && l.student_id == student_id)
            .cloned())
    }

    async fn links_of(&self, tutor_id: Uuid) -> StoreResult<Vec<TutorStudent>> {
        let tables = self.tables.lock().await;
        let links = tables
            .links
            .iter()
            .filter(|l| l.tutor_id == tutor_id)
            .cloned()
            .collect();
        Ok(newest_first(links, |l| l.started_at))
    }

    async fn insert_link(&self, link: TutorStudent) -> StoreResult<TutorStudent> {
        let mut tables = self.tables.lock().await;
        if !tables.tutors.contains_key(&link.tutor_id) {
            return Err(StoreError::Missing("tutor"));
        }
        if !tables.students.contains_key(&link.student_id) {
            return Err(StoreError::Missing("student"));
        }
        tables.check_link_unique(&link)?;
        tables.links.push(link.clone());
        Ok(link)
    }

    async fn connection(&self, id: Uuid) -> StoreResult<Option<StudentTutorConnection>> {
        let tables = self.tables.lock().await;
        Ok(tables.connections.iter().find(|c| c.id == id).cloned())
    }

    async fn insert_connection(
        &self,
        connection: StudentTutorConnection,
    ) -> StoreResult<StudentTutorConnection> {
        let mut tables = self.tables.lock().await;
        if tables.connections.iter().any(|c| {
            c.student_id == connection.student_id
                && c.tutor_id == connection.tutor_id
                && c.subject == connection.subject
        }) {
            return Err(StoreError::Conflict("connection already requested".into()));
        }
        tables.connections.push(connection.clone());
        Ok(connection)
    }

    async fn connections_of_student(
        &self,
        student_id: Uuid,
        status: Option<ConnectionStatus>,
    ) -> StoreResult<Vec<StudentTutorConnection>> {
        let tables = self.tables.lock().await;
        let rows = tables
            .connections
            .iter()
            .filter(|c| c.student_id == student_id)
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect();
        Ok(newest_first(rows, |c| c.created_at))
    }

    async fn connections_to_tutor(
        &self,
        tutor_id: Uuid,
        status: Option<ConnectionStatus>,
    ) -> StoreResult<Vec<StudentTutorConnection>> {
        let tables = self.tables.lock().await;
        let rows = tables
            .connections
            .iter()
            .filter(|c| c.tutor_id == tutor_id)
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect();
        Ok(newest_first(rows, |c| c.created_at))
    }

    async fn respond_to_connection(
        &self,
        id: Uuid,
        status: ConnectionStatus,
        link: Option<TutorStudent>,
    ) -> StoreResult<StudentTutorConnection> {
        let mut tables = self.tables.lock().await;
        let index = tables
            .connections
            .iter()
            .position(|c| c.id == id)
            .ok_or(StoreError::Missing("connection"))?;
        if tables.connections[index].status != ConnectionStatus::Pending {
            return Err(StoreError::Conflict("connection was already answered".into()));
        }
        if let Some(link) = link {
            if tables.check_link_unique(&link).is_ok() {
                tables.links.push(link);
            }
        }
        let connection = &mut tables.connections[index];
        connection.status = status;
        connection.updated_at = Utc::now();
        Ok(connection.clone())
    }

    async fn insert_session(&self, session: Session) -> StoreResult<Session> {
        let mut tables = self.tables.lock().await;
        if !tables.students.contains_key(&session.student_id) {
            return Err(StoreError::Missing("student"));
        }
        tables.sessions.push(session.clone());
        Ok(session)
    }

    async fn session(&self, id: Uuid) -> StoreResult<Option<Session>> {
        let tables = self.tables.lock().await;
        Ok(tables.sessions.iter().find(|s| s.id == id).cloned())
    }

    async fn sessions_of(&self, student_id: Uuid, tutor_id: Option<Uuid>) -> StoreResult<Vec<Session>> {
        let tables = self.tables.lock().await;
        let rows = tables
            .sessions
            .iter()
            .filter(|s| s.student_id == student_id)
            .filter(|s| tutor_id.map_or(true, |t| s.tutor_id == t))
            .cloned()
            .collect();
        Ok(newest_first(rows, |s| s.start_time))
    }

    async fn update_session(&self, session: Session) -> StoreResult<Session> {
        let mut tables = self.tables.lock().await;
        let slot = tables
            .sessions
            .iter_mut()
            .find(|s| s.id == session.id)
            .ok_or(StoreError::Missing("session"))?;
        *slot = session.clone();
        Ok(session)
    }

    async fn delete_session(&self, id: Uuid) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        let before = tables.sessions.len();
        tables.sessions.retain(|s| s.id != id);
        Ok(tables.sessions.len() < before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::student;
    use std::sync::Arc;

    async fn tutor(store: &MemoryStore, subject: &str) -> Tutor {
        store
            .insert_tutor(Tutor {
                id: Uuid::new_v4(),
                auth_subject: subject.to_string(),
                email: format!("{}@example.com", subject),
                created_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    async fn fill(store: &MemoryStore, tutor_id: Uuid, active: usize, inactive: usize) -> Vec<Student> {
        let policy = CapacityPolicy::default();
        let mut out = Vec::new();
        for i in 0..active {
            let s = student(&format!("active {}", i), true);
            out.push(store.insert_owned_student(tutor_id, s, policy).await.unwrap());
        }
        for i in 0..inactive {
            let s = student(&format!("dormant {}", i), false);
            out.push(store.insert_owned_student(tutor_id, s, policy).await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn concurrent_activations_at_nineteen_admit_exactly_one() {
        let store = Arc::new(MemoryStore::new());
        let t = tutor(&store, "auth|t1").await;
        let students = fill(&store, t.id, 19, 10).await;
        let tutor_id = t.id;

        let mut handles = Vec::new();
        for dormant in students.iter().filter(|s| !s.active) {
            let store = store.clone();
            let id = dormant.id;
            handles.push(tokio::spawn(async move {
                let patch = UpdateStudent {
                    active: Some(true),
                    ..Default::default()
                };
                store
                    .update_student(tutor_id, id, patch, CapacityPolicy::default())
                    .await
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(StoreError::Capacity(denial)) => assert_eq!(denial.limit, 20),
                Err(other) => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(admitted, 1);
        let active = store.roster(t.id).await.unwrap().iter().filter(|s| s.active).count();
        assert_eq!(active, 20);
    }

    #[tokio::test]
    async fn concurrent_creates_at_nineteen_admit_exactly_one() {
        let store = Arc::new(MemoryStore::new());
        let t = tutor(&store, "auth|t1").await;
        fill(&store, t.id, 19, 0).await;
        let tutor_id = t.id;

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let s = student(&format!("late {}", i), true);
                store.insert_owned_student(tutor_id, s, CapacityPolicy::default()).await
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(store.roster(t.id).await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn reactivating_an_active_student_at_limit_succeeds() {
        let store = MemoryStore::new();
        let t = tutor(&store, "auth|t1").await;
        let students = fill(&store, t.id, 20, 0).await;
        let patch = UpdateStudent {
            active: Some(true),
            full_name: Some("Renamed".into()),
            ..Default::default()
        };
        let updated = store
            .update_student(t.id, students[3].id, patch, CapacityPolicy::default())
            .await
            .unwrap();
        assert_eq!(updated.full_name, "Renamed");
        assert!(updated.active);
    }

    #[tokio::test]
    async fn other_tutors_cannot_update() {
        let store = MemoryStore::new();
        let owner = tutor(&store, "auth|owner").await;
        let other = tutor(&store, "auth|other").await;
        let students = fill(&store, owner.id, 1, 0).await;
        let res = store
            .update_student(other.id, students[0].id, UpdateStudent::default(), CapacityPolicy::default())
            .await;
        assert_eq!(res, Err(StoreError::Missing("student")));
    }

    #[tokio::test]
    async fn duplicate_link_pair_is_a_conflict() {
        let store = MemoryStore::new();
        let t = tutor(&store, "auth|t1").await;
        let s = store.insert_student(student("Ada", true)).await.unwrap();
        let link = |subject: &str| TutorStudent {
            id: Uuid::new_v4(),
            tutor_id: t.id,
            student_id: s.id,
            subject: subject.to_string(),
            notes: None,
            active: true,
            is_primary: false,
            started_at: Utc::now(),
        };
        store.insert_link(link("Math")).await.unwrap();
        assert!(matches!(
            store.insert_link(link("Physics")).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(store.links_of(t.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_cascades() {
        let store = MemoryStore::new();
        let t = tutor(&store, "auth|t1").await;
        let students = fill(&store, t.id, 1, 0).await;
        let now = Utc::now();
        store
            .insert_session(Session {
                id: Uuid::new_v4(),
                student_id: students[0].id,
                tutor_id: t.id,
                start_time: now,
                end_time: now + chrono::Duration::hours(1),
                status: crate::models::SessionStatus::Scheduled,
                notes: None,
                homework: None,
                created_at: now,
            })
            .await
            .unwrap();

        assert!(store.delete_student(students[0].id).await.unwrap());
        assert!(store.sessions_of(students[0].id, None).await.unwrap().is_empty());
        assert!(store.links_of(t.id).await.unwrap().is_empty());
        assert!(!store.delete_student(students[0].id).await.unwrap());
    }
}
