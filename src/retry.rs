use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::capacity::CapacityPolicy;
use crate::models::{
    ConnectionStatus, Session, Student, StudentTutorConnection, Tutor, TutorStudent, UpdateStudent,
};
use crate::store::{RecordStore, StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Runs a store call, retrying only `StoreError::Unavailable` with doubling
/// delays. Conflicts, capacity denials and missing rows return immediately.
pub async fn with_backoff<T, F, Fut>(config: &RetryConfig, operation: &str, mut call: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;
    let mut attempt = 1;
    loop {
        match call().await {
            Err(StoreError::Unavailable(details)) if attempt < attempts => {
                log::warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                    operation,
                    attempt,
                    attempts,
                    details,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, config.max_delay);
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Wraps a store so every call goes through [`with_backoff`].
#[derive(Debug)]
pub struct Retrying<S> {
    inner: S,
    config: RetryConfig,
}

impl<S: RecordStore> Retrying<S> {
    pub fn new(inner: S, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl<S: RecordStore> RecordStore for Retrying<S> {
    async fn insert_tutor(&self, tutor: Tutor) -> StoreResult<Tutor> {
        let inner = &self.inner;
        with_backoff(&self.config, "insert_tutor", move || inner.insert_tutor(tutor.clone())).await
    }

    async fn tutor(&self, id: Uuid) -> StoreResult<Option<Tutor>> {
        let inner = &self.inner;
        with_backoff(&self.config, "tutor", move || inner.tutor(id)).await
    }

    async fn tutor_by_subject(&self, auth_subject: &str) -> StoreResult<Option<Tutor>> {
        let inner = &self.inner;
        with_backoff(&self.config, "tutor_by_subject", move || inner.tutor_by_subject(auth_subject)).await
    }

    async fn insert_student(&self, student: Student) -> StoreResult<Student> {
        let inner = &self.inner;
        with_backoff(&self.config, "insert_student", move || inner.insert_student(student.clone())).await
    }

    async fn insert_owned_student(
        &self,
        tutor_id: Uuid,
        student: Student,
        policy: CapacityPolicy,
    ) -> StoreResult<Student> {
        let inner = &self.inner;
        with_backoff(&self.config, "insert_owned_student", move || {
            inner.insert_owned_student(tutor_id, student.clone(), policy)
        })
        .await
    }

    async fn student(&self, id: Uuid) -> StoreResult<Option<Student>> {
        let inner = &self.inner;
        with_backoff(&self.config, "student", move || inner.student(id)).await
    }

    async fn student_by_subject(&self, auth_subject: &str) -> StoreResult<Option<Student>> {
        let inner = &self.inner;
        with_backoff(&self.config, "student_by_subject", move || {
            inner.student_by_subject(auth_subject)
        })
        .await
    }

    async fn student_by_token(&self, token: &str) -> StoreResult<Option<Student>> {
        let inner = &self.inner;
        with_backoff(&self.config, "student_by_token", move || inner.student_by_token(token)).await
    }

    async fn owner_of(&self, student_id: Uuid) -> StoreResult<Option<Tutor>> {
        let inner = &self.inner;
        with_backoff(&self.config, "owner_of", move || inner.owner_of(student_id)).await
    }

    async fn roster(&self, tutor_id: Uuid) -> StoreResult<Vec<Student>> {
        let inner = &self.inner;
        with_backoff(&self.config, "roster", move || inner.roster(tutor_id)).await
    }

    async fn update_student(
        &self,
        tutor_id: Uuid,
        student_id: Uuid,
        patch: UpdateStudent,
        policy: CapacityPolicy,
    ) -> StoreResult<Student> {
        let inner = &self.inner;
        with_backoff(&self.config, "update_student", move || {
            inner.update_student(tutor_id, student_id, patch.clone(), policy)
        })
        .await
    }

    async fn delete_student(&self, student_id: Uuid) -> StoreResult<bool> {
        let inner = &self.inner;
        with_backoff(&self.config, "delete_student", move || inner.delete_student(student_id)).await
    }

    async fn link(&self, tutor_id: Uuid, student_id: Uuid) -> StoreResult<Option<TutorStudent>> {
        let inner = &self.inner;
        with_backoff(&self.config, "link", move || inner.link(tutor_id, student_id)).await
    }

    async fn links_of(&self, tutor_id: Uuid) -> StoreResult<Vec<TutorStudent>> {
        let inner = &self.inner;
        with_backoff(&self.config, "links_of", move || inner.links_of(tutor_id)).await
    }

    async fn insert_link(&self, link: TutorStudent) -> StoreResult<TutorStudent> {
        let inner = &self.inner;
        with_backoff(&self.config, "insert_link", move || inner.insert_link(link.clone())).await
    }

    async fn connection(&self, id: Uuid) -> StoreResult<Option<StudentTutorConnection>> {
        let inner = &self.inner;
        with_backoff(&self.config, "connection", move || inner.connection(id)).await
    }

    async fn insert_connection(
        &self,
        connection: StudentTutorConnection,
    ) -> StoreResult<StudentTutorConnection> {
        let inner = &self.inner;
        with_backoff(&self.config, "insert_connection", move || {
            inner.insert_connection(connection.clone())
        })
        .await
    }

    async fn connections_of_student(
        &self,
        student_id: Uuid,
        status: Option<ConnectionStatus>,
    ) -> StoreResult<Vec<StudentTutorConnection>> {
        let inner = &self.inner;
        with_backoff(&self.config, "connections_of_student", move || {
            inner.connections_of_student(student_id, status)
        })
        .await
    }

    async fn connections_to_tutor(
        &self,
        tutor_id: Uuid,
        status: Option<ConnectionStatus>,
    ) -> StoreResult<Vec<StudentTutorConnection>> {
        let inner = &self.inner;
        with_backoff(&self.config, "connections_to_tutor", move || {
            inner.connections_to_tutor(tutor_id, status)
        })
        .await
    }

    async fn respond_to_connection(
        &self,
        id: Uuid,
        status: ConnectionStatus,
        link: Option<TutorStudent>,
    ) -> StoreResult<StudentTutorConnection> {
        let inner = &self.inner;
        with_backoff(&self.config, "respond_to_connection", move || {
            inner.respond_to_connection(id, status, link.clone())
        })
        .await
    }

    async fn insert_session(&self, session: Session) -> StoreResult<Session> {
        let inner = &self.inner;
        with_backoff(&self.config, "insert_session", move || inner.insert_session(session.clone())).await
    }

    async fn session(&self, id: Uuid) -> StoreResult<Option<Session>> {
        let inner = &self.inner;
        with_backoff(&self.config, "session", move || inner.session(id)).await
    }

    async fn sessions_of(&self, student_id: Uuid, tutor_id: Option<Uuid>) -> StoreResult<Vec<Session>> {
        let inner = &self.inner;
        with_backoff(&self.config, "sessions_of", move || inner.sessions_of(student_id, tutor_id)).await
    }

    async fn update_session(&self, session: Session) -> StoreResult<Session> {
        let inner = &self.inner;
        with_backoff(&self.config, "update_session", move || inner.update_session(session.clone())).await
    }

    async fn delete_session(&self, id: Uuid) -> StoreResult<bool> {
        let inner = &self.inner;
        with_backoff(&self.config, "delete_session", move || inner.delete_session(id)).await
    }
}
