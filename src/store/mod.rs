pub mod memory;
pub mod pg;

use async_trait::async_trait;
use uuid::Uuid;

use crate::capacity::{CapacityPolicy, Denial};
use crate::models::{
    ConnectionStatus, Session, Student, StudentTutorConnection, Tutor, TutorStudent, UpdateStudent,
};

pub use memory::MemoryStore;
pub use pg::PgStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Transient infrastructure failure; the only retryable kind.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("uniqueness violation: {0}")]
    Conflict(String),
    #[error("active student limit of {} reached", .0.limit)]
    Capacity(Denial),
    #[error("{0} not found")]
    Missing(&'static str),
    #[error("store failure: {0}")]
    Internal(String),
}

/// Persistence for tutors, students and everything hanging off them.
///
/// Operations that combine a policy check with a write (`insert_owned_student`,
/// `update_student`, `respond_to_connection`) are atomic per implementation;
/// callers may pre-check for an early exit but must not rely on it. Uniqueness
/// of tutor subjects, student emails, parent tokens, (tutor, student) links and
/// (student, tutor, subject) connections is enforced here and surfaces as
/// `StoreError::Conflict`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_tutor(&self, tutor: Tutor) -> StoreResult<Tutor>;
    async fn tutor(&self, id: Uuid) -> StoreResult<Option<Tutor>>;
    async fn tutor_by_subject(&self, auth_subject: &str) -> StoreResult<Option<Tutor>>;

    /// Self-registered student without an owning tutor.
    async fn insert_student(&self, student: Student) -> StoreResult<Student>;
    /// Inserts the student together with its primary link, re-checking
    /// capacity under the tutor's roster lock when the student starts active.
    async fn insert_owned_student(
        &self,
        tutor_id: Uuid,
        student: Student,
        policy: CapacityPolicy,
    ) -> StoreResult<Student>;
    async fn student(&self, id: Uuid) -> StoreResult<Option<Student>>;
    async fn student_by_subject(&self, auth_subject: &str) -> StoreResult<Option<Student>>;
    async fn student_by_token(&self, token: &str) -> StoreResult<Option<Student>>;
    /// Tutor holding the primary link, if any.
    async fn owner_of(&self, student_id: Uuid) -> StoreResult<Option<Tutor>>;
    /// Students primarily owned by the tutor, newest first.
    async fn roster(&self, tutor_id: Uuid) -> StoreResult<Vec<Student>>;
    /// Applies the patch to a student owned by `tutor_id`. Activation is
    /// capacity checked with the student itself excluded from the count.
    async fn update_student(
        &self,
        tutor_id: Uuid,
        student_id: Uuid,
        patch: UpdateStudent,
        policy: CapacityPolicy,
    ) -> StoreResult<Student>;
    /// Removes the student with its sessions, links and connections.
    async fn delete_student(&self, student_id: Uuid) -> StoreResult<bool>;

    async fn link(&self, tutor_id: Uuid, student_id: Uuid) -> StoreResult<Option<TutorStudent>>;
    async fn links_of(&self, tutor_id: Uuid) -> StoreResult<Vec<TutorStudent>>;
    async fn insert_link(&self, link: TutorStudent) -> StoreResult<TutorStudent>;

    async fn connection(&self, id: Uuid) -> StoreResult<Option<StudentTutorConnection>>;
    async fn insert_connection(
        &self,
        connection: StudentTutorConnection,
    ) -> StoreResult<StudentTutorConnection>;
    async fn connections_of_student(
        &self,
        student_id: Uuid,
        status: Option<ConnectionStatus>,
    ) -> StoreResult<Vec<StudentTutorConnection>>;
    async fn connections_to_tutor(
        &self,
        tutor_id: Uuid,
        status: Option<ConnectionStatus>,
    ) -> StoreResult<Vec<StudentTutorConnection>>;
    /// Moves a pending connection to `status`, inserting `link` when given and
    /// the pair is not linked yet. A connection that is no longer pending is a
    /// `Conflict`.
    async fn respond_to_connection(
        &self,
        id: Uuid,
        status: ConnectionStatus,
        link: Option<TutorStudent>,
    ) -> StoreResult<StudentTutorConnection>;

    async fn insert_session(&self, session: Session) -> StoreResult<Session>;
    async fn session(&self, id: Uuid) -> StoreResult<Option<Session>>;
    /// Sessions of a student, newest first, optionally limited to one tutor.
    async fn sessions_of(&self, student_id: Uuid, tutor_id: Option<Uuid>) -> StoreResult<Vec<Session>>;
    async fn update_session(&self, session: Session) -> StoreResult<Session>;
    async fn delete_session(&self, id: Uuid) -> StoreResult<bool>;
}
