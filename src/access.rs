use axum::async_trait;
use axum::extract::{FromRequest, RequestParts};
use chrono::Utc;
use uuid::Uuid;

use crate::err::Error;
use crate::models::{Student, Tutor};
use crate::store::RecordStore;
use crate::token::{self, TokenPolicy};

pub const SUBJECT_HEADER: &str = "x-auth-subject";
pub const EMAIL_HEADER: &str = "x-auth-email";

/// Caller identity forwarded by the auth provider in front of the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub email: Option<String>,
}

#[async_trait]
impl<B> FromRequest<B> for Identity
where
    B: Send,
{
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let subject = header(SUBJECT_HEADER).ok_or_else(Error::unauthenticated)?;
        Ok(Identity {
            subject,
            email: header(EMAIL_HEADER),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Scope {
    TutorOwner(Tutor),
    StudentOwner(Student),
    /// Read-only access to one student through its parent-link token.
    ParentViewer(Student),
    Unauthenticated,
}

impl Scope {
    pub fn kind(&self) -> &'static str {
        match self {
            Scope::TutorOwner(_) => "TutorOwner",
            Scope::StudentOwner(_) => "StudentOwner",
            Scope::ParentViewer(_) => "ParentViewer",
            Scope::Unauthenticated => "Unauthenticated",
        }
    }

    /// Tutor-only operations; other authenticated callers see `NotFound`.
    pub fn tutor(&self) -> Result<&Tutor, Error> {
        match self {
            Scope::TutorOwner(tutor) => Ok(tutor),
            Scope::Unauthenticated => Err(Error::unauthenticated()),
            _ => Err(Error::not_found("Resource not found")),
        }
    }

    pub fn student(&self) -> Result<&Student, Error> {
        match self {
            Scope::StudentOwner(student) => Ok(student),
            Scope::Unauthenticated => Err(Error::unauthenticated()),
            _ => Err(Error::not_found("Resource not found")),
        }
    }
}

/// Session identity wins over a token; an identity the store does not know
/// does not fall back to the token.
pub async fn resolve_scope(
    store: &dyn RecordStore,
    identity: Option<&Identity>,
    parent_token: Option<&str>,
    tokens: &TokenPolicy,
) -> Result<Scope, Error> {
    if let Some(identity) = identity {
        if let Some(tutor) = store.tutor_by_subject(&identity.subject).await? {
            return Ok(Scope::TutorOwner(tutor));
        }
        if let Some(student) = store.student_by_subject(&identity.subject).await? {
            return Ok(Scope::StudentOwner(student));
        }
        log::debug!("identity {} has no tutor or student record", identity.subject);
        return Ok(Scope::Unauthenticated);
    }
    if let Some(token) = parent_token {
        return match student_for_token(store, token, tokens).await {
            Ok(student) => Ok(Scope::ParentViewer(student)),
            Err(Error::NotFound { .. }) => Ok(Scope::Unauthenticated),
            Err(other) => Err(other),
        };
    }
    Ok(Scope::Unauthenticated)
}

pub async fn session_scope(
    store: &dyn RecordStore,
    identity: Option<&Identity>,
) -> Result<Scope, Error> {
    resolve_scope(store, identity, None, &TokenPolicy::default()).await
}

/// Exact token match. Unknown, malformed and expired tokens look identical.
pub async fn student_for_token(
    store: &dyn RecordStore,
    parent_token: &str,
    tokens: &TokenPolicy,
) -> Result<Student, Error> {
    let missing = || Error::not_found("No student for this link");
    if !token::is_well_formed(parent_token) {
        return Err(missing());
    }
    let student = store.student_by_token(parent_token).await?.ok_or_else(missing)?;
    if !tokens.is_live(student.token_issued_at, Utc::now()) {
        log::info!("expired parent link used for student {}", student.id);
        return Err(missing());
    }
    Ok(student)
}

/// Student whose primary link belongs to `tutor`.
pub async fn owned_student(
    store: &dyn RecordStore,
    tutor: &Tutor,
    student_id: Uuid,
) -> Result<Student, Error> {
    let missing = || Error::not_found(format!("Student `{}` not found", student_id));
    let owner = store.owner_of(student_id).await?.ok_or_else(missing)?;
    if owner.id != tutor.id {
        return Err(missing());
    }
    store.student(student_id).await?.ok_or_else(missing)
}

/// Student the tutor owns or is actively linked to.
pub async fn linked_student(
    store: &dyn RecordStore,
    tutor: &Tutor,
    student_id: Uuid,
) -> Result<Student, Error> {
    let missing = || Error::not_found(format!("Student `{}` not found", student_id));
    match store.link(tutor.id, student_id).await? {
        Some(link) if link.active => store.student(student_id).await?.ok_or_else(missing),
        _ => Err(missing()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::CapacityPolicy;
    use crate::models::tests::student;
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn identity(subject: &str) -> Identity {
        Identity {
            subject: subject.to_string(),
            email: None,
        }
    }

    async fn seeded() -> (MemoryStore, Tutor, Student) {
        let store = MemoryStore::new();
        let tutor = store
            .insert_tutor(Tutor {
                id: Uuid::new_v4(),
                auth_subject: "auth|tutor".into(),
                email: "tutor@example.com".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let owned = store
            .insert_owned_student(tutor.id, student("Ada", true), CapacityPolicy::default())
            .await
            .unwrap();
        (store, tutor, owned)
    }

    #[tokio::test]
    async fn tutor_identity_wins() {
        let (store, tutor, owned) = seeded().await;
        let scope = resolve_scope(
            &store,
            Some(&identity("auth|tutor")),
            Some(&owned.parent_link_token),
            &TokenPolicy::default(),
        )
        .await
        .unwrap();
        assert_eq!(scope, Scope::TutorOwner(tutor));
    }

    #[tokio::test]
    async fn self_registered_student_scope() {
        let (store, _, _) = seeded().await;
        let mut me = student("Grace", true);
        me.auth_subject = Some("auth|grace".into());
        let me = store.insert_student(me).await.unwrap();
        let scope = session_scope(&store, Some(&identity("auth|grace"))).await.unwrap();
        assert_eq!(scope, Scope::StudentOwner(me));
    }

    #[tokio::test]
    async fn token_gives_parent_viewer() {
        let (store, _, owned) = seeded().await;
        let scope = resolve_scope(&store, None, Some(&owned.parent_link_token), &TokenPolicy::default())
            .await
            .unwrap();
        assert_eq!(scope.kind(), "ParentViewer");
        assert!(scope.tutor().is_err());
    }

    #[tokio::test]
    async fn unknown_identity_does_not_fall_back_to_token() {
        let (store, _, owned) = seeded().await;
        let scope = resolve_scope(
            &store,
            Some(&identity("auth|stranger")),
            Some(&owned.parent_link_token),
            &TokenPolicy::default(),
        )
        .await
        .unwrap();
        assert_eq!(scope, Scope::Unauthenticated);
        assert!(matches!(scope.tutor(), Err(Error::Unauthenticated { .. })));
    }

    #[tokio::test]
    async fn unknown_and_expired_tokens_are_not_found() {
        let (store, _, owned) = seeded().await;
        let policy = TokenPolicy::default();
        assert!(matches!(
            student_for_token(&store, &token::generate(), &policy).await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            student_for_token(&store, "../etc", &policy).await,
            Err(Error::NotFound { .. })
        ));

        let expired = TokenPolicy::with_ttl(Duration::seconds(-1));
        assert!(matches!(
            student_for_token(&store, &owned.parent_link_token, &expired).await,
            Err(Error::NotFound { .. })
        ));
        assert_eq!(
            student_for_token(&store, &owned.parent_link_token, &policy)
                .await
                .unwrap()
                .id,
            owned.id
        );
    }

    #[tokio::test]
    async fn other_tutors_students_are_not_found() {
        let (store, _, owned) = seeded().await;
        let other = store
            .insert_tutor(Tutor {
                id: Uuid::new_v4(),
                auth_subject: "auth|other".into(),
                email: "other@example.com".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(matches!(
            owned_student(&store, &other, owned.id).await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            linked_student(&store, &other, owned.id).await,
            Err(Error::NotFound { .. })
        ));
    }
}
