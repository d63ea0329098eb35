use chrono::Utc;
use uuid::Uuid;

use crate::err::Error;
use crate::models::{
    ConnectionStatus, LinkedPair, StudentTutorConnection, Tutor, TutorStudent, Validator,
};
use crate::store::RecordStore;

fn tutor_missing(id: Uuid) -> Error {
    Error::not_found(format!("Tutor `{}` not found", id))
}

fn student_missing(id: Uuid) -> Error {
    Error::not_found(format!("Student `{}` not found", id))
}

/// Links a tutor and a student. One row per pair: a second subject for the
/// same pair is a `Conflict`, as is linking a student the tutor already owns.
/// Any other student must have asked this tutor first through a connection
/// that was not declined; without one the student is reported missing.
pub async fn create_tutor_student_link(
    store: &dyn RecordStore,
    tutor_id: Uuid,
    student_id: Uuid,
    subject: &str,
    notes: Option<String>,
) -> Result<LinkedPair, Error> {
    Validator::default().text("subject", subject).finish()?;

    let tutor = store.tutor(tutor_id).await?.ok_or_else(|| tutor_missing(tutor_id))?;
    let student = store
        .student(student_id)
        .await?
        .ok_or_else(|| student_missing(student_id))?;

    if store.link(tutor_id, student_id).await?.is_some() {
        return Err(Error::conflict("Tutor and student are already linked"));
    }
    let requested = store
        .connections_of_student(student_id, None)
        .await?
        .iter()
        .any(|c| c.tutor_id == tutor_id && c.status != ConnectionStatus::Declined);
    if !requested {
        log::debug!("tutor {} has no request from student {}", tutor_id, student_id);
        return Err(student_missing(student_id));
    }

    let link = store
        .insert_link(TutorStudent {
            id: Uuid::new_v4(),
            tutor_id,
            student_id,
            subject: subject.trim().to_string(),
            notes,
            active: true,
            is_primary: false,
            started_at: Utc::now(),
        })
        .await?;
    log::info!("tutor {} linked to student {}", tutor_id, student_id);
    Ok(LinkedPair {
        link,
        tutor,
        student,
    })
}

/// Opens a pending request. The same student may ask the same tutor again
/// for a different subject.
pub async fn create_connection_request(
    store: &dyn RecordStore,
    student_id: Uuid,
    tutor_id: Uuid,
    subject: &str,
    message: Option<String>,
) -> Result<StudentTutorConnection, Error> {
    Validator::default().text("subject", subject).finish()?;
    let subject = subject.trim();

    store
        .student(student_id)
        .await?
        .ok_or_else(|| student_missing(student_id))?;
    store.tutor(tutor_id).await?.ok_or_else(|| tutor_missing(tutor_id))?;

    let existing = store.connections_of_student(student_id, None).await?;
    if existing
        .iter()
        .any(|c| c.tutor_id == tutor_id && c.subject == subject)
    {
        return Err(Error::conflict(format!(
            "A connection for `{}` was already requested",
            subject
        )));
    }

    let now = Utc::now();
    let connection = store
        .insert_connection(StudentTutorConnection {
            id: Uuid::new_v4(),
            student_id,
            tutor_id,
            subject: subject.to_string(),
            message,
            status: ConnectionStatus::Pending,
            created_at: now,
            updated_at: now,
        })
        .await?;
    Ok(connection)
}

pub async fn list_connections(
    store: &dyn RecordStore,
    student_id: Uuid,
    status: Option<ConnectionStatus>,
) -> Result<Vec<StudentTutorConnection>, Error> {
    Ok(store.connections_of_student(student_id, status).await?)
}

pub async fn list_incoming(
    store: &dyn RecordStore,
    tutor: &Tutor,
    status: Option<ConnectionStatus>,
) -> Result<Vec<StudentTutorConnection>, Error> {
    Ok(store.connections_to_tutor(tutor.id, status).await?)
}

/// Accepting also links the pair unless a link already exists.
pub async fn respond_to_connection(
    store: &dyn RecordStore,
    tutor: &Tutor,
    connection_id: Uuid,
    accept: bool,
) -> Result<StudentTutorConnection, Error> {
    let connection = store
        .connection(connection_id)
        .await?
        .filter(|c| c.tutor_id == tutor.id)
        .ok_or_else(|| Error::not_found(format!("Connection `{}` not found", connection_id)))?;
    if connection.status != ConnectionStatus::Pending {
        return Err(Error::conflict("Connection was already answered"));
    }

    let (status, link) = if accept {
        let link = TutorStudent {
            id: Uuid::new_v4(),
            tutor_id: tutor.id,
            student_id: connection.student_id,
            subject: connection.subject.clone(),
            notes: connection.message.clone(),
            active: true,
            is_primary: false,
            started_at: Utc::now(),
        };
        (ConnectionStatus::Accepted, Some(link))
    } else {
        (ConnectionStatus::Declined, None)
    };
    let answered = store
        .respond_to_connection(connection_id, status, link)
        .await?;
    log::info!(
        "tutor {} answered connection {} with {:?}",
        tutor.id,
        connection_id,
        answered.status
    );
    Ok(answered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::CapacityPolicy;
    use crate::models::tests::student;
    use crate::models::Student;
    use crate::store::MemoryStore;

    async fn tutor(store: &MemoryStore, subject: &str) -> Tutor {
        store
            .insert_tutor(Tutor {
                id: Uuid::new_v4(),
                auth_subject: subject.into(),
                email: format!("{}@example.com", subject),
                created_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    async fn independent(store: &MemoryStore, name: &str) -> Student {
        store.insert_student(student(name, true)).await.unwrap()
    }

    #[tokio::test]
    async fn link_returns_both_parties() {
        let store = MemoryStore::new();
        let t = tutor(&store, "x").await;
        let a = independent(&store, "A").await;
        create_connection_request(&store, a.id, t.id, "Math", None)
            .await
            .unwrap();
        let pair = create_tutor_student_link(&store, t.id, a.id, "Math", Some("weekly".into()))
            .await
            .unwrap();
        assert_eq!(pair.tutor.id, t.id);
        assert_eq!(pair.student.id, a.id);
        assert!(!pair.link.is_primary);
        assert_eq!(pair.link.notes.as_deref(), Some("weekly"));
    }

    #[tokio::test]
    async fn second_subject_for_same_pair_conflicts() {
        let store = MemoryStore::new();
        let t = tutor(&store, "x").await;
        let a = independent(&store, "A").await;
        create_connection_request(&store, a.id, t.id, "Math", None)
            .await
            .unwrap();
        create_tutor_student_link(&store, t.id, a.id, "Math", None)
            .await
            .unwrap();
        let res = create_tutor_student_link(&store, t.id, a.id, "Physics", None).await;
        assert!(matches!(res, Err(Error::Conflict { .. })));
        assert_eq!(store.links_of(t.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn link_to_missing_party_is_not_found() {
        let store = MemoryStore::new();
        let t = tutor(&store, "x").await;
        let a = independent(&store, "A").await;
        assert!(matches!(
            create_tutor_student_link(&store, t.id, Uuid::new_v4(), "Math", None).await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            create_tutor_student_link(&store, Uuid::new_v4(), a.id, "Math", None).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn student_owned_elsewhere_cannot_be_linked() {
        let store = MemoryStore::new();
        let owner = tutor(&store, "x").await;
        let intruder = tutor(&store, "y").await;
        let owned = store
            .insert_owned_student(owner.id, student("Ada", true), CapacityPolicy::default())
            .await
            .unwrap();
        let loose = independent(&store, "B").await;

        for id in [owned.id, loose.id] {
            assert!(matches!(
                create_tutor_student_link(&store, intruder.id, id, "Math", None).await,
                Err(Error::NotFound { .. })
            ));
        }
        assert!(store.links_of(intruder.id).await.unwrap().is_empty());

        // a declined request does not open the door either
        let c = create_connection_request(&store, loose.id, intruder.id, "Math", None)
            .await
            .unwrap();
        respond_to_connection(&store, &intruder, c.id, false).await.unwrap();
        assert!(matches!(
            create_tutor_student_link(&store, intruder.id, loose.id, "Math", None).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn connections_are_unique_per_subject() {
        let store = MemoryStore::new();
        let t = tutor(&store, "x").await;
        let a = independent(&store, "A").await;
        create_connection_request(&store, a.id, t.id, "Math", None)
            .await
            .unwrap();
        create_connection_request(&store, a.id, t.id, "Physics", Some("hi".into()))
            .await
            .unwrap();
        assert!(matches!(
            create_connection_request(&store, a.id, t.id, "Math", None).await,
            Err(Error::Conflict { .. })
        ));

        let all = list_connections(&store, a.id, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].subject, "Physics");
        assert!(all.iter().all(|c| c.status == ConnectionStatus::Pending));
    }

    #[tokio::test]
    async fn accepting_links_and_filters() {
        let store = MemoryStore::new();
        let t = tutor(&store, "x").await;
        let a = independent(&store, "A").await;
        let math = create_connection_request(&store, a.id, t.id, "Math", None)
            .await
            .unwrap();
        let art = create_connection_request(&store, a.id, t.id, "Art", None)
            .await
            .unwrap();

        let accepted = respond_to_connection(&store, &t, math.id, true).await.unwrap();
        assert_eq!(accepted.status, ConnectionStatus::Accepted);
        assert!(store.link(t.id, a.id).await.unwrap().is_some());

        // the pair is already linked, accepting another subject keeps one row
        respond_to_connection(&store, &t, art.id, true).await.unwrap();
        assert_eq!(store.links_of(t.id).await.unwrap().len(), 1);

        assert!(matches!(
            respond_to_connection(&store, &t, math.id, false).await,
            Err(Error::Conflict { .. })
        ));
        let pending = list_connections(&store, a.id, Some(ConnectionStatus::Pending))
            .await
            .unwrap();
        assert!(pending.is_empty());
        let incoming = list_incoming(&store, &t, Some(ConnectionStatus::Accepted))
            .await
            .unwrap();
        assert_eq!(incoming.len(), 2);
    }

    #[tokio::test]
    async fn only_addressee_may_respond() {
        let store = MemoryStore::new();
        let t = tutor(&store, "x").await;
        let other = tutor(&store, "y").await;
        let a = independent(&store, "A").await;
        let c = create_connection_request(&store, a.id, t.id, "Math", None)
            .await
            .unwrap();
        assert!(matches!(
            respond_to_connection(&store, &other, c.id, true).await,
            Err(Error::NotFound { .. })
        ));
    }
}
