use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::{RecordStore, StoreError, StoreResult};
use crate::capacity::CapacityPolicy;
use crate::models::{
    ConnectionStatus, Session, Student, StudentTutorConnection, Tutor, TutorStudent, UpdateStudent,
};

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

const INSERT_STUDENT: &str = "INSERT INTO students \
    (id, full_name, subject, year, active, parent_email, parent_link_token, token_issued_at, email, auth_subject, created_at) \
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) RETURNING *";

const INSERT_LINK: &str = "INSERT INTO tutor_students \
    (id, tutor_id, student_id, subject, notes, active, is_primary, started_at) \
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)";

const COUNT_ACTIVE: &str = "SELECT COUNT(*) FROM students s \
    JOIN tutor_students ts ON ts.student_id = s.id \
    WHERE ts.tutor_id = $1 AND ts.is_primary AND s.active AND s.id <> $2";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some(UNIQUE_VIOLATION) => {
                    log::info!("unique constraint rejected write: {}", db.message());
                    StoreError::Conflict("Record already exists".to_string())
                }
                Some(FOREIGN_KEY_VIOLATION) => StoreError::Missing("related record"),
                _ => StoreError::Internal(db.to_string()),
            },
            sqlx::Error::Io(io) => StoreError::Unavailable(io.to_string()),
            sqlx::Error::Tls(tls) => StoreError::Unavailable(tls.to_string()),
            sqlx::Error::PoolTimedOut => StoreError::Unavailable("pool timed out".to_string()),
            sqlx::Error::PoolClosed => StoreError::Unavailable("pool closed".to_string()),
            sqlx::Error::WorkerCrashed => StoreError::Unavailable("worker crashed".to_string()),
            sqlx::Error::RowNotFound => StoreError::Missing("record"),
            other => StoreError::Internal(other.to_string()),
        }
    }
}

/// Postgres-backed store. Capacity-sensitive writes lock the tutor row
/// (`FOR UPDATE`) so concurrent activations for one tutor serialize.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

async fn lock_tutor(tx: &mut Transaction<'_, Postgres>, tutor_id: Uuid) -> StoreResult<()> {
    sqlx::query("SELECT id FROM tutors WHERE id = $1 FOR UPDATE")
        .bind(tutor_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::Missing("tutor"))?;
    Ok(())
}

async fn active_excluding(
    tx: &mut Transaction<'_, Postgres>,
    tutor_id: Uuid,
    candidate: Uuid,
) -> StoreResult<usize> {
    let count: i64 = sqlx::query_scalar(COUNT_ACTIVE)
        .bind(tutor_id)
        .bind(candidate)
        .fetch_one(&mut *tx)
        .await?;
    Ok(count.max(0) as usize)
}

async fn insert_student_row(tx: &mut Transaction<'_, Postgres>, student: &Student) -> StoreResult<Student> {
    let row = sqlx::query_as::<_, Student>(INSERT_STUDENT)
        .bind(student.id)
        .bind(&student.full_name)
        .bind(&student.subject)
        .bind(&student.year)
        .bind(student.active)
        .bind(&student.parent_email)
        .bind(&student.parent_link_token)
        .bind(student.token_issued_at)
        .bind(&student.email)
        .bind(&student.auth_subject)
        .bind(student.created_at)
        .fetch_one(&mut *tx)
        .await?;
    Ok(row)
}

fn bind_link<'q>(
    query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    link: &'q TutorStudent,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(link.id)
        .bind(link.tutor_id)
        .bind(link.student_id)
        .bind(&link.subject)
        .bind(&link.notes)
        .bind(link.active)
        .bind(link.is_primary)
        .bind(link.started_at)
}

#[async_trait]
impl RecordStore for PgStore {
    async fn insert_tutor(&self, tutor: Tutor) -> StoreResult<Tutor> {
        let row = sqlx::query_as::<_, Tutor>(
            "INSERT INTO tutors (id, auth_subject, email, created_at) VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(tutor.id)
        .bind(&tutor.auth_subject)
        .bind(&tutor.email)
        .bind(tutor.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn tutor(&self, id: Uuid) -> StoreResult<Option<Tutor>> {
        let row = sqlx::query_as::<_, Tutor>("SELECT * FROM tutors WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn tutor_by_subject(&self, auth_subject: &str) -> StoreResult<Option<Tutor>> {
        let row = sqlx::query_as::<_, Tutor>("SELECT * FROM tutors WHERE auth_subject = $1 LIMIT 1")
            .bind(auth_subject)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn insert_student(&self, student: Student) -> StoreResult<Student> {
        let mut tx = self.pool.begin().await?;
        let row = insert_student_row(&mut tx, &student).await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn insert_owned_student(
        &self,
        tutor_id: Uuid,
        student: Student,
        policy: CapacityPolicy,
    ) -> StoreResult<Student> {
        let mut tx = self.pool.begin().await?;
        lock_tutor(&mut tx, tutor_id).await?;
        if student.active {
            let active = active_excluding(&mut tx, tutor_id, student.id).await?;
            policy.decide(active).into_result().map_err(StoreError::Capacity)?;
        }
        let row = insert_student_row(&mut tx, &student).await?;

        let link = TutorStudent {
            id: Uuid::new_v4(),
            tutor_id,
            student_id: row.id,
            subject: row.subject.clone(),
            notes: None,
            active: true,
            is_primary: true,
            started_at: row.created_at,
        };
        bind_link(sqlx::query(INSERT_LINK), &link)
            .execute(&mut tx)
            .await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn student(&self, id: Uuid) -> StoreResult<Option<Student>> {
        let row = sqlx::query_as::<_, Student>("SELECT * FROM students WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn student_by_subject(&self, auth_subject: &str) -> StoreResult<Option<Student>> {
        let row = sqlx::query_as::<_, Student>("SELECT * FROM students WHERE auth_subject = $1 LIMIT 1")
            .bind(auth_subject)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn student_by_token(&self, token: &str) -> StoreResult<Option<Student>> {
        let row = sqlx::query_as::<_, Student>(
            "SELECT * FROM students WHERE parent_link_token = $1 LIMIT 1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn owner_of(&self, student_id: Uuid) -> StoreResult<Option<Tutor>> {
        let row = sqlx::query_as::<_, Tutor>(
            "SELECT t.* FROM tutors t JOIN tutor_students ts ON ts.tutor_id = t.id \
             WHERE ts.student_id = $1 AND ts.is_primary LIMIT 1",
        )
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn roster(&self, tutor_id: Uuid) -> StoreResult<Vec<Student>> {
        let rows = sqlx::query_as::<_, Student>(
            "SELECT s.* FROM students s JOIN tutor_students ts ON ts.student_id = s.id \
             WHERE ts.tutor_id = $1 AND ts.is_primary ORDER BY s.created_at DESC",
        )
        .bind(tutor_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_student(
        &self,
        tutor_id: Uuid,
        student_id: Uuid,
        patch: UpdateStudent,
        policy: CapacityPolicy,
    ) -> StoreResult<Student> {
        let mut tx = self.pool.begin().await?;
        lock_tutor(&mut tx, tutor_id).await?;
        let mut student = sqlx::query_as::<_, Student>(
            "SELECT s.* FROM students s JOIN tutor_students ts ON ts.student_id = s.id \
             WHERE s.id = $1 AND ts.tutor_id = $2 AND ts.is_primary FOR UPDATE OF s",
        )
        .bind(student_id)
        .bind(tutor_id)
        .fetch_optional(&mut tx)
        .await?
        .ok_or(StoreError::Missing("student"))?;

        if patch.active == Some(true) {
            let active = active_excluding(&mut tx, tutor_id, student_id).await?;
            policy.decide(active).into_result().map_err(StoreError::Capacity)?;
        }
        patch.apply(&mut student);

        let row = sqlx::query_as::<_, Student>(
            "UPDATE students SET full_name = $2, subject = $3, year = $4, parent_email = $5, active = $6 \
             WHERE id = $1 RETURNING *",
        )
        .bind(student.id)
        .bind(&student.full_name)
        .bind(&student.subject)
        .bind(&student.year)
        .bind(&student.parent_email)
        .bind(student.active)
        .fetch_one(&mut tx)
        .await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn delete_student(&self, student_id: Uuid) -> StoreResult<bool> {
        let res = sqlx::query("DELETE FROM students WHERE id = $1")
            .bind(student_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() >= 1)
    }

    async fn link(&self, tutor_id: Uuid, student_id: Uuid) -> StoreResult<Option<TutorStudent>> {
        let row = sqlx::query_as::<_, TutorStudent>(
            "SELECT * FROM tutor_students WHERE tutor_id = $1 AND student_id = $2 LIMIT 1",
        )
        .bind(tutor_id)
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn links_of(&self, tutor_id: Uuid) -> StoreResult<Vec<TutorStudent>> {
        let rows = sqlx::query_as::<_, TutorStudent>(
            "SELECT * FROM tutor_students WHERE tutor_id = $1 ORDER BY started_at DESC",
        )
        .bind(tutor_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn insert_link(&self, link: TutorStudent) -> StoreResult<TutorStudent> {
        let sql = format!("{} RETURNING *", INSERT_LINK);
        let row = sqlx::query_as::<_, TutorStudent>(&sql)
            .bind(link.id)
            .bind(link.tutor_id)
            .bind(link.student_id)
            .bind(&link.subject)
            .bind(&link.notes)
            .bind(link.active)
            .bind(link.is_primary)
            .bind(link.started_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn connection(&self, id: Uuid) -> StoreResult<Option<StudentTutorConnection>> {
        let row = sqlx::query_as::<_, StudentTutorConnection>(
            "SELECT * FROM student_tutor_connections WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert_connection(
        &self,
        connection: StudentTutorConnection,
    ) -> StoreResult<StudentTutorConnection> {
        let row = sqlx::query_as::<_, StudentTutorConnection>(
            "INSERT INTO student_tutor_connections \
             (id, student_id, tutor_id, subject, message, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *",
        )
        .bind(connection.id)
        .bind(connection.student_id)
        .bind(connection.tutor_id)
        .bind(&connection.subject)
        .bind(&connection.message)
        .bind(connection.status)
        .bind(connection.created_at)
        .bind(connection.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn connections_of_student(
        &self,
        student_id: Uuid,
        status: Option<ConnectionStatus>,
    ) -> StoreResult<Vec<StudentTutorConnection>> {
        let rows = sqlx::query_as::<_, StudentTutorConnection>(
            "SELECT * FROM student_tutor_connections \
             WHERE student_id = $1 AND ($2::connection_status IS NULL OR status = $2) \
             ORDER BY created_at DESC",
        )
        .bind(student_id)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn connections_to_tutor(
        &self,
        tutor_id: Uuid,
        status: Option<ConnectionStatus>,
    ) -> StoreResult<Vec<StudentTutorConnection>> {
        let rows = sqlx::query_as::<_, StudentTutorConnection>(
            "SELECT * FROM student_tutor_connections \
             WHERE tutor_id = $1 AND ($2::connection_status IS NULL OR status = $2) \
             ORDER BY created_at DESC",
        )
        .bind(tutor_id)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn respond_to_connection(
        &self,
        id: Uuid,
        status: ConnectionStatus,
        link: Option<TutorStudent>,
    ) -> StoreResult<StudentTutorConnection> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query_as::<_, StudentTutorConnection>(
            "UPDATE student_tutor_connections SET status = $2, updated_at = now() \
             WHERE id = $1 AND status = 'pending' RETURNING *",
        )
        .bind(id)
        .bind(status)
        .fetch_optional(&mut tx)
        .await?;

        let connection = match updated {
            Some(connection) => connection,
            None => {
                let exists = sqlx::query("SELECT id FROM student_tutor_connections WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&mut tx)
                    .await?
                    .is_some();
                return Err(if exists {
                    StoreError::Conflict("connection was already answered".to_string())
                } else {
                    StoreError::Missing("connection")
                });
            }
        };

        if let Some(link) = link.as_ref() {
            let sql = format!("{} ON CONFLICT (tutor_id, student_id) DO NOTHING", INSERT_LINK);
            bind_link(sqlx::query(&sql), link).execute(&mut tx).await?;
        }
        tx.commit().await?;
        Ok(connection)
    }

    async fn insert_session(&self, session: Session) -> StoreResult<Session> {
        let row = sqlx::query_as::<_, Session>(
            "INSERT INTO sessions \
             (id, student_id, tutor_id, start_time, end_time, status, notes, homework, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING *",
        )
        .bind(session.id)
        .bind(session.student_id)
        .bind(session.tutor_id)
        .bind(session.start_time)
        .bind(session.end_time)
        .bind(session.status)
        .bind(&session.notes)
        .bind(&session.homework)
        .bind(session.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn session(&self, id: Uuid) -> StoreResult<Option<Session>> {
        let row = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn sessions_of(&self, student_id: Uuid, tutor_id: Option<Uuid>) -> StoreResult<Vec<Session>> {
        let rows = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE student_id = $1 AND ($2::uuid IS NULL OR tutor_id = $2) \
             ORDER BY start_time DESC",
        )
        .bind(student_id)
        .bind(tutor_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_session(&self, session: Session) -> StoreResult<Session> {
        let row = sqlx::query_as::<_, Session>(
            "UPDATE sessions SET start_time = $2, end_time = $3, status = $4, notes = $5, homework = $6 \
             WHERE id = $1 RETURNING *",
        )
        .bind(session.id)
        .bind(session.start_time)
        .bind(session.end_time)
        .bind(session.status)
        .bind(&session.notes)
        .bind(&session.homework)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::Missing("session"))?;
        Ok(row)
    }

    async fn delete_session(&self, id: Uuid) -> StoreResult<bool> {
        let res = sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() >= 1)
    }
}

/// These run against a live database named by `DATABASE_URL`:
/// `cargo test -- --ignored`.
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::models::tests::student;

    async fn store() -> Option<PgStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let store = PgStore::connect(&url, 16).await.unwrap();
        store.migrate().await.unwrap();
        Some(store)
    }

    async fn tutor(store: &PgStore) -> Tutor {
        let id = Uuid::new_v4();
        store
            .insert_tutor(Tutor {
                id,
                auth_subject: format!("auth|{}", id),
                email: format!("{}@example.com", id),
                created_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore]
    async fn concurrent_activations_at_nineteen_admit_exactly_one() {
        let store = match store().await {
            Some(store) => Arc::new(store),
            None => return,
        };
        let t = tutor(&store).await;
        let policy = CapacityPolicy::default();
        for i in 0..19 {
            store
                .insert_owned_student(t.id, student(&format!("active {}", i), true), policy)
                .await
                .unwrap();
        }
        let mut dormant = Vec::new();
        for i in 0..10 {
            let s = store
                .insert_owned_student(t.id, student(&format!("dormant {}", i), false), policy)
                .await
                .unwrap();
            dormant.push(s.id);
        }

        let tutor_id = t.id;
        let mut handles = Vec::new();
        for id in dormant {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let patch = UpdateStudent {
                    active: Some(true),
                    ..Default::default()
                };
                store.update_student(tutor_id, id, patch, policy).await
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
    #[ignore]
    async fn constraint_violations_map_to_store_errors() {
        let store = match store().await {
            Some(store) => store,
            None => return,
        };
        let t = tutor(&store).await;
        let again = Tutor {
            id: Uuid::new_v4(),
            ..t.clone()
        };
        assert!(matches!(
            store.insert_tutor(again).await,
            Err(StoreError::Conflict(_))
        ));

        let dangling = TutorStudent {
            id: Uuid::new_v4(),
            tutor_id: t.id,
            student_id: Uuid::new_v4(),
            subject: "Math".into(),
            notes: None,
            active: true,
            is_primary: false,
            started_at: Utc::now(),
        };
        assert!(matches!(
            store.insert_link(dangling).await,
            Err(StoreError::Missing(_))
        ));
    }
}
