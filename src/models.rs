use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;

use crate::err::{Error, FieldError};

const MAX_TEXT_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tutor {
    pub id: Uuid,
    #[serde(skip_serializing)]
    pub auth_subject: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Student {
    pub id: Uuid,
    pub full_name: String,
    pub subject: String,
    pub year: String,
    pub active: bool,
    pub parent_email: Option<String>,
    pub parent_link_token: String,
    pub token_issued_at: DateTime<Utc>,
    /// Set only for self-registered students.
    pub email: Option<String>,
    #[serde(skip_serializing)]
    pub auth_subject: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TutorStudent {
    pub id: Uuid,
    pub tutor_id: Uuid,
    pub student_id: Uuid,
    pub subject: String,
    pub notes: Option<String>,
    pub active: bool,
    /// The owning relationship created together with the student.
    pub is_primary: bool,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "connection_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Pending,
    Accepted,
    Declined,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StudentTutorConnection {
    pub id: Uuid,
    pub student_id: Uuid,
    pub tutor_id: Uuid,
    pub subject: String,
    pub message: Option<String>,
    pub status: ConnectionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "session_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Scheduled,
    Completed,
    Cancelled,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: Uuid,
    pub student_id: Uuid,
    pub tutor_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: SessionStatus,
    pub notes: Option<String>,
    pub homework: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The only student fields visible without a session.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublicStudent {
    pub id: Uuid,
    pub full_name: String,
    pub subject: String,
    pub year: String,
    pub active: bool,
    pub tutor_email: Option<String>,
}

impl PublicStudent {
    pub fn project(student: &Student, owner: Option<&Tutor>) -> Self {
        Self {
            id: student.id,
            full_name: student.full_name.clone(),
            subject: student.subject.clone(),
            year: student.year.clone(),
            active: student.active,
            tutor_email: owner.map(|t| t.email.clone()),
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParentSession {
    pub id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: SessionStatus,
    pub notes: Option<String>,
    pub homework: Option<String>,
}

impl From<Session> for ParentSession {
    fn from(session: Session) -> Self {
        Self {
            id: session.id,
            start_time: session.start_time,
            end_time: session.end_time,
            status: session.status,
            notes: session.notes,
            homework: session.homework,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkedPair {
    pub link: TutorStudent,
    pub tutor: Tutor,
    pub student: Student,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentList {
    pub students: Vec<Student>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkList {
    pub links: Vec<TutorStudent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionList {
    pub connections: Vec<StudentTutorConnection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionList<S> {
    pub sessions: Vec<S>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Deleted {
    pub id: Uuid,
    pub deleted: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateStudent {
    pub full_name: String,
    pub subject: String,
    pub year: String,
    pub parent_email: Option<String>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateStudent {
    pub full_name: Option<String>,
    pub subject: Option<String>,
    pub year: Option<String>,
    pub parent_email: Option<String>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterStudent {
    pub full_name: String,
    pub subject: String,
    pub year: String,
    pub email: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateLink {
    pub student_id: Uuid,
    pub subject: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateConnection {
    pub tutor_id: Uuid,
    pub subject: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RespondConnection {
    pub accept: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusFilter {
    pub status: Option<ConnectionStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSession {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: Option<SessionStatus>,
    pub notes: Option<String>,
    pub homework: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateSession {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: Option<SessionStatus>,
    pub notes: Option<String>,
    pub homework: Option<String>,
}

/// Collects field problems so a request reports all of them at once.
#[derive(Debug, Default)]
pub struct Validator {
    fields: Vec<FieldError>,
}

impl Validator {
    pub fn text(&mut self, field: &'static str, value: &str) -> &mut Self {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            self.reject(field, "must not be blank");
        } else if trimmed.chars().count() > MAX_TEXT_LEN {
            self.reject(field, format!("must be at most {} characters", MAX_TEXT_LEN));
        }
        self
    }

    pub fn opt_text(&mut self, field: &'static str, value: Option<&str>) -> &mut Self {
        if let Some(value) = value {
            self.text(field, value);
        }
        self
    }

    pub fn email(&mut self, field: &'static str, value: &str) -> &mut Self {
        if !looks_like_email(value.trim()) {
            self.reject(field, "must be an email address");
        }
        self
    }

    pub fn opt_email(&mut self, field: &'static str, value: Option<&str>) -> &mut Self {
        if let Some(value) = value {
            self.email(field, value);
        }
        self
    }

    pub fn time_range(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> &mut Self {
        if end <= start {
            self.reject("end_time", "must be after start_time");
        }
        self
    }

    pub fn reject<S: Into<String>>(&mut self, field: &'static str, message: S) -> &mut Self {
        self.fields.push(FieldError {
            field,
            message: message.into(),
        });
        self
    }

    pub fn finish(&mut self) -> Result<(), Error> {
        if self.fields.is_empty() {
            Ok(())
        } else {
            Err(Error::invalid(std::mem::take(&mut self.fields)))
        }
    }
}

fn looks_like_email(value: &str) -> bool {
    let mut parts = value.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => {
            !local.is_empty() && !domain.is_empty() && !value.contains(char::is_whitespace)
        }
        _ => false,
    }
}

impl CreateStudent {
    pub fn validate(&self) -> Result<(), Error> {
        Validator::default()
            .text("full_name", &self.full_name)
            .text("subject", &self.subject)
            .text("year", &self.year)
            .opt_email("parent_email", self.parent_email.as_deref())
            .finish()
    }
}

impl UpdateStudent {
    pub fn validate(&self) -> Result<(), Error> {
        Validator::default()
            .opt_text("full_name", self.full_name.as_deref())
            .opt_text("subject", self.subject.as_deref())
            .opt_text("year", self.year.as_deref())
            .opt_email("parent_email", self.parent_email.as_deref())
            .finish()
    }

    pub fn apply(self, student: &mut Student) {
        if let Some(full_name) = self.full_name {
            student.full_name = full_name.trim().to_string();
        }
        if let Some(subject) = self.subject {
            student.subject = subject.trim().to_string();
        }
        if let Some(year) = self.year {
            student.year = year.trim().to_string();
        }
        if let Some(parent_email) = self.parent_email {
            student.parent_email = Some(parent_email.trim().to_string());
        }
        if let Some(active) = self.active {
            student.active = active;
        }
    }
}

impl RegisterStudent {
    pub fn validate(&self) -> Result<(), Error> {
        Validator::default()
            .text("full_name", &self.full_name)
            .text("subject", &self.subject)
            .text("year", &self.year)
            .email("email", &self.email)
            .finish()
    }
}

impl UpdateSession {
    pub fn apply(self, session: &mut Session) -> Result<(), Error> {
        let start = self.start_time.unwrap_or(session.start_time);
        let end = self.end_time.unwrap_or(session.end_time);
        Validator::default().time_range(start, end).finish()?;
        session.start_time = start;
        session.end_time = end;
        if let Some(status) = self.status {
            session.status = status;
        }
        if self.notes.is_some() {
            session.notes = self.notes;
        }
        if self.homework.is_some() {
            session.homework = self.homework;
        }
        Ok(())
    }
}
