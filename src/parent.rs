use axum::Extension;
use uuid::Uuid;

use crate::access::{self, Scope};
use crate::extract::Path;
use crate::models::{ParentSession, PublicStudent, SessionList, Student};
use crate::routes::AppContext;
use crate::{proceeds, Error, Payload};

async fn viewer(ctx: &AppContext, token: &str) -> Result<Student, Error> {
    match access::resolve_scope(ctx.store.as_ref(), None, Some(token), &ctx.tokens).await? {
        Scope::ParentViewer(student) => Ok(student),
        _ => Err(Error::not_found("No student for this link")),
    }
}

async fn project(ctx: &AppContext, student: &Student) -> Result<PublicStudent, Error> {
    let owner = ctx.store.owner_of(student.id).await?;
    Ok(PublicStudent::project(student, owner.as_ref()))
}

pub async fn public_student(
    Path(student_id): Path<Uuid>,
    Extension(ctx): Extension<AppContext>,
) -> Payload<PublicStudent> {
    let student = ctx
        .store
        .student(student_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("Student `{}` not found", student_id)))?;
    proceeds(project(&ctx, &student).await?)
}

pub async fn student_by_token(
    Path(token): Path<String>,
    Extension(ctx): Extension<AppContext>,
) -> Payload<PublicStudent> {
    let student = viewer(&ctx, &token).await?;
    proceeds(project(&ctx, &student).await?)
}

pub async fn sessions_by_token(
    Path(token): Path<String>,
    Extension(ctx): Extension<AppContext>,
) -> Payload<SessionList<ParentSession>> {
    let student = viewer(&ctx, &token).await?;
    let sessions = ctx
        .store
        .sessions_of(student.id, None)
        .await?
        .into_iter()
        .map(ParentSession::from)
        .collect();
    proceeds(SessionList { sessions })
}
