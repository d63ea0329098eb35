use axum::Extension;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::access::{self, Identity, Scope};
use crate::extract::{Json, Path};
use crate::models::{
    CreateSession, Deleted, Session, SessionList, SessionStatus, Tutor, UpdateSession, Validator,
};
use crate::routes::AppContext;
use crate::{breaks, proceeds, Error, Payload};

#[derive(Debug, Clone, Serialize)]
pub struct NotificationQueued {
    pub session_id: Uuid,
    pub queued: bool,
}

/// Session written by this tutor; anything else is reported missing.
async fn authored_session(ctx: &AppContext, tutor: &Tutor, session_id: Uuid) -> Result<Session, Error> {
    ctx.store
        .session(session_id)
        .await?
        .filter(|s| s.tutor_id == tutor.id)
        .ok_or_else(|| Error::not_found(format!("Session `{}` not found", session_id)))
}

pub async fn list_sessions(
    identity: Option<Identity>,
    Path(student_id): Path<Uuid>,
    Extension(ctx): Extension<AppContext>,
) -> Payload<SessionList<Session>> {
    let sessions = match ctx.scope(identity.as_ref()).await? {
        Scope::TutorOwner(tutor) => {
            access::linked_student(ctx.store.as_ref(), &tutor, student_id).await?;
            ctx.store.sessions_of(student_id, Some(tutor.id)).await?
        }
        Scope::StudentOwner(me) if me.id == student_id => {
            ctx.store.sessions_of(student_id, None).await?
        }
        Scope::Unauthenticated => return breaks(Error::unauthenticated()),
        _ => return breaks(Error::not_found(format!("Student `{}` not found", student_id))),
    };
    proceeds(SessionList { sessions })
}

pub async fn create_session(
    identity: Option<Identity>,
    Path(student_id): Path<Uuid>,
    Extension(ctx): Extension<AppContext>,
    Json(body): Json<CreateSession>,
) -> Payload<Session> {
    let scope = ctx.scope(identity.as_ref()).await?;
    let tutor = scope.tutor()?;
    access::linked_student(ctx.store.as_ref(), tutor, student_id).await?;
    Validator::default()
        .time_range(body.start_time, body.end_time)
        .finish()?;

    let session = ctx
        .store
        .insert_session(Session {
            id: Uuid::new_v4(),
            student_id,
            tutor_id: tutor.id,
            start_time: body.start_time,
            end_time: body.end_time,
            status: body.status.unwrap_or(SessionStatus::Scheduled),
            notes: body.notes,
            homework: body.homework,
            created_at: Utc::now(),
        })
        .await?;
    proceeds(session)
}

pub async fn update_session(
    identity: Option<Identity>,
    Path(session_id): Path<Uuid>,
    Extension(ctx): Extension<AppContext>,
    Json(patch): Json<UpdateSession>,
) -> Payload<Session> {
    let scope = ctx.scope(identity.as_ref()).await?;
    let tutor = scope.tutor()?;
    let mut session = authored_session(&ctx, tutor, session_id).await?;
    patch.apply(&mut session)?;
    proceeds(ctx.store.update_session(session).await?)
}

pub async fn delete_session(
    identity: Option<Identity>,
    Path(session_id): Path<Uuid>,
    Extension(ctx): Extension<AppContext>,
) -> Payload<Deleted> {
    let scope = ctx.scope(identity.as_ref()).await?;
    let tutor = scope.tutor()?;
    authored_session(&ctx, tutor, session_id).await?;
    let deleted = ctx.store.delete_session(session_id).await?;
    proceeds(Deleted {
        id: session_id,
        deleted,
    })
}

pub async fn notify_session(
    identity: Option<Identity>,
    Path(session_id): Path<Uuid>,
    Extension(ctx): Extension<AppContext>,
) -> Payload<NotificationQueued> {
    let scope = ctx.scope(identity.as_ref()).await?;
    let tutor = scope.tutor()?;
    authored_session(&ctx, tutor, session_id).await?;
    ctx.notifier.session_summary(session_id).await?;
    proceeds(NotificationQueued {
        session_id,
        queued: true,
    })
}
