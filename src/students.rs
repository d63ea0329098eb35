use axum::Extension;
use chrono::Utc;
use uuid::Uuid;

use crate::access::{self, Identity, Scope};
use crate::extract::{Json, Path};
use crate::models::{
    CreateStudent, Deleted, RegisterStudent, Student, StudentList, Tutor, UpdateStudent, Validator,
};
use crate::routes::AppContext;
use crate::{breaks, proceeds, token, Error, Payload};

pub async fn register_tutor(
    identity: Identity,
    Extension(ctx): Extension<AppContext>,
) -> Payload<Tutor> {
    let email = match identity.email.as_deref() {
        Some(email) => email.to_string(),
        None => return breaks(Error::invalid_field("email", "auth provider supplied no email")),
    };
    Validator::default().email("email", &email).finish()?;

    if !matches!(
        ctx.scope(Some(&identity)).await?,
        Scope::Unauthenticated
    ) {
        return breaks(Error::conflict("An account already exists for this identity"));
    }

    let tutor = ctx
        .store
        .insert_tutor(Tutor {
            id: Uuid::new_v4(),
            auth_subject: identity.subject,
            email,
            created_at: Utc::now(),
        })
        .await?;
    log::info!("registered tutor {}", tutor.id);
    proceeds(tutor)
}

pub async fn register_student(
    identity: Identity,
    Extension(ctx): Extension<AppContext>,
    Json(body): Json<RegisterStudent>,
) -> Payload<Student> {
    body.validate()?;
    if !matches!(
        ctx.scope(Some(&identity)).await?,
        Scope::Unauthenticated
    ) {
        return breaks(Error::conflict("An account already exists for this identity"));
    }

    let now = Utc::now();
    let student = ctx
        .store
        .insert_student(Student {
            id: Uuid::new_v4(),
            full_name: body.full_name.trim().to_string(),
            subject: body.subject.trim().to_string(),
            year: body.year.trim().to_string(),
            active: true,
            parent_email: None,
            parent_link_token: token::generate(),
            token_issued_at: now,
            email: Some(body.email.trim().to_string()),
            auth_subject: Some(identity.subject),
            created_at: now,
        })
        .await?;
    log::info!("self-registered student {}", student.id);
    proceeds(student)
}

pub async fn list_students(
    identity: Option<Identity>,
    Extension(ctx): Extension<AppContext>,
) -> Payload<StudentList> {
    let scope = ctx.scope(identity.as_ref()).await?;
    let tutor = scope.tutor()?;
    let students = ctx.store.roster(tutor.id).await?;
    proceeds(StudentList { students })
}

pub async fn create_student(
    identity: Option<Identity>,
    Extension(ctx): Extension<AppContext>,
    Json(body): Json<CreateStudent>,
) -> Payload<Student> {
    let scope = ctx.scope(identity.as_ref()).await?;
    let tutor = scope.tutor()?;
    body.validate()?;

    let active = body.active.unwrap_or(true);
    if active {
        // early exit before a token is issued; the store re-checks under lock
        let roster = ctx.store.roster(tutor.id).await?;
        if let Err(denial) = ctx.capacity.can_activate(&roster, None).into_result() {
            log::info!("tutor {} denied new active student: limit {}", tutor.id, denial.limit);
            return breaks(Error::capacity_exceeded(denial.limit));
        }
    }

    let now = Utc::now();
    let student = Student {
        id: Uuid::new_v4(),
        full_name: body.full_name.trim().to_string(),
        subject: body.subject.trim().to_string(),
        year: body.year.trim().to_string(),
        active,
        parent_email: body.parent_email.map(|e| e.trim().to_string()),
        parent_link_token: token::generate(),
        token_issued_at: now,
        email: None,
        auth_subject: None,
        created_at: now,
    };
    let student = ctx
        .store
        .insert_owned_student(tutor.id, student, ctx.capacity)
        .await?;
    log::info!("tutor {} created student {}", tutor.id, student.id);
    proceeds(student)
}

pub async fn get_student(
    identity: Option<Identity>,
    Path(student_id): Path<Uuid>,
    Extension(ctx): Extension<AppContext>,
) -> Payload<Student> {
    match ctx.scope(identity.as_ref()).await? {
        Scope::TutorOwner(tutor) => {
            proceeds(access::linked_student(ctx.store.as_ref(), &tutor, student_id).await?)
        }
        Scope::StudentOwner(me) if me.id == student_id => proceeds(me),
        Scope::Unauthenticated => breaks(Error::unauthenticated()),
        _ => breaks(Error::not_found(format!("Student `{}` not found", student_id))),
    }
}

pub async fn update_student(
    identity: Option<Identity>,
    Path(student_id): Path<Uuid>,
    Extension(ctx): Extension<AppContext>,
    Json(patch): Json<UpdateStudent>,
) -> Payload<Student> {
    let scope = ctx.scope(identity.as_ref()).await?;
    let tutor = scope.tutor()?;
    access::owned_student(ctx.store.as_ref(), tutor, student_id).await?;
    patch.validate()?;

    let student = ctx
        .store
        .update_student(tutor.id, student_id, patch, ctx.capacity)
        .await
        .map_err(|err| {
            if let crate::store::StoreError::Capacity(denial) = &err {
                log::info!("tutor {} denied activating {}: limit {}", tutor.id, student_id, denial.limit);
            }
            Error::from(err)
        })?;
    proceeds(student)
}

pub async fn delete_student(
    identity: Option<Identity>,
    Path(student_id): Path<Uuid>,
    Extension(ctx): Extension<AppContext>,
) -> Payload<Deleted> {
    let scope = ctx.scope(identity.as_ref()).await?;
    let tutor = scope.tutor()?;
    access::owned_student(ctx.store.as_ref(), tutor, student_id).await?;

    let deleted = ctx.store.delete_student(student_id).await?;
    log::info!("tutor {} deleted student {}", tutor.id, student_id);
    proceeds(Deleted {
        id: student_id,
        deleted,
    })
}
