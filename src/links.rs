use axum::Extension;
use uuid::Uuid;

use crate::access::Identity;
use crate::extract::{Json, Path, Query};
use crate::models::{
    ConnectionList, CreateConnection, CreateLink, LinkList, LinkedPair, RespondConnection,
    StatusFilter, StudentTutorConnection,
};
use crate::routes::AppContext;
use crate::{proceeds, registry, Payload};

pub async fn list_links(
    identity: Option<Identity>,
    Extension(ctx): Extension<AppContext>,
) -> Payload<LinkList> {
    let scope = ctx.scope(identity.as_ref()).await?;
    let tutor = scope.tutor()?;
    proceeds(LinkList {
        links: ctx.store.links_of(tutor.id).await?,
    })
}

pub async fn create_link(
    identity: Option<Identity>,
    Extension(ctx): Extension<AppContext>,
    Json(body): Json<CreateLink>,
) -> Payload<LinkedPair> {
    let scope = ctx.scope(identity.as_ref()).await?;
    let tutor = scope.tutor()?;
    let pair = registry::create_tutor_student_link(
        ctx.store.as_ref(),
        tutor.id,
        body.student_id,
        &body.subject,
        body.notes,
    )
    .await?;
    proceeds(pair)
}

pub async fn create_connection(
    identity: Option<Identity>,
    Extension(ctx): Extension<AppContext>,
    Json(body): Json<CreateConnection>,
) -> Payload<StudentTutorConnection> {
    let scope = ctx.scope(identity.as_ref()).await?;
    let me = scope.student()?;
    let connection = registry::create_connection_request(
        ctx.store.as_ref(),
        me.id,
        body.tutor_id,
        &body.subject,
        body.message,
    )
    .await?;
    log::info!("student {} requested tutor {}", me.id, body.tutor_id);
    proceeds(connection)
}

pub async fn list_connections(
    identity: Option<Identity>,
    Query(filter): Query<StatusFilter>,
    Extension(ctx): Extension<AppContext>,
) -> Payload<ConnectionList> {
    let scope = ctx.scope(identity.as_ref()).await?;
    let me = scope.student()?;
    proceeds(ConnectionList {
        connections: registry::list_connections(ctx.store.as_ref(), me.id, filter.status).await?,
    })
}

pub async fn list_incoming(
    identity: Option<Identity>,
    Query(filter): Query<StatusFilter>,
    Extension(ctx): Extension<AppContext>,
) -> Payload<ConnectionList> {
    let scope = ctx.scope(identity.as_ref()).await?;
    let tutor = scope.tutor()?;
    proceeds(ConnectionList {
        connections: registry::list_incoming(ctx.store.as_ref(), tutor, filter.status).await?,
    })
}

pub async fn respond(
    identity: Option<Identity>,
    Path(connection_id): Path<Uuid>,
    Extension(ctx): Extension<AppContext>,
    Json(body): Json<RespondConnection>,
) -> Payload<StudentTutorConnection> {
    let scope = ctx.scope(identity.as_ref()).await?;
    let tutor = scope.tutor()?;
    proceeds(
        registry::respond_to_connection(ctx.store.as_ref(), tutor, connection_id, body.accept)
            .await?,
    )
}
