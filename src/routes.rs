use std::sync::Arc;
use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::handler::Handler;
use axum::routing::{get, post};
use axum::{Extension, Router};
use tower::ServiceBuilder;

use crate::access::{self, Identity, Scope};
use crate::capacity::CapacityPolicy;
use crate::notify::Notifier;
use crate::store::RecordStore;
use crate::token::TokenPolicy;
use crate::{err, links, parent, sessions, students, Error};

/// Everything a request needs, handed to handlers through `Extension`.
#[derive(Clone)]
pub struct AppContext {
    pub store: Arc<dyn RecordStore>,
    pub notifier: Arc<dyn Notifier>,
    pub capacity: CapacityPolicy,
    pub tokens: TokenPolicy,
}

impl AppContext {
    pub async fn scope(&self, identity: Option<&Identity>) -> Result<Scope, Error> {
        let scope = access::session_scope(self.store.as_ref(), identity).await?;
        log::debug!("request resolved to {}", scope.kind());
        Ok(scope)
    }
}

pub fn app(ctx: AppContext, request_timeout: Duration) -> Router {
    Router::new()
        .route("/register/tutor", post(students::register_tutor))
        .route("/register/student", post(students::register_student))
        .route(
            "/students",
            get(students::list_students).post(students::create_student),
        )
        .route(
            "/students/:id",
            get(students::get_student)
                .patch(students::update_student)
                .delete(students::delete_student),
        )
        .route(
            "/students/:id/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route(
            "/sessions/:id",
            axum::routing::patch(sessions::update_session).delete(sessions::delete_session),
        )
        .route("/sessions/:id/notify", post(sessions::notify_session))
        .route("/links", get(links::list_links).post(links::create_link))
        .route(
            "/connections",
            get(links::list_connections).post(links::create_connection),
        )
        .route("/connections/:id/respond", post(links::respond))
        .route("/tutors/me/connections", get(links::list_incoming))
        .route("/public/students/:id", get(parent::public_student))
        .route("/parent/:token", get(parent::student_by_token))
        .route("/parent/:token/sessions", get(parent::sessions_by_token))
        .fallback(err::handler404.into_service())
        .layer(Extension(ctx))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(err::handle_timeout))
                .timeout(request_timeout),
        )
}
