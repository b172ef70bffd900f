//! armada-api — the director's HTTP surface.
//!
//! A thin layer: mutating endpoints persist the uploaded payload, create a
//! task and redirect to its location; read endpoints serve JSON straight
//! from the state store. All routes sit behind HTTP basic auth against the
//! users table.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/users` | Create a user |
//! | PUT | `/users/{username}` | Update a user |
//! | DELETE | `/users/{username}` | Delete a user |
//! | POST | `/releases` | Upload a release bundle → task |
//! | GET | `/releases` | List releases with versions |
//! | DELETE | `/releases/{name}?force=` | Delete a release → task |
//! | POST | `/deployments` | Submit a manifest → task |
//! | GET | `/deployments` | List deployments |
//! | DELETE | `/deployments/{name}` | Delete a deployment → task |
//! | POST | `/stemcells` | Upload a stemcell bundle → task |
//! | GET | `/stemcells` | List stemcells |
//! | DELETE | `/stemcells/{name}/{version}` | Delete a stemcell → task |
//! | GET | `/tasks?limit=&state=` | List tasks, newest first |
//! | GET | `/tasks/{id}` | Task details |
//! | DELETE | `/tasks/{id}` | Request cancellation |
//! | GET | `/tasks/{id}/output?type=` | Stream a task log file |
//! | GET | `/status` | Director identity |

pub mod auth;
pub mod error;
pub mod handlers;

use std::path::PathBuf;

use axum::middleware;
use axum::routing::{delete, get, post, put};
use axum::Router;

use armada_state::StateStore;
use armada_tasks::TaskManager;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub tasks: TaskManager,
    /// Where uploaded bundles and manifests land before their task runs.
    pub spool_dir: PathBuf,
    pub director_name: String,
}

/// Build the complete authenticated router.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/users", post(handlers::create_user))
        .route(
            "/users/{username}",
            put(handlers::update_user).delete(handlers::delete_user),
        )
        .route(
            "/releases",
            post(handlers::upload_release).get(handlers::list_releases),
        )
        .route("/releases/{name}", delete(handlers::delete_release))
        .route(
            "/deployments",
            post(handlers::create_deployment).get(handlers::list_deployments),
        )
        .route("/deployments/{name}", delete(handlers::delete_deployment))
        .route(
            "/stemcells",
            post(handlers::upload_stemcell).get(handlers::list_stemcells),
        )
        .route(
            "/stemcells/{name}/{version}",
            delete(handlers::delete_stemcell),
        )
        .route("/tasks", get(handlers::list_tasks))
        .route(
            "/tasks/{id}",
            get(handlers::get_task).delete(handlers::cancel_task),
        )
        .route("/tasks/{id}/output", get(handlers::task_output))
        .route("/status", get(handlers::status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ))
        .with_state(state)
}
