//! stratgrid-api: REST API for StratGrid nodes.
//!
//! Every node serves the task control API. Worker nodes additionally
//! accept exec commands forwarded by other nodes.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/tasks` | Start (or update) a task |
//! | DELETE | `/api/v1/tasks` | Stop a task |
//! | GET | `/api/v1/tasks` | List desired tasks |
//! | POST | `/api/v1/tasks/exec` | Send a command to a running task |
//! | GET | `/api/v1/placements` | List placements |
//! | GET | `/api/v1/nodes` | List registered workers |
//! | POST | `/internal/v1/tasks/exec` | Relay a forwarded command to a local task |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use stratgrid_agent::WorkerAgent;
use stratgrid_scheduler::{INTERNAL_EXEC_PATH, TaskControl};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub control: TaskControl,
    /// Present on nodes that run tasks.
    pub agent: Option<WorkerAgent>,
}

/// Build the complete API router.
pub fn build_router(control: TaskControl, agent: Option<WorkerAgent>) -> Router {
    let state = ApiState { control, agent };

    let api_routes = Router::new()
        .route(
            "/tasks",
            get(handlers::list_tasks)
                .post(handlers::start_task)
                .delete(handlers::stop_task),
        )
        .route("/tasks/exec", post(handlers::exec_task))
        .route("/placements", get(handlers::list_placements))
        .route("/nodes", get(handlers::list_nodes))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route(INTERNAL_EXEC_PATH, post(handlers::internal_exec).with_state(state))
}
