//! Chain-state inspection.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::controller::json_error;
use crate::chain::{Block, ChainSynchronizer, Desired};
use crate::http::Controller;

pub const CHAIN_PATH: &str = "/chain";

#[derive(Deserialize)]
struct ChainQuery {
    from: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceIntent {
    service: String,
    desired: Desired,
    height: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChainState {
    node_id: String,
    height: u64,
    intents: Vec<ServiceIntent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    blocks: Option<Vec<Block>>,
}

/// ChainController exposes the synchronizer's view and, on request, raw
/// blocks from a height on.
pub struct ChainController {
    synchronizer: Option<Arc<ChainSynchronizer>>,
}

impl ChainController {
    pub fn new(synchronizer: Option<Arc<ChainSynchronizer>>) -> Self {
        Self { synchronizer }
    }

    async fn get(
        State(synchronizer): State<Option<Arc<ChainSynchronizer>>>,
        Query(params): Query<ChainQuery>,
    ) -> Response {
        let Some(synchronizer) = synchronizer else {
            return json_error(StatusCode::NOT_FOUND, "chain_disabled", "chain sync is disabled");
        };

        let view = synchronizer.view();
        let blocks = match params.from {
            Some(from) => match synchronizer.blocks_from(from.max(1)).await {
                Ok(blocks) => Some(blocks),
                Err(e) => {
                    return json_error(StatusCode::INTERNAL_SERVER_ERROR, "chain_read", e.to_string())
                }
            },
            None => None,
        };

        let state = ChainState {
            node_id: synchronizer.node_id().to_string(),
            height: view.height(),
            intents: view
                .iter()
                .map(|(service, desired, height)| ServiceIntent {
                    service: service.to_string(),
                    desired,
                    height,
                })
                .collect(),
            blocks,
        };
        (StatusCode::OK, Json(state)).into_response()
    }
}

impl Controller for ChainController {
    fn add_route(&self, router: Router) -> Router {
        router.route(CHAIN_PATH, get(Self::get).with_state(self.synchronizer.clone()))
    }
}
