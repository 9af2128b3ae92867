//! Request handlers for different server endpoints

pub mod stats;
pub mod websocket;

use log::debug;
use std::convert::Infallible;
use std::sync::Arc;
use warp::{Filter, Rejection, Reply};

use crate::config::ServerConfig;
use crate::constants::WS_PATH;
use crate::core::hub::HubHandle;

pub use stats::{start_stats_logging, stats_handler};
pub use websocket::handle_ws_client;

/// All HTTP routes: the WebSocket endpoint, `/health` and `/stats`
pub fn routes(
    hub: HubHandle,
    config: Arc<ServerConfig>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let max_message_size = config.max_message_size;

    let ws_route = warp::path(WS_PATH)
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_hub(hub.clone()))
        .and(with_config(config))
        .map(move |ws: warp::ws::Ws, hub: HubHandle, config: Arc<ServerConfig>| {
            debug!("New websocket connection");
            ws.max_message_size(max_message_size)
                .max_frame_size(max_message_size)
                .on_upgrade(move |socket| handle_ws_client(socket, hub, config))
        });

    let health_route = warp::path("health").and(warp::path::end()).map(|| "OK");

    let stats_route = warp::path("stats")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_hub(hub))
        .and_then(stats_handler);

    ws_route.or(health_route).or(stats_route)
}

// Helpers to include shared state in requests
fn with_hub(hub: HubHandle) -> impl Filter<Extract = (HubHandle,), Error = Infallible> + Clone {
    warp::any().map(move || hub.clone())
}

fn with_config(
    config: Arc<ServerConfig>,
) -> impl Filter<Extract = (Arc<ServerConfig>,), Error = Infallible> + Clone {
    warp::any().map(move || config.clone())
}
