//! Connection statistics: the `/stats` route and the periodic log line

use log::{debug, error, info};
use std::convert::Infallible;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use warp::http::StatusCode;

use crate::core::hub::HubHandle;
use crate::security::with_api_security_headers;

pub async fn stats_handler(hub: HubHandle) -> Result<impl warp::Reply, Infallible> {
    let reply = match hub.connection_stats().await {
        Ok(stats) => warp::reply::with_status(warp::reply::json(&stats), StatusCode::OK),
        Err(e) => {
            error!("Failed to collect connection stats: {}", e);
            warp::reply::with_status(
                warp::reply::json(&serde_json::json!({ "error": e.to_string() })),
                StatusCode::SERVICE_UNAVAILABLE,
            )
        }
    };
    Ok(with_api_security_headers(reply))
}

/// Log connection stats every `period` until the hub goes away
pub fn start_stats_logging(hub: HubHandle, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            match hub.connection_stats().await {
                Ok(stats) => info!(
                    "Connection Stats: Total={}, Active={}, Idle={}, Named={}, Capacity={}",
                    stats.total, stats.active, stats.idle, stats.named_users, stats.ceiling
                ),
                Err(e) => {
                    debug!("Stopping stats logging: {}", e);
                    break;
                }
            }
        }
    })
}
