//! Router discovery
//!
//! When no enclave is configured the client asks the discovery endpoint for
//! the current set of router enclaves and picks one at random.

use rand::seq::SliceRandom;
use tracing::debug;

use crate::error::{Error, Result};

/// Fetch the list of router hosts from `url`
pub async fn fetch_routers(url: &str) -> Result<Vec<String>> {
    let response = reqwest::get(url)
        .await
        .map_err(|e| Error::Config(format!("router discovery failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(Error::Config(format!(
            "router discovery failed: HTTP {}",
            response.status()
        )));
    }

    let routers: Vec<String> = response.json().await?;
    if routers.is_empty() {
        return Err(Error::Config("no routers available".into()));
    }

    debug!(count = routers.len(), "Discovered routers");
    Ok(routers)
}

/// Pick one router uniformly at random
pub fn select(routers: &[String]) -> Result<&str> {
    routers
        .choose(&mut rand::thread_rng())
        .map(String::as_str)
        .ok_or_else(|| Error::Config("no routers available".into()))
}

/// Discover routers and pick one
pub async fn discover(url: &str) -> Result<String> {
    let routers = fetch_routers(url).await?;
    let host = select(&routers)?.to_string();
    debug!(host = %host, "Selected router");
    Ok(host)
}
