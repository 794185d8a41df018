/// Registry refresh: fetch and cache the APNIC delegation file the router
/// builds its CIDR table from.
///
/// Network fetch is a pluggable side channel — `load` takes a fetch closure
/// so tests can inject a fixed fixture instead of reaching the network;
/// `daze-client`'s `main` passes a closure backed by `reqwest`.
use std::future::Future;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Load the registry text, refreshing the cache at `cache_path` via `fetch`
/// if it is missing or older than `max_age`. If refresh fails but a cached
/// copy exists, the stale copy is used instead; only missing both a fresh
/// fetch and any cache at all is fatal.
pub async fn load<F, Fut>(
    cache_path: &Path,
    source_url: &str,
    max_age: Duration,
    fetch: F,
) -> io::Result<String>
where
    F: FnOnce(&str) -> Fut,
    Fut: Future<Output = io::Result<String>>,
{
    if needs_refresh(cache_path, max_age) {
        match fetch(source_url).await {
            Ok(body) => {
                if let Some(parent) = cache_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(cache_path, &body)?;
                return Ok(body);
            }
            Err(e) => {
                if cache_path.exists() {
                    tracing::warn!(
                        "registry refresh failed ({}), using stale cache at {}",
                        e,
                        cache_path.display()
                    );
                } else {
                    return Err(e);
                }
            }
        }
    }
    std::fs::read_to_string(cache_path)
}

fn needs_refresh(cache_path: &Path, max_age: Duration) -> bool {
    let metadata = match std::fs::metadata(cache_path) {
        Ok(m) => m,
        Err(_) => return true,
    };
    let modified = match metadata.modified() {
        Ok(m) => m,
        Err(_) => return true,
    };
    match SystemTime::now().duration_since(modified) {
        Ok(age) => age > max_age,
        Err(_) => false,
    }
}
