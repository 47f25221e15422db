use anyhow::{Context, Result, bail};
use futures::{StreamExt, stream};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{TILE_FETCH_CONCURRENCY, TILE_FETCH_TIMEOUT_SECS};
use crate::tiles::TileRange;

#[derive(Debug, Clone, Copy)]
pub enum Provider {
    OpenStreetMap,
    AlidadeSmooth,
}

impl Provider {
    pub fn tile_url(&self, zoom: u32, x: i64, y: i64, api_key: &str) -> String {
        match self {
            Self::OpenStreetMap => format!("https://tile.openstreetmap.org/{zoom}/{x}/{y}.png"),
            Self::AlidadeSmooth => format!(
                "https://tiles.stadiamaps.com/tiles/alidade_smooth/{zoom}/{x}/{y}.png?api_key={api_key}"
            ),
        }
    }

    pub fn cache_subdir(&self) -> &'static str {
        match self {
            Self::OpenStreetMap => "osm",
            Self::AlidadeSmooth => "alidade",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenStreetMap => "OpenStreetMap",
            Self::AlidadeSmooth => "Stadia Alidade Smooth",
        }
    }
}

/// Result of making sure one tile is on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOutcome {
    Fetched,
    AlreadyCached,
    FetchFailed(String),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FetchReport {
    pub fetched: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Identified per the OSM tile usage policy; tile requests time out rather
/// than hang the batch.
pub fn build_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(concat!("gpxlapse/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(TILE_FETCH_TIMEOUT_SECS))
        .build()?)
}

/// On-disk location of a tile; file presence is the entire cache index.
pub fn tile_path(cache_root: &Path, zoom: u32, x: i64, y: i64) -> PathBuf {
    cache_root.join(zoom.to_string()).join(x.to_string()).join(format!("{y}.png"))
}

/// Make sure the tile behind `url` exists at `path`. A tile already on disk is
/// never re-fetched; a failed fetch leaves no file behind, so a later run
/// retries it.
pub async fn ensure_cached(client: &reqwest::Client, url: &str, path: &Path) -> CacheOutcome {
    if path.exists() {
        return CacheOutcome::AlreadyCached;
    }

    match fetch_and_store(client, url, path).await {
        Ok(()) => CacheOutcome::Fetched,
        Err(e) => CacheOutcome::FetchFailed(format!("{e:#}")),
    }
}

async fn fetch_and_store(client: &reqwest::Client, url: &str, path: &Path) -> Result<()> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Request to {url} failed"))?;

    let status = response.status();
    if !status.is_success() {
        bail!("HTTP status {status}");
    }
    let bytes = response.bytes().await.context("Failed to read tile body")?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    // Write-then-rename, so the final path never holds a partial tile.
    let tmp = path.with_extension(format!("part-{}", std::process::id()));
    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Drive every tile in the range through the cache with bounded concurrency.
/// The rectangle enumeration contains no duplicate keys, so no two in-flight
/// fetches ever target the same file. Individual failures are counted, not
/// fatal: the renderer leaves missing tiles blank.
pub async fn sync_tiles(
    client: &reqwest::Client,
    range: &TileRange,
    provider: Provider,
    api_key: &str,
    cache_dir: &str,
) -> FetchReport {
    let cache_root = Path::new(cache_dir).join(provider.cache_subdir());
    eprintln!(
        "Syncing {} tiles at zoom {} from {}",
        range.count(),
        range.zoom,
        provider.name(),
    );

    let zoom = range.zoom;
    let report = stream::iter(range.iter())
        .map(|(x, y)| {
            let url = provider.tile_url(zoom, x, y, api_key);
            let path = tile_path(&cache_root, zoom, x, y);
            let client = client.clone();
            async move {
                let outcome = ensure_cached(&client, &url, &path).await;
                (x, y, outcome)
            }
        })
        .buffer_unordered(TILE_FETCH_CONCURRENCY)
        .fold(FetchReport::default(), |mut report, (x, y, outcome)| async move {
            match outcome {
                CacheOutcome::Fetched => report.fetched += 1,
                CacheOutcome::AlreadyCached => report.skipped += 1,
                CacheOutcome::FetchFailed(reason) => {
                    report.failed += 1;
                    eprintln!("Failed to fetch tile {zoom}/{x}/{y}: {reason}");
                }
            }
            eprint!(
                "\r{} tiles downloaded, {} already cached, {} failed   ",
                report.fetched, report.skipped, report.failed,
            );
            report
        })
        .await;

    eprintln!();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn temp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("gpxlapse-cache-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Answers exactly one request with the given status line and body, then
    /// shuts down.
    fn one_shot_server(status_line: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf);
                let header = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len(),
                );
                let _ = stream.write_all(header.as_bytes());
                let _ = stream.write_all(body);
            }
        });
        format!("http://{addr}/tile.png")
    }

    // Nothing listens on the discard port, so connections are refused
    // immediately.
    const DEAD_URL: &str = "http://127.0.0.1:9/tile.png";

    #[tokio::test]
    async fn cached_tile_is_never_refetched() {
        let root = temp_root("hit");
        let path = tile_path(&root, 5, 10, 12);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"tile").unwrap();

        let client = build_client().unwrap();
        // The dead URL would fail any actual request.
        assert_eq!(ensure_cached(&client, DEAD_URL, &path).await, CacheOutcome::AlreadyCached);
        assert_eq!(ensure_cached(&client, DEAD_URL, &path).await, CacheOutcome::AlreadyCached);
        assert_eq!(fs::read(&path).unwrap(), b"tile");

        fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn failed_fetch_leaves_no_file_and_is_retried_later() {
        let root = temp_root("retry");
        let path = tile_path(&root, 5, 10, 12);
        let client = build_client().unwrap();

        let outcome = ensure_cached(&client, DEAD_URL, &path).await;
        assert!(matches!(outcome, CacheOutcome::FetchFailed(_)));
        assert!(!path.exists());

        // A later run finds the service healthy and fills the gap.
        let url = one_shot_server("200 OK", b"png-bytes");
        assert_eq!(ensure_cached(&client, &url, &path).await, CacheOutcome::Fetched);
        assert_eq!(fs::read(&path).unwrap(), b"png-bytes");

        assert_eq!(ensure_cached(&client, DEAD_URL, &path).await, CacheOutcome::AlreadyCached);

        fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn non_200_status_creates_nothing() {
        let root = temp_root("status");
        let path = tile_path(&root, 7, -1, 3);
        let client = build_client().unwrap();

        let url = one_shot_server("404 Not Found", b"");
        let outcome = ensure_cached(&client, &url, &path).await;
        match outcome {
            CacheOutcome::FetchFailed(reason) => assert!(reason.contains("404")),
            other => panic!("expected FetchFailed, got {other:?}"),
        }
        assert!(!path.exists());

        fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn fully_cached_range_skips_everything() {
        let root = temp_root("range");
        let range = TileRange { zoom: 3, min_x: 1, max_x: 2, min_y: 4, max_y: 5 };

        let provider_root = root.join(Provider::OpenStreetMap.cache_subdir());
        for (x, y) in range.iter() {
            let path = tile_path(&provider_root, range.zoom, x, y);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, b"tile").unwrap();
        }

        let client = build_client().unwrap();
        let report = sync_tiles(
            &client,
            &range,
            Provider::OpenStreetMap,
            "",
            root.to_str().unwrap(),
        )
        .await;
        assert_eq!(report, FetchReport { fetched: 0, skipped: 4, failed: 0 });

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn provider_urls() {
        let osm = Provider::OpenStreetMap.tile_url(12, 2331, 1185, "");
        assert_eq!(osm, "https://tile.openstreetmap.org/12/2331/1185.png");

        let stadia = Provider::AlidadeSmooth.tile_url(12, 2331, 1185, "k3y");
        assert!(stadia.starts_with("https://tiles.stadiamaps.com/tiles/alidade_smooth/12/2331/1185.png"));
        assert!(stadia.ends_with("api_key=k3y"));

        // Padded indices outside the grid still form a request the service can
        // decline.
        let oob = Provider::OpenStreetMap.tile_url(3, -2, 9, "");
        assert_eq!(oob, "https://tile.openstreetmap.org/3/-2/9.png");
    }
}
