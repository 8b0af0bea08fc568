//! HTTP surface: segment files, channel playlist, XMLTV guide and health.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use tower_http::services::ServeDir;
use tracing::info;

use crate::config::{Config, ServerConfig};
use crate::pipeline::ReadinessProbe;

const GUIDE_HOURS: i64 = 24;
const XMLTV_TIME_FORMAT: &str = "%Y%m%d%H%M%S +0000";

/// Shared state accessible from handlers
#[derive(Clone)]
pub struct AppState {
    pub readiness: ReadinessProbe,
    pub server: Arc<ServerConfig>,
    pub manifest_name: Arc<str>,
}

/// Build the router with all routes
pub fn router(config: &Config, readiness: ReadinessProbe) -> Router {
    let state = AppState {
        readiness,
        server: Arc::new(config.server.clone()),
        manifest_name: Arc::from(config.encoder.manifest_name.as_str()),
    };

    Router::new()
        .route("/playlist.m3u", get(playlist_handler))
        .route("/guide.xml", get(guide_handler))
        .route("/health", get(health_handler))
        .nest_service("/stream", ServeDir::new(&config.paths.output_dir))
        .nest_service("/logo", ServeDir::new(&config.paths.logo_dir))
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves
pub async fn serve(
    config: &Config,
    readiness: ReadinessProbe,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server to {}", addr))?;

    let port = config.server.port;
    info!("Streaming server running on {}", addr);
    info!("M3U playlist available at http://localhost:{}/playlist.m3u", port);
    info!("XMLTV guide available at http://localhost:{}/guide.xml", port);
    info!("Health check available at http://localhost:{}/health", port);

    axum::serve(listener, router(config, readiness))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")
}

/// GET /playlist.m3u
async fn playlist_handler(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let host = public_host(&headers);
    (
        [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
        render_playlist(&state.server, &state.manifest_name, &host),
    )
}

/// GET /guide.xml
async fn guide_handler(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let host = public_host(&headers);
    (
        [(header::CONTENT_TYPE, "application/xml")],
        render_guide(&state.server, &host, Utc::now()),
    )
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let ready = state.readiness.is_ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "ready": ready })))
}

/// Host clients should use to reach us: the `Host` header without its port,
/// with `localhost` mapped to the Docker host alias.
fn public_host(headers: &HeaderMap) -> String {
    let raw = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");

    let host = if raw.starts_with('[') {
        // IPv6 literal, keep the brackets
        match raw.find(']') {
            Some(end) => &raw[..=end],
            None => raw,
        }
    } else {
        raw.split(':').next().unwrap_or(raw)
    };

    if host.eq_ignore_ascii_case("localhost") {
        "host.docker.internal".to_string()
    } else {
        host.to_string()
    }
}

fn logo_url(server: &ServerConfig, host: &str) -> String {
    format!("http://{}:{}/logo/{}", host, server.port, server.logo_file)
}

fn render_playlist(server: &ServerConfig, manifest_name: &str, host: &str) -> String {
    let logo = logo_url(server, host);
    format!(
        "#EXTM3U\n\
         #EXTINF:-1 channel-id=\"{id}\" tvg-id=\"{num}\" tvg-chno=\"{num}\" \
         tvc-guide-placeholders=\"3600\" tvc-guide-title=\"{title}\" \
         tvc-guide-description=\"{desc}\" tvc-guide-art=\"{logo}\" tvg-logo=\"{logo}\",{name}\n\
         http://{host}:{port}/stream/{manifest}\n",
        id = server.channel_id,
        num = server.channel_number,
        title = server.guide_title,
        desc = server.guide_description,
        logo = logo,
        name = server.channel_name,
        host = host,
        port = server.port,
        manifest = manifest_name,
    )
}

fn render_guide(server: &ServerConfig, host: &str, now: DateTime<Utc>) -> String {
    let logo = xml_escape(&logo_url(server, host));
    let id = xml_escape(&server.channel_id);
    let title = xml_escape(&server.guide_title);
    let desc = xml_escape(&server.guide_description);

    let mut xml = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <!DOCTYPE tv SYSTEM \"xmltv.dtd\">\n\
         <tv>\n  \
         <channel id=\"{id}\">\n    \
         <display-name>{name}</display-name>\n    \
         <icon src=\"{logo}\" />\n  \
         </channel>",
        name = xml_escape(&server.channel_name),
    );

    for i in 0..GUIDE_HOURS {
        let start = now + ChronoDuration::hours(i);
        let end = start + ChronoDuration::hours(1);
        xml.push_str(&format!(
            "\n  <programme start=\"{}\" end=\"{}\" channel=\"{id}\">\n    \
             <title lang=\"en\">{title}</title>\n    \
             <desc lang=\"en\">{desc}</desc>\n    \
             <icon src=\"{logo}\" />\n  \
             </programme>",
            start.format(XMLTV_TIME_FORMAT),
            end.format(XMLTV_TIME_FORMAT),
        ));
    }

    xml.push_str("\n</tv>");
    xml
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ReadinessFlag;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::TimeZone;
    use tower::ServiceExt;

    fn make_router(dir: &std::path::Path, flag: &ReadinessFlag) -> Router {
        let mut config = Config::default();
        config.paths.output_dir = dir.join("output");
        config.paths.logo_dir = dir.join("logo");
        std::fs::create_dir_all(&config.paths.output_dir).unwrap();
        std::fs::create_dir_all(&config.paths.logo_dir).unwrap();
        router(&config, flag.probe())
    }

    async fn get(app: Router, uri: &str, host: &str) -> (StatusCode, HeaderMap, String) {
        let req = Request::builder()
            .uri(uri)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = axum::body::to_bytes(resp.into_body(), 1_000_000)
            .await
            .unwrap();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health_follows_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let flag = ReadinessFlag::new();

        let (status, _, body) = get(make_router(dir.path(), &flag), "/health", "localhost").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["ready"], false);

        flag.set(true);
        let (status, _, body) = get(make_router(dir.path(), &flag), "/health", "localhost").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"ready":true}"#);
    }

    #[tokio::test]
    async fn test_playlist_uses_request_host() {
        let dir = tempfile::tempdir().unwrap();
        let flag = ReadinessFlag::new();
        let (status, headers, body) =
            get(make_router(dir.path(), &flag), "/playlist.m3u", "tv.lan:9798").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "application/vnd.apple.mpegurl");
        let lines: Vec<_> = body.lines().collect();
        assert_eq!(lines[0], "#EXTM3U");
        assert!(lines[1].starts_with("#EXTINF:-1 channel-id=\"WS4000\" tvg-id=\"275\""));
        assert!(lines[1].contains("tvg-logo=\"http://tv.lan:9798/logo/ws4000.png\""));
        assert!(lines[1].ends_with(",WeatherStar 4000"));
        assert_eq!(lines[2], "http://tv.lan:9798/stream/stream.m3u8");
    }

    #[tokio::test]
    async fn test_guide_is_xml() {
        let dir = tempfile::tempdir().unwrap();
        let flag = ReadinessFlag::new();
        let (status, headers, body) =
            get(make_router(dir.path(), &flag), "/guide.xml", "localhost:9798").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "application/xml");
        assert!(body.contains("http://host.docker.internal:9798/logo/ws4000.png"));
        assert_eq!(body.matches("<programme ").count(), 24);
    }

    #[tokio::test]
    async fn test_stream_files_are_served() {
        let dir = tempfile::tempdir().unwrap();
        let flag = ReadinessFlag::new();
        let app = make_router(dir.path(), &flag);
        std::fs::write(dir.path().join("output/stream.m3u8"), "#EXTM3U\n").unwrap();

        let (status, _, body) = get(app.clone(), "/stream/stream.m3u8", "localhost").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "#EXTM3U\n");

        let (status, _, _) = get(app, "/stream/missing.ts", "localhost").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_guide_times_and_escaping() {
        let mut server = ServerConfig::default();
        server.guide_title = "Weather & <More>".to_string();
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 23, 30, 5).unwrap();

        let xml = render_guide(&server, "tv.lan", now);
        assert!(xml.contains(r#"<programme start="20261018233005 +0000" end="20261019003005 +0000""#));
        assert!(xml.contains("<title lang=\"en\">Weather &amp; &lt;More&gt;</title>"));
        assert!(xml.ends_with("</tv>"));
    }

    #[test]
    fn test_host_header_handling() {
        let mut headers = HeaderMap::new();
        assert_eq!(public_host(&headers), "host.docker.internal");

        headers.insert(header::HOST, "192.168.1.5:9798".parse().unwrap());
        assert_eq!(public_host(&headers), "192.168.1.5");

        headers.insert(header::HOST, "[::1]:9798".parse().unwrap());
        assert_eq!(public_host(&headers), "[::1]");

        headers.insert(header::HOST, "LOCALHOST".parse().unwrap());
        assert_eq!(public_host(&headers), "host.docker.internal");
    }
}
