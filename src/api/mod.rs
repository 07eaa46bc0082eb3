//! Management HTTP API.
//!
//! A small single-threaded JSON server over `std::net`. One request per
//! connection; the response is followed by a close.
//!
//! ```text
//! GET    /health
//! GET    /api/status
//! GET    /api/detections?category=all|cats|dogs|unknown&limit=N
//! GET    /api/image/<category>/<filename>
//! POST   /api/toggle
//! GET    /api/config
//! POST   /api/config            {"fps":..,"high_water_mark_gb":..,"detection_confidence":..}
//! DELETE /api/delete/<category>/<id>
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::{validate_confidence, validate_fps, validate_high_water_mark};
use crate::detect::DetectionRecord;
use crate::pipeline::{FailureCounts, PipelineHandle};
use crate::storage::{Category, EvidenceEntry};

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;
const DEFAULT_LIST_LIMIT: usize = 100;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    pipeline: PipelineHandle,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, pipeline: PipelineHandle) -> Self {
        Self { cfg, pipeline }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .map_err(|e| anyhow!("invalid api address '{}': {}", self.cfg.addr, e))?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let pipeline = self.pipeline;
        let join = std::thread::Builder::new()
            .name("petdoor-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, &pipeline, shutdown_thread) {
                    log::error!("management api stopped: {}", err);
                }
            })?;

        log::info!("management api listening on {}", addr);
        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    pipeline: &PipelineHandle,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = handle_connection(stream, pipeline) {
                    log::warn!("api request from {} failed: {:#}", peer, err);
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, pipeline: &PipelineHandle) -> Result<()> {
    stream.set_nonblocking(false)?;
    let response = match read_request(&mut stream) {
        Ok(request) => {
            log::debug!("api {} {}", request.method, request.path);
            route(&request, pipeline)
        }
        Err(err) => Response::error(400, &format!("{:#}", err)),
    };
    write_response(&mut stream, &response)
}

fn route(request: &HttpRequest, pipeline: &PipelineHandle) -> Response {
    let segments: Vec<&str> = request
        .path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    let result = match (request.method.as_str(), segments.as_slice()) {
        ("GET", ["health"]) => Ok(Response::json_value(200, json!({"status": "ok"}))),
        ("GET", ["api", "status"]) => status(pipeline),
        ("GET", ["api", "detections"]) => detections(request, pipeline),
        ("GET", ["api", "image", category, filename]) => image(pipeline, category, filename),
        ("POST", ["api", "toggle"]) => Ok(toggle(pipeline)),
        ("GET", ["api", "config"]) => Response::json(200, &pipeline.config()),
        ("POST", ["api", "config"]) => update_config(request, pipeline),
        ("DELETE", ["api", "delete", category, id]) => delete(pipeline, category, id),
        (_, ["health"])
        | (_, ["api", "status" | "detections" | "toggle" | "config"])
        | (_, ["api", "image", _, _])
        | (_, ["api", "delete", _, _]) => Ok(Response::error(405, "method not allowed")),
        _ => Ok(Response::error(404, "not found")),
    };

    result.unwrap_or_else(|err| {
        log::warn!("api {} {} failed: {:#}", request.method, request.path, err);
        Response::error(500, &format!("{:#}", err))
    })
}

#[derive(Serialize)]
struct StatusResponse {
    active: bool,
    storage_used_gb: f64,
    storage_limit_gb: f64,
    fps: u32,
    last_detection: Option<String>,
    ticks: u64,
    events_written: u64,
    failures: FailureCounts,
}

fn status(pipeline: &PipelineHandle) -> Result<Response> {
    let state = pipeline.get_state();
    let body = StatusResponse {
        active: state.active,
        storage_used_gb: (pipeline.storage_usage_gb()? * 100.0).round() / 100.0,
        storage_limit_gb: pipeline.high_water_mark_gb(),
        fps: pipeline.fps(),
        last_detection: state.last_event.map(|at| at.to_rfc3339()),
        ticks: state.ticks,
        events_written: state.events_written,
        failures: state.failures,
    };
    Response::json(200, &body)
}

#[derive(Serialize)]
struct DetectionItem {
    id: String,
    timestamp: String,
    category: Category,
    detections: Vec<DetectionRecord>,
    filename: String,
    image_url: String,
}

impl From<EvidenceEntry> for DetectionItem {
    fn from(entry: EvidenceEntry) -> Self {
        let filename = entry.filename();
        Self {
            image_url: format!("/api/image/{}/{}", entry.category, filename),
            id: entry.id,
            timestamp: entry.timestamp.to_rfc3339(),
            category: entry.category,
            detections: entry.detections,
            filename,
        }
    }
}

fn detections(request: &HttpRequest, pipeline: &PipelineHandle) -> Result<Response> {
    let category = match request.query("category") {
        None | Some("all") => None,
        Some(value) => match value.parse::<Category>() {
            Ok(category) => Some(category),
            Err(err) => return Ok(Response::error(400, &err.to_string())),
        },
    };
    let limit = match request.query("limit") {
        None => DEFAULT_LIST_LIMIT,
        Some(value) => match value.parse::<usize>() {
            Ok(limit) => limit,
            Err(_) => return Ok(Response::error(400, "limit must be a non-negative integer")),
        },
    };

    let listing = pipeline.enumerate_evidence(category, limit)?;
    let items: Vec<DetectionItem> = listing.entries.into_iter().map(DetectionItem::from).collect();
    Response::json(
        200,
        &json!({
            "detections": items,
            "total": listing.total,
        }),
    )
}

fn image(pipeline: &PipelineHandle, category: &str, filename: &str) -> Result<Response> {
    let path = match category
        .parse::<Category>()
        .and_then(|category| pipeline.store().image_path(category, filename))
    {
        Ok(path) => path,
        Err(_) => return Ok(Response::error(404, "image not found")),
    };
    match std::fs::read(&path) {
        Ok(bytes) => Ok(Response {
            status: 200,
            content_type: "image/jpeg",
            body: bytes,
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            Ok(Response::error(404, "image not found"))
        }
        Err(err) => Err(anyhow::Error::new(err).context(format!("read {}", path.display()))),
    }
}

fn toggle(pipeline: &PipelineHandle) -> Response {
    let active = pipeline.toggle();
    Response::json_value(
        200,
        json!({
            "active": active,
            "message": if active { "Detection started" } else { "Detection stopped" },
        }),
    )
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigUpdate {
    fps: Option<u32>,
    high_water_mark_gb: Option<f64>,
    detection_confidence: Option<f32>,
}

fn update_config(request: &HttpRequest, pipeline: &PipelineHandle) -> Result<Response> {
    let update: ConfigUpdate = match serde_json::from_slice(&request.body) {
        Ok(update) => update,
        Err(err) => return Ok(Response::error(400, &format!("invalid config body: {}", err))),
    };

    // All fields are checked before any is applied so a partly invalid
    // update changes nothing.
    let rejected = [
        update.fps.map(validate_fps),
        update.high_water_mark_gb.map(validate_high_water_mark),
        update.detection_confidence.map(validate_confidence),
    ]
    .into_iter()
    .flatten()
    .find_map(Result::err);
    if let Some(err) = rejected {
        log::warn!("config update rejected: {}", err);
        return Ok(Response::error(400, &err.to_string()));
    }

    if let Some(fps) = update.fps {
        pipeline.set_fps(fps)?;
    }
    if let Some(gb) = update.high_water_mark_gb {
        pipeline.set_high_water_mark_gb(gb)?;
    }
    if let Some(confidence) = update.detection_confidence {
        pipeline.set_detection_confidence(confidence)?;
    }
    log::info!("config updated: {:?}", update);

    Response::json(200, &json!({"success": true, "config": pipeline.config()}))
}

fn delete(pipeline: &PipelineHandle, category: &str, id: &str) -> Result<Response> {
    let category = match category.parse::<Category>() {
        Ok(category) => category,
        Err(err) => return Ok(Response::error(400, &err.to_string())),
    };
    if let Err(err) = crate::storage::validate_id(id) {
        return Ok(Response::error(400, &err.to_string()));
    }
    pipeline.delete_evidence(category, id)?;
    Ok(Response::json_value(200, json!({"success": true})))
}

struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn json<T: Serialize>(status: u16, value: &T) -> Result<Self> {
        Ok(Self {
            status,
            content_type: "application/json",
            body: serde_json::to_vec(value)?,
        })
    }

    fn json_value(status: u16, value: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: value.to_string().into_bytes(),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self::json_value(status, json!({ "error": message }))
    }
}

fn write_response(stream: &mut TcpStream, response: &Response) -> Result<()> {
    let status_line = match response.status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = response.content_type,
        len = response.body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(&response.body)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_HEADER_BYTES + MAX_BODY_BYTES {
            return Err(anyhow!("request too large"));
        }
    };

    let text = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length '{}'", value))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (raw_path, HashMap::new()),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
        body,
    })
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_pairs_are_split() {
        let query = parse_query("category=cats&limit=5&flag");
        assert_eq!(query.get("category").map(String::as_str), Some("cats"));
        assert_eq!(query.get("limit").map(String::as_str), Some("5"));
        assert_eq!(query.get("flag").map(String::as_str), Some(""));
    }

    #[test]
    fn config_update_rejects_unknown_fields() {
        assert!(serde_json::from_str::<ConfigUpdate>(r#"{"fps": 3}"#).is_ok());
        assert!(serde_json::from_str::<ConfigUpdate>(r#"{"storage_path": "/"}"#).is_err());
    }
}
