//! Control plane: mapping CRUD and the debug surface
//!
//! Everything under `/_api/mappings/` plus the `proxy.localhost` dashboard.
//! The HTML page is a convenience view; every mutation it performs goes
//! through the same JSON API with the same validation.

use crate::discovery::{ContainerRecord, ProcessRecord};
use crate::error::{full_body, json_error_response, GatewayErrorCode, ProxyBody};
use crate::logbuf::LogEntry;
use crate::server::percent_decode;
use crate::store::{is_synthetic_key, now_rfc3339, MappingStore, RouteMapping, TargetKind};
use http_body_util::BodyExt;
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::fmt::Write as _;
use tracing::{info, warn};

pub const MAPPINGS_API_PREFIX: &str = "/_api/mappings/";

/// Everything the debug surface shows.
pub struct DebugData {
    pub model: String,
    pub cache_file: String,
    pub api_key_set: bool,
    pub processes: Vec<ProcessRecord>,
    pub containers: Vec<ContainerRecord>,
    pub mappings: HashMap<String, RouteMapping>,
    pub logs: Vec<LogEntry>,
}

#[derive(Debug, Deserialize)]
struct PutMappingBody {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    target: String,
    #[serde(default)]
    port: i64,
}

/// CRUD over `/_api/mappings/` and `/_api/mappings/<host>`.
pub async fn handle_mappings_api<B>(req: Request<B>, store: &MappingStore) -> Response<ProxyBody>
where
    B: hyper::body::Body,
    B::Error: std::fmt::Display,
{
    let host = percent_decode(
        req.uri()
            .path()
            .trim_start_matches(MAPPINGS_API_PREFIX)
            .trim_end_matches('/'),
    )
    .to_lowercase();

    match req.method().clone() {
        Method::GET => {
            if host.is_empty() {
                return json_response(StatusCode::OK, &store.get_all());
            }
            match store.get(&host) {
                Some(mapping) => json_response(StatusCode::OK, &mapping),
                None => json_error_response(
                    GatewayErrorCode::NotFound,
                    format!("no mapping for {host}"),
                ),
            }
        }

        Method::PUT => {
            let bytes = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    return json_error_response(
                        GatewayErrorCode::BadRequest,
                        format!("reading request body: {e}"),
                    );
                }
            };
            let body: PutMappingBody = match serde_json::from_slice(&bytes) {
                Ok(body) => body,
                Err(e) => {
                    return json_error_response(
                        GatewayErrorCode::BadRequest,
                        format!("invalid JSON: {e}"),
                    );
                }
            };

            let kind = match body.kind.as_str() {
                "process" => TargetKind::Process,
                "container" | "docker" => TargetKind::Container,
                other => {
                    return json_error_response(
                        GatewayErrorCode::BadRequest,
                        format!("kind must be 'process' or 'container', got {other:?}"),
                    );
                }
            };
            if body.target.is_empty() {
                return json_error_response(
                    GatewayErrorCode::BadRequest,
                    "target must be a non-empty string",
                );
            }
            if !(1..=65535).contains(&body.port) {
                return json_error_response(
                    GatewayErrorCode::BadRequest,
                    format!("port must be between 1 and 65535, got {}", body.port),
                );
            }

            store.set(
                &host,
                RouteMapping {
                    kind,
                    target: body.target,
                    port: body.port as u16,
                    created_at: now_rfc3339(),
                    llm_reason: "manual".to_string(),
                    identifier: None,
                },
            );
            if let Err(e) = store.save() {
                warn!(host, error = %e, "mapping updated in memory but not persisted");
                return json_error_response(
                    GatewayErrorCode::PersistenceFailed,
                    format!("failed to persist mapping: {e:#}"),
                );
            }
            info!(host, "mapping updated manually");
            json_response(StatusCode::OK, &json!({"status": "updated"}))
        }

        Method::DELETE => {
            store.delete(&host);
            if let Err(e) = store.save() {
                warn!(host, error = %e, "mapping deleted in memory but not persisted");
                return json_error_response(
                    GatewayErrorCode::PersistenceFailed,
                    format!("failed to persist deletion: {e:#}"),
                );
            }
            info!(host, "mapping deleted");
            json_response(StatusCode::OK, &json!({"status": "deleted"}))
        }

        _ => json_error_response(
            GatewayErrorCode::MethodNotAllowed,
            format!("{} not supported here", req.method()),
        ),
    }
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    let body = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full_body(body))
        .expect("valid response builder")
}

/// JSON debug snapshot. Secret values are reported only as present/absent.
pub fn debug_json(data: &DebugData) -> Response<ProxyBody> {
    let payload = json!({
        "timestamp": now_rfc3339(),
        "model": data.model,
        "cache_file": data.cache_file,
        "api_key": if data.api_key_set { "[set]" } else { "[not set]" },
        "processes": data.processes,
        "containers": data.containers,
        "mappings": data.mappings,
        "logs": data.logs,
    });
    json_response(StatusCode::OK, &payload)
}

/// HTML dashboard.
pub fn debug_html(data: &DebugData) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/html; charset=utf-8")
        .body(full_body(render_dashboard(data)))
        .expect("valid response builder")
}

fn esc(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn render_dashboard(data: &DebugData) -> String {
    let mut page = String::with_capacity(16 * 1024);
    page.push_str(DASHBOARD_HEAD);

    // Environment strip. Secrets never reach the page.
    let _ = write!(
        page,
        r#"<div class="env"><span><b>model</b> {}</span><span><b>cache</b> {}</span><span><b>api key</b> {}</span></div>"#,
        esc(&data.model),
        esc(&data.cache_file),
        if data.api_key_set { "[set]" } else { "[not set]" },
    );

    let _ = write!(
        page,
        r#"<div class="stats"><div><span class="num">{}</span>routes</div><div><span class="num">{}</span>processes</div><div><span class="num">{}</span>containers</div><div><span class="num">{}</span>log entries</div></div>"#,
        data.mappings.len(),
        data.processes.len(),
        data.containers.len(),
        data.logs.len(),
    );

    // Route mappings, real hostnames first.
    page.push_str(r#"<h2>Route mappings</h2><table><tr><th>Hostname</th><th>Kind</th><th>Target</th><th>Port</th><th>Reason</th><th></th></tr>"#);
    let mut hosts: Vec<&String> = data.mappings.keys().collect();
    hosts.sort_by_key(|h| (is_synthetic_key(h), h.as_str()));
    for host in hosts {
        let mapping = &data.mappings[host];
        let link = if is_synthetic_key(host) {
            esc(host)
        } else {
            format!(
                r#"<a href="http://{0}" target="_blank">{0}</a>"#,
                esc(host)
            )
        };
        let _ = write!(
            page,
            concat!(
                r#"<tr><td>{link}</td><td>{kind}</td>"#,
                r#"<td><input class="target" data-host="{host}" value="{target}"></td>"#,
                r#"<td><input class="port" data-host="{host}" value="{port}" size="6"></td>"#,
                r#"<td class="dim">{reason}</td>"#,
                r#"<td><button onclick="save('{host}')">save</button> "#,
                r#"<button onclick="del('{host}')">x</button></td></tr>"#,
            ),
            link = link,
            kind = mapping.kind.as_str(),
            host = esc(host),
            target = esc(&mapping.target),
            port = mapping.port,
            reason = esc(&mapping.llm_reason),
        );
    }
    if data.mappings.is_empty() {
        page.push_str(r#"<tr><td colspan="6" class="dim">No mappings yet. Visit a *.localhost domain to create one.</td></tr>"#);
    }
    page.push_str("</table>");

    page.push_str(r#"<h2>Local processes</h2><table><tr><th>Port</th><th>Command</th><th>Args</th><th>Workdir</th></tr>"#);
    for proc in &data.processes {
        let _ = write!(
            page,
            r#"<tr><td>{}</td><td>{}</td><td class="dim">{}</td><td class="dim">{}</td></tr>"#,
            proc.port,
            esc(&proc.command),
            esc(&proc.args),
            esc(&proc.workdir),
        );
    }
    if data.processes.is_empty() {
        page.push_str(r#"<tr><td colspan="4" class="dim">No listening processes detected.</td></tr>"#);
    }
    page.push_str("</table>");

    page.push_str(r#"<h2>Containers</h2><table><tr><th>Name</th><th>Image</th><th>Ports</th><th>IP</th><th>Workdir</th></tr>"#);
    for container in &data.containers {
        let ports: Vec<String> = container
            .exposed_ports
            .iter()
            .map(|p| p.to_string())
            .collect();
        let _ = write!(
            page,
            r#"<tr><td>{}</td><td>{}</td><td class="dim">{}</td><td>{}</td><td class="dim">{}</td></tr>"#,
            esc(&container.name),
            esc(&container.image),
            ports.join(", "),
            esc(&container.network_ip),
            esc(&container.workdir),
        );
    }
    if data.containers.is_empty() {
        page.push_str(r#"<tr><td colspan="5" class="dim">No containers detected.</td></tr>"#);
    }
    page.push_str("</table>");

    page.push_str(r#"<h2>Recent logs</h2><table><tr><th>Time</th><th>Level</th><th>Message</th><th>Fields</th></tr>"#);
    for entry in data.logs.iter().rev() {
        let _ = write!(
            page,
            r#"<tr><td class="dim">{time}</td><td class="lv-{level}">{level}</td><td>{message}</td><td class="dim">{fields}</td></tr>"#,
            time = esc(&entry.time),
            level = esc(&entry.level),
            message = esc(&entry.message),
            fields = esc(&entry.fields),
        );
    }
    if data.logs.is_empty() {
        page.push_str(r#"<tr><td colspan="4" class="dim">No log entries yet.</td></tr>"#);
    }
    page.push_str("</table>");

    page.push_str(DASHBOARD_TAIL);
    page
}

const DASHBOARD_HEAD: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>seergate</title>
<style>
  body { font: 14px/1.5 ui-monospace, monospace; background: #101012; color: #cfcbc3; margin: 0; padding: 32px; }
  h1 { font-size: 16px; color: #d4a843; }
  h2 { font-size: 12px; color: #d4a843; text-transform: uppercase; letter-spacing: .08em; margin: 32px 0 8px; }
  .env { display: flex; gap: 24px; padding: 8px 0; border-top: 1px solid #222; border-bottom: 1px solid #222; font-size: 12px; }
  .env b { color: #777; text-transform: uppercase; font-size: 10px; margin-right: 6px; }
  .stats { display: flex; gap: 32px; margin: 20px 0; }
  .stats .num { font-size: 26px; color: #fff; display: block; }
  table { border-collapse: collapse; width: 100%; background: #16161a; border: 1px solid #26262a; }
  th { font-size: 10px; text-transform: uppercase; color: #777; text-align: left; padding: 6px 10px; border-bottom: 1px solid #26262a; }
  td { padding: 6px 10px; border-bottom: 1px solid #1c1c20; }
  td a { color: #cfcbc3; }
  .dim { color: #726f68; font-size: 12px; }
  .lv-warn { color: #d4a843; }
  .lv-error { color: #c47e7e; }
  .lv-info { color: #7ec47e; }
  .lv-debug { color: #726f68; }
  input { font: inherit; background: #101012; color: #cfcbc3; border: 1px solid #2c2c30; padding: 2px 6px; }
  button { font: inherit; font-size: 11px; background: #1c1c20; color: #cfcbc3; border: 1px solid #2c2c30; cursor: pointer; padding: 2px 8px; }
  button:hover { border-color: #d4a843; color: #d4a843; }
</style>
</head>
<body>
<h1>seergate // dashboard</h1>
"#;

const DASHBOARD_TAIL: &str = r#"
<script>
function row(host) {
  return {
    target: document.querySelector('input.target[data-host="' + host + '"]').value,
    port: parseInt(document.querySelector('input.port[data-host="' + host + '"]').value),
    kind: document.querySelector('input.target[data-host="' + host + '"]').closest('tr').children[1].textContent,
  };
}
async function save(host) {
  const r = row(host);
  const resp = await fetch('/_api/mappings/' + encodeURIComponent(host), {
    method: 'PUT',
    headers: {'Content-Type': 'application/json'},
    body: JSON.stringify({type: r.kind, target: r.target, port: r.port}),
  });
  if (resp.ok) location.reload(); else alert('update failed: ' + await resp.text());
}
async function del(host) {
  if (!confirm('Remove mapping for ' + host + '?')) return;
  const resp = await fetch('/_api/mappings/' + encodeURIComponent(host), {method: 'DELETE'});
  if (resp.ok) location.reload(); else alert('delete failed');
}
</script>
</body>
</html>"#;
