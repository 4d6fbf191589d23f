//! The LLM judge gateway
//!
//! Turns "which local service does `myapp.localhost` mean?" into a single
//! chat-completion call against an OpenAI-compatible endpoint. The judge
//! sees the live inventory (processes, containers, current mappings) and
//! answers with a JSON target decision, which is validated here before it
//! becomes a mapping. The gateway never retries; concurrent misses are
//! coalesced upstream and failures surface to the client as 502.

use crate::discovery::{ContainerRecord, ProcessRecord};
use crate::store::{now_rfc3339, ProcessIdentifier, RouteMapping, TargetKind};
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "anthropic/claude-haiku-4.5";

/// Everything the judge gets to look at.
pub struct InventorySnapshot {
    pub processes: Vec<ProcessRecord>,
    pub containers: Vec<ContainerRecord>,
    pub mappings: HashMap<String, RouteMapping>,
}

/// A validated judge reply.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetDecision {
    pub kind: TargetKind,
    pub target: String,
    pub port: u16,
    pub rationale: String,
    pub workdir: Option<String>,
    pub command_regex: Option<String>,
}

impl TargetDecision {
    /// Materialize the decision as a durable mapping. A process decision
    /// with a workdir keeps it as the identifier so the port can be
    /// re-derived after restarts.
    pub fn into_mapping(self) -> RouteMapping {
        let identifier = match (self.kind, self.workdir) {
            (TargetKind::Process, Some(workdir)) if !workdir.is_empty() => {
                Some(ProcessIdentifier {
                    workdir,
                    command_pattern: self.command_regex,
                })
            }
            _ => None,
        };
        RouteMapping {
            kind: self.kind,
            target: self.target,
            port: self.port,
            created_at: now_rfc3339(),
            llm_reason: self.rationale,
            identifier,
        }
    }
}

// Wire shape of the judge's JSON answer. `type` may be the legacy
// "docker" label; `port` is widened so out-of-range values fail
// validation instead of deserialization.
#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    target: String,
    #[serde(default)]
    port: i64,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    workdir: Option<String>,
    #[serde(default, rename = "commandPattern")]
    command_pattern: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

/// Client for the chat-completions judge endpoint.
pub struct ResolverGateway {
    client: reqwest::Client,
    api_key: String,
    api_url: String,
    model: String,
}

impl ResolverGateway {
    pub fn new(api_key: String, api_url: String, model: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client with static options");
        Self {
            client,
            api_key,
            api_url,
            model,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Decide a target for a hostname nobody has asked about before.
    pub async fn resolve_hostname(
        &self,
        hostname: &str,
        user_hint: Option<&str>,
        inventory: &InventorySnapshot,
    ) -> Result<TargetDecision> {
        let prompt = build_hostname_prompt(hostname, user_hint, inventory);
        self.call_judge(HOSTNAME_SYSTEM_PROMPT, &prompt).await
    }

    /// Decide a target for a service related to an already-routed origin
    /// (the `/_proxy/<service>/` path).
    pub async fn resolve_related(
        &self,
        origin_host: &str,
        origin_mapping: Option<&RouteMapping>,
        service_name: &str,
        user_hint: Option<&str>,
        inventory: &InventorySnapshot,
    ) -> Result<TargetDecision> {
        let prompt =
            build_related_prompt(origin_host, origin_mapping, service_name, user_hint, inventory);
        self.call_judge(RELATED_SYSTEM_PROMPT, &prompt).await
    }

    async fn call_judge(&self, system_prompt: &str, user_prompt: &str) -> Result<TargetDecision> {
        if self.api_key.is_empty() {
            anyhow::bail!("no API key configured for the resolver");
        }

        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "response_format": {"type": "json_object"},
        });

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("calling resolver API")?;

        let status = response.status();
        let text = response.text().await.context("reading resolver reply")?;
        if !status.is_success() {
            anyhow::bail!("resolver API returned {status}: {text}");
        }

        let completion: ChatCompletion =
            serde_json::from_str(&text).context("parsing resolver API reply")?;
        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .filter(|c| !c.is_empty())
            .context("resolver returned no choices")?;

        debug!(content, "judge reply");
        parse_decision(content)
    }
}

/// Parse and validate the judge's answer, tolerating a markdown fence
/// around the JSON object.
pub fn parse_decision(content: &str) -> Result<TargetDecision> {
    let stripped = strip_code_fence(content);
    let raw: RawDecision = serde_json::from_str(stripped)
        .with_context(|| format!("resolver reply is not valid JSON: {stripped}"))?;
    validate_decision(raw)
}

fn validate_decision(raw: RawDecision) -> Result<TargetDecision> {
    let kind = match raw.kind.as_str() {
        "process" => TargetKind::Process,
        "container" | "docker" => TargetKind::Container,
        other => anyhow::bail!("resolver chose unknown kind {other:?}"),
    };
    if raw.target.is_empty() {
        anyhow::bail!("resolver chose an empty target");
    }
    if !(1..=65535).contains(&raw.port) {
        anyhow::bail!("resolver chose port {} outside 1-65535", raw.port);
    }
    Ok(TargetDecision {
        kind,
        target: raw.target,
        port: raw.port as u16,
        rationale: raw.reason,
        workdir: raw.workdir.filter(|w| !w.is_empty()),
        command_regex: raw.command_pattern.filter(|p| !p.is_empty()),
    })
}

/// Remove a leading ```` ```json ```` (or bare ```` ``` ````) fence and a
/// trailing ```` ``` ````, if present.
fn strip_code_fence(content: &str) -> &str {
    let mut s = content.trim();
    if let Some(rest) = s.strip_prefix("```") {
        s = rest.strip_prefix("json").unwrap_or(rest).trim_start();
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest.trim_end();
    }
    s
}

const HOSTNAME_SYSTEM_PROMPT: &str = r#"You are a routing resolver for a local development proxy. Your job is to determine which local service a request should be forwarded to based on the hostname.

You will receive:
1. The hostname from the request (e.g., "myapp.localhost", "api.project.localhost")
2. A list of locally running processes with their ports, commands, arguments, and working directories
3. A list of containers with their names, images, exposed ports, IP addresses, and working directories
4. Current routing mappings for context

Analyze the hostname and determine the best matching service. Consider:
- Hostname patterns (e.g., "vite.myproject.localhost" might match a Vite process running in a "myproject" directory)
- Service types (e.g., a hostname containing "api" might route to a backend service)
- Project names in the hostname vs working directories
- Container names vs hostname parts

Respond with a JSON object:
{
  "type": "process" | "container",
  "target": "localhost" for process, or container name for container,
  "port": the port number to connect to,
  "reason": "brief explanation of why this target was chosen",
  "workdir": "working directory of the matched process (REQUIRED for type=process, omit for container)"
}

IMPORTANT: For type="process", you MUST include the "workdir" field with the full working directory path of the matched process. It is used to re-derive the port when the process restarts.

If no suitable target is found, still provide your best guess with explanation."#;

const RELATED_SYSTEM_PROMPT: &str = r#"You are a routing resolver for a local development proxy. Your job is to find a related service for a given origin service.

You will receive:
1. The origin hostname and where it routes to (e.g., "app.mapeditor.localhost" -> process on port 5173)
2. The service name being requested (e.g., "api", "backend", "db")
3. A list of locally running processes with their ports, commands, arguments, and working directories
4. A list of containers with their names, images, exposed ports, IP addresses, and working directories
5. Current routing mappings for context

Find the related service. Consider:
- If origin is "app.mapeditor.localhost" and service is "api", look for an API/backend service in the same project (mapeditor)
- Working directories are key - look for services in the same project folder
- Compose services often have related names (app, api, db, redis, etc.)
- Common patterns: frontend+backend, app+api, web+server

Respond with a JSON object:
{
  "type": "process" | "container",
  "target": "localhost" for process, or container name for container,
  "port": the port number to connect to,
  "reason": "brief explanation of why this target was chosen",
  "workdir": "working directory of the matched process (REQUIRED for type=process, omit for container)"
}

IMPORTANT: For type="process", you MUST include the "workdir" field with the full working directory path of the matched process. It is used to re-derive the port when the process restarts.

If no suitable target is found, still provide your best guess with explanation."#;

fn build_hostname_prompt(
    hostname: &str,
    user_hint: Option<&str>,
    inventory: &InventorySnapshot,
) -> String {
    let mut prompt = format!("Hostname to resolve: {hostname}\n\n");
    push_inventory_sections(&mut prompt, inventory);
    push_user_hint(&mut prompt, user_hint);
    prompt
}

fn build_related_prompt(
    origin_host: &str,
    origin_mapping: Option<&RouteMapping>,
    service_name: &str,
    user_hint: Option<&str>,
    inventory: &InventorySnapshot,
) -> String {
    let mut prompt = String::from("## Request Context\n");
    let _ = writeln!(prompt, "Origin hostname: {origin_host}");
    if let Some(mapping) = origin_mapping {
        let _ = writeln!(
            prompt,
            "Origin routes to: {}:{}:{}",
            mapping.kind.as_str(),
            mapping.target,
            mapping.port
        );
    }
    let _ = writeln!(prompt, "Looking for related service: \"{service_name}\"\n");
    push_inventory_sections(&mut prompt, inventory);
    push_user_hint(&mut prompt, user_hint);
    prompt
}

fn push_inventory_sections(prompt: &mut String, inventory: &InventorySnapshot) {
    prompt.push_str("## Local Processes\n");
    if inventory.processes.is_empty() {
        prompt.push_str("No local processes with open ports found.\n");
    }
    for proc in &inventory.processes {
        let _ = write!(prompt, "- Port {}: {}", proc.port, proc.command);
        if !proc.args.is_empty() {
            let _ = write!(prompt, " (args: {})", proc.args);
        }
        if !proc.workdir.is_empty() {
            let _ = write!(prompt, " [workdir: {}]", proc.workdir);
        }
        prompt.push('\n');
    }

    prompt.push_str("\n## Containers\n");
    if inventory.containers.is_empty() {
        prompt.push_str("No containers found.\n");
    }
    for container in &inventory.containers {
        let _ = write!(prompt, "- {} (image: {})", container.name, container.image);
        if !container.exposed_ports.is_empty() {
            let ports: Vec<String> = container
                .exposed_ports
                .iter()
                .map(|p| p.to_string())
                .collect();
            let _ = write!(prompt, " ports: {}", ports.join(", "));
        }
        if !container.network_ip.is_empty() {
            let _ = write!(prompt, " [ip: {}]", container.network_ip);
        }
        if !container.workdir.is_empty() {
            let _ = write!(prompt, " [workdir: {}]", container.workdir);
        }
        prompt.push('\n');
    }

    prompt.push_str("\n## Current Mappings\n");
    if inventory.mappings.is_empty() {
        prompt.push_str("No existing mappings.\n");
    }
    let mut hosts: Vec<&String> = inventory.mappings.keys().collect();
    hosts.sort();
    for host in hosts {
        let mapping = &inventory.mappings[host];
        let _ = write!(
            prompt,
            "- {host} -> {}:{}:{}",
            mapping.kind.as_str(),
            mapping.target,
            mapping.port
        );
        if !mapping.llm_reason.is_empty() {
            let _ = write!(prompt, " ({})", mapping.llm_reason);
        }
        prompt.push('\n');
    }
}

fn push_user_hint(prompt: &mut String, user_hint: Option<&str>) {
    if let Some(hint) = user_hint.filter(|h| !h.is_empty()) {
        let _ = write!(prompt, "\n## Additional Context from User\n{hint}\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_inventory() -> InventorySnapshot {
        InventorySnapshot {
            processes: Vec::new(),
            containers: Vec::new(),
            mappings: HashMap::new(),
        }
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("  ```json\n{}\n```  "), "{}");
    }

    #[test]
    fn test_parse_decision_valid() {
        let decision = parse_decision(
            r#"{"type":"process","target":"localhost","port":3000,"reason":"vite","workdir":"/home/u/myapp"}"#,
        )
        .unwrap();
        assert_eq!(decision.kind, TargetKind::Process);
        assert_eq!(decision.target, "localhost");
        assert_eq!(decision.port, 3000);
        assert_eq!(decision.workdir.as_deref(), Some("/home/u/myapp"));
    }

    #[test]
    fn test_parse_decision_docker_alias() {
        let decision =
            parse_decision(r#"{"type":"docker","target":"app-web","port":80,"reason":"compose"}"#)
                .unwrap();
        assert_eq!(decision.kind, TargetKind::Container);
    }

    #[test]
    fn test_parse_decision_rejects_bad_values() {
        assert!(parse_decision(r#"{"type":"vm","target":"x","port":80,"reason":""}"#).is_err());
        assert!(parse_decision(r#"{"type":"process","target":"","port":80,"reason":""}"#).is_err());
        assert!(
            parse_decision(r#"{"type":"process","target":"localhost","port":0,"reason":""}"#)
                .is_err()
        );
        assert!(
            parse_decision(r#"{"type":"process","target":"localhost","port":70000,"reason":""}"#)
                .is_err()
        );
        assert!(parse_decision("not json at all").is_err());
    }

    #[test]
    fn test_into_mapping_keeps_identifier_for_processes_only() {
        let mapping = TargetDecision {
            kind: TargetKind::Process,
            target: "localhost".to_string(),
            port: 3000,
            rationale: "vite".to_string(),
            workdir: Some("/home/u/myapp".to_string()),
            command_regex: Some("vite".to_string()),
        }
        .into_mapping();
        let id = mapping.identifier.unwrap();
        assert_eq!(id.workdir, "/home/u/myapp");
        assert_eq!(id.command_pattern.as_deref(), Some("vite"));
        assert!(!mapping.created_at.is_empty());

        let mapping = TargetDecision {
            kind: TargetKind::Container,
            target: "app-web".to_string(),
            port: 80,
            rationale: "compose".to_string(),
            workdir: Some("/home/u/myapp".to_string()),
            command_regex: None,
        }
        .into_mapping();
        assert!(mapping.identifier.is_none(), "containers never carry identifiers");
    }

    #[test]
    fn test_hostname_prompt_sections() {
        let mut inventory = empty_inventory();
        inventory.processes.push(ProcessRecord {
            port: 5173,
            pid: 1,
            ppid: 0,
            bind_address: "0.0.0.0".to_string(),
            command: "node".to_string(),
            args: "vite".to_string(),
            workdir: "/home/u/shop".to_string(),
        });
        inventory.mappings.insert(
            "old.localhost".to_string(),
            RouteMapping {
                kind: TargetKind::Container,
                target: "db".to_string(),
                port: 5432,
                created_at: String::new(),
                llm_reason: "postgres".to_string(),
                identifier: None,
            },
        );

        let prompt = build_hostname_prompt("shop.localhost", Some("the vite one"), &inventory);
        assert!(prompt.starts_with("Hostname to resolve: shop.localhost"));
        assert!(prompt.contains("## Local Processes"));
        assert!(prompt.contains("- Port 5173: node (args: vite) [workdir: /home/u/shop]"));
        assert!(prompt.contains("No containers found."));
        assert!(prompt.contains("- old.localhost -> container:db:5432 (postgres)"));
        assert!(prompt.contains("## Additional Context from User\nthe vite one"));
    }

    #[test]
    fn test_related_prompt_context() {
        let origin = RouteMapping {
            kind: TargetKind::Process,
            target: "localhost".to_string(),
            port: 5173,
            created_at: String::new(),
            llm_reason: String::new(),
            identifier: None,
        };
        let prompt = build_related_prompt(
            "app.proj.localhost",
            Some(&origin),
            "api",
            None,
            &empty_inventory(),
        );
        assert!(prompt.contains("Origin hostname: app.proj.localhost"));
        assert!(prompt.contains("Origin routes to: process:localhost:5173"));
        assert!(prompt.contains("Looking for related service: \"api\""));
        assert!(!prompt.contains("Additional Context"));
    }
}
