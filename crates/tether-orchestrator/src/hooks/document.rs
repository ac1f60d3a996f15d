//! The assistant's settings document and the hook entries we own in it
//!
//! Hooks live under `hooks.<EventName>` as a list of matcher groups, each
//! with its own `hooks` list of `{type, command}` entries. Every command we
//! write ends with an ownership marker carrying a format version, so
//! unrelated entries are never touched.

use serde::Serialize;
use serde_json::{json, Map, Value};

use tether_core::api::HookEventKind;
use tether_core::config::UrlMatch;
use tether_core::error::HookError;

use crate::session::INSTANCE_ID_ENV;
use crate::ssh::shell_quote;

/// Prefix of the ownership marker appended to every managed command
pub const MARKER_PREFIX: &str = "# tether-hook v";

/// Current hook command format
pub const MARKER_VERSION: u32 = 1;

/// Path segment the callback URL ends with, before the event slug
const CALLBACK_PATH: &str = "/api/hooks/";

/// Shell command posting one hook event back to `orchestrator_url`
pub fn hook_command(kind: HookEventKind, orchestrator_url: &str) -> String {
    let endpoint = format!(
        "{}{}{}",
        orchestrator_url.trim_end_matches('/'),
        CALLBACK_PATH,
        kind.slug()
    );
    format!(
        "jq -c '{{instanceId: env.{env}, payload: .}}' | curl -s -m 5 -X POST -H 'Content-Type: application/json' --data-binary @- {url} >/dev/null 2>&1 || true {marker}{version}",
        env = INSTANCE_ID_ENV,
        url = shell_quote(&endpoint),
        marker = MARKER_PREFIX,
        version = MARKER_VERSION,
    )
}

/// What an owned command says about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedCommand {
    pub version: u32,
    /// Orchestrator base URL, if one could be extracted
    pub base_url: Option<String>,
    pub slug: Option<String>,
}

/// Parse a command we wrote; `None` for commands we do not own
pub fn parse_owned(command: &str) -> Option<OwnedCommand> {
    let marker_at = command.rfind(MARKER_PREFIX)?;
    let version = command[marker_at + MARKER_PREFIX.len()..]
        .trim()
        .parse()
        .ok()?;

    let (base_url, slug) = match command.rfind(CALLBACK_PATH) {
        Some(path_at) => {
            let base_start = command[..path_at].rfind('\'').map(|i| i + 1).unwrap_or(0);
            let base = &command[base_start..path_at];
            let rest = &command[path_at + CALLBACK_PATH.len()..];
            let slug_end = rest.find('\'').unwrap_or(rest.len());
            (
                Some(base.to_string()).filter(|b| b.contains("://")),
                Some(rest[..slug_end].to_string()),
            )
        }
        None => (None, None),
    };

    Some(OwnedCommand {
        version,
        base_url,
        slug,
    })
}

fn is_owned(command: &str) -> bool {
    parse_owned(command).is_some()
}

/// Whether `found` points at `expected` under `rule`
pub fn url_matches(rule: UrlMatch, found: &str, expected: &str) -> bool {
    let found = found.trim_end_matches('/');
    let expected = expected.trim_end_matches('/');
    match rule {
        UrlMatch::Exact => found == expected,
        UrlMatch::Prefix => found.starts_with(expected),
        UrlMatch::Host => authority(found) == authority(expected),
    }
}

/// `host[:port]` of a URL, lowercased
fn authority(url: &str) -> String {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    rest.split('/').next().unwrap_or("").to_ascii_lowercase()
}

fn group_for(event: &str, kind: HookEventKind, orchestrator_url: &str) -> Value {
    let entry = json!({
        "type": "command",
        "command": hook_command(kind, orchestrator_url),
    });
    if event == "PreToolUse" {
        json!({ "matcher": "*", "hooks": [entry] })
    } else {
        json!({ "hooks": [entry] })
    }
}

/// Managed event names paired with their callback kinds
fn managed(events: &[String]) -> impl Iterator<Item = (&str, HookEventKind)> {
    events
        .iter()
        .filter_map(|name| HookEventKind::from_hook_name(name).map(|k| (name.as_str(), k)))
}

/// The document `install` would produce on a machine with no settings
pub fn preview(events: &[String], orchestrator_url: &str) -> Value {
    let mut hooks = Map::new();
    for (name, kind) in managed(events) {
        hooks.insert(name.to_string(), json!([group_for(name, kind, orchestrator_url)]));
    }
    json!({ "hooks": hooks })
}

/// Parse remote settings text; blank counts as empty
pub fn parse(text: &str) -> Result<Value, HookError> {
    if text.trim().is_empty() {
        return Ok(json!({}));
    }
    let doc: Value =
        serde_json::from_str(text).map_err(|e| HookError::Malformed(e.to_string()))?;
    if !doc.is_object() {
        return Err(HookError::Malformed("settings root is not an object".into()));
    }
    Ok(doc)
}

fn hooks_object(doc: &mut Value) -> Result<&mut Map<String, Value>, HookError> {
    let root = doc
        .as_object_mut()
        .ok_or_else(|| HookError::Malformed("settings root is not an object".into()))?;
    root.entry("hooks")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| HookError::Malformed("`hooks` is not an object".into()))
}

/// Remove owned commands from one event's group list; returns how many went
fn strip_groups(groups: &mut Vec<Value>) -> usize {
    let mut removed = 0;
    groups.retain_mut(|group| {
        let Some(entries) = group.get_mut("hooks").and_then(Value::as_array_mut) else {
            return true;
        };
        let before = entries.len();
        entries.retain(|entry| {
            !entry
                .get("command")
                .and_then(Value::as_str)
                .map(is_owned)
                .unwrap_or(false)
        });
        let stripped = before - entries.len();
        removed += stripped;
        // Drop groups we emptied, keep groups that were already empty
        !(stripped > 0 && entries.is_empty())
    });
    removed
}

/// Replace our entries for every managed event, preserving everything else
pub fn merge(mut doc: Value, events: &[String], orchestrator_url: &str) -> Result<Value, HookError> {
    let hooks = hooks_object(&mut doc)?;

    for (name, kind) in managed(events) {
        let slot = hooks.entry(name.to_string()).or_insert_with(|| json!([]));
        let groups = slot
            .as_array_mut()
            .ok_or_else(|| HookError::Malformed(format!("`hooks.{}` is not a list", name)))?;
        strip_groups(groups);
        groups.push(group_for(name, kind, orchestrator_url));
    }

    Ok(doc)
}

/// Remove every owned entry; returns the new document and the count removed
pub fn strip(mut doc: Value) -> Result<(Value, usize), HookError> {
    let Some(hooks) = doc.get_mut("hooks") else {
        return Ok((doc, 0));
    };
    let hooks = hooks
        .as_object_mut()
        .ok_or_else(|| HookError::Malformed("`hooks` is not an object".into()))?;

    let mut removed = 0;
    let mut emptied = Vec::new();
    for (name, groups) in hooks.iter_mut() {
        if let Some(groups) = groups.as_array_mut() {
            let n = strip_groups(groups);
            if n > 0 && groups.is_empty() {
                emptied.push(name.clone());
            }
            removed += n;
        }
    }
    for name in emptied {
        hooks.remove(&name);
    }

    Ok((doc, removed))
}

fn commands_for<'a>(doc: &'a Value, event: &str) -> Vec<&'a str> {
    doc.get("hooks")
        .and_then(|h| h.get(event))
        .and_then(Value::as_array)
        .map(|groups| {
            groups
                .iter()
                .filter_map(|g| g.get("hooks").and_then(Value::as_array))
                .flatten()
                .filter_map(|e| e.get("command").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default()
}

/// Event names that have at least one hook group defined
pub fn defined_events(doc: &Value) -> Vec<String> {
    let mut names: Vec<String> = doc
        .get("hooks")
        .and_then(Value::as_object)
        .map(|hooks| {
            hooks
                .iter()
                .filter(|(_, groups)| groups.as_array().map(|g| !g.is_empty()).unwrap_or(false))
                .map(|(name, _)| name.clone())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

/// Event names carrying at least one of our entries
pub fn owned_events(doc: &Value) -> Vec<String> {
    defined_events(doc)
        .into_iter()
        .filter(|name| commands_for(doc, name).into_iter().any(is_owned))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookState {
    Installed,
    Missing,
    /// Present but pointing elsewhere, outdated, or unparseable
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Installed,
    Partial,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookCheck {
    pub name: String,
    pub state: HookState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookVerification {
    pub hooks: Vec<HookCheck>,
    pub status: VerificationStatus,
}

fn classify_event(
    doc: &Value,
    name: &str,
    kind: HookEventKind,
    expected_url: &str,
    rule: UrlMatch,
) -> HookCheck {
    let commands = commands_for(doc, name);
    let mut problem = None;

    for command in &commands {
        match parse_owned(command) {
            Some(owned) => {
                let url_ok = owned
                    .base_url
                    .as_deref()
                    .map(|u| url_matches(rule, u, expected_url))
                    .unwrap_or(false);
                let slug_ok = owned.slug.as_deref() == Some(kind.slug());

                if owned.version == MARKER_VERSION && url_ok && slug_ok {
                    return HookCheck {
                        name: name.to_string(),
                        state: HookState::Installed,
                        detail: None,
                    };
                }
                problem = Some(if owned.version != MARKER_VERSION {
                    format!("outdated hook format v{}", owned.version)
                } else if !slug_ok {
                    "malformed hook command".to_string()
                } else {
                    format!(
                        "points at {}",
                        owned.base_url.unwrap_or_else(|| "an unknown URL".into())
                    )
                });
            }
            // Hand-edited copies of our command without the marker
            None if command.contains(CALLBACK_PATH) && problem.is_none() => {
                problem = Some("unmanaged callback command".to_string());
            }
            None => {}
        }
    }

    match problem {
        Some(detail) => HookCheck {
            name: name.to_string(),
            state: HookState::Invalid,
            detail: Some(detail),
        },
        None => HookCheck {
            name: name.to_string(),
            state: HookState::Missing,
            detail: None,
        },
    }
}

/// Classify every managed event against `expected_url`
pub fn verify(doc: &Value, events: &[String], expected_url: &str, rule: UrlMatch) -> HookVerification {
    let hooks: Vec<HookCheck> = managed(events)
        .map(|(name, kind)| classify_event(doc, name, kind, expected_url, rule))
        .collect();

    let installed = hooks.iter().filter(|h| h.state == HookState::Installed).count();
    let status = if installed == 0 {
        VerificationStatus::None
    } else if installed == hooks.len() {
        VerificationStatus::Installed
    } else {
        VerificationStatus::Partial
    };

    HookVerification { hooks, status }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "http://127.0.0.1:47100";

    fn events() -> Vec<String> {
        ["UserPromptSubmit", "PreToolUse", "Notification", "Stop"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_hook_command_round_trips_through_parser() {
        let cmd = hook_command(HookEventKind::Stop, "http://127.0.0.1:47100/");
        assert!(cmd.contains("'http://127.0.0.1:47100/api/hooks/stop'"));
        assert!(cmd.contains("env.TETHER_INSTANCE_ID"));

        let owned = parse_owned(&cmd).unwrap();
        assert_eq!(owned.version, MARKER_VERSION);
        assert_eq!(owned.base_url.as_deref(), Some(URL));
        assert_eq!(owned.slug.as_deref(), Some("stop"));
    }

    #[test]
    fn test_foreign_commands_are_not_owned() {
        assert!(parse_owned("/usr/local/bin/rch").is_none());
        assert!(parse_owned("echo '# tether-hook vX'").is_none());
    }

    #[test]
    fn test_merge_preserves_foreign_entries() {
        let doc = parse(
            r#"{
                "theme": "dark",
                "hooks": {
                    "PreToolUse": [{"matcher": "Bash", "hooks": [{"type": "command", "command": "rch"}]}]
                }
            }"#,
        )
        .unwrap();

        let merged = merge(doc, &events(), URL).unwrap();
        assert_eq!(merged["theme"], "dark");

        let pre = merged["hooks"]["PreToolUse"].as_array().unwrap();
        assert_eq!(pre.len(), 2);
        assert_eq!(pre[0]["hooks"][0]["command"], "rch");
        assert_eq!(defined_events(&merged).len(), 4);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let once = merge(json!({}), &events(), URL).unwrap();
        let twice = merge(once.clone(), &events(), URL).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_rejects_non_list_event() {
        let doc = json!({"hooks": {"Stop": "nope"}});
        assert!(matches!(merge(doc, &events(), URL), Err(HookError::Malformed(_))));
    }

    #[test]
    fn test_strip_leaves_unrelated_entries() {
        let doc = parse(
            r#"{"hooks": {"Stop": [{"hooks": [{"type": "command", "command": "say done"}]}]}}"#,
        )
        .unwrap();
        let merged = merge(doc, &events(), URL).unwrap();

        let (stripped, removed) = strip(merged).unwrap();
        assert_eq!(removed, 4);
        assert_eq!(defined_events(&stripped), vec!["Stop".to_string()]);
        assert_eq!(stripped["hooks"]["Stop"][0]["hooks"][0]["command"], "say done");
        assert!(owned_events(&stripped).is_empty());
    }

    #[test]
    fn test_verify_states() {
        let doc = merge(json!({}), &events(), URL).unwrap();
        let report = verify(&doc, &events(), URL, UrlMatch::Exact);
        assert_eq!(report.status, VerificationStatus::Installed);

        let elsewhere = verify(&doc, &events(), "http://10.0.0.9:7420", UrlMatch::Exact);
        assert_eq!(elsewhere.status, VerificationStatus::None);
        assert!(elsewhere.hooks.iter().all(|h| h.state == HookState::Invalid));

        let empty = verify(&json!({}), &events(), URL, UrlMatch::Exact);
        assert!(empty.hooks.iter().all(|h| h.state == HookState::Missing));
    }

    #[test]
    fn test_verify_partial() {
        let doc = merge(json!({}), &["Stop".to_string()], URL).unwrap();
        let report = verify(&doc, &events(), URL, UrlMatch::Exact);
        assert_eq!(report.status, VerificationStatus::Partial);
    }

    #[test]
    fn test_outdated_version_is_invalid() {
        let cmd = hook_command(HookEventKind::Stop, URL).replace("tether-hook v1", "tether-hook v0");
        let doc = json!({"hooks": {"Stop": [{"hooks": [{"type": "command", "command": cmd}]}]}});
        let report = verify(&doc, &["Stop".to_string()], URL, UrlMatch::Exact);
        assert_eq!(report.hooks[0].state, HookState::Invalid);
        assert!(report.hooks[0].detail.as_deref().unwrap().contains("v0"));
    }

    #[test]
    fn test_url_match_rules() {
        assert!(url_matches(UrlMatch::Exact, "http://a:1/", "http://a:1"));
        assert!(!url_matches(UrlMatch::Exact, "http://a:1/x", "http://a:1"));
        assert!(url_matches(UrlMatch::Prefix, "http://a:1/x", "http://a:1"));
        assert!(url_matches(UrlMatch::Host, "https://A:1/other", "http://a:1"));
        assert!(!url_matches(UrlMatch::Host, "http://a:2", "http://a:1"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse("{not json"), Err(HookError::Malformed(_))));
        assert!(matches!(parse("[1,2]"), Err(HookError::Malformed(_))));
        assert_eq!(parse("  \n").unwrap(), json!({}));
    }
}
