//! Template variable substitution and email composition.
//!
//! Tokens: `{{key}}` substitutes from the variable map; `{{key ?? default}}`
//! falls back to the default when the key is absent. Array values render as
//! an unordered HTML list. Unknown keys with no default render empty.

use serde_json::Value;

use lettermill_core::config::SenderConfig;
use lettermill_core::types::{Contact, OutboundEmail, Project, Template, TemplateKind};

/// Render one string against a variable map.
pub fn render(input: &str, vars: &Value) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                expand_token(&after[..end], vars, &mut out);
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated token — keep it literal
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn expand_token(token: &str, vars: &Value, out: &mut String) {
    let (key, default) = match token.split_once("??") {
        Some((k, d)) => (k.trim(), Some(d.trim())),
        None => (token.trim(), None),
    };
    match vars.get(key) {
        Some(Value::String(s)) => out.push_str(s),
        Some(Value::Array(items)) => {
            out.push_str("<ul>");
            for item in items {
                out.push_str("<li>");
                match item {
                    Value::String(s) => out.push_str(s),
                    other => out.push_str(&other.to_string()),
                }
                out.push_str("</li>");
            }
            out.push_str("</ul>");
        }
        Some(Value::Null) | None => out.push_str(default.unwrap_or("")),
        Some(other) => out.push_str(&other.to_string()),
    }
}

/// Variable map for a contact: its metadata plus the two reserved keys
/// `contact_id` and `contact_email`.
pub fn contact_vars(contact: &Contact) -> Value {
    let mut map = match &contact.metadata {
        Value::Object(m) => m.clone(),
        _ => serde_json::Map::new(),
    };
    map.insert("contact_id".into(), Value::String(contact.id.clone()));
    map.insert("contact_email".into(), Value::String(contact.email.clone()));
    Value::Object(map)
}

/// Sender address: the project's verified sender when present, else the
/// shared fallback.
pub fn resolve_sender(project: Option<&Project>, sender: &SenderConfig) -> String {
    project
        .and_then(|p| p.verified_sender.clone())
        .unwrap_or_else(|| sender.fallback_address.clone())
}

fn unsubscribe_footer(base_url: &str, contact_id: &str) -> String {
    format!(
        "<p style=\"font-size:12px;color:#667\"><a href=\"{base_url}/unsubscribe/{contact_id}\">Unsubscribe</a></p>"
    )
}

/// Render a full email for a contact: subject and body substitution, sender
/// resolution, and the unsubscribe footer for marketing templates.
pub fn render_email(
    template: &Template,
    contact: &Contact,
    project: Option<&Project>,
    sender: &SenderConfig,
) -> OutboundEmail {
    let vars = contact_vars(contact);
    let subject = render(&template.subject, &vars);
    let mut html = render(&template.body, &vars);
    if template.kind == TemplateKind::Marketing {
        html.push_str(&unsubscribe_footer(&sender.unsubscribe_base_url, &contact.id));
    }
    OutboundEmail {
        from: resolve_sender(project, sender),
        to: contact.email.clone(),
        subject,
        html,
    }
}
