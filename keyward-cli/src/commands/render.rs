use chrono::{DateTime, Utc};
use colored::{ColoredString, Colorize};
use keyward_security::{IdTokenClaims, KeySet};

/// Warm palette scopes cycle through.
pub const SCOPE_PALETTE: [(u8, u8, u8); 5] = [
    (0xf9, 0x92, 0x66),
    (0xfb, 0xb7, 0x73),
    (0xfb, 0xcc, 0x86),
    (0xf6, 0xe5, 0x7d),
    (0xcc, 0xee, 0x82),
];

fn label(text: &str) -> ColoredString {
    format!("{text}:").blue().bold()
}

fn timestamp(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "not present".dimmed().to_string())
}

fn optional(value: Option<&str>) -> String {
    value
        .map(String::from)
        .unwrap_or_else(|| "not present".dimmed().to_string())
}

/// Scopes separated by spaces, each coloured from [`SCOPE_PALETTE`].
pub fn render_scopes(scopes: &[String]) -> String {
    if scopes.is_empty() {
        return "no scopes on id_token".dimmed().to_string();
    }
    scopes
        .iter()
        .enumerate()
        .map(|(i, scope)| {
            let (r, g, b) = SCOPE_PALETTE[i % SCOPE_PALETTE.len()];
            scope.truecolor(r, g, b).to_string()
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Human-readable summary of verified claims, one per line.
pub fn render_claims(claims: &IdTokenClaims) -> String {
    let mut out = String::new();
    let mut line = |name: &str, value: String| {
        out.push_str(&format!("{} {value}\n", label(name)));
    };

    line("Auth time", timestamp(claims.auth_time_at()));
    line("Expires", timestamp(claims.expires_at()));
    line("Scopes", render_scopes(&claims.scopes));
    line("Subject", claims.sub.clone());
    line("Identity provider", optional(claims.idp.as_deref()));
    line("Issued by", optional(claims.iss.as_deref()));

    for (name, value) in claims.extra_claims() {
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        line(name, value);
    }
    out
}

/// Table of the usable keys in `set`.
pub fn render_keys(set: &KeySet) -> String {
    let mut out = format!(
        "{} {} ({} keys, fetched {})\n",
        label("Provider"),
        set.provider(),
        set.len(),
        set.fetched_at().to_rfc3339()
    );
    if set.is_empty() {
        out.push_str(&format!("  {}\n", "no usable signing keys".yellow()));
        return out;
    }
    for key in set.keys() {
        let alg = key
            .algorithm()
            .map(|alg| format!("{alg:?}"))
            .unwrap_or_else(|| "any".into());
        out.push_str(&format!(
            "  {}  {:?}  {}\n",
            key.kid().bold(),
            key.family(),
            alg
        ));
    }
    out
}
