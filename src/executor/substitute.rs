//! Statement template substitution.
//!
//! Two placeholder shapes exist: `{{ env.NAME }}`, expanded first against the
//! process environment, and `{{ inputs.NAME }}`, spliced afterwards with the
//! rendering of a validated input.
//!
//! Splicing is textual. Relational rendering quotes and escapes strings, but
//! it is not a substitute for driver-side parameters and must not be relied on
//! to stop SQL injection.

use super::validate::ValidatedInputs;
use crate::error::GatewayError;
use crate::model::ConnectorKind;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static ENV_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*env\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid env regex")
});

static INPUT_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*inputs\.([A-Za-z0-9_-]+)\s*\}\}").expect("valid inputs regex")
});

/// How input values are written into a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// SQL literals: quoted strings, `NULL`, `true`/`false`.
    Relational,
    /// Bare stringified values.
    Raw,
}

impl RenderMode {
    /// The mode is fixed by the store the adapter points at.
    pub fn for_kind(kind: ConnectorKind) -> Self {
        if kind.is_relational() {
            RenderMode::Relational
        } else {
            RenderMode::Raw
        }
    }
}

/// Expand `{{ env.NAME }}` against the process environment.
pub fn expand_env(template: &str) -> Result<String, GatewayError> {
    expand_env_with(template, |name| std::env::var(name).ok())
}

/// Expand `{{ env.NAME }}` using an explicit lookup.
pub fn expand_env_with<F>(template: &str, lookup: F) -> Result<String, GatewayError>
where
    F: Fn(&str) -> Option<String>,
{
    replace_all(&ENV_PLACEHOLDER, template, |caps| {
        let name = &caps[1];
        lookup(name).ok_or_else(|| {
            GatewayError::substitution(format!("environment variable '{name}' is not set"))
        })
    })
}

/// Splice validated inputs into an env-expanded statement.
pub fn splice(
    template: &str,
    inputs: &ValidatedInputs,
    mode: RenderMode,
) -> Result<String, GatewayError> {
    replace_all(&INPUT_PLACEHOLDER, template, |caps| {
        let name = &caps[1];
        let value = inputs.get(name).ok_or_else(|| {
            GatewayError::substitution(format!("statement references undeclared input '{name}'"))
        })?;
        Ok(match mode {
            RenderMode::Relational => value.render_relational(),
            RenderMode::Raw => value.render_raw(),
        })
    })
}

/// Fallible single-pass regex replacement.
fn replace_all<F>(re: &Regex, text: &str, mut render: F) -> Result<String, GatewayError>
where
    F: FnMut(&Captures<'_>) -> Result<String, GatewayError>,
{
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in re.captures_iter(text) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.push_str(&text[last..whole.start()]);
        out.push_str(&render(&caps)?);
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}
