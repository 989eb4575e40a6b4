//! Environment variable interpolation for config files.
//!
//! Supported syntax:
//! - `$VAR` or `${VAR}`: substitute, error if unset
//! - `${VAR:-default}`: use default if VAR is unset or empty
//! - `${VAR-default}`: use default only if VAR is unset
//! - `$$`: literal `$`

use regex::{Captures, Regex};
use std::sync::LazyLock;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$                           # escaped $
        |
        \$\{
            ([A-Za-z_][A-Za-z0-9_]*)   # 1: name
            (?:
                (:?-)                  # 2: default operator
                ([^}]*)                # 3: default value
            )?
        \}
        |
        \$([A-Za-z_][A-Za-z0-9_]*)     # 4: bare name
        ",
    )
    .expect("Invalid regex pattern")
});

/// Interpolated text plus every problem found along the way.
#[derive(Debug)]
pub struct InterpolationResult {
    pub text: String,
    pub errors: Vec<String>,
}

impl InterpolationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Interpolate against the process environment.
pub fn interpolate(input: &str) -> InterpolationResult {
    interpolate_with(input, |name| std::env::var(name).ok())
}

/// Interpolate using `lookup` to resolve variable names.
///
/// All errors are accumulated so every missing variable is reported at once.
pub fn interpolate_with<F>(input: &str, lookup: F) -> InterpolationResult
where
    F: Fn(&str) -> Option<String>,
{
    let mut errors = Vec::new();

    let text = ENV_VAR_PATTERN
        .replace_all(input, |caps: &Captures| {
            let whole = &caps[0];
            if whole == "$$" {
                return "$".to_string();
            }

            let Some(name) = caps.get(1).or_else(|| caps.get(4)).map(|m| m.as_str()) else {
                return whole.to_string();
            };
            let operator = caps.get(2).map(|m| m.as_str());
            let default = caps.get(3).map(|m| m.as_str());

            match (lookup(name), default) {
                (Some(value), _) if value.contains(['\n', '\r']) => {
                    errors.push(format!(
                        "environment variable '{name}' contains newlines, which is not allowed"
                    ));
                    whole.to_string()
                }
                (Some(value), Some(default)) if value.is_empty() && operator == Some(":-") => {
                    default.to_string()
                }
                (Some(value), _) => value,
                (None, Some(default)) => default.to_string(),
                (None, None) => {
                    errors.push(format!("environment variable '{name}' is not set"));
                    whole.to_string()
                }
            }
        })
        .into_owned();

    InterpolationResult { text, errors }
}
