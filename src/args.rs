//! Turning user supplied tokens and keyword options into argv entries.

use glob::MatchOptions;

/// Value of a keyword option.
///
/// `On`/`Off` become `--name`/`--no-name`, anything else is rendered as
/// `--name=value` (or `-n value` for single character names).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagValue {
    On,
    Off,
    Value(String),
}

impl From<bool> for FlagValue {
    fn from(b: bool) -> Self {
        if b { FlagValue::On } else { FlagValue::Off }
    }
}

impl From<&str> for FlagValue {
    fn from(s: &str) -> Self {
        FlagValue::Value(s.to_string())
    }
}

impl From<String> for FlagValue {
    fn from(s: String) -> Self {
        FlagValue::Value(s)
    }
}

macro_rules! flag_value_from_display {
    ($($t:ty),*) => {
        $(impl From<$t> for FlagValue {
            fn from(v: $t) -> Self {
                FlagValue::Value(v.to_string())
            }
        })*
    };
}

flag_value_from_display!(i32, i64, u32, u64, usize, f32, f64, char);

/// Expand a positional token against the filesystem.
///
/// Tokens without wildcard characters are returned untouched. A pattern
/// with at least one match is replaced by its sorted matches; a pattern
/// matching nothing (or an invalid pattern) is kept literally so that
/// not-yet-existing file names can still be passed.
pub fn expand_token(token: &str) -> Vec<String> {
    if !token.contains(['*', '?', '[']) {
        return vec![token.to_string()];
    }
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: false,
        require_literal_leading_dot: true,
    };
    let mut matches: Vec<String> = match glob::glob_with(token, options) {
        Ok(paths) => paths
            .filter_map(|p| p.ok())
            .map(|p| p.to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    if matches.is_empty() {
        return vec![token.to_string()];
    }
    matches.sort();
    matches
}

/// Render a keyword option as argv tokens.
///
/// Underscores in `name` become hyphens.
pub fn flag_tokens(name: &str, value: FlagValue) -> Vec<String> {
    let name = name.replace('_', "-");
    let short = name.chars().count() == 1;
    match value {
        FlagValue::On if short => vec![format!("-{name}")],
        FlagValue::On => vec![format!("--{name}")],
        FlagValue::Off => vec![format!("--no-{name}")],
        FlagValue::Value(v) if short => vec![format!("-{name}"), v],
        FlagValue::Value(v) => vec![format!("--{name}={v}")],
    }
}

/// Render a switch: `-x` for one character, `--name` otherwise.
pub fn switch_token(name: &str) -> String {
    if name.chars().count() == 1 {
        format!("-{name}")
    } else {
        format!("--{name}")
    }
}
