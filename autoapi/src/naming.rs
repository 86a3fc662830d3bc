//! Identifier case conversions.
//!
//! Every function is total: empty input gives empty output. Absent names are
//! modelled as `Option<&str>` by callers and mapped with `Option::map`.

use once_cell::sync::Lazy;
use regex::Regex;

static PLAIN_IDENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,127}$").expect("valid identifier regex"));

/// `user_info` -> `userInfo`. Existing upper-case letters after the first are kept.
/// A segment starting with a digit keeps its underscore (`address_1`), so it
/// cannot merge with `address1`.
pub fn to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for ch in name.chars() {
        if ch == '_' || ch == '-' || ch == ' ' {
            upper_next = !out.is_empty();
            continue;
        }
        if upper_next && ch.is_ascii_digit() {
            out.push('_');
            out.push(ch);
            upper_next = false;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else if out.is_empty() {
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// `user_info` -> `UserInfo`.
pub fn to_pascal(name: &str) -> String {
    capitalize(&to_camel(name))
}

/// `userInfo` -> `user_info`. Separators are normalised to a single underscore.
pub fn to_snake(name: &str) -> String {
    separate(name, '_')
}

/// `userInfo` or `user_info` -> `user-info`.
pub fn to_kebab(name: &str) -> String {
    separate(name, '-')
}

fn separate(name: &str, sep: char) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for ch in name.chars() {
        if ch == '_' || ch == '-' || ch == ' ' {
            if !out.is_empty() && !out.ends_with(sep) {
                out.push(sep);
            }
        } else if ch.is_uppercase() {
            if !out.is_empty() && !out.ends_with(sep) {
                out.push(sep);
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    while out.ends_with(sep) {
        out.pop();
    }
    out
}

/// Resource segment used in REST paths: `user_info` -> `user-info`.
pub fn to_resource(table: &str) -> String {
    to_kebab(&to_camel(table))
}

/// Full REST path for a table under `prefix`: (`/api`, `user_info`) -> `/api/user-info`.
pub fn to_api_path(prefix: &str, table: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    format!("{}/{}", prefix, to_resource(table))
}

/// GraphQL object type name for a table.
pub fn to_type_name(table: &str) -> String {
    to_pascal(table)
}

/// GraphQL/JSON field name for a column.
pub fn to_field_name(column: &str) -> String {
    to_camel(column)
}

pub fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn uncapitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// True for names that may be matched against catalog identifiers.
/// Anything else coming from a caller is treated as hostile.
pub fn is_plain_identifier(name: &str) -> bool {
    PLAIN_IDENT.is_match(name)
}
