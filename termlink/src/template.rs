use std::collections::HashMap;

use crate::error::{ManagerError, Result};

pub const VARIABLE_DELIMITER: char = '@';
pub const SENSOR_DELIMITER: char = '&';

/// The two placeholder namespaces a command string can reference.
///
/// Variables are supplied by the caller (`@{name}`), sensor values are
/// polled from the catalog (`&{name}`). The namespaces never interact: a
/// substitution pass over one leaves the other untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Variable,
    Sensor,
}

impl Namespace {
    fn delimiter(self) -> char {
        match self {
            Namespace::Variable => VARIABLE_DELIMITER,
            Namespace::Sensor => SENSOR_DELIMITER,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Namespace::Variable => "variable",
            Namespace::Sensor => "sensor",
        }
    }
}

fn is_identifier_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_identifier_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

/// Parse `text` starting right after `<delimiter>{` and return the
/// identifier if the brace closes on a valid one.
fn parse_identifier(text: &str) -> Option<(&str, usize)> {
    let mut chars = text.char_indices();
    match chars.next() {
        Some((_, ch)) if is_identifier_start(ch) => {}
        _ => return None,
    }

    for (index, ch) in chars {
        if ch == '}' {
            return Some((&text[..index], index + 1));
        }
        if !is_identifier_char(ch) {
            return None;
        }
    }

    None
}

/// Ordered unique identifiers of one namespace found in `template`.
///
/// Anything that is not a well-formed placeholder (`@{`, `@{1x}`, an
/// unclosed brace) is treated as literal text.
pub fn identifiers(template: &str, namespace: Namespace) -> Vec<String> {
    let delimiter = namespace.delimiter();
    let mut found: Vec<String> = Vec::new();
    let mut rest = template;

    while let Some(position) = rest.find(delimiter) {
        rest = &rest[position + delimiter.len_utf8()..];

        if let Some(tail) = rest.strip_prefix('{') {
            if let Some((identifier, consumed)) = parse_identifier(tail) {
                if !found.iter().any(|known| known == identifier) {
                    found.push(identifier.to_string());
                }
                rest = &tail[consumed..];
            }
        }
    }

    found
}

/// Replace every placeholder of one namespace with its mapped value.
///
/// Placeholders of the other namespace pass through untouched. A
/// placeholder without a mapping fails the whole substitution.
pub fn substitute(
    template: &str,
    namespace: Namespace,
    mapping: &HashMap<String, String>,
) -> Result<String> {
    let delimiter = namespace.delimiter();
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(position) = rest.find(delimiter) {
        output.push_str(&rest[..position]);
        rest = &rest[position..];

        let after = &rest[delimiter.len_utf8()..];
        if let Some(tail) = after.strip_prefix('{') {
            if let Some((identifier, consumed)) = parse_identifier(tail) {
                let value = mapping.get(identifier).ok_or_else(|| {
                    ManagerError::Command(format!(
                        "unknown {} '{}'",
                        namespace.label(),
                        identifier
                    ))
                })?;
                output.push_str(value);
                rest = &tail[consumed..];
                continue;
            }
        }

        output.push(delimiter);
        rest = after;
    }

    output.push_str(rest);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn test_identifiers_ordered_unique() {
        let template = "echo @{first} @{second} @{first} &{third}";
        assert_eq!(
            identifiers(template, Namespace::Variable),
            vec!["first".to_string(), "second".to_string()]
        );
        assert_eq!(
            identifiers(template, Namespace::Sensor),
            vec!["third".to_string()]
        );
    }

    #[test]
    fn test_identifiers_ignores_malformed() {
        let template = "a@{} b@{1x} c@{open d@x e@{ok}";
        assert_eq!(
            identifiers(template, Namespace::Variable),
            vec!["ok".to_string()]
        );
    }

    #[test]
    fn test_substitute_variables() {
        let result = substitute(
            "echo @{msg} twice: @{msg}",
            Namespace::Variable,
            &mapping(&[("msg", "hi")]),
        )
        .unwrap();
        assert_eq!(result, "echo hi twice: hi");
    }

    #[test]
    fn test_substitute_leaves_other_namespace() {
        let result = substitute(
            "cat /sys/class/net/&{interface}/address @{flag}",
            Namespace::Variable,
            &mapping(&[("flag", "-v")]),
        )
        .unwrap();
        assert_eq!(result, "cat /sys/class/net/&{interface}/address -v");
    }

    #[test]
    fn test_substitute_missing_key() {
        let error = substitute("echo @{msg}", Namespace::Variable, &mapping(&[])).unwrap_err();
        assert!(matches!(error, ManagerError::Command(_)));
    }

    #[test]
    fn test_substitute_literal_text_untouched() {
        let template = "awk '{print $1}' && echo 100@{}%";
        let result = substitute(template, Namespace::Variable, &mapping(&[])).unwrap();
        assert_eq!(result, template);
    }
}
