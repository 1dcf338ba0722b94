//! Placeholder substitution for prompt segments.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::BTreeMap;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z][A-Za-z0-9]*)\s*\}\}").expect("Invalid placeholder regex")
});

/// Replace well-formed `{{ name }}` placeholders with their bindings.
///
/// A placeholder name is a letter followed by letters or digits, with
/// optional whitespace inside the braces. Placeholders without a binding and
/// anything that is not a well-formed placeholder are left verbatim.
pub fn render(text: &str, variables: &BTreeMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &Captures| match variables.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Literal `{{key}}` substitution for every binding, no whitespace tolerance
/// and no identifier rules.
pub fn render_naive(text: &str, variables: &BTreeMap<String, String>) -> String {
    variables.iter().fold(text.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{{{}}}}}", key), value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_substitutes_known_placeholders() {
        let out = render(
            "Hello {{name}}, you are {{ age }} years old",
            &vars(&[("name", "Ada"), ("age", "36")]),
        );
        assert_eq!(out, "Hello Ada, you are 36 years old");
    }

    #[test]
    fn test_render_leaves_unbound_and_malformed_literal() {
        let v = vars(&[("name", "Ada"), ("first_name", "x"), ("1st", "y")]);
        assert_eq!(render("Hi {{missing}}", &v), "Hi {{missing}}");
        assert_eq!(render("{{first_name}}", &v), "{{first_name}}");
        assert_eq!(render("{{1st}}", &v), "{{1st}}");
        assert_eq!(render("{name}", &v), "{name}");
    }

    #[test]
    fn test_render_does_not_rescan_substituted_values() {
        let v = vars(&[("a", "{{b}}"), ("b", "nope")]);
        assert_eq!(render("{{a}}", &v), "{{b}}");
    }

    #[test]
    fn test_render_naive_is_literal() {
        let v = vars(&[("first_name", "Ada"), ("name", "Lovelace")]);
        assert_eq!(
            render_naive("{{first_name}} {{name}} {{ name }}", &v),
            "Ada Lovelace {{ name }}"
        );
    }
}
