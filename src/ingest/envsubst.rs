use regex::{Captures, Regex};
use std::sync::OnceLock;

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("variable pattern should be valid")
    })
}

/// Shell-style variable expansion over raw document text, performed before
/// decoding. `${VAR}` expands to the variable's value or the empty string;
/// `${VAR:-default}` falls back to `default` when the variable is unset or
/// empty. Anything that is not a well-formed expression is left untouched.
pub fn expand<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    variable_pattern()
        .replace_all(input, |caps: &Captures<'_>| {
            let value = lookup(&caps[1]).unwrap_or_default();
            match caps.get(2) {
                Some(default) if value.is_empty() => default.as_str().to_string(),
                _ => value,
            }
        })
        .into_owned()
}

/// Expansion against the process environment.
pub fn expand_env(input: &str) -> String {
    expand(input, |name| std::env::var(name).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[rstest]
    #[case::simple("ns: ${NS}", &[("NS", "team-a")], "ns: team-a")]
    #[case::unset_is_empty("ns: ${NS}", &[], "ns: ")]
    #[case::default_applies("ns: ${NS:-fallback}", &[], "ns: fallback")]
    #[case::default_ignored("ns: ${NS:-fallback}", &[("NS", "team-a")], "ns: team-a")]
    #[case::empty_uses_default("ns: ${NS:-fallback}", &[("NS", "")], "ns: fallback")]
    #[case::no_expression("ns: $NS", &[("NS", "team-a")], "ns: $NS")]
    #[case::multiple("${A}-${B:-b}", &[("A", "a")], "a-b")]
    fn test_expand(
        #[case] input: &str,
        #[case] env: &[(&str, &str)],
        #[case] expected: &str,
    ) {
        let env = vars(env);
        let result = expand(input, |name| env.get(name).cloned());
        assert_eq!(result, expected);
    }
}
