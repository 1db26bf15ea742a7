// ABOUTME: Scope normalization and comparison helpers
// ABOUTME: Scopes are compared as sets; the canonical string form is sorted, de-duplicated, space-joined

use std::collections::BTreeSet;

/// Split every item on commas and whitespace, de-duplicate, sort, and join with spaces.
///
/// `normalize_scope(["b,a,a"])` yields `"a b"`; an empty input yields `""`.
pub fn normalize_scope<I, S>(scopes: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut set = BTreeSet::new();
    for item in scopes {
        set.extend(split_scope(item.as_ref()));
    }
    set.into_iter().collect::<Vec<_>>().join(" ")
}

/// Parse a scope string into a set
pub fn scope_set(scope: &str) -> BTreeSet<String> {
    split_scope(scope).collect()
}

/// True when every requested scope was granted
pub fn scope_satisfied(requested: &str, granted: &str) -> bool {
    scope_set(requested).is_subset(&scope_set(granted))
}

fn split_scope(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(vec!["b,a,a"], "a b")]
    #[case(vec!["user-read-email playlist-read-private"], "playlist-read-private user-read-email")]
    #[case(vec!["a", "c,b", " a "], "a b c")]
    #[case(vec![",, ,"], "")]
    fn test_normalize_scope(#[case] input: Vec<&str>, #[case] expected: &str) {
        assert_eq!(normalize_scope(input), expected);
    }

    #[test]
    fn test_normalize_empty_list() {
        assert_eq!(normalize_scope(Vec::<String>::new()), "");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize_scope(["c b,a"]);
        assert_eq!(normalize_scope([once.as_str()]), once);
    }

    #[test]
    fn test_scope_satisfied() {
        assert!(scope_satisfied("a b", "b a c"));
        assert!(scope_satisfied("", "anything"));
        assert!(scope_satisfied("", ""));
        assert!(!scope_satisfied("a b", "a"));
        assert!(!scope_satisfied("a", ""));
    }
}
