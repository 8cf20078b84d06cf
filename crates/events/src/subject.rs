//! Dot-separated subjects with `*` (one token) and `>` (one or more trailing
//! tokens) wildcards in subscription filters.

use crate::bus::BusError;

fn tokens_ok(subject: &str) -> bool {
    !subject.is_empty()
        && subject
            .split('.')
            .all(|t| !t.is_empty() && !t.chars().any(char::is_whitespace))
}

/// Publish subjects must be concrete.
pub fn validate_publish_subject(subject: &str) -> Result<(), BusError> {
    if !tokens_ok(subject) {
        return Err(BusError::Fatal(format!("malformed subject '{subject}'")));
    }
    if subject.split('.').any(|t| t == "*" || t == ">") {
        return Err(BusError::Fatal(format!("wildcard in publish subject '{subject}'")));
    }
    Ok(())
}

pub fn validate_filter(filter: &str) -> Result<(), BusError> {
    if !tokens_ok(filter) {
        return Err(BusError::Fatal(format!("malformed filter '{filter}'")));
    }
    let tokens: Vec<&str> = filter.split('.').collect();
    if let Some(pos) = tokens.iter().position(|t| *t == ">") {
        if pos != tokens.len() - 1 {
            return Err(BusError::Fatal(format!("'>' must be the last token in '{filter}'")));
        }
    }
    Ok(())
}

/// Whether `subject` matches subscription `filter`.
pub fn matches(filter: &str, subject: &str) -> bool {
    let mut f = filter.split('.');
    let mut s = subject.split('.');
    loop {
        match (f.next(), s.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(ft), Some(st)) if ft == st => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_wildcard_matching() {
        assert!(matches("image.generate.request", "image.generate.request"));
        assert!(matches("image.*.request", "image.generate.request"));
        assert!(matches("deadletter.>", "deadletter.image.generate.request"));
        assert!(!matches("deadletter.>", "deadletter"));
        assert!(!matches("image.*", "image.generate.request"));
        assert!(!matches("image.generate", "image.generate.request"));
    }

    #[test]
    fn publish_rejects_wildcards_and_empty_tokens() {
        assert!(validate_publish_subject("a.b").is_ok());
        assert!(matches!(validate_publish_subject("a.*"), Err(BusError::Fatal(_))));
        assert!(validate_publish_subject("a..b").is_err());
        assert!(validate_publish_subject("").is_err());
    }

    #[test]
    fn tail_wildcard_must_be_last() {
        assert!(validate_filter("a.>").is_ok());
        assert!(validate_filter("a.>.b").is_err());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn concrete_subject() -> impl Strategy<Value = Vec<String>> {
            proptest::collection::vec("[a-z][a-z0-9-]{0,6}", 1..6)
        }

        proptest! {
            /// A concrete subject is a valid filter that matches only itself.
            #[test]
            fn concrete_filter_matches_exactly_itself(
                tokens in concrete_subject(),
                other in concrete_subject(),
            ) {
                let subject = tokens.join(".");
                prop_assert!(validate_publish_subject(&subject).is_ok());
                prop_assert!(validate_filter(&subject).is_ok());
                prop_assert!(matches(&subject, &subject));
                let other = other.join(".");
                prop_assert_eq!(matches(&subject, &other), subject == other);
            }

            /// Replacing any single token with `*` still matches the subject,
            /// and the filter rejects subjects of a different depth.
            #[test]
            fn single_token_wildcard_keeps_depth(
                tokens in concrete_subject(),
                pick in any::<prop::sample::Index>(),
                extra in "[a-z]{1,4}",
            ) {
                let mut filter = tokens.clone();
                let at = pick.index(filter.len());
                filter[at] = "*".to_string();
                let filter = filter.join(".");
                prop_assert!(validate_filter(&filter).is_ok());
                prop_assert!(matches(&filter, &tokens.join(".")));
                let longer = format!("{}.{extra}", tokens.join("."));
                prop_assert!(!matches(&filter, &longer));
            }

            /// `prefix.>` matches every strictly longer subject under the prefix
            /// and never the prefix alone.
            #[test]
            fn tail_wildcard_needs_at_least_one_more_token(
                prefix in concrete_subject(),
                rest in concrete_subject(),
            ) {
                let prefix = prefix.join(".");
                let filter = format!("{prefix}.>");
                prop_assert!(validate_filter(&filter).is_ok());
                let subject = format!("{prefix}.{}", rest.join("."));
                prop_assert!(matches(&filter, &subject));
                prop_assert!(!matches(&filter, &prefix));
            }
        }
    }
}
