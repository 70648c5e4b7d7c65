// Name rules are enforced before anything touches the store, so a bad name
// fails fast at the API instead of producing an unaddressable key.
//
// The shapes follow DNS label conventions (RFC 1123/1035) as used by
// Kubernetes' apimachinery validation.

use std::sync::LazyLock;

use regex::Regex;

const DNS_LABEL_FMT: &str = "[a-z0-9]([-a-z0-9]*[a-z0-9])?";
const DNS_LABEL_ERROR_MSG: &str = "a name must consist of lower case alphanumeric characters or '-', and must start and end with an alphanumeric character";

// Object names share the subdomain length budget (253) even though the
// character set is the stricter label one.
const OBJECT_NAME_MAX_LENGTH: usize = 253;
const NAMESPACE_NAME_MAX_LENGTH: usize = 63;

static DNS_LABEL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{DNS_LABEL_FMT}$")).expect("failed to compile DNS label regex")
});

fn is_dns_label(value: &str, max_length: usize) -> Result<(), Vec<String>> {
    let mut errors = vec![];

    if value.len() > max_length {
        errors.push(format!("must be no more than {max_length} characters"));
    }

    if !DNS_LABEL_REGEX.is_match(value) {
        let examples = ["my-job", "cluster-1"]
            .map(|example| format!("'{example}'"))
            .join(" or ");
        errors.push(format!(
            "{DNS_LABEL_ERROR_MSG} (e.g. {examples}, regex used for validation is '{DNS_LABEL_FMT}')"
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validates an object name: lower case alphanumerics and dashes, starting
/// and ending alphanumeric, at most 253 characters.
pub fn validate_object_name(name: &str) -> Result<(), Vec<String>> {
    is_dns_label(name, OBJECT_NAME_MAX_LENGTH)
}

/// Validates a namespace name. Same character rules as object names but with
/// the shorter DNS label length budget.
pub fn validate_namespace_name(name: &str) -> Result<(), Vec<String>> {
    is_dns_label(name, NAMESPACE_NAME_MAX_LENGTH)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("")]
    #[case("A")]
    #[case("aBc")]
    #[case("-")]
    #[case("a-")]
    #[case("-a")]
    #[case("a_b")]
    #[case("a.b")]
    #[case("a b")]
    #[case("a@b")]
    #[case(&"a".repeat(254))]
    fn bad_object_names(#[case] value: &str) {
        assert!(validate_object_name(value).is_err());
    }

    #[rstest]
    #[case("a")]
    #[case("a1")]
    #[case("0")]
    #[case("my-job")]
    #[case("a--1--2--b")]
    #[case("1-a")]
    #[case(&"a".repeat(253))]
    fn good_object_names(#[case] value: &str) {
        assert!(validate_object_name(value).is_ok());
    }

    #[rstest]
    #[case("default")]
    #[case("ns-1")]
    #[case(&"n".repeat(63))]
    fn good_namespace_names(#[case] value: &str) {
        assert!(validate_namespace_name(value).is_ok());
    }

    #[rstest]
    #[case("")]
    #[case("Default")]
    #[case(&"n".repeat(64))]
    fn bad_namespace_names(#[case] value: &str) {
        assert!(validate_namespace_name(value).is_err());
    }

    #[test]
    fn length_violations_and_shape_violations_both_reported() {
        let long_and_bad = format!("{}_", "A".repeat(260));
        let errors = validate_object_name(&long_and_bad).expect_err("name must be rejected");
        assert_eq!(errors.len(), 2);
    }
}
