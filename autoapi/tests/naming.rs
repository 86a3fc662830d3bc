use autoapi::naming::{is_plain_identifier, to_api_path, to_camel, to_kebab, to_pascal, to_snake, to_type_name};
use proptest::prelude::*;

const SNAKE: &str = "[a-z][a-z0-9]{0,6}(_[a-z0-9][a-z0-9]{0,6}){0,4}";

proptest! {
    #[test]
    fn camel_case_round_trips(name in SNAKE) {
        prop_assert_eq!(to_snake(&to_camel(&name)), name.clone());
        prop_assert_eq!(to_snake(&to_pascal(&name)), name);
    }

    #[test]
    fn derived_names_are_identifiers(name in SNAKE) {
        prop_assert!(is_plain_identifier(&to_camel(&name)));
        prop_assert!(is_plain_identifier(&to_type_name(&name)));
        prop_assert_eq!(to_kebab(&name), name.replace('_', "-"));
    }

    #[test]
    fn api_paths_sit_under_prefix(name in SNAKE, slash in any::<bool>()) {
        let prefix = if slash { "/api/" } else { "/api" };
        let path = to_api_path(prefix, &name);
        prop_assert!(path.starts_with("/api/"));
        prop_assert!(!path.contains("//"));
        prop_assert!(!path.contains('_'));
    }
}

#[test]
fn hostile_names_are_not_identifiers() {
    for name in ["x; DROP TABLE users", "a b", "\"quoted\"", "semi;", "1st", "tab\tname"] {
        assert!(!is_plain_identifier(name), "{name} should be rejected");
    }
}
