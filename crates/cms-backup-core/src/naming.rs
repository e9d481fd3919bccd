use serde_json::{Map, Value};

/// `camelCase` / `PascalCase` to `snake_case`. Acronym runs stay together,
/// so `lastLoginIP` becomes `last_login_ip` and `HTMLBody` becomes `html_body`.
#[must_use]
pub fn camel_to_snake(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (index, &ch) in chars.iter().enumerate() {
        if ch == '-' || ch == ' ' {
            push_separator(&mut out);
            continue;
        }
        if ch.is_uppercase() {
            let prev = index.checked_sub(1).map(|prev| chars[prev]);
            let next = chars.get(index + 1).copied();
            let after_lower = prev.is_some_and(|prev| prev.is_lowercase() || prev.is_ascii_digit());
            let ends_acronym =
                prev.is_some_and(char::is_uppercase) && next.is_some_and(char::is_lowercase);
            if after_lower || ends_acronym {
                push_separator(&mut out);
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

fn push_separator(out: &mut String) {
    if !out.is_empty() && !out.ends_with('_') {
        out.push('_');
    }
}

/// Rewrite every object key in `value` to snake_case, recursively.
#[must_use]
pub fn snake_case_keys(value: Value) -> Value {
    match value {
        Value::Object(object) => Value::Object(
            object
                .into_iter()
                .map(|(key, nested)| (camel_to_snake(&key), snake_case_keys(nested)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(snake_case_keys).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn converts_common_field_spellings() {
        assert_eq!(camel_to_snake("createdAt"), "created_at");
        assert_eq!(camel_to_snake("allowComment"), "allow_comment");
        assert_eq!(camel_to_snake("lastLoginIP"), "last_login_ip");
        assert_eq!(camel_to_snake("HTMLBody"), "html_body");
        assert_eq!(camel_to_snake("already_snake"), "already_snake");
        assert_eq!(camel_to_snake("image2Url"), "image2_url");
        assert_eq!(camel_to_snake("_id"), "_id");
    }

    #[test]
    fn nested_keys_are_rewritten() {
        let value = json!({
            "enableComment": true,
            "smtpOptions": {"userName": "a"},
            "list": [{"itemKey": 1}]
        });
        assert_eq!(
            snake_case_keys(value),
            json!({
                "enable_comment": true,
                "smtp_options": {"user_name": "a"},
                "list": [{"item_key": 1}]
            })
        );
    }

    proptest! {
        #[test]
        fn snake_case_names_are_left_alone(name in "[a-z_][a-z0-9_]{0,24}") {
            prop_assert_eq!(camel_to_snake(&name), name);
        }

        #[test]
        fn conversion_is_idempotent(name in "[a-zA-Z][a-zA-Z0-9]{0,24}") {
            let once = camel_to_snake(&name);
            prop_assert_eq!(camel_to_snake(&once), once);
        }
    }
}
