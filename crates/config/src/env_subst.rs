/// Expand `${VAR}` and `${VAR:-fallback}` placeholders in raw config text.
///
/// A placeholder whose variable is unset and has no fallback is kept
/// verbatim so the parse error (or the literal value) points at it.
pub fn substitute_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated: emit the remainder untouched.
            out.push_str(&rest[start..]);
            return out;
        };
        let body = &after[..end];
        out.push_str(&expand_placeholder(body));
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

fn expand_placeholder(body: &str) -> String {
    let (name, fallback) = match body.split_once(":-") {
        Some((name, fallback)) => (name, Some(fallback)),
        None => (body, None),
    };
    if name.is_empty() {
        return format!("${{{body}}}");
    }
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val,
        _ => match fallback {
            Some(fallback) => fallback.to_string(),
            None => format!("${{{body}}}"),
        },
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_var() {
        unsafe { std::env::set_var("SWITCHBOARD_SUBST_KNOWN", "hello") };
        assert_eq!(substitute_env("key=${SWITCHBOARD_SUBST_KNOWN}"), "key=hello");
        unsafe { std::env::remove_var("SWITCHBOARD_SUBST_KNOWN") };
    }

    #[test]
    fn leaves_unknown_var() {
        assert_eq!(
            substitute_env("${SWITCHBOARD_NONEXISTENT_XYZ}"),
            "${SWITCHBOARD_NONEXISTENT_XYZ}"
        );
    }

    #[test]
    fn falls_back_when_unset() {
        assert_eq!(
            substitute_env("port = ${SWITCHBOARD_NONEXISTENT_PORT:-8080}"),
            "port = 8080"
        );
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        assert_eq!(substitute_env("a ${OOPS"), "a ${OOPS");
    }

    #[test]
    fn no_placeholders() {
        assert_eq!(substitute_env("plain text"), "plain text");
    }
}
