use std::collections::HashMap;

/// Parses `key=value` pairs separated by `separator`, as found in
/// `Proxy-Authenticate` challenges.
///
/// Keys are trimmed and lowercased. Values may be quoted; separators inside
/// quotes do not split, backslash escapes are kept verbatim and the
/// surrounding quotes are removed. A key without `=` maps to an empty value.
pub fn parse_parameters(input: &str, separator: char) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input;
    loop {
        let key_end = rest
            .find(|c| c == '=' || c == separator)
            .unwrap_or(rest.len());
        let key = rest[..key_end].trim().to_ascii_lowercase();
        rest = &rest[key_end..];

        let mut value = String::new();
        if let Some(after_eq) = rest.strip_prefix('=') {
            let (token, remaining) = take_value(after_eq, separator);
            value = unquote(token.trim()).to_string();
            rest = remaining;
        }
        if !key.is_empty() {
            params.insert(key, value);
        }

        match rest.strip_prefix(separator) {
            Some(next) => rest = next,
            None => break,
        }
    }
    params
}

fn take_value(input: &str, separator: char) -> (&str, &str) {
    let mut quoted = false;
    let mut escaped = false;
    for (idx, ch) in input.char_indices() {
        if !escaped && !quoted && ch == separator {
            return (&input[..idx], &input[idx..]);
        }
        if !escaped && ch == '"' {
            quoted = !quoted;
        }
        escaped = !escaped && ch == '\\';
    }
    (input, "")
}

fn unquote(token: &str) -> &str {
    if token.len() >= 2 && token.starts_with('"') && token.ends_with('"') {
        &token[1..token.len() - 1]
    } else {
        token
    }
}
