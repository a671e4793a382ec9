use serde_json::Value;


/// Extracts a value from a JSON document by path expression.
///
/// Path grammar: `$` is the document root, `.field` descends into an object
/// member, `[n]` indexes into an array (zero-based). Segments chain freely,
/// e.g. `$.sensors[0].temp`. An empty path or a bare `$` returns the root
/// unchanged.
///
/// A missing key, an out-of-range index, a type mismatch (indexing a scalar,
/// member access on an array) or a malformed path all yield `None` — never an
/// error.
pub fn extract_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return Some(doc);
    }

    let mut rest = path.strip_prefix('$')?;
    let mut current = doc;

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            let end = after
                .find(|c| c == '.' || c == '[')
                .unwrap_or(after.len());
            let field = &after[..end];
            if field.is_empty() {
                return None;
            }
            current = current.as_object()?.get(field)?;
            rest = &after[end..];
        } else if let Some(after) = rest.strip_prefix('[') {
            let close = after.find(']')?;
            let index: usize = after[..close].trim().parse().ok()?;
            current = current.as_array()?.get(index)?;
            rest = &after[close + 1..];
        } else {
            return None;
        }
    }

    Some(current)
}

/// Matches a payload against configured true/false markers.
///
/// An empty marker counts as unset. The rules are asymmetric so a device
/// publishing a single "available" sentinel works alongside devices that need
/// strict two-value state:
///
/// - both markers set: exact match required, `None` when neither matches
/// - only the true marker set: `Some(payload == true_value)`
/// - only the false marker set: `Some(payload != false_value)`
/// - neither set: always `None`
pub fn parse_state(payload: &str, true_value: &str, false_value: &str) -> Option<bool> {
    match (true_value.is_empty(), false_value.is_empty()) {
        (false, false) => {
            if payload == true_value {
                Some(true)
            } else if payload == false_value {
                Some(false)
            } else {
                None
            }
        }
        (false, true) => Some(payload == true_value),
        (true, false) => Some(payload != false_value),
        (true, true) => None,
    }
}

/// Renders an extracted JSON value as wire text.
///
/// Strings come back unquoted, scalars via their display form, compound
/// values as compact JSON. Entities compare text the way the broker delivers
/// it, so `"ON"` in a JSON document must equal the bare payload `ON`.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
