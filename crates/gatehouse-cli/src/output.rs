//! Output switching: `--json` emits one JSON value on stdout, otherwise a
//! human-readable rendering of the same data.

use serde_json::Value;

/// Emit either the JSON value or the human rendering of it.
pub(crate) fn emit(json: bool, value: &Value, human: impl FnOnce(&Value)) {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
        );
    } else {
        human(value);
    }
}
