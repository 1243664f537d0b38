use serde::Serialize;
use serde::de::DeserializeOwned;

/// Convert between two serde representations of the same JSON document.
pub fn convert<T: Serialize, U: DeserializeOwned>(t: &T) -> Result<U, serde_json::Error> {
	serde_json::from_value(serde_json::to_value(t)?)
}

/// Extract a textual rendering of an arbitrary JSON value, for round-tripping
/// content we do not model as a typed block.
pub fn to_compact_text(v: &serde_json::Value) -> String {
	match v {
		serde_json::Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}
