use serde_json::{Map, Value};
use yotei_core::types::ToolInvocation;

/// Action types that never mutate the store: the atomic calculators plus
/// the three read queries. Exempt from write-dedup, subject to the
/// stale-read guard.
pub const READ_ONLY_ACTION_TYPES: [&str; 10] = [
    "calc_date_offset",
    "calc_month_boundary",
    "calc_nearest_weekday",
    "calc_week_weekday",
    "calc_week_range",
    "calc_time_offset",
    "get_date_info",
    "get_day_log",
    "list_tasks_in_period",
    "get_daily_summary",
];

/// One tool call proposed by the LLM, kept as raw JSON arguments so the
/// dispatcher can report field-level validation errors and the loop can
/// fingerprint the exact payload.
#[derive(Debug, Clone)]
pub struct ActionCall {
    pub name: String,
    pub args: Value,
}

impl ActionCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        let args = match args {
            Value::Object(map) => {
                let cleaned: Map<String, Value> =
                    map.into_iter().filter(|(_, v)| !v.is_null()).collect();
                Value::Object(cleaned)
            }
            _ => Value::Object(Map::new()),
        };
        Self {
            name: name.into(),
            args,
        }
    }

    /// Convert the LLM's tool invocations, dropping null-valued arguments
    /// and empty names.
    pub fn from_tool_calls(calls: &[ToolInvocation]) -> Vec<Self> {
        calls
            .iter()
            .filter(|call| !call.name.is_empty())
            .map(|call| Self::new(call.name.clone(), call.arguments.clone()))
            .collect()
    }

    pub fn is_read_only(&self) -> bool {
        READ_ONLY_ACTION_TYPES.contains(&self.name.as_str())
    }

    /// The resolver mutates nothing but is still fingerprinted so an
    /// identical re-proposal is skipped instead of recomputed.
    pub fn is_resolve(&self) -> bool {
        self.name == "resolve_schedule_expression"
    }

    pub fn arg(&self, key: &str) -> Option<&Value> {
        self.args.get(key)
    }

    /// Canonical sorted-key JSON of `{type, ...args}`. serde_json's default
    /// object map is a BTreeMap, so serialization is already key-sorted.
    pub fn fingerprint(&self) -> String {
        let mut map = Map::new();
        map.insert("type".to_string(), Value::String(self.name.clone()));
        if let Value::Object(args) = &self.args {
            for (k, v) in args {
                map.insert(k.clone(), v.clone());
            }
        }
        Value::Object(map).to_string()
    }

    /// `{type, params}` shape used in the persisted execution trace.
    pub fn trace_entry(&self) -> Value {
        let mut entry = Map::new();
        entry.insert("type".to_string(), Value::String(self.name.clone()));
        entry.insert("params".to_string(), self.args.clone());
        Value::Object(entry)
    }
}

/// Canonical signature of one round's whole tool-call list.
pub fn action_signature(actions: &[ActionCall]) -> String {
    actions
        .iter()
        .map(ActionCall::fingerprint)
        .collect::<Vec<_>>()
        .join("|")
}
