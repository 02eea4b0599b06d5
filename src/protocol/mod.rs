pub mod diff;
pub mod message;

pub use diff::{Diff, State};
pub use message::{
    InboundMessage, MessageKind, OutboundMessage, Rejection, INIT_STATE_FIELD, KIND_FIELD,
    PAYLOAD_FIELD, PROTOCOL_VERSION, VERSION_FIELD,
};

use serde_json::Value;

/// JavaScript-style truthiness, used wherever the wire format tests a flag
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!("Init")));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
    }
}
