// ── Change-feed wire protocol ──
//
// Same JSON shapes over both bindings: the WebSocket carries them as text
// frames, SSE as `data:` payloads.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Outbound ─────────────────────────────────────────────────────────

/// A subscribe message. Each request in `requests` gets one response, in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequests {
    pub id: String,
    pub requests: Vec<SubscribeRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub object_set: Value,
    pub property_set: Vec<String>,
    pub reference_set: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_loading_response_options: Option<ObjectLoadingResponseOptions>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectLoadingResponseOptions {
    pub should_load_object_rids: bool,
}

// ── Inbound ──────────────────────────────────────────────────────────

/// Every message the server can push.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamMessage {
    SubscribeResponses(SubscribeResponses),
    ObjectSetChanged(ObjectSetChanged),
    RefreshObjectSet(RefreshObjectSet),
    SubscriptionClosed(SubscriptionClosed),
    InitialLoadCompleted(InitialLoadCompleted),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeResponses {
    pub id: String,
    pub responses: Vec<SubscribeResponse>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SubscribeResponse {
    Success {
        id: String,
    },
    Error {
        #[serde(default)]
        errors: Vec<Value>,
    },
    Qos,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetChanged {
    pub id: String,
    #[serde(default)]
    pub updates: Vec<ObjectSetUpdate>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ObjectSetUpdate {
    Object {
        object: Map<String, Value>,
        state: ObjectState,
        #[serde(default)]
        rid: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Reference {
        object_type: String,
        primary_key: Map<String, Value>,
        property: String,
        value: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectState {
    AddedOrUpdated,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshObjectSet {
    pub id: String,
    #[serde(default)]
    pub object_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionClosed {
    pub id: String,
    #[serde(default)]
    pub cause: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialLoadCompleted {
    pub initial_load_completed: InitialLoadCompletedBody,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InitialLoadCompletedBody {
    pub id: String,
}

impl StreamMessage {
    /// Subscription id the message is addressed to, if any.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            Self::SubscribeResponses(m) => Some(&m.id),
            Self::ObjectSetChanged(m) => Some(&m.id),
            Self::RefreshObjectSet(m) => Some(&m.id),
            Self::SubscriptionClosed(m) => Some(&m.id),
            Self::InitialLoadCompleted(m) => Some(&m.initial_load_completed.id),
            Self::Unknown => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn subscribe_request_shape() {
        let msg = SubscribeRequests {
            id: "req-1".into(),
            requests: vec![SubscribeRequest {
                object_set: json!({"type": "base", "objectType": "Todo"}),
                property_set: vec!["body".into()],
                reference_set: vec![],
                object_loading_response_options: Some(ObjectLoadingResponseOptions {
                    should_load_object_rids: true,
                }),
            }],
        };
        insta::assert_json_snapshot!(msg, @r#"
        {
          "id": "req-1",
          "requests": [
            {
              "objectSet": {
                "objectType": "Todo",
                "type": "base"
              },
              "propertySet": [
                "body"
              ],
              "referenceSet": [],
              "objectLoadingResponseOptions": {
                "shouldLoadObjectRids": true
              }
            }
          ]
        }
        "#);
    }

    #[test]
    fn parses_subscribe_responses() {
        let msg: StreamMessage = serde_json::from_value(json!({
            "type": "subscribeResponses",
            "id": "req-1",
            "responses": [
                {"type": "success", "id": "sub-1"},
                {"type": "error", "errors": [{"code": "BAD"}]},
                {"type": "qos", "reason": "overloaded"},
                {"type": "somethingNew"}
            ]
        }))
        .unwrap();

        let StreamMessage::SubscribeResponses(msg) = msg else {
            panic!("wrong variant");
        };
        assert_eq!(
            msg.responses,
            vec![
                SubscribeResponse::Success { id: "sub-1".into() },
                SubscribeResponse::Error {
                    errors: vec![json!({"code": "BAD"})]
                },
                SubscribeResponse::Qos,
                SubscribeResponse::Unknown,
            ]
        );
    }

    #[test]
    fn parses_object_and_reference_updates() {
        let msg: StreamMessage = serde_json::from_value(json!({
            "type": "objectSetChanged",
            "id": "sub-1",
            "updates": [
                {
                    "type": "object",
                    "state": "ADDED_OR_UPDATED",
                    "object": {"__apiName": "Todo", "__primaryKey": 1, "body": "x"}
                },
                {
                    "type": "reference",
                    "objectType": "Vehicle",
                    "primaryKey": {"vin": "A1"},
                    "property": "position",
                    "value": {"lat": 1.0}
                }
            ]
        }))
        .unwrap();

        let StreamMessage::ObjectSetChanged(changed) = msg else {
            panic!("wrong variant");
        };
        assert_eq!(changed.updates.len(), 2);
        assert!(matches!(
            &changed.updates[0],
            ObjectSetUpdate::Object { state: ObjectState::AddedOrUpdated, rid: None, .. }
        ));
        assert!(matches!(
            &changed.updates[1],
            ObjectSetUpdate::Reference { property, .. } if property == "position"
        ));
    }

    #[test]
    fn parses_initial_load_completed() {
        let msg: StreamMessage = serde_json::from_value(json!({
            "type": "initialLoadCompleted",
            "initialLoadCompleted": {"id": "sub-9"}
        }))
        .unwrap();
        assert_eq!(msg.subscription_id(), Some("sub-9"));
    }

    #[test]
    fn unknown_message_types_are_tolerated() {
        let msg: StreamMessage =
            serde_json::from_value(json!({"type": "heartbeat", "at": 1})).unwrap();
        assert_eq!(msg, StreamMessage::Unknown);
        assert_eq!(msg.subscription_id(), None);
    }
}
