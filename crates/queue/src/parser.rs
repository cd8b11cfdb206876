//! Parse broker message JSON bodies into [`Task`]s.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use kiln_core::{ImageParams, ImageRequest, Overlay, SubjectRequest, SynthesisRequest, Task};

use crate::broker::BrokerMessage;
use crate::error::QueueError;

/// Subject conditioning strength used when the producer does not send one.
pub const DEFAULT_SUBJECT_SCALE: f32 = 0.9;

/// Message body as producers write it.
#[derive(Debug, Deserialize)]
struct TaskBody {
    task_id: Option<String>,
    model_name: Option<String>,
    #[serde(default)]
    loras: Vec<OverlayBody>,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    negative_prompt: Option<String>,
    #[serde(default)]
    image_params: Value,
}

#[derive(Debug, Deserialize)]
struct OverlayBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    weight: Option<f32>,
}

fn required(value: Option<String>, key: &str, msg: &BrokerMessage) -> Result<String, QueueError> {
    value.filter(|v| !v.is_empty()).ok_or_else(|| {
        QueueError::Parse(format!(
            "message {}/{}@{} has no {key}",
            msg.topic, msg.partition, msg.offset
        ))
    })
}

/// Parse a single broker message into a [`Task`].
///
/// Rejects bodies that are not JSON objects and bodies without `task_id` or
/// `model_name`. Overlays without a name are dropped with a warning;
/// an `image_params.subject_image` turns the request into a
/// [`SynthesisRequest::SubjectToImage`].
pub fn parse_message(msg: &BrokerMessage) -> Result<Task, QueueError> {
    let json: Value = serde_json::from_str(&msg.body).map_err(|e| {
        QueueError::Parse(format!(
            "Invalid JSON in message {}/{}@{}: {}",
            msg.topic, msg.partition, msg.offset, e
        ))
    })?;
    if !json.is_object() {
        return Err(QueueError::Parse(format!(
            "message {}/{}@{} body is not a JSON object",
            msg.topic, msg.partition, msg.offset
        )));
    }

    let body: TaskBody = serde_json::from_value(json)
        .map_err(|e| QueueError::Parse(format!("malformed task body: {e}")))?;

    let task_id = required(body.task_id, "task_id", msg)?;
    let base_resource_id = required(body.model_name, "model_name", msg)?;

    let overlays = body
        .loras
        .into_iter()
        .filter_map(|lora| match lora.name.filter(|n| !n.is_empty()) {
            Some(name) => Some(Overlay::new(name, lora.weight.unwrap_or(1.0))),
            None => {
                warn!(task_id = %task_id, "dropping overlay without a name");
                None
            }
        })
        .collect();

    let payload = build_request(body.prompt, body.negative_prompt, body.image_params)?;

    Ok(Task {
        task_id,
        topic: msg.topic.clone(),
        partition: msg.partition,
        broker_offset: msg.offset,
        base_resource_id,
        overlays,
        payload,
    })
}

fn build_request(
    prompt: String,
    negative_prompt: Option<String>,
    image_params: Value,
) -> Result<SynthesisRequest, QueueError> {
    let image_params = match image_params {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };

    let subject_image = image_params
        .get("subject_image")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from);
    let subject_scale = image_params
        .get("subject_scale")
        .and_then(Value::as_f64)
        .map(|v| v as f32)
        .unwrap_or(DEFAULT_SUBJECT_SCALE);

    let params: ImageParams = serde_json::from_value(image_params)
        .map_err(|e| QueueError::Parse(format!("invalid image_params: {e}")))?;

    Ok(match subject_image {
        Some(subject_image) => SynthesisRequest::SubjectToImage(SubjectRequest {
            prompt,
            negative_prompt,
            params,
            subject_image,
            subject_scale,
        }),
        None => SynthesisRequest::TextToImage(ImageRequest {
            prompt,
            negative_prompt,
            params,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    /// Helper: build a BrokerMessage with the given JSON body.
    fn make_msg(offset: i64, body: &str) -> BrokerMessage {
        BrokerMessage {
            topic: "sdxl_tasks".to_string(),
            partition: 0,
            offset,
            body: body.to_string(),
            timestamp: Utc::now(),
            attempt_count: 1,
        }
    }

    #[test]
    fn test_parse_text_to_image_task() {
        let body = r#"{
            "task_id": "t-1",
            "model_name": "sdxl",
            "prompt": "a red fox in snow",
            "negative_prompt": "blurry",
            "loras": [{"name": "style.safetensors", "weight": 0.7}, {"name": "detail"}],
            "image_params": {"width": 1024, "height": 768, "steps": 30, "seed": 42}
        }"#;
        let task = parse_message(&make_msg(7, body)).unwrap();

        assert_eq!(task.task_id, "t-1");
        assert_eq!(task.topic, "sdxl_tasks");
        assert_eq!(task.broker_offset, 7);
        assert_eq!(task.base_resource_id, "sdxl");
        assert_eq!(
            task.overlays,
            vec![Overlay::new("style.safetensors", 0.7), Overlay::new("detail", 1.0)]
        );
        match task.payload {
            SynthesisRequest::TextToImage(req) => {
                assert_eq!(req.prompt, "a red fox in snow");
                assert_eq!(req.negative_prompt.as_deref(), Some("blurry"));
                assert_eq!(req.params.width, Some(1024));
                assert_eq!(req.params.steps, Some(30));
                assert_eq!(req.params.seed, 42);
                assert_eq!(req.params.batch_size, 1);
            }
            other => panic!("expected text_to_image, got {other:?}"),
        }
    }

    #[test]
    fn test_subject_image_selects_subject_request() {
        let body = r#"{
            "task_id": "t-2",
            "model_name": "sd15",
            "prompt": "portrait",
            "image_params": {"subject_image": "faces/a.png"}
        }"#;
        let task = parse_message(&make_msg(0, body)).unwrap();
        match task.payload {
            SynthesisRequest::SubjectToImage(req) => {
                assert_eq!(req.subject_image, "faces/a.png");
                assert_eq!(req.subject_scale, DEFAULT_SUBJECT_SCALE);
                assert_eq!(req.params.seed, kiln_core::RANDOM_SEED);
            }
            other => panic!("expected subject_to_image, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_subject_image_is_plain_request() {
        let body = r#"{"task_id":"t","model_name":"m","image_params":{"subject_image":""}}"#;
        let task = parse_message(&make_msg(0, body)).unwrap();
        assert_eq!(task.payload.kind(), "text_to_image");
    }

    #[test]
    fn test_nameless_overlays_are_dropped() {
        let body = r#"{
            "task_id": "t-3",
            "model_name": "m",
            "loras": [{"weight": 0.5}, {"name": ""}, {"name": "keep", "weight": 0.2}]
        }"#;
        let task = parse_message(&make_msg(0, body)).unwrap();
        assert_eq!(task.overlays, vec![Overlay::new("keep", 0.2)]);
    }

    #[test]
    fn test_missing_image_params_uses_defaults() {
        let task = parse_message(&make_msg(0, r#"{"task_id":"t","model_name":"m"}"#)).unwrap();
        assert!(task.overlays.is_empty());
        match task.payload {
            SynthesisRequest::TextToImage(req) => {
                assert_eq!(req.prompt, "");
                assert_eq!(req.params, ImageParams::default());
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_parse_invalid_json() {
        let err = parse_message(&make_msg(3, "not json at all")).unwrap_err();
        assert!(matches!(err, QueueError::Parse(_)));
        assert!(err.to_string().contains("Invalid JSON"));
    }

    #[test]
    fn test_parse_non_object() {
        let err = parse_message(&make_msg(3, "[1, 2]")).unwrap_err();
        assert!(err.to_string().contains("not a JSON object"));
    }

    #[test]
    fn test_missing_required_fields() {
        let err = parse_message(&make_msg(0, r#"{"model_name":"m"}"#)).unwrap_err();
        assert!(err.to_string().contains("task_id"));

        let err = parse_message(&make_msg(0, r#"{"task_id":"t"}"#)).unwrap_err();
        assert!(err.to_string().contains("model_name"));

        let err = parse_message(&make_msg(0, r#"{"task_id":"","model_name":"m"}"#)).unwrap_err();
        assert!(err.to_string().contains("task_id"));
    }

    #[test]
    fn test_bad_image_params_type() {
        let body = r#"{"task_id":"t","model_name":"m","image_params":{"width":"wide"}}"#;
        let err = parse_message(&make_msg(0, body)).unwrap_err();
        assert!(err.to_string().contains("image_params"));
    }
}
