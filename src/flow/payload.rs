use std::collections::HashSet;

use serde_json::{Map, Value};
use smallvec::{smallvec, SmallVec};

pub const DEFAULT_NO_CONTENT_TEXT: &str = "✅ Langflow không trả về nội dung phù hợp.";

const TEXT_PATHS: &[&[&str]] = &[
    &["results", "message", "text"],
    &["outputs", "message", "message"],
    &["message", "text"],
    &["text"],
];

#[derive(Debug, Clone, Copy)]
pub enum PayloadNode<'a> {
    Mapping(&'a Map<String, Value>),
    Sequence(&'a [Value]),
    Scalar(&'a Value),
    Absent,
}

impl<'a> PayloadNode<'a> {
    pub fn of(value: &'a Value) -> Self {
        match value {
            Value::Object(map) => Self::Mapping(map),
            Value::Array(items) => Self::Sequence(items),
            Value::Null => Self::Absent,
            other => Self::Scalar(other),
        }
    }

    pub fn get(self, key: &str) -> Self {
        match self {
            Self::Mapping(map) => map.get(key).map(Self::of).unwrap_or(Self::Absent),
            _ => Self::Absent,
        }
    }

    pub fn path(self, keys: &[&str]) -> Self {
        keys.iter().fold(self, |node, key| node.get(key))
    }

    pub fn items(self) -> &'a [Value] {
        match self {
            Self::Sequence(items) => items,
            _ => &[],
        }
    }

    pub fn as_str(self) -> Option<&'a str> {
        match self {
            Self::Scalar(Value::String(text)) => Some(text.as_str()),
            _ => None,
        }
    }

    fn is_empty(self) -> bool {
        match self {
            Self::Mapping(map) => map.is_empty(),
            Self::Sequence(items) => items.is_empty(),
            Self::Scalar(_) => false,
            Self::Absent => true,
        }
    }
}

enum NodeText<'a> {
    Found(SmallVec<[&'a str; 2]>),
    Blank,
    Unrecognized,
}

pub fn normalize_payload(payload: &Value, no_content_text: &str) -> Vec<String> {
    let segments = extract_segments(payload);
    if segments.is_empty() {
        return vec![no_content_text.to_owned()];
    }
    segments
}

pub fn extract_segments(payload: &Value) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut segments = Vec::new();

    for block in PayloadNode::of(payload).get("outputs").items() {
        for sub_output in PayloadNode::of(block).get("outputs").items() {
            let candidates: SmallVec<[String; 2]> = match node_text(PayloadNode::of(sub_output)) {
                NodeText::Found(texts) => texts.iter().map(|text| (*text).to_owned()).collect(),
                NodeText::Blank => SmallVec::new(),
                NodeText::Unrecognized => serialize_node(sub_output).into_iter().collect(),
            };
            for candidate in candidates {
                let trimmed = candidate.trim();
                if trimmed.is_empty() || seen.contains(trimmed) {
                    continue;
                }
                seen.insert(trimmed.to_owned());
                segments.push(trimmed.to_owned());
            }
        }
    }

    segments
}

fn node_text(node: PayloadNode<'_>) -> NodeText<'_> {
    let mut saw_string = false;

    if let Some(text) = node.as_str() {
        if !text.trim().is_empty() {
            return NodeText::Found(smallvec![text]);
        }
        saw_string = true;
    }

    for path in TEXT_PATHS {
        if let Some(text) = node.path(path).as_str() {
            if !text.trim().is_empty() {
                return NodeText::Found(smallvec![text]);
            }
            saw_string = true;
        }
    }

    let mut listed = SmallVec::new();
    for entry in node.get("messages").items() {
        if let Some(text) = PayloadNode::of(entry).get("message").as_str() {
            saw_string = true;
            if !text.trim().is_empty() {
                listed.push(text);
            }
        }
    }
    if !listed.is_empty() {
        return NodeText::Found(listed);
    }

    if saw_string {
        NodeText::Blank
    } else {
        NodeText::Unrecognized
    }
}

fn serialize_node(value: &Value) -> Option<String> {
    if PayloadNode::of(value).is_empty() {
        return None;
    }
    Some(value.to_string())
}
