//! Attachment extraction
//!
//! Walks a nested multipart message structure into a flat list of
//! attachment descriptors, and hydrates descriptor payloads through a
//! caller-supplied fetch function. The extractor itself keeps no state;
//! descriptors are owned by whoever asked for them.

use std::future::Future;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Body reference inside a message part
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartBody {
    /// Remote attachment identifier; present only for attachment parts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,

    /// Payload size in bytes
    #[serde(default)]
    pub size: u64,

    /// Inline payload, base64url-encoded (small parts only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// One node of the multipart message tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default)]
    pub part_id: String,

    #[serde(default)]
    pub mime_type: String,

    /// Non-empty only for attachment parts
    #[serde(default)]
    pub filename: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<PartBody>,

    /// Child parts, themselves possibly nested
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<MessagePart>,
}

/// Attachment metadata plus, once fetched, its payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    /// Part id within the message
    pub id: String,

    /// Original filename as sent
    pub filename: String,

    /// MIME type
    pub mime_type: String,

    /// Size in bytes
    pub size: u64,

    /// Remote attachment reference used to fetch the payload
    pub attachment_ref: String,

    /// Payload bytes, present only after a successful fetch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

impl AttachmentDescriptor {
    /// Whether the payload has been fetched
    pub fn is_hydrated(&self) -> bool {
        self.data.is_some()
    }
}

/// Flatten a message structure into attachment descriptors.
///
/// Depth-first, parent before children; output order matches traversal
/// order. A part is an attachment iff it carries a non-empty filename and
/// a body with a remote attachment identifier.
pub fn extract_descriptors(root: &MessagePart) -> Vec<AttachmentDescriptor> {
    let mut descriptors = Vec::new();
    walk(root, &mut descriptors);
    debug!("Extracted {} attachment descriptors", descriptors.len());
    descriptors
}

fn walk(part: &MessagePart, out: &mut Vec<AttachmentDescriptor>) {
    if !part.filename.is_empty() {
        if let Some(body) = &part.body {
            if let Some(attachment_id) = &body.attachment_id {
                out.push(AttachmentDescriptor {
                    id: part.part_id.clone(),
                    filename: part.filename.clone(),
                    mime_type: part.mime_type.clone(),
                    size: body.size,
                    attachment_ref: attachment_id.clone(),
                    data: None,
                });
            }
        }
    }
    for child in &part.parts {
        walk(child, out);
    }
}

/// Decode a base64url-no-pad payload as the remote endpoint encodes it
pub fn decode_body_data(data: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(data.as_bytes())
        .map_err(|e| Error::MalformedBody(format!("invalid base64 payload: {}", e)))
}

/// Hydrate descriptors by fetching every payload in parallel.
///
/// `fetch_one(message_id, attachment_ref, filename, mime_type)` runs once
/// per descriptor. Individual fetch failures are tolerated: the descriptor
/// comes back unhydrated rather than aborting the batch. The overall flag
/// is `false` only when there was nothing to fetch.
pub async fn fetch_payloads<F, Fut>(
    message_id: &str,
    descriptors: Vec<AttachmentDescriptor>,
    fetch_one: F,
) -> (Vec<AttachmentDescriptor>, bool)
where
    F: Fn(String, String, String, String) -> Fut,
    Fut: Future<Output = Result<Vec<u8>>>,
{
    if descriptors.is_empty() {
        return (descriptors, false);
    }

    let fetches = descriptors.into_iter().map(|mut descriptor| {
        let fut = fetch_one(
            message_id.to_string(),
            descriptor.attachment_ref.clone(),
            descriptor.filename.clone(),
            descriptor.mime_type.clone(),
        );
        async move {
            match fut.await {
                Ok(data) => descriptor.data = Some(data),
                Err(e) => {
                    warn!(
                        "Fetch failed for attachment {} ({}): {}",
                        descriptor.id, descriptor.filename, e
                    );
                }
            }
            descriptor
        }
    });

    (join_all(fetches).await, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment_part(part_id: &str, filename: &str, attachment_id: &str) -> MessagePart {
        MessagePart {
            part_id: part_id.to_string(),
            mime_type: "application/pdf".to_string(),
            filename: filename.to_string(),
            body: Some(PartBody {
                attachment_id: Some(attachment_id.to_string()),
                size: 1024,
                data: None,
            }),
            parts: vec![],
        }
    }

    fn text_part(part_id: &str) -> MessagePart {
        MessagePart {
            part_id: part_id.to_string(),
            mime_type: "text/plain".to_string(),
            body: Some(PartBody {
                attachment_id: None,
                size: 12,
                data: Some("aGVsbG8".to_string()),
            }),
            ..Default::default()
        }
    }

    /// Attachments at depth 0, 1 and 2 come out in depth-first order
    fn nested_structure() -> MessagePart {
        MessagePart {
            part_id: "root".to_string(),
            mime_type: "multipart/mixed".to_string(),
            filename: "depth0.pdf".to_string(),
            body: Some(PartBody {
                attachment_id: Some("ref-0".to_string()),
                size: 1,
                data: None,
            }),
            parts: vec![
                MessagePart {
                    part_id: "0".to_string(),
                    mime_type: "multipart/alternative".to_string(),
                    parts: vec![text_part("0.0"), attachment_part("0.1", "depth2.png", "ref-2")],
                    ..Default::default()
                },
                attachment_part("1", "depth1.pdf", "ref-1"),
            ],
        }
    }

    #[test]
    fn extracts_nested_attachments_depth_first() {
        let descriptors = extract_descriptors(&nested_structure());
        let refs: Vec<&str> = descriptors.iter().map(|d| d.attachment_ref.as_str()).collect();
        assert_eq!(refs, vec!["ref-0", "ref-2", "ref-1"]);
        assert!(descriptors.iter().all(|d| !d.is_hydrated()));
    }

    #[test]
    fn body_without_attachment_id_is_not_an_attachment() {
        let part = MessagePart {
            filename: "looks-like-one.txt".to_string(),
            body: Some(PartBody::default()),
            ..Default::default()
        };
        assert!(extract_descriptors(&part).is_empty());
    }

    #[test]
    fn filename_required_for_attachment() {
        assert!(extract_descriptors(&text_part("0")).is_empty());
    }

    #[test]
    fn parses_camel_case_wire_format() {
        let json = r#"{
            "partId": "1",
            "mimeType": "image/png",
            "filename": "shot.png",
            "body": {"attachmentId": "ref-x", "size": 2048}
        }"#;
        let part: MessagePart = serde_json::from_str(json).unwrap();
        let descriptors = extract_descriptors(&part);
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].attachment_ref, "ref-x");
        assert_eq!(descriptors[0].size, 2048);
    }

    #[test]
    fn decodes_base64url_payloads() {
        assert_eq!(decode_body_data("aGVsbG8").unwrap(), b"hello");
        assert!(decode_body_data("!!!").is_err());
    }

    #[tokio::test]
    async fn fetch_hydrates_descriptors_in_parallel() {
        let descriptors = extract_descriptors(&nested_structure());
        let (hydrated, ok) = fetch_payloads("msg-1", descriptors, |_, attachment_ref, _, _| {
            async move { Ok(format!("data-{}", attachment_ref).into_bytes()) }
        })
        .await;

        assert!(ok);
        assert_eq!(hydrated.len(), 3);
        assert_eq!(hydrated[0].data.as_deref(), Some(b"data-ref-0".as_ref()));
    }

    #[tokio::test]
    async fn individual_fetch_failures_are_tolerated() {
        let descriptors = extract_descriptors(&nested_structure());
        let (hydrated, ok) = fetch_payloads("msg-1", descriptors, |_, attachment_ref, _, _| {
            async move {
                if attachment_ref == "ref-1" {
                    Err(Error::NetworkTimeout("attachment".to_string()))
                } else {
                    Ok(vec![1, 2, 3])
                }
            }
        })
        .await;

        assert!(ok);
        let failed = hydrated.iter().find(|d| d.attachment_ref == "ref-1").unwrap();
        assert!(!failed.is_hydrated());
        assert_eq!(hydrated.iter().filter(|d| d.is_hydrated()).count(), 2);
    }

    #[tokio::test]
    async fn empty_descriptor_list_reports_failure() {
        let (hydrated, ok) =
            fetch_payloads("msg-1", Vec::new(), |_, _, _, _| async { Ok(vec![]) }).await;
        assert!(hydrated.is_empty());
        assert!(!ok);
    }
}
