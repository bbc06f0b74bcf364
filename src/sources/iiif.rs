//! IIIF Presentation manifests: locate image services and build full-size
//! image request URLs from them.

use serde_json::Value;
use std::collections::HashSet;

/// Ids of every image service referenced anywhere in `manifest`, in document
/// order and without repeats. Works for both Presentation 2 (`@id`) and
/// Presentation 3 (`id`) documents.
pub fn image_service_ids(manifest: &Value) -> Vec<String> {
    let mut ids = Vec::new();
    let mut seen = HashSet::new();
    collect_services(manifest, &mut ids, &mut seen);
    ids
}

fn collect_services(value: &Value, ids: &mut Vec<String>, seen: &mut HashSet<String>) {
    match value {
        Value::Object(map) => {
            if let Some(service) = map.get("service") {
                let entries: Vec<&Value> = match service {
                    Value::Array(items) => items.iter().collect(),
                    other => vec![other],
                };
                for entry in entries {
                    let id = entry
                        .get("@id")
                        .and_then(Value::as_str)
                        .or_else(|| entry.get("id").and_then(Value::as_str));
                    if let Some(id) = id {
                        if seen.insert(id.to_string()) {
                            ids.push(id.to_string());
                        }
                    }
                }
            }
            for child in map.values() {
                collect_services(child, ids, seen);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_services(item, ids, seen);
            }
        }
        _ => {}
    }
}

/// Image API request for the full region at maximum size.
pub fn full_image_url(service_id: &str) -> String {
    format!("{}/full/max/0/default.jpg", service_id.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn finds_services_in_presentation_2_manifest() {
        let manifest = json!({
            "@id": "https://example.org/iiif/book1/manifest",
            "sequences": [{
                "canvases": [
                    {"images": [{"resource": {"service": {"@id": "https://img.example.org/p1/"}}}]},
                    {"images": [{"resource": {"service": {"@id": "https://img.example.org/p2"}}}]},
                    {"images": [{"resource": {"service": {"@id": "https://img.example.org/p1/"}}}]}
                ]
            }]
        });
        let ids = image_service_ids(&manifest);
        assert_eq!(
            ids,
            vec!["https://img.example.org/p1/", "https://img.example.org/p2"]
        );
        assert_eq!(
            full_image_url(&ids[0]),
            "https://img.example.org/p1/full/max/0/default.jpg"
        );
    }

    #[test]
    fn finds_service_lists_in_presentation_3_manifest() {
        let manifest = json!({
            "id": "https://example.org/iiif/book2/manifest",
            "items": [{
                "items": [{
                    "items": [{
                        "body": {
                            "id": "https://img.example.org/q1/full/max/0/default.jpg",
                            "service": [
                                {"id": "https://img.example.org/q1", "type": "ImageService3"},
                                {"type": "AuthService"}
                            ]
                        }
                    }]
                }]
            }]
        });
        assert_eq!(image_service_ids(&manifest), vec!["https://img.example.org/q1"]);
    }

    #[test]
    fn manifest_without_services_is_empty() {
        assert!(image_service_ids(&json!({"label": "empty", "items": []})).is_empty());
    }
}
