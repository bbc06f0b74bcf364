//! Seed lists: one entry per line, either a bare URL or a JSON object.
//!
//! ```text
//! # comments and blank lines are skipped
//! https://example.org/image/1.jpg
//! {"url": "https://example.org/iiif/7/manifest.json", "kind": "manifest"}
//! {"url": "https://example.org/image/2.jpg", "title": "Plate II", "size": 2400000}
//! ```

use super::{Seed, SourceError};
use crate::registry::{CandidateSeed, ManifestSeed};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum SeedKind {
    #[default]
    Image,
    Manifest,
}

#[derive(Debug, Deserialize)]
struct SeedLine {
    url: String,
    #[serde(default)]
    kind: SeedKind,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
}

/// Parse the content of a seed file for `source`.
pub fn parse_seed_lines(source: &str, content: &str) -> Result<Vec<Seed>, SourceError> {
    let mut seeds = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let entry = if line.starts_with('{') {
            serde_json::from_str::<SeedLine>(line).map_err(|e| SourceError::InvalidSeed {
                line: index + 1,
                reason: e.to_string(),
            })?
        } else {
            SeedLine {
                url: line.to_string(),
                kind: SeedKind::Image,
                title: None,
                size: None,
                width: None,
                height: None,
            }
        };

        if entry.url.trim().is_empty() {
            return Err(SourceError::InvalidSeed {
                line: index + 1,
                reason: "empty url".to_string(),
            });
        }

        seeds.push(match entry.kind {
            SeedKind::Manifest => Seed::Manifest(ManifestSeed::new(source, entry.url)),
            SeedKind::Image => Seed::Candidate(CandidateSeed {
                source: source.to_string(),
                external_ref: entry.url,
                title: entry.title,
                size_hint: entry.size,
                width: entry.width,
                height: entry.height,
            }),
        });
    }
    Ok(seeds)
}

pub async fn read_seed_file(source: &str, path: &Path) -> Result<Vec<Seed>, SourceError> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_seed_lines(source, &content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_urls_and_json_entries() {
        let content = r#"
# museum export
https://example.org/a.jpg

{"url": "https://example.org/m.json", "kind": "manifest"}
{"url": "https://example.org/b.jpg", "title": "Plate II", "size": 2400, "width": 1200, "height": 900}
"#;
        let seeds = parse_seed_lines("museum", content).unwrap();
        assert_eq!(seeds.len(), 3);
        assert_eq!(
            seeds[0],
            Seed::Candidate(CandidateSeed::new("museum", "https://example.org/a.jpg"))
        );
        assert_eq!(
            seeds[1],
            Seed::Manifest(ManifestSeed::new("museum", "https://example.org/m.json"))
        );
        match &seeds[2] {
            Seed::Candidate(seed) => {
                assert_eq!(seed.title.as_deref(), Some("Plate II"));
                assert_eq!(seed.size_hint, Some(2400));
                assert_eq!((seed.width, seed.height), (Some(1200), Some(900)));
            }
            other => panic!("unexpected seed {:?}", other),
        }
    }

    #[test]
    fn malformed_json_reports_line_number() {
        let content = "https://example.org/a.jpg\n{\"url\": 5}\n";
        match parse_seed_lines("museum", content) {
            Err(SourceError::InvalidSeed { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected invalid seed, got {:?}", other.map(|s| s.len())),
        }
    }

    #[test]
    fn empty_url_is_rejected() {
        assert!(parse_seed_lines("museum", r#"{"url": "  "}"#).is_err());
    }
}
