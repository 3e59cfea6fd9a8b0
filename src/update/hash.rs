//! Stable content hash over an entry's content-bearing fields.
//!
//! The hash input is a canonical JSON document: fixed field order, absent
//! fields skipped, timestamps as epoch microseconds. Skipping absent fields
//! keeps hashes stable when new optional fields join the model.

use serde::Serialize;

use crate::types::{Content, Enclosure, EntryData};

#[derive(Serialize)]
struct HashParts<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    link: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    author: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<&'a str>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    content: &'a [Content],
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    enclosures: &'a [Enclosure],
    #[serde(skip_serializing_if = "Option::is_none")]
    published: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated: Option<i64>,
}

pub(crate) fn entry_data_hash(data: &EntryData) -> Vec<u8> {
    let parts = HashParts {
        title: data.title.as_deref(),
        link: data.link.as_deref(),
        author: data.author.as_deref(),
        summary: data.summary.as_deref(),
        content: &data.content,
        enclosures: &data.enclosures,
        published: data.published.map(|t| t.timestamp_micros()),
        updated: data.updated.map(|t| t.timestamp_micros()),
    };
    let serialized = serde_json::to_vec(&parts).expect("hash input is always serializable");
    blake3::hash(&serialized).as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn base() -> EntryData {
        EntryData {
            id: "e1".to_string(),
            title: Some("Title".to_string()),
            link: Some("https://example.com/e1".to_string()),
            summary: Some("Summary".to_string()),
            published: Some(Utc::now()),
            ..Default::default()
        }
    }

    #[test]
    fn test_hash_is_stable() {
        let data = base();
        assert_eq!(entry_data_hash(&data), entry_data_hash(&data.clone()));
    }

    #[test]
    fn test_hash_ignores_id() {
        let a = base();
        let mut b = base();
        b.id = "other".to_string();
        b.published = a.published;
        assert_eq!(entry_data_hash(&a), entry_data_hash(&b));
    }

    #[test]
    fn test_hash_changes_with_content() {
        let a = base();
        let mut b = a.clone();
        b.title = Some("Different".to_string());
        assert_ne!(entry_data_hash(&a), entry_data_hash(&b));

        let mut c = a.clone();
        c.content.push(Content {
            value: "body".to_string(),
            ..Default::default()
        });
        assert_ne!(entry_data_hash(&a), entry_data_hash(&c));
    }

    #[test]
    fn test_absent_fields_do_not_disturb() {
        let a = EntryData {
            id: "e".to_string(),
            ..Default::default()
        };
        let b = EntryData {
            id: "e".to_string(),
            title: None,
            ..Default::default()
        };
        assert_eq!(entry_data_hash(&a), entry_data_hash(&b));
    }
}
