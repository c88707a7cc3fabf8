//! Storage key layout shared by every backend.
//!
//! A sample key is `namespace:name[:label0:label1...]` with every component
//! percent-encoded, so `:` only ever appears as the separator. Keys that start
//! with `@` are reserved for bookkeeping records and never collide with sample
//! keys because `@` is always encoded inside a component.

use std::collections::BTreeSet;

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use promshare_common::error::{PromshareError, Result};
use promshare_common::types::Identity;

const COMPONENT: &AsciiSet = &CONTROLS.add(b':').add(b'%').add(b'@');

pub const INDEX_KEY: &str = "@index";
const METADATA_PREFIX: &str = "@meta:";

pub fn encode_sample_key(identity: &Identity) -> String {
    let mut key = metric_key(&identity.namespace, &identity.name);
    for value in &identity.label_values {
        key.push(':');
        key.extend(utf8_percent_encode(value, COMPONENT));
    }
    key
}

pub fn decode_sample_key(key: &str) -> Result<Identity> {
    if key.starts_with('@') {
        return Err(malformed(key, "reserved key"));
    }

    let mut parts = key.split(':');
    let namespace = decode_component(key, parts.next())?;
    let name = decode_component(key, parts.next())?;
    let label_values = parts
        .map(|part| decode_component(key, Some(part)))
        .collect::<Result<Vec<_>>>()?;

    Ok(Identity {
        namespace,
        name,
        label_values,
    })
}

/// `namespace:name`, identifying a metric regardless of labels.
pub fn metric_key(namespace: &str, name: &str) -> String {
    format!(
        "{}:{}",
        utf8_percent_encode(namespace, COMPONENT),
        utf8_percent_encode(name, COMPONENT)
    )
}

pub fn metadata_key(namespace: &str, name: &str) -> String {
    format!("{METADATA_PREFIX}{}", metric_key(namespace, name))
}

pub fn encode_index(keys: &BTreeSet<String>) -> Result<Vec<u8>> {
    rmp_serde::to_vec(keys).map_err(|err| PromshareError::CorruptRecord {
        key: INDEX_KEY.to_string(),
        reason: err.to_string(),
    })
}

pub fn decode_index(raw: &[u8]) -> Result<BTreeSet<String>> {
    rmp_serde::from_slice(raw).map_err(|err| PromshareError::CorruptRecord {
        key: INDEX_KEY.to_string(),
        reason: err.to_string(),
    })
}

fn decode_component(key: &str, part: Option<&str>) -> Result<String> {
    let part = part.ok_or_else(|| malformed(key, "missing component"))?;
    percent_decode_str(part)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| malformed(key, "component is not valid utf-8"))
}

fn malformed(key: &str, reason: &str) -> PromshareError {
    PromshareError::CorruptRecord {
        key: key.to_string(),
        reason: format!("malformed storage key: {reason}"),
    }
}
