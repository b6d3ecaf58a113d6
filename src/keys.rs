//! Request fingerprinting.
//!
//! A [`KeyBuilderMap`] turns the path, host and headers of an RPC into the
//! key map that is sent to the route lookup server and, in canonical form,
//! used as part of the cache key.

use crate::config::GrpcKeyBuilder;
use crate::error::{RlsError, RlsResult};
use hyper::HeaderMap;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Keys extracted from one request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestKeys {
    /// Key map sent to the lookup server
    pub map: BTreeMap<String, String>,
    /// Sorted `k=v,k=v` rendering with `%`, `,` and `=` percent-encoded
    /// inside keys and values
    pub encoded: String,
}

impl RequestKeys {
    fn from_map(map: BTreeMap<String, String>) -> Self {
        let encoded = map
            .iter()
            .map(|(k, v)| format!("{}={}", escape(k), escape(v)))
            .collect::<Vec<_>>()
            .join(",");
        Self { map, encoded }
    }
}

/// Key builders indexed by `/service/method` and `/service/`
#[derive(Debug, Clone, Default)]
pub struct KeyBuilderMap {
    builders: HashMap<String, Arc<GrpcKeyBuilder>>,
}

impl KeyBuilderMap {
    /// Validate the builders and index them by path
    pub fn new(builders: &[GrpcKeyBuilder]) -> RlsResult<Self> {
        let mut index = HashMap::new();

        for (i, builder) in builders.iter().enumerate() {
            if builder.names.is_empty() {
                return Err(RlsError::config(format!(
                    "key builder {} has no names",
                    i
                )));
            }

            validate_key_names(i, builder)?;

            let shared = Arc::new(builder.clone());
            for name in &builder.names {
                if name.service.is_empty() {
                    return Err(RlsError::config(format!(
                        "key builder {} has a name with an empty service",
                        i
                    )));
                }

                let method = name.method.as_deref().unwrap_or("");
                let path = format!("/{}/{}", name.service, method);
                if index.insert(path.clone(), Arc::clone(&shared)).is_some() {
                    return Err(RlsError::config(format!(
                        "duplicate key builder for {}",
                        path
                    )));
                }
            }
        }

        Ok(Self { builders: index })
    }

    /// Number of indexed service/method names
    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }

    /// Extract the keys for a request.
    ///
    /// `path` has the form `/service/method`. Requests no builder matches
    /// produce empty keys.
    pub fn build_keys(&self, headers: &HeaderMap, host: &str, path: &str) -> RequestKeys {
        let Some((service, method)) = split_path(path) else {
            return RequestKeys::default();
        };

        let builder = self
            .builders
            .get(path)
            .or_else(|| self.builders.get(&format!("/{}/", service)));
        let Some(builder) = builder else {
            return RequestKeys::default();
        };

        let mut map = BTreeMap::new();

        for matcher in &builder.headers {
            if map.contains_key(&matcher.key) {
                continue;
            }
            for name in &matcher.names {
                if let Some(value) = header_value(headers, name) {
                    map.insert(matcher.key.clone(), value);
                    break;
                }
            }
        }

        let extra = &builder.extra_keys;
        if let Some(key) = &extra.host {
            map.insert(key.clone(), host.to_string());
        }
        if let Some(key) = &extra.service {
            map.insert(key.clone(), service.to_string());
        }
        if let Some(key) = &extra.method {
            map.insert(key.clone(), method.to_string());
        }

        for (key, value) in &builder.constant_keys {
            map.insert(key.clone(), value.clone());
        }

        RequestKeys::from_map(map)
    }
}

fn validate_key_names(index: usize, builder: &GrpcKeyBuilder) -> RlsResult<()> {
    let mut seen = HashSet::new();
    let mut check = |key: &str| -> RlsResult<()> {
        if key.is_empty() {
            return Err(RlsError::config(format!(
                "key builder {} has an empty key name",
                index
            )));
        }
        if !seen.insert(key.to_string()) {
            return Err(RlsError::config(format!(
                "key builder {} repeats key {}",
                index, key
            )));
        }
        Ok(())
    };

    for matcher in &builder.headers {
        if matcher.names.is_empty() {
            return Err(RlsError::config(format!(
                "header matcher for key {} has no header names",
                matcher.key
            )));
        }
        if matcher.required_match {
            return Err(RlsError::config(format!(
                "header matcher for key {} sets required_match",
                matcher.key
            )));
        }
        check(matcher.key.as_str())?;
    }

    let extra = &builder.extra_keys;
    for key in [&extra.host, &extra.service, &extra.method].into_iter().flatten() {
        check(key.as_str())?;
    }

    for key in builder.constant_keys.keys() {
        check(key.as_str())?;
    }

    Ok(())
}

fn split_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix('/')?;
    let (service, method) = rest.split_once('/')?;
    if service.is_empty() || method.is_empty() || method.contains('/') {
        return None;
    }
    Some((service, method))
}

/// Escape the separators of the encoded key rendering
fn escape(part: &str) -> Cow<'_, str> {
    if !part.contains(|c: char| matches!(c, '%' | ',' | '=')) {
        return Cow::Borrowed(part);
    }

    let mut escaped = String::with_capacity(part.len() + 4);
    for c in part.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ',' => escaped.push_str("%2C"),
            '=' => escaped.push_str("%3D"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

/// All values of a header joined by `,`; binary headers are never keys
fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    if name.ends_with("-bin") {
        return None;
    }

    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    if values.is_empty() {
        None
    } else {
        Some(values.join(","))
    }
}
