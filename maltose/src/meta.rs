//! Routing metadata carried by a request type's marker field.
//!
//! A request type declares its route on a field of type [`Meta`]:
//!
//! ```ignore
//! #[derive(Deserialize, Reflect)]
//! struct HelloReq {
//!     #[tag(path = "/hello", method = "get", summary = "Say hello")]
//!     meta: Meta,
//!     #[tag(form = "name")]
//!     name: String,
//! }
//! ```
//!
//! Tags use the conventional `key:"value"` syntax. Parsing is tolerant: a
//! malformed tag stops at the offending byte and keeps what was read so far.

use std::any::TypeId;
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::reflect::{Reflect, Shape};

/// Marker field type. Its tag holds the route metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Meta;

impl Reflect for Meta {
    fn shape() -> Shape {
        Shape::Marker
    }
}

impl Serialize for Meta {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_unit()
    }
}

impl<'de> Deserialize<'de> for Meta {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde::de::IgnoredAny::deserialize(deserializer)?;
        Ok(Meta)
    }
}

/// Parsed marker tag of one type.
pub type MetaData = BTreeMap<String, String>;

static CACHE: LazyLock<DashMap<TypeId, Arc<MetaData>>> = LazyLock::new(DashMap::new);

/// Returns the marker metadata of `T`, or an empty map when `T` is not a
/// struct or has no marker field.
pub fn data<T: Reflect + 'static>() -> Arc<MetaData> {
    let id = TypeId::of::<T>();
    if let Some(cached) = CACHE.get(&id) {
        return Arc::clone(&cached);
    }

    let parsed = Arc::new(read(&T::shape()));
    CACHE.insert(id, Arc::clone(&parsed));
    parsed
}

/// Same as [`data`] for a value; `None` yields an empty map.
pub fn data_of<T: Reflect + 'static>(value: &T) -> Arc<MetaData> {
    if value.is_null() {
        return Arc::new(MetaData::new());
    }
    data::<T>()
}

/// One metadata value of `T`.
pub fn get<T: Reflect + 'static>(key: &str) -> Option<String> {
    data::<T>().get(key).cloned()
}

/// One metadata value of a value's type.
pub fn get_of<T: Reflect + 'static>(value: &T, key: &str) -> Option<String> {
    data_of(value).get(key).cloned()
}

/// Reads marker metadata out of a shape.
pub fn read(shape: &Shape) -> MetaData {
    let mut out = MetaData::new();
    let Some(marker) = shape.as_struct().and_then(|s| s.marker()) else {
        return out;
    };
    for (key, value) in parse_tag(marker.tag) {
        out.entry(key).or_insert(value);
    }
    out
}

/// Looks up a single key in a raw tag string.
pub fn lookup(tag: &str, key: &str) -> Option<String> {
    parse_tag(tag)
        .into_iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v)
}

/// Parses `key:"value" key2:"value2"` into ordered pairs.
pub fn parse_tag(tag: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let bytes = tag.as_bytes();
    let mut pos = 0;

    loop {
        while pos < bytes.len() && bytes[pos] == b' ' {
            pos += 1;
        }
        if pos >= bytes.len() {
            break;
        }

        let key_start = pos;
        while pos < bytes.len()
            && bytes[pos] > b' '
            && bytes[pos] != b':'
            && bytes[pos] != b'"'
            && bytes[pos] != 0x7f
        {
            pos += 1;
        }
        if pos == key_start
            || pos + 1 >= bytes.len()
            || bytes[pos] != b':'
            || bytes[pos + 1] != b'"'
        {
            break;
        }
        let key = &tag[key_start..pos];

        // opening quote
        pos += 1;
        let value_start = pos;
        pos += 1;
        while pos < bytes.len() && bytes[pos] != b'"' {
            if bytes[pos] == b'\\' {
                pos += 1;
            }
            pos += 1;
        }
        if pos >= bytes.len() {
            break;
        }

        let Some(value) = unquote(&tag[value_start + 1..pos]) else {
            break;
        };
        pairs.push((key.to_string(), value));
        pos += 1;
    }

    pairs
}

fn unquote(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '\\' => out.push('\\'),
            '"' => out.push('"'),
            '\'' => out.push('\''),
            'u' => {
                let hex: String = chars.by_ref().take(4).collect();
                let code = u32::from_str_radix(&hex, 16).ok()?;
                out.push(char::from_u32(code)?);
            }
            _ => return None,
        }
    }
    Some(out)
}
