//! Trace event schema decoding
//!
//! A trace event arrives as a provider id, an event descriptor, and a raw
//! payload. The schema for a `(provider, event-id, version)` triple is
//! resolved lazily through the [`SchemaResolver`] seam and cached, including
//! negative results. Decoded properties render as `name=value` pairs, nested
//! structures and arrays with dotted paths; events without a schema fall
//! back to a hex dump of the payload.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

/// Wire type of one event property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKind {
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int32,
    Int64,
    Float32,
    Float64,
    /// 32-bit on the wire.
    Boolean,
    /// NUL-terminated single-byte string.
    AnsiString,
    /// NUL-terminated UTF-16LE string.
    UnicodeString,
    Guid,
    /// Fixed-length opaque bytes, rendered as hex.
    Binary(usize),
    /// Fixed-count array of a single element kind.
    Array(Box<PropertyKind>, usize),
    Struct(Vec<PropertyDescriptor>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDescriptor {
    pub name: String,
    pub kind: PropertyKind,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventSchema {
    pub properties: Vec<PropertyDescriptor>,
}

/// Schema lookup seam over the host's trace metadata store.
pub trait SchemaResolver: Send {
    fn resolve(&mut self, provider: Uuid, event_id: u16, version: u8) -> Option<EventSchema>;
}

/// Resolver with no metadata store; every event falls back to a hex dump.
pub struct EmptySchemaResolver;

impl SchemaResolver for EmptySchemaResolver {
    fn resolve(&mut self, _provider: Uuid, _event_id: u16, _version: u8) -> Option<EventSchema> {
        None
    }
}

/// Per-monitor cache in front of a resolver. Misses are cached too, so an
/// unknown event type costs one lookup, not one per event.
pub struct SchemaCache {
    resolver: Box<dyn SchemaResolver>,
    cache: HashMap<(Uuid, u16, u8), Option<Arc<EventSchema>>>,
}

impl SchemaCache {
    pub fn new(resolver: Box<dyn SchemaResolver>) -> SchemaCache {
        SchemaCache { resolver, cache: HashMap::new() }
    }

    pub fn resolve(&mut self, provider: Uuid, event_id: u16, version: u8) -> Option<Arc<EventSchema>> {
        let key = (provider, event_id, version);
        if let Some(cached) = self.cache.get(&key) {
            return cached.clone();
        }
        let resolved = self
            .resolver
            .resolve(provider, event_id, version)
            .map(Arc::new);
        self.cache.insert(key, resolved.clone());
        resolved
    }

    #[cfg(test)]
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }
}

/// Renders a payload under its schema; `None` when the payload does not fit
/// the schema, in which case the caller hex-dumps instead.
pub fn render_payload(schema: &EventSchema, payload: &[u8]) -> Option<String> {
    let mut parts = Vec::new();
    let mut cursor = 0usize;
    walk(&schema.properties, payload, &mut cursor, "", &mut parts)?;
    Some(parts.join(", "))
}

pub fn hex_dump(payload: &[u8]) -> String {
    payload
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn walk(
    properties: &[PropertyDescriptor],
    payload: &[u8],
    cursor: &mut usize,
    prefix: &str,
    out: &mut Vec<String>,
) -> Option<()> {
    for property in properties {
        let path = if prefix.is_empty() {
            property.name.clone()
        } else {
            format!("{prefix}.{}", property.name)
        };
        walk_kind(&property.kind, payload, cursor, &path, out)?;
    }
    Some(())
}

fn walk_kind(
    kind: &PropertyKind,
    payload: &[u8],
    cursor: &mut usize,
    path: &str,
    out: &mut Vec<String>,
) -> Option<()> {
    match kind {
        PropertyKind::Array(element, count) => {
            for index in 0..*count {
                walk_kind(element, payload, cursor, &format!("{path}.{index}"), out)?;
            }
        }
        PropertyKind::Struct(fields) => {
            walk(fields, payload, cursor, path, out)?;
        }
        scalar => {
            let value = decode_scalar(scalar, payload, cursor)?;
            out.push(format!("{path}={value}"));
        }
    }
    Some(())
}

fn decode_scalar(kind: &PropertyKind, payload: &[u8], cursor: &mut usize) -> Option<String> {
    match kind {
        PropertyKind::UInt8 => take(payload, cursor, 1).map(|b| b[0].to_string()),
        PropertyKind::UInt16 => {
            take(payload, cursor, 2).map(|b| u16::from_le_bytes([b[0], b[1]]).to_string())
        }
        PropertyKind::UInt32 => take(payload, cursor, 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]).to_string()),
        PropertyKind::UInt64 => {
            take(payload, cursor, 8).map(|b| u64::from_le_bytes(fixed(b)).to_string())
        }
        PropertyKind::Int32 => take(payload, cursor, 4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]).to_string()),
        PropertyKind::Int64 => {
            take(payload, cursor, 8).map(|b| i64::from_le_bytes(fixed(b)).to_string())
        }
        PropertyKind::Float32 => take(payload, cursor, 4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]).to_string()),
        PropertyKind::Float64 => {
            take(payload, cursor, 8).map(|b| f64::from_le_bytes(fixed(b)).to_string())
        }
        PropertyKind::Boolean => take(payload, cursor, 4).map(|b| {
            let value = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            (value != 0).to_string()
        }),
        PropertyKind::AnsiString => {
            let rest = &payload[*cursor..];
            let end = rest.iter().position(|&b| b == 0)?;
            let text: String = rest[..end].iter().map(|&b| b as char).collect();
            *cursor += end + 1;
            Some(text)
        }
        PropertyKind::UnicodeString => {
            let rest = &payload[*cursor..];
            let mut units = Vec::new();
            let mut at = 0usize;
            loop {
                if at + 2 > rest.len() {
                    return None;
                }
                let unit = u16::from_le_bytes([rest[at], rest[at + 1]]);
                at += 2;
                if unit == 0 {
                    break;
                }
                units.push(unit);
            }
            *cursor += at;
            Some(String::from_utf16_lossy(&units))
        }
        PropertyKind::Guid => take(payload, cursor, 16).map(|b| {
            // Trace GUIDs are serialized in the mixed-endian layout.
            Uuid::from_bytes_le(fixed(b)).braced().to_string()
        }),
        PropertyKind::Binary(len) => take(payload, cursor, *len).map(hex_dump),
        PropertyKind::Array(..) | PropertyKind::Struct(..) => None,
    }
}

/// Copies a bounds-checked slice into a fixed array; `take` guarantees the
/// length matches.
fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

fn take<'a>(payload: &'a [u8], cursor: &mut usize, len: usize) -> Option<&'a [u8]> {
    if *cursor + len > payload.len() {
        return None;
    }
    let slice = &payload[*cursor..*cursor + len];
    *cursor += len;
    Some(slice)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, kind: PropertyKind) -> PropertyDescriptor {
        PropertyDescriptor { name: name.to_string(), kind }
    }

    #[test]
    fn decodes_scalar_properties_in_order() {
        let schema = EventSchema {
            properties: vec![
                descriptor("Pid", PropertyKind::UInt32),
                descriptor("Name", PropertyKind::UnicodeString),
                descriptor("Elevated", PropertyKind::Boolean),
            ],
        };

        let mut payload = Vec::new();
        payload.extend(1234u32.to_le_bytes());
        payload.extend("app".encode_utf16().flat_map(u16::to_le_bytes));
        payload.extend(0u16.to_le_bytes());
        payload.extend(1u32.to_le_bytes());

        assert_eq!(
            render_payload(&schema, &payload).unwrap(),
            "Pid=1234, Name=app, Elevated=true"
        );
    }

    #[test]
    fn arrays_and_structs_expand_with_dotted_paths() {
        let schema = EventSchema {
            properties: vec![descriptor(
                "Conn",
                PropertyKind::Struct(vec![
                    descriptor("Port", PropertyKind::UInt16),
                    descriptor("Addr", PropertyKind::Array(Box::new(PropertyKind::UInt8), 2)),
                ]),
            )],
        };

        let payload = [0x50u8, 0x00, 10, 1];
        assert_eq!(
            render_payload(&schema, &payload).unwrap(),
            "Conn.Port=80, Conn.Addr.0=10, Conn.Addr.1=1"
        );
    }

    #[test]
    fn short_payload_is_a_decode_failure() {
        let schema = EventSchema {
            properties: vec![descriptor("Big", PropertyKind::UInt64)],
        };
        assert_eq!(render_payload(&schema, &[1, 2, 3]), None);
    }

    #[test]
    fn ansi_string_needs_terminator() {
        let schema = EventSchema {
            properties: vec![descriptor("S", PropertyKind::AnsiString)],
        };
        assert_eq!(render_payload(&schema, b"abc\0"), Some("S=abc".to_string()));
        assert_eq!(render_payload(&schema, b"abc"), None);
    }

    #[test]
    fn guid_renders_braced() {
        let guid = Uuid::parse_str("22FB2CD6-0E7B-422B-A0C7-2FAD1FD0E716").unwrap();
        let schema = EventSchema {
            properties: vec![descriptor("Id", PropertyKind::Guid)],
        };
        let rendered = render_payload(&schema, &guid.to_bytes_le()).unwrap();
        assert_eq!(rendered, "Id={22fb2cd6-0e7b-422b-a0c7-2fad1fd0e716}");
    }

    #[test]
    fn hex_dump_formats_bytes() {
        assert_eq!(hex_dump(&[0x00, 0x1A, 0xFF]), "00 1A FF");
    }

    #[test]
    fn cache_remembers_hits_and_misses() {
        struct Counting {
            calls: usize,
        }
        impl SchemaResolver for Counting {
            fn resolve(&mut self, _: Uuid, event_id: u16, _: u8) -> Option<EventSchema> {
                self.calls += 1;
                (event_id == 1).then(EventSchema::default)
            }
        }

        let provider = Uuid::new_v4();
        let mut cache = SchemaCache::new(Box::new(Counting { calls: 0 }));

        assert!(cache.resolve(provider, 1, 0).is_some());
        assert!(cache.resolve(provider, 1, 0).is_some());
        assert!(cache.resolve(provider, 2, 0).is_none());
        assert!(cache.resolve(provider, 2, 0).is_none());
        assert_eq!(cache.cached_entries(), 2);
    }
}
