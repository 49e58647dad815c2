//! Kind-tagged binary codec for recordable state: `[kind:u8][payload]`.
//! Decoding is meta-directed, so container policies (window capacity,
//! queue bounds, bundle schema) come from the registered [TypeMeta] and
//! the payload stays compact.

use ordered_float::OrderedFloat;
use smallvec::SmallVec;

use crate::error::RuntimeError;
use crate::meta::{ScalarType, TsKind, TypeMeta};
use crate::time::EngineTime;
use crate::value::{
    BundleValue, ListValue, MapValue, PortRef, QueueValue, RefPath, RefValue, ScalarValue,
    SetValue, Value, WindowValue,
};

/// Encodes a value tree for persistence.
pub fn to_bytes(meta: &TypeMeta, value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_value(meta, value, &mut out);
    out
}

/// Decodes a value tree; trailing bytes are a protocol error.
pub fn from_bytes(meta: &'static TypeMeta, bytes: &[u8]) -> Result<Value, RuntimeError> {
    let mut cursor = bytes;
    let value = decode_value(meta, &mut cursor)?;
    if !cursor.is_empty() {
        return Err(RuntimeError::Protocol(format!(
            "{} trailing bytes after {meta} payload",
            cursor.len()
        )));
    }
    Ok(value)
}

pub(crate) fn encode_value(meta: &TypeMeta, value: &Value, out: &mut Vec<u8>) {
    out.push(meta.kind().as_u8());
    match value {
        Value::Scalar(scalar) => encode_scalar(scalar, out),
        Value::Set(set) => {
            write_u32(out, set.len() as u32);
            for (_, key) in set.iter() {
                encode_scalar(key, out);
            }
        }
        Value::Map(map) => {
            let value_meta = meta.element().unwrap();
            write_u32(out, map.len() as u32);
            for (_, key, entry) in map.iter() {
                encode_scalar(key, out);
                encode_value(value_meta, entry, out);
            }
        }
        Value::Bundle(bundle) => {
            write_u32(out, bundle.len() as u32);
            for (ndx, field) in meta.fields().iter().enumerate() {
                encode_value(field.meta, bundle.get(ndx).unwrap(), out);
            }
        }
        Value::List(list) => {
            let element = meta.element().unwrap();
            write_u32(out, list.len() as u32);
            for item in list.iter() {
                encode_value(element, item, out);
            }
        }
        Value::Window(window) => {
            let element = meta.element().unwrap();
            write_u32(out, window.len() as u32);
            for (item, time) in window.iter() {
                encode_value(element, item, out);
                write_u64(out, time.into());
            }
        }
        Value::Queue(queue) => {
            let element = meta.element().unwrap();
            write_u32(out, queue.len() as u32);
            for item in queue.iter() {
                encode_value(element, item, out);
            }
        }
        Value::Ref(rv) => encode_ref(rv, out),
    }
}

pub(crate) fn decode_value(
    meta: &'static TypeMeta,
    cursor: &mut &[u8],
) -> Result<Value, RuntimeError> {
    let tag = read_u8(cursor)?;
    if TsKind::from_u8(tag) != Some(meta.kind()) {
        return Err(RuntimeError::Protocol(format!(
            "kind tag {tag} does not match {meta}"
        )));
    }
    Ok(match meta.kind() {
        TsKind::Scalar => Value::Scalar(decode_scalar(cursor)?),
        TsKind::Set => {
            let count = read_u32(cursor)?;
            let mut set = SetValue::new();
            for _ in 0..count {
                set.insert(decode_scalar(cursor)?);
            }
            Value::Set(set)
        }
        TsKind::Map => {
            let value_meta = meta.element().unwrap();
            let count = read_u32(cursor)?;
            let mut map = MapValue::new();
            for _ in 0..count {
                let key = decode_scalar(cursor)?;
                let value = decode_value(value_meta, cursor)?;
                map.insert(key, value);
            }
            Value::Map(map)
        }
        TsKind::Bundle => {
            let count = read_u32(cursor)? as usize;
            if count != meta.fields().len() {
                return Err(RuntimeError::Protocol(format!(
                    "bundle payload of {count} fields does not match {meta}"
                )));
            }
            let mut fields = Vec::with_capacity(count);
            for field in meta.fields() {
                fields.push(decode_value(field.meta, cursor)?);
            }
            Value::Bundle(BundleValue::new(fields))
        }
        TsKind::List => {
            let element = meta.element().unwrap();
            let count = read_u32(cursor)? as usize;
            if Some(count) != meta.list_len() {
                return Err(RuntimeError::Protocol(format!(
                    "list payload of {count} elements does not match {meta}"
                )));
            }
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_value(element, cursor)?);
            }
            Value::List(ListValue::new(items))
        }
        TsKind::Window => {
            let element = meta.element().unwrap();
            let count = read_u32(cursor)?;
            let mut window = WindowValue::new(meta.window_policy().unwrap());
            for _ in 0..count {
                let item = decode_value(element, cursor)?;
                let time = EngineTime::new(read_u64(cursor)?);
                window.push(item, time);
            }
            Value::Window(window)
        }
        TsKind::Queue => {
            let element = meta.element().unwrap();
            let count = read_u32(cursor)?;
            let mut queue = QueueValue::new(meta.queue_capacity().unwrap());
            for _ in 0..count {
                queue.push(decode_value(element, cursor)?);
            }
            Value::Queue(queue)
        }
        TsKind::Ref => Value::Ref(decode_ref(cursor)?),
    })
}

fn encode_scalar(scalar: &ScalarValue, out: &mut Vec<u8>) {
    out.push(scalar.scalar_type().as_u8());
    match scalar {
        ScalarValue::Bool(v) => out.push(*v as u8),
        ScalarValue::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
        ScalarValue::Float(v) => out.extend_from_slice(&v.0.to_le_bytes()),
        ScalarValue::Str(v) => {
            write_u32(out, v.len() as u32);
            out.extend_from_slice(v.as_bytes());
        }
        ScalarValue::Time(v) => write_u64(out, (*v).into()),
    }
}

fn decode_scalar(cursor: &mut &[u8]) -> Result<ScalarValue, RuntimeError> {
    let tag = read_u8(cursor)?;
    let ty = ScalarType::from_u8(tag)
        .ok_or_else(|| RuntimeError::Protocol(format!("bad scalar tag {tag}")))?;
    Ok(match ty {
        ScalarType::Bool => ScalarValue::Bool(read_u8(cursor)? != 0),
        ScalarType::Int => ScalarValue::Int(i64::from_le_bytes(read_array(cursor)?)),
        ScalarType::Float => {
            ScalarValue::Float(OrderedFloat(f64::from_le_bytes(read_array(cursor)?)))
        }
        ScalarType::Str => {
            let len = read_u32(cursor)? as usize;
            let bytes = read_slice(cursor, len)?;
            ScalarValue::Str(String::from_utf8(bytes.to_vec()).map_err(|_| {
                RuntimeError::Protocol("non-utf8 string payload".to_string())
            })?)
        }
        ScalarType::Time => ScalarValue::Time(EngineTime::new(read_u64(cursor)?)),
    })
}

fn encode_ref(rv: &RefValue, out: &mut Vec<u8>) {
    match rv {
        RefValue::Empty => out.push(0),
        RefValue::Peered(path) => {
            out.push(1);
            write_u64(out, path.node as u64);
            match path.port {
                PortRef::Output => out.push(0),
                PortRef::Input(input) => {
                    out.push(1);
                    write_u64(out, input as u64);
                }
            }
            write_u32(out, path.navigation.len() as u32);
            for &ndx in path.navigation.iter() {
                write_u64(out, ndx as u64);
            }
        }
        RefValue::NonPeered(children) => {
            out.push(2);
            write_u32(out, children.len() as u32);
            for child in children {
                encode_ref(child, out);
            }
        }
    }
}

fn decode_ref(cursor: &mut &[u8]) -> Result<RefValue, RuntimeError> {
    Ok(match read_u8(cursor)? {
        0 => RefValue::Empty,
        1 => {
            let node = read_u64(cursor)? as usize;
            let port = match read_u8(cursor)? {
                0 => PortRef::Output,
                1 => PortRef::Input(read_u64(cursor)? as usize),
                other => {
                    return Err(RuntimeError::Protocol(format!("bad port tag {other}")));
                }
            };
            let count = read_u32(cursor)?;
            let mut navigation = SmallVec::new();
            for _ in 0..count {
                navigation.push(read_u64(cursor)? as usize);
            }
            RefValue::Peered(RefPath {
                node,
                port,
                navigation,
            })
        }
        2 => {
            let count = read_u32(cursor)?;
            let mut children = Vec::with_capacity(count as usize);
            for _ in 0..count {
                children.push(decode_ref(cursor)?);
            }
            RefValue::NonPeered(children)
        }
        other => return Err(RuntimeError::Protocol(format!("bad ref tag {other}"))),
    })
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn read_u8(cursor: &mut &[u8]) -> Result<u8, RuntimeError> {
    let (&first, rest) = cursor
        .split_first()
        .ok_or_else(|| RuntimeError::Protocol("truncated payload".to_string()))?;
    *cursor = rest;
    Ok(first)
}

fn read_u32(cursor: &mut &[u8]) -> Result<u32, RuntimeError> {
    Ok(u32::from_le_bytes(read_array(cursor)?))
}

fn read_u64(cursor: &mut &[u8]) -> Result<u64, RuntimeError> {
    Ok(u64::from_le_bytes(read_array(cursor)?))
}

fn read_array<const N: usize>(cursor: &mut &[u8]) -> Result<[u8; N], RuntimeError> {
    let slice = read_slice(cursor, N)?;
    Ok(slice.try_into().unwrap())
}

fn read_slice<'a>(cursor: &mut &'a [u8], len: usize) -> Result<&'a [u8], RuntimeError> {
    if cursor.len() < len {
        return Err(RuntimeError::Protocol("truncated payload".to_string()));
    }
    let (head, rest) = cursor.split_at(len);
    *cursor = rest;
    Ok(head)
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::value::HostValue;

    #[test]
    fn scalar_round_trip() {
        let meta = TypeMeta::str();
        let value = (meta.ops().from_host)(meta, HostValue::Str("hello".to_string())).unwrap();
        let bytes = to_bytes(meta, &value);
        assert_eq!(bytes[0], TsKind::Scalar.as_u8());
        let back = from_bytes(meta, &bytes).unwrap();
        assert!((meta.ops().equals)(meta, &value, &back));
    }

    #[test]
    fn nested_round_trip() {
        let meta = TypeMeta::bundle(vec![
            ("tags", TypeMeta::set_of(TypeMeta::str()).unwrap()),
            (
                "counts",
                TypeMeta::map_of(TypeMeta::str(), TypeMeta::int()).unwrap(),
            ),
        ])
        .unwrap();
        let host = HostValue::Bundle(vec![
            (
                "tags".to_string(),
                HostValue::Set(vec![HostValue::Str("a".into()), HostValue::Str("b".into())]),
            ),
            (
                "counts".to_string(),
                HostValue::Map(vec![(HostValue::Str("a".into()), HostValue::Int(3))]),
            ),
        ]);
        let value = (meta.ops().from_host)(meta, host).unwrap();
        let back = from_bytes(meta, &to_bytes(meta, &value)).unwrap();
        assert!((meta.ops().equals)(meta, &value, &back));
    }

    #[test]
    fn window_round_trip_keeps_timestamps() {
        let meta = TypeMeta::window_of(TypeMeta::int(), crate::meta::WindowPolicy::Fixed(4));
        let mut window = WindowValue::new(meta.window_policy().unwrap());
        window.push(Value::Scalar(ScalarValue::Int(1)), EngineTime::new(10));
        window.push(Value::Scalar(ScalarValue::Int(2)), EngineTime::new(20));
        let value = Value::Window(window);
        let back = from_bytes(meta, &to_bytes(meta, &value)).unwrap();
        assert!((meta.ops().equals)(meta, &value, &back));
    }

    #[test]
    fn ref_round_trip() {
        let meta = TypeMeta::ref_to(TypeMeta::int());
        let value = Value::Ref(RefValue::NonPeered(vec![
            RefValue::Empty,
            RefValue::Peered(RefPath::output(3).navigate(1)),
        ]));
        let back = from_bytes(meta, &to_bytes(meta, &value)).unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn truncation_is_a_protocol_error() {
        let meta = TypeMeta::int();
        let value = Value::Scalar(ScalarValue::Int(7));
        let bytes = to_bytes(meta, &value);
        let err = from_bytes(meta, &bytes[..bytes.len() - 1]);
        assert!(matches!(err, Err(RuntimeError::Protocol(_))));
    }
}
