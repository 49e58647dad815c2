//! The per-kind operations table.  One static [TypeOps] instance exists
//! per [TsKind]; a [TypeMeta](super::TypeMeta) points at the table for its
//! kind and the functions recurse through component metas for nested
//! shapes.

use std::hash::{Hash, Hasher};

use super::{TsKind, TypeMeta};
use crate::error::RuntimeError;
use crate::record;
use crate::time::EngineTime;
use crate::tracker::ModificationTracker;
use crate::value::{
    BundleValue, HostValue, ListValue, MapValue, QueueValue, ScalarValue, SetValue, Value,
    WindowValue,
};

/// Operations that vary per concrete value shape.  Construct/clone/drop
/// map onto Rust `Default`-style construction, `Clone` and `Drop`; the
/// table keeps the operations that need meta-directed dispatch.
#[derive(Debug)]
pub struct TypeOps {
    pub construct: fn(&'static TypeMeta) -> Value,
    pub equals: fn(&TypeMeta, &Value, &Value) -> bool,
    pub hash: fn(&TypeMeta, &Value, &mut dyn Hasher),
    pub to_bytes: fn(&TypeMeta, &Value, &mut Vec<u8>),
    pub from_bytes: fn(&'static TypeMeta, &mut &[u8]) -> Result<Value, RuntimeError>,
    pub to_host: fn(&TypeMeta, &Value) -> HostValue,
    pub from_host: fn(&'static TypeMeta, HostValue) -> Result<Value, RuntimeError>,
    pub apply_host: fn(
        &'static TypeMeta,
        &mut Value,
        &mut ModificationTracker,
        HostValue,
        EngineTime,
    ) -> Result<(), RuntimeError>,
    pub to_string: fn(&TypeMeta, &Value) -> String,
}

pub(super) fn ops_for(kind: TsKind) -> &'static TypeOps {
    match kind {
        TsKind::Scalar => &SCALAR_OPS,
        TsKind::Set => &SET_OPS,
        TsKind::Map => &MAP_OPS,
        TsKind::Bundle => &BUNDLE_OPS,
        TsKind::List => &LIST_OPS,
        TsKind::Window => &WINDOW_OPS,
        TsKind::Queue => &QUEUE_OPS,
        TsKind::Ref => &REF_OPS,
    }
}

fn mismatch(meta: &TypeMeta, host: &HostValue) -> RuntimeError {
    RuntimeError::Protocol(format!("cannot apply {host:?} to output of type {meta}"))
}

fn diag(meta: &TypeMeta, value: &Value) -> String {
    let _ = meta;
    format!("{value}")
}

// ---------------------------------------------------------------- scalar

static SCALAR_OPS: TypeOps = TypeOps {
    construct: scalar_construct,
    equals: scalar_equals,
    hash: scalar_hash,
    to_bytes: record::encode_value,
    from_bytes: record::decode_value,
    to_host: scalar_to_host,
    from_host: scalar_from_host,
    apply_host: scalar_apply,
    to_string: diag,
};

fn scalar_construct(meta: &'static TypeMeta) -> Value {
    Value::Scalar(ScalarValue::default_for(meta.scalar_type().unwrap()))
}

fn scalar_equals(_meta: &TypeMeta, a: &Value, b: &Value) -> bool {
    a.as_scalar() == b.as_scalar()
}

fn scalar_hash(_meta: &TypeMeta, value: &Value, state: &mut dyn Hasher) {
    let mut state = state;
    value.as_scalar().unwrap().hash(&mut state);
}

fn scalar_to_host(_meta: &TypeMeta, value: &Value) -> HostValue {
    value.as_scalar().unwrap().to_host()
}

fn scalar_from_host(meta: &'static TypeMeta, host: HostValue) -> Result<Value, RuntimeError> {
    Ok(Value::Scalar(ScalarValue::from_host(
        meta.scalar_type().unwrap(),
        host,
    )?))
}

fn scalar_apply(
    meta: &'static TypeMeta,
    value: &mut Value,
    tracker: &mut ModificationTracker,
    host: HostValue,
    time: EngineTime,
) -> Result<(), RuntimeError> {
    let scalar = ScalarValue::from_host(meta.scalar_type().unwrap(), host)?;
    tracker.mark_modified(time)?;
    *value = Value::Scalar(scalar);
    Ok(())
}

// ------------------------------------------------------------------- set

static SET_OPS: TypeOps = TypeOps {
    construct: set_construct,
    equals: set_equals,
    hash: unhashable,
    to_bytes: record::encode_value,
    from_bytes: record::decode_value,
    to_host: set_to_host,
    from_host: set_from_host,
    apply_host: set_apply,
    to_string: diag,
};

fn unhashable(meta: &TypeMeta, _value: &Value, _state: &mut dyn Hasher) {
    debug_assert!(false, "{meta} is not hashable");
}

fn set_construct(_meta: &'static TypeMeta) -> Value {
    Value::Set(SetValue::new())
}

fn set_equals(_meta: &TypeMeta, a: &Value, b: &Value) -> bool {
    let (a, b) = (a.as_set().unwrap(), b.as_set().unwrap());
    a.len() == b.len() && a.iter().all(|(_, key)| b.contains(key))
}

fn set_to_host(_meta: &TypeMeta, value: &Value) -> HostValue {
    HostValue::Set(
        value
            .as_set()
            .unwrap()
            .iter()
            .map(|(_, key)| key.to_host())
            .collect(),
    )
}

fn set_from_host(meta: &'static TypeMeta, host: HostValue) -> Result<Value, RuntimeError> {
    let element = meta.element().unwrap().scalar_type().unwrap();
    let items = match host {
        HostValue::Set(items) | HostValue::List(items) => items,
        other => return Err(mismatch(meta, &other)),
    };
    let mut set = SetValue::new();
    for item in items {
        set.insert(ScalarValue::from_host(element, item)?);
    }
    Ok(Value::Set(set))
}

fn set_apply(
    meta: &'static TypeMeta,
    value: &mut Value,
    tracker: &mut ModificationTracker,
    host: HostValue,
    time: EngineTime,
) -> Result<(), RuntimeError> {
    let element = meta.element().unwrap().scalar_type().unwrap();
    let items = match host {
        HostValue::Set(items) | HostValue::List(items) => items,
        scalar @ (HostValue::Bool(_)
        | HostValue::Int(_)
        | HostValue::Float(_)
        | HostValue::Str(_)
        | HostValue::Time(_)
        | HostValue::Removed(_)) => vec![scalar],
        other => return Err(mismatch(meta, &other)),
    };
    tracker.mark_modified(time)?;
    let set = value.as_set_mut().unwrap();
    let slots = tracker.slots_mut();
    for item in items {
        match item {
            HostValue::Removed(inner) => {
                let key = ScalarValue::from_host(element, *inner)?;
                if let Some(slot) = set.remove(&key) {
                    slots.record_remove(slot, time);
                }
            }
            other => {
                let key = ScalarValue::from_host(element, other)?;
                let (slot, added) = set.insert(key);
                if added {
                    slots.record_add(slot, time);
                }
            }
        }
    }
    Ok(())
}

// ------------------------------------------------------------------- map

static MAP_OPS: TypeOps = TypeOps {
    construct: map_construct,
    equals: map_equals,
    hash: unhashable,
    to_bytes: record::encode_value,
    from_bytes: record::decode_value,
    to_host: map_to_host,
    from_host: map_from_host,
    apply_host: map_apply,
    to_string: diag,
};

fn map_construct(_meta: &'static TypeMeta) -> Value {
    Value::Map(MapValue::new())
}

fn map_equals(meta: &TypeMeta, a: &Value, b: &Value) -> bool {
    let value_meta = meta.element().unwrap();
    let (a, b) = (a.as_map().unwrap(), b.as_map().unwrap());
    a.len() == b.len()
        && a.iter().all(|(_, key, value)| {
            b.get(key)
                .is_some_and(|other| (value_meta.ops().equals)(value_meta, value, other))
        })
}

fn map_to_host(meta: &TypeMeta, value: &Value) -> HostValue {
    let value_meta = meta.element().unwrap();
    HostValue::Map(
        value
            .as_map()
            .unwrap()
            .iter()
            .map(|(_, key, value)| (key.to_host(), (value_meta.ops().to_host)(value_meta, value)))
            .collect(),
    )
}

fn map_from_host(meta: &'static TypeMeta, host: HostValue) -> Result<Value, RuntimeError> {
    let key_ty = meta.key_meta().unwrap().scalar_type().unwrap();
    let value_meta = meta.element().unwrap();
    let entries = match host {
        HostValue::Map(entries) => entries,
        other => return Err(mismatch(meta, &other)),
    };
    let mut map = MapValue::new();
    for (k, v) in entries {
        let key = ScalarValue::from_host(key_ty, k)?;
        let value = (value_meta.ops().from_host)(value_meta, v)?;
        map.insert(key, value);
    }
    Ok(Value::Map(map))
}

fn map_apply(
    meta: &'static TypeMeta,
    value: &mut Value,
    tracker: &mut ModificationTracker,
    host: HostValue,
    time: EngineTime,
) -> Result<(), RuntimeError> {
    let key_ty = meta.key_meta().unwrap().scalar_type().unwrap();
    let value_meta = meta.element().unwrap();
    let entries = match host {
        HostValue::Map(entries) => entries,
        other => return Err(mismatch(meta, &other)),
    };
    tracker.mark_modified(time)?;
    let map = value.as_map_mut().unwrap();
    let slots = tracker.slots_mut();
    for (k, v) in entries {
        let key = ScalarValue::from_host(key_ty, k)?;
        match v {
            HostValue::Remove => match map.remove(&key) {
                Some(slot) => slots.record_remove(slot, time),
                None => {
                    return Err(RuntimeError::Protocol(format!(
                        "REMOVE of missing key {key} from {meta}"
                    )));
                }
            },
            HostValue::RemoveIfExists => {
                if let Some(slot) = map.remove(&key) {
                    slots.record_remove(slot, time);
                }
            }
            other => {
                let converted = (value_meta.ops().from_host)(value_meta, other)?;
                let existed = map.contains(&key);
                let (slot, _) = map.insert(key, converted);
                if existed {
                    slots.record_update(slot, time);
                } else {
                    slots.record_add(slot, time);
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------- bundle

static BUNDLE_OPS: TypeOps = TypeOps {
    construct: bundle_construct,
    equals: bundle_equals,
    hash: bundle_hash,
    to_bytes: record::encode_value,
    from_bytes: record::decode_value,
    to_host: bundle_to_host,
    from_host: bundle_from_host,
    apply_host: bundle_apply,
    to_string: diag,
};

fn bundle_construct(meta: &'static TypeMeta) -> Value {
    Value::Bundle(BundleValue::new(
        meta.fields()
            .iter()
            .map(|field| (field.meta.ops().construct)(field.meta))
            .collect(),
    ))
}

fn bundle_equals(meta: &TypeMeta, a: &Value, b: &Value) -> bool {
    let (a, b) = (a.as_bundle().unwrap(), b.as_bundle().unwrap());
    meta.fields().iter().enumerate().all(|(i, field)| {
        (field.meta.ops().equals)(field.meta, a.get(i).unwrap(), b.get(i).unwrap())
    })
}

fn bundle_hash(meta: &TypeMeta, value: &Value, state: &mut dyn Hasher) {
    let bundle = value.as_bundle().unwrap();
    for (i, field) in meta.fields().iter().enumerate() {
        (field.meta.ops().hash)(field.meta, bundle.get(i).unwrap(), state);
    }
}

fn bundle_to_host(meta: &TypeMeta, value: &Value) -> HostValue {
    let bundle = value.as_bundle().unwrap();
    HostValue::Bundle(
        meta.fields()
            .iter()
            .enumerate()
            .map(|(i, field)| {
                (
                    field.name.clone(),
                    (field.meta.ops().to_host)(field.meta, bundle.get(i).unwrap()),
                )
            })
            .collect(),
    )
}

fn bundle_from_host(meta: &'static TypeMeta, host: HostValue) -> Result<Value, RuntimeError> {
    let mut value = bundle_construct(meta);
    let mut tracker = ModificationTracker::new(meta);
    bundle_apply(meta, &mut value, &mut tracker, host, EngineTime::MIN_DT)?;
    Ok(value)
}

fn bundle_apply(
    meta: &'static TypeMeta,
    value: &mut Value,
    tracker: &mut ModificationTracker,
    host: HostValue,
    time: EngineTime,
) -> Result<(), RuntimeError> {
    // (field index, host value) pairs from either named or positional form
    let entries: Vec<(usize, HostValue)> = match host {
        HostValue::Bundle(named) => named
            .into_iter()
            .map(|(name, v)| {
                meta.field_index(&name)
                    .map(|i| (i, v))
                    .ok_or_else(|| RuntimeError::Protocol(format!("no field {name} in {meta}")))
            })
            .collect::<Result<_, _>>()?,
        HostValue::List(items) => {
            if items.len() != meta.fields().len() {
                return Err(RuntimeError::Protocol(format!(
                    "positional bundle of {} values applied to {meta}",
                    items.len()
                )));
            }
            items.into_iter().enumerate().collect()
        }
        other => return Err(mismatch(meta, &other)),
    };
    tracker.mark_modified(time)?;
    let bundle = value.as_bundle_mut().unwrap();
    for (ndx, v) in entries {
        let field_meta = meta.fields()[ndx].meta;
        let field_value = bundle.get_mut(ndx).unwrap();
        let field_tracker = tracker.field_mut(ndx);
        (field_meta.ops().apply_host)(field_meta, field_value, field_tracker, v, time)?;
    }
    Ok(())
}

// ------------------------------------------------------------------ list

static LIST_OPS: TypeOps = TypeOps {
    construct: list_construct,
    equals: list_equals,
    hash: list_hash,
    to_bytes: record::encode_value,
    from_bytes: record::decode_value,
    to_host: list_to_host,
    from_host: list_from_host,
    apply_host: list_apply,
    to_string: diag,
};

fn list_construct(meta: &'static TypeMeta) -> Value {
    let element = meta.element().unwrap();
    let len = meta.list_len().unwrap();
    Value::List(ListValue::new(
        (0..len).map(|_| (element.ops().construct)(element)).collect(),
    ))
}

fn list_equals(meta: &TypeMeta, a: &Value, b: &Value) -> bool {
    let element = meta.element().unwrap();
    let (a, b) = (a.as_list().unwrap(), b.as_list().unwrap());
    a.iter()
        .zip(b.iter())
        .all(|(x, y)| (element.ops().equals)(element, x, y))
}

fn list_hash(meta: &TypeMeta, value: &Value, state: &mut dyn Hasher) {
    let element = meta.element().unwrap();
    for item in value.as_list().unwrap().iter() {
        (element.ops().hash)(element, item, state);
    }
}

fn list_to_host(meta: &TypeMeta, value: &Value) -> HostValue {
    let element = meta.element().unwrap();
    HostValue::List(
        value
            .as_list()
            .unwrap()
            .iter()
            .map(|item| (element.ops().to_host)(element, item))
            .collect(),
    )
}

fn list_from_host(meta: &'static TypeMeta, host: HostValue) -> Result<Value, RuntimeError> {
    let mut value = list_construct(meta);
    let mut tracker = ModificationTracker::new(meta);
    list_apply(meta, &mut value, &mut tracker, host, EngineTime::MIN_DT)?;
    Ok(value)
}

fn list_apply(
    meta: &'static TypeMeta,
    value: &mut Value,
    tracker: &mut ModificationTracker,
    host: HostValue,
    time: EngineTime,
) -> Result<(), RuntimeError> {
    let element = meta.element().unwrap();
    let len = meta.list_len().unwrap();
    // full assignment marks every index; a map keyed by Int updates
    // sparsely and keeps the modified-index delta meaningful
    let entries: Vec<(usize, HostValue)> = match host {
        HostValue::List(items) => {
            if items.len() != len {
                return Err(RuntimeError::Protocol(format!(
                    "list of {} values applied to {meta}",
                    items.len()
                )));
            }
            items.into_iter().enumerate().collect()
        }
        HostValue::Map(entries) => entries
            .into_iter()
            .map(|(k, v)| match k {
                HostValue::Int(i) if (i as usize) < len && i >= 0 => Ok((i as usize, v)),
                other => Err(RuntimeError::Protocol(format!(
                    "bad list index {other:?} for {meta}"
                ))),
            })
            .collect::<Result<_, _>>()?,
        other => return Err(mismatch(meta, &other)),
    };
    tracker.mark_modified(time)?;
    let list = value.as_list_mut().unwrap();
    for (ndx, v) in entries {
        *list.get_mut(ndx).unwrap() = (element.ops().from_host)(element, v)?;
        tracker.mark_element(ndx, time);
    }
    Ok(())
}

// ---------------------------------------------------------------- window

static WINDOW_OPS: TypeOps = TypeOps {
    construct: window_construct,
    equals: window_equals,
    hash: unhashable,
    to_bytes: record::encode_value,
    from_bytes: record::decode_value,
    to_host: window_to_host,
    from_host: window_from_host,
    apply_host: window_apply,
    to_string: diag,
};

fn window_construct(meta: &'static TypeMeta) -> Value {
    Value::Window(WindowValue::new(meta.window_policy().unwrap()))
}

// compares values and timestamps; see DESIGN.md on window equality
fn window_equals(meta: &TypeMeta, a: &Value, b: &Value) -> bool {
    let element = meta.element().unwrap();
    let (a, b) = (a.as_window().unwrap(), b.as_window().unwrap());
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|((av, at), (bv, bt))| at == bt && (element.ops().equals)(element, av, bv))
}

fn window_to_host(meta: &TypeMeta, value: &Value) -> HostValue {
    let element = meta.element().unwrap();
    HostValue::List(
        value
            .as_window()
            .unwrap()
            .iter()
            .map(|(item, _)| (element.ops().to_host)(element, item))
            .collect(),
    )
}

fn window_from_host(meta: &'static TypeMeta, host: HostValue) -> Result<Value, RuntimeError> {
    let element = meta.element().unwrap();
    let items = match host {
        HostValue::List(items) => items,
        other => return Err(mismatch(meta, &other)),
    };
    let mut window = WindowValue::new(meta.window_policy().unwrap());
    for item in items {
        window.push((element.ops().from_host)(element, item)?, EngineTime::MIN_DT);
    }
    Ok(Value::Window(window))
}

fn window_apply(
    meta: &'static TypeMeta,
    value: &mut Value,
    tracker: &mut ModificationTracker,
    host: HostValue,
    time: EngineTime,
) -> Result<(), RuntimeError> {
    let element = meta.element().unwrap();
    let items = match host {
        HostValue::List(items) => items,
        single => vec![single],
    };
    tracker.mark_modified(time)?;
    let window = value.as_window_mut().unwrap();
    let wt = tracker.window_mut();
    for item in items {
        let evicted = window.push((element.ops().from_host)(element, item)?, time);
        wt.pushed += 1;
        if evicted {
            wt.evicted = true;
        }
    }
    Ok(())
}

// ----------------------------------------------------------------- queue

static QUEUE_OPS: TypeOps = TypeOps {
    construct: queue_construct,
    equals: queue_equals,
    hash: unhashable,
    to_bytes: record::encode_value,
    from_bytes: record::decode_value,
    to_host: queue_to_host,
    from_host: queue_from_host,
    apply_host: queue_apply,
    to_string: diag,
};

fn queue_construct(meta: &'static TypeMeta) -> Value {
    Value::Queue(QueueValue::new(meta.queue_capacity().unwrap()))
}

fn queue_equals(meta: &TypeMeta, a: &Value, b: &Value) -> bool {
    let element = meta.element().unwrap();
    let (a, b) = (a.as_queue().unwrap(), b.as_queue().unwrap());
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| (element.ops().equals)(element, x, y))
}

fn queue_to_host(meta: &TypeMeta, value: &Value) -> HostValue {
    let element = meta.element().unwrap();
    HostValue::List(
        value
            .as_queue()
            .unwrap()
            .iter()
            .map(|item| (element.ops().to_host)(element, item))
            .collect(),
    )
}

fn queue_from_host(meta: &'static TypeMeta, host: HostValue) -> Result<Value, RuntimeError> {
    let element = meta.element().unwrap();
    let items = match host {
        HostValue::List(items) => items,
        other => return Err(mismatch(meta, &other)),
    };
    let mut queue = QueueValue::new(meta.queue_capacity().unwrap());
    for item in items {
        queue.push((element.ops().from_host)(element, item)?);
    }
    Ok(Value::Queue(queue))
}

fn queue_apply(
    meta: &'static TypeMeta,
    value: &mut Value,
    tracker: &mut ModificationTracker,
    host: HostValue,
    time: EngineTime,
) -> Result<(), RuntimeError> {
    let element = meta.element().unwrap();
    let items = match host {
        HostValue::List(items) => items,
        single => vec![single],
    };
    tracker.mark_modified(time)?;
    let queue = value.as_queue_mut().unwrap();
    for item in items {
        queue.push((element.ops().from_host)(element, item)?);
    }
    Ok(())
}

// ------------------------------------------------------------------- ref

static REF_OPS: TypeOps = TypeOps {
    construct: ref_construct,
    equals: ref_equals,
    hash: ref_hash,
    to_bytes: record::encode_value,
    from_bytes: record::decode_value,
    to_host: ref_to_host,
    from_host: ref_from_host,
    apply_host: ref_apply,
    to_string: diag,
};

fn ref_construct(_meta: &'static TypeMeta) -> Value {
    Value::Ref(crate::value::RefValue::Empty)
}

fn ref_equals(_meta: &TypeMeta, a: &Value, b: &Value) -> bool {
    a.as_ref_value() == b.as_ref_value()
}

fn ref_hash(_meta: &TypeMeta, value: &Value, state: &mut dyn Hasher) {
    let mut state = state;
    value.as_ref_value().unwrap().hash(&mut state);
}

fn ref_to_host(_meta: &TypeMeta, value: &Value) -> HostValue {
    HostValue::Ref(value.as_ref_value().unwrap().clone())
}

fn ref_from_host(meta: &'static TypeMeta, host: HostValue) -> Result<Value, RuntimeError> {
    match host {
        HostValue::Ref(rv) => Ok(Value::Ref(rv)),
        other => Err(mismatch(meta, &other)),
    }
}

fn ref_apply(
    meta: &'static TypeMeta,
    value: &mut Value,
    tracker: &mut ModificationTracker,
    host: HostValue,
    time: EngineTime,
) -> Result<(), RuntimeError> {
    let rv = match host {
        HostValue::Ref(rv) => rv,
        other => return Err(mismatch(meta, &other)),
    };
    tracker.mark_modified(time)?;
    tracker.ref_mut().rebind_time = time;
    *value = Value::Ref(rv);
    Ok(())
}
