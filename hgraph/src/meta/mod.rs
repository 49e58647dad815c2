//! Canonicalised, immutable type descriptors for every time-series value
//! shape.  A [TypeMeta] is registered once per structural description and
//! shared by `&'static` pointer for the life of the process, so equality
//! is pointer equality.

mod ops;

pub use ops::TypeOps;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use strum_macros::Display;

use crate::error::RuntimeError;

/// The sealed set of time-series value kinds.
#[derive(Display, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TsKind {
    Scalar = 0,
    Set = 1,
    Map = 2,
    Bundle = 3,
    List = 4,
    Window = 5,
    Queue = 6,
    Ref = 7,
}

impl TsKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        use TsKind::*;
        Some(match tag {
            0 => Scalar,
            1 => Set,
            2 => Map,
            3 => Bundle,
            4 => List,
            5 => Window,
            6 => Queue,
            7 => Ref,
            _ => return None,
        })
    }
}

/// The closed universe of scalar element types.
#[derive(Display, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Bool = 0,
    Int = 1,
    Float = 2,
    Str = 3,
    Time = 4,
}

impl ScalarType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        use ScalarType::*;
        Some(match tag {
            0 => Bool,
            1 => Int,
            2 => Float,
            3 => Str,
            4 => Time,
            _ => return None,
        })
    }
}

/// Capability flags derived at registration.
#[derive(Clone, Copy, Debug, Default)]
pub struct CapabilityFlags {
    pub equatable: bool,
    pub comparable: bool,
    pub hashable: bool,
    pub container: bool,
}

/// Eviction policy of a window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WindowPolicy {
    /// Keep the last `n` elements.
    Fixed(usize),
    /// Keep elements younger than the period, relative to the newest
    /// timestamp.
    Period(Duration),
}

/// A named, typed bundle field.
#[derive(Debug)]
pub struct FieldMeta {
    pub name: String,
    pub meta: &'static TypeMeta,
}

/// Kind-specific payload of a [TypeMeta].
#[derive(Debug)]
pub enum MetaPayload {
    Scalar(ScalarType),
    Set {
        element: &'static TypeMeta,
    },
    Map {
        key: &'static TypeMeta,
        value: &'static TypeMeta,
    },
    Bundle {
        fields: Vec<FieldMeta>,
        by_name: IndexMap<String, usize>,
    },
    List {
        element: &'static TypeMeta,
        len: usize,
    },
    Window {
        element: &'static TypeMeta,
        policy: WindowPolicy,
    },
    Queue {
        element: &'static TypeMeta,
        capacity: Option<usize>,
    },
    Ref {
        target: &'static TypeMeta,
    },
}

/// Immutable descriptor of a value shape plus its operations table.
#[derive(Debug)]
pub struct TypeMeta {
    kind: TsKind,
    flags: CapabilityFlags,
    payload: MetaPayload,
    ops: &'static TypeOps,
}

impl PartialEq for TypeMeta {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for TypeMeta {}

impl std::fmt::Display for TypeMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.payload {
            MetaPayload::Scalar(ty) => write!(f, "{ty}"),
            MetaPayload::Set { element } => write!(f, "set<{element}>"),
            MetaPayload::Map { key, value } => write!(f, "map<{key},{value}>"),
            MetaPayload::Bundle { fields, .. } => {
                write!(f, "bundle{{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}:{}", field.name, field.meta)?;
                }
                write!(f, "}}")
            }
            MetaPayload::List { element, len } => write!(f, "list<{element};{len}>"),
            MetaPayload::Window { element, policy } => match policy {
                WindowPolicy::Fixed(n) => write!(f, "window<{element};{n}>"),
                WindowPolicy::Period(d) => write!(f, "window<{element};{d:?}>"),
            },
            MetaPayload::Queue { element, capacity } => match capacity {
                Some(n) => write!(f, "queue<{element};{n}>"),
                None => write!(f, "queue<{element}>"),
            },
            MetaPayload::Ref { target } => write!(f, "ref<{target}>"),
        }
    }
}

/// Structural key used to canonicalise registrations.  Component metas
/// are already canonical so their addresses identify them.
#[derive(Clone, PartialEq, Eq, Hash)]
enum TypeDesc {
    Scalar(ScalarType),
    Set(usize),
    Map(usize, usize),
    Bundle(Vec<(String, usize)>),
    List(usize, usize),
    Window(usize, WindowPolicy),
    Queue(usize, Option<usize>),
    Ref(usize),
}

static REGISTRY: Lazy<Mutex<HashMap<TypeDesc, &'static TypeMeta>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn addr(meta: &'static TypeMeta) -> usize {
    meta as *const TypeMeta as usize
}

fn canonicalise(desc: TypeDesc, build: impl FnOnce() -> TypeMeta) -> &'static TypeMeta {
    let mut registry = REGISTRY.lock().unwrap();
    *registry
        .entry(desc)
        .or_insert_with(|| Box::leak(Box::new(build())))
}

impl TypeMeta {
    pub fn scalar(ty: ScalarType) -> &'static TypeMeta {
        canonicalise(TypeDesc::Scalar(ty), || TypeMeta {
            kind: TsKind::Scalar,
            flags: CapabilityFlags {
                equatable: true,
                comparable: true,
                hashable: true,
                container: false,
            },
            payload: MetaPayload::Scalar(ty),
            ops: ops::ops_for(TsKind::Scalar),
        })
    }

    pub fn bool() -> &'static TypeMeta {
        Self::scalar(ScalarType::Bool)
    }

    pub fn int() -> &'static TypeMeta {
        Self::scalar(ScalarType::Int)
    }

    pub fn float() -> &'static TypeMeta {
        Self::scalar(ScalarType::Float)
    }

    pub fn str() -> &'static TypeMeta {
        Self::scalar(ScalarType::Str)
    }

    pub fn time() -> &'static TypeMeta {
        Self::scalar(ScalarType::Time)
    }

    /// Set elements key a stable slot space, so they must be hashable
    /// scalars.
    pub fn set_of(element: &'static TypeMeta) -> Result<&'static TypeMeta, RuntimeError> {
        if element.kind != TsKind::Scalar || !element.flags.hashable {
            return Err(RuntimeError::Wiring(format!(
                "set element must be a hashable scalar, got {element}"
            )));
        }
        Ok(canonicalise(TypeDesc::Set(addr(element)), || TypeMeta {
            kind: TsKind::Set,
            flags: CapabilityFlags {
                equatable: true,
                comparable: false,
                hashable: false,
                container: true,
            },
            payload: MetaPayload::Set { element },
            ops: ops::ops_for(TsKind::Set),
        }))
    }

    pub fn map_of(
        key: &'static TypeMeta,
        value: &'static TypeMeta,
    ) -> Result<&'static TypeMeta, RuntimeError> {
        if key.kind != TsKind::Scalar || !key.flags.hashable {
            return Err(RuntimeError::Wiring(format!(
                "map key must be a hashable scalar, got {key}"
            )));
        }
        Ok(canonicalise(
            TypeDesc::Map(addr(key), addr(value)),
            || TypeMeta {
                kind: TsKind::Map,
                flags: CapabilityFlags {
                    equatable: value.flags.equatable,
                    comparable: false,
                    hashable: false,
                    container: true,
                },
                payload: MetaPayload::Map { key, value },
                ops: ops::ops_for(TsKind::Map),
            },
        ))
    }

    pub fn bundle(
        fields: Vec<(&str, &'static TypeMeta)>,
    ) -> Result<&'static TypeMeta, RuntimeError> {
        let mut by_name = IndexMap::new();
        for (i, (name, _)) in fields.iter().enumerate() {
            if by_name.insert(name.to_string(), i).is_some() {
                return Err(RuntimeError::Wiring(format!(
                    "duplicate bundle field {name}"
                )));
            }
        }
        let desc = TypeDesc::Bundle(
            fields
                .iter()
                .map(|(name, meta)| (name.to_string(), addr(meta)))
                .collect(),
        );
        Ok(canonicalise(desc, || TypeMeta {
            kind: TsKind::Bundle,
            flags: CapabilityFlags {
                equatable: fields.iter().all(|(_, m)| m.flags.equatable),
                comparable: false,
                hashable: fields.iter().all(|(_, m)| m.flags.hashable),
                container: true,
            },
            payload: MetaPayload::Bundle {
                fields: fields
                    .into_iter()
                    .map(|(name, meta)| FieldMeta {
                        name: name.to_string(),
                        meta,
                    })
                    .collect(),
                by_name,
            },
            ops: ops::ops_for(TsKind::Bundle),
        }))
    }

    pub fn list_of(element: &'static TypeMeta, len: usize) -> &'static TypeMeta {
        canonicalise(TypeDesc::List(addr(element), len), || TypeMeta {
            kind: TsKind::List,
            flags: CapabilityFlags {
                equatable: element.flags.equatable,
                comparable: false,
                hashable: element.flags.hashable,
                container: true,
            },
            payload: MetaPayload::List { element, len },
            ops: ops::ops_for(TsKind::List),
        })
    }

    pub fn window_of(element: &'static TypeMeta, policy: WindowPolicy) -> &'static TypeMeta {
        canonicalise(TypeDesc::Window(addr(element), policy), || TypeMeta {
            kind: TsKind::Window,
            flags: CapabilityFlags {
                equatable: element.flags.equatable,
                comparable: false,
                hashable: false,
                container: true,
            },
            payload: MetaPayload::Window { element, policy },
            ops: ops::ops_for(TsKind::Window),
        })
    }

    pub fn queue_of(element: &'static TypeMeta, capacity: Option<usize>) -> &'static TypeMeta {
        canonicalise(TypeDesc::Queue(addr(element), capacity), || TypeMeta {
            kind: TsKind::Queue,
            flags: CapabilityFlags {
                equatable: element.flags.equatable,
                comparable: false,
                hashable: false,
                container: true,
            },
            payload: MetaPayload::Queue { element, capacity },
            ops: ops::ops_for(TsKind::Queue),
        })
    }

    pub fn ref_to(target: &'static TypeMeta) -> &'static TypeMeta {
        canonicalise(TypeDesc::Ref(addr(target)), || TypeMeta {
            kind: TsKind::Ref,
            flags: CapabilityFlags {
                equatable: true,
                comparable: false,
                hashable: true,
                container: false,
            },
            payload: MetaPayload::Ref { target },
            ops: ops::ops_for(TsKind::Ref),
        })
    }

    pub fn kind(&self) -> TsKind {
        self.kind
    }

    pub fn flags(&self) -> CapabilityFlags {
        self.flags
    }

    pub fn payload(&self) -> &MetaPayload {
        &self.payload
    }

    pub fn ops(&self) -> &'static TypeOps {
        self.ops
    }

    pub fn scalar_type(&self) -> Option<ScalarType> {
        match self.payload {
            MetaPayload::Scalar(ty) => Some(ty),
            _ => None,
        }
    }

    /// Element meta of set/list/window/queue, value meta of map.
    pub fn element(&self) -> Option<&'static TypeMeta> {
        match self.payload {
            MetaPayload::Set { element }
            | MetaPayload::List { element, .. }
            | MetaPayload::Window { element, .. }
            | MetaPayload::Queue { element, .. } => Some(element),
            MetaPayload::Map { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn key_meta(&self) -> Option<&'static TypeMeta> {
        match self.payload {
            MetaPayload::Map { key, .. } => Some(key),
            MetaPayload::Set { element } => Some(element),
            _ => None,
        }
    }

    pub fn fields(&self) -> &[FieldMeta] {
        match &self.payload {
            MetaPayload::Bundle { fields, .. } => fields,
            _ => &[],
        }
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        match &self.payload {
            MetaPayload::Bundle { by_name, .. } => by_name.get(name).copied(),
            _ => None,
        }
    }

    pub fn list_len(&self) -> Option<usize> {
        match self.payload {
            MetaPayload::List { len, .. } => Some(len),
            _ => None,
        }
    }

    pub fn window_policy(&self) -> Option<WindowPolicy> {
        match self.payload {
            MetaPayload::Window { policy, .. } => Some(policy),
            _ => None,
        }
    }

    pub fn queue_capacity(&self) -> Option<Option<usize>> {
        match self.payload {
            MetaPayload::Queue { capacity, .. } => Some(capacity),
            _ => None,
        }
    }

    pub fn ref_target(&self) -> Option<&'static TypeMeta> {
        match self.payload {
            MetaPayload::Ref { target } => Some(target),
            _ => None,
        }
    }

    /// Navigate a chain of bundle-field / list-element indices.
    pub fn navigate(&'static self, nav: &[usize]) -> Result<&'static TypeMeta, RuntimeError> {
        let mut meta = self;
        for &ndx in nav {
            meta = match &meta.payload {
                MetaPayload::Bundle { fields, .. } => fields
                    .get(ndx)
                    .map(|f| f.meta)
                    .ok_or_else(|| RuntimeError::Wiring(format!("no field {ndx} in {meta}")))?,
                MetaPayload::List { element, len } => {
                    if ndx >= *len {
                        return Err(RuntimeError::Wiring(format!(
                            "index {ndx} out of bounds for {meta}"
                        )));
                    }
                    *element
                }
                _ => {
                    return Err(RuntimeError::Wiring(format!("cannot navigate into {meta}")));
                }
            };
        }
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn canonical_by_pointer() {
        let a = TypeMeta::set_of(TypeMeta::int()).unwrap();
        let b = TypeMeta::set_of(TypeMeta::int()).unwrap();
        assert!(std::ptr::eq(a, b));
        assert_eq!(a, b);
        let c = TypeMeta::set_of(TypeMeta::str()).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn bundle_field_lookup() {
        let meta = TypeMeta::bundle(vec![("px", TypeMeta::float()), ("qty", TypeMeta::int())])
            .unwrap();
        assert_eq!(meta.field_index("qty"), Some(1));
        assert_eq!(meta.field_index("nope"), None);
        assert_eq!(meta.fields().len(), 2);
    }

    #[test]
    fn set_element_must_be_hashable_scalar() {
        let inner = TypeMeta::set_of(TypeMeta::int()).unwrap();
        assert!(TypeMeta::set_of(inner).is_err());
        assert!(TypeMeta::map_of(inner, TypeMeta::int()).is_err());
    }

    #[test]
    fn navigation() {
        let bundle = TypeMeta::bundle(vec![
            ("a", TypeMeta::int()),
            ("b", TypeMeta::list_of(TypeMeta::float(), 3)),
        ])
        .unwrap();
        assert_eq!(bundle.navigate(&[0]).unwrap(), TypeMeta::int());
        assert_eq!(bundle.navigate(&[1, 2]).unwrap(), TypeMeta::float());
        assert!(bundle.navigate(&[2]).is_err());
        assert!(bundle.navigate(&[1, 3]).is_err());
    }

    #[test]
    fn display() {
        let meta = TypeMeta::map_of(TypeMeta::str(), TypeMeta::int()).unwrap();
        assert_eq!(meta.to_string(), "map<Str,Int>");
    }
}
