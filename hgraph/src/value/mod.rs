//! Type-erased value containers.  A [Value] is interpreted through a
//! [TypeMeta](crate::meta::TypeMeta); the kinds form a sealed set and
//! per-element operations dispatch through the meta's vtable.

mod bundle;
mod host;
mod list;
mod queue;
mod reference;
mod scalar;
mod slots;
mod window;

pub use bundle::BundleValue;
pub use host::HostValue;
pub use list::ListValue;
pub use queue::QueueValue;
pub use reference::{PortRef, RefPath, RefValue};
pub use scalar::ScalarValue;
pub use slots::{MapValue, SetValue, SlotSpace};
pub use window::WindowValue;

use crate::meta::TsKind;

/// An owned, type-erased value.  Views borrow from it; collection kinds
/// maintain stable slot spaces with end-of-tick freelist advance.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Scalar(ScalarValue),
    Set(SetValue),
    Map(MapValue),
    Bundle(BundleValue),
    List(ListValue),
    Window(WindowValue),
    Queue(QueueValue),
    Ref(RefValue),
}

impl Value {
    pub fn kind(&self) -> TsKind {
        match self {
            Value::Scalar(_) => TsKind::Scalar,
            Value::Set(_) => TsKind::Set,
            Value::Map(_) => TsKind::Map,
            Value::Bundle(_) => TsKind::Bundle,
            Value::List(_) => TsKind::List,
            Value::Window(_) => TsKind::Window,
            Value::Queue(_) => TsKind::Queue,
            Value::Ref(_) => TsKind::Ref,
        }
    }

    pub fn as_scalar(&self) -> Option<&ScalarValue> {
        match self {
            Value::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&SetValue> {
        match self {
            Value::Set(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_set_mut(&mut self) -> Option<&mut SetValue> {
        match self {
            Value::Set(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match self {
            Value::Map(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut MapValue> {
        match self {
            Value::Map(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bundle(&self) -> Option<&BundleValue> {
        match self {
            Value::Bundle(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bundle_mut(&mut self) -> Option<&mut BundleValue> {
        match self {
            Value::Bundle(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ListValue> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut ListValue> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_window(&self) -> Option<&WindowValue> {
        match self {
            Value::Window(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_window_mut(&mut self) -> Option<&mut WindowValue> {
        match self {
            Value::Window(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_queue(&self) -> Option<&QueueValue> {
        match self {
            Value::Queue(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_queue_mut(&mut self) -> Option<&mut QueueValue> {
        match self {
            Value::Queue(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ref_value(&self) -> Option<&RefValue> {
        match self {
            Value::Ref(v) => Some(v),
            _ => None,
        }
    }

    /// Navigate a chain of bundle-field / list-element indices.
    pub fn navigate(&self, nav: &[usize]) -> Option<&Value> {
        let mut value = self;
        for &ndx in nav {
            value = match value {
                Value::Bundle(bundle) => bundle.get(ndx)?,
                Value::List(list) => list.get(ndx)?,
                _ => return None,
            };
        }
        Some(value)
    }

    /// End-of-tick housekeeping: advance slot freelists, drop quarantined
    /// storage and evicted window elements.
    pub(crate) fn end_tick(&mut self) {
        match self {
            Value::Scalar(_) | Value::Ref(_) | Value::Queue(_) => {}
            Value::Set(v) => v.end_tick(),
            Value::Map(v) => v.end_tick(),
            Value::Bundle(v) => v.end_tick(),
            Value::List(v) => v.end_tick(),
            Value::Window(v) => v.end_tick(),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Scalar(v) => write!(f, "{v}"),
            Value::Set(v) => {
                write!(f, "{{")?;
                for (i, (_, key)) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{key}")?;
                }
                write!(f, "}}")
            }
            Value::Map(v) => {
                write!(f, "{{")?;
                for (i, (_, key, value)) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{key}:{value}")?;
                }
                write!(f, "}}")
            }
            Value::Bundle(v) => {
                write!(f, "(")?;
                for (i, field) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, ")")
            }
            Value::List(v) => {
                write!(f, "[")?;
                for (i, item) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Window(v) => {
                write!(f, "[")?;
                for (i, (item, time)) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}@{time}")?;
                }
                write!(f, "]")
            }
            Value::Queue(v) => {
                write!(f, "[")?;
                for (i, item) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Ref(v) => write!(f, "{v:?}"),
        }
    }
}
