use crate::time::EngineTime;
use crate::value::RefValue;

/// Host-idiomatic representation of a value crossing the surface-language
/// boundary.  `Null` is the mark-invalid signal.  `Remove`,
/// `RemoveIfExists` and `Removed(..)` are the delta sentinels; the
/// delta-apply routine recognises them and routes to remove-tracking.
#[derive(Clone, Debug, PartialEq)]
pub enum HostValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Time(EngineTime),
    List(Vec<HostValue>),
    Set(Vec<HostValue>),
    Map(Vec<(HostValue, HostValue)>),
    Bundle(Vec<(String, HostValue)>),
    Ref(RefValue),
    /// Map-delta sentinel: remove the key; missing key is a protocol error.
    Remove,
    /// Map-delta sentinel: remove the key if present.
    RemoveIfExists,
    /// Set-delta sentinel: the wrapped element was removed.
    Removed(Box<HostValue>),
}

impl HostValue {
    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            HostValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            HostValue::Float(v) => Some(*v),
            HostValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<EngineTime> {
        match self {
            HostValue::Time(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[HostValue]> {
        match self {
            HostValue::List(v) | HostValue::Set(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(HostValue, HostValue)]> {
        match self {
            HostValue::Map(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        HostValue::Bool(v)
    }
}

impl From<i64> for HostValue {
    fn from(v: i64) -> Self {
        HostValue::Int(v)
    }
}

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        HostValue::Float(v)
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        HostValue::Str(v.to_string())
    }
}

impl From<String> for HostValue {
    fn from(v: String) -> Self {
        HostValue::Str(v)
    }
}

impl From<EngineTime> for HostValue {
    fn from(v: EngineTime) -> Self {
        HostValue::Time(v)
    }
}

impl std::fmt::Display for HostValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostValue::Null => write!(f, "null"),
            HostValue::Bool(v) => write!(f, "{v}"),
            HostValue::Int(v) => write!(f, "{v}"),
            HostValue::Float(v) => write!(f, "{v}"),
            HostValue::Str(v) => write!(f, "{v}"),
            HostValue::Time(v) => write!(f, "{v}"),
            HostValue::List(items) | HostValue::Set(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            HostValue::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{k}:{v}")?;
                }
                write!(f, "}}")
            }
            HostValue::Bundle(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{k}:{v}")?;
                }
                write!(f, "}}")
            }
            HostValue::Ref(rv) => write!(f, "{rv:?}"),
            HostValue::Remove => write!(f, "<remove>"),
            HostValue::RemoveIfExists => write!(f, "<remove-if-exists>"),
            HostValue::Removed(inner) => write!(f, "<removed {inner}>"),
        }
    }
}
