use ordered_float::OrderedFloat;

use crate::error::RuntimeError;
use crate::meta::ScalarType;
use crate::time::EngineTime;
use crate::value::HostValue;

/// A scalar element.  Floats are wrapped so every scalar is `Eq + Hash`
/// and can key a slot space.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(OrderedFloat<f64>),
    Str(String),
    Time(EngineTime),
}

impl ScalarValue {
    pub fn default_for(ty: ScalarType) -> ScalarValue {
        match ty {
            ScalarType::Bool => ScalarValue::Bool(false),
            ScalarType::Int => ScalarValue::Int(0),
            ScalarType::Float => ScalarValue::Float(OrderedFloat(0.0)),
            ScalarType::Str => ScalarValue::Str(String::new()),
            ScalarType::Time => ScalarValue::Time(EngineTime::MIN_DT),
        }
    }

    pub fn scalar_type(&self) -> ScalarType {
        match self {
            ScalarValue::Bool(_) => ScalarType::Bool,
            ScalarValue::Int(_) => ScalarType::Int,
            ScalarValue::Float(_) => ScalarType::Float,
            ScalarValue::Str(_) => ScalarType::Str,
            ScalarValue::Time(_) => ScalarType::Time,
        }
    }

    pub fn from_host(ty: ScalarType, host: HostValue) -> Result<ScalarValue, RuntimeError> {
        match (ty, host) {
            (ScalarType::Bool, HostValue::Bool(v)) => Ok(ScalarValue::Bool(v)),
            (ScalarType::Int, HostValue::Int(v)) => Ok(ScalarValue::Int(v)),
            (ScalarType::Float, HostValue::Float(v)) => Ok(ScalarValue::Float(OrderedFloat(v))),
            (ScalarType::Float, HostValue::Int(v)) => {
                Ok(ScalarValue::Float(OrderedFloat(v as f64)))
            }
            (ScalarType::Str, HostValue::Str(v)) => Ok(ScalarValue::Str(v)),
            (ScalarType::Time, HostValue::Time(v)) => Ok(ScalarValue::Time(v)),
            (ScalarType::Time, HostValue::Int(v)) => Ok(ScalarValue::Time(EngineTime::new(
                u64::try_from(v).map_err(|_| {
                    RuntimeError::Protocol(format!("negative time value {v}"))
                })?,
            ))),
            (ty, other) => Err(RuntimeError::Protocol(format!(
                "cannot convert {other:?} to {ty} scalar"
            ))),
        }
    }

    pub fn to_host(&self) -> HostValue {
        match self {
            ScalarValue::Bool(v) => HostValue::Bool(*v),
            ScalarValue::Int(v) => HostValue::Int(*v),
            ScalarValue::Float(v) => HostValue::Float(v.0),
            ScalarValue::Str(v) => HostValue::Str(v.clone()),
            ScalarValue::Time(v) => HostValue::Time(*v),
        }
    }
}

impl std::fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalarValue::Bool(v) => write!(f, "{v}"),
            ScalarValue::Int(v) => write!(f, "{v}"),
            ScalarValue::Float(v) => write!(f, "{v}"),
            ScalarValue::Str(v) => write!(f, "{v}"),
            ScalarValue::Time(v) => write!(f, "{v}"),
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn conversion_round_trip() {
        let v = ScalarValue::from_host(ScalarType::Int, HostValue::Int(42)).unwrap();
        assert_eq!(v, ScalarValue::Int(42));
        assert_eq!(v.to_host(), HostValue::Int(42));
    }

    #[test]
    fn int_widens_to_float() {
        let v = ScalarValue::from_host(ScalarType::Float, HostValue::Int(2)).unwrap();
        assert_eq!(v, ScalarValue::Float(OrderedFloat(2.0)));
    }

    #[test]
    fn mismatch_is_protocol_error() {
        let err = ScalarValue::from_host(ScalarType::Int, HostValue::Str("x".into()));
        assert!(matches!(err, Err(RuntimeError::Protocol(_))));
    }
}
