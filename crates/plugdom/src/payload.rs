//! # Payload Contract
//!
//! Every value crossing the isolation boundary must be plain data. Guest
//! references (`funcref`, `externref` and the GC reference kinds) name
//! objects inside one store and mean nothing on the other side, so they are
//! refused before a call is dispatched. Remote objects cross as handle ids,
//! which are plain `i32` values resolved by the invoker.

use wasmtime::Val;
use wasmtime::ValType;

use crate::error::Error;
use crate::error::Result;

/// The wire-safe value kinds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scalar {
    I32,
    I64,
    F32,
    F64,
    V128,
}

impl Scalar {
    /// Maps a wasm value type onto the payload contract.
    pub fn of(ty: &ValType) -> Option<Scalar> {
        match ty {
            ValType::I32 => Some(Self::I32),
            ValType::I64 => Some(Self::I64),
            ValType::F32 => Some(Self::F32),
            ValType::F64 => Some(Self::F64),
            ValType::V128 => Some(Self::V128),
            _ => None,
        }
    }

    /// Whether every type in `types` maps exactly onto `expected`.
    pub(crate) fn matches(types: impl ExactSizeIterator<Item = ValType>, expected: &[Scalar]) -> bool {
        types.len() == expected.len()
            && types.zip(expected).all(|(ty, want)| Scalar::of(&ty) == Some(*want))
    }
}

/// A plain, serializable value.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    V128(u128),
}

impl Value {
    pub fn scalar(&self) -> Scalar {
        match self {
            Self::I32(_) => Scalar::I32,
            Self::I64(_) => Scalar::I64,
            Self::F32(_) => Scalar::F32,
            Self::F64(_) => Scalar::F64,
            Self::V128(_) => Scalar::V128,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn into_val(self) -> Val {
        match self {
            Self::I32(v) => Val::I32(v),
            Self::I64(v) => Val::I64(v),
            Self::F32(v) => Val::F32(v.to_bits()),
            Self::F64(v) => Val::F64(v.to_bits()),
            Self::V128(v) => Val::V128(v.into()),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::F32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

/// Validates that a wasm value is pure data and lifts it into the contract.
pub fn check_wire_safe(val: &Val) -> Result<Value> {
    match val {
        Val::I32(v) => Ok(Value::I32(*v)),
        Val::I64(v) => Ok(Value::I64(*v)),
        Val::F32(bits) => Ok(Value::F32(f32::from_bits(*bits))),
        Val::F64(bits) => Ok(Value::F64(f64::from_bits(*bits))),
        Val::V128(v) => Ok(Value::V128(v.as_u128())),
        Val::FuncRef(_) => Err(Error::Serialization(
            "function references cannot cross the isolation boundary".into(),
        )),
        Val::ExternRef(_) => Err(Error::Serialization(
            "extern references cannot cross the isolation boundary".into(),
        )),
        _ => Err(Error::Serialization(
            "reference values cannot cross the isolation boundary".into(),
        )),
    }
}

/// Validates a whole argument or result list.
pub fn check_all(vals: &[Val]) -> Result<Vec<Value>> {
    vals.iter().map(check_wire_safe).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars_are_wire_safe() {
        assert_eq!(check_wire_safe(&Val::I32(-3)).unwrap(), Value::I32(-3));
        assert_eq!(check_wire_safe(&Val::I64(1 << 40)).unwrap(), Value::I64(1 << 40));
        assert_eq!(check_wire_safe(&Val::F32(1.5f32.to_bits())).unwrap(), Value::F32(1.5));
        assert_eq!(check_wire_safe(&Val::F64(2.25f64.to_bits())).unwrap(), Value::F64(2.25));
    }

    #[test]
    fn test_references_are_refused() {
        assert!(matches!(check_wire_safe(&Val::FuncRef(None)), Err(Error::Serialization(_))));
        assert!(matches!(check_wire_safe(&Val::ExternRef(None)), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_check_all_fails_on_first_bad_value() {
        let err = check_all(&[Val::I32(1), Val::ExternRef(None), Val::I32(2)]).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_value_lowering() {
        assert!(matches!(Value::from(9).into_val(), Val::I32(9)));
        assert_eq!(check_wire_safe(&Value::F64(0.5).into_val()).unwrap(), Value::F64(0.5));
    }

    #[test]
    fn test_signature_matching() {
        let params = vec![ValType::I32, ValType::I32];
        assert!(Scalar::matches(params.clone().into_iter(), &[Scalar::I32, Scalar::I32]));
        assert!(!Scalar::matches(params.clone().into_iter(), &[Scalar::I32]));
        assert!(!Scalar::matches(params.into_iter(), &[Scalar::I32, Scalar::I64]));
    }
}
