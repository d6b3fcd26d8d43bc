// value.rs — Typed port values
//
// The supported element types form a closed set: f32, f64, i32 and bool, one
// per `PortType`. Arithmetic on values goes through f64, then each result is
// stored back at its port's precision, which is exactly what the compiled
// kernels do as well.

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::layout::PortType;

/// One of the four supported element types.
pub trait Element:
    Copy + PartialEq + Debug + Default + Serialize + DeserializeOwned + 'static
{
    const PORT_TYPE: PortType;

    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
    fn wrap(values: Vec<Self>) -> PortValue;
    fn unwrap(value: &PortValue) -> Option<&[Self]>;
}

impl Element for f32 {
    const PORT_TYPE: PortType = PortType::Real32;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn wrap(values: Vec<Self>) -> PortValue {
        PortValue::Real32(values)
    }

    fn unwrap(value: &PortValue) -> Option<&[Self]> {
        match value {
            PortValue::Real32(v) => Some(v),
            _ => None,
        }
    }
}

impl Element for f64 {
    const PORT_TYPE: PortType = PortType::Real64;

    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(value: f64) -> Self {
        value
    }

    fn wrap(values: Vec<Self>) -> PortValue {
        PortValue::Real64(values)
    }

    fn unwrap(value: &PortValue) -> Option<&[Self]> {
        match value {
            PortValue::Real64(v) => Some(v),
            _ => None,
        }
    }
}

impl Element for i32 {
    const PORT_TYPE: PortType = PortType::Integer;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as i32
    }

    fn wrap(values: Vec<Self>) -> PortValue {
        PortValue::Integer(values)
    }

    fn unwrap(value: &PortValue) -> Option<&[Self]> {
        match value {
            PortValue::Integer(v) => Some(v),
            _ => None,
        }
    }
}

impl Element for bool {
    const PORT_TYPE: PortType = PortType::Boolean;

    fn to_f64(self) -> f64 {
        if self {
            1.0
        } else {
            0.0
        }
    }

    fn from_f64(value: f64) -> Self {
        value != 0.0
    }

    fn wrap(values: Vec<Self>) -> PortValue {
        PortValue::Boolean(values)
    }

    fn unwrap(value: &PortValue) -> Option<&[Self]> {
        match value {
            PortValue::Boolean(v) => Some(v),
            _ => None,
        }
    }
}

/// A flat buffer of one element type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "lowercase")]
pub enum PortValue {
    Real32(Vec<f32>),
    Real64(Vec<f64>),
    Integer(Vec<i32>),
    Boolean(Vec<bool>),
}

impl PortValue {
    pub fn port_type(&self) -> PortType {
        match self {
            PortValue::Real32(_) => PortType::Real32,
            PortValue::Real64(_) => PortType::Real64,
            PortValue::Integer(_) => PortType::Integer,
            PortValue::Boolean(_) => PortType::Boolean,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PortValue::Real32(v) => v.len(),
            PortValue::Real64(v) => v.len(),
            PortValue::Integer(v) => v.len(),
            PortValue::Boolean(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Typed view, if this value holds `T`.
    pub fn values<T: Element>(&self) -> Option<&[T]> {
        T::unwrap(self)
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            PortValue::Real32(v) => v.iter().map(|x| x.to_f64()).collect(),
            PortValue::Real64(v) => v.clone(),
            PortValue::Integer(v) => v.iter().map(|x| x.to_f64()).collect(),
            PortValue::Boolean(v) => v.iter().map(|x| x.to_f64()).collect(),
        }
    }

    /// Build a value of `port_type` from f64 data, converting each element.
    pub fn from_f64(port_type: PortType, data: &[f64]) -> Self {
        fn conv<T: Element>(data: &[f64]) -> PortValue {
            T::wrap(data.iter().map(|&x| T::from_f64(x)).collect())
        }
        match port_type {
            PortType::Real32 => conv::<f32>(data),
            PortType::Real64 => conv::<f64>(data),
            PortType::Integer => conv::<i32>(data),
            PortType::Boolean => conv::<bool>(data),
        }
    }

    pub fn zeros(port_type: PortType, len: usize) -> Self {
        PortValue::from_f64(port_type, &vec![0.0; len])
    }
}

impl<T: Element> From<Vec<T>> for PortValue {
    fn from(values: Vec<T>) -> Self {
        T::wrap(values)
    }
}
