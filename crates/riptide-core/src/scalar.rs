//! Variable types and scalar payloads
//!
//! Textual type designators are resolved into a closed [`VarType`] when a
//! variable is registered; nothing downstream compares type strings. The
//! platform-default vector forms (`vec`, `ivec`, `uivec`) carry two
//! components in 2D contexts and four (xyz plus padding) in 3D ones.

use crate::error::{Error, Result};
use std::fmt;

/// Element kind of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemKind {
    /// 32-bit signed integer components
    Int,
    /// 32-bit unsigned integer components
    Uint,
    /// 32-bit float components
    Float,
}

impl fmt::Display for ElemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElemKind::Int => write!(f, "int"),
            ElemKind::Uint => write!(f, "unsigned int"),
            ElemKind::Float => write!(f, "float"),
        }
    }
}

/// Resolved variable type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarType {
    /// Per-component kind
    pub kind: ElemKind,
    /// Component count (1 for plain scalars, 2-4 for vector forms)
    pub components: usize,
    /// Whether the designator carried the array suffix `*`
    pub is_array: bool,
}

impl VarType {
    /// Parse a textual designator. `dims` selects the platform-default
    /// vector width (2 in 2D, 4 in 3D).
    pub fn parse(designator: &str, dims: usize) -> Result<Self> {
        let trimmed = designator.trim();
        let (body, is_array) = match trimmed.strip_suffix('*') {
            Some(body) => (body.trim(), true),
            None => (trimmed, false),
        };
        let body = if body == "unsigned int" { "uint" } else { body };

        let (base, suffix) = match body.as_bytes().last() {
            Some(b'2') => (&body[..body.len() - 1], 2usize),
            Some(b'3') => (&body[..body.len() - 1], 3),
            Some(b'4') => (&body[..body.len() - 1], 4),
            _ => (body, 0),
        };

        let default_n = if dims == 3 { 4 } else { 2 };
        let (kind, components) = match base {
            "int" => (ElemKind::Int, suffix.max(1)),
            "uint" => (ElemKind::Uint, suffix.max(1)),
            "float" => (ElemKind::Float, suffix.max(1)),
            "ivec" => (ElemKind::Int, if suffix == 0 { default_n } else { suffix }),
            "uivec" => (ElemKind::Uint, if suffix == 0 { default_n } else { suffix }),
            "vec" => (ElemKind::Float, if suffix == 0 { default_n } else { suffix }),
            _ => return Err(Error::UnknownType(designator.to_string())),
        };

        Ok(Self {
            kind,
            components,
            is_array,
        })
    }

    /// Per-element footprint in bytes
    pub fn bytes(&self) -> usize {
        4 * self.components
    }

    /// The same type without the array marker
    pub fn element(&self) -> Self {
        Self {
            is_array: false,
            ..*self
        }
    }

    /// Canonical designator text (what kernels receive as `-DT=...`)
    pub fn designator(&self) -> String {
        let base = match (self.kind, self.components) {
            (ElemKind::Int, 1) => "int".to_string(),
            (ElemKind::Uint, 1) => "unsigned int".to_string(),
            (ElemKind::Float, 1) => "float".to_string(),
            (ElemKind::Int, n) => format!("ivec{n}"),
            (ElemKind::Uint, n) => format!("uivec{n}"),
            (ElemKind::Float, n) => format!("vec{n}"),
        };
        if self.is_array {
            format!("{base}*")
        } else {
            base
        }
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.designator())
    }
}

/// Map a type designator to its per-element footprint
pub fn type_to_bytes(designator: &str, dims: usize) -> Result<usize> {
    VarType::parse(designator, dims).map(|ty| ty.bytes())
}

/// Map a type designator to its component count
pub fn type_to_components(designator: &str, dims: usize) -> Result<usize> {
    VarType::parse(designator, dims).map(|ty| ty.components)
}

/// Inline payload of a scalar variable
///
/// Vector variants carry a fixed backing array plus the live component
/// count, keeping the representation a closed set over the recognized
/// element kinds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    Int(i32),
    Uint(u32),
    Float(f32),
    IVec([i32; 4], usize),
    UIVec([u32; 4], usize),
    FVec([f32; 4], usize),
}

impl ScalarValue {
    /// Zero value of a type
    pub fn zero(ty: VarType) -> Self {
        match (ty.kind, ty.components) {
            (ElemKind::Int, 1) => ScalarValue::Int(0),
            (ElemKind::Uint, 1) => ScalarValue::Uint(0),
            (ElemKind::Float, 1) => ScalarValue::Float(0.0),
            (ElemKind::Int, n) => ScalarValue::IVec([0; 4], n),
            (ElemKind::Uint, n) => ScalarValue::UIVec([0; 4], n),
            (ElemKind::Float, n) => ScalarValue::FVec([0.0; 4], n),
        }
    }

    /// Build from an evaluated number, broadcasting over vector components
    pub fn from_f64(ty: VarType, value: f64) -> Self {
        match (ty.kind, ty.components) {
            (ElemKind::Int, 1) => ScalarValue::Int(value as i32),
            (ElemKind::Uint, 1) => ScalarValue::Uint(value as u32),
            (ElemKind::Float, 1) => ScalarValue::Float(value as f32),
            (ElemKind::Int, n) => ScalarValue::IVec([value as i32; 4], n),
            (ElemKind::Uint, n) => ScalarValue::UIVec([value as u32; 4], n),
            (ElemKind::Float, n) => ScalarValue::FVec([value as f32; 4], n),
        }
    }

    /// Decode from device bytes
    pub fn from_bytes(ty: VarType, bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ty.bytes() {
            return Err(Error::bad_var_type(
                "<bytes>",
                ty.designator(),
                format!("{} bytes", bytes.len()),
            ));
        }
        let word = |i: usize| u32::from_ne_bytes([bytes[4 * i], bytes[4 * i + 1], bytes[4 * i + 2], bytes[4 * i + 3]]);
        let n = ty.components;
        Ok(match (ty.kind, n) {
            (ElemKind::Int, 1) => ScalarValue::Int(word(0) as i32),
            (ElemKind::Uint, 1) => ScalarValue::Uint(word(0)),
            (ElemKind::Float, 1) => ScalarValue::Float(f32::from_bits(word(0))),
            (ElemKind::Int, _) => {
                let mut data = [0i32; 4];
                for (i, slot) in data.iter_mut().take(n).enumerate() {
                    *slot = word(i) as i32;
                }
                ScalarValue::IVec(data, n)
            }
            (ElemKind::Uint, _) => {
                let mut data = [0u32; 4];
                for (i, slot) in data.iter_mut().take(n).enumerate() {
                    *slot = word(i);
                }
                ScalarValue::UIVec(data, n)
            }
            (ElemKind::Float, _) => {
                let mut data = [0f32; 4];
                for (i, slot) in data.iter_mut().take(n).enumerate() {
                    *slot = f32::from_bits(word(i));
                }
                ScalarValue::FVec(data, n)
            }
        })
    }

    /// Encode to device bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ScalarValue::Int(v) => v.to_ne_bytes().to_vec(),
            ScalarValue::Uint(v) => v.to_ne_bytes().to_vec(),
            ScalarValue::Float(v) => v.to_ne_bytes().to_vec(),
            ScalarValue::IVec(data, n) => data[..*n].iter().flat_map(|v| v.to_ne_bytes()).collect(),
            ScalarValue::UIVec(data, n) => data[..*n].iter().flat_map(|v| v.to_ne_bytes()).collect(),
            ScalarValue::FVec(data, n) => data[..*n].iter().flat_map(|v| v.to_ne_bytes()).collect(),
        }
    }

    /// Component count
    pub fn components(&self) -> usize {
        match self {
            ScalarValue::Int(_) | ScalarValue::Uint(_) | ScalarValue::Float(_) => 1,
            ScalarValue::IVec(_, n) | ScalarValue::UIVec(_, n) | ScalarValue::FVec(_, n) => *n,
        }
    }

    /// Component as a number
    pub fn component(&self, index: usize) -> f64 {
        match self {
            ScalarValue::Int(v) => *v as f64,
            ScalarValue::Uint(v) => *v as f64,
            ScalarValue::Float(v) => *v as f64,
            ScalarValue::IVec(data, _) => data[index] as f64,
            ScalarValue::UIVec(data, _) => data[index] as f64,
            ScalarValue::FVec(data, _) => data[index] as f64,
        }
    }

    /// Single-component value as a number; `None` for vectors
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Int(v) => Some(*v as f64),
            ScalarValue::Uint(v) => Some(*v as f64),
            ScalarValue::Float(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Unsigned single-component accessor
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            ScalarValue::Uint(v) => Some(*v),
            ScalarValue::Int(v) if *v >= 0 => Some(*v as u32),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join<T: fmt::Display>(f: &mut fmt::Formatter<'_>, data: &[T]) -> fmt::Result {
            write!(f, "(")?;
            for (i, v) in data.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{v}")?;
            }
            write!(f, ")")
        }
        match self {
            ScalarValue::Int(v) => write!(f, "{v}"),
            ScalarValue::Uint(v) => write!(f, "{v}"),
            ScalarValue::Float(v) => write!(f, "{v}"),
            ScalarValue::IVec(data, n) => join(f, &data[..*n]),
            ScalarValue::UIVec(data, n) => join(f, &data[..*n]),
            ScalarValue::FVec(data, n) => join(f, &data[..*n]),
        }
    }
}
