//! FFI Type System
//!
//! Describes the shape of values crossing the native boundary and the host
//! representation of those values.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::error::{FfiError, FfiResult};

/// Scalar kinds copied by bit representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// C `bool`, one byte
    Bool,
    /// Pointer-sized opaque address
    Pointer,
}

impl PrimitiveKind {
    /// Get the size in bytes of this kind
    pub fn size(self) -> usize {
        match self {
            PrimitiveKind::I8 | PrimitiveKind::U8 | PrimitiveKind::Bool => 1,
            PrimitiveKind::I16 | PrimitiveKind::U16 => 2,
            PrimitiveKind::I32 | PrimitiveKind::U32 | PrimitiveKind::F32 => 4,
            PrimitiveKind::I64 | PrimitiveKind::U64 | PrimitiveKind::F64 => 8,
            PrimitiveKind::Pointer => std::mem::size_of::<usize>(),
        }
    }

    /// Check if this kind is an integer kind
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            PrimitiveKind::I8
                | PrimitiveKind::U8
                | PrimitiveKind::I16
                | PrimitiveKind::U16
                | PrimitiveKind::I32
                | PrimitiveKind::U32
                | PrimitiveKind::I64
                | PrimitiveKind::U64
        )
    }

    /// Check if this kind is a floating point kind
    pub fn is_float(self) -> bool {
        matches!(self, PrimitiveKind::F32 | PrimitiveKind::F64)
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            PrimitiveKind::I8 | PrimitiveKind::I16 | PrimitiveKind::I32 | PrimitiveKind::I64
        )
    }
}

impl FromStr for PrimitiveKind {
    type Err = FfiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_lowercase().as_str() {
            "u8" | "uint8" | "uint8_t" | "byte" => PrimitiveKind::U8,
            "u16" | "uint16" | "uint16_t" => PrimitiveKind::U16,
            "u32" | "uint32" | "uint32_t" | "uint" => PrimitiveKind::U32,
            "u64" | "uint64" | "uint64_t" | "ulong" => PrimitiveKind::U64,
            "i8" | "int8" | "int8_t" | "char" => PrimitiveKind::I8,
            "i16" | "int16" | "int16_t" | "short" => PrimitiveKind::I16,
            "i32" | "int32" | "int32_t" | "int" => PrimitiveKind::I32,
            "i64" | "int64" | "int64_t" | "long" => PrimitiveKind::I64,
            "f32" | "float" => PrimitiveKind::F32,
            "f64" | "double" => PrimitiveKind::F64,
            "bool" | "boolean" => PrimitiveKind::Bool,
            "ptr" | "pointer" | "void*" => PrimitiveKind::Pointer,
            other => return Err(FfiError::marshal(format!("unknown type '{}'", other))),
        };
        Ok(kind)
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrimitiveKind::I8 => "i8",
            PrimitiveKind::U8 => "u8",
            PrimitiveKind::I16 => "i16",
            PrimitiveKind::U16 => "u16",
            PrimitiveKind::I32 => "i32",
            PrimitiveKind::U32 => "u32",
            PrimitiveKind::I64 => "i64",
            PrimitiveKind::U64 => "u64",
            PrimitiveKind::F32 => "f32",
            PrimitiveKind::F64 => "f64",
            PrimitiveKind::Bool => "bool",
            PrimitiveKind::Pointer => "ptr",
        };
        f.write_str(name)
    }
}

/// A named member of a record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    pub name: String,
    pub ty: TypeDescriptor,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: TypeDescriptor) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Shape of one value in native memory.
///
/// Layouts are densely packed: a record's size is the sum of its field sizes
/// and each field starts where the previous one ends. Arrays are
/// `length * element size` with elements at `index * element size`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDescriptor {
    Primitive(PrimitiveKind),
    /// Bounded character buffer of `max_bytes`
    FixedText(usize),
    Record(Vec<Field>),
    FixedArray {
        element: Box<TypeDescriptor>,
        length: usize,
    },
}

impl TypeDescriptor {
    pub fn primitive(kind: PrimitiveKind) -> Self {
        TypeDescriptor::Primitive(kind)
    }

    pub fn text(max_bytes: usize) -> Self {
        TypeDescriptor::FixedText(max_bytes)
    }

    pub fn record<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, TypeDescriptor)>,
        S: Into<String>,
    {
        TypeDescriptor::Record(
            fields
                .into_iter()
                .map(|(name, ty)| Field::new(name, ty))
                .collect(),
        )
    }

    pub fn array(element: TypeDescriptor, length: usize) -> Self {
        TypeDescriptor::FixedArray {
            element: Box::new(element),
            length,
        }
    }

    /// Size in bytes of the native image. Saturates for descriptors too
    /// large to address; see [`TypeDescriptor::checked_size`].
    pub fn size(&self) -> usize {
        self.checked_size().unwrap_or(usize::MAX)
    }

    /// Size in bytes, or `None` if it overflows `usize`
    pub fn checked_size(&self) -> Option<usize> {
        match self {
            TypeDescriptor::Primitive(kind) => Some(kind.size()),
            TypeDescriptor::FixedText(max) => Some(*max),
            TypeDescriptor::Record(fields) => fields
                .iter()
                .try_fold(0usize, |acc, f| acc.checked_add(f.ty.checked_size()?)),
            TypeDescriptor::FixedArray { element, length } => {
                element.checked_size()?.checked_mul(*length)
            }
        }
    }

    /// Byte offset of every field, in declaration order. Empty for non-records.
    pub fn field_offsets(&self) -> Vec<usize> {
        match self {
            TypeDescriptor::Record(fields) => {
                let mut offset: usize = 0;
                fields
                    .iter()
                    .map(|f| {
                        let at = offset;
                        offset = offset.saturating_add(f.ty.size());
                        at
                    })
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    /// Offset of a named field
    pub fn offset_of(&self, name: &str) -> Option<usize> {
        match self {
            TypeDescriptor::Record(fields) => {
                let idx = fields.iter().position(|f| f.name == name)?;
                self.field_offsets().get(idx).copied()
            }
            _ => None,
        }
    }

    /// Primitives travel by value; everything else by pointer to a native image
    pub fn is_by_value(&self) -> bool {
        matches!(self, TypeDescriptor::Primitive(_))
    }

    /// Parse a type string.
    ///
    /// Accepts primitive aliases, `text[N]`, names from `named`, and any of
    /// those followed by one or more `[N]` array suffixes.
    pub fn parse(s: &str, named: &HashMap<String, TypeDescriptor>) -> FfiResult<Self> {
        let ty = Self::parse_unchecked(s, named)?;
        if ty.checked_size().is_none() {
            return Err(FfiError::marshal(format!("type '{}' is too large", s.trim())));
        }
        Ok(ty)
    }

    fn parse_unchecked(s: &str, named: &HashMap<String, TypeDescriptor>) -> FfiResult<Self> {
        let s = s.trim();
        if let Some(open) = s.rfind('[') {
            let close = s
                .strip_suffix(']')
                .ok_or_else(|| FfiError::marshal(format!("malformed type '{}'", s)))?;
            let n: usize = close[open + 1..]
                .trim()
                .parse()
                .map_err(|_| FfiError::marshal(format!("bad length in type '{}'", s)))?;
            let base = s[..open].trim();
            if base.eq_ignore_ascii_case("text") || base.eq_ignore_ascii_case("string") {
                return Ok(TypeDescriptor::FixedText(n));
            }
            return Ok(TypeDescriptor::array(Self::parse_unchecked(base, named)?, n));
        }
        if let Some(ty) = named.get(s) {
            return Ok(ty.clone());
        }
        Ok(TypeDescriptor::Primitive(s.parse()?))
    }
}

impl From<PrimitiveKind> for TypeDescriptor {
    fn from(kind: PrimitiveKind) -> Self {
        TypeDescriptor::Primitive(kind)
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDescriptor::Primitive(kind) => write!(f, "{}", kind),
            TypeDescriptor::FixedText(n) => write!(f, "text[{}]", n),
            TypeDescriptor::Record(fields) => {
                write!(f, "{{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", field.name, field.ty)?;
                }
                write!(f, "}}")
            }
            TypeDescriptor::FixedArray { element, length } => write!(f, "{}[{}]", element, length),
        }
    }
}

/// Native calling convention tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallingConvention {
    #[default]
    Cdecl,
    Stdcall,
    /// Platform default for system libraries
    System,
}

impl FromStr for CallingConvention {
    type Err = FfiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "c" | "cdecl" => Ok(CallingConvention::Cdecl),
            "stdcall" | "winapi" => Ok(CallingConvention::Stdcall),
            "system" => Ok(CallingConvention::System),
            other => Err(FfiError::marshal(format!(
                "unknown calling convention '{}'",
                other
            ))),
        }
    }
}

/// Return and parameter shapes of a native function.
///
/// Equality is structural, which makes signatures usable as cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionSignature {
    pub params: Vec<TypeDescriptor>,
    /// `None` is `void`
    pub returns: Option<TypeDescriptor>,
}

impl FunctionSignature {
    pub fn new(params: Vec<TypeDescriptor>, returns: Option<TypeDescriptor>) -> Self {
        Self { params, returns }
    }

    pub fn void(params: Vec<TypeDescriptor>) -> Self {
        Self::new(params, None)
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Parse a C-style declaration: `"return_type name(type, type, ...)"`.
    ///
    /// Parameter names after the type are ignored.
    pub fn parse_decl(decl: &str) -> FfiResult<(String, Self)> {
        let bad = || FfiError::marshal(format!("malformed declaration '{}'", decl));
        let decl = decl.trim();
        let paren = decl.find('(').ok_or_else(bad)?;
        let head = decl[..paren].trim();
        let inner = decl[paren + 1..]
            .trim_end()
            .strip_suffix(')')
            .ok_or_else(bad)?;

        let (ret, name) = head.rsplit_once(char::is_whitespace).ok_or_else(bad)?;
        let none = HashMap::new();
        let returns = match ret.trim() {
            "void" => None,
            other => Some(TypeDescriptor::parse(other, &none)?),
        };

        let mut params = Vec::new();
        for param in inner.split(',') {
            let param = param.trim();
            if param.is_empty() || param == "void" {
                continue;
            }
            let ty = param.split_whitespace().next().ok_or_else(bad)?;
            params.push(TypeDescriptor::parse(ty, &none)?);
        }

        Ok((name.trim().to_string(), Self { params, returns }))
    }
}

impl fmt::Display for FunctionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.returns {
            Some(ty) => write!(f, "{} (", ty)?,
            None => write!(f, "void (")?,
        }
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", param)?;
        }
        write!(f, ")")
    }
}

/// A host-side value passed to or returned from native code
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// No value
    Void,
    /// Signed integer kinds
    Int(i64),
    /// Unsigned integer kinds
    UInt(u64),
    Float(f64),
    Bool(bool),
    Pointer(usize),
    /// Host text for a `FixedText` descriptor
    Text(String),
    /// Fields in declaration order
    Record(Vec<(String, Value)>),
    Array(Vec<Value>),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn record<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        Value::Record(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Look up a record field by name
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Record(fields) => fields.iter().find(|(k, _)| k == name).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    /// Short name of the variant, for error messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Pointer(_) => "pointer",
            Value::Text(_) => "text",
            Value::Record(_) => "record",
            Value::Array(_) => "array",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arrays_and_text() {
        let none = HashMap::new();
        assert_eq!(
            TypeDescriptor::parse("text[12]", &none).unwrap(),
            TypeDescriptor::FixedText(12)
        );
        let grid = TypeDescriptor::parse("i16[3][2]", &none).unwrap();
        assert_eq!(grid.size(), 2 * 3 * 2);
    }

    #[test]
    fn test_oversized_types_are_rejected() {
        let none = HashMap::new();
        assert!(matches!(
            TypeDescriptor::parse("i64[4611686018427387904]", &none),
            Err(FfiError::MarshalingFailure(_))
        ));
        assert!(matches!(
            TypeDescriptor::parse(&format!("u8[{}][2]", usize::MAX), &none),
            Err(FfiError::MarshalingFailure(_))
        ));

        let wide = TypeDescriptor::record([
            ("a", TypeDescriptor::text(usize::MAX)),
            ("b", TypeDescriptor::primitive(PrimitiveKind::U8)),
        ]);
        assert_eq!(wide.checked_size(), None);
        assert_eq!(wide.size(), usize::MAX);
    }
}
