//! Value Marshaler
//!
//! Converts host [`Value`]s to native memory images and back, driven only by
//! the [`TypeDescriptor`]. Encoding and decoding walk the same offsets, so the
//! two directions cannot disagree about layout.

use std::mem::size_of;

use super::error::{FfiError, FfiResult};
use super::lease::LeaseSet;
use super::types::{PrimitiveKind, TypeDescriptor, Value};

/// Native representation of one argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeImage {
    /// Bit pattern of a primitive, in native byte order, left-aligned
    Immediate([u8; 8]),
    /// Pointer to a leased buffer holding the image
    Buffer { ptr: *mut u8, len: usize },
}

impl NativeImage {
    /// The 8-byte slot handed to the call: the primitive bits, or the buffer
    /// address
    pub fn arg_word(&self) -> u64 {
        match self {
            NativeImage::Immediate(bytes) => u64::from_ne_bytes(*bytes),
            NativeImage::Buffer { ptr, .. } => {
                let mut word = [0u8; 8];
                word[..size_of::<usize>()].copy_from_slice(&(*ptr as usize).to_ne_bytes());
                u64::from_ne_bytes(word)
            }
        }
    }

    pub fn is_leased(&self) -> bool {
        matches!(self, NativeImage::Buffer { .. })
    }
}

/// Convert `value` into its native image, leasing a buffer for anything that
/// is not a primitive.
pub fn to_native(
    value: &Value,
    desc: &TypeDescriptor,
    leases: &mut LeaseSet,
) -> FfiResult<NativeImage> {
    match desc {
        TypeDescriptor::Primitive(kind) => {
            let mut bytes = [0u8; 8];
            write_primitive(value, *kind, &mut bytes[..kind.size()])?;
            Ok(NativeImage::Immediate(bytes))
        }
        _ => {
            let len = desc
                .checked_size()
                .ok_or_else(|| FfiError::marshal(format!("{} is too large to marshal", desc)))?;
            let lease = leases.allocate(len)?;
            write_value(value, desc, lease.as_mut_slice())?;
            Ok(NativeImage::Buffer {
                ptr: lease.as_ptr(),
                len,
            })
        }
    }
}

/// Read a value back out of a native image.
///
/// # Safety
///
/// A `Buffer` image must point at a live allocation of at least
/// `desc.size()` bytes, i.e. the lease set that produced it is still alive.
pub unsafe fn from_native(image: &NativeImage, desc: &TypeDescriptor) -> FfiResult<Value> {
    match image {
        NativeImage::Immediate(bytes) => read_value(&bytes[..], desc),
        NativeImage::Buffer { ptr, len } => {
            if *len < desc.size() {
                return Err(FfiError::marshal(format!(
                    "image of {} bytes is too small for {}",
                    len, desc
                )));
            }
            read_native(*ptr, desc)
        }
    }
}

/// Decode `desc.size()` bytes starting at `ptr`.
///
/// # Safety
///
/// `ptr` must be valid for reads of `desc.size()` bytes. For `FixedText`
/// it only needs to be readable up to its NUL terminator or the maximum.
pub unsafe fn read_native(ptr: *const u8, desc: &TypeDescriptor) -> FfiResult<Value> {
    if ptr.is_null() {
        return Err(FfiError::marshal(format!("null pointer for {}", desc)));
    }
    if let TypeDescriptor::FixedText(max) = desc {
        return read_c_text(ptr, *max);
    }
    let src = std::slice::from_raw_parts(ptr, desc.size());
    read_value(src, desc)
}

/// Read text up to the first NUL or `max` bytes without touching memory
/// past the terminator.
unsafe fn read_c_text(ptr: *const u8, max: usize) -> FfiResult<Value> {
    let mut bytes = Vec::new();
    for i in 0..max {
        let b = ptr.add(i).read();
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    String::from_utf8(bytes)
        .map(Value::Text)
        .map_err(|e| FfiError::marshal(format!("text is not UTF-8: {}", e)))
}

/// Decode a return buffer filled by the native call.
///
/// Integer returns narrower than a machine word arrive widened to a full
/// word. Non-primitive returns are a callee-owned pointer to the image.
///
/// # Safety
///
/// For non-primitive descriptors the returned pointer must be null or valid
/// for reads of `desc.size()` bytes.
pub unsafe fn decode_return(ret: &[u8], desc: &TypeDescriptor) -> FfiResult<Value> {
    match desc {
        TypeDescriptor::Primitive(kind) if is_widened(*kind) => {
            let word = usize::from_ne_bytes(take(ret)?);
            Ok(narrow_word(word, *kind))
        }
        TypeDescriptor::Primitive(_) => read_value(ret, desc),
        _ => {
            let addr = usize::from_ne_bytes(take(ret)?);
            read_native(addr as *const u8, desc)
        }
    }
}

fn is_widened(kind: PrimitiveKind) -> bool {
    (kind.is_integer() || kind == PrimitiveKind::Bool) && kind.size() < size_of::<usize>()
}

fn narrow_word(word: usize, kind: PrimitiveKind) -> Value {
    match kind {
        PrimitiveKind::I8 => Value::Int(word as i8 as i64),
        PrimitiveKind::U8 => Value::UInt(word as u8 as u64),
        PrimitiveKind::I16 => Value::Int(word as i16 as i64),
        PrimitiveKind::U16 => Value::UInt(word as u16 as u64),
        PrimitiveKind::I32 => Value::Int(word as i32 as i64),
        PrimitiveKind::U32 => Value::UInt(word as u32 as u64),
        PrimitiveKind::Bool => Value::Bool(word as u8 != 0),
        _ => Value::UInt(word as u64),
    }
}

/// Write `value` into `dst`, which is exactly `desc.size()` bytes long
pub fn write_value(value: &Value, desc: &TypeDescriptor, dst: &mut [u8]) -> FfiResult<()> {
    match (desc, value) {
        (TypeDescriptor::Primitive(kind), _) => write_primitive(value, *kind, dst),
        (TypeDescriptor::FixedText(max), Value::Text(s)) => {
            let bytes = s.as_bytes();
            if bytes.len() > *max {
                return Err(FfiError::marshal(format!(
                    "text of {} bytes exceeds fixed size {}",
                    bytes.len(),
                    max
                )));
            }
            if bytes.contains(&0) {
                return Err(FfiError::marshal("text contains an interior NUL"));
            }
            dst[..bytes.len()].copy_from_slice(bytes);
            dst[bytes.len()..*max].fill(0);
            Ok(())
        }
        (TypeDescriptor::Record(fields), Value::Record(values)) => {
            if fields.len() != values.len() {
                return Err(FfiError::marshal(format!(
                    "record {} expects {} fields, got {}",
                    desc,
                    fields.len(),
                    values.len()
                )));
            }
            let mut offset = 0;
            for (field, (name, v)) in fields.iter().zip(values) {
                if field.name != *name {
                    return Err(FfiError::marshal(format!(
                        "expected field '{}', got '{}'",
                        field.name, name
                    )));
                }
                let size = field.ty.size();
                write_value(v, &field.ty, &mut dst[offset..offset + size])?;
                offset += size;
            }
            Ok(())
        }
        (TypeDescriptor::FixedArray { element, length }, Value::Array(items)) => {
            if items.len() != *length {
                return Err(FfiError::marshal(format!(
                    "array {} expects {} elements, got {}",
                    desc,
                    length,
                    items.len()
                )));
            }
            let stride = element.size();
            for (i, item) in items.iter().enumerate() {
                write_value(item, element, &mut dst[i * stride..(i + 1) * stride])?;
            }
            Ok(())
        }
        _ => Err(mismatch(desc, value)),
    }
}

/// Read a value of shape `desc` from the first `desc.size()` bytes of `src`
pub fn read_value(src: &[u8], desc: &TypeDescriptor) -> FfiResult<Value> {
    if src.len() < desc.size() {
        return Err(FfiError::marshal(format!(
            "{} bytes is too small for {}",
            src.len(),
            desc
        )));
    }
    match desc {
        TypeDescriptor::Primitive(kind) => read_primitive(src, *kind),
        TypeDescriptor::FixedText(max) => {
            let raw = &src[..*max];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(*max);
            String::from_utf8(raw[..end].to_vec())
                .map(Value::Text)
                .map_err(|e| FfiError::marshal(format!("text is not UTF-8: {}", e)))
        }
        TypeDescriptor::Record(fields) => {
            let mut offset = 0;
            let mut values = Vec::with_capacity(fields.len());
            for field in fields {
                let size = field.ty.size();
                values.push((
                    field.name.clone(),
                    read_value(&src[offset..offset + size], &field.ty)?,
                ));
                offset += size;
            }
            Ok(Value::Record(values))
        }
        TypeDescriptor::FixedArray { element, length } => {
            let stride = element.size();
            (0..*length)
                .map(|i| read_value(&src[i * stride..(i + 1) * stride], element))
                .collect::<FfiResult<Vec<_>>>()
                .map(Value::Array)
        }
    }
}

fn write_primitive(value: &Value, kind: PrimitiveKind, dst: &mut [u8]) -> FfiResult<()> {
    if kind.is_integer() {
        let wide = match value {
            Value::Int(v) => *v as i128,
            Value::UInt(v) => *v as i128,
            _ => return Err(mismatch(&TypeDescriptor::Primitive(kind), value)),
        };
        let fits = match kind {
            PrimitiveKind::I8 => i8::try_from(wide).map(|v| put(dst, &v.to_ne_bytes())),
            PrimitiveKind::U8 => u8::try_from(wide).map(|v| put(dst, &v.to_ne_bytes())),
            PrimitiveKind::I16 => i16::try_from(wide).map(|v| put(dst, &v.to_ne_bytes())),
            PrimitiveKind::U16 => u16::try_from(wide).map(|v| put(dst, &v.to_ne_bytes())),
            PrimitiveKind::I32 => i32::try_from(wide).map(|v| put(dst, &v.to_ne_bytes())),
            PrimitiveKind::U32 => u32::try_from(wide).map(|v| put(dst, &v.to_ne_bytes())),
            PrimitiveKind::I64 => i64::try_from(wide).map(|v| put(dst, &v.to_ne_bytes())),
            _ => u64::try_from(wide).map(|v| put(dst, &v.to_ne_bytes())),
        };
        if fits.is_err() {
            return Err(FfiError::marshal(format!(
                "value {} does not fit in {}",
                wide, kind
            )));
        }
        return Ok(());
    }

    match (kind, value) {
        (PrimitiveKind::F32, Value::Float(v)) => {
            let narrow = *v as f32;
            if v.is_finite() && !narrow.is_finite() {
                return Err(FfiError::marshal(format!("value {} does not fit in f32", v)));
            }
            put(dst, &narrow.to_ne_bytes())
        }
        (PrimitiveKind::F64, Value::Float(v)) => put(dst, &v.to_ne_bytes()),
        (PrimitiveKind::F32, Value::Int(v)) => {
            let narrow = *v as f32;
            exact_integer(*v, narrow as i128, kind)?;
            put(dst, &narrow.to_ne_bytes())
        }
        (PrimitiveKind::F64, Value::Int(v)) => {
            let wide = *v as f64;
            exact_integer(*v, wide as i128, kind)?;
            put(dst, &wide.to_ne_bytes())
        }
        (PrimitiveKind::Bool, Value::Bool(b)) => put(dst, &[u8::from(*b)]),
        (PrimitiveKind::Pointer, Value::Pointer(p)) => put(dst, &p.to_ne_bytes()),
        (PrimitiveKind::Pointer, Value::UInt(v)) => {
            let p = usize::try_from(*v)
                .map_err(|_| FfiError::marshal(format!("address {:#x} does not fit", v)))?;
            put(dst, &p.to_ne_bytes())
        }
        _ => return Err(mismatch(&TypeDescriptor::Primitive(kind), value)),
    }
    Ok(())
}

/// Integers passed as floats must survive the conversion unchanged
fn exact_integer(v: i64, converted: i128, kind: PrimitiveKind) -> FfiResult<()> {
    if converted == v as i128 {
        Ok(())
    } else {
        Err(FfiError::marshal(format!(
            "integer {} is not exactly representable as {}",
            v, kind
        )))
    }
}

fn put(dst: &mut [u8], bytes: &[u8]) {
    dst[..bytes.len()].copy_from_slice(bytes);
}

fn read_primitive(src: &[u8], kind: PrimitiveKind) -> FfiResult<Value> {
    let value = match kind {
        PrimitiveKind::I8 => Value::Int(i8::from_ne_bytes(take(src)?) as i64),
        PrimitiveKind::U8 => Value::UInt(src[0] as u64),
        PrimitiveKind::I16 => Value::Int(i16::from_ne_bytes(take(src)?) as i64),
        PrimitiveKind::U16 => Value::UInt(u16::from_ne_bytes(take(src)?) as u64),
        PrimitiveKind::I32 => Value::Int(i32::from_ne_bytes(take(src)?) as i64),
        PrimitiveKind::U32 => Value::UInt(u32::from_ne_bytes(take(src)?) as u64),
        PrimitiveKind::I64 => Value::Int(i64::from_ne_bytes(take(src)?)),
        PrimitiveKind::U64 => Value::UInt(u64::from_ne_bytes(take(src)?)),
        PrimitiveKind::F32 => Value::Float(f32::from_ne_bytes(take(src)?) as f64),
        PrimitiveKind::F64 => Value::Float(f64::from_ne_bytes(take(src)?)),
        PrimitiveKind::Bool => Value::Bool(src[0] != 0),
        PrimitiveKind::Pointer => Value::Pointer(usize::from_ne_bytes(take(src)?)),
    };
    Ok(value)
}

fn take<const N: usize>(src: &[u8]) -> FfiResult<[u8; N]> {
    src.get(..N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| FfiError::marshal(format!("need {} bytes, have {}", N, src.len())))
}

fn mismatch(desc: &TypeDescriptor, value: &Value) -> FfiError {
    FfiError::marshal(format!("expected {}, got {}", desc, value.kind_name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::types::PrimitiveKind::*;

    fn person() -> TypeDescriptor {
        TypeDescriptor::record([
            ("id", TypeDescriptor::primitive(I32)),
            ("name", TypeDescriptor::text(64)),
        ])
    }

    fn round_trip(value: &Value, desc: &TypeDescriptor) -> Value {
        let mut leases = LeaseSet::new();
        let image = to_native(value, desc, &mut leases).unwrap();
        unsafe { from_native(&image, desc) }.unwrap()
    }

    #[test]
    fn test_primitives_round_trip_without_allocation() {
        let cases = [
            (Value::Int(-5), I8),
            (Value::UInt(200), U8),
            (Value::Int(-30000), I16),
            (Value::Int(i32::MIN as i64), I32),
            (Value::UInt(u32::MAX as u64), U32),
            (Value::Int(i64::MAX), I64),
            (Value::UInt(u64::MAX), U64),
            (Value::Float(1.5), F32),
            (Value::Float(-2.25e100), F64),
            (Value::Bool(true), Bool),
            (Value::Pointer(0xdead_beef), Pointer),
        ];
        for (value, kind) in cases {
            let desc = TypeDescriptor::primitive(kind);
            let mut leases = LeaseSet::new();
            let image = to_native(&value, &desc, &mut leases).unwrap();
            assert!(!image.is_leased());
            assert!(leases.is_empty());
            assert_eq!(unsafe { from_native(&image, &desc) }.unwrap(), value);
        }
    }

    #[test]
    fn test_nested_record_offsets_match_both_ways() {
        let outer = TypeDescriptor::record([
            ("flags", TypeDescriptor::primitive(U16)),
            ("owner", person()),
            ("score", TypeDescriptor::primitive(F64)),
        ]);
        assert_eq!(person().size(), 68);
        assert_eq!(outer.size(), 2 + 68 + 8);
        assert_eq!(outer.field_offsets(), vec![0, 2, 70]);
        assert_eq!(person().offset_of("name"), Some(4));

        let value = Value::record([
            ("flags", Value::UInt(3)),
            (
                "owner",
                Value::record([("id", Value::Int(42)), ("name", Value::text("ada"))]),
            ),
            ("score", Value::Float(9.5)),
        ]);

        let mut leases = LeaseSet::new();
        let image = to_native(&value, &outer, &mut leases).unwrap();
        let NativeImage::Buffer { ptr, len } = image else {
            panic!("records are leased");
        };
        assert_eq!(len, 78);
        let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
        assert_eq!(&bytes[2..6], &42i32.to_ne_bytes());
        assert_eq!(&bytes[6..9], b"ada");
        assert_eq!(bytes[9], 0);
        assert_eq!(&bytes[70..78], &9.5f64.to_ne_bytes());

        assert_eq!(unsafe { from_native(&image, &outer) }.unwrap(), value);
    }

    #[test]
    fn test_array_of_records_round_trip() {
        let desc = TypeDescriptor::array(person(), 3);
        let value = Value::Array(
            (0..3)
                .map(|i| {
                    Value::record([
                        ("id", Value::Int(i)),
                        ("name", Value::text(format!("item{}", i))),
                    ])
                })
                .collect(),
        );
        assert_eq!(round_trip(&value, &desc), value);
    }

    #[test]
    fn test_text_stops_at_terminator_or_max() {
        let desc = TypeDescriptor::text(4);
        assert_eq!(round_trip(&Value::text("abcd"), &desc), Value::text("abcd"));
        assert_eq!(read_value(b"ab\0d", &desc).unwrap(), Value::text("ab"));
        assert_eq!(read_value(b"abcdef", &desc).unwrap(), Value::text("abcd"));
    }

    #[test]
    fn test_shape_mismatches_fail() {
        let mut leases = LeaseSet::new();
        let short = Value::record([("id", Value::Int(1))]);
        assert!(matches!(
            to_native(&short, &person(), &mut leases),
            Err(FfiError::MarshalingFailure(_))
        ));

        let oversized = Value::text("x".repeat(65));
        assert!(matches!(
            to_native(&oversized, &TypeDescriptor::text(64), &mut leases),
            Err(FfiError::MarshalingFailure(_))
        ));

        let two = Value::Array(vec![Value::Int(1), Value::Int(2)]);
        assert!(matches!(
            to_native(&two, &TypeDescriptor::array(I32.into(), 3), &mut leases),
            Err(FfiError::MarshalingFailure(_))
        ));

        assert!(matches!(
            to_native(&Value::Int(300), &I8.into(), &mut leases),
            Err(FfiError::MarshalingFailure(_))
        ));
        assert!(matches!(
            to_native(&Value::text("1"), &I32.into(), &mut leases),
            Err(FfiError::MarshalingFailure(_))
        ));
    }

    #[test]
    fn test_widened_integer_returns_are_narrowed() {
        let word = (-7i32) as isize as usize;
        let ret = word.to_ne_bytes();
        let v = unsafe { decode_return(&ret, &I32.into()) }.unwrap();
        assert_eq!(v, Value::Int(-7));

        let ret = 1usize.to_ne_bytes();
        let v = unsafe { decode_return(&ret, &Bool.into()) }.unwrap();
        assert_eq!(v, Value::Bool(true));
    }

    #[test]
    fn test_null_record_return_fails() {
        let ret = 0usize.to_ne_bytes();
        assert!(matches!(
            unsafe { decode_return(&ret, &person()) },
            Err(FfiError::MarshalingFailure(_))
        ));
    }

    #[test]
    fn test_float_overflow_and_inexact_integers_fail() {
        let f32_desc = TypeDescriptor::primitive(F32);
        let mut leases = LeaseSet::new();
        assert!(matches!(
            to_native(&Value::Float(1e300), &f32_desc, &mut leases),
            Err(FfiError::MarshalingFailure(_))
        ));
        assert!(matches!(
            to_native(&Value::Float(-1e39), &f32_desc, &mut leases),
            Err(FfiError::MarshalingFailure(_))
        ));
        // Infinities pass through unchanged
        let inf = to_native(&Value::Float(f64::INFINITY), &f32_desc, &mut leases).unwrap();
        assert_eq!(
            unsafe { from_native(&inf, &f32_desc) }.unwrap(),
            Value::Float(f64::INFINITY)
        );

        assert!(matches!(
            to_native(&Value::Int(16_777_217), &f32_desc, &mut leases),
            Err(FfiError::MarshalingFailure(_))
        ));
        assert!(matches!(
            to_native(&Value::Int(i64::MAX), &TypeDescriptor::primitive(F64), &mut leases),
            Err(FfiError::MarshalingFailure(_))
        ));
        let f64_desc = TypeDescriptor::primitive(F64);
        let exact = to_native(&Value::Int(1 << 40), &f64_desc, &mut leases).unwrap();
        assert_eq!(
            unsafe { from_native(&exact, &f64_desc) }.unwrap(),
            Value::Float((1u64 << 40) as f64)
        );
        assert!(leases.is_empty());
    }

    #[test]
    fn test_oversized_descriptor_allocates_nothing() {
        let row = TypeDescriptor::array(TypeDescriptor::primitive(U8), usize::MAX);
        let huge = TypeDescriptor::array(row, 2);
        let mut leases = LeaseSet::new();
        assert!(matches!(
            to_native(&Value::Array(Vec::new()), &huge, &mut leases),
            Err(FfiError::MarshalingFailure(_))
        ));
        assert!(leases.is_empty());
    }

    #[test]
    fn test_text_return_reads_only_to_terminator() {
        // Shorter than the declared maximum
        let short: [u8; 3] = *b"hi\0";
        let ret = (short.as_ptr() as usize).to_ne_bytes();
        assert_eq!(
            unsafe { decode_return(&ret, &TypeDescriptor::text(64)) }.unwrap(),
            Value::text("hi")
        );

        let full: [u8; 4] = *b"abcd";
        let ret = (full.as_ptr() as usize).to_ne_bytes();
        assert_eq!(
            unsafe { decode_return(&ret, &TypeDescriptor::text(4)) }.unwrap(),
            Value::text("abcd")
        );
    }
}
