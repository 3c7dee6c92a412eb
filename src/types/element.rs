//! Element type definitions for stream payloads.

use serde::{Deserialize, Serialize};

/// Supported stream element kinds.
///
/// The numeric kinds carry fixed-width scalars; `PackedBit`, `Utf8` and
/// `FileRef` are byte-oriented kinds that follow degenerate paths through
/// the generic machinery (no complex-mode doubling, no frame quantization
/// during chunking).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    /// 8-bit signed integer
    Int8,
    /// 8-bit unsigned integer
    UInt8,
    /// 16-bit signed integer
    Int16,
    /// 16-bit unsigned integer
    UInt16,
    /// 32-bit signed integer
    Int32,
    /// 32-bit unsigned integer
    UInt32,
    /// 64-bit signed integer
    Int64,
    /// 64-bit unsigned integer
    UInt64,
    /// 32-bit floating point
    Float32,
    /// 64-bit floating point
    Float64,
    /// Bit-packed payload, eight samples per byte
    PackedBit,
    /// UTF-8 text payload, one logical document per packet
    Utf8,
    /// Opaque file reference (URI bytes)
    FileRef,
}

impl ElementKind {
    /// Returns the size in bytes of one element of this kind.
    pub const fn size(&self) -> usize {
        match self {
            ElementKind::Int8 | ElementKind::UInt8 => 1,
            ElementKind::Int16 | ElementKind::UInt16 => 2,
            ElementKind::Int32 | ElementKind::UInt32 | ElementKind::Float32 => 4,
            ElementKind::Int64 | ElementKind::UInt64 | ElementKind::Float64 => 8,
            ElementKind::PackedBit | ElementKind::Utf8 | ElementKind::FileRef => 1,
        }
    }

    /// Whether streams of this kind honor the SRI complex-mode flag
    /// (complex samples are interleaved scalar pairs).
    pub const fn supports_complex(&self) -> bool {
        !matches!(self, ElementKind::PackedBit | ElementKind::Utf8 | ElementKind::FileRef)
    }

    /// Whether chunking must quantize to whole frames for this kind.
    /// String-like and bit-packed payloads are never framed.
    pub const fn framed(&self) -> bool {
        self.supports_complex()
    }
}

/// An element type usable as a stream payload scalar.
///
/// All generic algorithms (buffering, chunking, timestamp math) branch on
/// `KIND` capability accessors rather than on the concrete type.
pub trait Element: Copy + Default + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    const KIND: ElementKind;
}

macro_rules! impl_element {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(impl Element for $ty {
            const KIND: ElementKind = ElementKind::$kind;
        })*
    };
}

impl_element! {
    i8 => Int8,
    u8 => UInt8,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
}

/// One byte of a bit-packed payload (eight samples).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Bit(pub u8);

impl Element for Bit {
    const KIND: ElementKind = ElementKind::PackedBit;
}

/// One byte of a UTF-8 text payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Utf8Byte(pub u8);

impl Element for Utf8Byte {
    const KIND: ElementKind = ElementKind::Utf8;
}

/// One byte of an opaque file-reference payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct FileByte(pub u8);

impl Element for FileByte {
    const KIND: ElementKind = ElementKind::FileRef;
}

/// Reinterpret an element slice as raw bytes (native layout).
pub(crate) fn bytes_of<T: Element>(data: &[T]) -> &[u8] {
    // SAFETY: every Element impl is a plain-old-data repr(transparent) or
    // primitive type with no padding between array elements
    unsafe {
        std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data))
    }
}

/// Copy raw bytes into a freshly allocated element vector. The byte length
/// must be a whole multiple of the element size.
pub(crate) fn vec_from_bytes<T: Element>(bytes: &[u8]) -> Vec<T> {
    let elem = std::mem::size_of::<T>();
    debug_assert_eq!(bytes.len() % elem, 0);
    let count = bytes.len() / elem;
    let mut out = Vec::<T>::with_capacity(count);
    // SAFETY: the destination has `count` elements of capacity and the
    // source holds exactly `count * size_of::<T>()` bytes; copying by bytes
    // is valid for plain-old-data element types regardless of the source's
    // alignment
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), out.as_mut_ptr() as *mut u8, bytes.len());
        out.set_len(count);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_sizes_match_rust_types() {
        assert_eq!(ElementKind::Int16.size(), std::mem::size_of::<i16>());
        assert_eq!(ElementKind::Float64.size(), std::mem::size_of::<f64>());
        assert_eq!(<f32 as Element>::KIND.size(), std::mem::size_of::<f32>());
        assert_eq!(ElementKind::PackedBit.size(), 1);
    }

    #[test]
    fn degenerate_kinds_have_no_complex_or_framing() {
        assert!(!ElementKind::PackedBit.supports_complex());
        assert!(!ElementKind::Utf8.framed());
        assert!(!ElementKind::FileRef.supports_complex());
        assert!(ElementKind::Float32.supports_complex());
        assert!(ElementKind::Int8.framed());
    }

    #[test]
    fn byte_round_trip_preserves_values() {
        let data: Vec<i16> = vec![-3, 0, 127, 32767, -32768];
        let bytes = bytes_of(&data);
        assert_eq!(bytes.len(), data.len() * 2);
        let back: Vec<i16> = vec_from_bytes(bytes);
        assert_eq!(back, data);
    }

    #[test]
    fn unaligned_bytes_still_decode() {
        let data: Vec<f64> = vec![1.5, -2.25, 1e300];
        let mut padded = vec![0u8; 1];
        padded.extend_from_slice(bytes_of(&data));
        // Decode from an odd offset, guaranteed misaligned for f64
        let back: Vec<f64> = vec_from_bytes(&padded[1..]);
        assert_eq!(back, data);
    }
}
