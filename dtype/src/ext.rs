use super::*;

/// Rust types that can be stored in and loaded from tessel buffers.
pub trait Element: bytemuck::Pod + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    const DTYPE: ScalarDType;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(impl Element for $ty { const DTYPE: ScalarDType = $dtype; })*
    };
}

impl_element! {
    i8 => ScalarDType::Int8, i16 => ScalarDType::Int16, i32 => ScalarDType::Int32, i64 => ScalarDType::Int64,
    u8 => ScalarDType::UInt8, u16 => ScalarDType::UInt16, u32 => ScalarDType::UInt32, u64 => ScalarDType::UInt64,
    f32 => ScalarDType::Float32, f64 => ScalarDType::Float64,
}

impl ScalarDType {
    /// Decode one little-endian integer element as an `i64`.
    ///
    /// Used for scalar-prefetch values that drive indexing. Returns `None` for
    /// non-integer dtypes or when `bytes` is not exactly one element wide.
    /// Unsigned values above `i64::MAX` saturate.
    pub fn decode_index(&self, bytes: &[u8]) -> Option<i64> {
        if bytes.len() != self.bytes() {
            return None;
        }
        let value = match self {
            Self::Bool | Self::UInt8 => read::<u8>(bytes) as i64,
            Self::Int8 => read::<i8>(bytes) as i64,
            Self::Int16 => read::<i16>(bytes) as i64,
            Self::UInt16 => read::<u16>(bytes) as i64,
            Self::Int32 => read::<i32>(bytes) as i64,
            Self::UInt32 => read::<u32>(bytes) as i64,
            Self::Int64 => read::<i64>(bytes),
            Self::UInt64 => i64::try_from(read::<u64>(bytes)).unwrap_or(i64::MAX),
            Self::Float16 | Self::BFloat16 | Self::Float32 | Self::Float64 => return None,
        };
        Some(value)
    }
}

fn read<T: bytemuck::Pod>(bytes: &[u8]) -> T {
    bytemuck::pod_read_unaligned(bytes)
}
