//! Declarative fixed-layout binary records
//!
//! All AFF4 on-disk structures (ZIP headers, serialized map ranges) are
//! little-endian sequences of fixed-width integers. `binary_record!` declares
//! such a record once and derives `pack`, `unpack` and `SIZE` from the field
//! list. Unknown fields are a compile error.

/// Declare a little-endian fixed-layout record.
///
/// ```
/// use aff4_core::binary_record;
///
/// binary_record! {
///     pub struct Sample {
///         magic: u32 = 0x1234_5678,
///         count: u16,
///     }
/// }
///
/// let rec = Sample::new();
/// assert_eq!(Sample::SIZE, 6);
/// assert_eq!(Sample::unpack(&rec.pack()).unwrap().magic, 0x1234_5678);
/// ```
#[macro_export]
macro_rules! binary_record {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $(
                $(#[$fmeta:meta])*
                $field:ident : $ty:ty $(= $default:expr)?
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            $(
                $(#[$fmeta])*
                pub $field: $ty,
            )*
        }

        impl $name {
            /// Packed size of the record in bytes.
            pub const SIZE: usize = 0 $(+ ::std::mem::size_of::<$ty>())*;

            /// A record with every field set to its declared default.
            pub fn new() -> Self {
                Self {
                    $($field: $crate::binary_record!(@default $($default)?),)*
                }
            }

            /// Serialize the record to its little-endian wire form.
            pub fn pack(&self) -> Vec<u8> {
                let mut buf = Vec::with_capacity(Self::SIZE);
                $(buf.extend_from_slice(&self.$field.to_le_bytes());)*
                buf
            }

            /// Parse a record from the start of `data`.
            pub fn unpack(data: &[u8]) -> $crate::Result<Self> {
                if data.len() < Self::SIZE {
                    return Err($crate::Error::format(format!(
                        "{} needs {} bytes, got {}",
                        stringify!($name),
                        Self::SIZE,
                        data.len()
                    )));
                }
                let mut offset = 0usize;
                $(
                    let $field = {
                        let width = ::std::mem::size_of::<$ty>();
                        let value = <$ty>::from_le_bytes(
                            data[offset..offset + width].try_into().unwrap(),
                        );
                        offset += width;
                        value
                    };
                )*
                let _ = offset;
                Ok(Self { $($field),* })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };

    (@default $default:expr) => {
        $default
    };
    (@default) => {
        0
    };
}

#[cfg(test)]
mod tests {
    binary_record! {
        pub struct TestRecord {
            magic: u32 = 0x0403_4b50,
            version: u16 = 20,
            flags: u16,
            size: u64,
        }
    }

    #[test]
    fn test_sizeof() {
        assert_eq!(TestRecord::SIZE, 16);
    }

    #[test]
    fn test_defaults() {
        let rec = TestRecord::new();
        assert_eq!(rec.magic, 0x0403_4b50);
        assert_eq!(rec.version, 20);
        assert_eq!(rec.flags, 0);
        assert_eq!(rec.size, 0);
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let mut rec = TestRecord::new();
        rec.size = 0x1_0000_0001;
        rec.flags = 0xBEEF;

        let packed = rec.pack();
        assert_eq!(packed.len(), TestRecord::SIZE);
        assert_eq!(&packed[0..4], &[0x50, 0x4b, 0x03, 0x04]);

        let parsed = TestRecord::unpack(&packed).unwrap();
        assert_eq!(parsed, rec);
    }

    #[test]
    fn test_unpack_short_buffer() {
        assert!(TestRecord::unpack(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_unpack_ignores_trailing_bytes() {
        let mut packed = TestRecord::new().pack();
        packed.extend_from_slice(b"trailing");
        assert!(TestRecord::unpack(&packed).is_ok());
    }
}
