/// Declares a fixed-layout wire struct: fields are encoded in declaration
/// order with no implicit padding.
macro_rules! wire_struct {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $(#[$fmeta:meta])* pub $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $ty ),*
        }

        impl $crate::wire::WireEncode for $name {
            const WIRE_SIZE: usize = 0 $( + <$ty as $crate::wire::WireEncode>::WIRE_SIZE )*;

            fn wire_encode(&self, buf: &mut Vec<u8>) {
                $( $crate::wire::WireEncode::wire_encode(&self.$field, buf); )*
            }
        }

        impl $crate::wire::WireDecode for $name {
            fn wire_decode(
                buf: &[u8],
                offset: &mut usize,
            ) -> Result<Self, $crate::wire::WireError> {
                Ok(Self {
                    $( $field: <$ty as $crate::wire::WireDecode>::wire_decode(buf, offset)?, )*
                })
            }
        }
    };
}
