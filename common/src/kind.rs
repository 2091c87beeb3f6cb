use crate::{unsupported_type, Error};
use digit_layout::{types as ty, DigitLayout};
use half::f16;
use std::{fmt, str::FromStr};

/// Host type whose values a buffer of [`Element::KIND`] holds.
///
/// # Safety
///
/// Every bit pattern of `Self`'s size must be a valid `Self`, since kernels
/// may store anything into a buffer, and `Self` must have exactly the size
/// of `KIND`. `bool` therefore has no implementation; bool buffers are
/// viewed through [`ElemKind::storage`].
pub unsafe trait Element: Copy + Send + Sync + 'static {
    const KIND: ElemKind;
}

/// Immutable description of one element kind.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TypeDescriptor {
    kind: ElemKind,
    name: &'static str,
    host: &'static str,
    size: usize,
    layout: DigitLayout,
    float: bool,
}

impl TypeDescriptor {
    #[inline]
    pub const fn kind(&self) -> ElemKind {
        self.kind
    }

    /// Canonical device-side name, as spelled in kernel source.
    #[inline]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Host representation.
    #[inline]
    pub const fn host(&self) -> &'static str {
        self.host
    }

    /// Bytes per element.
    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub const fn layout(&self) -> DigitLayout {
        self.layout
    }

    #[inline]
    pub const fn is_float(&self) -> bool {
        self.float
    }
}

impl fmt::Display for TypeDescriptor {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name)
    }
}

macro_rules! elem_kinds {
    ($( $kind:ident: $name:literal $host:ty, $layout:expr, float = $float:literal, [$($alias:literal)*]; )+) => {
        /// Closed set of element kinds a buffer can hold.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
        pub enum ElemKind {
            $($kind,)+
        }

        impl ElemKind {
            pub const ALL: &'static [ElemKind] = &[$(ElemKind::$kind,)+];

            pub fn descriptor(self) -> &'static TypeDescriptor {
                match self {
                    $(
                        ElemKind::$kind => {
                            const DESC: TypeDescriptor = TypeDescriptor {
                                kind: ElemKind::$kind,
                                name: $name,
                                host: stringify!($host),
                                size: std::mem::size_of::<$host>(),
                                layout: $layout,
                                float: $float,
                            };
                            &DESC
                        }
                    )+
                }
            }
        }

        impl FromStr for ElemKind {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name $(| $alias)* => Ok(ElemKind::$kind),)+
                    _ => Err(unsupported_type(format!("`{s}` is not a supported element type"))),
                }
            }
        }
    };
}

// bool is stored as one byte on both sides
elem_kinds! {
    Bool  : "bool"   bool, ty::U8 , float = false, ["boolean"                    ];
    Char  : "char"   i8  , ty::I8 , float = false, ["int8"    "i8"               ];
    UChar : "uchar"  u8  , ty::U8 , float = false, ["uint8"   "u8"  "ubyte"      ];
    Short : "short"  i16 , ty::I16, float = false, ["int16"   "i16"              ];
    UShort: "ushort" u16 , ty::U16, float = false, ["uint16"  "u16"              ];
    Int   : "int"    i32 , ty::I32, float = false, ["int32"   "i32"              ];
    UInt  : "uint"   u32 , ty::U32, float = false, ["uint32"  "u32" "unsigned"   ];
    Long  : "long"   i64 , ty::I64, float = false, ["int64"   "i64" "longlong"   ];
    ULong : "ulong"  u64 , ty::U64, float = false, ["uint64"  "u64" "ulonglong"  ];
    Half  : "half"   f16 , ty::F16, float = true , ["float16" "f16"              ];
    Float : "float"  f32 , ty::F32, float = true , ["float32" "f32"              ];
}

macro_rules! elements {
    ($( $host:ty => $kind:ident ),+ $(,)?) => {
        $(
            unsafe impl Element for $host {
                const KIND: ElemKind = ElemKind::$kind;
            }
        )+
    };
}

// 设备可以向 bool 缓冲区写入任意字节，主机以 u8 访问
elements! {
    i8  => Char,
    u8  => UChar,
    i16 => Short,
    u16 => UShort,
    i32 => Int,
    u32 => UInt,
    i64 => Long,
    u64 => ULong,
    f16 => Half,
    f32 => Float,
}

impl ElemKind {
    #[inline]
    pub fn of<T: Element>() -> Self {
        T::KIND
    }

    #[inline]
    pub fn size(self) -> usize {
        self.descriptor().size()
    }

    #[inline]
    pub fn is_float(self) -> bool {
        self.descriptor().is_float()
    }

    /// 主机视图的元素类型。
    #[inline]
    pub fn storage(self) -> ElemKind {
        match self {
            ElemKind::Bool => ElemKind::UChar,
            kind => kind,
        }
    }
}

impl fmt::Display for ElemKind {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.descriptor().name())
    }
}

/// What a caller may name an element kind with.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TypeToken<'a> {
    Name(&'a str),
    Kind(ElemKind),
}

impl TypeToken<'_> {
    #[inline]
    pub fn of<T: Element>() -> Self {
        Self::Kind(T::KIND)
    }
}

impl<'a> From<&'a str> for TypeToken<'a> {
    #[inline]
    fn from(value: &'a str) -> Self {
        Self::Name(value)
    }
}

impl<'a> From<&'a String> for TypeToken<'a> {
    #[inline]
    fn from(value: &'a String) -> Self {
        Self::Name(value)
    }
}

impl From<ElemKind> for TypeToken<'_> {
    #[inline]
    fn from(value: ElemKind) -> Self {
        Self::Kind(value)
    }
}

impl From<&TypeDescriptor> for TypeToken<'_> {
    #[inline]
    fn from(value: &TypeDescriptor) -> Self {
        Self::Kind(value.kind())
    }
}

/// Looks a token up in the element table.
pub fn resolve<'a>(token: impl Into<TypeToken<'a>>) -> Result<&'static TypeDescriptor, Error> {
    match token.into() {
        TypeToken::Name(name) => name.parse::<ElemKind>().map(ElemKind::descriptor),
        TypeToken::Kind(kind) => Ok(kind.descriptor()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_resolve_names() {
        assert_eq!(resolve("int").unwrap().kind(), ElemKind::Int);
        assert_eq!(resolve("int32").unwrap().kind(), ElemKind::Int);
        assert_eq!(resolve("float").unwrap().size(), 4);
        assert_eq!(resolve("half").unwrap().host(), "f16");
        assert_eq!(resolve("int16").unwrap().kind(), ElemKind::Short);
        assert_eq!(resolve("ulong").unwrap().layout(), ty::U64);
        assert!(resolve("bool").unwrap().size() == 1);
    }

    #[test]
    fn test_resolve_host_types() {
        assert_eq!(resolve(TypeToken::of::<f32>()).unwrap().name(), "float");
        assert_eq!(resolve(TypeToken::of::<f16>()).unwrap().name(), "half");
        assert_eq!(resolve(TypeToken::of::<u64>()).unwrap().name(), "ulong");
        assert_eq!(resolve(ElemKind::Bool).unwrap().name(), "bool");
    }

    #[test]
    fn test_unsupported() {
        for name in ["double", "Int", "", "float64", "longdouble"] {
            assert_eq!(resolve(name).unwrap_err().kind, ErrorKind::UnsupportedType);
        }
    }

    #[test]
    fn test_table_consistent() {
        for &kind in ElemKind::ALL {
            let desc = kind.descriptor();
            assert_eq!(desc.kind(), kind);
            assert_eq!(desc.name().parse::<ElemKind>().unwrap(), kind);
        }
        let floats = ElemKind::ALL.iter().filter(|k| k.is_float()).count();
        assert_eq!(floats, 2);
    }

    #[test]
    fn test_storage() {
        for &kind in ElemKind::ALL {
            let storage = kind.storage();
            assert_eq!(storage.size(), kind.size());
            assert_ne!(storage, ElemKind::Bool);
        }
        assert_eq!(ElemKind::Bool.storage(), ElemKind::UChar);
        assert_eq!(ElemKind::of::<u8>(), ElemKind::UChar);
    }
}
