use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ErrorKind {
    /// Bad length, grid or type token, rejected before touching the device.
    InvalidArgument,
    /// Token outside the element table, or a float-only operation on a non-float kind.
    UnsupportedType,
    /// Malformed program source, detected at load time.
    CompileError,
    /// No entry point, or the device rejected the argument layout at execution time.
    DispatchError,
    /// Operation on a released buffer.
    UseAfterFree,
    /// Device allocation failure.
    ResourceExhausted,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub info: String,
}

impl Error {
    #[inline]
    pub fn new(kind: ErrorKind, info: impl Into<String>) -> Self {
        Self {
            kind,
            info: info.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.info.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            write!(f, "{:?}: {}", self.kind, self.info)
        }
    }
}

impl std::error::Error for Error {}

pub mod functions {
    use super::{Error, ErrorKind::*};

    macro_rules! builder {
        ($name:ident $kind:expr) => {
            #[inline]
            pub fn $name(info: impl Into<String>) -> Error {
                Error {
                    kind: $kind,
                    info: info.into(),
                }
            }
        };
    }

    builder!(invalid_argument   InvalidArgument  );
    builder!(unsupported_type   UnsupportedType  );
    builder!(compile_error      CompileError     );
    builder!(dispatch_error     DispatchError    );
    builder!(use_after_free     UseAfterFree     );
    builder!(resource_exhausted ResourceExhausted);
}

#[test]
fn test_display() {
    use functions::*;

    let e = use_after_free("buffer#3");
    assert_eq!(e.kind, ErrorKind::UseAfterFree);
    assert_eq!(e.to_string(), "UseAfterFree: buffer#3");
    assert_eq!(Error::new(ErrorKind::DispatchError, "").to_string(), "DispatchError");
}
