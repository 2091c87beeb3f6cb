mod error;
mod kind;

pub use error::{functions::*, Error, ErrorKind};
pub use kind::{resolve, ElemKind, Element, TypeDescriptor, TypeToken};
