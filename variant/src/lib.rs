//! Self-describing value trees and their length-prefixed binary encoding.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]

pub mod codec;
pub mod json;
pub mod value;

pub use codec::{decode_value, encode_value};
pub use value::{Object, Value, VariantValue};
