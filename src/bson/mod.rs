//! Dynamic value model and binary codec for schemaless documents.

pub mod codec;
mod date_time;
mod decimal;
mod document;
mod object_id;
mod value;

pub use date_time::DateTime;
pub use decimal::Decimal;
pub use document::{Array, Document};
pub use object_id::ObjectId;
pub use value::{Value, ValueTag};

/// Build a [`Document`] literal.
///
/// ```
/// use harborlite::doc;
/// let d = doc! { "name" => "ada", "age" => 36 };
/// assert_eq!(d.get("age").unwrap().as_i32(), Some(36));
/// ```
#[macro_export]
macro_rules! doc {
    () => { $crate::bson::Document::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut d = $crate::bson::Document::new();
        $( d.insert($key, $value); )+
        d
    }};
}

/// Build an [`Array`] literal from `Into<Value>` items.
#[macro_export]
macro_rules! array {
    () => { $crate::bson::Array::new() };
    ($($value:expr),+ $(,)?) => {{
        let mut a = $crate::bson::Array::new();
        $( a.push($value); )+
        a
    }};
}
