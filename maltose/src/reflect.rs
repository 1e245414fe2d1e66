//! Compile-time reflection for request and response types.
//!
//! `#[derive(Reflect)]` describes a struct's fields, their serde names and
//! their tags. The binder, the metadata reader and the OpenAPI builder all
//! read this description instead of inspecting values at runtime.

use std::any::TypeId;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;

use crate::meta;
use crate::response::Payload;

/// The structural description of a Rust type.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    String,
    Integer { format: &'static str, signed: bool },
    Number { format: &'static str },
    Boolean,
    Array(Box<Shape>),
    Map(Box<Shape>),
    Struct(StructShape),
    /// Unit enum, serialised as one of the listed names.
    Enum(Vec<&'static str>),
    Optional(Box<Shape>),
    Any,
    Bytes,
    /// The routing marker. Never bound, never documented.
    Marker,
}

impl Shape {
    /// Strips any number of `Optional` layers.
    pub fn unwrap_optional(&self) -> &Shape {
        match self {
            Shape::Optional(inner) => inner.unwrap_optional(),
            other => other,
        }
    }

    pub fn as_struct(&self) -> Option<&StructShape> {
        match self.unwrap_optional() {
            Shape::Struct(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructShape {
    pub name: &'static str,
    pub fields: Vec<Field>,
}

impl StructShape {
    /// The marker field, if the struct embeds one.
    pub fn marker(&self) -> Option<&Field> {
        self.fields.iter().find(|f| f.shape() == Shape::Marker)
    }

    /// Fields that take part in binding and documentation.
    pub fn data_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields
            .iter()
            .filter(|f| !f.skip && f.shape() != Shape::Marker)
    }
}

/// One named field of a reflected struct.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// Rust identifier.
    pub name: &'static str,
    /// Name serde uses for the field.
    pub key: &'static str,
    /// Raw tag string, `key:"value"` pairs.
    pub tag: &'static str,
    /// Doc comment text.
    pub doc: &'static str,
    /// `#[serde(skip)]`.
    pub skip: bool,
    pub shape: fn() -> Shape,
}

impl Field {
    pub fn shape(&self) -> Shape {
        (self.shape)()
    }

    /// Value of one tag key.
    pub fn tag(&self, key: &str) -> Option<String> {
        meta::lookup(self.tag, key)
    }

    /// Name used for JSON bodies. `None` when tagged `json:"-"`.
    pub fn json_name(&self) -> Option<String> {
        match self.tag_name("json") {
            Some(name) if name == "-" => None,
            Some(name) => Some(name),
            None => Some(self.key.to_string()),
        }
    }

    /// Name used for query strings and form bodies.
    pub fn form_name(&self) -> Option<String> {
        match self.tag_name("form") {
            Some(name) if name == "-" => None,
            Some(name) => Some(name),
            None => self.json_name(),
        }
    }

    /// Name of the path parameter this field binds from.
    pub fn uri_name(&self) -> Option<String> {
        self.tag_name("uri").filter(|n| n != "-")
    }

    /// True when the field is bound from the path and has no other name.
    pub fn is_path_only(&self) -> bool {
        self.uri_name().is_some() && self.tag_name("json").is_none() && self.tag_name("form").is_none()
    }

    /// Comma separated validator rules.
    pub fn binding(&self) -> Option<String> {
        self.tag("binding").filter(|b| !b.is_empty())
    }

    pub fn is_required(&self) -> bool {
        self.binding()
            .is_some_and(|b| b.split(',').any(|rule| rule.trim() == "required"))
    }

    /// `dc` tag, falling back to the doc comment.
    pub fn description(&self) -> Option<String> {
        self.tag("dc")
            .filter(|d| !d.is_empty())
            .or_else(|| (!self.doc.is_empty()).then(|| self.doc.to_string()))
    }

    // `json:"name,omitempty"` keeps only the name part
    fn tag_name(&self, key: &str) -> Option<String> {
        self.tag(key)
            .map(|v| v.split(',').next().unwrap_or_default().to_string())
            .filter(|v| !v.is_empty())
    }
}

/// Types the framework can describe.
///
/// Derive it with `#[derive(Reflect)]` for structs and unit enums.
pub trait Reflect {
    fn shape() -> Shape;

    /// True for values that mean "no response" (`None`).
    fn is_null(&self) -> bool {
        false
    }

    /// Raw body for text and binary responses; `None` means JSON.
    fn as_payload(&self) -> Option<Payload> {
        None
    }
}

/// Type descriptor stored on routes.
#[derive(Debug, Clone, Copy)]
pub struct TypeInfo {
    pub id: TypeId,
    pub name: &'static str,
    pub shape: fn() -> Shape,
}

impl TypeInfo {
    pub fn of<T: Reflect + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            shape: T::shape,
        }
    }

    pub fn shape(&self) -> Shape {
        (self.shape)()
    }

    pub fn short_name(&self) -> &'static str {
        short_type_name(self.name)
    }
}

/// Last path segment of a type name, generics stripped.
pub fn short_type_name(name: &'static str) -> &'static str {
    let base = name.split('<').next().unwrap_or(name);
    base.rsplit("::").next().unwrap_or(base)
}

impl PartialEq for TypeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

macro_rules! reflect_integer {
    ($($ty:ty => $format:literal, $signed:literal;)*) => {
        $(
            impl Reflect for $ty {
                fn shape() -> Shape {
                    Shape::Integer { format: $format, signed: $signed }
                }
            }
        )*
    };
}

reflect_integer! {
    i8 => "int32", true;
    i16 => "int32", true;
    i32 => "int32", true;
    i64 => "int64", true;
    isize => "int64", true;
    u8 => "int32", false;
    u16 => "int32", false;
    u32 => "int32", false;
    u64 => "int64", false;
    usize => "int64", false;
}

impl Reflect for f32 {
    fn shape() -> Shape {
        Shape::Number { format: "float" }
    }
}

impl Reflect for f64 {
    fn shape() -> Shape {
        Shape::Number { format: "double" }
    }
}

impl Reflect for bool {
    fn shape() -> Shape {
        Shape::Boolean
    }
}

impl Reflect for char {
    fn shape() -> Shape {
        Shape::String
    }
}

impl Reflect for String {
    fn shape() -> Shape {
        Shape::String
    }

    fn as_payload(&self) -> Option<Payload> {
        Some(Payload::Text(self.clone()))
    }
}

impl Reflect for &str {
    fn shape() -> Shape {
        Shape::String
    }

    fn as_payload(&self) -> Option<Payload> {
        Some(Payload::Text((*self).to_string()))
    }
}

impl Reflect for Bytes {
    fn shape() -> Shape {
        Shape::Bytes
    }

    fn as_payload(&self) -> Option<Payload> {
        Some(Payload::Binary(self.clone()))
    }
}

impl Reflect for uuid::Uuid {
    fn shape() -> Shape {
        Shape::String
    }
}

impl Reflect for serde_json::Value {
    fn shape() -> Shape {
        Shape::Any
    }
}

impl Reflect for () {
    fn shape() -> Shape {
        Shape::Any
    }
}

impl<T: Reflect> Reflect for Option<T> {
    fn shape() -> Shape {
        Shape::Optional(Box::new(T::shape()))
    }

    fn is_null(&self) -> bool {
        self.is_none()
    }

    fn as_payload(&self) -> Option<Payload> {
        self.as_ref().and_then(Reflect::as_payload)
    }
}

impl<T: Reflect> Reflect for Box<T> {
    fn shape() -> Shape {
        T::shape()
    }

    fn is_null(&self) -> bool {
        (**self).is_null()
    }

    fn as_payload(&self) -> Option<Payload> {
        (**self).as_payload()
    }
}

impl<T: Reflect> Reflect for Arc<T> {
    fn shape() -> Shape {
        T::shape()
    }

    fn is_null(&self) -> bool {
        (**self).is_null()
    }

    fn as_payload(&self) -> Option<Payload> {
        (**self).as_payload()
    }
}

impl<T: Reflect> Reflect for Vec<T> {
    fn shape() -> Shape {
        Shape::Array(Box::new(T::shape()))
    }
}

impl<T: Reflect, S> Reflect for HashSet<T, S> {
    fn shape() -> Shape {
        Shape::Array(Box::new(T::shape()))
    }
}

impl<T: Reflect> Reflect for BTreeSet<T> {
    fn shape() -> Shape {
        Shape::Array(Box::new(T::shape()))
    }
}

impl<V: Reflect, S> Reflect for HashMap<String, V, S> {
    fn shape() -> Shape {
        Shape::Map(Box::new(V::shape()))
    }
}

impl<V: Reflect> Reflect for BTreeMap<String, V> {
    fn shape() -> Shape {
        Shape::Map(Box::new(V::shape()))
    }
}
