//! Reflected shapes as JSON schema nodes.

use schemars::{Schema, json_schema};
use serde_json::{Map, Value};

use crate::reflect::{Field, Shape, StructShape};

/// Schema for any shape. Recursive structs stop at the second visit and are
/// documented as a plain object.
pub fn schema_for(shape: &Shape) -> Schema {
    Walker::default().shape(shape)
}

/// Schema for a handler result. Properties carry the names serde writes,
/// not the binding tags.
pub fn response_schema_for(shape: &Shape) -> Schema {
    Walker {
        naming: Naming::Serialized,
        ..Walker::default()
    }
    .shape(shape)
}

/// Object schema for a struct, leaving out the fields `exclude` rejects.
pub fn struct_schema(shape: &StructShape, exclude: impl Fn(&Field) -> bool) -> Schema {
    Walker::default().object(shape, &exclude)
}

#[derive(Default, Clone, Copy)]
enum Naming {
    /// `json` tag, falling back to the serde key.
    #[default]
    Bound,
    /// Serde key only.
    Serialized,
}

#[derive(Default)]
struct Walker {
    visiting: Vec<&'static str>,
    naming: Naming,
}

impl Walker {
    fn shape(&mut self, shape: &Shape) -> Schema {
        match shape {
            Shape::String => json_schema!({ "type": "string" }),
            Shape::Integer { format, signed } => {
                let mut schema = json_schema!({ "type": "integer", "format": format });
                if !signed {
                    schema.insert("minimum".to_string(), Value::from(0));
                }
                schema
            }
            Shape::Number { format } => json_schema!({ "type": "number", "format": format }),
            Shape::Boolean => json_schema!({ "type": "boolean" }),
            Shape::Bytes => json_schema!({ "type": "string", "format": "binary" }),
            Shape::Array(elem) => {
                let items = self.shape(elem);
                json_schema!({ "type": "array", "items": items })
            }
            Shape::Map(value) => {
                let values = self.shape(value);
                json_schema!({ "type": "object", "additionalProperties": values })
            }
            Shape::Enum(variants) => json_schema!({ "type": "string", "enum": variants }),
            Shape::Optional(inner) => {
                let mut schema = self.shape(inner);
                schema.insert("nullable".to_string(), Value::Bool(true));
                schema
            }
            Shape::Struct(inner) => self.object(inner, &|_| false),
            Shape::Any | Shape::Marker => json_schema!({ "type": "object" }),
        }
    }

    fn object(&mut self, shape: &StructShape, exclude: &dyn Fn(&Field) -> bool) -> Schema {
        if self.visiting.contains(&shape.name) {
            return json_schema!({ "type": "object" });
        }
        self.visiting.push(shape.name);

        let mut properties = Map::new();
        let mut required = Vec::new();
        for field in shape.data_fields().filter(|f| !exclude(f)) {
            let name = match self.naming {
                Naming::Bound => field.json_name(),
                Naming::Serialized => Some(field.key.to_string()),
            };
            let Some(name) = name else {
                continue;
            };
            let mut schema = self.shape(&field.shape());
            if let Some(description) = field.description() {
                schema.insert("description".to_string(), Value::String(description));
            }
            if field.is_required() {
                required.push(Value::String(name.clone()));
            }
            properties.insert(name, schema.to_value());
        }

        self.visiting.pop();

        let mut object = Map::new();
        object.insert("type".to_string(), Value::from("object"));
        object.insert("properties".to_string(), Value::Object(properties));
        if !required.is_empty() {
            object.insert("required".to_string(), Value::Array(required));
        }
        Schema::from(object)
    }
}
