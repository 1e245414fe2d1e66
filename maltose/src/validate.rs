//! Rule-based validation of bound request values.
//!
//! Rules come from the `binding` tag of each field, comma separated, e.g.
//! `binding:"required,email"` or `binding:"omitempty,min=3,max=20"`. They run
//! over the JSON value the binder assembled, before it is deserialised into the
//! request type, so the messages can name fields the way clients sent them.

use std::fmt;
use std::str::FromStr;

use http::StatusCode;
use serde_json::Value;
use validator::{ValidateEmail, ValidateUrl};

use crate::error::Error;
use crate::reflect::{Shape, StructShape};

/// Language of validation messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Locale {
    #[default]
    En,
    Zh,
}

impl FromStr for Locale {
    type Err = String;

    /// Accepts `en`, `zh` and regional forms such as `en-US` or `zh_CN`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lang = s
            .split(['-', '_'])
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match lang.as_str() {
            "en" => Ok(Locale::En),
            "zh" => Ok(Locale::Zh),
            _ => Err(format!("unsupported locale: {}", s)),
        }
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locale::En => f.write_str("en"),
            Locale::Zh => f.write_str("zh"),
        }
    }
}

/// What a rule measured: characters, a number, or a number of items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    String,
    Number,
    Items,
    Other,
}

impl Kind {
    fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => Kind::String,
            Value::Number(_) => Kind::Number,
            Value::Array(_) | Value::Object(_) => Kind::Items,
            _ => Kind::Other,
        }
    }
}

/// A single failed rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub rule: String,
    pub param: String,
    pub kind: Kind,
}

/// Renders [`FieldError`]s as human-readable messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct Translator {
    locale: Locale,
}

impl Translator {
    pub fn new(locale: Locale) -> Self {
        Self { locale }
    }

    pub fn locale(&self) -> Locale {
        self.locale
    }

    pub fn translate(&self, err: &FieldError) -> String {
        let template = match self.locale {
            Locale::En => english(err),
            Locale::Zh => chinese(err),
        };
        template
            .replace("{0}", &err.field)
            .replace("{1}", &err.param)
            .replace("{rule}", &err.rule)
    }
}

fn english(err: &FieldError) -> &'static str {
    let one = err.param == "1";
    match (err.rule.as_str(), err.kind) {
        ("required", _) => "{0} is a required field",
        ("email", _) => "{0} must be a valid email address",
        ("url", _) => "{0} must be a valid URL",
        ("numeric", _) => "{0} must be a valid numeric value",
        ("alpha", _) => "{0} can only contain alphabetic characters",
        ("alphanum", _) => "{0} can only contain alphanumeric characters",
        ("oneof", _) => "{0} must be one of [{1}]",

        ("min" | "gte", Kind::String) if one => "{0} must be at least {1} character in length",
        ("min" | "gte", Kind::String) => "{0} must be at least {1} characters in length",
        ("min" | "gte", Kind::Items) if one => "{0} must contain at least {1} item",
        ("min" | "gte", Kind::Items) => "{0} must contain at least {1} items",
        ("min" | "gte", _) => "{0} must be {1} or greater",

        ("max" | "lte", Kind::String) if one => "{0} must be a maximum of {1} character in length",
        ("max" | "lte", Kind::String) => "{0} must be a maximum of {1} characters in length",
        ("max" | "lte", Kind::Items) if one => "{0} must contain at maximum {1} item",
        ("max" | "lte", Kind::Items) => "{0} must contain at maximum {1} items",
        ("max" | "lte", _) => "{0} must be {1} or less",

        ("len", Kind::String) if one => "{0} must be {1} character in length",
        ("len", Kind::String) => "{0} must be {1} characters in length",
        ("len", Kind::Items) if one => "{0} must contain {1} item",
        ("len", Kind::Items) => "{0} must contain {1} items",
        ("len", _) => "{0} must be equal to {1}",

        ("gt", Kind::String) => "{0} must be greater than {1} characters in length",
        ("gt", Kind::Items) => "{0} must contain more than {1} items",
        ("gt", _) => "{0} must be greater than {1}",

        ("lt", Kind::String) => "{0} must be less than {1} characters in length",
        ("lt", Kind::Items) => "{0} must contain less than {1} items",
        ("lt", _) => "{0} must be less than {1}",

        _ => "{0} failed on the '{rule}' rule",
    }
}

fn chinese(err: &FieldError) -> &'static str {
    match (err.rule.as_str(), err.kind) {
        ("required", _) => "{0}为必填字段",
        ("email", _) => "{0}必须是一个有效的邮箱",
        ("url", _) => "{0}必须是一个有效的URL",
        ("numeric", _) => "{0}必须是一个有效的数值",
        ("alpha", _) => "{0}只能包含字母",
        ("alphanum", _) => "{0}只能包含字母和数字",
        ("oneof", _) => "{0}必须是[{1}]中的一个",

        ("min" | "gte", Kind::String) => "{0}长度必须至少为{1}个字符",
        ("min" | "gte", Kind::Items) => "{0}必须至少包含{1}项",
        ("min", _) => "{0}最小只能为{1}",
        ("gte", _) => "{0}必须大于或等于{1}",

        ("max" | "lte", Kind::String) => "{0}长度不能超过{1}个字符",
        ("max" | "lte", Kind::Items) => "{0}最多只能包含{1}项",
        ("max" | "lte", _) => "{0}必须小于或等于{1}",

        ("len", Kind::String) => "{0}长度必须是{1}个字符",
        ("len", Kind::Items) => "{0}必须包含{1}项",
        ("len", _) => "{0}必须等于{1}",

        ("gt", Kind::String) => "{0}长度必须大于{1}个字符",
        ("gt", Kind::Items) => "{0}必须大于{1}项",
        ("gt", _) => "{0}必须大于{1}",

        ("lt", Kind::String) => "{0}长度必须小于{1}个字符",
        ("lt", Kind::Items) => "{0}必须包含少于{1}项",
        ("lt", _) => "{0}必须小于{1}",

        _ => "{0}未通过{rule}校验",
    }
}

/// Checks bound values against `binding` rules.
///
/// Built once per server and shared by every request.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    translator: Translator,
}

impl Validator {
    pub fn new(locale: Locale) -> Self {
        Self {
            translator: Translator::new(locale),
        }
    }

    pub fn translator(&self) -> &Translator {
        &self.translator
    }

    /// Runs every rule of every field and returns the failures in field order.
    pub fn validate(&self, shape: &StructShape, value: &Value) -> Vec<FieldError> {
        let mut errors = Vec::new();
        validate_struct(shape, value, &mut errors);
        errors
    }

    /// Validates and converts the first failure into a `VALIDATION_FAILED`
    /// error whose message and detail are the translated text.
    pub fn check(&self, shape: &StructShape, value: &Value) -> Result<(), Error> {
        match self.validate(shape, value).first() {
            None => Ok(()),
            Some(first) => {
                let message = self.translator.translate(first);
                Err(Error::validation(message.clone())
                    .with_detail(message)
                    .with_status(StatusCode::BAD_REQUEST))
            }
        }
    }
}

fn validate_struct(shape: &StructShape, value: &Value, errors: &mut Vec<FieldError>) {
    for field in shape.data_fields() {
        let Some(name) = field.json_name().or_else(|| field.uri_name()) else {
            continue;
        };
        let field_value = value.get(field.key).unwrap_or(&Value::Null);

        if let Some(rules) = field.binding() {
            let rules: Vec<&str> = rules.split(',').map(str::trim).collect();
            apply_rules(&name, &rules, field_value, errors);
        }

        if let Some(nested) = field.shape().as_struct()
            && field_value.is_object()
        {
            validate_struct(nested, field_value, errors);
        } else if let Shape::Array(elem) = field.shape().unwrap_optional()
            && let Some(nested) = elem.as_struct()
            && let Some(items) = field_value.as_array()
        {
            for item in items {
                validate_struct(nested, item, errors);
            }
        }
    }
}

fn apply_rules(field: &str, rules: &[&str], value: &Value, errors: &mut Vec<FieldError>) {
    let present = has_value(value);
    if !present && rules.contains(&"omitempty") {
        return;
    }

    for &rule in rules {
        let (name, param) = rule.split_once('=').unwrap_or((rule, ""));
        if name.is_empty() || name == "omitempty" {
            continue;
        }
        // absent optional values only answer to `required`
        if value.is_null() && name != "required" {
            continue;
        }

        let passed = match check_rule(name, param, value) {
            Some(passed) => passed,
            None => {
                tracing::debug!(field, rule = name, "unknown validation rule ignored");
                continue;
            }
        };
        if !passed {
            errors.push(FieldError {
                field: field.to_string(),
                rule: name.to_string(),
                param: param.to_string(),
                kind: Kind::of(value),
            });
            // one message per field is enough
            return;
        }
    }
}

/// `None` for unknown rules or unusable parameters.
fn check_rule(name: &str, param: &str, value: &Value) -> Option<bool> {
    let passed = match name {
        "required" => has_value(value),
        "email" => value.as_str().is_some_and(|s| s.validate_email()),
        "url" => value.as_str().is_some_and(|s| s.validate_url()),
        "numeric" => match value {
            Value::Number(_) => true,
            Value::String(s) => is_numeric(s),
            _ => false,
        },
        "alpha" => value
            .as_str()
            .is_some_and(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphabetic())),
        "alphanum" => value
            .as_str()
            .is_some_and(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric())),
        "oneof" => {
            let candidate = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return Some(false),
            };
            param.split_whitespace().any(|allowed| allowed == candidate)
        }
        "min" | "gte" => measure(value)? >= param.parse::<f64>().ok()?,
        "max" | "lte" => measure(value)? <= param.parse::<f64>().ok()?,
        "gt" => measure(value)? > param.parse::<f64>().ok()?,
        "lt" => measure(value)? < param.parse::<f64>().ok()?,
        "len" => measure(value)? == param.parse::<f64>().ok()?,
        _ => return None,
    };
    Some(passed)
}

/// Character count, numeric value or item count.
fn measure(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => Some(s.chars().count() as f64),
        Value::Number(n) => n.as_f64(),
        Value::Array(items) => Some(items.len() as f64),
        Value::Object(map) => Some(map.len() as f64),
        _ => None,
    }
}

fn has_value(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Bool(b) => *b,
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

fn is_numeric(s: &str) -> bool {
    let digits = s.strip_prefix(['+', '-']).unwrap_or(s);
    let (whole, fraction) = match digits.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (digits, None),
    };
    let all_digits = |part: &str| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit());
    all_digits(whole) && fraction.is_none_or(all_digits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::{Field, Reflect};
    use serde_json::json;

    fn field(name: &'static str, tag: &'static str, shape: fn() -> Shape) -> Field {
        Field {
            name,
            key: name,
            tag,
            doc: "",
            skip: false,
            shape,
        }
    }

    fn signup() -> StructShape {
        StructShape {
            name: "Signup",
            fields: vec![
                field("email", r#"binding:"required,email""#, <String as Reflect>::shape),
                field("name", r#"binding:"omitempty,min=3,max=8""#, <String as Reflect>::shape),
                field("age", r#"binding:"gte=18,lte=130""#, <u32 as Reflect>::shape),
                field("role", r#"binding:"oneof=admin user""#, <String as Reflect>::shape),
            ],
        }
    }

    fn messages(locale: Locale, value: Value) -> Vec<String> {
        let validator = Validator::new(locale);
        validator
            .validate(&signup(), &value)
            .iter()
            .map(|e| validator.translator().translate(e))
            .collect()
    }

    #[test]
    fn test_valid_input_passes() {
        let value = json!({"email": "a@b.io", "name": "", "age": 30, "role": "user"});
        assert!(messages(Locale::En, value).is_empty());
    }

    #[test]
    fn test_required_and_email() {
        assert_eq!(
            messages(Locale::En, json!({"email": "", "age": 20, "role": "user"})),
            vec!["email is a required field"]
        );
        assert_eq!(
            messages(Locale::En, json!({"email": "bad", "age": 20, "role": "user"})),
            vec!["email must be a valid email address"]
        );
    }

    #[test]
    fn test_length_and_range_messages() {
        let value = json!({"email": "a@b.io", "name": "ab", "age": 12, "role": "guest"});
        assert_eq!(
            messages(Locale::En, value),
            vec![
                "name must be at least 3 characters in length",
                "age must be 18 or greater",
                "role must be one of [admin user]",
            ]
        );
    }

    #[test]
    fn test_chinese_messages() {
        let value = json!({"email": "bad", "age": 200, "role": "user"});
        assert_eq!(
            messages(Locale::Zh, value),
            vec!["email必须是一个有效的邮箱", "age必须小于或等于130"]
        );
    }

    #[test]
    fn test_check_returns_first_message() {
        let validator = Validator::default();
        let err = validator
            .check(&signup(), &json!({"email": "nope", "age": 1, "role": "user"}))
            .unwrap_err();
        assert_eq!(err.code(), crate::error::Code::VALIDATION_FAILED);
        assert_eq!(err.message(), "email must be a valid email address");
        assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));
        assert_eq!(
            err.detail(),
            Some(&json!("email must be a valid email address"))
        );
    }

    #[test]
    fn test_nested_struct_is_validated() {
        fn address() -> Shape {
            Shape::Struct(StructShape {
                name: "Address",
                fields: vec![field("city", r#"binding:"required""#, <String as Reflect>::shape)],
            })
        }
        let shape = StructShape {
            name: "Order",
            fields: vec![field("address", "", address)],
        };
        let errors = Validator::default().validate(&shape, &json!({"address": {"city": ""}}));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "city");
    }

    #[test]
    fn test_unknown_rule_is_ignored() {
        let shape = StructShape {
            name: "X",
            fields: vec![field("code", r#"binding:"uuid5""#, <String as Reflect>::shape)],
        };
        assert!(Validator::default().validate(&shape, &json!({"code": "x"})).is_empty());
    }

    #[test]
    fn test_optional_absent_skips_rules() {
        let shape = StructShape {
            name: "X",
            fields: vec![field("site", r#"binding:"url""#, <Option<String> as Reflect>::shape)],
        };
        let validator = Validator::default();
        assert!(validator.validate(&shape, &json!({"site": null})).is_empty());
        assert_eq!(validator.validate(&shape, &json!({"site": "::"})).len(), 1);
    }

    #[test]
    fn test_numeric_and_alpha() {
        assert!(is_numeric("-12.5"));
        assert!(!is_numeric("12."));
        assert!(!is_numeric("abc"));
        assert_eq!(check_rule("alpha", "", &json!("abc")), Some(true));
        assert_eq!(check_rule("alphanum", "", &json!("ab-1")), Some(false));
        assert_eq!(check_rule("len", "2", &json!([1, 2])), Some(true));
        assert_eq!(check_rule("min", "x", &json!(3)), None);
    }

    #[test]
    fn test_locale_parse() {
        assert_eq!("zh-CN".parse::<Locale>(), Ok(Locale::Zh));
        assert_eq!("en_US".parse::<Locale>(), Ok(Locale::En));
        assert!("fr".parse::<Locale>().is_err());
    }
}
