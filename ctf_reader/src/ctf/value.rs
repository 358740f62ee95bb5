//! Decoded field values.
//!
//! The tree is owned top-down: a struct owns its fields, an array its
//! elements, a variant its chosen field and the enum that selected it.
//! Nothing points back up. Name resolution against enclosing structs goes
//! through [`Scope`], a borrowed chain that only lives while decoding.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use super::error::{CtfError, Result};
use super::types::Encoding;

pub const TRACE_PACKET_HEADER: &str = "trace.packet.header";
pub const STREAM_PACKET_CONTEXT: &str = "stream.packet.context";
pub const STREAM_EVENT_HEADER: &str = "stream.event.header";
pub const STREAM_EVENT_CONTEXT: &str = "stream.event.context";
pub const EVENT_CONTEXT: &str = "event.context";
pub const EVENT_FIELDS: &str = "event.fields";

const DYNAMIC_SCOPES: [&str; 6] = [
    TRACE_PACKET_HEADER,
    STREAM_PACKET_CONTEXT,
    STREAM_EVENT_HEADER,
    STREAM_EVENT_CONTEXT,
    EVENT_CONTEXT,
    EVENT_FIELDS,
];

/// Array elements with this value are trimmed from both ends of a text view.
const RECORD_SEPARATOR: u8 = 0x1E;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Integer(IntegerValue),
    Float32(f32),
    Float64(f64),
    String(String),
    Enum(EnumValue),
    Struct(StructValue),
    Variant(VariantValue),
    Array(ArrayValue),
}

impl FieldValue {
    /// Integers, and the underlying integer of an enum.
    pub fn as_integer(&self) -> Option<&IntegerValue> {
        match self {
            FieldValue::Integer(value) => Some(value),
            FieldValue::Enum(value) => Some(&value.value),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&EnumValue> {
        match self {
            FieldValue::Enum(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructValue> {
        match self {
            FieldValue::Struct(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float32(value) => Some(*value as f64),
            FieldValue::Float64(value) => Some(*value),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Integer(_) => "integer",
            FieldValue::Float32(_) | FieldValue::Float64(_) => "float",
            FieldValue::String(_) => "string",
            FieldValue::Enum(_) => "enum",
            FieldValue::Struct(_) => "struct",
            FieldValue::Variant(_) => "variant",
            FieldValue::Array(_) => "array",
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Integer(value) => value.to_json(),
            FieldValue::Float32(value) => json!(*value as f64),
            FieldValue::Float64(value) => json!(*value),
            FieldValue::String(value) => Value::String(value.clone()),
            FieldValue::Enum(value) => json!({
                "label": value.label,
                "value": value.value.to_json(),
            }),
            FieldValue::Struct(value) => value.to_json(),
            FieldValue::Variant(value) => {
                let mut object = Map::new();
                object.insert(value.field.name.clone(), value.field.value.to_json());
                Value::Object(object)
            }
            FieldValue::Array(value) => match value.as_text() {
                Some(text) => Value::String(text),
                None => Value::Array(value.elements.iter().map(FieldValue::to_json).collect()),
            },
        }
    }

    fn find_child(&self, path: &str) -> Option<&FieldValue> {
        match self {
            FieldValue::Struct(value) => value.find(path),
            FieldValue::Variant(value) => value.find(path),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(value) => fmt::Display::fmt(value, f),
            FieldValue::Float32(value) => write!(f, "{value}"),
            FieldValue::Float64(value) => write!(f, "{value}"),
            FieldValue::String(value) => write!(f, "{value:?}"),
            FieldValue::Enum(value) => write!(f, "{} ({})", value.label, value.value),
            FieldValue::Struct(value) => fmt::Display::fmt(value, f),
            FieldValue::Variant(value) => fmt::Display::fmt(&value.field.value, f),
            FieldValue::Array(value) => {
                if let Some(text) = value.as_text() {
                    return write!(f, "{text:?}");
                }
                write!(f, "[")?;
                for (i, element) in value.elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    fmt::Display::fmt(element, f)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// A decoded integer. Signed values are stored sign-extended to 64 bits.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegerValue {
    bits: u64,
    signed: bool,
    size: u32,
    base: u32,
    encoding: Encoding,
    map: Option<Arc<str>>,
}

impl IntegerValue {
    pub fn new(bits: u64, size: u32, signed: bool) -> Self {
        Self {
            bits,
            signed,
            size,
            base: 10,
            encoding: Encoding::None,
            map: None,
        }
    }

    pub(crate) fn with_display(
        mut self,
        base: u32,
        encoding: Encoding,
        map: Option<Arc<str>>,
    ) -> Self {
        self.base = base;
        self.encoding = encoding;
        self.map = map;
        self
    }

    pub fn as_u64(&self) -> u64 {
        self.bits
    }

    pub fn as_i64(&self) -> i64 {
        self.bits as i64
    }

    pub fn as_i128(&self) -> i128 {
        if self.signed {
            self.bits as i64 as i128
        } else {
            self.bits as i128
        }
    }

    pub fn is_signed(&self) -> bool {
        self.signed
    }

    /// Declared width in bits.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Name of the clock this integer is mapped to, if any.
    pub fn clock_map(&self) -> Option<&str> {
        self.map.as_deref()
    }

    fn to_json(&self) -> Value {
        if self.signed {
            json!(self.as_i64())
        } else {
            json!(self.bits)
        }
    }

    fn magnitude_bits(&self) -> u64 {
        if self.size >= 64 {
            self.bits
        } else {
            self.bits & ((1u64 << self.size) - 1)
        }
    }
}

impl fmt::Display for IntegerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.base {
            16 => write!(f, "{:#x}", self.magnitude_bits()),
            8 => write!(f, "{:#o}", self.magnitude_bits()),
            2 => write!(f, "{:#b}", self.magnitude_bits()),
            _ => write!(f, "{}", self.as_i128()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumValue {
    pub label: String,
    pub value: IntegerValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
}

/// Ordered fields with unique names.
#[derive(Debug, Clone, Default)]
pub struct StructValue {
    fields: Vec<Field>,
    index: HashMap<String, usize>,
}

impl PartialEq for StructValue {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl StructValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    /// Appends a field. A name that is already present is rejected rather
    /// than overwritten.
    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) -> Result<()> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(CtfError::corrupt(format!("duplicate field name '{name}'")));
        }
        self.index.insert(name.clone(), self.fields.len());
        self.fields.push(Field { name, value });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.index.get(name).map(|&idx| &self.fields[idx].value)
    }

    /// Looks up a direct field, or a dotted path into nested structs and
    /// chosen variant options.
    pub fn find(&self, path: &str) -> Option<&FieldValue> {
        if let Some(value) = self.get(path) {
            return Some(value);
        }
        let (head, rest) = path.split_once('.')?;
        self.get(head)?.find_child(rest)
    }

    /// Integer (or enum) value at `path`.
    pub fn integer(&self, path: &str) -> Option<&IntegerValue> {
        self.find(path)?.as_integer()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        for field in &self.fields {
            object.insert(field.name.clone(), field.value.to_json());
        }
        Value::Object(object)
    }
}

impl fmt::Display for StructValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} = {}", field.name, field.value)?;
        }
        write!(f, " }}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariantValue {
    pub tag: EnumValue,
    pub field: Box<Field>,
}

impl VariantValue {
    /// The chosen option is addressed by its option name.
    fn find(&self, path: &str) -> Option<&FieldValue> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        if head != self.field.name {
            return None;
        }
        match rest {
            None => Some(&self.field.value),
            Some(rest) => self.field.value.find_child(rest),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArrayValue {
    pub elements: Vec<FieldValue>,
}

impl ArrayValue {
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Text view of an array of ASCII/UTF-8 encoded integers. Stops at the
    /// first NUL and drops one record separator from each end.
    pub fn as_text(&self) -> Option<String> {
        let mut bytes = Vec::with_capacity(self.elements.len());
        for element in &self.elements {
            let FieldValue::Integer(value) = element else {
                return None;
            };
            if value.encoding() == Encoding::None {
                return None;
            }
            let byte = value.as_u64() as u8;
            if byte == 0 {
                break;
            }
            bytes.push(byte);
        }
        if self.elements.is_empty() {
            return None;
        }

        let mut text = bytes.as_slice();
        if let [RECORD_SEPARATOR, rest @ ..] = text {
            text = rest;
        }
        if let [rest @ .., RECORD_SEPARATOR] = text {
            text = rest;
        }
        Some(String::from_utf8_lossy(text).into_owned())
    }
}

/// A struct being decoded, or an enclosing one, linked to its parent.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    name: Option<&'a str>,
    fields: &'a StructValue,
    parent: Option<&'a Scope<'a>>,
}

impl<'a> Scope<'a> {
    /// A top-level dynamic scope such as `stream.event.header`.
    pub fn root(name: &'a str, fields: &'a StructValue, parent: Option<&'a Scope<'a>>) -> Self {
        Self {
            name: Some(name),
            fields,
            parent,
        }
    }

    pub fn nested(fields: &'a StructValue, parent: Option<&'a Scope<'a>>) -> Self {
        Self {
            name: None,
            fields,
            parent,
        }
    }

    pub fn name(&self) -> Option<&'a str> {
        self.name
    }

    /// Resolves a dotted path. Paths prefixed with a dynamic scope name go
    /// straight to that scope; anything else is tried in this scope, then
    /// in each parent in turn.
    pub fn lookup(&self, path: &str) -> Option<&'a FieldValue> {
        for scope_name in DYNAMIC_SCOPES {
            if let Some(rest) = path
                .strip_prefix(scope_name)
                .and_then(|rest| rest.strip_prefix('.'))
            {
                return self.named(scope_name)?.find(rest);
            }
        }

        let mut scope: &Scope<'a> = self;
        loop {
            if let Some(value) = scope.fields.find(path) {
                return Some(value);
            }
            scope = scope.parent?;
        }
    }

    fn named(&self, name: &str) -> Option<&'a StructValue> {
        let mut scope: &Scope<'a> = self;
        loop {
            if scope.name == Some(name) {
                return Some(scope.fields);
            }
            scope = scope.parent?;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;

    fn int(value: u64) -> FieldValue {
        FieldValue::Integer(IntegerValue::new(value, 32, false))
    }

    fn text_element(byte: u8) -> FieldValue {
        FieldValue::Integer(IntegerValue::new(byte as u64, 8, false).with_display(
            10,
            Encoding::Utf8,
            None,
        ))
    }

    #[test]
    fn test_struct_value__duplicate_name__then_corrupt_data() {
        let mut value = StructValue::new();
        value.insert("len", int(1)).unwrap();

        let err = value.insert("len", int(2)).unwrap_err();
        assert!(matches!(err, CtfError::CorruptData(_)));
        assert_eq!(value.get("len"), Some(&int(1)));
        assert_eq!(value.len(), 1);
    }

    #[test]
    fn test_struct_value__insert_order__then_preserved() {
        let mut value = StructValue::new();
        for name in ["zeta", "alpha", "mid"] {
            value.insert(name, int(0)).unwrap();
        }

        let names: Vec<&str> = value.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_struct_value__dotted_path__then_descends() {
        let mut inner = StructValue::new();
        inner.insert("count", int(7)).unwrap();
        let mut outer = StructValue::new();
        outer.insert("inner", FieldValue::Struct(inner)).unwrap();

        assert_eq!(outer.integer("inner.count").map(|v| v.as_u64()), Some(7));
        assert!(outer.find("inner.missing").is_none());
        assert!(outer.find("missing.count").is_none());
    }

    #[test]
    fn test_struct_value__path_through_variant__then_uses_option_name() {
        let mut extended = StructValue::new();
        extended.insert("id", int(42)).unwrap();
        let variant = VariantValue {
            tag: EnumValue {
                label: "extended".into(),
                value: IntegerValue::new(31, 5, false),
            },
            field: Box::new(Field {
                name: "extended".into(),
                value: FieldValue::Struct(extended),
            }),
        };
        let mut header = StructValue::new();
        header.insert("v", FieldValue::Variant(variant)).unwrap();

        assert_eq!(header.integer("v.extended.id").map(|v| v.as_u64()), Some(42));
        assert!(header.find("v.compact.id").is_none());
    }

    #[test]
    fn test_scope_lookup__missing_locally__then_falls_back_to_parent() {
        let mut outer = StructValue::new();
        outer.insert("tag", int(1)).unwrap();
        let mut inner = StructValue::new();
        inner.insert("other", int(2)).unwrap();

        let outer_scope = Scope::nested(&outer, None);
        let inner_scope = Scope::nested(&inner, Some(&outer_scope));

        assert_eq!(inner_scope.lookup("tag"), Some(&int(1)));
        assert_eq!(inner_scope.lookup("other"), Some(&int(2)));
        assert!(inner_scope.lookup("nothing").is_none());
    }

    #[test]
    fn test_scope_lookup__absolute_path__then_resolves_named_root() {
        let mut header = StructValue::new();
        header.insert("id", int(3)).unwrap();
        let mut payload = StructValue::new();
        payload.insert("id", int(99)).unwrap();

        let header_scope = Scope::root(STREAM_EVENT_HEADER, &header, None);
        let payload_scope = Scope::root(EVENT_FIELDS, &payload, Some(&header_scope));

        assert_eq!(payload_scope.lookup("id"), Some(&int(99)));
        assert_eq!(payload_scope.lookup("stream.event.header.id"), Some(&int(3)));
        assert!(payload_scope.lookup("event.context.id").is_none());
    }

    #[test]
    fn test_array_value__text_view__then_trims_nul_and_separators() {
        let mut elements: Vec<FieldValue> = vec![text_element(RECORD_SEPARATOR)];
        elements.extend(b"comm".iter().map(|&b| text_element(b)));
        elements.push(text_element(RECORD_SEPARATOR));
        elements.push(text_element(0));
        elements.push(text_element(b'x'));
        let array = ArrayValue { elements };

        assert_eq!(array.as_text().as_deref(), Some("comm"));
        assert_eq!(
            FieldValue::Array(array).to_json(),
            Value::String("comm".into())
        );
    }

    #[test]
    fn test_array_value__plain_integers__then_no_text_view() {
        let array = ArrayValue {
            elements: vec![int(1), int(2)],
        };
        assert!(array.as_text().is_none());
        assert_eq!(FieldValue::Array(array).to_string(), "[1, 2]");
    }

    #[test]
    fn test_integer_value__display_base__then_formats() {
        let hex = IntegerValue::new(255, 8, false).with_display(16, Encoding::None, None);
        let negative = IntegerValue::new(-3i64 as u64, 3, true);

        assert_eq!(hex.to_string(), "0xff");
        assert_eq!(negative.to_string(), "-3");
        assert_eq!(negative.as_i128(), -3);
    }

    #[test]
    fn test_struct_value__to_json__then_object_in_order() {
        let mut value = StructValue::new();
        value.insert("name", FieldValue::String("cpu0".into())).unwrap();
        value.insert("load", FieldValue::Float64(0.5)).unwrap();

        assert_eq!(value.to_json(), json!({"name": "cpu0", "load": 0.5}));
        assert_eq!(value.to_string(), "{ name = \"cpu0\", load = 0.5 }");

        let mut unsorted = StructValue::new();
        for name in ["zeta", "alpha", "mid"] {
            unsorted.insert(name, FieldValue::String(name.into())).unwrap();
        }
        assert_eq!(
            unsorted.to_json().to_string(),
            r#"{"zeta":"zeta","alpha":"alpha","mid":"mid"}"#
        );
    }
}
