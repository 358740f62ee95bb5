//! Schema descriptors and the decode engine.
//!
//! Each descriptor knows its alignment and how to consume bits from a
//! [`BitReader`] to produce a [`FieldValue`]. Dependent descriptors
//! (variants, sequence-style arrays) resolve their selector through the
//! [`Scope`] of the struct being decoded.

use std::io::Read;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder as _, LittleEndian};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::bits::BitReader;
use super::error::{CtfError, Result};
use super::value::{
    ArrayValue, EnumValue, Field, FieldValue, IntegerValue, Scope, StructValue, VariantValue,
};

/// Longest array whose elements may occupy no bits.
const MAX_EMPTY_ELEMENTS: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    #[default]
    None,
    Ascii,
    #[serde(alias = "utf-8")]
    Utf8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    #[default]
    #[serde(alias = "le")]
    LittleEndian,
    #[serde(alias = "be")]
    BigEndian,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeDescriptor {
    Integer(IntegerType),
    Float(FloatType),
    String(StringType),
    Enum(EnumType),
    Struct(StructType),
    Variant(VariantType),
    Array(ArrayType),
}

impl TypeDescriptor {
    /// Alignment in bits applied before decoding. Variants report 1 since
    /// the chosen option aligns itself.
    pub fn align(&self) -> u32 {
        match self {
            TypeDescriptor::Integer(ty) => ty.align(),
            TypeDescriptor::Float(ty) => ty.align(),
            TypeDescriptor::String(_) => 8,
            TypeDescriptor::Enum(ty) => ty.base().align(),
            TypeDescriptor::Struct(ty) => ty.align(),
            TypeDescriptor::Variant(_) => 1,
            TypeDescriptor::Array(ty) => ty.align(),
        }
    }

    /// Decodes one value. `Ok(None)` means the field is logically absent
    /// and the enclosing struct leaves it out.
    pub fn decode<R: Read>(
        &self,
        reader: &mut BitReader<R>,
        scope: Option<&Scope<'_>>,
    ) -> Result<Option<FieldValue>> {
        let value = match self {
            TypeDescriptor::Integer(ty) => FieldValue::Integer(ty.decode_integer(reader)?),
            TypeDescriptor::Float(ty) => ty.decode_float(reader)?,
            TypeDescriptor::String(ty) => FieldValue::String(ty.decode_string(reader)?),
            TypeDescriptor::Enum(ty) => FieldValue::Enum(ty.decode_enum(reader)?),
            TypeDescriptor::Struct(ty) => FieldValue::Struct(ty.decode_struct(reader, scope)?),
            TypeDescriptor::Variant(ty) => FieldValue::Variant(ty.decode_variant(reader, scope)?),
            TypeDescriptor::Array(ty) => match ty.decode_array(reader, scope)? {
                Some(array) => FieldValue::Array(array),
                None => return Ok(None),
            },
        };
        Ok(Some(value))
    }
}

impl From<IntegerType> for TypeDescriptor {
    fn from(ty: IntegerType) -> Self {
        TypeDescriptor::Integer(ty)
    }
}

impl From<FloatType> for TypeDescriptor {
    fn from(ty: FloatType) -> Self {
        TypeDescriptor::Float(ty)
    }
}

impl From<StringType> for TypeDescriptor {
    fn from(ty: StringType) -> Self {
        TypeDescriptor::String(ty)
    }
}

impl From<EnumType> for TypeDescriptor {
    fn from(ty: EnumType) -> Self {
        TypeDescriptor::Enum(ty)
    }
}

impl From<StructType> for TypeDescriptor {
    fn from(ty: StructType) -> Self {
        TypeDescriptor::Struct(ty)
    }
}

impl From<VariantType> for TypeDescriptor {
    fn from(ty: VariantType) -> Self {
        TypeDescriptor::Variant(ty)
    }
}

impl From<ArrayType> for TypeDescriptor {
    fn from(ty: ArrayType) -> Self {
        TypeDescriptor::Array(ty)
    }
}

fn check_alignment(align: u32) -> Result<u32> {
    if align == 0 || !align.is_power_of_two() {
        return Err(CtfError::corrupt(format!(
            "alignment of {align} bits is not a power of two"
        )));
    }
    Ok(align)
}

fn default_alignment(size: u32) -> u32 {
    if size % 8 == 0 {
        8
    } else {
        1
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntegerType {
    size: u32,
    align: u32,
    signed: bool,
    encoding: Encoding,
    base: u32,
    byte_order: ByteOrder,
    map: Option<Arc<str>>,
}

impl IntegerType {
    pub fn new(size: u32) -> Result<Self> {
        if size == 0 || size > 64 {
            return Err(CtfError::corrupt(format!(
                "integer width of {size} bits is outside 1..=64"
            )));
        }
        Ok(Self {
            size,
            align: default_alignment(size),
            signed: false,
            encoding: Encoding::None,
            base: 10,
            byte_order: ByteOrder::LittleEndian,
            map: None,
        })
    }

    pub fn signed(mut self, signed: bool) -> Self {
        self.signed = signed;
        self
    }

    pub fn with_align(mut self, align: u32) -> Result<Self> {
        self.align = check_alignment(align)?;
        Ok(self)
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_base(mut self, base: u32) -> Self {
        self.base = base;
        self
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// Associates the integer with a clock, used when it carries a timestamp.
    pub fn with_map(mut self, clock: impl Into<Arc<str>>) -> Self {
        self.map = Some(clock.into());
        self
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn align(&self) -> u32 {
        self.align
    }

    pub fn is_signed(&self) -> bool {
        self.signed
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn map(&self) -> Option<&str> {
        self.map.as_deref()
    }

    /// Smallest and largest representable values.
    pub fn value_range(&self) -> (i128, i128) {
        if self.signed {
            let half = 1i128 << (self.size - 1);
            (-half, half - 1)
        } else {
            (0, (1i128 << self.size) - 1)
        }
    }

    pub fn decode_integer<R: Read>(&self, reader: &mut BitReader<R>) -> Result<IntegerValue> {
        reader.align(self.align)?;

        let size = self.size as usize;
        let mut raw = [0u8; 8];
        let bits = match self.byte_order {
            ByteOrder::LittleEndian => {
                reader.read_bits_into(size, &mut raw)?;
                LittleEndian::read_u64(&raw)
            }
            ByteOrder::BigEndian => {
                if self.size % 8 != 0 || !reader.is_byte_aligned() {
                    return Err(CtfError::unsupported(format!(
                        "big-endian integer of {} bits at bit {}",
                        self.size,
                        reader.bit_position()
                    )));
                }
                let nbytes = size / 8;
                reader.read_bits_into(size, &mut raw[..nbytes])?;
                BigEndian::read_uint(&raw[..nbytes], nbytes)
            }
        };

        let bits = if self.signed {
            sign_extend(bits, self.size)
        } else {
            bits
        };
        Ok(IntegerValue::new(bits, self.size, self.signed).with_display(
            self.base,
            self.encoding,
            self.map.clone(),
        ))
    }
}

fn sign_extend(bits: u64, size: u32) -> u64 {
    if size >= 64 {
        return bits;
    }
    let sign = 1u64 << (size - 1);
    if bits & sign != 0 {
        bits | !((1u64 << size) - 1)
    } else {
        bits
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FloatType {
    exp_dig: u32,
    mant_dig: u32,
    align: u32,
    byte_order: ByteOrder,
}

impl FloatType {
    /// `mant_dig` counts the implicit leading bit, as in C's `FLT_MANT_DIG`.
    pub fn new(exp_dig: u32, mant_dig: u32) -> Result<Self> {
        match (exp_dig, mant_dig) {
            (8, 24) | (11, 53) => Ok(Self {
                exp_dig,
                mant_dig,
                align: 8,
                byte_order: ByteOrder::LittleEndian,
            }),
            _ => Err(CtfError::corrupt(format!(
                "floating point layout with {exp_dig} exponent and {mant_dig} mantissa digits is not 32 or 64 bits"
            ))),
        }
    }

    pub fn single() -> Self {
        Self {
            exp_dig: 8,
            mant_dig: 24,
            align: 8,
            byte_order: ByteOrder::LittleEndian,
        }
    }

    pub fn double() -> Self {
        Self {
            exp_dig: 11,
            mant_dig: 53,
            align: 8,
            byte_order: ByteOrder::LittleEndian,
        }
    }

    pub fn with_align(mut self, align: u32) -> Result<Self> {
        self.align = check_alignment(align)?;
        Ok(self)
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn size(&self) -> u32 {
        self.exp_dig + self.mant_dig
    }

    pub fn align(&self) -> u32 {
        self.align
    }

    pub fn decode_float<R: Read>(&self, reader: &mut BitReader<R>) -> Result<FieldValue> {
        let raw = IntegerType {
            size: self.size(),
            align: self.align,
            signed: false,
            encoding: Encoding::None,
            base: 10,
            byte_order: self.byte_order,
            map: None,
        }
        .decode_integer(reader)?
        .as_u64();

        let value = reconstruct_float(raw, self.exp_dig, self.mant_dig);
        Ok(if self.size() == 32 {
            FieldValue::Float32(value as f32)
        } else {
            FieldValue::Float64(value)
        })
    }
}

/// Rebuilds an IEEE 754 value from its sign, biased exponent and fraction.
fn reconstruct_float(raw: u64, exp_dig: u32, mant_dig: u32) -> f64 {
    let frac_bits = mant_dig - 1;
    let exp_mask = (1u64 << exp_dig) - 1;
    let sign = (raw >> (exp_dig + frac_bits)) & 1;
    let biased = (raw >> frac_bits) & exp_mask;
    let fraction = raw & ((1u64 << frac_bits) - 1);
    let bias = (1i32 << (exp_dig - 1)) - 1;

    let magnitude = if biased == 0 {
        // zero and subnormals have no implicit leading one
        scale_by_pow2(fraction as f64, 1 - bias - frac_bits as i32)
    } else if biased == exp_mask {
        if fraction == 0 {
            f64::INFINITY
        } else {
            f64::NAN
        }
    } else {
        let significand = (fraction | (1u64 << frac_bits)) as f64;
        scale_by_pow2(significand, biased as i32 - bias - frac_bits as i32)
    };

    if sign == 1 {
        -magnitude
    } else {
        magnitude
    }
}

fn scale_by_pow2(mut value: f64, mut exponent: i32) -> f64 {
    while exponent > 1000 {
        value *= pow2(1000);
        exponent -= 1000;
    }
    while exponent < -1000 {
        value *= pow2(-1000);
        exponent += 1000;
    }
    value * pow2(exponent)
}

/// Exact power of two for exponents in -1022..=1023.
fn pow2(exponent: i32) -> f64 {
    f64::from_bits(((exponent + 1023) as u64) << 52)
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StringType {
    encoding: Encoding,
}

impl StringType {
    pub fn new(encoding: Encoding) -> Self {
        Self { encoding }
    }

    pub fn decode_string<R: Read>(&self, reader: &mut BitReader<R>) -> Result<String> {
        reader.align(8)?;
        let bytes = reader.read_cstring()?;
        Ok(match self.encoding {
            Encoding::Ascii => bytes
                .iter()
                .map(|&b| {
                    if b.is_ascii() {
                        b as char
                    } else {
                        char::REPLACEMENT_CHARACTER
                    }
                })
                .collect(),
            Encoding::Utf8 | Encoding::None => String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumMapping {
    pub name: String,
    pub start: i128,
    pub end: i128,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumType {
    base: IntegerType,
    mappings: Vec<EnumMapping>,
    next_default: i128,
}

impl EnumType {
    pub fn new(base: IntegerType) -> Self {
        Self {
            base,
            mappings: Vec::new(),
            next_default: 0,
        }
    }

    pub fn base(&self) -> &IntegerType {
        &self.base
    }

    pub fn mappings(&self) -> &[EnumMapping] {
        &self.mappings
    }

    /// Adds an enumerator. Without an explicit range the enumerator takes
    /// the value following the previous one.
    pub fn add_mapping(&mut self, name: impl Into<String>, range: Option<(i128, i128)>) -> Result<()> {
        let name = name.into();
        let (start, end) = range.unwrap_or((self.next_default, self.next_default));
        if start > end {
            return Err(CtfError::corrupt(format!(
                "enumerator '{name}' has an empty range {start}..={end}"
            )));
        }
        let (min, max) = self.base.value_range();
        if start < min || end > max {
            return Err(CtfError::corrupt(format!(
                "enumerator '{name}' value {start}..={end} does not fit in a {}-bit {} integer",
                self.base.size(),
                if self.base.is_signed() { "signed" } else { "unsigned" }
            )));
        }

        self.mappings.push(EnumMapping { name, start, end });
        self.next_default = end + 1;
        Ok(())
    }

    /// First enumerator whose range contains `value`.
    pub fn label_for(&self, value: i128) -> Option<&str> {
        self.mappings
            .iter()
            .find(|m| m.start <= value && value <= m.end)
            .map(|m| m.name.as_str())
    }

    pub fn range_of(&self, label: &str) -> Option<(i128, i128)> {
        self.mappings
            .iter()
            .find(|m| m.name == label)
            .map(|m| (m.start, m.end))
    }

    pub fn decode_enum<R: Read>(&self, reader: &mut BitReader<R>) -> Result<EnumValue> {
        let value = self.base.decode_integer(reader)?;
        let label = self.label_for(value.as_i128()).ok_or_else(|| {
            CtfError::corrupt(format!("value {} matches no enumerator", value.as_i128()))
        })?;
        Ok(EnumValue {
            label: label.to_string(),
            value,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructType {
    fields: Vec<(String, TypeDescriptor)>,
    min_align: u32,
    align: u32,
}

impl Default for StructType {
    fn default() -> Self {
        Self::new()
    }
}

impl StructType {
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            min_align: 1,
            align: 1,
        }
    }

    pub fn from_fields<I, S>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, TypeDescriptor)>,
        S: Into<String>,
    {
        let mut ty = Self::new();
        for (name, field) in fields {
            ty.add_field(name, field)?;
        }
        Ok(ty)
    }

    /// Raises the declared minimum alignment.
    pub fn with_align(mut self, align: u32) -> Result<Self> {
        self.min_align = check_alignment(align)?;
        self.align = self.align.max(self.min_align);
        Ok(self)
    }

    pub fn add_field(&mut self, name: impl Into<String>, ty: TypeDescriptor) -> Result<()> {
        let name = name.into();
        if self.fields.iter().any(|(existing, _)| *existing == name) {
            return Err(CtfError::corrupt(format!(
                "struct declares field '{name}' twice"
            )));
        }
        self.align = self.align.max(ty.align());
        self.fields.push((name, ty));
        Ok(())
    }

    pub fn fields(&self) -> &[(String, TypeDescriptor)] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&TypeDescriptor> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, ty)| ty)
    }

    /// Largest of the declared alignment and every field's alignment.
    pub fn align(&self) -> u32 {
        self.align
    }

    pub fn decode_struct<R: Read>(
        &self,
        reader: &mut BitReader<R>,
        parent: Option<&Scope<'_>>,
    ) -> Result<StructValue> {
        self.decode_fields(reader, None, parent)
    }

    /// Decodes a top-level dynamic scope, making it addressable by absolute
    /// paths such as `stream.event.header.id`.
    pub fn decode_root<R: Read>(
        &self,
        reader: &mut BitReader<R>,
        scope_name: &str,
        parent: Option<&Scope<'_>>,
    ) -> Result<StructValue> {
        self.decode_fields(reader, Some(scope_name), parent)
    }

    fn decode_fields<R: Read>(
        &self,
        reader: &mut BitReader<R>,
        scope_name: Option<&str>,
        parent: Option<&Scope<'_>>,
    ) -> Result<StructValue> {
        reader.align(self.align)?;

        let mut value = StructValue::with_capacity(self.fields.len());
        for (name, ty) in &self.fields {
            let decoded = {
                let scope = match scope_name {
                    Some(scope_name) => Scope::root(scope_name, &value, parent),
                    None => Scope::nested(&value, parent),
                };
                ty.decode(reader, Some(&scope))?
            };
            match decoded {
                Some(field) => value.insert(name.clone(), field)?,
                None => debug!(field = %name, "field absent, skipped"),
            }
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariantType {
    tag: String,
    options: Vec<(String, TypeDescriptor)>,
}

impl VariantType {
    /// `tag` is the dotted path of the enum that selects the option.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            options: Vec::new(),
        }
    }

    pub fn add_option(&mut self, name: impl Into<String>, ty: TypeDescriptor) -> Result<()> {
        let name = name.into();
        if self.option(&name).is_some() {
            return Err(CtfError::corrupt(format!(
                "variant declares option '{name}' twice"
            )));
        }
        self.options.push((name, ty));
        Ok(())
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn option(&self, name: &str) -> Option<&TypeDescriptor> {
        self.options
            .iter()
            .find(|(option, _)| option == name)
            .map(|(_, ty)| ty)
    }

    pub fn decode_variant<R: Read>(
        &self,
        reader: &mut BitReader<R>,
        scope: Option<&Scope<'_>>,
    ) -> Result<VariantValue> {
        let scope = scope.ok_or_else(|| {
            CtfError::corrupt(format!(
                "variant selected by '{}' decoded outside of a struct",
                self.tag
            ))
        })?;
        let tag_value = scope.lookup(&self.tag).ok_or_else(|| {
            CtfError::corrupt(format!("variant tag '{}' not found in scope", self.tag))
        })?;
        let FieldValue::Enum(tag) = tag_value else {
            return Err(CtfError::corrupt(format!(
                "variant tag '{}' is {} rather than an enum",
                self.tag,
                tag_value.kind()
            )));
        };
        let ty = self.option(&tag.label).ok_or_else(|| {
            CtfError::corrupt(format!(
                "variant selected by '{}' has no option '{}'",
                self.tag, tag.label
            ))
        })?;

        let value = ty.decode(reader, Some(scope))?.ok_or_else(|| {
            CtfError::corrupt(format!("variant option '{}' decoded to nothing", tag.label))
        })?;
        Ok(VariantValue {
            tag: tag.clone(),
            field: Box::new(Field {
                name: tag.label.clone(),
                value,
            }),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArrayLength {
    Fixed(u64),
    /// Dotted path to an integer or enum decoded earlier.
    Field(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayType {
    element: Box<TypeDescriptor>,
    length: ArrayLength,
}

impl ArrayType {
    pub fn new(element: TypeDescriptor, length: ArrayLength) -> Self {
        Self {
            element: Box::new(element),
            length,
        }
    }

    pub fn element(&self) -> &TypeDescriptor {
        &self.element
    }

    pub fn length(&self) -> &ArrayLength {
        &self.length
    }

    pub fn align(&self) -> u32 {
        self.element.align()
    }

    /// `Ok(None)` when the length refers to a field that is not in scope.
    pub fn decode_array<R: Read>(
        &self,
        reader: &mut BitReader<R>,
        scope: Option<&Scope<'_>>,
    ) -> Result<Option<ArrayValue>> {
        let len = match &self.length {
            ArrayLength::Fixed(len) => *len,
            ArrayLength::Field(path) => {
                let Some(found) = scope.and_then(|scope| scope.lookup(path)) else {
                    debug!(length = %path, "array length not in scope");
                    return Ok(None);
                };
                let value = found.as_integer().ok_or_else(|| {
                    CtfError::corrupt(format!(
                        "array length '{path}' is {} rather than an integer",
                        found.kind()
                    ))
                })?;
                let len = value.as_i128();
                if len < 0 {
                    return Err(CtfError::corrupt(format!(
                        "array length '{path}' is negative ({len})"
                    )));
                }
                len as u64
            }
        };

        reader.align(self.align())?;
        let mut elements = Vec::with_capacity(len.min(4096) as usize);
        for index in 0..len {
            let start = reader.bit_position();
            let element = self.element.decode(reader, scope)?.ok_or_else(|| {
                CtfError::corrupt("array element decoded to nothing".to_string())
            })?;
            // Every element has the same layout, so an empty first element
            // means the whole array occupies no bits.
            if index == 0 && len > MAX_EMPTY_ELEMENTS && reader.bit_position() == start {
                return Err(CtfError::corrupt(format!(
                    "array of {len} elements that occupy no bits"
                )));
            }
            elements.push(element);
        }
        Ok(Some(ArrayValue { elements }))
    }
}
