//! Trace metadata: clocks, the packet header layout, stream classes and
//! event descriptors.
//!
//! Metadata is normally produced by a format-specific collaborator. The
//! library can also load an already-resolved JSON manifest, see
//! [`Metadata::from_json`].

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use super::clock::Clock;
use super::error::{CtfError, Result};
use super::types::{
    ArrayLength, ArrayType, ByteOrder, Encoding, EnumType, FloatType, IntegerType, StringType,
    StructType, TypeDescriptor, VariantType,
};

/// Schema of one event kind.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDescriptor {
    pub id: u64,
    pub name: String,
    pub stream_id: u64,
    pub log_level: Option<i64>,
    pub context: Option<StructType>,
    pub fields: Option<StructType>,
}

impl EventDescriptor {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            stream_id: 0,
            log_level: None,
            context: None,
            fields: None,
        }
    }
}

/// Layout shared by every packet and event of one stream class.
#[derive(Debug, Clone, Default)]
pub struct StreamClass {
    pub id: u64,
    pub packet_context: Option<StructType>,
    pub event_header: Option<StructType>,
    pub event_context: Option<StructType>,
    events: BTreeMap<u64, Arc<EventDescriptor>>,
}

impl StreamClass {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn event(&self, id: u64) -> Option<&Arc<EventDescriptor>> {
        self.events.get(&id)
    }

    pub fn events(&self) -> impl Iterator<Item = &Arc<EventDescriptor>> {
        self.events.values()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Metadata {
    clocks: Vec<Arc<Clock>>,
    clocks_by_name: HashMap<String, Arc<Clock>>,
    packet_header: Option<StructType>,
    streams: BTreeMap<u64, StreamClass>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_clock(&mut self, clock: Clock) -> Result<()> {
        if self.clocks_by_name.contains_key(&clock.name) {
            return Err(CtfError::metadata(format!(
                "clock '{}' declared twice",
                clock.name
            )));
        }
        let clock = Arc::new(clock);
        self.clocks_by_name
            .insert(clock.name.clone(), Arc::clone(&clock));
        self.clocks.push(clock);
        Ok(())
    }

    pub fn set_packet_header(&mut self, header: Option<StructType>) {
        self.packet_header = header;
    }

    pub fn add_stream(&mut self, stream: StreamClass) -> Result<()> {
        if self.streams.contains_key(&stream.id) {
            return Err(CtfError::metadata(format!(
                "stream class {} declared twice",
                stream.id
            )));
        }
        self.streams.insert(stream.id, stream);
        Ok(())
    }

    pub fn add_event(&mut self, event: EventDescriptor) -> Result<()> {
        let stream = self.streams.get_mut(&event.stream_id).ok_or_else(|| {
            CtfError::metadata(format!(
                "event '{}' refers to undeclared stream class {}",
                event.name, event.stream_id
            ))
        })?;
        if stream.events.contains_key(&event.id) {
            return Err(CtfError::metadata(format!(
                "event id {} declared twice in stream class {}",
                event.id, event.stream_id
            )));
        }
        stream.events.insert(event.id, Arc::new(event));
        Ok(())
    }

    pub fn clocks(&self) -> &[Arc<Clock>] {
        &self.clocks
    }

    pub fn clock(&self, name: &str) -> Option<&Arc<Clock>> {
        self.clocks_by_name.get(name)
    }

    /// Picks the clock for a timestamp field: the one named by its `map`,
    /// otherwise the trace's only clock.
    pub fn resolve_clock(&self, map: Option<&str>) -> Result<Arc<Clock>> {
        if let Some(name) = map {
            return self
                .clock(name)
                .cloned()
                .ok_or_else(|| CtfError::corrupt(format!("timestamp mapped to unknown clock '{name}'")));
        }
        match self.clocks.as_slice() {
            [only] => Ok(Arc::clone(only)),
            [] => Err(CtfError::corrupt("timestamp found but the trace declares no clock")),
            many => Err(CtfError::corrupt(format!(
                "timestamp has no clock mapping and the trace declares {} clocks",
                many.len()
            ))),
        }
    }

    pub fn packet_header(&self) -> Option<&StructType> {
        self.packet_header.as_ref()
    }

    pub fn stream(&self, id: u64) -> Option<&StreamClass> {
        self.streams.get(&id)
    }

    pub fn streams(&self) -> impl Iterator<Item = &StreamClass> {
        self.streams.values()
    }

    pub fn event(&self, stream_id: u64, id: u64) -> Option<&Arc<EventDescriptor>> {
        self.stream(stream_id)?.event(id)
    }

    pub fn events(&self) -> impl Iterator<Item = &Arc<EventDescriptor>> {
        self.streams.values().flat_map(StreamClass::events)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let manifest: Manifest = serde_json::from_str(text)?;
        manifest.build()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| CtfError::io(path, e))?;
        let metadata = Self::from_json(&text)?;
        debug!(
            path = %path.display(),
            clocks = metadata.clocks.len(),
            streams = metadata.streams.len(),
            "loaded metadata manifest"
        );
        Ok(metadata)
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    clocks: Vec<ClockDecl>,
    #[serde(default)]
    types: BTreeMap<String, TypeDecl>,
    #[serde(default)]
    packet_header: Option<TypeDecl>,
    #[serde(default)]
    streams: Vec<StreamDecl>,
    #[serde(default)]
    events: Vec<EventDecl>,
}

#[derive(Debug, Deserialize)]
struct ClockDecl {
    name: String,
    #[serde(default)]
    uuid: Option<Uuid>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_frequency")]
    frequency: u64,
    #[serde(default)]
    precision: u64,
    #[serde(default)]
    offset_seconds: i64,
    #[serde(default)]
    offset_cycles: u64,
}

fn default_frequency() -> u64 {
    1_000_000_000
}

#[derive(Debug, Deserialize)]
struct StreamDecl {
    #[serde(default)]
    id: u64,
    #[serde(default)]
    packet_context: Option<TypeDecl>,
    #[serde(default)]
    event_header: Option<TypeDecl>,
    #[serde(default)]
    event_context: Option<TypeDecl>,
}

#[derive(Debug, Deserialize)]
struct EventDecl {
    id: u64,
    name: String,
    #[serde(default)]
    stream_id: u64,
    #[serde(default)]
    log_level: Option<i64>,
    #[serde(default)]
    context: Option<TypeDecl>,
    #[serde(default)]
    fields: Option<TypeDecl>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum TypeDecl {
    Integer {
        size: u32,
        #[serde(default)]
        align: Option<u32>,
        #[serde(default)]
        signed: bool,
        #[serde(default)]
        encoding: Encoding,
        #[serde(default)]
        base: Option<u32>,
        #[serde(default)]
        byte_order: ByteOrder,
        #[serde(default)]
        map: Option<String>,
    },
    Float {
        exp_dig: u32,
        mant_dig: u32,
        #[serde(default)]
        align: Option<u32>,
        #[serde(default)]
        byte_order: ByteOrder,
    },
    String {
        #[serde(default)]
        encoding: Encoding,
    },
    Enum {
        base: Box<TypeDecl>,
        #[serde(default)]
        mappings: Vec<MappingDecl>,
    },
    Struct {
        #[serde(default)]
        fields: Vec<FieldDecl>,
        #[serde(default)]
        align: Option<u32>,
    },
    Variant {
        tag: String,
        options: Vec<FieldDecl>,
    },
    Array {
        element: Box<TypeDecl>,
        length: LengthDecl,
    },
    Ref {
        name: String,
    },
}

#[derive(Debug, Deserialize)]
struct FieldDecl {
    name: String,
    #[serde(rename = "type")]
    ty: TypeDecl,
}

#[derive(Debug, Deserialize)]
struct MappingDecl {
    name: String,
    #[serde(default)]
    value: Option<i64>,
    #[serde(default)]
    range: Option<(i64, i64)>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LengthDecl {
    Fixed(u64),
    Field(String),
}

impl Manifest {
    fn build(self) -> Result<Metadata> {
        let mut metadata = Metadata::new();
        for decl in self.clocks {
            let mut clock = Clock::new(decl.name, decl.frequency)?
                .with_offset(decl.offset_seconds, decl.offset_cycles);
            clock.uuid = decl.uuid;
            clock.description = decl.description;
            clock.precision = decl.precision;
            metadata.add_clock(clock)?;
        }

        let resolver = Resolver { types: &self.types };
        metadata.set_packet_header(resolver.scope(self.packet_header.as_ref(), "packet_header")?);

        // A trace with a single implicit stream may leave the stream list out.
        if self.streams.is_empty() {
            metadata.add_stream(StreamClass::new(0))?;
        }
        for decl in &self.streams {
            let mut stream = StreamClass::new(decl.id);
            stream.packet_context = resolver.scope(decl.packet_context.as_ref(), "packet_context")?;
            stream.event_header = resolver.scope(decl.event_header.as_ref(), "event_header")?;
            stream.event_context = resolver.scope(decl.event_context.as_ref(), "event_context")?;
            metadata.add_stream(stream)?;
        }

        for decl in &self.events {
            let mut event = EventDescriptor::new(decl.id, decl.name.clone());
            event.stream_id = decl.stream_id;
            event.log_level = decl.log_level;
            event.context = resolver.scope(decl.context.as_ref(), "context")?;
            event.fields = resolver.scope(decl.fields.as_ref(), "fields")?;
            metadata.add_event(event)?;
        }
        Ok(metadata)
    }
}

/// Turns manifest declarations into descriptors, following `ref` entries
/// through the named type table.
struct Resolver<'a> {
    types: &'a BTreeMap<String, TypeDecl>,
}

impl Resolver<'_> {
    fn scope(&self, decl: Option<&TypeDecl>, what: &str) -> Result<Option<StructType>> {
        let Some(decl) = decl else {
            return Ok(None);
        };
        match self.resolve(decl, &mut Vec::new())? {
            TypeDescriptor::Struct(ty) => Ok(Some(ty)),
            _ => Err(CtfError::metadata(format!("{what} must be a struct"))),
        }
    }

    fn resolve(&self, decl: &TypeDecl, visiting: &mut Vec<String>) -> Result<TypeDescriptor> {
        Ok(match decl {
            TypeDecl::Integer {
                size,
                align,
                signed,
                encoding,
                base,
                byte_order,
                map,
            } => {
                let mut ty = IntegerType::new(*size)?
                    .signed(*signed)
                    .with_encoding(*encoding)
                    .with_base(base.unwrap_or(10))
                    .with_byte_order(*byte_order);
                if let Some(align) = align {
                    ty = ty.with_align(*align)?;
                }
                if let Some(map) = map {
                    ty = ty.with_map(map.as_str());
                }
                ty.into()
            }
            TypeDecl::Float {
                exp_dig,
                mant_dig,
                align,
                byte_order,
            } => {
                let mut ty = FloatType::new(*exp_dig, *mant_dig)?.with_byte_order(*byte_order);
                if let Some(align) = align {
                    ty = ty.with_align(*align)?;
                }
                ty.into()
            }
            TypeDecl::String { encoding } => StringType::new(*encoding).into(),
            TypeDecl::Enum { base, mappings } => {
                let TypeDescriptor::Integer(base) = self.resolve(base, visiting)? else {
                    return Err(CtfError::metadata("enum base must be an integer"));
                };
                let mut ty = EnumType::new(base);
                for mapping in mappings {
                    let range = match (mapping.value, mapping.range) {
                        (Some(value), None) => Some((value as i128, value as i128)),
                        (None, Some((start, end))) => Some((start as i128, end as i128)),
                        (None, None) => None,
                        (Some(_), Some(_)) => {
                            return Err(CtfError::metadata(format!(
                                "enumerator '{}' has both a value and a range",
                                mapping.name
                            )))
                        }
                    };
                    ty.add_mapping(mapping.name.as_str(), range)?;
                }
                ty.into()
            }
            TypeDecl::Struct { fields, align } => {
                let mut ty = StructType::new();
                for field in fields {
                    ty.add_field(field.name.as_str(), self.resolve(&field.ty, visiting)?)?;
                }
                if let Some(align) = align {
                    ty = ty.with_align(*align)?;
                }
                ty.into()
            }
            TypeDecl::Variant { tag, options } => {
                let mut ty = VariantType::new(tag.as_str());
                for option in options {
                    ty.add_option(option.name.as_str(), self.resolve(&option.ty, visiting)?)?;
                }
                ty.into()
            }
            TypeDecl::Array { element, length } => {
                let length = match length {
                    LengthDecl::Fixed(len) => ArrayLength::Fixed(*len),
                    LengthDecl::Field(path) => ArrayLength::Field(path.clone()),
                };
                ArrayType::new(self.resolve(element, visiting)?, length).into()
            }
            TypeDecl::Ref { name } => {
                if visiting.contains(name) {
                    return Err(CtfError::metadata(format!(
                        "type '{name}' refers to itself"
                    )));
                }
                let decl = self
                    .types
                    .get(name)
                    .ok_or_else(|| CtfError::metadata(format!("unknown type '{name}'")))?;
                visiting.push(name.clone());
                let resolved = self.resolve(decl, visiting)?;
                visiting.pop();
                resolved
            }
        })
    }
}
