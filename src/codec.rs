//! C1: MVT codec. Decompresses/compresses the GZIP framing used by MBTiles
//! `tile_data` blobs and reads/writes the Mapbox Vector Tile protobuf schema.
//!
//! Tags and feature geometry are kept as opaque data rather than decoded
//! into typed properties/coordinates, so that untouched layers and
//! features round-trip byte-for-byte through decode+encode and the
//! keys/values tables never need renumbering.

use std::io::Read;

use anyhow::{Context, Result, bail};
use flate2::Compression;
use flate2::read::{GzDecoder, GzEncoder};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    pub layers: Vec<Layer>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub version: u32,
    pub name: String,
    pub features: Vec<Feature>,
    pub keys: Vec<String>,
    pub values: Vec<Value>,
    pub extent: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: Option<u64>,
    /// Alternating key-index/value-index pairs into the owning layer's
    /// `keys`/`values` tables. Kept raw and unvalidated on decode; the
    /// transformer is defensive about malformed pairs.
    pub tags: Vec<u32>,
    pub geom_type: GeomType,
    /// Opaque packed-uint32 geometry command stream, copied verbatim.
    pub geometry: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeomType {
    Unknown,
    Point,
    LineString,
    Polygon,
}

impl GeomType {
    fn from_proto(v: u64) -> Self {
        match v {
            1 => GeomType::Point,
            2 => GeomType::LineString,
            3 => GeomType::Polygon,
            _ => GeomType::Unknown,
        }
    }

    fn to_proto(self) -> u64 {
        match self {
            GeomType::Unknown => 0,
            GeomType::Point => 1,
            GeomType::LineString => 2,
            GeomType::Polygon => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Float(f32),
    Double(f64),
    Int(i64),
    Uint(u64),
    Sint(i64),
    Bool(bool),
}

/// Decompress a GZIP-framed MVT blob into a `Tile`.
///
/// Returns `Err` tagged for `DecodeError` handling upstream: empty input,
/// bad gzip framing, or malformed protobuf all fail here; callers treat
/// the whole thing as one non-fatal per-tile failure.
pub fn decode(blob: &[u8]) -> Result<Tile> {
    if blob.is_empty() {
        bail!("empty tile payload");
    }
    if !blob.starts_with(&GZIP_MAGIC) {
        // Non-gzipped tile payloads are explicitly out of scope: treat
        // anything without the gzip magic as malformed rather than
        // guessing it is raw protobuf.
        bail!("tile payload is not gzip-framed");
    }
    let mut decoder = GzDecoder::new(blob);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .context("failed to decompress gzip tile payload")?;
    decode_proto(&raw).context("failed to parse MVT protobuf")
}

/// Serialize a `Tile` back into a GZIP-framed MVT blob.
pub fn encode(tile: &Tile) -> Result<Vec<u8>> {
    let raw = encode_proto(tile);
    let mut encoder = GzEncoder::new(raw.as_slice(), Compression::default());
    let mut out = Vec::new();
    encoder
        .read_to_end(&mut out)
        .context("failed to gzip-compress tile payload")?;
    Ok(out)
}

// ---------------------------------------------------------------------
// protobuf primitives
// ---------------------------------------------------------------------

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn read_u8(&mut self) -> Result<u8> {
        let byte = *self.data.get(self.pos).context("unexpected end of buffer")?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_varint(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            value |= (u64::from(byte) & 0x7F) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift >= 70 {
                bail!("varint too long");
            }
        }
        Ok(value)
    }

    fn read_svarint(&mut self) -> Result<i64> {
        let value = self.read_varint()? as i64;
        Ok((value >> 1) ^ -(value & 1))
    }

    fn read_pbf_key(&mut self) -> Result<(u32, u8)> {
        let value = self.read_varint().context("reading pbf key")?;
        Ok(((value >> 3) as u32, (value & 0x7) as u8))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&e| e <= self.data.len())
            .context("length-delimited field overruns buffer")?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_length_delimited(&mut self) -> Result<&'a [u8]> {
        let len = self.read_varint().context("reading length prefix")? as usize;
        self.read_bytes(len)
    }

    fn read_fixed64(&mut self) -> Result<[u8; 8]> {
        let bytes = self.read_bytes(8)?;
        Ok(bytes.try_into().unwrap())
    }

    fn read_fixed32(&mut self) -> Result<[u8; 4]> {
        let bytes = self.read_bytes(4)?;
        Ok(bytes.try_into().unwrap())
    }

    /// Skip a field whose wire type is not length-delimited, varint,
    /// fixed32 or fixed64 (never happens for MVT, kept for robustness).
    fn skip(&mut self, wire_type: u8) -> Result<()> {
        match wire_type {
            0 => {
                self.read_varint()?;
            }
            1 => {
                self.read_fixed64()?;
            }
            2 => {
                self.read_length_delimited()?;
            }
            5 => {
                self.read_fixed32()?;
            }
            other => bail!("unsupported wire type {other}"),
        }
        Ok(())
    }
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Writer { buf: Vec::new() }
    }

    fn write_varint(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                break;
            }
            self.buf.push(byte | 0x80);
        }
    }

    fn write_svarint(&mut self, value: i64) {
        let zigzag = ((value << 1) ^ (value >> 63)) as u64;
        self.write_varint(zigzag);
    }

    fn write_key(&mut self, field: u32, wire_type: u8) {
        self.write_varint(((field as u64) << 3) | wire_type as u64);
    }

    fn write_length_delimited(&mut self, field: u32, bytes: &[u8]) {
        self.write_key(field, 2);
        self.write_varint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    fn write_string(&mut self, field: u32, value: &str) {
        self.write_length_delimited(field, value.as_bytes());
    }

    fn write_varint_field(&mut self, field: u32, value: u64) {
        self.write_key(field, 0);
        self.write_varint(value);
    }

    fn write_packed_varints(&mut self, field: u32, values: &[u32]) {
        if values.is_empty() {
            return;
        }
        let mut inner = Writer::new();
        for &v in values {
            inner.write_varint(v as u64);
        }
        self.write_length_delimited(field, &inner.buf);
    }
}

// ---------------------------------------------------------------------
// Tile <-> protobuf
// ---------------------------------------------------------------------

fn decode_proto(data: &[u8]) -> Result<Tile> {
    let mut reader = Reader::new(data);
    let mut layers = Vec::new();
    while !reader.is_empty() {
        let (field, wire_type) = reader.read_pbf_key()?;
        match (field, wire_type) {
            (3, 2) => {
                let bytes = reader.read_length_delimited()?;
                layers.push(decode_layer(bytes).context("decoding layer")?);
            }
            (_, wt) => reader.skip(wt)?,
        }
    }
    Ok(Tile { layers })
}

fn encode_proto(tile: &Tile) -> Vec<u8> {
    let mut writer = Writer::new();
    for layer in &tile.layers {
        let bytes = encode_layer(layer);
        writer.write_length_delimited(3, &bytes);
    }
    writer.buf
}

fn decode_layer(data: &[u8]) -> Result<Layer> {
    let mut reader = Reader::new(data);
    let mut name = String::new();
    let mut features = Vec::new();
    let mut keys = Vec::new();
    let mut values = Vec::new();
    let mut extent = 4096u32;
    let mut version = 1u32;

    while !reader.is_empty() {
        let (field, wire_type) = reader.read_pbf_key()?;
        match (field, wire_type) {
            (1, 2) => {
                name = String::from_utf8_lossy(reader.read_length_delimited()?).into_owned();
            }
            (2, 2) => {
                let bytes = reader.read_length_delimited()?;
                features.push(decode_feature(bytes).context("decoding feature")?);
            }
            (3, 2) => {
                keys.push(String::from_utf8_lossy(reader.read_length_delimited()?).into_owned());
            }
            (4, 2) => {
                let bytes = reader.read_length_delimited()?;
                values.push(decode_value(bytes).context("decoding value")?);
            }
            (5, 0) => extent = reader.read_varint()? as u32,
            (15, 0) => version = reader.read_varint()? as u32,
            (_, wt) => reader.skip(wt)?,
        }
    }

    Ok(Layer {
        version,
        name,
        features,
        keys,
        values,
        extent,
    })
}

fn encode_layer(layer: &Layer) -> Vec<u8> {
    let mut writer = Writer::new();
    writer.write_varint_field(15, layer.version as u64);
    writer.write_string(1, &layer.name);
    for feature in &layer.features {
        let bytes = encode_feature(feature);
        writer.write_length_delimited(2, &bytes);
    }
    for key in &layer.keys {
        writer.write_string(3, key);
    }
    for value in &layer.values {
        let bytes = encode_value(value);
        writer.write_length_delimited(4, &bytes);
    }
    writer.write_varint_field(5, layer.extent as u64);
    writer.buf
}

fn decode_feature(data: &[u8]) -> Result<Feature> {
    let mut reader = Reader::new(data);
    let mut id = None;
    let mut tags = Vec::new();
    let mut geom_type = GeomType::Unknown;
    let mut geometry = Vec::new();

    while !reader.is_empty() {
        let (field, wire_type) = reader.read_pbf_key()?;
        match (field, wire_type) {
            (1, 0) => id = Some(reader.read_varint()?),
            (2, 2) => {
                let bytes = reader.read_length_delimited()?;
                tags = decode_packed_varints(bytes)?
                    .into_iter()
                    .map(|v| v as u32)
                    .collect();
            }
            (3, 0) => geom_type = GeomType::from_proto(reader.read_varint()?),
            (4, 2) => {
                let bytes = reader.read_length_delimited()?;
                geometry = decode_packed_varints(bytes)?
                    .into_iter()
                    .map(|v| v as u32)
                    .collect();
            }
            (_, wt) => reader.skip(wt)?,
        }
    }

    Ok(Feature {
        id,
        tags,
        geom_type,
        geometry,
    })
}

fn encode_feature(feature: &Feature) -> Vec<u8> {
    let mut writer = Writer::new();
    if let Some(id) = feature.id {
        writer.write_varint_field(1, id);
    }
    writer.write_packed_varints(2, &feature.tags);
    writer.write_varint_field(3, feature.geom_type.to_proto());
    writer.write_packed_varints(4, &feature.geometry);
    writer.buf
}

fn decode_packed_varints(data: &[u8]) -> Result<Vec<u64>> {
    let mut reader = Reader::new(data);
    let mut out = Vec::new();
    while !reader.is_empty() {
        out.push(reader.read_varint()?);
    }
    Ok(out)
}

fn decode_value(data: &[u8]) -> Result<Value> {
    let mut reader = Reader::new(data);
    let mut result = None;
    while !reader.is_empty() {
        let (field, wire_type) = reader.read_pbf_key()?;
        match (field, wire_type) {
            (1, 2) => {
                let s = String::from_utf8_lossy(reader.read_length_delimited()?).into_owned();
                result = Some(Value::String(s));
            }
            (2, 5) => {
                let bytes = reader.read_fixed32()?;
                result = Some(Value::Float(f32::from_le_bytes(bytes)));
            }
            (3, 1) => {
                let bytes = reader.read_fixed64()?;
                result = Some(Value::Double(f64::from_le_bytes(bytes)));
            }
            (4, 0) => result = Some(Value::Int(reader.read_varint()? as i64)),
            (5, 0) => result = Some(Value::Uint(reader.read_varint()?)),
            (6, 0) => result = Some(Value::Sint(reader.read_svarint()?)),
            (7, 0) => result = Some(Value::Bool(reader.read_varint()? != 0)),
            (_, wt) => reader.skip(wt)?,
        }
    }
    result.context("value message with no recognized field")
}

fn encode_value(value: &Value) -> Vec<u8> {
    let mut writer = Writer::new();
    match value {
        Value::String(s) => writer.write_string(1, s),
        Value::Float(v) => {
            writer.write_key(2, 5);
            writer.buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::Double(v) => {
            writer.write_key(3, 1);
            writer.buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::Int(v) => writer.write_varint_field(4, *v as u64),
        Value::Uint(v) => writer.write_varint_field(5, *v),
        Value::Sint(v) => {
            writer.write_key(6, 0);
            writer.write_svarint(*v);
        }
        Value::Bool(v) => writer.write_varint_field(7, if *v { 1 } else { 0 }),
    }
    writer.buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tile() -> Tile {
        Tile {
            layers: vec![Layer {
                version: 2,
                name: "streets".to_string(),
                keys: vec!["kind".to_string()],
                values: vec![Value::String("residential".to_string())],
                extent: 4096,
                features: vec![Feature {
                    id: Some(1),
                    tags: vec![0, 0],
                    geom_type: GeomType::LineString,
                    geometry: vec![9, 4, 4, 18, 2, 2],
                }],
            }],
        }
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let tile = sample_tile();
        let blob = encode(&tile).expect("encode");
        assert!(blob.starts_with(&GZIP_MAGIC));
        let decoded = decode(&blob).expect("decode");
        assert_eq!(decoded, tile);
    }

    #[test]
    fn rejects_non_gzip_payload() {
        // Non-gzipped tile payloads are out of scope; raw protobuf bytes
        // without the gzip magic must be rejected, not silently accepted.
        let tile = sample_tile();
        let raw = encode_proto(&tile);
        assert!(decode(&raw).is_err());
    }

    #[test]
    fn rejects_empty_payload() {
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn preserves_multiple_layers_and_value_variants() {
        let tile = Tile {
            layers: vec![
                Layer {
                    version: 2,
                    name: "water".to_string(),
                    keys: vec!["area".to_string()],
                    values: vec![Value::Double(12.5), Value::Bool(true), Value::Int(-3)],
                    extent: 4096,
                    features: vec![],
                },
                Layer {
                    version: 2,
                    name: "streets".to_string(),
                    keys: vec!["kind".to_string()],
                    values: vec![Value::String("trunk".to_string())],
                    extent: 4096,
                    features: vec![Feature {
                        id: None,
                        tags: vec![0, 0],
                        geom_type: GeomType::Point,
                        geometry: vec![9, 10, 20],
                    }],
                },
            ],
        };
        let blob = encode(&tile).unwrap();
        let decoded = decode(&blob).unwrap();
        assert_eq!(decoded, tile);
    }
}
