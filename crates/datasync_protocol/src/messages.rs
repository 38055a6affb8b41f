//! Protocol messages for uploads.

use crate::error::{ProtocolError, ProtocolResult};
use crate::status::Status;
use crate::MAX_CHUNK_SIZE;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of data carried by an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Binary sensor readings (images, point clouds, ...).
    BinarySensor,
    /// Tabular sensor readings.
    TabularSensor,
    /// An arbitrary file with no capture metadata.
    File,
}

/// Metadata written by the capture subsystem at the head of a capture file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    /// Type of the component that produced the data (e.g. "camera").
    pub component_type: String,
    /// Name of the component instance.
    pub component_name: String,
    /// Method invoked to capture the data.
    pub method_name: String,
    /// Kind of the captured data.
    pub data_type: DataType,
    /// File extension of the captured payload, including the dot.
    pub file_extension: String,
    /// Free-form tags attached to the capture.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Parameters the capture method was invoked with.
    #[serde(default)]
    pub method_parameters: BTreeMap<String, String>,
}

impl CaptureMetadata {
    /// Creates capture metadata with no tags or parameters.
    pub fn new(
        component_type: impl Into<String>,
        component_name: impl Into<String>,
        method_name: impl Into<String>,
        data_type: DataType,
    ) -> Self {
        Self {
            component_type: component_type.into(),
            component_name: component_name.into(),
            method_name: method_name.into(),
            data_type,
            file_extension: String::new(),
            tags: Vec::new(),
            method_parameters: BTreeMap::new(),
        }
    }

    /// Sets the payload file extension.
    pub fn with_file_extension(mut self, extension: impl Into<String>) -> Self {
        self.file_extension = extension.into();
        self
    }

    /// Adds a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Adds a method parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.method_parameters.insert(key.into(), value.into());
        self
    }
}

/// First message of every upload stream.
///
/// Identifies the destination part and describes the file. Structured
/// uploads carry the capture metadata; arbitrary uploads carry only the
/// file name and extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMetadata {
    /// Identity of the part the data is attributed to.
    pub part_id: String,
    /// Base name of the local file.
    pub file_name: String,
    /// File extension, including the dot, or empty.
    pub file_extension: String,
    /// Kind of data being uploaded.
    pub data_type: DataType,
    /// Capture metadata, present for structured files only.
    pub capture: Option<CaptureMetadata>,
}

impl UploadMetadata {
    /// Creates metadata for an arbitrary file.
    pub fn arbitrary(
        part_id: impl Into<String>,
        file_name: impl Into<String>,
        file_extension: impl Into<String>,
    ) -> Self {
        Self {
            part_id: part_id.into(),
            file_name: file_name.into(),
            file_extension: file_extension.into(),
            data_type: DataType::File,
            capture: None,
        }
    }

    /// Creates metadata for a structured capture file.
    pub fn structured(
        part_id: impl Into<String>,
        file_name: impl Into<String>,
        capture: CaptureMetadata,
    ) -> Self {
        Self {
            part_id: part_id.into(),
            file_name: file_name.into(),
            file_extension: capture.file_extension.clone(),
            data_type: capture.data_type,
            capture: Some(capture),
        }
    }

    /// Returns true if this upload carries capture metadata.
    pub fn is_structured(&self) -> bool {
        self.capture.is_some()
    }
}

/// A message sent from the client to the ingestion service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadRequest {
    /// Opens the stream. Must be the first message.
    Metadata(UploadMetadata),
    /// A slice of file data, at most [`MAX_CHUNK_SIZE`] bytes.
    Chunk(Bytes),
    /// Closes the stream, stating how much data was sent.
    Complete {
        /// Number of chunks sent.
        chunks: u64,
        /// Number of data bytes sent.
        bytes: u64,
    },
}

impl UploadRequest {
    /// Checks the message against protocol limits.
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            UploadRequest::Chunk(data) if data.len() > MAX_CHUNK_SIZE => {
                Err(ProtocolError::ChunkTooLarge {
                    len: data.len(),
                    max: MAX_CHUNK_SIZE,
                })
            }
            _ => Ok(()),
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

/// The service's single reply, sent after the stream completes or fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadResponse {
    /// The whole file was received and persisted.
    Ack {
        /// Number of chunks received.
        chunks: u64,
        /// Number of data bytes received.
        bytes: u64,
    },
    /// The upload failed.
    Error(Status),
}

impl UploadResponse {
    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

/// Serializes a value to CBOR bytes.
pub fn to_cbor<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| ProtocolError::encoding_failed(e.to_string()))?;
    Ok(buf)
}

/// Deserializes a value from CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::decoding_failed(e.to_string()))
}
