//! Inspect command implementation.

use datasync_engine::{classify, FileKind};
use datasync_protocol::CaptureMetadata;
use serde::Serialize;
use std::path::Path;
use tokio::io::AsyncSeekExt;

/// How a file would be uploaded.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Inspected file.
    pub path: String,
    /// `structured` or `arbitrary`.
    pub kind: &'static str,
    /// Total file size in bytes.
    pub file_size: u64,
    /// Bytes that would be sent as chunks.
    pub data_size: u64,
    /// Capture metadata, for structured files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CaptureMetadata>,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(inspect(path))?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            println!("File:      {}", result.path);
            println!("Kind:      {}", result.kind);
            println!("Size:      {} bytes", result.file_size);
            println!("Data:      {} bytes", result.data_size);
            if let Some(meta) = &result.metadata {
                println!("Component: {} ({})", meta.component_name, meta.component_type);
                println!("Method:    {}", meta.method_name);
                println!("Type:      {:?}", meta.data_type);
                if !meta.file_extension.is_empty() {
                    println!("Extension: {}", meta.file_extension);
                }
                if !meta.tags.is_empty() {
                    println!("Tags:      {}", meta.tags.join(", "));
                }
                for (key, value) in &meta.method_parameters {
                    println!("Param:     {} = {}", key, value);
                }
            }
        }
    }
    Ok(())
}

async fn inspect(path: &Path) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let mut file = tokio::fs::File::open(path).await?;
    let file_size = file.metadata().await?.len();
    let kind = classify(&mut file).await?;
    let data_start = file.stream_position().await?;

    let (kind, metadata) = match kind {
        FileKind::Structured(meta) => ("structured", Some(meta)),
        FileKind::Arbitrary => ("arbitrary", None),
    };
    Ok(InspectResult {
        path: path.display().to_string(),
        kind,
        file_size,
        data_size: file_size.saturating_sub(data_start),
        metadata,
    })
}
