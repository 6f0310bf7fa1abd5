//! File loading for engine configuration and persisted graphs.
//!
//! Provides format detection (RON/JSON/TOML), file discovery, and
//! (de)serialization helpers, plus the typed entry points used by hosts:
//! [`load_config`], [`load_graph`] and [`save_graph`].

use flowplan_core::config::SolverConfig;
use flowplan_core::graph::{FlowGraph, GraphError};
use flowplan_core::recipe::RecipeBook;
use flowplan_core::record::{GraphRecord, RecordError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Base name of the solver configuration file.
pub const CONFIG_BASE_NAME: &str = "solver";

// ===========================================================================
// Errors
// ===========================================================================

/// Errors that can occur while loading or saving data files.
#[derive(Debug, thiserror::Error)]
pub enum DataLoadError {
    /// A required data file was not found in the given directory.
    #[error("required file '{file}' not found in {dir}")]
    MissingRequired { file: String, dir: PathBuf },

    /// The file has an extension we don't support.
    #[error("unsupported format for file: {file}")]
    UnsupportedFormat { file: PathBuf },

    /// Two files with the same base name but different formats exist.
    #[error("conflicting formats: {a} and {b}")]
    ConflictingFormats { a: PathBuf, b: PathBuf },

    /// A deserialization error occurred.
    #[error("parse error in {file}: {detail}")]
    Parse { file: PathBuf, detail: String },

    /// A value could not be written in the file's format.
    #[error("serialize error for {file}: {detail}")]
    Serialize { file: PathBuf, detail: String },

    /// The record parsed but does not describe a valid graph.
    #[error(transparent)]
    Record(#[from] RecordError),

    /// The graph could not be snapshotted.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ===========================================================================
// Format detection
// ===========================================================================

/// Supported data file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Ron,
    Toml,
    Json,
}

/// Detect the format of a file based on its extension.
pub fn detect_format(path: &Path) -> Result<Format, DataLoadError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ron") => Ok(Format::Ron),
        Some("toml") => Ok(Format::Toml),
        Some("json") => Ok(Format::Json),
        _ => Err(DataLoadError::UnsupportedFormat {
            file: path.to_path_buf(),
        }),
    }
}

// ===========================================================================
// File discovery
// ===========================================================================

/// Scan a directory for a data file with the given base name (without extension).
///
/// Looks for `{base_name}.ron`, `{base_name}.toml`, and `{base_name}.json`.
/// Returns `Ok(None)` if no file is found, or `Err(ConflictingFormats)` if
/// multiple formats exist for the same base name.
pub fn find_data_file(dir: &Path, base_name: &str) -> Result<Option<PathBuf>, DataLoadError> {
    let mut found: Option<PathBuf> = None;

    for ext in ["ron", "toml", "json"] {
        let candidate = dir.join(format!("{base_name}.{ext}"));
        if candidate.exists() {
            if let Some(existing) = found {
                return Err(DataLoadError::ConflictingFormats {
                    a: existing,
                    b: candidate,
                });
            }
            found = Some(candidate);
        }
    }

    Ok(found)
}

/// Like [`find_data_file`], but returns an error if no file is found.
pub fn require_data_file(dir: &Path, base_name: &str) -> Result<PathBuf, DataLoadError> {
    find_data_file(dir, base_name)?.ok_or_else(|| DataLoadError::MissingRequired {
        file: base_name.to_string(),
        dir: dir.to_path_buf(),
    })
}

// ===========================================================================
// (De)serialization
// ===========================================================================

/// Read a file and deserialize it according to its format (detected from extension).
pub fn deserialize_file<T: DeserializeOwned>(path: &Path) -> Result<T, DataLoadError> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    let parse_err = |detail: String| DataLoadError::Parse {
        file: path.to_path_buf(),
        detail,
    };

    match format {
        Format::Ron => ron::from_str(&content).map_err(|e| parse_err(e.to_string())),
        Format::Json => serde_json::from_str(&content).map_err(|e| parse_err(e.to_string())),
        Format::Toml => toml::from_str(&content).map_err(|e| parse_err(e.to_string())),
    }
}

/// Serialize `value` in the format matching `path`'s extension and write it.
pub fn serialize_file<T: Serialize>(path: &Path, value: &T) -> Result<(), DataLoadError> {
    let format = detect_format(path)?;
    let ser_err = |detail: String| DataLoadError::Serialize {
        file: path.to_path_buf(),
        detail,
    };

    let content = match format {
        Format::Ron => ron::ser::to_string_pretty(value, ron::ser::PrettyConfig::default())
            .map_err(|e| ser_err(e.to_string()))?,
        Format::Json => serde_json::to_string_pretty(value).map_err(|e| ser_err(e.to_string()))?,
        Format::Toml => toml::to_string_pretty(value).map_err(|e| ser_err(e.to_string()))?,
    };
    std::fs::write(path, content)?;
    Ok(())
}

// ===========================================================================
// Typed entry points
// ===========================================================================

/// Load `solver.{ron,toml,json}` from `dir`. A missing file yields the
/// default configuration; missing fields take their defaults.
pub fn load_config(dir: &Path) -> Result<SolverConfig, DataLoadError> {
    match find_data_file(dir, CONFIG_BASE_NAME)? {
        Some(path) => {
            let config: SolverConfig = deserialize_file(&path)?;
            debug!(path = %path.display(), ?config, "loaded solver config");
            Ok(config)
        }
        None => {
            debug!(dir = %dir.display(), "no solver config, using defaults");
            Ok(SolverConfig::default())
        }
    }
}

pub fn load_graph_record(path: &Path) -> Result<GraphRecord, DataLoadError> {
    deserialize_file(path)
}

pub fn save_graph_record(path: &Path, record: &GraphRecord) -> Result<(), DataLoadError> {
    serialize_file(path, record)
}

/// Load a persisted graph, rebuilding Craft pins from `recipes`.
pub fn load_graph(path: &Path, recipes: &impl RecipeBook) -> Result<FlowGraph, DataLoadError> {
    let record = load_graph_record(path)?;
    let graph = FlowGraph::from_record(&record, recipes)?;
    info!(
        path = %path.display(),
        nodes = graph.node_count(),
        links = graph.link_count(),
        "loaded graph"
    );
    Ok(graph)
}

pub fn save_graph(path: &Path, graph: &FlowGraph) -> Result<(), DataLoadError> {
    let record = graph.to_record()?;
    save_graph_record(path, &record)?;
    info!(path = %path.display(), nodes = record.nodes.len(), "saved graph");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
