//! Report URI parsing and backend selection
//!
//! - `file:///path/report.bbp`, or a bare path ending in `.bin`, `.rep` or `.bbp` → binary
//! - `kv:///path/to/store?shards=4&name=soma&target=Mosaic` → key/value
//! - `null://` → write-only sink
//! - `dummy://?size=1024&randomValues` → synthetic read source; writes are discarded

use std::path::PathBuf;

use tracing::warn;

use crate::backend::dummy::DEFAULT_CELLS;
use crate::config::ReadStrategy;
use crate::error::{ReportError, Result};

const BINARY_EXTENSIONS: &[&str] = &["bin", "rep", "bbp"];

/// Default key scope of a key/value report
pub const DEFAULT_REPORT_NAME: &str = "default";
/// Default target of a key/value report
pub const DEFAULT_TARGET: &str = "allCompartments";

/// A parsed report location.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportUri {
    Binary {
        path: PathBuf,
        strategy: Option<ReadStrategy>,
    },
    KeyValue {
        path: PathBuf,
        shards: Option<usize>,
        name: String,
        target: String,
    },
    Null,
    Dummy {
        cells: usize,
        random_values: bool,
    },
}

impl ReportUri {
    /// Parse `uri`, failing with `UnsupportedFormat` when no backend matches.
    pub fn parse(uri: &str) -> Result<Self> {
        let unsupported = |reason: &str| ReportError::UnsupportedFormat {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = match uri.split_once("://") {
            Some((scheme, rest)) => (Some(scheme), rest),
            None => (None, uri),
        };
        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };
        let params = parse_query(query);

        match scheme {
            None | Some("file") => {
                let path = PathBuf::from(location);
                let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
                if !BINARY_EXTENSIONS.contains(&extension) {
                    return Err(unsupported("expected a .bin, .rep or .bbp file"));
                }
                let mut strategy = None;
                for (key, value) in params {
                    match key {
                        "strategy" => strategy = Some(value.parse().map_err(ReportError::InvalidArgument)?),
                        other => warn!(uri, parameter = other, "Ignoring unknown report parameter"),
                    }
                }
                Ok(ReportUri::Binary { path, strategy })
            }
            Some("kv") => {
                if location.is_empty() {
                    return Err(unsupported("key/value report needs a store path"));
                }
                let mut shards = None;
                let mut name = DEFAULT_REPORT_NAME.to_string();
                let mut target = DEFAULT_TARGET.to_string();
                for (key, value) in params {
                    match key {
                        "shards" => {
                            let count = value.parse::<usize>().map_err(|_| {
                                ReportError::InvalidArgument(format!("invalid shard count '{}'", value))
                            })?;
                            shards = Some(count);
                        }
                        "name" => name = value.to_string(),
                        "target" => target = value.to_string(),
                        other => warn!(uri, parameter = other, "Ignoring unknown report parameter"),
                    }
                }
                if name.is_empty() || target.is_empty() || name.contains('/') || target.contains('/') {
                    return Err(ReportError::InvalidArgument(
                        "report name and target must be non-empty and contain no '/'".into(),
                    ));
                }
                Ok(ReportUri::KeyValue { path: PathBuf::from(location), shards, name, target })
            }
            Some("null") => Ok(ReportUri::Null),
            Some("dummy") => {
                let mut cells = DEFAULT_CELLS;
                let mut random_values = false;
                for (key, value) in params {
                    match key {
                        "size" => {
                            cells = value.parse::<usize>().map_err(|_| {
                                ReportError::InvalidArgument(format!("invalid dummy report size '{}'", value))
                            })?;
                        }
                        "randomValues" => random_values = true,
                        other => warn!(uri, parameter = other, "Ignoring unknown report parameter"),
                    }
                }
                Ok(ReportUri::Dummy { cells, random_values })
            }
            Some(_) => Err(unsupported("no backend registered for this scheme")),
        }
    }
}

fn parse_query(query: Option<&str>) -> Vec<(&str, &str)> {
    query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_uris() {
        assert_eq!(
            ReportUri::parse("file:///data/soma.bbp").unwrap(),
            ReportUri::Binary { path: "/data/soma.bbp".into(), strategy: None }
        );
        assert_eq!(
            ReportUri::parse("voltages.bin?strategy=mmap").unwrap(),
            ReportUri::Binary { path: "voltages.bin".into(), strategy: Some(ReadStrategy::MemoryMapped) }
        );
    }

    #[test]
    fn test_kv_uri_with_params() {
        let uri = ReportUri::parse("kv:///scratch/reports?shards=3&name=soma&target=Mosaic").unwrap();
        assert_eq!(
            uri,
            ReportUri::KeyValue {
                path: "/scratch/reports".into(),
                shards: Some(3),
                name: "soma".into(),
                target: "Mosaic".into(),
            }
        );
    }

    #[test]
    fn test_kv_defaults() {
        match ReportUri::parse("kv:///store").unwrap() {
            ReportUri::KeyValue { name, target, shards, .. } => {
                assert_eq!(name, DEFAULT_REPORT_NAME);
                assert_eq!(target, DEFAULT_TARGET);
                assert_eq!(shards, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_null_uri() {
        assert_eq!(ReportUri::parse("null://").unwrap(), ReportUri::Null);
    }

    #[test]
    fn test_dummy_uri() {
        assert_eq!(
            ReportUri::parse("dummy://").unwrap(),
            ReportUri::Dummy { cells: DEFAULT_CELLS, random_values: false }
        );
        assert_eq!(
            ReportUri::parse("dummy://?size=16&randomValues").unwrap(),
            ReportUri::Dummy { cells: 16, random_values: true }
        );
        assert!(matches!(ReportUri::parse("dummy://?size=lots"), Err(ReportError::InvalidArgument(_))));
    }

    #[test]
    fn test_unsupported() {
        assert!(matches!(ReportUri::parse("report.h5"), Err(ReportError::UnsupportedFormat { .. })));
        assert!(matches!(ReportUri::parse("s3://bucket/x.bbp"), Err(ReportError::UnsupportedFormat { .. })));
        assert!(matches!(ReportUri::parse("kv://"), Err(ReportError::UnsupportedFormat { .. })));
    }

    #[test]
    fn test_bad_parameters() {
        assert!(matches!(ReportUri::parse("x.bbp?strategy=warp"), Err(ReportError::InvalidArgument(_))));
        assert!(matches!(ReportUri::parse("kv:///s?shards=many"), Err(ReportError::InvalidArgument(_))));
        assert!(matches!(ReportUri::parse("kv:///s?name=a/b"), Err(ReportError::InvalidArgument(_))));
    }
}
