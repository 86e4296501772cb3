use crate::annotate::DEFAULT_TEXT_SCALE;
use crate::detector::DetectorConfig;
use crate::pipeline::DEFAULT_SOURCE_WIDTH;
use crate::recognizer::RecognizerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not readable at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Runtime configuration: defaults, then an optional TOML file, then
/// `MUGSHOT_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the `<label> (<index>).jpg` training faces.
    pub corpus_dir: PathBuf,
    /// `;`-separated biographical metadata file.
    pub metadata_file: PathBuf,
    /// OpenCV Haar cascade XML.
    pub cascade_path: PathBuf,
    /// TrueType font for labels. Labels are not drawn without one.
    pub font_path: Option<PathBuf>,
    pub text_scale: f32,
    pub source_width: u32,
    pub detector: DetectorConfig,
    pub recognizer: RecognizerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            corpus_dir: PathBuf::from("faces"),
            metadata_file: PathBuf::from("faces/info.txt"),
            cascade_path: PathBuf::from("haarcascade_frontalface_default.xml"),
            font_path: None,
            text_scale: DEFAULT_TEXT_SCALE,
            source_width: DEFAULT_SOURCE_WIDTH,
            detector: DetectorConfig::default(),
            recognizer: RecognizerConfig::default(),
        }
    }
}

impl Config {
    /// Defaults, overlaid by `path` when given, overlaid by the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_toml_file(p)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `MUGSHOT_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MUGSHOT_CORPUS_DIR") {
            self.corpus_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("MUGSHOT_METADATA_FILE") {
            self.metadata_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("MUGSHOT_CASCADE_PATH") {
            self.cascade_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("MUGSHOT_FONT_PATH") {
            self.font_path = Some(PathBuf::from(v)).filter(|p| !p.as_os_str().is_empty());
        }
        override_parsed(&lookup, "MUGSHOT_SCALE_FACTOR", &mut self.detector.scale_factor);
        override_parsed(&lookup, "MUGSHOT_MIN_NEIGHBORS", &mut self.detector.min_neighbors);
        override_parsed(&lookup, "MUGSHOT_DISTANCE_THRESHOLD", &mut self.recognizer.distance_threshold);
        if let Some(v) = lookup("MUGSHOT_EDGE_PRUNING") {
            self.detector.edge_pruning = !matches!(v.trim(), "0" | "false" | "no" | "off");
        }
    }
}

fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.corpus_dir, PathBuf::from("faces"));
        assert_eq!(c.metadata_file, PathBuf::from("faces/info.txt"));
        assert_eq!(c.source_width, 500);
        assert_eq!(c.detector.scale_factor, 1.2);
        assert_eq!(c.detector.min_neighbors, 10);
        assert!(c.detector.edge_pruning);
        assert_eq!(c.recognizer.distance_threshold, 3000.0);
        assert_eq!(c.recognizer.epsilon, 0.001);
        assert!(c.font_path.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let c = Config::from_toml_str(
            r#"
            corpus_dir = "/srv/faces"
            font_path = "/usr/share/fonts/DejaVuSans.ttf"

            [detector]
            min_neighbors = 3

            [recognizer]
            distance_threshold = 2500.0
            "#,
        )
        .unwrap();
        assert_eq!(c.corpus_dir, PathBuf::from("/srv/faces"));
        assert_eq!(c.font_path, Some(PathBuf::from("/usr/share/fonts/DejaVuSans.ttf")));
        assert_eq!(c.detector.min_neighbors, 3);
        assert_eq!(c.detector.scale_factor, 1.2);
        assert_eq!(c.recognizer.distance_threshold, 2500.0);
        assert_eq!(c.recognizer.epsilon, 0.001);
        assert_eq!(c.metadata_file, PathBuf::from("faces/info.txt"));
    }

    #[test]
    fn test_bad_toml() {
        let err = Config::from_toml_str("detector = 5").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_toml_file(Path::new("/nonexistent/mugshot.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut c = Config::default();
        c.apply_overrides(lookup_from(&[
            ("MUGSHOT_CORPUS_DIR", "/data/faces"),
            ("MUGSHOT_METADATA_FILE", "/data/info.txt"),
            ("MUGSHOT_CASCADE_PATH", "/data/cascade.xml"),
            ("MUGSHOT_FONT_PATH", "/data/font.ttf"),
            ("MUGSHOT_SCALE_FACTOR", "1.1"),
            ("MUGSHOT_MIN_NEIGHBORS", "4"),
            ("MUGSHOT_EDGE_PRUNING", "0"),
            ("MUGSHOT_DISTANCE_THRESHOLD", "0"),
        ]));
        assert_eq!(c.corpus_dir, PathBuf::from("/data/faces"));
        assert_eq!(c.metadata_file, PathBuf::from("/data/info.txt"));
        assert_eq!(c.cascade_path, PathBuf::from("/data/cascade.xml"));
        assert_eq!(c.font_path, Some(PathBuf::from("/data/font.ttf")));
        assert_eq!(c.detector.scale_factor, 1.1);
        assert_eq!(c.detector.min_neighbors, 4);
        assert!(!c.detector.edge_pruning);
        assert_eq!(c.recognizer.distance_threshold, 0.0);
    }

    #[test]
    fn test_unparsable_override_is_ignored() {
        let mut c = Config::default();
        c.apply_overrides(lookup_from(&[
            ("MUGSHOT_MIN_NEIGHBORS", "many"),
            ("MUGSHOT_EDGE_PRUNING", "yes"),
        ]));
        assert_eq!(c.detector.min_neighbors, 10);
        assert!(c.detector.edge_pruning);
    }

    #[test]
    fn test_empty_font_override_clears_font() {
        let mut c = Config {
            font_path: Some(PathBuf::from("a.ttf")),
            ..Config::default()
        };
        c.apply_overrides(lookup_from(&[("MUGSHOT_FONT_PATH", "")]));
        assert!(c.font_path.is_none());
    }
}
