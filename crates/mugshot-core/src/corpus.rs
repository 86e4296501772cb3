//! Training corpus: labeled face images on disk plus a biographical metadata file.
//!
//! Layout:
//! - `<image_dir>/<label> (<index>).jpg`, index counting from 0 per label;
//! - a metadata text file with one `;`-separated line of nine fields per label
//!   (label, first name, last name, age, sex, glasses, skin color, beard, hair size).

use crate::image_buffer::{ImageBuffer, ImageError};
use crate::types::FaceInfo;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

// --- Named constants ---
const METADATA_FIELDS: usize = 9;
const METADATA_SEPARATOR: char = ';';
const FIELD_NAMES: [&str; METADATA_FIELDS] = [
    "label",
    "first_name",
    "last_name",
    "age",
    "sex",
    "glasses",
    "skin_color",
    "beard",
    "hair_size",
];

static FILE_NAME_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn file_name_re() -> Option<&'static Regex> {
    FILE_NAME_RE
        .get_or_init(|| match Regex::new(r"^(?P<label>.+?) \((?P<index>\d+)\)\.jpg$") {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::error!(error = %e, "bad corpus file name pattern");
                None
            }
        })
        .as_ref()
}

#[derive(Error, Debug)]
pub enum CorpusError {
    #[error("corpus I/O failure at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corpus format failure in {}{}: {reason}", .path.display(), .line.map(|l| format!(" line {l}")).unwrap_or_default())]
    Format {
        path: PathBuf,
        line: Option<usize>,
        reason: String,
    },
    #[error("corpus image {}: {source}", .path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: ImageError,
    },
    #[error("invalid label {0:?}: must be non-empty without '/', '\\', ';' or line breaks")]
    InvalidLabel(String),
    #[error("invalid {field} {value:?}: must not contain ';' or line breaks")]
    InvalidField { field: &'static str, value: String },
}

impl CorpusError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One training face.
#[derive(Debug, Clone)]
pub struct FaceRecord {
    pub label: String,
    /// Per-label index taken from the file name.
    pub index: u64,
    /// Normalized 92×112 grayscale face.
    pub image: ImageBuffer,
    pub path: PathBuf,
}

/// Ordered face records plus the label → [`FaceInfo`] map.
///
/// Every label among the records has a `FaceInfo`; a `FaceInfo` may exist
/// without any images.
#[derive(Debug, Clone)]
pub struct TrainingCorpus {
    image_dir: PathBuf,
    metadata_path: PathBuf,
    records: Vec<FaceRecord>,
    infos: BTreeMap<String, FaceInfo>,
    generation: u64,
}

impl TrainingCorpus {
    /// Empty corpus rooted at `image_dir`; nothing is read from disk.
    pub fn new(image_dir: impl Into<PathBuf>, metadata_path: impl Into<PathBuf>) -> Self {
        Self {
            image_dir: image_dir.into(),
            metadata_path: metadata_path.into(),
            records: Vec::new(),
            infos: BTreeMap::new(),
            generation: 0,
        }
    }

    /// Create the image directory and an empty metadata file when missing.
    pub fn init(image_dir: &Path, metadata_path: &Path) -> Result<(), CorpusError> {
        std::fs::create_dir_all(image_dir).map_err(|e| CorpusError::io(image_dir, e))?;
        if let Some(parent) = metadata_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CorpusError::io(parent, e))?;
        }
        if !metadata_path.exists() {
            std::fs::write(metadata_path, "").map_err(|e| CorpusError::io(metadata_path, e))?;
            tracing::info!(path = %metadata_path.display(), "created empty metadata file");
        }
        Ok(())
    }

    /// Read every face image and the metadata file.
    pub fn load(image_dir: impl Into<PathBuf>, metadata_path: impl Into<PathBuf>) -> Result<Self, CorpusError> {
        let mut corpus = Self::new(image_dir, metadata_path);

        let entries = std::fs::read_dir(&corpus.image_dir).map_err(|e| CorpusError::io(&corpus.image_dir, e))?;
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CorpusError::io(&corpus.image_dir, e))?;
            let name = entry.file_name();
            match name.to_str().and_then(parse_file_name) {
                Some((label, index)) => found.push((label.to_string(), index, entry.path())),
                None => tracing::debug!(file = ?name, "skipping non-corpus file"),
            }
        }
        found.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));

        for (label, index, path) in found {
            let raw = ImageBuffer::open(&path).map_err(|source| CorpusError::Image {
                path: path.clone(),
                source,
            })?;
            let image = if raw.is_normalized_face() {
                raw
            } else {
                tracing::warn!(
                    path = %path.display(),
                    width = raw.width(),
                    height = raw.height(),
                    "stored face was not normalized"
                );
                raw.normalize_face()
            };
            corpus
                .infos
                .entry(label.clone())
                .or_insert_with(|| FaceInfo::new(label.clone()));
            corpus.records.push(FaceRecord {
                label,
                index,
                image,
                path,
            });
        }

        let text = std::fs::read_to_string(&corpus.metadata_path)
            .map_err(|e| CorpusError::io(&corpus.metadata_path, e))?;
        for info in parse_metadata(&text, &corpus.metadata_path)? {
            corpus.infos.insert(info.label.clone(), info);
        }

        tracing::info!(
            dir = %corpus.image_dir.display(),
            faces = corpus.records.len(),
            labels = corpus.infos.len(),
            "corpus loaded"
        );
        Ok(corpus)
    }

    /// Persist a new training face as `<label> (<index>).jpg` and append it.
    ///
    /// The index is the number of faces already stored under `label`. When
    /// that file already exists (a gap in the stored indices) nothing is
    /// written and a format error is returned. The metadata file is not touched.
    pub fn add_face(&mut self, label: &str, image: &ImageBuffer) -> Result<PathBuf, CorpusError> {
        validate_label(label)?;
        let index = self.count_label(label) as u64;
        let path = self.image_dir.join(format!("{label} ({index}).jpg"));
        if path.exists() {
            return Err(CorpusError::Format {
                path,
                line: None,
                reason: format!("face file already exists; {label:?} has a gap in its image indices"),
            });
        }

        let face = if image.is_normalized_face() {
            image.clone()
        } else {
            image.normalize_face()
        };
        std::fs::create_dir_all(&self.image_dir).map_err(|e| CorpusError::io(&self.image_dir, e))?;
        face.save(&path).map_err(|source| CorpusError::Image {
            path: path.clone(),
            source,
        })?;

        self.records.push(FaceRecord {
            label: label.to_string(),
            index,
            image: face,
            path: path.clone(),
        });
        self.generation += 1;
        self.infos
            .entry(label.to_string())
            .or_insert_with(|| FaceInfo::new(label));

        tracing::info!(label, index, path = %path.display(), "face added to corpus");
        Ok(path)
    }

    pub fn get(&self, label: &str) -> Option<&FaceInfo> {
        self.infos.get(label)
    }

    /// The record for `label`, inserting an empty one first if absent.
    pub fn get_or_create(&mut self, label: &str) -> &FaceInfo {
        self.infos
            .entry(label.to_string())
            .or_insert_with(|| FaceInfo::new(label))
    }

    /// Insert or replace a biographical record.
    pub fn set_info(&mut self, info: FaceInfo) -> Result<(), CorpusError> {
        validate_label(&info.label)?;
        for (&field, value) in FIELD_NAMES.iter().zip(info.fields()).skip(1) {
            if value.contains([METADATA_SEPARATOR, '\n', '\r']) {
                return Err(CorpusError::InvalidField {
                    field,
                    value: value.to_string(),
                });
            }
        }
        self.infos.insert(info.label.clone(), info);
        Ok(())
    }

    /// Every record as a metadata line, in label order.
    pub fn format_metadata(&self) -> String {
        self.infos
            .values()
            .map(|info| {
                let mut line = info.fields().join(";");
                line.push('\n');
                line
            })
            .collect()
    }

    pub fn save_metadata(&self) -> Result<(), CorpusError> {
        std::fs::write(&self.metadata_path, self.format_metadata())
            .map_err(|e| CorpusError::io(&self.metadata_path, e))?;
        tracing::info!(
            path = %self.metadata_path.display(),
            records = self.infos.len(),
            "metadata saved"
        );
        Ok(())
    }

    pub fn records(&self) -> &[FaceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Distinct labels that have a biographical record, sorted.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.infos.keys().map(String::as_str)
    }

    pub fn infos(&self) -> &BTreeMap<String, FaceInfo> {
        &self.infos
    }

    /// Number of stored faces carrying `label`.
    pub fn count_label(&self, label: &str) -> usize {
        self.records.iter().filter(|r| r.label == label).count()
    }

    /// Changes on every added face.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    pub fn metadata_path(&self) -> &Path {
        &self.metadata_path
    }
}

/// Split a corpus file name into label and index.
fn parse_file_name(name: &str) -> Option<(&str, u64)> {
    let caps = file_name_re()?.captures(name)?;
    let label = caps.name("label")?.as_str();
    let index = caps.name("index")?.as_str().parse().ok()?;
    Some((label, index))
}

fn validate_label(label: &str) -> Result<(), CorpusError> {
    if label.is_empty() || label.contains(['/', '\\', METADATA_SEPARATOR, '\n', '\r']) {
        return Err(CorpusError::InvalidLabel(label.to_string()));
    }
    Ok(())
}

/// Parse metadata text. `path` is only used in error reports.
fn parse_metadata(text: &str, path: &Path) -> Result<Vec<FaceInfo>, CorpusError> {
    let mut infos = Vec::new();
    for (n, raw) in text.split('\n').enumerate() {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(METADATA_SEPARATOR).collect();
        if fields.len() < METADATA_FIELDS {
            return Err(CorpusError::Format {
                path: path.to_path_buf(),
                line: Some(n + 1),
                reason: format!("expected {METADATA_FIELDS} fields, found {}", fields.len()),
            });
        }
        if fields.len() > METADATA_FIELDS {
            tracing::warn!(
                path = %path.display(),
                line = n + 1,
                extra = fields.len() - METADATA_FIELDS,
                "ignoring extra metadata fields"
            );
        }
        infos.push(FaceInfo {
            label: fields[0].to_string(),
            first_name: fields[1].to_string(),
            last_name: fields[2].to_string(),
            age: fields[3].to_string(),
            sex: fields[4].to_string(),
            glasses: fields[5].to_string(),
            skin_color: fields[6].to_string(),
            beard: fields[7].to_string(),
            hair_size: fields[8].to_string(),
        });
    }
    Ok(infos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_buffer::{FACE_HEIGHT, FACE_WIDTH};

    fn empty_corpus(dir: &Path) -> TrainingCorpus {
        let images = dir.join("faces");
        let meta = images.join("info.txt");
        TrainingCorpus::init(&images, &meta).unwrap();
        TrainingCorpus::load(images, meta).unwrap()
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(parse_file_name("Alice (3).jpg"), Some(("Alice", 3)));
        assert_eq!(parse_file_name("Mary Ann (0).jpg"), Some(("Mary Ann", 0)));
        assert_eq!(parse_file_name("a (1) (2).jpg"), Some(("a (1)", 2)));
        assert_eq!(parse_file_name("Alice.jpg"), None);
        assert_eq!(parse_file_name("Bob (x).jpg"), None);
        assert_eq!(parse_file_name("Bob (1).png"), None);
        assert_eq!(parse_file_name(" (1).jpg"), None);
        assert_eq!(parse_file_name("info.txt"), None);
    }

    #[test]
    fn test_parse_metadata_line() {
        let infos = parse_metadata("Carol;Carol;Smith;30;F;no;fair;no;short\n", Path::new("info.txt")).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(
            infos[0].fields(),
            ["Carol", "Carol", "Smith", "30", "F", "no", "fair", "no", "short"]
        );
    }

    #[test]
    fn test_parse_metadata_crlf_and_blank_lines() {
        let text = "a;;;;;;;;\r\n\r\n\nb;B;;;;;;;x\r\n";
        let infos = parse_metadata(text, Path::new("info.txt")).unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].label, "a");
        assert_eq!(infos[1].first_name, "B");
        assert_eq!(infos[1].hair_size, "x");
    }

    #[test]
    fn test_parse_metadata_short_line_is_format_error() {
        let text = "a;;;;;;;;\nbroken;line\n";
        let err = parse_metadata(text, Path::new("info.txt")).unwrap_err();
        assert!(matches!(err, CorpusError::Format { line: Some(2), .. }), "{err}");
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_parse_metadata_extra_fields_ignored() {
        let infos = parse_metadata("d;D;;;;;;;long;extra;more", Path::new("info.txt")).unwrap();
        assert_eq!(infos[0].hair_size, "long");
    }

    #[test]
    fn test_load_missing_dir_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TrainingCorpus::load(dir.path().join("nope"), dir.path().join("info.txt")).unwrap_err();
        assert!(matches!(err, CorpusError::Io { .. }));
        assert!(err.to_string().starts_with("corpus I/O failure"));
    }

    #[test]
    fn test_load_missing_metadata_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TrainingCorpus::load(dir.path(), dir.path().join("info.txt")).unwrap_err();
        assert!(matches!(err, CorpusError::Io { .. }));
    }

    #[test]
    fn test_add_face_contiguous_indices() {
        let dir = tempfile::tempdir().unwrap();
        let mut corpus = empty_corpus(dir.path());
        let face = ImageBuffer::filled_gray(FACE_WIDTH, FACE_HEIGHT, 120).unwrap();

        for k in 0..3 {
            let path = corpus.add_face("X", &face).unwrap();
            assert_eq!(path.file_name().unwrap().to_str().unwrap(), format!("X ({k}).jpg"));
            assert!(path.exists());
        }
        assert_eq!(corpus.count_label("X"), 3);
        assert_eq!(corpus.generation(), 3);
        assert_eq!(corpus.get("X"), Some(&FaceInfo::new("X")));
    }

    #[test]
    fn test_add_face_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("faces");
        let meta = images.join("info.txt");
        TrainingCorpus::init(&images, &meta).unwrap();
        let face = ImageBuffer::filled_gray(FACE_WIDTH, FACE_HEIGHT, 60).unwrap();
        for name in ["X (0).jpg", "X (2).jpg"] {
            face.save(images.join(name)).unwrap();
        }
        let kept = images.join("X (2).jpg");
        let before = std::fs::read(&kept).unwrap();

        let mut corpus = TrainingCorpus::load(&images, &meta).unwrap();
        let other = ImageBuffer::filled_gray(FACE_WIDTH, FACE_HEIGHT, 200).unwrap();
        let err = corpus.add_face("X", &other).unwrap_err();
        assert!(matches!(err, CorpusError::Format { ref path, line: None, .. } if *path == kept));
        assert_eq!(std::fs::read(&kept).unwrap(), before);
        assert_eq!(corpus.count_label("X"), 2);
        assert_eq!(corpus.generation(), 0);
    }

    #[test]
    fn test_add_face_normalizes() {
        let dir = tempfile::tempdir().unwrap();
        let mut corpus = empty_corpus(dir.path());
        let big = ImageBuffer::new(50, 60, 3, vec![200; 50 * 60 * 3]).unwrap();
        corpus.add_face("Y", &big).unwrap();
        assert!(corpus.records()[0].image.is_normalized_face());
    }

    #[test]
    fn test_add_face_rejects_bad_labels() {
        let dir = tempfile::tempdir().unwrap();
        let mut corpus = empty_corpus(dir.path());
        let face = ImageBuffer::filled_gray(FACE_WIDTH, FACE_HEIGHT, 0).unwrap();
        for bad in ["", "a/b", "a\\b", "a;b", "a\nb", "a\rb"] {
            assert!(matches!(
                corpus.add_face(bad, &face),
                Err(CorpusError::InvalidLabel(_))
            ));
        }
        assert!(corpus.is_empty());
        assert_eq!(corpus.generation(), 0);
    }

    #[test]
    fn test_load_orders_by_label_then_index() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("faces");
        let meta = images.join("info.txt");
        TrainingCorpus::init(&images, &meta).unwrap();
        let face = ImageBuffer::filled_gray(FACE_WIDTH, FACE_HEIGHT, 60).unwrap();
        for name in ["b (0).jpg", "a (10).jpg", "a (2).jpg"] {
            face.save(images.join(name)).unwrap();
        }
        std::fs::write(images.join("notes (1).txt"), "hello").unwrap();

        let corpus = TrainingCorpus::load(&images, &meta).unwrap();
        let order: Vec<(&str, u64)> = corpus
            .records()
            .iter()
            .map(|r| (r.label.as_str(), r.index))
            .collect();
        assert_eq!(order, vec![("a", 2), ("a", 10), ("b", 0)]);
        assert_eq!(corpus.labels().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_load_normalizes_stored_faces() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("faces");
        let meta = images.join("info.txt");
        TrainingCorpus::init(&images, &meta).unwrap();
        ImageBuffer::filled_gray(40, 40, 90)
            .unwrap()
            .save(images.join("z (0).jpg"))
            .unwrap();

        let corpus = TrainingCorpus::load(&images, &meta).unwrap();
        assert!(corpus.records()[0].image.is_normalized_face());
    }

    #[test]
    fn test_metadata_only_label_is_queryable() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("faces");
        let meta = images.join("info.txt");
        TrainingCorpus::init(&images, &meta).unwrap();
        std::fs::write(&meta, "Carol;Carol;Smith;30;F;no;fair;no;short\n").unwrap();

        let corpus = TrainingCorpus::load(&images, &meta).unwrap();
        assert!(corpus.is_empty());
        let carol = corpus.get("Carol").unwrap();
        assert_eq!(carol.last_name, "Smith");
        assert_eq!(carol.hair_size, "short");
    }

    #[test]
    fn test_get_or_create() {
        let mut corpus = TrainingCorpus::new("faces", "faces/info.txt");
        assert!(corpus.get("nobody").is_none());
        assert_eq!(corpus.get_or_create("nobody").label, "nobody");
        assert!(corpus.get("nobody").is_some());
    }

    #[test]
    fn test_set_info_validates_fields() {
        let mut corpus = TrainingCorpus::new("faces", "faces/info.txt");
        let mut info = FaceInfo::new("e");
        info.beard = "yes;no".into();
        assert!(matches!(
            corpus.set_info(info),
            Err(CorpusError::InvalidField { field: "beard", .. })
        ));
    }

    #[test]
    fn test_metadata_save_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut corpus = empty_corpus(dir.path());
        let mut info = FaceInfo::new("Dana");
        info.first_name = "Dana".into();
        info.age = "41".into();
        corpus.set_info(info.clone()).unwrap();
        corpus.get_or_create("Ed");
        corpus.save_metadata().unwrap();

        assert_eq!(corpus.format_metadata(), "Dana;Dana;;41;;;;;\nEd;;;;;;;;\n");

        let reloaded = TrainingCorpus::load(corpus.image_dir(), corpus.metadata_path()).unwrap();
        assert_eq!(reloaded.infos(), corpus.infos());
        assert_eq!(reloaded.get("Dana"), Some(&info));
    }
}
