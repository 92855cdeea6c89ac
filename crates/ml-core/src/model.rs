//! The opaque detection model and how it is loaded.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::PathBuf,
};

use thiserror::Error;

/// Borrowed BGR8 pixels handed to a model. Models never mutate the frame.
#[derive(Clone, Copy, Debug)]
pub struct FrameView<'a> {
    pub bgr: &'a [u8],
    pub width: u32,
    pub height: u32,
}

impl FrameView<'_> {
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// Raw model output before labels are resolved. `bbox` is `[x1, y1, x2, y2]`
/// in frame pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawDetection {
    pub class_id: usize,
    pub score: f32,
    pub bbox: [f32; 4],
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Thresholds {
    pub confidence: f32,
    pub iou: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            confidence: 0.25,
            iou: 0.45,
        }
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to load model from {path}: {reason}")]
    Load { path: PathBuf, reason: String },
    #[error(
        "refusing to load {path}: it is a pickle checkpoint and the model source is not trusted"
    )]
    UntrustedSource { path: PathBuf },
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("invalid model input: {0}")]
    InvalidInput(String),
}

/// A loaded detection model.
pub trait DetectionModel: Send {
    /// Class names indexed by class id, as shipped with the model.
    fn class_names(&self) -> &[String];

    fn infer(
        &mut self,
        frame: FrameView<'_>,
        thresholds: Thresholds,
    ) -> Result<Vec<RawDetection>, ModelError>;
}

/// Where a model comes from and whether its author is trusted.
///
/// Trust only matters for pickled checkpoints, zipped or bare, which can
/// execute arbitrary code while being deserialised.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelSource {
    pub path: PathBuf,
    pub trust_source: bool,
}

impl ModelSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            trust_source: false,
        }
    }

    pub fn trusted(mut self, trust: bool) -> Self {
        self.trust_source = trust;
        self
    }
}

/// Loads models for detection sessions.
pub trait ModelLoader: Send + Sync {
    fn load(&self, source: &ModelSource) -> Result<Box<dyn DetectionModel>, ModelError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelFormat {
    /// Zip archive with serialised code, as written by `torch.jit.save`.
    TorchScript,
    /// Zip archive holding only pickled data, as written by `torch.save`.
    Checkpoint,
    /// Bare pickle stream from legacy `torch.save`.
    Pickle,
    Unknown,
}

impl ModelFormat {
    /// Whether loading runs a pickle and so needs a trusted source.
    pub fn needs_trust(self) -> bool {
        matches!(self, Self::Checkpoint | Self::Pickle)
    }
}

const LOCAL_HEADER: [u8; 4] = *b"PK\x03\x04";
const CENTRAL_HEADER: [u8; 4] = *b"PK\x01\x02";
const END_OF_DIRECTORY: [u8; 4] = *b"PK\x05\x06";
const PICKLE_PROTO: u8 = 0x80;

const LOCAL_HEADER_LEN: usize = 30;
const CENTRAL_HEADER_LEN: usize = 46;
const END_OF_DIRECTORY_LEN: usize = 22;
/// Bytes walked through local headers when the central directory is unusable.
const LOCAL_SCAN_LIMIT: u64 = 1 << 20;

/// Classify a zip archive by its entry names.
///
/// Only archives carrying serialised code or a `constants.pkl` table are
/// TorchScript. Anything else is treated as a pickled checkpoint.
pub fn classify_archive<'a>(entries: impl IntoIterator<Item = &'a str>) -> ModelFormat {
    let scripted = entries.into_iter().any(|name| {
        name.starts_with("code/")
            || name.contains("/code/")
            || name == "constants.pkl"
            || name.ends_with("/constants.pkl")
    });
    if scripted {
        ModelFormat::TorchScript
    } else {
        ModelFormat::Checkpoint
    }
}

/// Check that a model file exists and may be loaded under its trust setting.
pub fn verify_source(source: &ModelSource) -> Result<ModelFormat, ModelError> {
    let load_err = |reason: String| ModelError::Load {
        path: source.path.clone(),
        reason,
    };
    let mut file = File::open(&source.path).map_err(|err| load_err(err.to_string()))?;
    let format = inspect(&mut file).map_err(|err| load_err(err.to_string()))?;
    if format.needs_trust() && !source.trust_source {
        return Err(ModelError::UntrustedSource {
            path: source.path.clone(),
        });
    }
    Ok(format)
}

fn inspect(file: &mut File) -> io::Result<ModelFormat> {
    let mut header = [0u8; 4];
    let read = file.read(&mut header)?;
    if read == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "file is empty"));
    }
    let header = &header[..read];
    if header.starts_with(&LOCAL_HEADER) {
        let names = archive_entries(file)?;
        Ok(classify_archive(names.iter().map(String::as_str)))
    } else if header.first() == Some(&PICKLE_PROTO) {
        Ok(ModelFormat::Pickle)
    } else {
        Ok(ModelFormat::Unknown)
    }
}

/// Entry names from the central directory, or from the local headers when the
/// directory is missing or points outside the file.
fn archive_entries(file: &mut File) -> io::Result<Vec<String>> {
    let len = file.metadata()?.len();
    let tail_len = len.min(END_OF_DIRECTORY_LEN as u64 + u64::from(u16::MAX));
    file.seek(SeekFrom::Start(len - tail_len))?;
    let mut tail = vec![0u8; tail_len as usize];
    file.read_exact(&mut tail)?;

    if let Some((offset, size)) = directory_location(&tail) {
        if offset.saturating_add(size) <= len {
            file.seek(SeekFrom::Start(offset))?;
            let mut directory = vec![0u8; size as usize];
            file.read_exact(&mut directory)?;
            return Ok(central_entries(&directory));
        }
    }

    file.seek(SeekFrom::Start(0))?;
    let mut head = Vec::new();
    file.take(LOCAL_SCAN_LIMIT).read_to_end(&mut head)?;
    Ok(local_entries(&head))
}

fn directory_location(tail: &[u8]) -> Option<(u64, u64)> {
    let at = tail
        .windows(END_OF_DIRECTORY.len())
        .rposition(|window| window == END_OF_DIRECTORY)?;
    let record = tail.get(at..at + END_OF_DIRECTORY_LEN)?;
    let size = u64::from(le_u32(record, 12)?);
    let offset = u64::from(le_u32(record, 16)?);
    Some((offset, size))
}

fn central_entries(directory: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    let mut at = 0;
    while directory.get(at..at + 4) == Some(&CENTRAL_HEADER[..]) {
        let Some(header) = directory.get(at..at + CENTRAL_HEADER_LEN) else {
            break;
        };
        let (Some(name_len), Some(extra_len), Some(comment_len)) =
            (le_u16(header, 28), le_u16(header, 30), le_u16(header, 32))
        else {
            break;
        };
        let start = at + CENTRAL_HEADER_LEN;
        let Some(name) = directory.get(start..start + name_len) else {
            break;
        };
        names.push(String::from_utf8_lossy(name).into_owned());
        at = start + name_len + extra_len + comment_len;
    }
    names
}

fn local_entries(head: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    let mut at = 0;
    while head.get(at..at + 4) == Some(&LOCAL_HEADER[..]) {
        let start = at + LOCAL_HEADER_LEN;
        let Some(header) = head.get(at..start) else {
            break;
        };
        let (Some(compressed), Some(name_len), Some(extra_len)) =
            (le_u32(header, 18), le_u16(header, 26), le_u16(header, 28))
        else {
            break;
        };
        let name_end = (start + name_len).min(head.len());
        names.push(String::from_utf8_lossy(&head[start..name_end]).into_owned());
        at = start + name_len + extra_len + compressed as usize;
    }
    names
}

fn le_u16(bytes: &[u8], at: usize) -> Option<usize> {
    let raw = bytes.get(at..at + 2)?;
    Some(usize::from(u16::from_le_bytes([raw[0], raw[1]])))
}

fn le_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let raw = bytes.get(at..at + 4)?;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}
