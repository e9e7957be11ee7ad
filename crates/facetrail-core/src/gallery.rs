//! Known-face gallery loaded from a directory of reference images.
//!
//! One image per identity; the file stem is the label verbatim. The first
//! face the recognizer locates in each image becomes that identity's encoding.

use crate::capability::Recognizer;
use crate::frame::Frame;
use crate::types::{Embedding, GalleryEntry, MatchResult};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("cannot read gallery directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot decode image {path}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("no face found in gallery image {0}")]
    NoFace(PathBuf),
    #[error("recognizer failed on {path}: {source}")]
    Recognizer {
        path: PathBuf,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Immutable set of known identities.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new(entries: Vec<GalleryEntry>) -> Self {
        Self { entries }
    }

    /// Encode every image in `dir`, in filename order.
    ///
    /// Files whose extension is not a known image format are skipped. An
    /// image without a detectable face aborts the whole load.
    pub fn load_dir<R: Recognizer>(dir: &Path, recognizer: &mut R) -> Result<Self, GalleryError> {
        let read_err = |source| GalleryError::ReadDir {
            path: dir.to_path_buf(),
            source,
        };

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(read_err)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<_, _>>()
            .map_err(read_err)?;
        paths.sort();

        let mut entries = Vec::new();
        for path in paths {
            if !path.is_file() || image::ImageFormat::from_path(&path).is_err() {
                tracing::debug!(path = %path.display(), "skipping non-image gallery file");
                continue;
            }

            let label = match path.file_stem() {
                Some(stem) => stem.to_string_lossy().into_owned(),
                None => continue,
            };
            let embedding = encode_reference(&path, recognizer)?;
            tracing::debug!(label = %label, path = %path.display(), "gallery entry encoded");
            entries.push(GalleryEntry { label, embedding });
        }

        tracing::info!(dir = %dir.display(), count = entries.len(), "gallery loaded");
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.label.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Nearest identity for `probe` according to `recognizer`'s matching rule.
    pub fn identify<R: Recognizer>(&self, recognizer: &R, probe: &Embedding) -> MatchResult {
        recognizer.best_match(&self.entries, probe)
    }
}

fn encode_reference<R: Recognizer>(path: &Path, recognizer: &mut R) -> Result<Embedding, GalleryError> {
    let image = image::open(path).map_err(|source| GalleryError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    let frame = Frame::from_gray_image(image.to_luma8());

    let boxed = |e: R::Error| GalleryError::Recognizer {
        path: path.to_path_buf(),
        source: Box::new(e),
    };

    let faces = recognizer.locate(&frame).map_err(boxed)?;
    let first = faces
        .into_iter()
        .next()
        .ok_or_else(|| GalleryError::NoFace(path.to_path_buf()))?;

    recognizer
        .encode(&frame, std::slice::from_ref(&first))
        .map_err(boxed)?
        .into_iter()
        .next()
        .ok_or_else(|| GalleryError::NoFace(path.to_path_buf()))
}
