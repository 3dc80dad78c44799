//! On-disk layout: `summary.json` plus one `<name>.raw` file per leaf.
//!
//! The manifest serializes the tree with `Type`/`Name`/`Offset`/`Size`/
//! `Children` keys and nothing else; payload bytes live next to it in a
//! directory hierarchy mirroring the `/`-separated region names.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;

use crate::rom::region::{Region, RegionError, RegionKind};

pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("summary manifest: {0}")]
    Json(#[from] serde_json::Error),
    #[error("leaf file {path} is {actual} bytes, the manifest says {expected}")]
    LeafSize {
        path: PathBuf,
        expected: u32,
        actual: usize,
    },
    #[error(transparent)]
    Region(#[from] RegionError),
}

fn io_err(path: &Path, source: io::Error) -> LayoutError {
    LayoutError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl Region {
    /// Write the layout: manifest first, then every raw leaf.
    pub fn save(&self, dir: &Path) -> Result<(), LayoutError> {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        let summary = dir.join(SUMMARY_FILE);
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(&summary, json).map_err(|e| io_err(&summary, e))?;
        self.save_leaves(dir)
    }

    fn save_leaves(&self, dir: &Path) -> Result<(), LayoutError> {
        for child in &self.children {
            child.save_leaves(dir)?;
        }
        if self.kind != RegionKind::Raw {
            return Ok(());
        }
        let path = dir.join(format!("{}.raw", self.name));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        debug!("save leaf {} ({} bytes)", self.name, self.raw.len());
        fs::write(&path, &self.raw).map_err(|e| io_err(&path, e))
    }

    /// Read a layout back: parse the manifest, then pull every leaf's bytes
    /// in from its `.raw` file. A missing or size-mismatched leaf file is an
    /// error.
    pub fn load(dir: &Path) -> Result<Region, LayoutError> {
        let summary = dir.join(SUMMARY_FILE);
        let bytes = fs::read(&summary).map_err(|e| io_err(&summary, e))?;
        let mut region: Region = serde_json::from_slice(&bytes)?;
        region.load_leaves(dir)?;
        Ok(region)
    }

    fn load_leaves(&mut self, dir: &Path) -> Result<(), LayoutError> {
        if !self.children.is_empty() {
            for child in &mut self.children {
                child.load_leaves(dir)?;
            }
            return Ok(());
        }
        if self.kind != RegionKind::Raw {
            return Ok(());
        }
        let path = dir.join(format!("{}.raw", self.name));
        let raw = fs::read(&path).map_err(|e| io_err(&path, e))?;
        if raw.len() != self.size as usize {
            return Err(LayoutError::LeafSize {
                path,
                expected: self.size,
                actual: raw.len(),
            });
        }
        debug!("load leaf {} ({} bytes)", self.name, raw.len());
        self.raw = raw;
        Ok(())
    }
}
