//! Builds an [`Fst`] by walking a directory tree on the host filesystem,
//! the inverse of the FUSE/extraction direction (spec.md 4.7 "directory to
//! disc").

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::fst::{Fst, FstNode};

#[derive(thiserror::Error, Debug)]
pub enum BuildDirError {
    #[error("path not found: {0}")]
    NotFound(PathBuf),
    #[error("io error at {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
}

pub fn build_fst_from_directory_tree(dir: &Path) -> Result<Fst, BuildDirError> {
    if !dir.is_dir() {
        return Err(BuildDirError::NotFound(dir.to_path_buf()));
    }
    Ok(Fst { root: read_dir_nodes(dir)? })
}

fn read_dir_nodes(dir: &Path) -> Result<Vec<FstNode>, BuildDirError> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .map_err(|e| BuildDirError::Io(dir.to_path_buf(), e))?
        .collect::<Result<_, _>>()
        .map_err(|e| BuildDirError::Io(dir.to_path_buf(), e))?;
    entries.sort_by_key(|e| e.file_name());
    let mut nodes = Vec::with_capacity(entries.len());
    for entry in entries {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let meta = entry.metadata().map_err(|e| BuildDirError::Io(path.clone(), e))?;
        if meta.is_dir() {
            nodes.push(FstNode::Directory { name, files: read_dir_nodes(&path)? });
        } else {
            nodes.push(FstNode::File { name, offset: 0, length: meta.len() as u32 });
        }
    }
    Ok(nodes)
}
