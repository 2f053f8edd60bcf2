//! In-memory file system table model (spec.md 3 "FST"), built from or
//! flattened back to the on-disk entry array + string table described in
//! `structs::FstEntryRaw`.

use std::io::{self, Read, Seek, SeekFrom, Write};

use binrw::{BinReaderExt, BinWriterExt};

use crate::structs::FstEntryRaw;

#[derive(Debug, Clone)]
pub enum FstNode {
    File { name: String, offset: u64, length: u32 },
    Directory { name: String, files: Vec<FstNode> },
}

impl FstNode {
    pub fn get_name(&self) -> &str {
        match self {
            FstNode::File { name, .. } => name,
            FstNode::Directory { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Fst {
    pub root: Vec<FstNode>,
}

impl Fst {
    /// Parses the FST at `fst_offset` from a partition-relative decrypted
    /// stream (spec.md 4.4). The root directory entry gives the total entry
    /// count; entries after it are read flat and reassembled into a tree
    /// using each directory entry's "next" index, the same layout the
    /// Nintendo toolchain emits.
    pub fn read<RS: Read + Seek>(rs: &mut RS, fst_offset: u64) -> binrw::BinResult<Self> {
        rs.seek(SeekFrom::Start(fst_offset))?;
        let root_raw: FstEntryRaw = rs.read_be()?;
        let total_entries = root_raw.size_or_next as usize;
        let mut raw_entries = Vec::with_capacity(total_entries);
        raw_entries.push(root_raw);
        for _ in 1..total_entries {
            raw_entries.push(rs.read_be::<FstEntryRaw>()?);
        }
        let string_table_off = fst_offset + total_entries as u64 * 12;
        let mut names = Vec::with_capacity(total_entries);
        names.push(String::new());
        for entry in raw_entries.iter().skip(1) {
            rs.seek(SeekFrom::Start(string_table_off + entry.name_off() as u64))?;
            names.push(read_cstr(rs)?);
        }
        let (root, _) = build_tree(&raw_entries, &names, 1, total_entries);
        Ok(Fst { root })
    }

    pub fn find_node_iter<'a>(
        &self,
        path: impl IntoIterator<Item = &'a str>,
    ) -> Option<&FstNode> {
        let mut components = path.into_iter();
        let first = components.next()?;
        let mut current = self.root.iter().find(|n| n.get_name() == first)?;
        for part in components {
            match current {
                FstNode::Directory { files, .. } => {
                    current = files.iter().find(|n| n.get_name() == part)?;
                }
                FstNode::File { .. } => return None,
            }
        }
        Some(current)
    }

    pub fn find_node_path_mut(&mut self, path: &str) -> Option<&mut FstNode> {
        let mut parts = path.split('/');
        let first = parts.next()?;
        let mut current = self.root.iter_mut().find(|n| n.get_name() == first)?;
        for part in parts {
            match current {
                FstNode::Directory { files, .. } => {
                    current = files.iter_mut().find(|n| n.get_name() == part)?;
                }
                FstNode::File { .. } => return None,
            }
        }
        Some(current)
    }

    pub fn callback_all_files<E, F>(&self, f: &mut F) -> Result<(), E>
    where
        F: FnMut(&Vec<String>, &FstNode) -> Result<(), E>,
    {
        let mut path = Vec::new();
        for node in &self.root {
            visit(node, &mut path, f)?;
        }
        Ok(())
    }

    pub fn print_tree(&self) {
        print_nodes(&self.root, 0);
    }
}

fn print_nodes(nodes: &[FstNode], depth: usize) {
    for node in nodes {
        match node {
            FstNode::File { name, offset, length } => {
                println!("{}{} ({offset:#x}, {length:#x})", "  ".repeat(depth), name);
            }
            FstNode::Directory { name, files } => {
                println!("{}{}/", "  ".repeat(depth), name);
                print_nodes(files, depth + 1);
            }
        }
    }
}

fn visit<E>(
    node: &FstNode,
    path: &mut Vec<String>,
    f: &mut impl FnMut(&Vec<String>, &FstNode) -> Result<(), E>,
) -> Result<(), E> {
    path.push(node.get_name().to_string());
    match node {
        FstNode::File { .. } => {
            f(path, node)?;
        }
        FstNode::Directory { files, .. } => {
            f(path, node)?;
            for child in files {
                visit(child, path, f)?;
            }
        }
    }
    path.pop();
    Ok(())
}

fn read_cstr<RS: Read>(rs: &mut RS) -> binrw::BinResult<String> {
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        rs.read_exact(&mut byte)?;
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Builds a subtree from the flat entry array starting at `start`, stopping
/// at `end` (exclusive), returning the built nodes and the next unconsumed
/// index — mirrors how the original toolchain walks directory `next` links.
fn build_tree(
    raw: &[FstEntryRaw],
    names: &[String],
    start: usize,
    end: usize,
) -> (Vec<FstNode>, usize) {
    let mut nodes = Vec::new();
    let mut i = start;
    while i < end {
        let entry = raw[i];
        let name = names[i].clone();
        if entry.is_dir() {
            let next = entry.size_or_next as usize;
            let (children, _) = build_tree(raw, names, i + 1, next);
            nodes.push(FstNode::Directory { name, files: children });
            i = next;
        } else {
            nodes.push(FstNode::File {
                name,
                offset: entry.data_off_or_parent as u64,
                length: entry.size_or_next,
            });
            i += 1;
        }
    }
    (nodes, i)
}

#[derive(thiserror::Error, Debug)]
pub enum FstToBytesError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("binrw error: {0}")]
    BinRw(#[from] binrw::Error),
    #[error("too many files to represent with a 24-bit name offset")]
    NameTableTooLarge,
}

/// A flattened, writable view of an [`Fst`]: entry array + string table,
/// with file offsets left as placeholders until `callback_all_files_mut`
/// fills them in during the data-writing pass (builder.rs).
pub struct FstToBytes {
    entries: Vec<FstEntryRaw>,
    names: Vec<String>,
    paths: Vec<Vec<String>>,
}

impl TryFrom<Fst> for FstToBytes {
    type Error = FstToBytesError;

    fn try_from(fst: Fst) -> Result<Self, Self::Error> {
        let mut entries = vec![FstEntryRaw { flags_and_name_off: 0x0100_0000, data_off_or_parent: 0, size_or_next: 0 }];
        let mut names = vec![String::new()];
        let mut paths = vec![Vec::new()];
        flatten(&fst.root, 0, &mut entries, &mut names, &mut paths, &mut Vec::new())?;
        let total = entries.len() as u32;
        entries[0].size_or_next = total;
        Ok(FstToBytes { entries, names, paths })
    }
}

fn flatten(
    nodes: &[FstNode],
    parent: u32,
    entries: &mut Vec<FstEntryRaw>,
    names: &mut Vec<String>,
    paths: &mut Vec<Vec<String>>,
    prefix: &mut Vec<String>,
) -> Result<(), FstToBytesError> {
    for node in nodes {
        let name_off = name_table_offset(names);
        prefix.push(node.get_name().to_string());
        match node {
            FstNode::File { length, .. } => {
                let idx = entries.len();
                entries.push(FstEntryRaw::pack(false, name_off, 0, *length));
                names.push(node.get_name().to_string());
                paths.push(prefix.clone());
                let _ = idx;
            }
            FstNode::Directory { files, .. } => {
                let idx = entries.len();
                entries.push(FstEntryRaw::pack(true, name_off, parent, 0));
                names.push(node.get_name().to_string());
                paths.push(prefix.clone());
                flatten(files, idx as u32, entries, names, paths, prefix)?;
                let next = entries.len() as u32;
                entries[idx].size_or_next = next;
            }
        }
        prefix.pop();
    }
    Ok(())
}

fn name_table_offset(names: &[String]) -> u32 {
    names.iter().map(|n| n.len() as u32 + 1).sum()
}

impl FstToBytes {
    pub fn write_to<WS: Write + Seek>(&self, ws: &mut WS) -> binrw::BinResult<()> {
        for entry in &self.entries {
            ws.write_be(entry)?;
        }
        for name in self.names.iter().skip(1) {
            ws.write_all(name.as_bytes())?;
            ws.write_all(&[0])?;
        }
        Ok(())
    }

    pub fn callback_all_files_mut<E, F>(&mut self, f: &mut F) -> Result<(), E>
    where
        F: FnMut(&Vec<String>, &mut u64, &mut u32) -> Result<(), E>,
    {
        for (entry, path) in self.entries.iter_mut().zip(self.paths.iter()) {
            if !entry.is_dir() {
                let mut offset = entry.data_off_or_parent as u64;
                let mut size = entry.size_or_next;
                f(path, &mut offset, &mut size)?;
                entry.data_off_or_parent = offset as u32;
                entry.size_or_next = size;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flatten_then_build_round_trips_names() {
        let fst = Fst {
            root: vec![
                FstNode::File { name: "main.dol".into(), offset: 0, length: 10 },
                FstNode::Directory {
                    name: "files".into(),
                    files: vec![FstNode::File { name: "a.txt".into(), offset: 0, length: 4 }],
                },
            ],
        };
        let flat = FstToBytes::try_from(fst).unwrap();
        assert_eq!(flat.names[1], "main.dol");
        assert_eq!(flat.names[2], "files");
        assert_eq!(flat.names[3], "a.txt");
    }
}
