//! Container Codec
//!
//! A container is a zip archive holding one or more logical entries. Each entry is
//! a pair of members sharing a base name:
//!
//! ```text
//! 0.meta   key:value lines (AttributeMap text form)
//! 0.dat    raw payload bytes
//! 1.meta
//! 1.dat
//! ...
//! ```
//!
//! The writer numbers entries from 0. The reader pairs members by base name, so
//! archives produced elsewhere (`file_1.meta` / `file_1.dat`, members in any order)
//! decode too. `.hdr` is read as a metadata alias; other extensions (`.ctx`, `.mf`)
//! are skipped. A metadata member without its payload member, or the reverse, is a
//! structural error: decoding never returns a partial container.

use bytes::Bytes;
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Seek, Write};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::attributes::AttributeMap;
use crate::error::{Error, Result};

pub const META_EXTENSION: &str = "meta";
pub const DATA_EXTENSION: &str = "dat";

/// Upper bound on the buffer reserved from a member's declared size.
const MAX_PREALLOCATION: u64 = 64 * 1024;

/// One decoded entry: attributes plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEntry {
    pub attributes: AttributeMap,
    pub data: Bytes,
}

impl ContainerEntry {
    pub fn new(attributes: AttributeMap, data: impl Into<Bytes>) -> Self {
        Self {
            attributes,
            data: data.into(),
        }
    }
}

/// Streaming container writer over any seekable sink (a file or a `Cursor`).
pub struct ContainerWriter<W: Write + Seek> {
    zip: ZipWriter<W>,
    options: SimpleFileOptions,
    next_sequence: u64,
    uncompressed_bytes: u64,
}

impl<W: Write + Seek> ContainerWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            zip: ZipWriter::new(inner),
            options: SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .large_file(true),
            next_sequence: 0,
            uncompressed_bytes: 0,
        }
    }

    /// Number of entries written so far.
    pub fn entry_count(&self) -> u64 {
        self.next_sequence
    }

    /// Total payload bytes written so far, before compression.
    pub fn uncompressed_bytes(&self) -> u64 {
        self.uncompressed_bytes
    }

    /// Append an entry from an in-memory payload. Returns its sequence number.
    pub fn add_entry(&mut self, attributes: &AttributeMap, data: &[u8]) -> Result<u64> {
        let (sequence, _) = self.add_entry_from_reader(attributes, &mut &data[..])?;
        Ok(sequence)
    }

    /// Append an entry, streaming its payload from `reader`.
    ///
    /// Returns the sequence number and the number of payload bytes copied.
    pub fn add_entry_from_reader<R: Read + ?Sized>(
        &mut self,
        attributes: &AttributeMap,
        reader: &mut R,
    ) -> Result<(u64, u64)> {
        let sequence = self.next_sequence;

        self.zip
            .start_file(member_name(sequence, META_EXTENSION), self.options)?;
        attributes.write_meta(&mut self.zip)?;

        self.zip
            .start_file(member_name(sequence, DATA_EXTENSION), self.options)?;
        let copied = io::copy(reader, &mut self.zip)?;

        self.next_sequence += 1;
        self.uncompressed_bytes += copied;
        Ok((sequence, copied))
    }

    /// Write the central directory and hand back the sink.
    pub fn finish(self) -> Result<W> {
        Ok(self.zip.finish()?)
    }
}

/// Location of one entry's members inside the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberPair {
    /// Shared base name, e.g. `0`
    pub name: String,
    /// Uncompressed payload size
    pub data_size: u64,
    meta_index: usize,
    data_index: usize,
}

/// Container reader that validates member pairing up front.
pub struct ContainerReader<R: Read + Seek> {
    archive: ZipArchive<R>,
    pairs: Vec<MemberPair>,
}

#[derive(Default)]
struct PartialPair {
    meta: Option<usize>,
    data: Option<(usize, u64)>,
}

impl<R: Read + Seek> ContainerReader<R> {
    pub fn new(inner: R) -> Result<Self> {
        let mut archive = ZipArchive::new(inner)?;
        let mut partial: HashMap<String, PartialPair> = HashMap::new();

        for index in 0..archive.len() {
            let file = archive.by_index(index)?;
            if file.is_dir() {
                continue;
            }
            let full_name = file.name().to_string();
            let Some((base, extension)) = full_name.rsplit_once('.') else {
                debug!(member = %full_name, "Skipping container member without extension");
                continue;
            };

            let slot = partial.entry(base.to_string()).or_default();
            match extension.to_ascii_lowercase().as_str() {
                "meta" | "hdr" => {
                    if slot.meta.replace(index).is_some() {
                        return Err(Error::DuplicateMember(full_name));
                    }
                }
                "dat" => {
                    if slot.data.replace((index, file.size())).is_some() {
                        return Err(Error::DuplicateMember(full_name));
                    }
                }
                _ => {
                    debug!(member = %full_name, "Skipping unrecognised container member");
                }
            }
        }

        let mut pairs = Vec::with_capacity(partial.len());
        for (name, slot) in partial {
            match (slot.meta, slot.data) {
                (Some(meta_index), Some((data_index, data_size))) => pairs.push(MemberPair {
                    name,
                    data_size,
                    meta_index,
                    data_index,
                }),
                (Some(_), None) => {
                    return Err(Error::UnpairedMember {
                        name,
                        missing: DATA_EXTENSION,
                    })
                }
                (None, Some(_)) => {
                    return Err(Error::UnpairedMember {
                        name,
                        missing: META_EXTENSION,
                    })
                }
                // Only unrecognised members under this base name.
                (None, None) => {}
            }
        }
        pairs.sort_by(|a, b| entry_order(&a.name).cmp(&entry_order(&b.name)));

        Ok(Self { archive, pairs })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[MemberPair] {
        &self.pairs
    }

    fn pair(&self, index: usize) -> Result<&MemberPair> {
        self.pairs.get(index).ok_or(Error::EntryOutOfRange(index))
    }

    pub fn read_attributes(&mut self, index: usize) -> Result<AttributeMap> {
        let meta_index = self.pair(index)?.meta_index;
        let mut member = self.archive.by_index(meta_index)?;
        let mut buf = Vec::new();
        member.read_to_end(&mut buf)?;
        Ok(AttributeMap::from_meta_bytes(&buf))
    }

    /// Reader over an entry's payload, decompressing as it goes.
    pub fn data_reader(&mut self, index: usize) -> Result<impl Read + '_> {
        let data_index = self.pair(index)?.data_index;
        Ok(self.archive.by_index(data_index)?)
    }

    /// Stream an entry's payload into `writer`, returning the byte count.
    pub fn copy_data<W: Write + ?Sized>(&mut self, index: usize, writer: &mut W) -> Result<u64> {
        let mut member = self.data_reader(index)?;
        Ok(io::copy(&mut member, writer)?)
    }

    pub fn read_data(&mut self, index: usize) -> Result<Bytes> {
        // The declared size comes from the archive and is not trusted.
        let capacity = self.pair(index)?.data_size.min(MAX_PREALLOCATION) as usize;
        let mut buf = Vec::with_capacity(capacity);
        self.copy_data(index, &mut buf)?;
        Ok(Bytes::from(buf))
    }

    pub fn read_entry(&mut self, index: usize) -> Result<ContainerEntry> {
        Ok(ContainerEntry {
            attributes: self.read_attributes(index)?,
            data: self.read_data(index)?,
        })
    }

    pub fn into_entries(mut self) -> Result<Vec<ContainerEntry>> {
        (0..self.len()).map(|i| self.read_entry(i)).collect()
    }
}

/// Encode entries into an in-memory container.
pub fn encode(entries: &[ContainerEntry]) -> Result<Bytes> {
    let mut writer = ContainerWriter::new(Cursor::new(Vec::new()));
    for entry in entries {
        writer.add_entry(&entry.attributes, &entry.data)?;
    }
    Ok(Bytes::from(writer.finish()?.into_inner()))
}

/// Decode an in-memory container.
pub fn decode(bytes: &[u8]) -> Result<Vec<ContainerEntry>> {
    ContainerReader::new(Cursor::new(bytes))?.into_entries()
}

fn member_name(sequence: u64, extension: &str) -> String {
    format!("{}.{}", sequence, extension)
}

/// Numeric base names first in numeric order, then the rest by name.
fn entry_order(name: &str) -> (u8, u64, &str) {
    match name.parse::<u64>() {
        Ok(n) => (0, n, name),
        Err(_) => (1, 0, name),
    }
}
