//! A partition-scoped reader built on top of [`crate::reader::WiiIsoReader`]:
//! owns the partition header so callers don't need to thread partition-local
//! offsets through every call (spec.md 4.2, 4.4).

use std::io::{Read, Seek, SeekFrom};

use binrw::BinReaderExt;

use crate::{
    reader::WiiIsoReader,
    reader_writer::WiiEncryptedReadWriteStream,
    structs::{Certificate, WiiPartitionHeader, TMD},
    GROUP_DATA_SIZE,
};

pub struct PartitionReader<'a, RS: Read + Seek> {
    iso_reader: &'a mut WiiIsoReader<RS>,
    data_offset: u64,
    partition_header: WiiPartitionHeader,
}

impl<'a, RS: Read + Seek> PartitionReader<'a, RS> {
    pub fn open_partition(
        iso_reader: &'a mut WiiIsoReader<RS>,
        data_offset: u64,
    ) -> binrw::BinResult<Self> {
        iso_reader.file.seek(SeekFrom::Start(data_offset))?;
        let partition_header = iso_reader.file.read_be::<WiiPartitionHeader>()?;
        Ok(PartitionReader { iso_reader, data_offset, partition_header })
    }

    pub fn get_partition_header(&self) -> &WiiPartitionHeader {
        &self.partition_header
    }

    /// Raw seekable handle to the disc, positioned by callers that need
    /// access below the decrypting stream (e.g. re-verifying raw groups).
    pub fn raw_file(&mut self) -> &mut RS {
        &mut self.iso_reader.file
    }

    /// Byte offset of this partition's encrypted data region on disc.
    pub fn data_base(&self) -> u64 {
        self.data_offset + *self.partition_header.data_off
    }

    pub fn read_tmd(&mut self) -> binrw::BinResult<TMD> {
        self.iso_reader
            .file
            .seek(SeekFrom::Start(self.data_offset + *self.partition_header.tmd_off))?;
        self.iso_reader.file.read_be()
    }

    pub fn read_certificates(&mut self) -> binrw::BinResult<[Certificate; 3]> {
        self.iso_reader
            .file
            .seek(SeekFrom::Start(self.data_offset + *self.partition_header.cert_chain_off))?;
        self.iso_reader.file.read_be()
    }

    pub fn read_h3(&mut self) -> binrw::BinResult<Vec<u8>> {
        self.iso_reader.file.seek(SeekFrom::Start(
            self.data_offset + *self.partition_header.global_hash_table_off,
        ))?;
        let mut h3 = vec![0u8; 0x18000];
        self.iso_reader.file.read_exact(&mut h3)?;
        Ok(h3)
    }

    /// Opens a read-only decrypting stream over this partition's data
    /// region, matching the teacher's `WiiEncryptedReadWriteStream` API.
    pub fn open_encryption_reader(&mut self) -> WiiEncryptedReadWriteStream<'_, RS> {
        let max_group = (*self.partition_header.data_size).div_ceil(GROUP_DATA_SIZE);
        WiiEncryptedReadWriteStream::create_readonly(
            &mut self.iso_reader.file,
            self.data_offset + *self.partition_header.data_off,
            self.partition_header.ticket.title_key,
            max_group,
        )
    }
}
