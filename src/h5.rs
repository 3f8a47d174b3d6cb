//! Truncation check for HDF5 files, based on the end-of-file address recorded in the
//! superblock.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::KiraError;

const SIGNATURE: [u8; 8] = [0x89, b'H', b'D', b'F', b'\r', b'\n', 0x1a, b'\n'];
const UNDEFINED_ADDRESS: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    /// Position of the signature in the file.
    pub offset: u64,
    pub version: u8,
    pub size_of_offsets: u8,
    pub base_address: u64,
    pub eof_address: u64,
}

impl Superblock {
    /// Minimum file length implied by the superblock, if recorded.
    pub fn required_length(&self) -> Option<u64> {
        if self.eof_address == UNDEFINED_ADDRESS {
            return None;
        }
        self.base_address.checked_add(self.eof_address)
    }
}

/// Locates and decodes the superblock. The signature is searched at 0, 512, 1024, 2048
/// and so on.
pub fn read_superblock<R: Read + Seek>(reader: &mut R) -> Result<Superblock, KiraError> {
    let length = reader.seek(SeekFrom::End(0)).map_err(KiraError::from_local)?;
    let mut offset = 0u64;
    loop {
        if offset + SIGNATURE.len() as u64 > length {
            return Err(KiraError::Truncated("no HDF5 signature found".to_string()));
        }
        reader
            .seek(SeekFrom::Start(offset))
            .map_err(KiraError::from_local)?;
        let mut signature = [0u8; 8];
        reader
            .read_exact(&mut signature)
            .map_err(KiraError::from_local)?;
        if signature == SIGNATURE {
            return decode(reader, offset).map_err(|err| match err {
                KiraError::TransientIo(message) => {
                    KiraError::Truncated(format!("incomplete HDF5 superblock: {message}"))
                }
                other => other,
            });
        }
        offset = if offset == 0 { 512 } else { offset * 2 };
    }
}

fn decode<R: Read>(reader: &mut R, offset: u64) -> Result<Superblock, KiraError> {
    let version = read_u8(reader)?;
    let (size_of_offsets, base_address, eof_address) = match version {
        0 | 1 => {
            // free-space, root group and shared header versions, one reserved byte
            skip(reader, 4)?;
            let size_of_offsets = read_u8(reader)?;
            // size of lengths, reserved, leaf and internal node K, consistency flags
            skip(reader, 1 + 1 + 2 + 2 + 4)?;
            if version == 1 {
                skip(reader, 4)?;
            }
            let base = read_address(reader, size_of_offsets)?;
            let _free_space = read_address(reader, size_of_offsets)?;
            let eof = read_address(reader, size_of_offsets)?;
            (size_of_offsets, base, eof)
        }
        2 | 3 => {
            let size_of_offsets = read_u8(reader)?;
            // size of lengths, consistency flags
            skip(reader, 2)?;
            let base = read_address(reader, size_of_offsets)?;
            let _extension = read_address(reader, size_of_offsets)?;
            let eof = read_address(reader, size_of_offsets)?;
            (size_of_offsets, base, eof)
        }
        other => {
            return Err(KiraError::Unsupported(format!(
                "HDF5 superblock version {other}"
            )));
        }
    };
    Ok(Superblock {
        offset,
        version,
        size_of_offsets,
        base_address,
        eof_address,
    })
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8, KiraError> {
    reader.read_u8().map_err(KiraError::from_local)
}

fn skip<R: Read>(reader: &mut R, count: usize) -> Result<(), KiraError> {
    let mut buffer = vec![0u8; count];
    reader.read_exact(&mut buffer).map_err(KiraError::from_local)
}

fn read_address<R: Read>(reader: &mut R, size: u8) -> Result<u64, KiraError> {
    match size {
        2 | 4 | 8 => {
            let value = reader
                .read_uint::<LittleEndian>(size as usize)
                .map_err(KiraError::from_local)?;
            if value == (u64::MAX >> (64 - 8 * size as u32)) {
                Ok(UNDEFINED_ADDRESS)
            } else {
                Ok(value)
            }
        }
        other => Err(KiraError::Unsupported(format!(
            "HDF5 offsets of {other} bytes"
        ))),
    }
}

/// Whether the file is shorter than its superblock claims. Files without a readable
/// superblock count as truncated.
pub fn is_truncated(path: &Path) -> Result<bool, KiraError> {
    let file = File::open(path).map_err(KiraError::from_local)?;
    let length = file.metadata().map_err(KiraError::from_local)?.len();
    let mut reader = BufReader::new(file);
    match read_superblock(&mut reader) {
        Ok(superblock) => Ok(superblock
            .required_length()
            .is_some_and(|required| length < required)),
        Err(KiraError::Truncated(_)) => Ok(true),
        Err(err) => Err(err),
    }
}
