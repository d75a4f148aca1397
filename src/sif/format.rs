//! SIF on-disk format definitions.
//!
//! This module defines the binary layout of the SIF global header and the data object descriptors
//! using zerocopy-based parsing.  All structures are defined in terms of pure LE integer types;
//! conversion to enum values is handled separately.

use std::fmt;

use zerocopy::{
    little_endian::{I64, U32, U64},
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout,
};

pub const LAUNCH: &[u8] = b"#!/usr/bin/env run-singularity\n";
pub const MAGIC: [u8; 10] = *b"SIF_MAGIC\0";
pub const VERSION: [u8; 3] = *b"01\0";

/// Number of descriptor slots allocated by [`super::SifBuilder`] unless told otherwise.
pub const DEFAULT_DESCRIPTORS: usize = 48;

pub const GROUP_MASK: u32 = 0xf000_0000;
pub const DEFAULT_GROUP: u32 = GROUP_MASK | 1;
pub const UNUSED_LINK: u32 = 0;

pub const NAME_LEN: usize = 128;
pub const EXTRA_LEN: usize = 384;

/* Data object types */

pub const DATA_DEFFILE: u32 = 0x4001;
pub const DATA_ENVVAR: u32 = 0x4002;
pub const DATA_LABELS: u32 = 0x4003;
pub const DATA_PARTITION: u32 = 0x4004;
pub const DATA_SIGNATURE: u32 = 0x4005;
pub const DATA_GENERICJSON: u32 = 0x4006;
pub const DATA_GENERIC: u32 = 0x4007;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum DataType {
    Deffile = DATA_DEFFILE,
    EnvVar = DATA_ENVVAR,
    Labels = DATA_LABELS,
    Partition = DATA_PARTITION,
    Signature = DATA_SIGNATURE,
    GenericJson = DATA_GENERICJSON,
    Generic = DATA_GENERIC,
}

impl TryFrom<u32> for DataType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            DATA_DEFFILE => Ok(Self::Deffile),
            DATA_ENVVAR => Ok(Self::EnvVar),
            DATA_LABELS => Ok(Self::Labels),
            DATA_PARTITION => Ok(Self::Partition),
            DATA_SIGNATURE => Ok(Self::Signature),
            DATA_GENERICJSON => Ok(Self::GenericJson),
            DATA_GENERIC => Ok(Self::Generic),
            other => Err(other),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Deffile => "Def.File",
            Self::EnvVar => "Env.Vars",
            Self::Labels => "JSON.Labels",
            Self::Partition => "FS",
            Self::Signature => "Signature",
            Self::GenericJson => "JSON.Generic",
            Self::Generic => "Generic/Raw",
        })
    }
}

/* Hash types recorded in signature descriptors */

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum HashType {
    Sha256 = 1,
    Sha384 = 2,
    Sha512 = 3,
    Blake2s = 4,
    Blake2b = 5,
}

/* Partition filesystem and role */

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum FsType {
    Squash = 1,
    Ext3 = 2,
    ImmuObj = 3,
    Raw = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum PartType {
    System = 1,
    PrimSys = 2,
    Data = 3,
    Overlay = 4,
}

/* Global header */

#[derive(Clone, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct Header {
    pub launch: [u8; 32],

    pub magic: [u8; 10],
    pub version: [u8; 3],
    pub arch: [u8; 3],

    pub uuid: [u8; 16],

    pub ctime: I64,
    pub mtime: I64,

    pub dfree: I64,
    pub dtotal: I64,

    pub descoff: I64,
    pub desclen: I64,

    pub dataoff: I64,
    pub datalen: I64,
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Header")
            .field("arch", &cstr(&self.arch))
            .field("uuid", &hex::encode(self.uuid))
            .field("dfree", &self.dfree.get())
            .field("dtotal", &self.dtotal.get())
            .field("descoff", &self.descoff.get())
            .field("dataoff", &self.dataoff.get())
            .field("datalen", &self.datalen.get())
            .finish_non_exhaustive()
    }
}

/* Data object descriptors */

#[derive(Clone, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct Descriptor {
    pub datatype: U32,
    pub used: u8,
    pub reserved: [u8; 3],
    pub id: U32,
    pub groupid: U32,

    pub link: U32,
    pub fileoff: U64,
    pub filelen: U64,

    pub ctime: I64,
    pub mtime: I64,
    pub uid: U32,
    pub gid: U32,

    pub name: [u8; NAME_LEN],
    pub extra: [u8; EXTRA_LEN],
}

impl Default for Descriptor {
    fn default() -> Self {
        Descriptor::new_zeroed()
    }
}

impl Descriptor {
    pub fn is_used(&self) -> bool {
        self.used != 0
    }

    pub fn data_type(&self) -> Result<DataType, u32> {
        DataType::try_from(self.datatype.get())
    }

    pub fn name(&self) -> String {
        cstr(&self.name)
    }

    pub fn set_name(&mut self, name: &str) {
        let len = name.len().min(NAME_LEN - 1);
        self.name = [0; NAME_LEN];
        self.name[..len].copy_from_slice(&name.as_bytes()[..len]);
    }

    /// The byte range covered by this descriptor, as `(offset, length)`.
    pub fn range(&self) -> (u64, u64) {
        (self.fileoff.get(), self.filelen.get())
    }

    pub fn signature_extra(&self) -> SignatureExtra {
        let (extra, _) = SignatureExtra::read_from_prefix(&self.extra).unwrap();
        extra
    }

    pub fn partition_extra(&self) -> PartitionExtra {
        let (extra, _) = PartitionExtra::read_from_prefix(&self.extra).unwrap();
        extra
    }

    /// Replace the `extra` area.  `extra` must not be longer than [`EXTRA_LEN`].
    pub(crate) fn set_extra(&mut self, extra: &[u8]) {
        self.extra = [0; EXTRA_LEN];
        self.extra[..extra.len()].copy_from_slice(extra);
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("datatype", &self.data_type())
            .field("id", &self.id.get())
            .field("groupid", &format_args!("{:#x}", self.groupid.get()))
            .field("link", &self.link.get())
            .field("fileoff", &self.fileoff.get())
            .field("filelen", &self.filelen.get())
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// Layout of `Descriptor::extra` for signature objects.
#[derive(Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct SignatureExtra {
    pub hashtype: U32,
    pub entity: [u8; 20],
}

/// Layout of `Descriptor::extra` for partition objects.
#[derive(Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct PartitionExtra {
    pub fstype: U32,
    pub parttype: U32,
    pub arch: [u8; 3],
}

/* Architecture codes, keyed by Go-style architecture names */

const ARCHES: &[(&str, [u8; 3])] = &[
    ("386", *b"01\0"),
    ("amd64", *b"02\0"),
    ("arm", *b"03\0"),
    ("arm64", *b"04\0"),
    ("ppc64", *b"05\0"),
    ("ppc64le", *b"06\0"),
    ("mips", *b"07\0"),
    ("mipsle", *b"08\0"),
    ("mips64", *b"09\0"),
    ("mips64le", *b"10\0"),
    ("s390x", *b"11\0"),
];

pub const UNKNOWN_ARCH: [u8; 3] = *b"00\0";

/// The code for an architecture name such as `amd64` or `arm64`.
pub fn arch_code(name: &str) -> Option<[u8; 3]> {
    ARCHES
        .iter()
        .find(|(arch, _)| *arch == name)
        .map(|(_, code)| *code)
}

/// The name of an architecture code, or `"unknown"`.
pub fn arch_name(code: &[u8; 3]) -> &'static str {
    ARCHES
        .iter()
        .find(|(_, c)| c == code)
        .map_or("unknown", |(arch, _)| *arch)
}

/// The architecture code of the running host, as recorded in headers and partitions.
pub fn host_arch() -> [u8; 3] {
    let name = match std::env::consts::ARCH {
        "x86" => "386",
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "powerpc64" if cfg!(target_endian = "little") => "ppc64le",
        "powerpc64" => "ppc64",
        "mips" if cfg!(target_endian = "little") => "mipsle",
        "mips64" if cfg!(target_endian = "little") => "mips64le",
        other => other,
    };
    arch_code(name).unwrap_or(UNKNOWN_ARCH)
}

/// Interpret a NUL-padded byte field as a string.
pub(crate) fn cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
