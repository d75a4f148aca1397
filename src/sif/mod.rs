//! Reading and writing SIF container images.
//!
//! A SIF file starts with a fixed-size [`Header`], followed by a table of fixed-size
//! [`Descriptor`] slots and finally the data objects themselves.  Each used descriptor points at a
//! byte range of the file and tags it with a type, a group and an optional link to another object.
//!
//! ```text
//! +-----------------+ 0
//! | header          |
//! +-----------------+ descoff
//! | descriptor 0    |
//! | descriptor 1    |
//! | ...  (dtotal)   |
//! +-----------------+ dataoff
//! | object data     |
//! | ...             |
//! +-----------------+ dataoff + datalen
//! ```
//!
//! New objects are always appended at the end of the data area and claim the first free slot of
//! the descriptor table, so existing offsets never move.

pub mod format;

use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use log::debug;
use zerocopy::{FromBytes, IntoBytes};

use crate::error::{Error, Result};

pub use self::format::{
    arch_code, arch_name, DataType, Descriptor, FsType, HashType, Header, PartType,
    PartitionExtra, SignatureExtra, DEFAULT_GROUP, GROUP_MASK, UNUSED_LINK,
};
use self::format::{host_arch, DEFAULT_DESCRIPTORS, EXTRA_LEN, LAUNCH, MAGIC, VERSION};

const HEADER_SIZE: usize = size_of::<Header>();
const DESCRIPTOR_SIZE: usize = size_of::<Descriptor>();

/// How an image file is opened by [`SifImage::load`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// A new data object, to be stored with [`SifImage::put_data_object`] or [`SifBuilder::add`].
#[derive(Clone, Debug)]
pub struct DataObject {
    pub datatype: DataType,
    pub groupid: u32,
    pub link: u32,
    pub name: String,
    pub extra: Vec<u8>,
    pub data: Vec<u8>,
}

impl DataObject {
    /// A filesystem partition in the default group.
    pub fn partition(data: Vec<u8>, fstype: FsType, parttype: PartType) -> Self {
        let extra = PartitionExtra {
            fstype: (fstype as u32).into(),
            parttype: (parttype as u32).into(),
            arch: host_arch(),
        };
        DataObject {
            datatype: DataType::Partition,
            groupid: DEFAULT_GROUP,
            link: UNUSED_LINK,
            name: "partition".into(),
            extra: extra.as_bytes().to_vec(),
            data,
        }
    }

    /// A signature over the object `link`, made by the key with fingerprint `entity`.
    pub fn signature(hashtype: HashType, entity: [u8; 20], link: u32, data: Vec<u8>) -> Self {
        let extra = SignatureExtra {
            hashtype: (hashtype as u32).into(),
            entity,
        };
        DataObject {
            datatype: DataType::Signature,
            groupid: DEFAULT_GROUP,
            link,
            name: "part-signature".into(),
            extra: extra.as_bytes().to_vec(),
            data,
        }
    }

    /// Record `arch` as the architecture of a partition.  Other objects are returned unchanged.
    pub fn with_arch(mut self, arch: [u8; 3]) -> Self {
        if self.datatype == DataType::Partition {
            if let Ok((mut extra, _)) = PartitionExtra::read_from_prefix(&self.extra) {
                extra.arch = arch;
                self.extra = extra.as_bytes().to_vec();
            }
        }
        self
    }

    /// An untyped blob outside of any group.
    pub fn generic(name: &str, data: Vec<u8>) -> Self {
        DataObject {
            datatype: DataType::Generic,
            groupid: GROUP_MASK,
            link: UNUSED_LINK,
            name: name.into(),
            extra: vec![],
            data,
        }
    }

    fn descriptor(&self, id: u32, fileoff: u64) -> Result<Descriptor> {
        if self.extra.len() > EXTRA_LEN {
            return Err(Error::format(
                "data object",
                format!(
                    "{} bytes of extra data don't fit in {EXTRA_LEN}",
                    self.extra.len()
                ),
            ));
        }

        let now = unix_now();
        let mut desc = Descriptor {
            datatype: (self.datatype as u32).into(),
            used: 1,
            id: id.into(),
            groupid: self.groupid.into(),
            link: self.link.into(),
            fileoff: fileoff.into(),
            filelen: (self.data.len() as u64).into(),
            ctime: now.into(),
            mtime: now.into(),
            uid: rustix::process::getuid().as_raw().into(),
            gid: rustix::process::getgid().as_raw().into(),
            ..Default::default()
        };
        desc.set_name(&self.name);
        desc.set_extra(&self.extra);
        Ok(desc)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Parse and validate the header and descriptor table of an in-memory image.
fn parse(data: &[u8]) -> Result<(Header, Vec<Descriptor>)> {
    let (header, _) = Header::read_from_prefix(data)
        .map_err(|_| Error::format("image", format!("file too short ({} bytes)", data.len())))?;

    if header.magic != MAGIC {
        return Err(Error::format("image", "bad SIF magic"));
    }
    if header.version != VERSION {
        return Err(Error::format(
            "image",
            format!("unsupported SIF version {:?}", format::cstr(&header.version)),
        ));
    }

    let size = data.len() as u64;
    let dtotal = u64::try_from(header.dtotal.get())
        .map_err(|_| Error::format("image", "negative descriptor count"))?;
    let descoff = u64::try_from(header.descoff.get())
        .map_err(|_| Error::format("image", "negative descriptor offset"))?;
    let desclen = dtotal
        .checked_mul(DESCRIPTOR_SIZE as u64)
        .filter(|len| descoff.checked_add(*len).is_some_and(|end| end <= size))
        .ok_or_else(|| Error::format("image", "descriptor table exceeds file size"))?;
    if header.desclen.get() != desclen as i64 {
        return Err(Error::format(
            "image",
            format!(
                "descriptor table length {} doesn't match {dtotal} slots",
                header.desclen.get()
            ),
        ));
    }
    let table = &data[descoff as usize..][..desclen as usize];
    let mut descriptors = Vec::with_capacity(dtotal as usize);
    for raw in table.chunks_exact(DESCRIPTOR_SIZE) {
        // chunks_exact() guarantees the size
        let desc = Descriptor::read_from_bytes(raw).unwrap();
        if desc.is_used() {
            let (off, len) = desc.range();
            if off.checked_add(len).is_none_or(|end| end > size) {
                return Err(Error::format(
                    "image",
                    format!("data object {} exceeds file size", desc.id.get()),
                ));
            }
        }
        descriptors.push(desc);
    }

    let unused = descriptors.iter().filter(|d| !d.is_used()).count();
    if header.dfree.get() != unused as i64 {
        return Err(Error::format(
            "image",
            format!(
                "free descriptor count {} doesn't match {unused} unused slots",
                header.dfree.get()
            ),
        ));
    }

    Ok((header, descriptors))
}

/// A loaded SIF image.
///
/// The whole file is read into memory on [`SifImage::load`]; the buffer acts as the mapping that
/// all byte ranges are resolved against.  The file stays open for the lifetime of the handle and
/// is released when the handle is dropped or passed to [`SifImage::unload`].
pub struct SifImage {
    path: PathBuf,
    file: File,
    mode: OpenMode,
    data: Vec<u8>,
    header: Header,
    descriptors: Vec<Descriptor>,
}

impl std::fmt::Debug for SifImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SifImage")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl Drop for SifImage {
    fn drop(&mut self) {
        debug!("unloading SIF image {}", self.path.display());
    }
}

impl SifImage {
    /// Open the image at `path` and parse its descriptor table.
    pub fn load(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(mode == OpenMode::ReadWrite)
            .open(path)
            .map_err(|e| Error::io(format!("opening image {}", path.display()), e))?;

        let mut data = vec![];
        file.read_to_end(&mut data)
            .map_err(|e| Error::io(format!("reading image {}", path.display()), e))?;

        let (header, descriptors) = parse(&data)?;
        debug!("loaded SIF image {}: {header:?}", path.display());

        Ok(SifImage {
            path: path.to_path_buf(),
            file,
            mode,
            data,
            header,
            descriptors,
        })
    }

    /// Release the image.  Equivalent to dropping it.
    pub fn unload(self) {}

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The total size of the image in bytes.
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterate over the used descriptors, in table order.
    pub fn descriptors(&self) -> impl Iterator<Item = &Descriptor> {
        self.descriptors.iter().filter(|d| d.is_used())
    }

    /// Find the primary partition of the default group.
    pub fn default_group_partition(&self) -> Result<&Descriptor> {
        self.descriptors()
            .find(|d| {
                d.data_type() == Ok(DataType::Partition) && d.groupid.get() == DEFAULT_GROUP
            })
            .ok_or_else(|| Error::NotFound("default group partition".into()))
    }

    /// Iterate over all signature objects.
    pub fn signatures(&self) -> impl Iterator<Item = &Descriptor> {
        self.descriptors()
            .filter(|d| d.data_type() == Ok(DataType::Signature))
    }

    /// Find the first signature object.
    pub fn signature(&self) -> Result<&Descriptor> {
        self.signatures()
            .next()
            .ok_or_else(|| Error::NotFound("signature object".into()))
    }

    /// Return `len` bytes starting at `offset`, relative to the start of the image.
    pub fn read_range(&self, offset: u64, len: u64) -> Result<&[u8]> {
        offset
            .checked_add(len)
            .filter(|end| *end <= self.len())
            .map(|end| &self.data[offset as usize..end as usize])
            .ok_or_else(|| {
                Error::format(
                    "image",
                    format!("range {offset}+{len} exceeds image size {}", self.len()),
                )
            })
    }

    /// Return the payload of a data object.
    pub fn object_data(&self, desc: &Descriptor) -> Result<&[u8]> {
        let (offset, len) = desc.range();
        self.read_range(offset, len)
    }

    /// Append a data object to the image file, returning its id.
    ///
    /// The payload is written at the end of the file and the object takes the first free slot of
    /// the descriptor table.  The header is updated last.
    pub fn put_data_object(&mut self, object: DataObject) -> Result<u32> {
        if self.mode != OpenMode::ReadWrite {
            return Err(Error::io(
                format!("adding data object to {}", self.path.display()),
                std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "image was loaded read-only",
                ),
            ));
        }

        let slot = self
            .descriptors
            .iter()
            .position(|d| !d.is_used())
            .ok_or_else(|| Error::format("image", "descriptor table full"))?;
        let id = self
            .descriptors()
            .map(|d| d.id.get())
            .max()
            .unwrap_or(0)
            .checked_add(1)
            .ok_or_else(|| Error::format("image", "descriptor id space exhausted"))?;
        let fileoff = self.len();
        let desc = object.descriptor(id, fileoff)?;
        debug!(
            "adding {} object {id} ({} bytes @{fileoff}) in slot {slot}",
            object.datatype,
            object.data.len()
        );

        let mut header = self.header.clone();
        let dataoff = header.dataoff.get() as u64;
        let unused = self.descriptors.iter().filter(|d| !d.is_used()).count();
        header.dfree = (unused as i64 - 1).into();
        header.datalen = ((fileoff + object.data.len() as u64).saturating_sub(dataoff) as i64).into();
        header.mtime = unix_now().into();

        let descpos = header.descoff.get() as u64 + (slot * DESCRIPTOR_SIZE) as u64;
        let write = |file: &File| -> std::io::Result<()> {
            file.write_all_at(&object.data, fileoff)?;
            file.write_all_at(desc.as_bytes(), descpos)?;
            file.write_all_at(header.as_bytes(), 0)?;
            file.sync_all()
        };
        write(&self.file).map_err(|e| {
            Error::io(
                format!("adding data object to {}", self.path.display()),
                e,
            )
        })?;

        self.data.extend_from_slice(&object.data);
        self.data[descpos as usize..][..DESCRIPTOR_SIZE].copy_from_slice(desc.as_bytes());
        self.data[..HEADER_SIZE].copy_from_slice(header.as_bytes());
        self.descriptors[slot] = desc;
        self.header = header;

        Ok(id)
    }
}

/// Creates new SIF images.
#[derive(Debug)]
pub struct SifBuilder {
    arch: [u8; 3],
    slots: usize,
    objects: Vec<DataObject>,
}

impl Default for SifBuilder {
    fn default() -> Self {
        SifBuilder {
            arch: host_arch(),
            slots: DEFAULT_DESCRIPTORS,
            objects: vec![],
        }
    }
}

impl SifBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of descriptor slots to allocate.
    pub fn descriptor_slots(mut self, slots: usize) -> Self {
        self.slots = slots;
        self
    }

    /// Set the architecture recorded in the header.
    pub fn arch(mut self, arch: [u8; 3]) -> Self {
        self.arch = arch;
        self
    }

    pub fn add(mut self, object: DataObject) -> Self {
        self.objects.push(object);
        self
    }

    /// Serialize the image.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.objects.len() > self.slots {
            return Err(Error::format(
                "image",
                format!(
                    "{} data objects don't fit in {} descriptor slots",
                    self.objects.len(),
                    self.slots
                ),
            ));
        }

        let desclen = self.slots * DESCRIPTOR_SIZE;
        let dataoff = HEADER_SIZE + desclen;
        let datalen: usize = self.objects.iter().map(|o| o.data.len()).sum();
        let now = unix_now();

        let mut header = Header {
            magic: MAGIC,
            version: VERSION,
            arch: self.arch,
            uuid: rand::random(),
            ctime: now.into(),
            mtime: now.into(),
            dfree: ((self.slots - self.objects.len()) as i64).into(),
            dtotal: (self.slots as i64).into(),
            descoff: (HEADER_SIZE as i64).into(),
            desclen: (desclen as i64).into(),
            dataoff: (dataoff as i64).into(),
            datalen: (datalen as i64).into(),
            ..Default::default()
        };
        header.launch[..LAUNCH.len()].copy_from_slice(LAUNCH);

        let mut output = Vec::with_capacity(dataoff + datalen);
        output.extend_from_slice(header.as_bytes());

        let mut fileoff = dataoff as u64;
        for (n, object) in self.objects.iter().enumerate() {
            output.extend_from_slice(object.descriptor(n as u32 + 1, fileoff)?.as_bytes());
            fileoff += object.data.len() as u64;
        }
        output.resize(dataoff, 0);

        for object in &self.objects {
            output.extend_from_slice(&object.data);
        }

        Ok(output)
    }

    /// Write the image to `path`, replacing any existing file.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let image = self.to_bytes()?;
        let mut file = File::create(path)
            .map_err(|e| Error::io(format!("creating image {}", path.display()), e))?;
        file.write_all(&image)
            .and_then(|()| file.sync_all())
            .map_err(|e| Error::io(format!("writing image {}", path.display()), e))
    }
}
