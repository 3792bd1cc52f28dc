//! Just enough ELF reading to tell programs from libraries: header
//! validation, the entry point, and symbol lookup in relocatable objects.

const MAGIC: &[u8; 4] = b"\x7fELF";
const IDENT_LEN: usize = 16;

const CLASS_32: u8 = 1;
const CLASS_64: u8 = 2;
const DATA_LSB: u8 = 1;
const DATA_MSB: u8 = 2;

const ET_REL: u16 = 1;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;

const PT_INTERP: u32 = 3;
const SHT_SYMTAB: u32 = 2;
const SHN_UNDEF: u16 = 0;
const STB_GLOBAL: u8 = 1;
const STB_WEAK: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ElfError {
    #[error("not an ELF image")]
    BadMagic,
    #[error("unsupported ELF class {0}")]
    UnsupportedClass(u8),
    #[error("unsupported ELF data encoding {0}")]
    UnsupportedEncoding(u8),
    #[error("truncated ELF image: {0} is out of bounds")]
    Truncated(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Relocatable,
    Executable,
    SharedObject,
    Other(u16),
}

impl From<u16> for ImageKind {
    fn from(e_type: u16) -> Self {
        match e_type {
            ET_REL => ImageKind::Relocatable,
            ET_EXEC => ImageKind::Executable,
            ET_DYN => ImageKind::SharedObject,
            other => ImageKind::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    is_64: bool,
    little_endian: bool,
}

impl Layout {
    fn from_ident(bytes: &[u8]) -> Result<Self, ElfError> {
        let ident = bytes
            .get(..IDENT_LEN)
            .ok_or(ElfError::Truncated("identification"))?;
        if &ident[..4] != MAGIC {
            return Err(ElfError::BadMagic);
        }

        let is_64 = match ident[4] {
            CLASS_32 => false,
            CLASS_64 => true,
            other => return Err(ElfError::UnsupportedClass(other)),
        };
        let little_endian = match ident[5] {
            DATA_LSB => true,
            DATA_MSB => false,
            other => return Err(ElfError::UnsupportedEncoding(other)),
        };

        Ok(Self {
            is_64,
            little_endian,
        })
    }

    fn u8(&self, data: &[u8], offset: usize, what: &'static str) -> Result<u8, ElfError> {
        data.get(offset).copied().ok_or(ElfError::Truncated(what))
    }

    fn u16(&self, data: &[u8], offset: usize, what: &'static str) -> Result<u16, ElfError> {
        let raw: [u8; 2] = field(data, offset, what)?;
        Ok(if self.little_endian {
            u16::from_le_bytes(raw)
        } else {
            u16::from_be_bytes(raw)
        })
    }

    fn u32(&self, data: &[u8], offset: usize, what: &'static str) -> Result<u32, ElfError> {
        let raw: [u8; 4] = field(data, offset, what)?;
        Ok(if self.little_endian {
            u32::from_le_bytes(raw)
        } else {
            u32::from_be_bytes(raw)
        })
    }

    fn u64(&self, data: &[u8], offset: usize, what: &'static str) -> Result<u64, ElfError> {
        let raw: [u8; 8] = field(data, offset, what)?;
        Ok(if self.little_endian {
            u64::from_le_bytes(raw)
        } else {
            u64::from_be_bytes(raw)
        })
    }

    /// Address-sized field: 4 bytes in ELF32, 8 in ELF64.
    fn word(&self, data: &[u8], offset: usize, what: &'static str) -> Result<u64, ElfError> {
        if self.is_64 {
            self.u64(data, offset, what)
        } else {
            self.u32(data, offset, what).map(u64::from)
        }
    }
}

fn field<const N: usize>(data: &[u8], offset: usize, what: &'static str) -> Result<[u8; N], ElfError> {
    offset
        .checked_add(N)
        .and_then(|end| data.get(offset..end))
        .and_then(|slice| slice.try_into().ok())
        .ok_or(ElfError::Truncated(what))
}

fn to_usize(value: u64, what: &'static str) -> Result<usize, ElfError> {
    usize::try_from(value).map_err(|_| ElfError::Truncated(what))
}

#[derive(Debug, Clone, Copy)]
struct Table {
    offset: usize,
    entry_size: usize,
    count: usize,
}

impl Table {
    fn entry<'a>(&self, bytes: &'a [u8], index: usize, what: &'static str) -> Result<&'a [u8], ElfError> {
        let start = index
            .checked_mul(self.entry_size)
            .and_then(|relative| relative.checked_add(self.offset))
            .ok_or(ElfError::Truncated(what))?;
        let end = start
            .checked_add(self.entry_size)
            .ok_or(ElfError::Truncated(what))?;
        bytes.get(start..end).ok_or(ElfError::Truncated(what))
    }

    fn check(&self, bytes: &[u8], what: &'static str) -> Result<(), ElfError> {
        if self.count == 0 {
            return Ok(());
        }
        self.entry(bytes, self.count - 1, what).map(|_| ())
    }
}

#[derive(Debug, Clone, Copy)]
struct Section {
    kind: u32,
    offset: u64,
    size: u64,
    link: u32,
    entry_size: u64,
}

/// A validated ELF image borrowed from the artifact bytes.
#[derive(Debug, Clone, Copy)]
pub struct ElfImage<'a> {
    bytes: &'a [u8],
    layout: Layout,
    kind: ImageKind,
    machine: u16,
    entry: u64,
    program_headers: Table,
    section_headers: Table,
}

/// Reads only the identification and `e_type`, for probing file prefixes.
pub fn image_kind(bytes: &[u8]) -> Result<ImageKind, ElfError> {
    let layout = Layout::from_ident(bytes)?;
    layout.u16(bytes, 16, "e_type").map(ImageKind::from)
}

impl<'a> ElfImage<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ElfError> {
        let layout = Layout::from_ident(bytes)?;
        let kind = ImageKind::from(layout.u16(bytes, 16, "e_type")?);
        let machine = layout.u16(bytes, 18, "e_machine")?;
        let entry = layout.word(bytes, 24, "e_entry")?;

        let (program_headers, section_headers) = if layout.is_64 {
            (
                Table {
                    offset: to_usize(layout.u64(bytes, 32, "e_phoff")?, "e_phoff")?,
                    entry_size: layout.u16(bytes, 54, "e_phentsize")?.into(),
                    count: layout.u16(bytes, 56, "e_phnum")?.into(),
                },
                Table {
                    offset: to_usize(layout.u64(bytes, 40, "e_shoff")?, "e_shoff")?,
                    entry_size: layout.u16(bytes, 58, "e_shentsize")?.into(),
                    count: layout.u16(bytes, 60, "e_shnum")?.into(),
                },
            )
        } else {
            (
                Table {
                    offset: to_usize(layout.u32(bytes, 28, "e_phoff")?.into(), "e_phoff")?,
                    entry_size: layout.u16(bytes, 42, "e_phentsize")?.into(),
                    count: layout.u16(bytes, 44, "e_phnum")?.into(),
                },
                Table {
                    offset: to_usize(layout.u32(bytes, 32, "e_shoff")?.into(), "e_shoff")?,
                    entry_size: layout.u16(bytes, 46, "e_shentsize")?.into(),
                    count: layout.u16(bytes, 48, "e_shnum")?.into(),
                },
            )
        };
        program_headers.check(bytes, "program header table")?;
        section_headers.check(bytes, "section header table")?;

        Ok(Self {
            bytes,
            layout,
            kind,
            machine,
            entry,
            program_headers,
            section_headers,
        })
    }

    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    /// `e_machine`, the instruction set the image was built for.
    pub fn machine(&self) -> u16 {
        self.machine
    }

    /// The address execution starts at, or `None` for images that cannot be
    /// started on their own. A position-independent executable is an
    /// `ET_DYN` image that asks for a program interpreter; a plain shared
    /// library does not.
    pub fn entry_point(&self) -> Result<Option<u64>, ElfError> {
        if self.entry == 0 {
            return Ok(None);
        }
        let runnable = match self.kind {
            ImageKind::Executable => true,
            ImageKind::SharedObject => self.has_program_header(PT_INTERP)?,
            _ => false,
        };
        Ok(runnable.then_some(self.entry))
    }

    fn has_program_header(&self, wanted: u32) -> Result<bool, ElfError> {
        for index in 0..self.program_headers.count {
            let header = self
                .program_headers
                .entry(self.bytes, index, "program header")?;
            if self.layout.u32(header, 0, "p_type")? == wanted {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn section(&self, index: usize) -> Result<Section, ElfError> {
        let header = self
            .section_headers
            .entry(self.bytes, index, "section header")?;
        let layout = &self.layout;
        if layout.is_64 {
            Ok(Section {
                kind: layout.u32(header, 4, "sh_type")?,
                offset: layout.u64(header, 24, "sh_offset")?,
                size: layout.u64(header, 32, "sh_size")?,
                link: layout.u32(header, 40, "sh_link")?,
                entry_size: layout.u64(header, 56, "sh_entsize")?,
            })
        } else {
            Ok(Section {
                kind: layout.u32(header, 4, "sh_type")?,
                offset: layout.u32(header, 16, "sh_offset")?.into(),
                size: layout.u32(header, 20, "sh_size")?.into(),
                link: layout.u32(header, 24, "sh_link")?,
                entry_size: layout.u32(header, 36, "sh_entsize")?.into(),
            })
        }
    }

    fn section_data(&self, section: &Section) -> Result<&'a [u8], ElfError> {
        let start = to_usize(section.offset, "section data")?;
        let end = start
            .checked_add(to_usize(section.size, "section data")?)
            .ok_or(ElfError::Truncated("section data"))?;
        self.bytes
            .get(start..end)
            .ok_or(ElfError::Truncated("section data"))
    }

    /// Whether the static symbol table defines `name` with global or weak
    /// binding.
    pub fn defines_symbol(&self, name: &str) -> Result<bool, ElfError> {
        let default_entry_size = if self.layout.is_64 { 24 } else { 16 };

        for index in 0..self.section_headers.count {
            let section = self.section(index)?;
            if section.kind != SHT_SYMTAB {
                continue;
            }

            let symbols = self.section_data(&section)?;
            let strings = self.section_data(&self.section(section.link as usize)?)?;
            let entry_size = match to_usize(section.entry_size, "sh_entsize")? {
                0 => default_entry_size,
                size => size,
            };

            for symbol in symbols.chunks_exact(entry_size) {
                let (info, section_index) = if self.layout.is_64 {
                    (
                        self.layout.u8(symbol, 4, "st_info")?,
                        self.layout.u16(symbol, 6, "st_shndx")?,
                    )
                } else {
                    (
                        self.layout.u8(symbol, 12, "st_info")?,
                        self.layout.u16(symbol, 14, "st_shndx")?,
                    )
                };
                let binding = info >> 4;
                if section_index == SHN_UNDEF || !(binding == STB_GLOBAL || binding == STB_WEAK) {
                    continue;
                }

                let name_offset = to_usize(self.layout.u32(symbol, 0, "st_name")?.into(), "st_name")?;
                if symbol_name(strings, name_offset) == Some(name.as_bytes()) {
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }
}

fn symbol_name(strings: &[u8], offset: usize) -> Option<&[u8]> {
    let tail = strings.get(offset..)?;
    let end = tail.iter().position(|&b| b == 0)?;
    Some(&tail[..end])
}
