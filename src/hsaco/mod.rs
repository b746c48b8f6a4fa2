//! Code-object metadata extraction.
//!
//! A loaded code object is an ELF relocatable whose vendor note section
//! carries a msgpack document describing every kernel: the kernarg segment
//! geometry and the ordered argument records the launch-time rewriter needs.
//! Parsing is pure and best-effort; an object that cannot be read simply
//! contributes no schemas.

use goblin::elf::Elf;
use serde::Deserialize;

use crate::error::HsacoError;

/// ELF note type carrying code object v3+ metadata. Values 0..=31 of the
/// vendor range are reserved.
pub const NT_AMDGPU_METADATA: u32 = 32;

const NOTE_VENDOR: &str = "AMDGPU";

// ===============================================================================================
// Kernel argument schema
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    ByValue,
    GlobalBuffer,
    /// Compiler-inserted (grid sizes, segment bases, ...); never holds a
    /// user pointer.
    Hidden,
    Unknown,
}

impl ArgKind {
    pub fn parse(value_kind: &str) -> Self {
        if value_kind.starts_with("hidden_") {
            Self::Hidden
        } else if value_kind == "by_value" {
            Self::ByValue
        } else if value_kind == "global_buffer" {
            Self::GlobalBuffer
        } else {
            Self::Unknown
        }
    }
}

#[derive(Debug, Clone)]
pub struct KernelArg {
    pub offset: usize,
    pub size: usize,
    pub kind: ArgKind,
}

/// Argument schema of one kernel, as recorded in the code object.
#[derive(Debug, Clone)]
pub struct KernelMeta {
    /// Raw (mangled) kernel name; the key used to match registrations.
    pub name: String,
    /// Human-readable name, empty when demangling fails.
    pub demangled: String,
    pub kernarg_size: usize,
    pub kernarg_align: usize,
    pub args: Vec<KernelArg>,
}

impl KernelMeta {
    /// True when argument `index` has no trailing padding: its end offset
    /// equals the next argument's start offset, or the kernarg segment size
    /// for the last argument. Governs the stride used when scanning the
    /// argument for embedded pointers.
    pub fn packed(&self, index: usize) -> bool {
        let Some(arg) = self.args.get(index) else {
            return false;
        };
        let end = arg.offset + arg.size;
        match self.args.get(index + 1) {
            Some(next) => end == next.offset,
            None => end == self.kernarg_size,
        }
    }
}

// ===============================================================================================
// Metadata note document
// ===============================================================================================

// https://llvm.org/docs/AMDGPUUsage.html#code-object-v3-metadata
#[derive(Deserialize)]
struct MetadataDoc {
    #[serde(rename = "amdhsa.kernels", default)]
    kernels: Vec<KernelRecord>,
}

#[derive(Deserialize)]
struct KernelRecord {
    #[serde(rename = ".name")]
    name: String,
    #[serde(rename = ".kernarg_segment_size")]
    kernarg_segment_size: u64,
    #[serde(rename = ".kernarg_segment_align")]
    kernarg_segment_align: u64,
    #[serde(rename = ".args", default)]
    args: Vec<ArgRecord>,
}

#[derive(Deserialize)]
struct ArgRecord {
    #[serde(rename = ".offset")]
    offset: u64,
    #[serde(rename = ".size")]
    size: u64,
    #[serde(rename = ".value_kind")]
    value_kind: String,
}

// ===============================================================================================
// Parsing
// ===============================================================================================

/// Extract the kernel schemas embedded in a code object image.
///
/// Walks the ELF note sections for the first vendor metadata note and
/// decodes its msgpack descriptor. Keeps no reference to `image`.
///
/// # Errors
/// Fails when the image is not a parseable ELF, carries no vendor metadata
/// note, or the note descriptor does not decode. Callers treat any failure
/// as "no kernels recorded from this object".
pub fn parse_code_object(image: &[u8]) -> Result<Vec<KernelMeta>, HsacoError> {
    let elf = Elf::parse(image)?;
    let Some(notes) = elf.iter_note_sections(image, None) else {
        return Err(HsacoError::MissingMetadata);
    };

    for note in notes {
        let Ok(note) = note else { continue };
        if note.n_type != NT_AMDGPU_METADATA || note.name.trim_end_matches('\0') != NOTE_VENDOR {
            continue;
        }
        let doc: MetadataDoc = rmp_serde::from_slice(note.desc)?;
        let kernels = doc
            .kernels
            .into_iter()
            .map(|kernel| {
                let demangled = demangle(&kernel.name);
                KernelMeta {
                    demangled,
                    name: kernel.name,
                    kernarg_size: kernel.kernarg_segment_size as usize,
                    kernarg_align: kernel.kernarg_segment_align as usize,
                    args: kernel
                        .args
                        .into_iter()
                        .map(|arg| KernelArg {
                            offset: arg.offset as usize,
                            size: arg.size as usize,
                            kind: ArgKind::parse(&arg.value_kind),
                        })
                        .collect(),
                }
            })
            .collect();
        return Ok(kernels);
    }

    Err(HsacoError::MissingMetadata)
}

/// Best-effort demangling of a kernel's raw name; empty on failure.
pub fn demangle(raw: &str) -> String {
    cpp_demangle::Symbol::new(raw.as_bytes())
        .map(|symbol| symbol.to_string())
        .unwrap_or_default()
}

// ===============================================================================================
// Tests
// ===============================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Doc<'a> {
        #[serde(rename = "amdhsa.version")]
        version: [u32; 2],
        #[serde(rename = "amdhsa.kernels")]
        kernels: Vec<Kernel<'a>>,
    }

    #[derive(Serialize)]
    struct Kernel<'a> {
        #[serde(rename = ".name")]
        name: &'a str,
        #[serde(rename = ".kernarg_segment_size")]
        kernarg_segment_size: u64,
        #[serde(rename = ".kernarg_segment_align")]
        kernarg_segment_align: u64,
        #[serde(rename = ".args")]
        args: Vec<Arg<'a>>,
    }

    #[derive(Serialize)]
    struct Arg<'a> {
        #[serde(rename = ".offset")]
        offset: u64,
        #[serde(rename = ".size")]
        size: u64,
        #[serde(rename = ".value_kind")]
        value_kind: &'a str,
    }

    fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
        buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
        buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
        buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn section_header(name: u32, sh_type: u32, offset: usize, size: usize, align: u64) -> [u8; 64] {
        let mut header = [0u8; 64];
        write_u32(&mut header, 0, name);
        write_u32(&mut header, 4, sh_type);
        write_u64(&mut header, 24, offset as u64);
        write_u64(&mut header, 32, size as u64);
        write_u64(&mut header, 48, align);
        header
    }

    fn note_section(vendor: &[u8], n_type: u32, desc: &[u8]) -> Vec<u8> {
        let mut note = Vec::new();
        note.extend_from_slice(&(vendor.len() as u32 + 1).to_le_bytes());
        note.extend_from_slice(&(desc.len() as u32).to_le_bytes());
        note.extend_from_slice(&n_type.to_le_bytes());
        note.extend_from_slice(vendor);
        note.push(0);
        while note.len() % 4 != 0 {
            note.push(0);
        }
        note.extend_from_slice(desc);
        while note.len() % 4 != 0 {
            note.push(0);
        }
        note
    }

    /// Assemble a minimal ELF64 relocatable with a single note section.
    fn code_object(vendor: &[u8], n_type: u32, desc: &[u8]) -> Vec<u8> {
        let note = note_section(vendor, n_type, desc);
        let shstrtab = b"\0.note\0.shstrtab\0";
        let note_offset = 64;
        let strtab_offset = note_offset + note.len();
        let shoff = (strtab_offset + shstrtab.len() + 7) & !7;

        let mut image = vec![0u8; 64];
        image[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        image[4] = 2; // ELFCLASS64
        image[5] = 1; // little endian
        image[6] = 1; // EV_CURRENT
        write_u16(&mut image, 16, 1); // ET_REL
        write_u16(&mut image, 18, 224); // EM_AMDGPU
        write_u32(&mut image, 20, 1);
        write_u64(&mut image, 40, shoff as u64);
        write_u16(&mut image, 52, 64); // e_ehsize
        write_u16(&mut image, 58, 64); // e_shentsize
        write_u16(&mut image, 60, 3); // e_shnum
        write_u16(&mut image, 62, 2); // e_shstrndx

        image.extend_from_slice(&note);
        image.extend_from_slice(shstrtab);
        image.resize(shoff, 0);
        image.extend_from_slice(&section_header(0, 0, 0, 0, 0));
        image.extend_from_slice(&section_header(1, 7, note_offset, note.len(), 4));
        image.extend_from_slice(&section_header(7, 3, strtab_offset, shstrtab.len(), 1));
        image
    }

    fn vecadd_doc() -> Vec<u8> {
        let doc = Doc {
            version: [1, 2],
            kernels: vec![
                Kernel {
                    name: "_Z6vecAddPfS_S_i",
                    kernarg_segment_size: 40,
                    kernarg_segment_align: 8,
                    args: vec![
                        Arg { offset: 0, size: 8, value_kind: "global_buffer" },
                        Arg { offset: 8, size: 8, value_kind: "global_buffer" },
                        Arg { offset: 16, size: 8, value_kind: "global_buffer" },
                        Arg { offset: 24, size: 4, value_kind: "by_value" },
                        Arg { offset: 32, size: 8, value_kind: "hidden_global_offset_x" },
                    ],
                },
                Kernel {
                    name: "plain_kernel",
                    kernarg_segment_size: 16,
                    kernarg_segment_align: 8,
                    args: vec![Arg { offset: 0, size: 16, value_kind: "by_value" }],
                },
            ],
        };
        rmp_serde::to_vec_named(&doc).unwrap()
    }

    #[test]
    fn parses_kernels_from_metadata_note() {
        let image = code_object(b"AMDGPU", NT_AMDGPU_METADATA, &vecadd_doc());
        let kernels = parse_code_object(&image).unwrap();
        assert_eq!(kernels.len(), 2);

        let vecadd = &kernels[0];
        assert_eq!(vecadd.name, "_Z6vecAddPfS_S_i");
        assert!(vecadd.demangled.contains("vecAdd("));
        assert_eq!(vecadd.kernarg_size, 40);
        assert_eq!(vecadd.kernarg_align, 8);
        assert_eq!(vecadd.args.len(), 5);
        assert_eq!(vecadd.args[0].kind, ArgKind::GlobalBuffer);
        assert_eq!(vecadd.args[3].kind, ArgKind::ByValue);
        assert_eq!(vecadd.args[3].offset, 24);
        assert_eq!(vecadd.args[4].kind, ArgKind::Hidden);

        // a C-named kernel does not demangle
        assert_eq!(kernels[1].demangled, "");
    }

    #[test]
    fn packed_reflects_argument_layout() {
        let image = code_object(b"AMDGPU", NT_AMDGPU_METADATA, &vecadd_doc());
        let kernels = parse_code_object(&image).unwrap();
        let vecadd = &kernels[0];
        assert!(vecadd.packed(0));
        assert!(vecadd.packed(1));
        assert!(vecadd.packed(2));
        assert!(!vecadd.packed(3)); // 24 + 4 != 32
        assert!(vecadd.packed(4)); // last arg, 32 + 8 == 40
        assert!(!vecadd.packed(5)); // out of bounds

        // single packed aggregate covering the whole segment
        assert!(kernels[1].packed(0));
    }

    #[test]
    fn rejects_non_elf_input() {
        assert!(matches!(parse_code_object(b"not an elf"), Err(HsacoError::Elf(_))));
    }

    #[test]
    fn rejects_foreign_vendor_note() {
        let image = code_object(b"GNU", NT_AMDGPU_METADATA, &vecadd_doc());
        assert!(matches!(parse_code_object(&image), Err(HsacoError::MissingMetadata)));
    }

    #[test]
    fn rejects_undecodable_descriptor() {
        let image = code_object(b"AMDGPU", NT_AMDGPU_METADATA, &[0xc1, 0xff, 0x00]);
        assert!(matches!(parse_code_object(&image), Err(HsacoError::Metadata(_))));
    }

    #[test]
    fn maps_value_kinds() {
        assert_eq!(ArgKind::parse("by_value"), ArgKind::ByValue);
        assert_eq!(ArgKind::parse("global_buffer"), ArgKind::GlobalBuffer);
        assert_eq!(ArgKind::parse("hidden_none"), ArgKind::Hidden);
        assert_eq!(ArgKind::parse("hidden_multigrid_sync_arg"), ArgKind::Hidden);
        assert_eq!(ArgKind::parse("dynamic_shared_pointer"), ArgKind::Unknown);
    }

    #[test]
    fn demangle_is_best_effort() {
        assert!(demangle("_Z6vecAddPfS_S_i").contains("vecAdd"));
        assert_eq!(demangle("definitely not mangled"), "");
    }
}
