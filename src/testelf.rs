#![allow(missing_docs)]

//! Builders for the minimal ELF images the tests feed to the inspector.

pub(crate) const ET_EXEC: u16 = 2;
pub(crate) const ET_DYN: u16 = 3;

const EM_X86_64: u16 = 62;
const DT_NEEDED: u64 = 1;
const DT_RPATH: u64 = 15;
const DT_RUNPATH: u64 = 29;
const SHT_STRTAB: u32 = 3;
const SHT_DYNAMIC: u32 = 6;

pub(crate) struct ElfSpec<'a> {
    pub kind: u16,
    pub needed: &'a [&'a str],
    pub rpath: Option<&'a str>,
    pub runpath: Option<&'a str>,
}

impl Default for ElfSpec<'_> {
    fn default() -> Self {
        Self {
            kind: ET_DYN,
            needed: &[],
            rpath: None,
            runpath: None,
        }
    }
}

/// Assemble a 64-bit little-endian ELF with a dynamic section holding the
/// requested `DT_NEEDED`, `DT_RPATH` and `DT_RUNPATH` entries.
pub(crate) fn build(spec: &ElfSpec<'_>) -> Vec<u8> {
    let mut dynstr = vec![0_u8];
    let mut add_str = |s: &str| -> u64 {
        let offset = dynstr.len() as u64;
        dynstr.extend(s.bytes());
        dynstr.push(0);
        offset
    };
    let mut dynamic: Vec<(u64, u64)> = Vec::new();
    for needed in spec.needed {
        dynamic.push((DT_NEEDED, add_str(needed)));
    }
    if let Some(rpath) = spec.rpath {
        dynamic.push((DT_RPATH, add_str(rpath)));
    }
    if let Some(runpath) = spec.runpath {
        dynamic.push((DT_RUNPATH, add_str(runpath)));
    }
    dynamic.push((0, 0));

    let shstrtab: &[u8] = b"\0.dynstr\0.dynamic\0.shstrtab\0";
    let ehsize = 64_usize;
    let dynstr_offset = ehsize;
    let dynamic_offset = align8(dynstr_offset + dynstr.len());
    let dynamic_size = dynamic.len() * 16;
    let shstrtab_offset = dynamic_offset + dynamic_size;
    let shoff = align8(shstrtab_offset + shstrtab.len());

    let mut out = Vec::with_capacity(shoff + 4 * 64);
    out.extend(b"\x7fELF");
    out.extend([2, 1, 1, 0, 0]); // 64-bit, little-endian, current version
    out.extend([0_u8; 7]);
    out.extend(spec.kind.to_le_bytes());
    out.extend(EM_X86_64.to_le_bytes());
    out.extend(1_u32.to_le_bytes());
    out.extend(0_u64.to_le_bytes()); // entry point
    out.extend(0_u64.to_le_bytes()); // program header offset
    out.extend((shoff as u64).to_le_bytes());
    out.extend(0_u32.to_le_bytes()); // flags
    out.extend(64_u16.to_le_bytes()); // header size
    out.extend(56_u16.to_le_bytes()); // segment entry size
    out.extend(0_u16.to_le_bytes()); // no segments
    out.extend(64_u16.to_le_bytes()); // section entry size
    out.extend(4_u16.to_le_bytes()); // sections
    out.extend(3_u16.to_le_bytes()); // section names index
    assert_eq!(out.len(), ehsize);

    out.extend(&dynstr);
    out.resize(dynamic_offset, 0);
    for (tag, value) in &dynamic {
        out.extend(tag.to_le_bytes());
        out.extend(value.to_le_bytes());
    }
    out.extend(shstrtab);
    out.resize(shoff, 0);

    out.extend([0_u8; 64]); // null section
    section(&mut out, 1, SHT_STRTAB, dynstr_offset, dynstr.len(), 0, 1, 0);
    section(&mut out, 9, SHT_DYNAMIC, dynamic_offset, dynamic_size, 1, 8, 16);
    section(&mut out, 18, SHT_STRTAB, shstrtab_offset, shstrtab.len(), 0, 1, 0);
    out
}

#[allow(clippy::too_many_arguments)]
fn section(
    out: &mut Vec<u8>,
    name_offset: u32,
    kind: u32,
    offset: usize,
    size: usize,
    link: u32,
    align: u64,
    entry_len: u64,
) {
    out.extend(name_offset.to_le_bytes());
    out.extend(kind.to_le_bytes());
    out.extend(0_u64.to_le_bytes()); // flags
    out.extend(0_u64.to_le_bytes()); // virtual address
    out.extend((offset as u64).to_le_bytes());
    out.extend((size as u64).to_le_bytes());
    out.extend(link.to_le_bytes());
    out.extend(0_u32.to_le_bytes()); // info
    out.extend(align.to_le_bytes());
    out.extend(entry_len.to_le_bytes());
}

fn align8(offset: usize) -> usize {
    offset.next_multiple_of(8)
}

#[cfg(test)]
mod tests {
    use elb::Class;
    use elb::Elf;
    use elb::FileKind;

    use super::*;

    #[test]
    fn images_parse_back() {
        let bytes = build(&ElfSpec {
            kind: ET_DYN,
            needed: &["libbar.so", "libbaz.so.2"],
            rpath: Some("/r1"),
            runpath: Some("/r2:/r3"),
        });
        let mut reader = std::io::Cursor::new(&bytes);
        let elf = Elf::read_unchecked(&mut reader, 4096).unwrap();
        assert_eq!(elf.header.class, Class::Elf64);
        assert_eq!(elf.header.kind, FileKind::Shared);
        let table = elf.read_dynamic_table(&mut reader).unwrap().unwrap();
        let strings = elf.read_dynamic_string_table(&mut reader).unwrap().unwrap();
        let needed: Vec<String> = table
            .iter()
            .filter(|(tag, _)| *tag == elb::DynamicTag::Needed)
            .filter_map(|(_, offset)| strings.get_string(*offset as usize))
            .map(|s| s.to_string_lossy().into_owned())
            .collect();
        assert_eq!(needed, vec!["libbar.so", "libbaz.so.2"]);
        let rpath = table.get(elb::DynamicTag::Rpath).unwrap();
        assert_eq!(
            strings.get_string(rpath as usize).map(|s| s.to_bytes()),
            Some(&b"/r1"[..])
        );
        let runpath = table.get(elb::DynamicTag::Runpath).unwrap();
        assert_eq!(
            strings.get_string(runpath as usize).map(|s| s.to_bytes()),
            Some(&b"/r2:/r3"[..])
        );
    }
}
