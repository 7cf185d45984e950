use std::fs;
use tempfile::{tempdir, NamedTempFile};
use uf2fs::block::{decode_block, BlockHeader, MagicCheck, BLOCK_SIZE, FLAG_FAMILY_ID_PRESENT};
use uf2fs::compose::{ComposeError, ComposeOptions};
use uf2fs::family::{Family, TAG_ABSOLUTE, TAG_RP2040, TAG_RP2350_ARM_S};
use uf2fs::filesystem::RawImage;
use uf2fs::image::{build_filesystem, pack_filesystem, write_atomic, Image, ImageError};
use uf2fs::{write_sections, ScanOptions, Section};

const FS_START: u32 = 0x1012_c000;
const FW_BASE:  u32 = 0x1012_8000;

fn headers(buf: &[u8]) -> Vec<BlockHeader> {
    buf.chunks(BLOCK_SIZE)
        .map(|b| decode_block(b, MagicCheck::Strict).unwrap().0)
        .collect()
}

/// Firmware ending at 0x1012b000, one erase block short of the filesystem.
fn firmware_image() -> Vec<u8> {
    let fw = Section::single(FW_BASE, vec![0xA5; 0x3000], TAG_RP2040, FLAG_FAMILY_ID_PRESENT);
    write_sections(&[fw]).unwrap()
}

#[test]
fn test_append_end_to_end() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("fw.uf2");
    let output = dir.path().join("fw-fs.uf2");
    let fs_image = dir.path().join("fs.bin");
    fs::write(&input, firmware_image()).unwrap();
    fs::write(&fs_image, vec![0x42; 4096]).unwrap();

    let opts = ComposeOptions { fs_start: FS_START, fs_size: 4096, ..ComposeOptions::default() };
    let fs_data = build_filesystem(&RawImage::new(&fs_image), &opts).unwrap();
    let out = Image::open(&input).unwrap().append_filesystem(&fs_data, &opts).unwrap();
    write_atomic(&output, &out).unwrap();

    let sections = Image::open(&output).unwrap().sections(&ScanOptions::default()).unwrap();
    assert_eq!(sections.len(), 1);
    let data: Vec<(u32, &[u8])> = sections[0].data.ranges().collect();
    assert_eq!(data.len(), 1);
    let (base, bytes) = data[0];
    assert_eq!(base, FW_BASE);
    let tail = &bytes[0x3000..];
    assert_eq!(tail.len(), 0x1000 + 4096);
    assert!(tail[..0x1000].iter().all(|&b| b == 0xFF));
    assert!(tail[0x1000..].iter().all(|&b| b == 0x42));

    // 0x3000 firmware + 0x1000 fill + 0x1000 filesystem
    let hs = headers(&out);
    assert_eq!(hs.len(), 0x5000 / 256);
    assert!(hs.iter().all(|h| h.block_total == hs.len() as u32));
    assert_eq!(hs.last().unwrap().target_address, FS_START + 4096 - 256);
}

#[test]
fn test_missing_input_file() {
    let dir = tempdir().unwrap();
    let err = Image::open(dir.path().join("nope.uf2")).unwrap_err();
    assert!(matches!(err, ImageError::MissingInputFile { ref path } if path.ends_with("nope.uf2")));
}

#[test]
fn test_fs_image_size_must_match() {
    let mut fs_image = NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut fs_image, &[0u8; 4096]).unwrap();
    let opts = ComposeOptions { fs_size: 8192, ..ComposeOptions::default() };
    let err = build_filesystem(&RawImage::new(fs_image.path()), &opts).unwrap_err();
    assert!(matches!(err, ImageError::Io(_)));
}

#[test]
fn test_second_append_collides_and_leaves_no_output() {
    let dir = tempdir().unwrap();
    let opts = ComposeOptions { fs_start: FS_START, fs_size: 4096, ..ComposeOptions::default() };
    let once = Image::from_bytes(firmware_image()).append_filesystem(&[1u8; 4096], &opts).unwrap();

    let output = dir.path().join("twice.uf2");
    let result = Image::from_bytes(once.clone())
        .append_filesystem(&[2u8; 4096], &opts)
        .and_then(|out| write_atomic(&output, &out));
    assert!(matches!(
        result,
        Err(ImageError::Compose(ComposeError::FilesystemCollision { section: 0, address: FS_START, .. }))
    ));
    assert!(!output.exists());

    let replaced = Image::from_bytes(once)
        .append_filesystem(&[2u8; 4096], &ComposeOptions { overwrite: true, ..opts })
        .unwrap();
    let sections = Image::from_bytes(replaced).sections(&ScanOptions::default()).unwrap();
    let (_, bytes) = sections[0].data.ranges().next().unwrap();
    assert!(bytes[0x4000..].iter().all(|&b| b == 2));
}

#[test]
fn test_universal_image_keeps_section_order() {
    let placeholder = Section::single(0x10ff_ff00, vec![0xEF; 256], TAG_ABSOLUTE, FLAG_FAMILY_ID_PRESENT);
    let rp2040 = Section::single(0x1000_0000, vec![0x40; 0x800], TAG_RP2040, FLAG_FAMILY_ID_PRESENT);
    let rp2350 = Section::single(0x1000_0000, vec![0x50; 0x900], TAG_RP2350_ARM_S, FLAG_FAMILY_ID_PRESENT);
    let image = Image::from_bytes(write_sections(&[placeholder.clone(), rp2040, rp2350]).unwrap());

    let opts = ComposeOptions { fs_start: FS_START, fs_size: 4096, sparse: true, ..ComposeOptions::default() };
    let out = image.append_filesystem(&[0x42; 4096], &opts).unwrap();
    let sections = Image::from_bytes(out.clone()).sections(&ScanOptions::default()).unwrap();

    assert_eq!(sections.len(), 3);
    assert_eq!(sections[0], placeholder);
    assert_eq!(sections[1].family(), Family::Rp2040);
    assert_eq!(sections[2].family(), Family::Rp2350ArmS);
    for section in &sections[1..] {
        let ranges: Vec<(u32, &[u8])> = section.data.ranges().collect();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].1.len(), 0x1000);
        assert_eq!(ranges[1].0, FS_START);
        assert!(ranges[1].1.iter().all(|&b| b == 0x42));
    }

    // Placeholder block still declares one block more than it carries.
    let hs = headers(&out);
    assert_eq!((hs[0].block_index, hs[0].block_total), (0, 2));
}

#[test]
fn test_pack_standalone_filesystem() {
    let opts = ComposeOptions { fs_start: FS_START, fs_size: 8192, ..ComposeOptions::default() };
    let out = pack_filesystem(&[0x33; 8192], Family::Rp2350ArmS, &opts).unwrap();
    let hs = headers(&out);
    assert_eq!(hs.len(), 32);
    assert_eq!(hs[0].target_address, FS_START);
    assert!(hs.iter().all(|h| h.family_tag == TAG_RP2350_ARM_S && h.has_family()));
}

#[test]
fn test_summaries_report_digest() {
    let image = Image::from_bytes(firmware_image());
    let summaries = image.summaries(&ScanOptions::default()).unwrap();
    assert_eq!(summaries.len(), 1);
    let s = &summaries[0];
    assert_eq!(s.base_address, FW_BASE);
    assert_eq!(s.end_address, 0x1012_b000);
    assert_eq!(s.blocks, 48);
    assert_eq!(s.digest, hex::encode(blake3::hash(&[0xA5; 0x3000]).as_bytes()));
    let json = serde_json::to_value(s).unwrap();
    assert_eq!(json["family"], "rp2040");
}
