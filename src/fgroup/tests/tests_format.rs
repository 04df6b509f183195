use tempfile::TempDir;

use crate::encoding::{decode_from_slice, encode_to_vec};
use crate::fgroup::{
    check_file_header, BlockMeta, ColMeta, FileError, FileGroup, IdxEntry, BLOCK_META_SIZE,
    COL_META_SIZE, FILE_HEAD_SIZE, IDX_ENTRY_SIZE,
};

#[test]
fn idx_entry_encoded_size() {
    let entry = IdxEntry {
        offset: 1024,
        len: 80,
        has_last: 1,
        max_key: 99,
        num_super_blocks: 2,
        checksum: 0xABCD,
    };
    let bytes = encode_to_vec(&entry).unwrap();
    assert_eq!(bytes.len(), IDX_ENTRY_SIZE);

    let (decoded, _) = decode_from_slice::<IdxEntry>(&bytes).unwrap();
    assert_eq!(decoded, entry);
}

#[test]
fn block_meta_encoded_size() {
    let meta = BlockMeta {
        offset: 512,
        len: 100,
        key_first: -5,
        key_last: 77,
        num_points: 20,
        num_cols: 3,
        num_sub_blocks: 1,
        last: 1,
        algorithm: 0,
        sversion: 2,
    };
    let bytes = encode_to_vec(&meta).unwrap();
    assert_eq!(bytes.len(), BLOCK_META_SIZE);

    let (decoded, _) = decode_from_slice::<BlockMeta>(&bytes).unwrap();
    assert_eq!(decoded, meta);
}

#[test]
fn col_meta_encoded_size() {
    let col = ColMeta {
        col_id: 4,
        ty: 7,
        offset: 36,
        len: 160,
    };
    let bytes = encode_to_vec(&col).unwrap();
    assert_eq!(bytes.len(), COL_META_SIZE);

    let (decoded, _) = decode_from_slice::<ColMeta>(&bytes).unwrap();
    assert_eq!(decoded, col);
}

#[test]
fn absent_idx_entry_is_all_zero() {
    let entry = IdxEntry::default();
    assert!(!entry.is_present());
    assert_eq!(encode_to_vec(&entry).unwrap(), vec![0u8; IDX_ENTRY_SIZE]);
}

#[test]
fn create_writes_verifiable_headers() {
    let tmp = TempDir::new().unwrap();
    let group = FileGroup::create(tmp.path(), 0, 16).unwrap();

    for path in [group.head_path(), group.data_path(), group.last_path()] {
        check_file_header(&path).unwrap();
    }

    // Head carries the zeroed idx array.
    let head_len = std::fs::metadata(group.head_path()).unwrap().len();
    assert_eq!(head_len, FILE_HEAD_SIZE + 16 * IDX_ENTRY_SIZE as u64);

    let idx = group.load_idx(16).unwrap();
    assert_eq!(idx.len(), 16);
    assert!(idx.iter().all(|e| !e.is_present()));
}

#[test]
fn open_rejects_corrupt_header() {
    let tmp = TempDir::new().unwrap();
    let group = FileGroup::create(tmp.path(), 3, 8).unwrap();

    let path = group.data_path();
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[0] = b'X';
    std::fs::write(&path, &bytes).unwrap();

    assert!(matches!(
        FileGroup::open(tmp.path(), 3),
        Err(FileError::Corrupt(_))
    ));
}

#[test]
fn negative_fid_file_names_round_trip() {
    let tmp = TempDir::new().unwrap();
    let group = FileGroup::create(tmp.path(), -7, 8).unwrap();
    assert!(FileGroup::exists(tmp.path(), -7));
    FileGroup::open(tmp.path(), -7).unwrap();
    assert_eq!(group.head_path().file_name().unwrap(), "f-7.head");
}
