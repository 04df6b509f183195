use crate::cache::{Cache, CacheError, SlotRef, CACHE_BLOCK_SIZE};

#[test]
fn alloc_and_read_back() {
    let mut cache = Cache::new(4 * 1024 * 1024);

    let slot = cache.alloc_bytes(b"hello arena").unwrap();
    assert_eq!(cache.mem().slice(slot), b"hello arena");
}

#[test]
fn allocations_are_disjoint() {
    let mut cache = Cache::new(4 * 1024 * 1024);

    let a = cache.alloc_bytes(&[0xAA; 64]).unwrap();
    let b = cache.alloc_bytes(&[0xBB; 64]).unwrap();

    assert_eq!(cache.mem().slice(a), &[0xAA; 64][..]);
    assert_eq!(cache.mem().slice(b), &[0xBB; 64][..]);
}

#[test]
fn slot_survives_buffer_growth() {
    let mut cache = Cache::new(16 * 1024 * 1024);

    let first = cache.alloc_bytes(&[0x11; 128]).unwrap();

    // Force several new buffers.
    for _ in 0..6 {
        cache.alloc(CACHE_BLOCK_SIZE / 2).unwrap();
    }

    assert_eq!(cache.mem().slice(first), &[0x11; 128][..]);
}

#[test]
fn nil_sentinel() {
    assert!(SlotRef::NIL.is_nil());
    let real = SlotRef {
        block: 0,
        offset: 0,
        len: 1,
    };
    assert!(!real.is_nil());
}

#[test]
fn oversized_allocation_is_rejected() {
    let mut cache = Cache::new(16 * 1024 * 1024);
    let err = cache.alloc(CACHE_BLOCK_SIZE + 1).unwrap_err();
    assert!(matches!(err, CacheError::AllocTooLarge(_)));
}

#[test]
fn cap_produces_cache_full() {
    let mut cache = Cache::new(4 * 1024 * 1024);

    // Fill all four buffers the cap allows.
    let mut n = 0usize;
    loop {
        match cache.alloc(64 * 1024) {
            Ok(_) => n += 1,
            Err(CacheError::CacheFull) => break,
            Err(other) => panic!("unexpected error: {other}"),
        }
        assert!(n < 1000, "cap never hit");
    }

    assert_eq!(n, 4 * 1024 * 1024 / (64 * 1024));
}

#[test]
fn u32_accessors_round_trip() {
    let mut cache = Cache::new(4 * 1024 * 1024);
    let slot = cache.alloc(16).unwrap();

    cache
        .mem_mut()
        .write_u32(slot.block, slot.offset + 4, 0xFEED_BEEF);
    assert_eq!(cache.mem().read_u32(slot.block, slot.offset + 4), 0xFEED_BEEF);
}
