// Streaming bulk copy: wide aligned loads, non-temporal stores, one fence per call.
//
// Non-temporal stores bypass the cache hierarchy, so write-once pool payloads
// do not evict hot lines, and a single SFENCE per call amortizes ordering
// cost across the whole transfer. The copy does not replace flush/sync on
// non-pmem mappings.

/// Unit of one copy iteration: 8 x 16-byte vector registers.
pub const COPY_CHUNK: usize = 128;

pub fn aligned_16(ptr: *const u8) -> bool {
    (ptr as usize) & 15 == 0
}

pub fn multiple_128(len: usize) -> bool {
    len & (COPY_CHUNK - 1) == 0
}

/// Whether `copy_nodrain` may be used for this destination/source pair.
pub fn streamable(dst: *const u8, src: *const u8, len: usize) -> bool {
    aligned_16(dst) && aligned_16(src) && multiple_128(len)
}

/// Copies `src` into `dst` with non-temporal stores and fences once at the end.
///
/// Preconditions (checked in debug builds, assumed in release): both slices
/// are 16-byte aligned, equal in length, and the length is a multiple of 128.
/// All stores are globally visible when the call returns; durability on
/// non-pmem targets still requires a storage-layer sync afterwards.
pub fn copy_nodrain(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    debug_assert!(aligned_16(dst.as_ptr()));
    debug_assert!(aligned_16(src.as_ptr()));
    debug_assert!(multiple_128(src.len()));

    #[cfg(target_arch = "x86_64")]
    {
        if std::arch::is_x86_feature_detected!("sse2") {
            unsafe { copy_sse2_a128(dst.as_mut_ptr(), src.as_ptr(), src.len()) };
            return;
        }
    }

    copy_fallback(dst, src);
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn copy_sse2_a128(dst: *mut u8, src: *const u8, len: usize) {
    use core::arch::x86_64::{__m128i, _mm_load_si128, _mm_sfence, _mm_stream_si128};

    let mut d = dst as *mut __m128i;
    let mut s = src as *const __m128i;
    let count = len >> 7;

    for _ in 0..count {
        unsafe {
            let x0 = _mm_load_si128(s);
            let x1 = _mm_load_si128(s.add(1));
            let x2 = _mm_load_si128(s.add(2));
            let x3 = _mm_load_si128(s.add(3));
            let x4 = _mm_load_si128(s.add(4));
            let x5 = _mm_load_si128(s.add(5));
            let x6 = _mm_load_si128(s.add(6));
            let x7 = _mm_load_si128(s.add(7));
            s = s.add(8);
            _mm_stream_si128(d, x0);
            _mm_stream_si128(d.add(1), x1);
            _mm_stream_si128(d.add(2), x2);
            _mm_stream_si128(d.add(3), x3);
            _mm_stream_si128(d.add(4), x4);
            _mm_stream_si128(d.add(5), x5);
            _mm_stream_si128(d.add(6), x6);
            _mm_stream_si128(d.add(7), x7);
            d = d.add(8);
        }
    }
    _mm_sfence();
}

fn copy_fallback(dst: &mut [u8], src: &[u8]) {
    dst.copy_from_slice(src);
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}
