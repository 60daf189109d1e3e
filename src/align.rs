//! Offset arithmetic used by the suballocation engine.

/// Align `addr` up to `alignment`.
/// `alignment` must be a power of 2.
/// The following expression is true: `align_up(addr, alignment) >= addr`.
pub fn align_up(addr: u64, alignment: u64) -> u64 {
    debug_assert!(
        alignment.is_power_of_two(),
        "alignment must be a power of 2"
    );
    let align_mask = alignment - 1;
    if (addr & align_mask) == 0 {
        addr
    } else {
        (addr | align_mask) + 1
    }
}

/// Align `addr` down to `alignment`.
/// `alignment` must be a power of 2.
pub fn align_down(addr: u64, alignment: u64) -> u64 {
    debug_assert!(
        alignment.is_power_of_two(),
        "alignment must be a power of 2"
    );
    addr & !(alignment - 1)
}

/// Whether the end of resource A and the start of resource B land on the same
/// hardware page of size `page_size`.
///
/// Resource A must end at or before resource B starts. Used to detect
/// buffer-image granularity conflicts between neighbouring suballocations.
pub fn blocks_on_same_page(
    resource_a_offset: u64,
    resource_a_size: u64,
    resource_b_offset: u64,
    page_size: u64,
) -> bool {
    debug_assert!(
        resource_a_offset + resource_a_size <= resource_b_offset
            && resource_a_size > 0
            && page_size > 0
    );
    let a_end = resource_a_offset + resource_a_size - 1;
    let a_end_page = align_down(a_end, page_size);
    let b_start_page = align_down(resource_b_offset, page_size);
    a_end_page == b_start_page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_basics() {
        assert_eq!(align_up(0, 1), 0);
        assert_eq!(align_up(7, 1), 7);
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(255, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn align_up_properties() {
        for &a in &[1u64, 2, 4, 8, 64, 256, 4096] {
            for v in 0..1024u64 {
                let r = align_up(v, a);
                assert_eq!(align_up(r, a), r);
                assert!(r >= v);
                assert!(r - v < a);
                assert_eq!(r % a, 0);
            }
        }
    }

    #[test]
    fn align_down_basics() {
        assert_eq!(align_down(0, 256), 0);
        assert_eq!(align_down(255, 256), 0);
        assert_eq!(align_down(256, 256), 256);
        assert_eq!(align_down(511, 256), 256);
    }

    #[test]
    fn same_page_detection() {
        // [0..200) ends on page 0; 200 starts on page 0
        assert!(blocks_on_same_page(0, 200, 200, 256));
        // [0..256) ends on page 0; 256 starts on page 1
        assert!(!blocks_on_same_page(0, 256, 256, 256));
        assert!(blocks_on_same_page(0, 257, 257, 256));
        assert!(!blocks_on_same_page(0, 128, 1024, 256));
    }

    #[test]
    fn same_page_boundary_property() {
        // whenever the last byte of A sits on an earlier page than offset
        // o + s, the two resources cannot share a page
        for g in [1u64, 2, 64, 256] {
            for o in 0..64u64 {
                for s in 1..64u64 {
                    if align_down(o + s - 1, g) < align_down(o + s, g) {
                        assert!(!blocks_on_same_page(o, s, o + s, g));
                    }
                }
            }
        }
    }
}
