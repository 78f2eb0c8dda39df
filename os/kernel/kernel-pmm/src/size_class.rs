//! Slab size classes.
//!
//! Requests are rounded up to the smallest class that holds them. Larger
//! objects are not slab material and go to the page allocator or the heap.

/// Object sizes served by slab caches, in bytes.
pub const SIZE_CLASSES: [usize; 7] = [16, 32, 64, 128, 256, 512, 1024];

/// Largest object a slab cache accepts.
pub const MAX_SLAB_OBJECT: usize = SIZE_CLASSES[SIZE_CLASSES.len() - 1];

/// Alignment every slab object is guaranteed.
pub const SLAB_ALIGN: usize = 16;

/// Index of the smallest class holding `size` bytes.
#[must_use]
pub const fn class_index(size: usize) -> Option<usize> {
    let mut i = 0;
    while i < SIZE_CLASSES.len() {
        if SIZE_CLASSES[i] >= size {
            return Some(i);
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_smallest_fitting_class() {
        assert_eq!(class_index(0), Some(0));
        assert_eq!(class_index(16), Some(0));
        assert_eq!(class_index(17), Some(1));
        assert_eq!(class_index(200), Some(4));
        assert_eq!(class_index(1024), Some(6));
        assert_eq!(class_index(1025), None);
    }

    #[test]
    fn classes_are_strictly_increasing_multiples_of_the_alignment() {
        for w in SIZE_CLASSES.windows(2) {
            assert!(w[0] < w[1]);
        }
        assert!(SIZE_CLASSES.iter().all(|c| c % SLAB_ALIGN == 0));
    }
}
