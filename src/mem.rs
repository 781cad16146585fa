use std::mem::size_of;

/// Pointer width in bytes.
pub const fn ptr_width_usize() -> usize {
    size_of::<usize>()
}

/// Rounds `value` up to the next multiple of `align`. `align` needs
/// to be a power of 2.
pub fn align_usize_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

pub fn align_usize_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

pub fn is_aligned(value: usize, align: usize) -> bool {
    debug_assert!(align.is_power_of_two());
    (value & (align - 1)) == 0
}

pub fn os_page_align_up(value: usize) -> usize {
    align_usize_up(value, crate::os::page_size())
}
