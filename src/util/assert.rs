/// Test if `ptr` is aligned to a multiple of `align`
pub fn aligned_to<T>(ptr: *const T, align: usize) -> bool {
    ptr as usize % align == 0
}

/// Test if `addr` lies in the first page, where no allocator hands out memory.
/// Used to reject obviously foreign pointers before reading a header.
pub fn in_null_page(addr: usize) -> bool {
    addr < 4096
}
