// Virtual-memory core: swap-slot allocator, global frame table with clock
// eviction, and the per-process supplemental page table.
pub mod frame;
pub mod mmap;
pub mod page;
pub mod swap;
