//! This is a very minimal example to show using a RegionProvider directly,
//! and then a heap on top of it.

use bestfit_allocator::{HeapManager, RegionProvider, SbrkProvider};

fn main() {
    // SbrkProvider moves the program break with libc::sbrk
    let mut provider = SbrkProvider::new();
    let p = unsafe { provider.extend(4096).unwrap() };
    println!("Returned: ({:p}={})", p, p.as_ptr() as usize);

    let mut heap = HeapManager::with_extension_size(provider, 4096);
    unsafe {
        let a = heap.allocate(100);
        let b = heap.allocate(100);
        println!("Allocated {:p} and {:p}", a, b);
        heap.free(a);
        heap.free(b);
    }
    println!("Free list: {}", heap.blocks());
    println!("Break moved {} times", heap.provider().growths());
}
