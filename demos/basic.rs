use tagalloc::TagAllocator;

fn report(addr: *mut u8, size: usize) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");
}

fn main() {
    let mut allocator = TagAllocator::new();

    unsafe {
        let addr1 = allocator.malloc(8);
        report(addr1, 8);

        let addr2 = allocator.malloc(48);
        report(addr2, 48);

        let addr3 = allocator.calloc(4, 16);
        report(addr3, 64);

        allocator.check(line!() as i32);

        println!("Heap spans {} bytes, deallocating everything...", allocator.heap_size());
        allocator.free(addr1);
        allocator.free(addr2);
        allocator.free(addr3);

        allocator.check(line!() as i32);
    }
}
