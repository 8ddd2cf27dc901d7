use arm64memparser::arch::layout::{AddressSpaceLayout, PhysOffsetSource};
use arm64memparser::arch::walker::{PageTableWalker, TableScratch};
use arm64memparser::memory::DumpImage;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

const PHYS_BASE: u64 = 0x4000_0000;
const REGION_SIZE: u64 = 0x20_0000;
const PGD: u64 = PHYS_BASE + 0x1000;
const VMALLOC_VA: u64 = 0xffff_ff80_0001_0000;

fn put(bytes: &mut [u8], paddr: u64, value: u64) {
    let at = (32 + paddr - PHYS_BASE) as usize;
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

/// A LiME image holding a three-level 4K table for one vmalloc page.
fn lime_image() -> DumpImage {
    let mut bytes = vec![0u8; 32 + REGION_SIZE as usize];
    bytes[0..4].copy_from_slice(&0x4C69_4D45u32.to_le_bytes());
    bytes[4..8].copy_from_slice(&1u32.to_le_bytes());
    bytes[8..16].copy_from_slice(&PHYS_BASE.to_le_bytes());
    bytes[16..24].copy_from_slice(&(PHYS_BASE + REGION_SIZE - 1).to_le_bytes());

    put(&mut bytes, PGD, (PHYS_BASE + 0x2000) | 0x3);
    put(&mut bytes, PHYS_BASE + 0x2000, (PHYS_BASE + 0x3000) | 0x3);
    put(&mut bytes, PHYS_BASE + 0x3000 + 0x10 * 8, (PHYS_BASE + 0x10_0000) | 0x703);

    DumpImage::from_bytes(bytes).unwrap()
}

fn bench_page_walk(c: &mut Criterion) {
    let layout = AddressSpaceLayout::new(4096, 39, PHYS_BASE, PhysOffsetSource::Override).unwrap();
    let image = lime_image();
    let walker = PageTableWalker::new(&layout, &image);
    let pgd = layout.ptov(PGD);

    c.bench_function("walk_4k_cached_tables", |b| {
        let mut scratch = TableScratch::new();
        b.iter(|| {
            walker
                .translate(&mut scratch, black_box(pgd), black_box(VMALLOC_VA + 0x123), None)
                .unwrap()
        })
    });

    c.bench_function("walk_4k_cold_tables", |b| {
        let mut scratch = TableScratch::new();
        b.iter(|| {
            scratch.invalidate();
            walker
                .translate(&mut scratch, black_box(pgd), black_box(VMALLOC_VA + 0x123), None)
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_page_walk);
criterion_main!(benches);
