//! Property and method inline-cache dispatch across the mono/poly/mega
//! state machine, mirroring the shape populations a real property access
//! site sees over its lifetime.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use aerojs_core::config::IcConfig;
use aerojs_core::ic::manager::{InlineCacheManager, MethodResolver, PropertyLocation, PropertyResolver};
use aerojs_core::ic::stub::{MissHandlers, RiscV64};
use aerojs_core::{HostObject, HostValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BenchValue {
    Int(i64),
}

impl HostValue for BenchValue {
    fn is_function(&self) -> bool {
        false
    }
    fn is_object(&self) -> bool {
        false
    }
    fn as_function_id(&self) -> Option<u64> {
        None
    }
}

struct BenchObject {
    shape_id: u64,
    inline_slots: Vec<u64>,
}

impl HostObject for BenchObject {
    fn shape_id(&self) -> u64 {
        self.shape_id
    }
    fn slots_ptr(&self) -> *mut u8 {
        std::ptr::null_mut()
    }
    fn inline_slot(&self, byte_offset: u32) -> u64 {
        self.inline_slots[(byte_offset / 8) as usize]
    }
    fn out_of_line_slot(&self, _byte_offset: u32) -> u64 {
        0
    }
}

struct FixedResolver(PropertyLocation);
impl PropertyResolver for FixedResolver {
    fn resolve(&self, _obj: &dyn HostObject, _name: &str) -> Option<PropertyLocation> {
        Some(self.0)
    }
}

struct MethodAtFixedAddress(u64, *const u8);
impl MethodResolver for MethodAtFixedAddress {
    fn resolve(&self, _obj: &dyn HostObject, _name: &str) -> Option<(u64, *const u8)> {
        Some((self.0, self.1))
    }
}

fn handlers() -> MissHandlers {
    MissHandlers { property_miss: 0x1000, method_miss: 0x2000, megamorphic_method_miss: 0x3000 }
}

fn bench_monomorphic_property_access(c: &mut Criterion) {
    let manager: InlineCacheManager<RiscV64> = InlineCacheManager::new(IcConfig::default(), handlers());
    let resolver = FixedResolver(PropertyLocation { slot_offset: 16, is_inline: true });
    let obj = BenchObject { shape_id: 1, inline_slots: vec![42] };

    c.bench_function("property_access/monomorphic", |b| {
        b.iter(|| manager.handle_property_access(black_box(1), black_box(&obj), "x", &resolver).unwrap());
    });
}

fn bench_polymorphic_property_access(c: &mut Criterion) {
    let mut group = c.benchmark_group("property_access");

    for shape_count in [2usize, 4, 8] {
        let manager: InlineCacheManager<RiscV64> = InlineCacheManager::new(IcConfig::default(), handlers());
        let resolver = FixedResolver(PropertyLocation { slot_offset: 16, is_inline: true });
        let objects: Vec<BenchObject> =
            (0..shape_count).map(|i| BenchObject { shape_id: i as u64, inline_slots: vec![i as u64] }).collect();

        group.bench_with_input(
            BenchmarkId::new("polymorphic_shapes", shape_count),
            &shape_count,
            |b, _| {
                b.iter(|| {
                    for obj in &objects {
                        manager.handle_property_access(black_box(2), black_box(obj), "x", &resolver).unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_megamorphic_property_access(c: &mut Criterion) {
    let manager: InlineCacheManager<RiscV64> = InlineCacheManager::new(IcConfig::default(), handlers());
    let resolver = FixedResolver(PropertyLocation { slot_offset: 16, is_inline: true });
    let objects: Vec<BenchObject> =
        (0..64).map(|i| BenchObject { shape_id: i as u64, inline_slots: vec![i as u64] }).collect();

    // Warm the site past the megamorphic threshold before measuring.
    for obj in &objects {
        manager.handle_property_access(3, obj, "x", &resolver).unwrap();
    }

    c.bench_function("property_access/megamorphic", |b| {
        b.iter(|| {
            let obj = &objects[black_box(17)];
            manager.handle_property_access(3, obj, "x", &resolver).unwrap()
        });
    });
}

fn bench_method_call_dispatch(c: &mut Criterion) {
    let manager: InlineCacheManager<RiscV64> = InlineCacheManager::new(IcConfig::default(), handlers());
    let target = 0xDEAD_BEEFu64 as *const u8;
    let resolver = MethodAtFixedAddress(7, target);
    let obj = BenchObject { shape_id: 1, inline_slots: vec![] };

    c.bench_function("method_call/monomorphic", |b| {
        b.iter(|| manager.handle_method_call(black_box(4), black_box(&obj), "run", &resolver).unwrap());
    });
}

criterion_group!(
    benches,
    bench_monomorphic_property_access,
    bench_polymorphic_property_access,
    bench_megamorphic_property_access,
    bench_method_call_dispatch
);
criterion_main!(benches);
