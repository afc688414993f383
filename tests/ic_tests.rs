//! Integration tests for the inline cache manager, exercised through the
//! RISC-V stub generator end to end (cache state machine, stub
//! regeneration, patch-site updates).

#[path = "support.rs"]
mod support;

use aerojs_core::config::IcConfig;
use aerojs_core::ic::manager::{InlineCacheManager, MethodResolver, PropertyLocation, PropertyResolver};
use aerojs_core::ic::stub::{MissHandlers, RiscV64};
use aerojs_core::ic::{CacheState, MethodCache, PropertyCache};
use aerojs_core::HostObject;

use support::TestObject;

fn handlers() -> MissHandlers {
    MissHandlers { property_miss: 0x1000, method_miss: 0x2000, megamorphic_method_miss: 0x3000 }
}

struct FixedPropertyResolver(Option<PropertyLocation>);
impl PropertyResolver for FixedPropertyResolver {
    fn resolve(&self, _obj: &dyn HostObject, _name: &str) -> Option<PropertyLocation> {
        self.0
    }
}

struct FixedMethodResolver(Option<(u64, *const u8)>);
impl MethodResolver for FixedMethodResolver {
    fn resolve(&self, _obj: &dyn HostObject, _name: &str) -> Option<(u64, *const u8)> {
        self.0
    }
}

#[test]
fn property_site_promotes_uninit_to_mono_to_poly_to_mega() {
    let manager: InlineCacheManager<RiscV64> = InlineCacheManager::new(IcConfig::default(), handlers());
    let resolver = FixedPropertyResolver(Some(PropertyLocation { slot_offset: 0, is_inline: true }));

    for shape in 0..10u64 {
        let obj = TestObject::new(shape, vec![shape as u64 * 2]);
        let value = manager.handle_property_access(1, &obj, "x", &resolver).unwrap();
        assert_eq!(value, Some(shape as u64 * 2));
    }

    // Past the default megamorphic_threshold of 8 distinct shapes, the
    // site should have transitioned all the way to Mega.
    assert!(manager.stub_code_size() > 0);
}

#[test]
fn unresolved_property_records_a_miss_without_installing_a_stub() {
    let manager: InlineCacheManager<RiscV64> = InlineCacheManager::new(IcConfig::default(), handlers());
    let resolver = FixedPropertyResolver(None);
    let obj = TestObject::new(1, vec![]);

    let result = manager.handle_property_access(7, &obj, "missing", &resolver).unwrap();
    assert_eq!(result, None);
    assert_eq!(manager.stub_code_size(), 0);
}

#[test]
fn method_call_site_caches_resolved_entry_point() {
    let manager: InlineCacheManager<RiscV64> = InlineCacheManager::new(IcConfig::default(), handlers());
    let target = 0xDEAD_BEEFu64 as *const u8;
    let resolver = FixedMethodResolver(Some((42, target)));
    let obj = TestObject::new(1, vec![]);

    let resolved = manager.handle_method_call(2, &obj, "run", &resolver).unwrap();
    assert_eq!(resolved, Some(target));
    assert!(manager.stub_code_size() > 0);
}

#[test]
fn invalidating_a_shape_forces_every_site_holding_it_back_to_uninit() {
    let manager: InlineCacheManager<RiscV64> = InlineCacheManager::new(IcConfig::default(), handlers());
    let resolver = FixedPropertyResolver(Some(PropertyLocation { slot_offset: 0, is_inline: true }));
    let obj = TestObject::new(9, vec![1]);

    manager.handle_property_access(3, &obj, "x", &resolver).unwrap();
    manager.invalidate_for_shape(9).unwrap();

    // A fresh lookup on the same shape must miss the now-empty cache and
    // go through the resolver again rather than returning a stale value.
    let value = manager.handle_property_access(3, &obj, "x", &resolver).unwrap();
    assert_eq!(value, Some(1));
}

#[test]
fn patch_site_is_updated_when_the_stub_is_regenerated() {
    let manager: InlineCacheManager<RiscV64> = InlineCacheManager::new(IcConfig::default(), handlers());
    let resolver = FixedPropertyResolver(Some(PropertyLocation { slot_offset: 0, is_inline: true }));

    let mut slot: *const u8 = std::ptr::null();
    manager.patch_property_access(4, &mut slot as *mut *const u8);
    assert!(slot.is_null());

    let obj = TestObject::new(1, vec![5]);
    manager.handle_property_access(4, &obj, "x", &resolver).unwrap();
    manager.patch_property_access(4, &mut slot as *mut *const u8);
    assert!(!slot.is_null());
}

#[test]
fn cache_state_starts_uninit_for_a_fresh_site() {
    let cache = PropertyCache::new(1);
    assert_eq!(cache.state, CacheState::Uninit);
    let method_cache = MethodCache::new(1);
    assert_eq!(method_cache.state, CacheState::Uninit);
}
