use serde::{Deserialize, Serialize};

/// Write barrier discipline, selected at collector construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteBarrierType {
    /// Disallowed while `MARKING` is active; a `GcConfig` carrying this
    /// value fails validation rather than being silently coerced.
    None,
    /// Snapshot-at-the-beginning: shades both the old target (if the
    /// holder is Black) and the new target (if White).
    SnapshotAtBeginning,
    /// Incremental update: shades only the new target, and only if the
    /// holder is Black.
    IncrementalUpdate,
    /// Generational: same Gray-marking action as the other modes when the
    /// barrier fires, intended for a future young/old split.
    Generational,
}

/// Which targets a firing barrier should shade gray, decided by
/// [`WriteBarrierType`] and the colors observed at the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierAction {
    /// Shade the object being stored into.
    pub shade_holder: bool,
    /// Shade the value being stored.
    pub shade_new_value: bool,
}

impl WriteBarrierType {
    /// Decide what a barrier firing during `obj.field := new_value` should
    /// shade, given the current colors of `obj` and `new_value`.
    ///
    /// Returns `BarrierAction { false, false }` when nothing needs shading,
    /// which callers should treat identically to the barrier not firing.
    pub fn decide(
        self,
        holder_is_black: bool,
        new_value_is_white: bool,
    ) -> BarrierAction {
        match self {
            WriteBarrierType::None => BarrierAction {
                shade_holder: false,
                shade_new_value: false,
            },
            WriteBarrierType::SnapshotAtBeginning => BarrierAction {
                shade_holder: holder_is_black,
                shade_new_value: new_value_is_white,
            },
            WriteBarrierType::IncrementalUpdate | WriteBarrierType::Generational => {
                BarrierAction {
                    shade_holder: false,
                    shade_new_value: holder_is_black && new_value_is_white,
                }
            }
        }
    }
}
