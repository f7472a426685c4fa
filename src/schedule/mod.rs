//! Pure scheduling rules: the slot grid, per-slot classification and the
//! daily capacity check. Nothing here touches storage or the clock.

mod availability;
mod capacity;
mod grid;

pub use availability::classify_slots;
pub use capacity::{day_capacity, is_at_capacity};
pub use grid::{is_on_grid, slot_grid};
