//! Per-portal strategies. Each module supplies selector data and the odd
//! portal-specific composite; the control flow lives in `protocol`.

pub mod activity;
pub mod enrollment;
pub mod learning;
pub mod meals;
pub mod roster;
