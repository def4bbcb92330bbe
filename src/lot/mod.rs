pub mod occupancy;

pub use occupancy::{
    assign, elapsed_display, format_elapsed, lane, release, reset, Assignment, Rejection, Release,
    DEFAULT_CAPACITY, DEFAULT_LANE_SIZE,
};
