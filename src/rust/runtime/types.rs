// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Base time representation. All scheduling arithmetic is carried out on
//! signed 64-bit nanosecond values so that bookkeeping differences may go
//! transiently negative without wrapping.

//======================================================================================================================
// Constants
//======================================================================================================================

/// Absolute time or time span in nanoseconds.
pub type TimeNs = i64;

/// A point in time that never arrives.
pub const INFINITY: TimeNs = TimeNs::MAX;

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Converts seconds to nanoseconds.
pub const fn s_to_ns(s: i64) -> TimeNs {
    s * 1_000_000_000
}

/// Converts milliseconds to nanoseconds.
pub const fn ms_to_ns(ms: i64) -> TimeNs {
    ms * 1_000_000
}

/// Converts microseconds to nanoseconds.
pub const fn us_to_ns(us: i64) -> TimeNs {
    us * 1_000
}

/// Rounds a time value down to the nearest multiple of `grain`.
pub const fn floor_to_grain(t: TimeNs, grain: TimeNs) -> TimeNs {
    (t / grain) * grain
}
