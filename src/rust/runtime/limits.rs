// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

/// Maximum number of hardware threads the scheduler can manage.
pub const MAX_PCPUS: usize = 256;

/// Number of 64-bit words backing a CPU mask.
pub const MASK_WORDS: usize = MAX_PCPUS / 64;

/// Maximum number of domains a single adjustment request may carry, and the
/// capacity of each local scheduler's ticket arena.
pub const MAX_DOMAINS: usize = 64;
