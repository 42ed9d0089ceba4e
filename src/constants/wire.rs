// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! Wire-level constants: exchange naming and the invalidation protocol's
//! header and verb vocabulary (spec.md §3, §6.2).

/// Prefix prepended to the user-supplied `name` to form the exchange name.
pub const EXCHANGE_PREFIX: &str = "rabbit-lru-cache-";

/// Header carrying the originating instance's `cacheId` on every publish.
pub const CACHE_ID_HEADER: &str = "x-cache-id";

/// Wire form of the reset verb.
pub const RESET_MESSAGE: &str = "reset";

/// Wire prefix of the delete verb; the remaining bytes are the raw key.
pub const DELETE_PREFIX: &str = "del:";
