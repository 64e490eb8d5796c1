//! # Flag Words
//!
//! Runtime debug functionality flags and per-slot category/attribute bits.
//!
//! ## 🎯 Purpose and Responsibility
//! - **`DebugFlags`:** what the tracker checks, poisons and narrates at
//!   runtime. The surrounding runtime parses its option string into
//!   this word; the chunk manager only ever reads it.
//! - **`SlotFlags`:** what one chunk currently is. Exactly one category
//!   bit, plus independent attribute bits.
//!
//! ## 🔍 Critical Analysis (Allocator Engineer's View)
//!
//! ### ✅ Strengths
//! - **One Word Each:** both flag sets fit in a `u32`, so slots stay
//!   small and flag tests never chase pointers.
//!
//! ### ⚠️ Points of Attention
//! - **No Cross-Flag Validation:** `CHECK_BLANK` on its own still
//!   blanks freed chunks (the blanking tests accept either bit), which
//!   can surprise a caller reading the flag names literally.
//!
//! ## 🛠️ TODOs and Roadmap
//! - [ ] **TODO: (Config)** an option-string parser mapping the classic
//!   token names onto `DebugFlags`, so a saved flag set can be
//!   restored.

use bitflags::bitflags;

bitflags! {
    /// Runtime debug functionality. The surrounding runtime parses its
    /// option string into this word; the chunk manager only reads it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DebugFlags: u32 {
        // === Protection ===
        const CHECK_FENCE      = 1 << 0;
        const FREE_BLANK       = 1 << 1;
        const ALLOC_BLANK      = 1 << 2;
        const CHECK_BLANK      = 1 << 3;

        // === Policy ===
        const REALLOC_COPY     = 1 << 8;
        const NEVER_REUSE      = 1 << 9;
        const ERROR_FREE_NULL  = 1 << 10;

        // === Diagnostic output ===
        const LOG_TRANS        = 1 << 16;
        const LOG_ADMIN        = 1 << 17;
        const LOG_BAD_SPACE    = 1 << 18;
        const LOG_KNOWN        = 1 << 19;
        const LOG_NONFREE_SPACE = 1 << 20;
        const LOG_ELAPSED_TIME = 1 << 21;
        const LOG_CURRENT_TIME = 1 << 22;
    }
}

impl DebugFlags {
    /// Everything a paranoid run wants: fences, poisoning and reuse checks.
    pub const PARANOID: Self = Self::CHECK_FENCE
        .union(Self::FREE_BLANK)
        .union(Self::ALLOC_BLANK)
        .union(Self::CHECK_BLANK);
}

impl Default for DebugFlags {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// Per-slot state. Exactly one of FREE/USER/ADMIN/EXTERN is set;
    /// FENCE, VALLOC and BLANK are independent attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlotFlags: u32 {
        const FREE   = 1 << 0;
        const USER   = 1 << 1;
        const ADMIN  = 1 << 2;
        const EXTERN = 1 << 3;

        const FENCE  = 1 << 8;
        const VALLOC = 1 << 9;
        const BLANK  = 1 << 10;
    }
}

impl SlotFlags {
    /// The mutually exclusive category bits.
    pub const CATEGORY: Self = Self::FREE
        .union(Self::USER)
        .union(Self::ADMIN)
        .union(Self::EXTERN);

    /// True when exactly one category bit is set.
    pub fn category_valid(&self) -> bool {
        let cat = self.intersection(Self::CATEGORY).bits();
        cat != 0 && (cat & (cat - 1)) == 0
    }
}
