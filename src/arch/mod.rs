//! Host code generation backends.
//!
//! Only x86-64 exists today. The encoder itself is portable (dynasm just
//! writes bytes), but the emitted code of course only runs on an x86-64
//! host; tests that execute blocks are gated accordingly.

mod x64;

pub(crate) use x64::{compile, CompileParams};
