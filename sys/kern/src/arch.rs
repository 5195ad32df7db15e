// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same set
//! of names:
//!
//! - `klog!` and `uassert!`
//! - `resume`, which runs a process until its next trap
//! - `arm_timer`, `disarm_timer`, `timer_armed` for the per-core preemption
//!   timer
//! - `core_id`, `RawLock`, `launch_core1`, `init_core`, `relax` for the
//!   dual-core plumbing
//! - `idle_entry` and `is_readonly_image`

cfg_if::cfg_if! {
    // Note: cfg_if! is slightly touchy about ordering and expression
    // complexity; this chain seems to be the best compromise.

    if #[cfg(all(target_arch = "arm", armv6m))] {
        #[macro_use]
        pub mod arm_m;
        pub use arm_m::*;
    } else if #[cfg(target_arch = "arm")] {
        compile_error!("only ARMv6-M (RP2040) is supported");
    } else {
        #[macro_use]
        pub mod fake;
        pub use fake::*;
    }
}
