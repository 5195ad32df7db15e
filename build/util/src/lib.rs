// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use std::env;

/// Exposes the CPU's M-profile architecture version. This isn't available in
/// rustc's standard environment.
///
/// This will set one of `cfg(armv6m`), `cfg(armv7m)`, or `cfg(armv8m)`
/// depending on the value of the `TARGET` environment variable. Host targets
/// get none of them, which is what selects the simulated architecture in the
/// kernel.
pub fn expose_m_profile() -> Result<()> {
    let target = env::var("TARGET").context("TARGET not set")?;

    if target.starts_with("thumbv6m") {
        println!("cargo:rustc-cfg=armv6m");
    } else if target.starts_with("thumbv7m") || target.starts_with("thumbv7em")
    {
        println!("cargo:rustc-cfg=armv7m");
    } else if target.starts_with("thumbv8m") {
        println!("cargo:rustc-cfg=armv8m");
    } else if target.starts_with("thumb") {
        bail!("Don't know the target {target}");
    }
    Ok(())
}

/// Pulls a RON-encoded configuration record out of the environment variable
/// `var`, falling back to `T::default()` if the variable is missing. If the
/// variable is present but fails to parse, this still fails with `Err`.
///
/// As with any build-time configuration, `T` need only describe the parts of
/// the record that the calling build script cares about.
pub fn ron_from_env_or_default<T: DeserializeOwned + Default>(
    var: &str,
) -> Result<T> {
    // We want to emit this whether or not the env var is present, so that
    // we'll be re-run if it becomes present.
    println!("cargo:rerun-if-env-changed={var}");

    let text = match env::var(var) {
        Ok(text) => text,
        Err(_) => {
            println!("--- var ${var} not present, using default ---");
            return Ok(T::default());
        }
    };
    println!("--- ron for ${var} ---");
    println!("{text}");
    ron::de::from_str(&text).with_context(|| format!("parsing ${var}"))
}
