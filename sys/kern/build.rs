// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

fn main() -> Result<()> {
    build_util::expose_m_profile()?;

    generate_kconfig()?;

    Ok(())
}

fn generate_kconfig() -> Result<()> {
    let kconfig: KernelConfig =
        build_util::ron_from_env_or_default("KERNEL_KCONFIG")?;
    kconfig.check()?;

    let out = &PathBuf::from(env::var_os("OUT_DIR").context("OUT_DIR")?);
    let mut file = File::create(out.join("kconfig.rs"))?;

    writeln!(file, "// See build.rs for details")?;
    writeln!(
        file,
        "pub const PROCESS_LIMIT: usize = {};",
        kconfig.process_limit
    )?;
    writeln!(
        file,
        "pub const PARTITION_SIZE: usize = {};",
        kconfig.partition_size
    )?;
    writeln!(file, "pub const ARENA_SIZE: usize = {};", kconfig.arena_size)?;
    writeln!(
        file,
        "pub const PARTITION_COUNT: usize = ARENA_SIZE / PARTITION_SIZE;"
    )?;
    writeln!(
        file,
        "pub const MEMORY_BUDGET: usize = {};",
        kconfig.memory_budget.unwrap_or(kconfig.arena_size)
    )?;
    writeln!(file, "pub const TIME_SLICE: u32 = {};", kconfig.time_slice)?;
    writeln!(
        file,
        "pub const DISCIPLINE: abi::Discipline = abi::Discipline::{:?};",
        kconfig.discipline
    )?;
    writeln!(file, "pub const TEXT_SIZE: u32 = {};", kconfig.text_size)?;
    writeln!(file, "pub const DATA_SIZE: u32 = {};", kconfig.data_size)?;
    writeln!(file, "pub const HEAP_SIZE: u32 = {};", kconfig.heap_size)?;
    writeln!(file, "pub const STACK_SIZE: u32 = {};", kconfig.stack_size)?;
    writeln!(file, "pub const FILE_LIMIT: usize = {};", kconfig.file_limit)?;
    writeln!(
        file,
        "pub const CORE1_STACK_SIZE: usize = {};",
        kconfig.core1_stack_size
    )?;

    Ok(())
}

/// Kernel build configuration, handed to us as RON in `$KERNEL_KCONFIG`.
/// Every field is optional.
#[derive(Deserialize)]
#[serde(default)]
struct KernelConfig {
    process_limit: usize,
    partition_size: usize,
    arena_size: usize,
    /// Utilization the medium-term scheduler evicts down to. Defaults to the
    /// whole arena.
    memory_budget: Option<usize>,
    /// SysTick reload value, in core clocks.
    time_slice: u32,
    discipline: abi::Discipline,
    text_size: u32,
    data_size: u32,
    heap_size: u32,
    stack_size: u32,
    file_limit: usize,
    core1_stack_size: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            process_limit: 8,
            partition_size: 256,
            arena_size: 64 * 1024,
            memory_budget: None,
            time_slice: 10_000,
            discipline: abi::Discipline::RoundRobin,
            text_size: 256,
            data_size: 256,
            heap_size: 512,
            stack_size: 1024,
            file_limit: 32,
            core1_stack_size: 2048,
        }
    }
}

impl KernelConfig {
    fn check(&self) -> Result<()> {
        if self.partition_size == 0 || self.partition_size % 8 != 0 {
            bail!("partition size must be a nonzero multiple of 8");
        }
        if self.arena_size % self.partition_size != 0 {
            bail!("arena size must be a whole number of partitions");
        }
        if self.process_limit < 2 {
            bail!("need room for at least the idle and boot processes");
        }
        if self.file_limit < 1 || self.file_limit > abi::Handle::INDEX_MASK as usize
        {
            bail!("file limit out of range");
        }
        for (name, size) in [
            ("text", self.text_size),
            ("data", self.data_size),
            ("heap", self.heap_size),
            ("stack", self.stack_size),
        ] {
            if size % 8 != 0 {
                bail!("{name} size must be a multiple of 8");
            }
        }
        if self.time_slice == 0 || self.time_slice > 0x00ff_ffff {
            bail!("time slice must fit the 24-bit SysTick reload register");
        }
        Ok(())
    }
}
