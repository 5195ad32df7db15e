// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Human-readable dump of kernel state, for `klog!`.
//!
//! The partition map prints one character per partition:
//!
//! ```text
//! .  unallocated      P  process space     #  flag
//! K  kernel data      F  file data         S  swap image
//! 2-9, +  shared by that many
//! ```

use core::fmt;

use abi::ProcessStatus;

use crate::partition::Tag;
use crate::sched::Kernel;
use crate::task::ProcessTable;

pub struct Dump<'k, 'a>(pub &'k Kernel<'a>);

impl fmt::Display for Dump<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let k = self.0;
        write!(f, "memory ")?;
        for tag in k.alloc.tags() {
            let c = match *tag {
                Tag::Unallocated => '.',
                Tag::KernelData => 'K',
                Tag::ProcessSpace => 'P',
                Tag::FileData => 'F',
                Tag::Flag => '#',
                Tag::Swap => 'S',
                Tag::Mixed(n) if n < 10 => char::from(b'0' + n as u8),
                Tag::Mixed(_) => '+',
            };
            write!(f, "{c}")?;
        }
        writeln!(
            f,
            " ({}/{} bytes, budget {})",
            k.alloc.utilization(),
            k.alloc.capacity(),
            k.config.memory_budget,
        )?;

        writeln!(f, "job    {}", Queue(&k.table, k.table.job()))?;
        writeln!(f, "ready  {}", Queue(&k.table, k.table.ready()))?;
        writeln!(f, "device {}", Queue(&k.table, k.table.device()))?;

        writeln!(f, "  id  status          parent  space")?;
        for slot in k.table.iter() {
            let Some(b) = k.table.get(slot) else { continue };
            write!(f, "{:>4}  {:<14}  ", b.id().0, status_name(b.status()))?;
            match b.parent().and_then(|p| k.table.id_of(p)) {
                Some(p) => write!(f, "{:>6}  ", p.0)?,
                None => write!(f, "{:>6}  ", "-")?,
            }
            match b.space() {
                Some(s) => writeln!(f, "{:#010x}", s.base())?,
                None => match b.image() {
                    Some(image) => writeln!(f, "swapped to {image:#010x}")?,
                    None => writeln!(f, "-")?,
                },
            }
        }
        Ok(())
    }
}

fn status_name(status: ProcessStatus) -> &'static str {
    match status {
        ProcessStatus::Created => "Created",
        ProcessStatus::Ready => "Ready",
        ProcessStatus::Executing => "Executing",
        ProcessStatus::Blocked => "Blocked",
        ProcessStatus::SwappedReady => "SwappedReady",
        ProcessStatus::SwappedBlocked => "SwappedBlocked",
        ProcessStatus::Terminated => "Terminated",
    }
}

/// A scheduling queue, printed as process ids.
struct Queue<'t>(&'t ProcessTable, &'t [usize]);

impl fmt::Display for Queue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, &slot) in self.1.iter().enumerate() {
            if i != 0 {
                write!(f, " ")?;
            }
            match self.0.id_of(slot) {
                Some(id) => write!(f, "{}", id.0)?,
                None => write!(f, "?")?,
            }
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{self, UserContext};
    use crate::config::KernelConfig;
    use crate::context::Trap;
    use crate::partition::Kind;
    use crate::space::Layout;
    use crate::umem::Arena;
    use abi::{Discipline, Sysnum};

    #[test]
    fn dump_shows_memory_and_queues() {
        fn yielder(cx: &mut UserContext<'_>) -> Trap {
            cx.syscall(Sysnum::Yield, [0; 3])
        }
        let config = KernelConfig {
            process_limit: 4,
            partition_size: 256,
            memory_budget: 8 * 256,
            time_slice: 1000,
            discipline: Discipline::FirstComeFirstServed,
            layout: Layout {
                text: 64,
                data: 64,
                heap: 128,
                stack: 256,
            },
        };
        let mut memory = vec![0u8; 8 * 256];
        let mut k = Kernel::new(
            config,
            Arena::new(&mut memory, 0x2000_0000),
            arch::register(yielder),
            false,
        );
        k.long_term();
        k.long_term();
        k.alloc.allocate(16, Kind::FileData).unwrap();
        k.alloc.allocate(16, Kind::FileData).unwrap();

        let text = Dump(&k).to_string();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("memory PPPP2... (1280/2048 bytes, budget 2048)")
        );
        assert_eq!(lines.next(), Some("job    []"));
        assert_eq!(lines.next(), Some("ready  [0 1]"));
        assert_eq!(lines.next(), Some("device []"));
        assert!(lines.next().unwrap().contains("status"));
        let idle = lines.next().unwrap();
        assert!(idle.contains("Ready") && idle.contains("0x20000000"));
        let boot = lines.next().unwrap();
        assert!(boot.trim_start().starts_with('1') && boot.contains("0x20000200"));

        let slot = k.table.children(k.table.root().unwrap()).next().unwrap();
        assert!(k.table.evict(slot, &mut k.alloc));
        let text = Dump(&k).to_string();
        assert!(text.starts_with("memory PP..2.SS (1280/2048 bytes"));
        assert!(text.contains("swapped to 0x20000600"));
    }
}
